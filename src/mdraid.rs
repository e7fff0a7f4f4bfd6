//! MDRaid objects
//!
//! One object per software-RAID array UUID, aggregating the member
//! device records and, when assembled, the /dev/mdN array record.
//! While a sync operation runs the object polls its sysfs once per
//! second to publish progress.

use crate::device::DeviceRecord;
use crate::paths;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// The kernel emits this for members that carry no array identity yet.
pub const BOGUS_UUID: &str = "00000000:00000000:00000000:00000000";

pub fn uuid_is_bogus(uuid: &str) -> bool {
    uuid.is_empty() || uuid == BOGUS_UUID
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdraidMember {
    pub object_path: String,
    pub slot: i32,
    pub state: Vec<String>,
    pub num_errors: u64,
}

/// Published array state.
#[derive(Debug, Clone, Default)]
pub struct MdraidFacet {
    pub uuid: String,
    pub level: String,
    pub num_devices: u32,
    pub size: u64,
    pub degraded: u32,
    pub sync_action: String,
    pub bitmap_location: String,
    pub chunk_size: u64,
    /// Fraction in [0, 1] while syncing.
    pub sync_completed: f64,
    /// Bytes per second.
    pub sync_rate: u64,
    pub sync_remaining_usec: u64,
    pub running: bool,
    pub members: Vec<MdraidMember>,
}

impl MdraidFacet {
    pub fn properties(&self) -> Value {
        json!({
            "uuid": self.uuid,
            "level": self.level,
            "num_devices": self.num_devices,
            "size": self.size,
            "degraded": self.degraded,
            "sync_action": self.sync_action,
            "bitmap_location": self.bitmap_location,
            "chunk_size": self.chunk_size,
            "sync_completed": self.sync_completed,
            "sync_rate": self.sync_rate,
            "sync_remaining_usec": self.sync_remaining_usec,
            "running": self.running,
            "members": self.members,
        })
    }
}

pub struct MdraidObject {
    pub uuid: String,
    pub object_path: String,
    /// Member records by sysfs path.
    members: BTreeMap<String, Arc<DeviceRecord>>,
    array: Option<Arc<DeviceRecord>>,
    pub facet: MdraidFacet,
}

impl MdraidObject {
    pub fn new(uuid: &str) -> Self {
        Self {
            uuid: uuid.to_string(),
            object_path: paths::mdraid(uuid),
            members: BTreeMap::new(),
            array: None,
            facet: MdraidFacet {
                uuid: uuid.to_string(),
                ..MdraidFacet::default()
            },
        }
    }

    pub fn set_member(&mut self, record: Arc<DeviceRecord>) {
        self.members.insert(record.sysfs_path.clone(), record);
        self.refresh();
    }

    pub fn remove_member(&mut self, sysfs_path: &str) {
        self.members.remove(sysfs_path);
        self.refresh();
    }

    pub fn set_array(&mut self, record: Arc<DeviceRecord>) {
        self.array = Some(record);
        self.refresh();
    }

    pub fn clear_array(&mut self, sysfs_path: &str) {
        if self
            .array
            .as_ref()
            .map(|r| r.sysfs_path == sysfs_path)
            .unwrap_or(false)
        {
            self.array = None;
            self.refresh();
        }
    }

    pub fn array_record(&self) -> Option<&Arc<DeviceRecord>> {
        self.array.as_ref()
    }

    pub fn has_member(&self, sysfs_path: &str) -> bool {
        self.members.contains_key(sysfs_path)
    }

    pub fn is_array(&self, sysfs_path: &str) -> bool {
        self.array
            .as_ref()
            .map(|r| r.sysfs_path == sysfs_path)
            .unwrap_or(false)
    }

    /// An MDRaid object lives as long as it has an array or members.
    pub fn has_devices(&self) -> bool {
        self.array.is_some() || !self.members.is_empty()
    }

    /// Polling is on while a sync operation is in flight.
    pub fn needs_polling(&self) -> bool {
        !matches!(self.facet.sync_action.as_str(), "" | "idle")
    }

    /// Recompute the published state from the captured records.
    pub fn refresh(&mut self) {
        let facet = &mut self.facet;

        if let Some(array) = &self.array {
            facet.level = array
                .sysfs_attr("md/level")
                .unwrap_or_default()
                .to_string();
            facet.num_devices = array
                .sysfs_attr("md/raid_disks")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            facet.size = array
                .sysfs_attr_as_u64("size")
                .map(|sectors| sectors * 512)
                .unwrap_or(0);
            facet.degraded = array
                .sysfs_attr("md/degraded")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            facet.sync_action = array
                .sysfs_attr("md/sync_action")
                .unwrap_or_default()
                .to_string();
            facet.bitmap_location = array
                .sysfs_attr("md/bitmap/location")
                .unwrap_or_default()
                .to_string();
            facet.chunk_size = array
                .sysfs_attr("md/chunk_size")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let (completed, remaining_usec) = parse_sync_completed(
                array.sysfs_attr("md/sync_completed").unwrap_or(""),
                array.sysfs_attr("md/sync_speed"),
            );
            facet.sync_completed = completed;
            facet.sync_remaining_usec = remaining_usec;
            facet.sync_rate = array
                .sysfs_attr("md/sync_speed")
                .and_then(|v| v.parse::<u64>().ok())
                .map(|kib| kib * 1024)
                .unwrap_or(0);
            facet.running = array.sysfs_attr("md/array_state") != Some("inactive")
                && array.sysfs_attr("md/array_state") != Some("clear");
        } else {
            facet.level = String::new();
            facet.num_devices = 0;
            facet.size = 0;
            facet.degraded = 0;
            facet.sync_action = String::new();
            facet.bitmap_location = String::new();
            facet.chunk_size = 0;
            facet.sync_completed = 0.0;
            facet.sync_rate = 0;
            facet.sync_remaining_usec = 0;
            facet.running = false;
        }

        facet.members = self
            .members
            .values()
            .map(|record| member_entry(self.array.as_deref(), record))
            .collect();
        facet.members.sort_by(|a, b| {
            (a.slot, &a.object_path).cmp(&(b.slot, &b.object_path))
        });
    }

    /// Re-read the array's live sysfs during sync polling. Returns true
    /// when anything changed.
    pub fn poll_sysfs(&mut self) -> bool {
        let array = match &self.array {
            Some(array) => Arc::clone(array),
            None => return false,
        };
        let base = Path::new(&array.sysfs_path);
        let mut refreshed = (*array).clone();
        for attr in [
            "md/sync_action",
            "md/sync_completed",
            "md/sync_speed",
            "md/degraded",
            "md/array_state",
        ] {
            match std::fs::read_to_string(base.join(attr)) {
                Ok(value) => {
                    refreshed
                        .sysfs_attrs
                        .insert(attr.to_string(), value.trim().to_string());
                }
                Err(_) => {
                    refreshed.sysfs_attrs.remove(attr);
                }
            }
        }

        let before = self.facet.properties();
        self.array = Some(Arc::new(refreshed));
        self.refresh();
        before != self.facet.properties()
    }
}

fn member_entry(array: Option<&DeviceRecord>, record: &DeviceRecord) -> MdraidMember {
    // Member state lives under the array's md/dev-<name> directory.
    let (slot, state, num_errors) = match array {
        Some(array) => {
            let dev_dir = Path::new(&array.sysfs_path)
                .join("md")
                .join(format!("dev-{}", record.device_name));
            let slot = std::fs::read_to_string(dev_dir.join("slot"))
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(-1);
            let state = std::fs::read_to_string(dev_dir.join("state"))
                .map(|v| {
                    v.trim()
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            let num_errors = std::fs::read_to_string(dev_dir.join("errors"))
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
            (slot, state, num_errors)
        }
        None => (-1, Vec::new(), 0),
    };

    MdraidMember {
        object_path: paths::block_device(&record.device_name),
        slot,
        state,
        num_errors,
    }
}

/// `md/sync_completed` reads "done / total" in sectors, or "none".
/// Remaining time is estimated from the sync speed (KiB/s).
fn parse_sync_completed(value: &str, speed_kib: Option<&str>) -> (f64, u64) {
    let mut parts = value.split('/').map(str::trim);
    let done: u64 = match parts.next().and_then(|v| v.parse().ok()) {
        Some(v) => v,
        None => return (0.0, 0),
    };
    let total: u64 = match parts.next().and_then(|v| v.parse().ok()) {
        Some(v) if v > 0 => v,
        _ => return (0.0, 0),
    };

    let fraction = (done as f64 / total as f64).clamp(0.0, 1.0);
    let remaining_bytes = total.saturating_sub(done).saturating_mul(512);
    let speed = speed_kib
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        .saturating_mul(1024);
    let remaining_usec = if speed > 0 {
        (remaining_bytes as u128 * 1_000_000 / speed as u128) as u64
    } else {
        0
    };
    (fraction, remaining_usec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Subsystem;

    fn member(name: &str) -> Arc<DeviceRecord> {
        let mut r = DeviceRecord::synthetic(
            Subsystem::Block,
            &format!("/sys/block/{}", name),
            name,
        );
        r.devtype = Some("disk".into());
        Arc::new(r)
    }

    fn array(name: &str, attrs: &[(&str, &str)]) -> Arc<DeviceRecord> {
        let mut r = DeviceRecord::synthetic(
            Subsystem::Block,
            &format!("/sys/block/{}", name),
            name,
        );
        r.devtype = Some("disk".into());
        for (k, v) in attrs {
            r.sysfs_attrs.insert(k.to_string(), v.to_string());
        }
        Arc::new(r)
    }

    #[test]
    fn test_bogus_uuid() {
        assert!(uuid_is_bogus(""));
        assert!(uuid_is_bogus(BOGUS_UUID));
        assert!(!uuid_is_bogus("u1"));
    }

    #[test]
    fn test_member_and_array_lifecycle() {
        let mut raid = MdraidObject::new("u1");
        assert!(!raid.has_devices());

        raid.set_member(member("sda"));
        assert!(raid.has_devices());
        assert!(raid.has_member("/sys/block/sda"));

        raid.set_array(array("md0", &[("md/level", "raid1"), ("md/raid_disks", "2")]));
        assert!(raid.facet.running);
        assert_eq!(raid.facet.level, "raid1");
        assert_eq!(raid.facet.num_devices, 2);

        raid.clear_array("/sys/block/md0");
        assert!(!raid.facet.running);
        raid.remove_member("/sys/block/sda");
        assert!(!raid.has_devices());
    }

    #[test]
    fn test_members_sorted_by_slot_then_path() {
        let mut raid = MdraidObject::new("u1");
        raid.set_member(member("sdc"));
        raid.set_member(member("sda"));
        raid.set_member(member("sdb"));
        // No array: every slot is -1, so sorting falls back to path.
        let paths: Vec<_> = raid.facet.members.iter().map(|m| m.object_path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                "/barrow/block_devices/sda",
                "/barrow/block_devices/sdb",
                "/barrow/block_devices/sdc"
            ]
        );
    }

    #[test]
    fn test_sync_progress_parsing() {
        let (fraction, remaining) = parse_sync_completed("500 / 1000", Some("512"));
        assert!((fraction - 0.5).abs() < f64::EPSILON);
        // 500 sectors = 256000 bytes at 512 KiB/s = 488281 usec.
        assert_eq!(remaining, 256_000 * 1_000_000 / (512 * 1024));

        assert_eq!(parse_sync_completed("none", None), (0.0, 0));
        assert_eq!(parse_sync_completed("", None), (0.0, 0));
    }

    #[test]
    fn test_polling_follows_sync_action() {
        let mut raid = MdraidObject::new("u1");
        raid.set_array(array("md0", &[("md/sync_action", "idle")]));
        assert!(!raid.needs_polling());
        raid.set_array(array("md0", &[("md/sync_action", "resync")]));
        assert!(raid.needs_polling());
        raid.clear_array("/sys/block/md0");
        assert!(!raid.needs_polling());
    }

    #[test]
    fn test_inactive_array_not_running() {
        let mut raid = MdraidObject::new("u1");
        raid.set_array(array("md0", &[("md/array_state", "inactive")]));
        assert!(!raid.facet.running);
    }
}
