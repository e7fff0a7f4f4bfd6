//! Device records
//!
//! A `DeviceRecord` is an immutable snapshot of a probed device: sysfs
//! path, kernel name, property map, selected sysfs attributes and the
//! identify blobs gathered by the probe worker. Records are shared as
//! `Arc<DeviceRecord>`; replacement is the only update.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::warn;

/// Kernel subsystems the daemon subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    Block,
    Nvme,
    Scsi,
    IscsiConnection,
}

impl Subsystem {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "block" => Some(Subsystem::Block),
            "nvme" => Some(Subsystem::Nvme),
            "scsi" => Some(Subsystem::Scsi),
            "iscsi_connection" => Some(Subsystem::IscsiConnection),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Block => "block",
            Subsystem::Nvme => "nvme",
            Subsystem::Scsi => "scsi",
            Subsystem::IscsiConnection => "iscsi_connection",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller information read from an NVMe controller's sysfs node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmeControllerInfo {
    pub model: Option<String>,
    pub serial: Option<String>,
    pub firmware: Option<String>,
    pub subsysnqn: Option<String>,
    pub transport: Option<String>,
    pub state: Option<String>,
    pub cntlid: Option<u16>,
}

/// Immutable snapshot of a probed device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub subsystem: Subsystem,
    /// Stable sysfs path (e.g. /sys/devices/pci.../block/sda).
    pub sysfs_path: String,
    /// Kernel device name (e.g. sda, nvme0n1, dm-0).
    pub device_name: String,
    /// DEVTYPE: "disk", "partition" or absent.
    pub devtype: Option<String>,
    /// Combined major:minor, 0 when the device has no node.
    pub device_number: u64,
    /// /dev node path, if any.
    pub device_file: Option<String>,
    /// udev property map from the uevent environment.
    pub properties: HashMap<String, String>,
    /// Selected sysfs attributes captured at probe time.
    pub sysfs_attrs: HashMap<String, String>,
    /// Names of child entries of the sysfs directory.
    pub sysfs_children: Vec<String>,
    /// /dev aliases.
    pub symlinks: Vec<String>,
    /// 512-byte ATA IDENTIFY DEVICE blob.
    pub ata_identify: Option<Box<[u8]>>,
    /// 512-byte ATA IDENTIFY PACKET DEVICE blob.
    pub ata_identify_packet: Option<Box<[u8]>>,
    pub nvme_controller_info: Option<NvmeControllerInfo>,
    /// Whether udev had finished processing the device at probe time.
    pub is_initialized: bool,
}

/// Sysfs attributes captured into every record when present.
const CAPTURED_ATTRS: &[&str] = &[
    "size",
    "removable",
    "ro",
    "nsid",
    "transport",
    "hostnqn",
    "hostid",
    "model",
    "serial",
    "firmware_rev",
    "state",
    "cntlid",
    "queue/rotational",
    "md/level",
    "md/raid_disks",
    "md/degraded",
    "md/sync_action",
    "md/sync_completed",
    "md/sync_speed",
    "md/bitmap/location",
    "md/chunk_size",
    "md/array_state",
];

impl DeviceRecord {
    /// Build a record by reading live sysfs for `sysfs_path`.
    pub fn from_sysfs(subsystem: Subsystem, sysfs_path: &str) -> Self {
        let path = Path::new(sysfs_path);
        let device_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_string();

        let mut record = DeviceRecord::synthetic(subsystem, sysfs_path, &device_name);

        // uevent file carries the property seed; the netlink message
        // overlays it later in the probe worker.
        if let Some(uevent) = read_attr(path, "uevent") {
            for line in uevent.lines() {
                if let Some((key, value)) = line.split_once('=') {
                    record.properties.insert(key.to_string(), value.to_string());
                }
            }
        }
        record.apply_property_fields();

        for attr in CAPTURED_ATTRS {
            if let Some(value) = read_attr(path, attr) {
                record.sysfs_attrs.insert(attr.to_string(), value);
            }
        }

        if let Ok(entries) = std::fs::read_dir(path) {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    record.sysfs_children.push(name.to_string());
                }
            }
        }

        record.is_initialized = udev_db_entry_exists(record.device_number);
        record
    }

    /// Bare record for synthetic events and tests.
    pub fn synthetic(subsystem: Subsystem, sysfs_path: &str, device_name: &str) -> Self {
        DeviceRecord {
            subsystem,
            sysfs_path: sysfs_path.to_string(),
            device_name: device_name.to_string(),
            devtype: None,
            device_number: 0,
            device_file: None,
            properties: HashMap::new(),
            sysfs_attrs: HashMap::new(),
            sysfs_children: Vec::new(),
            symlinks: Vec::new(),
            ata_identify: None,
            ata_identify_packet: None,
            nvme_controller_info: None,
            is_initialized: true,
        }
    }

    /// Derive devtype, device number and node from the property map.
    pub fn apply_property_fields(&mut self) {
        if let Some(devtype) = self.properties.get("DEVTYPE") {
            self.devtype = Some(devtype.clone());
        }
        let major: u64 = self
            .properties
            .get("MAJOR")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let minor: u64 = self
            .properties
            .get("MINOR")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if major != 0 || minor != 0 {
            self.device_number = makedev(major, minor);
        }
        if let Some(devname) = self.properties.get("DEVNAME") {
            self.device_file = Some(if devname.starts_with('/') {
                devname.clone()
            } else {
                format!("/dev/{}", devname)
            });
        }
        self.symlinks = self
            .properties
            .get("DEVLINKS")
            .map(|v| v.split_whitespace().map(String::from).collect())
            .unwrap_or_default();
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|s| s.as_str())
    }

    pub fn has_property(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    pub fn property_as_int(&self, key: &str) -> Option<i64> {
        self.property(key)?.parse().ok()
    }

    pub fn property_as_bool(&self, key: &str) -> bool {
        matches!(self.property(key), Some("1") | Some("true"))
    }

    /// Property value with udev `\xHH` escapes decoded.
    pub fn property_decoded(&self, key: &str) -> Option<String> {
        self.property(key).map(decode_udev_string)
    }

    /// Multi-valued property split on whitespace.
    pub fn property_multi(&self, key: &str) -> Vec<&str> {
        self.property(key)
            .map(|v| v.split_whitespace().collect())
            .unwrap_or_default()
    }

    pub fn sysfs_attr(&self, name: &str) -> Option<&str> {
        self.sysfs_attrs.get(name).map(|s| s.as_str())
    }

    pub fn sysfs_attr_as_u64(&self, name: &str) -> Option<u64> {
        self.sysfs_attr(name)?.trim().parse().ok()
    }

    pub fn is_disk(&self) -> bool {
        self.devtype.as_deref() == Some("disk")
    }

    pub fn is_partition(&self) -> bool {
        self.devtype.as_deref() == Some("partition")
    }

    /// Whether the record belongs to the NVMe subsystem, including block
    /// nodes of NVMe namespaces.
    pub fn subsystem_is_nvme(&self) -> bool {
        self.subsystem == Subsystem::Nvme || self.device_name.starts_with("nvme")
    }

    pub fn is_dm_multipath(&self) -> bool {
        self.property("DM_UUID")
            .map(|u| u.starts_with("mpath-"))
            .unwrap_or(false)
    }

    /// Sysfs paths of the device-mapper slaves of this device.
    pub fn dm_slave_paths(&self) -> Vec<String> {
        let slaves_dir = Path::new(&self.sysfs_path).join("slaves");
        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&slaves_dir) {
            for entry in entries.flatten() {
                if let Ok(target) = std::fs::canonicalize(entry.path()) {
                    out.push(target.to_string_lossy().into_owned());
                }
            }
        }
        out.sort();
        out
    }

    /// At least one child block device named after this disk exists.
    pub fn is_partitioned_by_kernel(&self) -> bool {
        if !self.is_disk() {
            return false;
        }
        self.sysfs_children
            .iter()
            .any(|name| name.starts_with(&self.device_name))
    }
}

/// Decode udev-encoded `\xHH` escapes; truncate at the first byte sequence
/// that is not valid UTF-8.
pub fn decode_udev_string(s: &str) -> String {
    let mut bytes = Vec::with_capacity(s.len());
    let raw = s.as_bytes();
    let mut n = 0;
    while n < raw.len() {
        if raw[n] == b'\\' {
            if n + 3 >= raw.len() || raw[n + 1] != b'x' {
                warn!("malformed udev-encoded string: {:?}", s);
                break;
            }
            let hi = (raw[n + 2] as char).to_digit(16).unwrap_or(0);
            let lo = (raw[n + 3] as char).to_digit(16).unwrap_or(0);
            bytes.push(((hi << 4) | lo) as u8);
            n += 4;
        } else {
            bytes.push(raw[n]);
            n += 1;
        }
    }
    match String::from_utf8(bytes) {
        Ok(out) => out,
        Err(e) => {
            let valid = e.utf8_error().valid_up_to();
            let mut bytes = e.into_bytes();
            bytes.truncate(valid);
            String::from_utf8(bytes).unwrap_or_default()
        }
    }
}

pub fn makedev(major: u64, minor: u64) -> u64 {
    (major << 8) | (minor & 0xff) | ((minor & !0xff) << 12)
}

pub fn major(dev: u64) -> u64 {
    (dev >> 8) & 0xfff
}

pub fn minor(dev: u64) -> u64 {
    (dev & 0xff) | ((dev >> 12) & !0xff)
}

/// udev writes /run/udev/data/b<maj>:<min> once it has finished
/// processing a block device.
fn udev_db_entry_exists(device_number: u64) -> bool {
    if device_number == 0 {
        // No device node; udev reports such devices as initialized.
        return true;
    }
    Path::new(&format!(
        "/run/udev/data/b{}:{}",
        major(device_number),
        minor(device_number)
    ))
    .exists()
}

fn read_attr(base: &Path, attr: &str) -> Option<String> {
    std::fs::read_to_string(base.join(attr))
        .ok()
        .map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_udev_string() {
        assert_eq!(decode_udev_string("Samsung\\x20SSD"), "Samsung SSD");
        assert_eq!(decode_udev_string("plain"), "plain");
        // Invalid UTF-8 after decode truncates at first bad byte.
        assert_eq!(decode_udev_string("ok\\xff rest"), "ok");
    }

    #[test]
    fn test_makedev_roundtrip() {
        let dev = makedev(259, 3);
        assert_eq!(major(dev), 259);
        assert_eq!(minor(dev), 3);
        let dev = makedev(8, 257);
        assert_eq!(major(dev), 8);
        assert_eq!(minor(dev), 257);
    }

    #[test]
    fn test_apply_property_fields() {
        let mut r = DeviceRecord::synthetic(Subsystem::Block, "/sys/block/sda", "sda");
        r.properties.insert("DEVTYPE".into(), "disk".into());
        r.properties.insert("MAJOR".into(), "8".into());
        r.properties.insert("MINOR".into(), "0".into());
        r.properties.insert("DEVNAME".into(), "sda".into());
        r.properties
            .insert("DEVLINKS".into(), "/dev/disk/by-id/ata-X /dev/disk/by-path/p".into());
        r.apply_property_fields();
        assert!(r.is_disk());
        assert_eq!(r.device_file.as_deref(), Some("/dev/sda"));
        assert_eq!(r.device_number, makedev(8, 0));
        assert_eq!(r.symlinks.len(), 2);
    }

    #[test]
    fn test_kernel_partitioned() {
        let mut r = DeviceRecord::synthetic(Subsystem::Block, "/sys/block/sda", "sda");
        r.devtype = Some("disk".into());
        assert!(!r.is_partitioned_by_kernel());
        r.sysfs_children = vec!["queue".into(), "sda1".into()];
        assert!(r.is_partitioned_by_kernel());
    }

    #[test]
    fn test_nvme_detection() {
        let mut r = DeviceRecord::synthetic(Subsystem::Block, "/sys/block/nvme0n1", "nvme0n1");
        r.devtype = Some("disk".into());
        assert!(r.subsystem_is_nvme());
        let r2 = DeviceRecord::synthetic(Subsystem::Nvme, "/sys/class/nvme/nvme0", "nvme0");
        assert!(r2.subsystem_is_nvme());
    }
}
