//! Drive objects
//!
//! One logical drive per VPD identity, aggregating every device record
//! (path) that advertises the same vendor/product/serial data. Carries
//! the ATA and NVMe facets and the persisted per-drive configuration.

use crate::ata::AtaFacet;
use crate::block::FacetChange;
use crate::device::DeviceRecord;
use crate::nvme::{self, NvmeControllerFacet, NvmeFabricsFacet};
use crate::paths;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The single WWN known to be cloned across units and useless for
/// identification (SAMSUNG SP1604N PATA).
fn is_wwn_black_listed(wwn: &str) -> bool {
    let wwn = wwn
        .strip_prefix("0x")
        .or_else(|| wwn.strip_prefix("0X"))
        .unwrap_or(wwn);
    wwn.eq_ignore_ascii_case("50f0000000000000")
}

/// VPD from udev identity properties, in order of preference:
/// WWN+serial, WWN, model+serial, serial, path.
fn check_for_vpd(record: &DeviceRecord) -> Option<String> {
    let serial = record.property("ID_SERIAL").filter(|s| !s.is_empty());
    let wwn = record
        .property("ID_WWN_WITH_EXTENSION")
        .filter(|s| !s.is_empty());
    let path = record.property("ID_PATH").filter(|s| !s.is_empty());
    let model = record.property("ID_MODEL").filter(|s| !s.is_empty());

    if let Some(wwn) = wwn.filter(|w| !is_wwn_black_listed(w)) {
        return Some(match serial {
            Some(serial) => format!("{}_{}", wwn, serial),
            None => wwn.to_string(),
        });
    }
    if let Some(serial) = serial {
        return Some(match model {
            Some(model) => format!("{}_{}", model, serial),
            None => serial.to_string(),
        });
    }
    path.map(str::to_string)
}

/// Decide whether `record` founds or joins a drive and compute its VPD.
///
/// `slave_lookup` resolves a sysfs path to the record of an already
/// known block device; dm-multipath maps borrow the identity of their
/// first slave that has one.
pub fn should_include_device(
    record: &DeviceRecord,
    slave_lookup: &dyn Fn(&str) -> Option<Arc<DeviceRecord>>,
) -> Option<String> {
    let mut vpd = None;

    match record.subsystem {
        crate::device::Subsystem::Block => {
            // Only whole disks; partitions hang off their disk's drive.
            if !record.is_disk() {
                return None;
            }
            // NVMe namespaces are represented by their controller node.
            if record.subsystem_is_nvme() {
                return None;
            }
            vpd = check_for_vpd(record);
        }
        crate::device::Subsystem::Nvme => {
            vpd = nvme::controller_vpd(record);
        }
        _ => return None,
    }

    if vpd.is_none() {
        let name = &record.device_name;

        if name.starts_with("fd") {
            vpd = Some(format!("pcfloppy_{}", name));
        } else if name.starts_with("vd") {
            // virtio-blk has no serial or WWN.
            vpd = Some(name.clone());
        } else if name.starts_with("sd")
            && record.property("ID_VENDOR") == Some("VMware")
            && record
                .property("ID_MODEL")
                .map(|m| m.starts_with("Virtual"))
                .unwrap_or(false)
        {
            vpd = Some(name.clone());
        } else if record.property("ID_BUS") == Some("ieee1394")
            || record.sysfs_path.contains("/firewire/")
        {
            vpd = Some(name.clone());
        } else if record.is_dm_multipath() {
            for slave_path in record.dm_slave_paths() {
                if let Some(slave) = slave_lookup(&slave_path) {
                    if let Some(found) = check_for_vpd(&slave) {
                        vpd = Some(found);
                        break;
                    }
                }
            }
        }
    }

    vpd
}

/// Always-present drive facet.
#[derive(Debug, Clone, Default)]
pub struct DriveFacet {
    pub vendor: String,
    pub model: String,
    pub serial: String,
    pub revision: String,
    pub wwn: String,
    pub size: u64,
    pub rotation_rate: Option<u16>,
    pub connection_bus: String,
    pub seat: String,
    pub removable: bool,
    pub media_change_detected: bool,
    pub media_compatibility: Vec<String>,
    pub sort_key: String,
}

impl DriveFacet {
    fn update(&mut self, record: &DeviceRecord, ata: Option<&AtaFacet>) {
        self.vendor = record.property_decoded("ID_VENDOR").unwrap_or_default();
        self.model = record
            .property_decoded("ID_MODEL")
            .or_else(|| {
                record
                    .nvme_controller_info
                    .as_ref()
                    .and_then(|i| i.model.clone())
            })
            .unwrap_or_default();
        self.serial = record
            .property("ID_SERIAL_SHORT")
            .or_else(|| record.property("ID_SERIAL"))
            .map(str::to_string)
            .or_else(|| {
                record
                    .nvme_controller_info
                    .as_ref()
                    .and_then(|i| i.serial.clone())
            })
            .unwrap_or_default();
        self.revision = record.property("ID_REVISION").unwrap_or_default().to_string();
        self.wwn = record
            .property("ID_WWN_WITH_EXTENSION")
            .unwrap_or_default()
            .to_string();
        self.size = record
            .sysfs_attr_as_u64("size")
            .map(|sectors| sectors * 512)
            .unwrap_or(0);
        self.rotation_rate = ata.and_then(|a| a.rotation_rate).or_else(|| {
            match record.sysfs_attr("queue/rotational") {
                Some("0") => Some(0),
                _ => None,
            }
        });
        self.connection_bus = record.property("ID_BUS").unwrap_or_default().to_string();
        self.seat = record
            .property("ID_SEAT")
            .unwrap_or("seat0")
            .to_string();
        self.removable = record.sysfs_attr("removable") == Some("1");
        // Legacy floppies are the one class that cannot report media
        // changes; polling clients get a synthetic filesystem facet.
        self.media_change_detected = record.property("ID_TYPE") != Some("floppy");
        self.media_compatibility = media_compatibility(record);
    }

    fn properties(&self) -> Value {
        json!({
            "vendor": self.vendor,
            "model": self.model,
            "serial": self.serial,
            "revision": self.revision,
            "wwn": self.wwn,
            "size": self.size,
            "rotation_rate": self.rotation_rate,
            "connection_bus": self.connection_bus,
            "seat": self.seat,
            "removable": self.removable,
            "media_change_detected": self.media_change_detected,
            "media_compatibility": self.media_compatibility,
            "sort_key": self.sort_key,
        })
    }
}

fn media_compatibility(record: &DeviceRecord) -> Vec<String> {
    // ID_CDROM_CD, ID_CDROM_DVD, ... map to media names.
    let table = [
        ("ID_CDROM_CD", "optical_cd"),
        ("ID_CDROM_CD_R", "optical_cd_r"),
        ("ID_CDROM_CD_RW", "optical_cd_rw"),
        ("ID_CDROM_DVD", "optical_dvd"),
        ("ID_CDROM_DVD_R", "optical_dvd_r"),
        ("ID_CDROM_DVD_RW", "optical_dvd_rw"),
        ("ID_CDROM_BD", "optical_bd"),
        ("ID_CDROM_BD_R", "optical_bd_r"),
        ("ID_CDROM_BD_RE", "optical_bd_re"),
    ];
    let mut out: Vec<String> = table
        .iter()
        .filter(|(prop, _)| record.property_as_bool(prop))
        .map(|(_, name)| name.to_string())
        .collect();
    out.sort();
    out
}

/// One logical drive across one or more device records.
pub struct DriveObject {
    pub vpd: String,
    pub object_path: String,
    /// Device records in insertion order, one per path of the drive.
    records: Vec<Arc<DeviceRecord>>,
    pub drive: DriveFacet,
    pub ata: Option<AtaFacet>,
    pub nvme_controller: Option<NvmeControllerFacet>,
    pub nvme_fabrics: Option<NvmeFabricsFacet>,
    pub module_facets: BTreeMap<(String, String), Value>,
}

impl DriveObject {
    pub fn new(vpd: String, record: Arc<DeviceRecord>) -> Self {
        let object_path = object_path_for(&record);
        let mut drive = Self {
            vpd,
            object_path,
            records: vec![record],
            drive: DriveFacet::default(),
            ata: None,
            nvme_controller: None,
            nvme_fabrics: None,
            module_facets: BTreeMap::new(),
        };
        drive.drive.sort_key = drive.object_path.clone();
        drive.refresh_facets();
        drive
    }

    pub fn records(&self) -> &[Arc<DeviceRecord>] {
        &self.records
    }

    /// Record for operations that touch physical hardware: the first
    /// non-multipath path. Software operations may use any record.
    pub fn hw_record(&self) -> Option<&Arc<DeviceRecord>> {
        self.records
            .iter()
            .find(|r| !r.is_dm_multipath())
            .or_else(|| self.records.first())
    }

    pub fn has_record_for(&self, sysfs_path: &str) -> bool {
        self.records.iter().any(|r| r.sysfs_path == sysfs_path)
    }

    /// Append or replace the record for a sysfs path, keeping insertion
    /// order for new paths.
    pub fn upsert_record(&mut self, record: Arc<DeviceRecord>) {
        match self
            .records
            .iter_mut()
            .find(|r| r.sysfs_path == record.sysfs_path)
        {
            Some(slot) => *slot = record,
            None => self.records.push(record),
        }
    }

    /// Drop the record for a sysfs path; returns true when none remain.
    pub fn remove_record(&mut self, sysfs_path: &str) -> bool {
        self.records.retain(|r| r.sysfs_path != sysfs_path);
        self.records.is_empty()
    }

    /// Re-evaluate the ATA/NVMe facet predicates against the hardware
    /// record and refresh every facet's published state.
    pub fn refresh_facets(&mut self) -> Vec<FacetChange> {
        let record = match self.hw_record() {
            Some(record) => Arc::clone(record),
            None => return Vec::new(),
        };
        let mut changes = Vec::new();

        {
            let present = AtaFacet::applies(&record);
            match (&mut self.ata, present) {
                (slot @ None, true) => {
                    let facet = AtaFacet::from_record(&record);
                    changes.push(FacetChange::Added("ata", facet.properties()));
                    *slot = Some(facet);
                }
                (slot @ Some(_), false) => {
                    *slot = None;
                    changes.push(FacetChange::Removed("ata"));
                }
                (Some(facet), true) => {
                    facet.update(&record);
                    changes.push(FacetChange::Changed("ata", facet.properties()));
                }
                (None, false) => {}
            }
        }
        {
            let present = NvmeControllerFacet::applies(&record);
            match (&mut self.nvme_controller, present) {
                (slot @ None, true) => {
                    let facet = NvmeControllerFacet::from_record(&record);
                    changes.push(FacetChange::Added("nvme_controller", facet.properties()));
                    *slot = Some(facet);
                }
                (slot @ Some(_), false) => {
                    *slot = None;
                    changes.push(FacetChange::Removed("nvme_controller"));
                }
                (Some(facet), true) => {
                    facet.update(&record);
                    changes.push(FacetChange::Changed("nvme_controller", facet.properties()));
                }
                (None, false) => {}
            }
        }
        {
            let present = NvmeFabricsFacet::applies(&record);
            match (&mut self.nvme_fabrics, present) {
                (slot @ None, true) => {
                    let facet = NvmeFabricsFacet::from_record(&record);
                    changes.push(FacetChange::Added("nvme_fabrics", facet.properties()));
                    *slot = Some(facet);
                }
                (slot @ Some(_), false) => {
                    *slot = None;
                    changes.push(FacetChange::Removed("nvme_fabrics"));
                }
                (Some(facet), true) => {
                    facet.update(&record);
                    changes.push(FacetChange::Changed("nvme_fabrics", facet.properties()));
                }
                (None, false) => {}
            }
        }

        self.drive.update(&record, self.ata.as_ref());
        changes.insert(0, FacetChange::Changed("drive", self.drive.properties()));
        changes
    }

    pub fn facet_map(&self) -> crate::bus::FacetMap {
        let mut facets = crate::bus::FacetMap::new();
        facets.insert("drive".into(), self.drive.properties());
        if let Some(f) = &self.ata {
            facets.insert("ata".into(), f.properties());
        }
        if let Some(f) = &self.nvme_controller {
            facets.insert("nvme_controller".into(), f.properties());
        }
        if let Some(f) = &self.nvme_fabrics {
            facets.insert("nvme_fabrics".into(), f.properties());
        }
        for ((module, facet_type), props) in &self.module_facets {
            facets.insert(format!("{}.{}", module, facet_type), props.clone());
        }
        facets
    }

    pub fn seat(&self) -> &str {
        if self.drive.seat.is_empty() {
            "seat0"
        } else {
            &self.drive.seat
        }
    }
}

fn object_path_for(record: &DeviceRecord) -> String {
    let vendor = record.property_decoded("ID_VENDOR").unwrap_or_default();
    let model = record
        .property_decoded("ID_MODEL")
        .or_else(|| {
            record
                .nvme_controller_info
                .as_ref()
                .and_then(|i| i.model.clone())
        })
        .unwrap_or_default();
    let serial = record
        .property("ID_SERIAL_SHORT")
        .or_else(|| record.property("ID_SERIAL"))
        .map(str::to_string)
        .or_else(|| {
            record
                .nvme_controller_info
                .as_ref()
                .and_then(|i| i.serial.clone())
        })
        .unwrap_or_else(|| record.device_name.clone());
    paths::drive(&vendor, &model, &serial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Subsystem;

    fn no_slaves(_: &str) -> Option<Arc<DeviceRecord>> {
        None
    }

    fn disk(name: &str, props: &[(&str, &str)]) -> DeviceRecord {
        let mut r = DeviceRecord::synthetic(
            Subsystem::Block,
            &format!("/sys/block/{}", name),
            name,
        );
        r.devtype = Some("disk".into());
        for (k, v) in props {
            r.properties.insert(k.to_string(), v.to_string());
        }
        r
    }

    #[test]
    fn test_vpd_priority_order() {
        let r = disk(
            "sda",
            &[
                ("ID_WWN_WITH_EXTENSION", "0x5000c500abcdef01"),
                ("ID_SERIAL", "S123"),
                ("ID_MODEL", "Model"),
                ("ID_PATH", "pci-1"),
            ],
        );
        assert_eq!(
            should_include_device(&r, &no_slaves).unwrap(),
            "0x5000c500abcdef01_S123"
        );

        let r = disk("sda", &[("ID_WWN_WITH_EXTENSION", "0x5000c500abcdef01")]);
        assert_eq!(
            should_include_device(&r, &no_slaves).unwrap(),
            "0x5000c500abcdef01"
        );

        let r = disk("sda", &[("ID_MODEL", "SP1604N"), ("ID_SERIAL", "XYZ")]);
        assert_eq!(should_include_device(&r, &no_slaves).unwrap(), "SP1604N_XYZ");

        let r = disk("sda", &[("ID_PATH", "pci-0000:00:1f.2-ata-1")]);
        assert_eq!(
            should_include_device(&r, &no_slaves).unwrap(),
            "pci-0000:00:1f.2-ata-1"
        );
    }

    #[test]
    fn test_black_listed_wwn_falls_back() {
        let r = disk(
            "sda",
            &[
                ("ID_WWN_WITH_EXTENSION", "0x50f0000000000000"),
                ("ID_SERIAL", "XYZ"),
                ("ID_MODEL", "SP1604N"),
            ],
        );
        assert_eq!(should_include_device(&r, &no_slaves).unwrap(), "SP1604N_XYZ");
    }

    #[test]
    fn test_partition_is_not_a_drive() {
        let mut r = disk("sda1", &[("ID_SERIAL", "S1")]);
        r.devtype = Some("partition".into());
        assert!(should_include_device(&r, &no_slaves).is_none());
    }

    #[test]
    fn test_nvme_namespace_node_excluded() {
        let r = disk("nvme0n1", &[("ID_SERIAL", "S1")]);
        assert!(should_include_device(&r, &no_slaves).is_none());
    }

    #[test]
    fn test_virtio_and_floppy_fallbacks() {
        let r = disk("vda", &[]);
        assert_eq!(should_include_device(&r, &no_slaves).unwrap(), "vda");
        let r = disk("fd0", &[]);
        assert_eq!(should_include_device(&r, &no_slaves).unwrap(), "pcfloppy_fd0");
    }

    #[test]
    fn test_vmware_fallback() {
        let r = disk(
            "sda",
            &[("ID_VENDOR", "VMware"), ("ID_MODEL", "Virtual_disk")],
        );
        assert_eq!(should_include_device(&r, &no_slaves).unwrap(), "sda");
    }

    #[test]
    fn test_record_aggregation_order() {
        let r1 = Arc::new(disk("sda", &[("ID_SERIAL", "S1"), ("ID_MODEL", "M")]));
        let mut drive = DriveObject::new("M_S1".into(), Arc::clone(&r1));
        let r2 = Arc::new(disk("sdb", &[("ID_SERIAL", "S1"), ("ID_MODEL", "M")]));
        drive.upsert_record(Arc::clone(&r2));

        assert_eq!(drive.records().len(), 2);
        assert_eq!(drive.records()[0].device_name, "sda");
        assert_eq!(drive.records()[1].device_name, "sdb");

        // Replacing an existing path does not change order or length.
        drive.upsert_record(Arc::new(disk("sda", &[("ID_SERIAL", "S1")])));
        assert_eq!(drive.records().len(), 2);

        assert!(!drive.remove_record("/sys/block/sda"));
        assert!(drive.remove_record("/sys/block/sdb"));
    }

    #[test]
    fn test_hw_record_skips_multipath() {
        let mut mp = disk("dm-3", &[("ID_SERIAL", "S1")]);
        mp.properties.insert("DM_UUID".into(), "mpath-3600".into());
        let mut drive = DriveObject::new("S1".into(), Arc::new(mp));
        let plain = Arc::new(disk("sda", &[("ID_SERIAL", "S1")]));
        drive.upsert_record(Arc::clone(&plain));
        assert_eq!(drive.hw_record().unwrap().device_name, "sda");
    }

    #[test]
    fn test_drive_facet_defaults() {
        let r = Arc::new(disk(
            "sda",
            &[("ID_SERIAL", "S1"), ("ID_MODEL", "Disk\\x20One"), ("ID_BUS", "ata")],
        ));
        let drive = DriveObject::new("S1".into(), r);
        assert_eq!(drive.drive.model, "Disk One");
        assert_eq!(drive.seat(), "seat0");
        assert!(drive.drive.media_change_detected);
        assert!(drive.object_path.starts_with("/barrow/drives/"));
    }
}
