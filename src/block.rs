//! Block objects and facet composition
//!
//! One `BlockObject` per sysfs path. Each event swaps in the new device
//! record and re-evaluates the facet predicates: a facet is present iff
//! its predicate holds for the current record. The facet set and all
//! property changes are reported back to the registry for publishing.

use crate::device::DeviceRecord;
use crate::mounts::MountTable;
use crate::paths;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Cross-object inputs needed by the facet predicates.
pub struct BlockContext<'a> {
    pub mounts: &'a MountTable,
    /// From the owning drive; drives that cannot detect media changes
    /// force a filesystem facet so polling clients can still mount.
    pub media_change_detected: bool,
}

impl<'a> BlockContext<'a> {
    pub fn new(mounts: &'a MountTable) -> Self {
        Self {
            mounts,
            media_change_detected: true,
        }
    }
}

/// A facet-membership or property change to publish on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum FacetChange {
    Added(&'static str, Value),
    Changed(&'static str, Value),
    Removed(&'static str),
}

#[derive(Debug, Clone, Default)]
pub struct PartitionTableFacet {
    pub table_type: String,
}

impl PartitionTableFacet {
    fn check(record: &DeviceRecord) -> bool {
        if !record.is_disk() {
            return false;
        }
        if record.has_property("ID_PART_TABLE_TYPE") {
            // blkid may see both a filesystem and a table signature; the
            // kernel's own partitioning decides which one we believe.
            if record.property("ID_FS_USAGE") == Some("filesystem")
                && !record.is_partitioned_by_kernel()
            {
                return false;
            }
            return true;
        }
        // blkid may miss table formats the kernel knows; children prove
        // the kernel partitioned the disk.
        record.is_partitioned_by_kernel()
    }

    fn update(&mut self, record: &DeviceRecord) {
        self.table_type = record
            .property("ID_PART_TABLE_TYPE")
            .unwrap_or("unknown")
            .to_string();
    }

    fn properties(&self) -> Value {
        json!({ "type": self.table_type })
    }
}

#[derive(Debug, Clone, Default)]
pub struct PartitionFacet {
    pub number: u32,
    pub partition_type: String,
    pub scheme: String,
    pub name: String,
    pub uuid: String,
    pub offset: u64,
    pub size: u64,
    pub is_container: bool,
    pub is_contained: bool,
    /// Object path of the owning partition-table block.
    pub table_path: String,
}

impl PartitionFacet {
    fn check(record: &DeviceRecord) -> bool {
        record.is_partition() || record.has_property("ID_PART_ENTRY_SCHEME")
    }

    fn update(&mut self, record: &DeviceRecord) {
        self.number = record
            .property_as_int("ID_PART_ENTRY_NUMBER")
            .unwrap_or(0)
            .max(0) as u32;
        self.partition_type = record
            .property("ID_PART_ENTRY_TYPE")
            .unwrap_or_default()
            .to_string();
        self.scheme = record
            .property("ID_PART_ENTRY_SCHEME")
            .unwrap_or_default()
            .to_string();
        self.name = record.property_decoded("ID_PART_ENTRY_NAME").unwrap_or_default();
        self.uuid = record
            .property("ID_PART_ENTRY_UUID")
            .unwrap_or_default()
            .to_string();
        self.offset = record
            .property_as_int("ID_PART_ENTRY_OFFSET")
            .unwrap_or(0)
            .max(0) as u64
            * 512;
        self.size = record
            .property_as_int("ID_PART_ENTRY_SIZE")
            .unwrap_or(0)
            .max(0) as u64
            * 512;

        // DOS extended-partition bookkeeping: types 0x05/0x0f/0x85 with
        // a primary slot are containers, logical partitions (>= 5) are
        // contained.
        self.is_container = false;
        self.is_contained = false;
        if self.scheme == "dos" {
            let type_as_int = parse_dos_type(&self.partition_type);
            if self.number <= 4 {
                if matches!(type_as_int, Some(0x05) | Some(0x0f) | Some(0x85)) {
                    self.is_container = true;
                }
            } else if self.number >= 5 {
                self.is_contained = true;
            }
        }

        // The whole-disk node owning this partition: strip the trailing
        // partition digits (sda1 -> sda, nvme0n1p2 -> nvme0n1).
        self.table_path = parent_disk_name(&record.device_name)
            .map(|disk| paths::block_device(&disk))
            .unwrap_or_default();
    }

    fn properties(&self) -> Value {
        json!({
            "number": self.number,
            "type": self.partition_type,
            "scheme": self.scheme,
            "name": self.name,
            "uuid": self.uuid,
            "offset": self.offset,
            "size": self.size,
            "is_container": self.is_container,
            "is_contained": self.is_contained,
            "table": self.table_path,
        })
    }
}

fn parse_dos_type(s: &str) -> Option<u32> {
    let hex = s.strip_prefix("0x").unwrap_or(s);
    u32::from_str_radix(hex, 16).ok()
}

/// `sda1` -> `sda`, `nvme0n1p2` -> `nvme0n1`, `mmcblk0p1` -> `mmcblk0`.
fn parent_disk_name(name: &str) -> Option<String> {
    let trimmed = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if trimmed.len() == name.len() || trimmed.is_empty() {
        return None;
    }
    let trimmed = trimmed.strip_suffix('p').filter(|t| {
        t.chars().last().map(|c| c.is_ascii_digit()).unwrap_or(false)
    });
    match trimmed {
        Some(t) => Some(t.to_string()),
        None => Some(name.trim_end_matches(|c: char| c.is_ascii_digit()).to_string()),
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilesystemFacet {
    pub fs_type: String,
    pub mount_points: Vec<String>,
}

impl FilesystemFacet {
    fn check(record: &DeviceRecord, ctx: &BlockContext) -> bool {
        let detected = record.property("ID_FS_USAGE") == Some("filesystem")
            && !(record.is_disk() && record.is_partitioned_by_kernel());
        detected
            || !ctx.media_change_detected
            || (record.device_number != 0 && ctx.mounts.is_mounted(record.device_number))
    }

    fn update(&mut self, record: &DeviceRecord, ctx: &BlockContext) {
        self.fs_type = record.property("ID_FS_TYPE").unwrap_or_default().to_string();
        self.mount_points = ctx
            .mounts
            .mount_points(record.device_number)
            .into_iter()
            .map(str::to_string)
            .collect();
        self.mount_points.sort();
    }

    fn properties(&self) -> Value {
        json!({ "type": self.fs_type, "mount_points": self.mount_points })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SwapFacet {
    pub active: bool,
}

impl SwapFacet {
    fn check(record: &DeviceRecord, ctx: &BlockContext) -> bool {
        (record.property("ID_FS_USAGE") == Some("other")
            && record.property("ID_FS_TYPE") == Some("swap"))
            || record
                .device_file
                .as_deref()
                .map(|f| ctx.mounts.is_swap_active(f))
                .unwrap_or(false)
    }

    fn update(&mut self, record: &DeviceRecord, ctx: &BlockContext) {
        self.active = record
            .device_file
            .as_deref()
            .map(|f| ctx.mounts.is_swap_active(f))
            .unwrap_or(false);
    }

    fn properties(&self) -> Value {
        json!({ "active": self.active })
    }
}

#[derive(Debug, Clone, Default)]
pub struct EncryptedFacet {
    pub crypto_type: String,
    /// Object path of the unlocked cleartext block, empty while locked.
    pub cleartext_device: String,
}

impl EncryptedFacet {
    fn check(record: &DeviceRecord) -> bool {
        is_luks(record) || is_tcrypt(record) || is_bitlk(record) || is_unknown_crypto(record)
    }

    fn update(&mut self, record: &DeviceRecord) {
        self.crypto_type = if is_luks(record) {
            "luks".into()
        } else if is_tcrypt(record) {
            "tcrypt".into()
        } else if is_bitlk(record) {
            "bitlk".into()
        } else {
            "unknown".into()
        };
    }

    fn properties(&self) -> Value {
        json!({
            "type": self.crypto_type,
            "cleartext_device": self.cleartext_device,
        })
    }
}

fn is_luks(record: &DeviceRecord) -> bool {
    record.property("ID_FS_USAGE") == Some("crypto")
        && record.property("ID_FS_TYPE") == Some("crypto_LUKS")
}

fn is_tcrypt(record: &DeviceRecord) -> bool {
    record.property("ID_FS_TYPE") == Some("tcrypt")
}

fn is_bitlk(record: &DeviceRecord) -> bool {
    record.property("ID_FS_TYPE") == Some("BitLocker")
}

fn is_unknown_crypto(record: &DeviceRecord) -> bool {
    record.property("ID_FS_USAGE") == Some("crypto")
        && !is_luks(record)
        && !is_tcrypt(record)
        && !is_bitlk(record)
}

#[derive(Debug, Clone, Default)]
pub struct LoopFacet {
    pub backing_file: String,
    pub autoclear: bool,
}

impl LoopFacet {
    fn check(record: &DeviceRecord) -> bool {
        record.device_name.starts_with("loop") && record.is_disk()
    }

    fn update(&mut self, record: &DeviceRecord) {
        self.backing_file = record
            .sysfs_attr("loop/backing_file")
            .unwrap_or_default()
            .to_string();
        self.autoclear = record.sysfs_attr("loop/autoclear") == Some("1");
    }

    fn properties(&self) -> Value {
        json!({ "backing_file": self.backing_file, "autoclear": self.autoclear })
    }
}

#[derive(Debug, Clone, Default)]
pub struct NvmeNamespaceFacet {
    pub nsid: u32,
}

impl NvmeNamespaceFacet {
    fn check(record: &DeviceRecord) -> bool {
        record.subsystem_is_nvme() && record.sysfs_attr("nsid").is_some()
    }

    fn update(&mut self, record: &DeviceRecord) {
        self.nsid = record
            .sysfs_attr("nsid")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
    }

    fn properties(&self) -> Value {
        json!({ "nsid": self.nsid })
    }
}

/// Per-block-device aggregate.
pub struct BlockObject {
    record: Arc<DeviceRecord>,
    pub object_path: String,
    /// Object path of the owning drive, empty when none.
    pub drive_path: String,
    pub partition_table: Option<PartitionTableFacet>,
    pub partition: Option<PartitionFacet>,
    pub filesystem: Option<FilesystemFacet>,
    pub swap: Option<SwapFacet>,
    pub encrypted: Option<EncryptedFacet>,
    pub loop_device: Option<LoopFacet>,
    pub nvme_namespace: Option<NvmeNamespaceFacet>,
    /// Module-attached facets: (module id, facet type) -> properties.
    pub module_facets: BTreeMap<(String, String), Value>,
}

impl BlockObject {
    pub fn new(record: Arc<DeviceRecord>) -> Self {
        let object_path = paths::block_device(&record.device_name);
        Self {
            record,
            object_path,
            drive_path: String::new(),
            partition_table: None,
            partition: None,
            filesystem: None,
            swap: None,
            encrypted: None,
            loop_device: None,
            nvme_namespace: None,
            module_facets: BTreeMap::new(),
        }
    }

    pub fn record(&self) -> &Arc<DeviceRecord> {
        &self.record
    }

    pub fn sysfs_path(&self) -> &str {
        &self.record.sysfs_path
    }

    /// Base block facet properties, always published.
    pub fn block_properties(&self) -> Value {
        let r = &self.record;
        json!({
            "device": r.device_file,
            "device_number": r.device_number,
            "sysfs_path": r.sysfs_path,
            "size": r.sysfs_attr_as_u64("size").map(|sectors| sectors * 512),
            "read_only": r.sysfs_attr("ro") == Some("1"),
            "id_usage": r.property("ID_FS_USAGE"),
            "id_type": r.property("ID_FS_TYPE"),
            "id_label": r.property_decoded("ID_FS_LABEL"),
            "id_uuid": r.property("ID_FS_UUID"),
            "symlinks": r.symlinks,
            "drive": self.drive_path,
        })
    }

    /// Swap in `record` and re-evaluate every facet predicate. Returns
    /// the set of changes to publish, starting with the base facet.
    pub fn update(&mut self, record: Arc<DeviceRecord>, ctx: &BlockContext) -> Vec<FacetChange> {
        self.record = record;
        let mut changes = vec![FacetChange::Changed("block", self.block_properties())];

        let record = Arc::clone(&self.record);

        // The facet update rule: absent && predicate -> construct;
        // present && !predicate -> destroy; present && predicate ->
        // update with the new record.
        {
            let present = PartitionTableFacet::check(&record);
            match (&mut self.partition_table, present) {
                (slot @ None, true) => {
                    let mut facet = PartitionTableFacet::default();
                    facet.update(&record);
                    changes.push(FacetChange::Added("partition_table", facet.properties()));
                    *slot = Some(facet);
                }
                (slot @ Some(_), false) => {
                    *slot = None;
                    changes.push(FacetChange::Removed("partition_table"));
                }
                (Some(facet), true) => {
                    facet.update(&record);
                    changes.push(FacetChange::Changed("partition_table", facet.properties()));
                }
                (None, false) => {}
            }
        }
        {
            let present = PartitionFacet::check(&record);
            match (&mut self.partition, present) {
                (slot @ None, true) => {
                    let mut facet = PartitionFacet::default();
                    facet.update(&record);
                    changes.push(FacetChange::Added("partition", facet.properties()));
                    *slot = Some(facet);
                }
                (slot @ Some(_), false) => {
                    *slot = None;
                    changes.push(FacetChange::Removed("partition"));
                }
                (Some(facet), true) => {
                    facet.update(&record);
                    changes.push(FacetChange::Changed("partition", facet.properties()));
                }
                (None, false) => {}
            }
        }
        {
            let present = FilesystemFacet::check(&record, ctx);
            match (&mut self.filesystem, present) {
                (slot @ None, true) => {
                    let mut facet = FilesystemFacet::default();
                    facet.update(&record, ctx);
                    changes.push(FacetChange::Added("filesystem", facet.properties()));
                    *slot = Some(facet);
                }
                (slot @ Some(_), false) => {
                    *slot = None;
                    changes.push(FacetChange::Removed("filesystem"));
                }
                (Some(facet), true) => {
                    facet.update(&record, ctx);
                    changes.push(FacetChange::Changed("filesystem", facet.properties()));
                }
                (None, false) => {}
            }
        }
        {
            let present = SwapFacet::check(&record, ctx);
            match (&mut self.swap, present) {
                (slot @ None, true) => {
                    let mut facet = SwapFacet::default();
                    facet.update(&record, ctx);
                    changes.push(FacetChange::Added("swap", facet.properties()));
                    *slot = Some(facet);
                }
                (slot @ Some(_), false) => {
                    *slot = None;
                    changes.push(FacetChange::Removed("swap"));
                }
                (Some(facet), true) => {
                    facet.update(&record, ctx);
                    changes.push(FacetChange::Changed("swap", facet.properties()));
                }
                (None, false) => {}
            }
        }
        {
            let present = EncryptedFacet::check(&record);
            match (&mut self.encrypted, present) {
                (slot @ None, true) => {
                    let mut facet = EncryptedFacet::default();
                    facet.update(&record);
                    changes.push(FacetChange::Added("encrypted", facet.properties()));
                    *slot = Some(facet);
                }
                (slot @ Some(_), false) => {
                    *slot = None;
                    changes.push(FacetChange::Removed("encrypted"));
                }
                (Some(facet), true) => {
                    facet.update(&record);
                    changes.push(FacetChange::Changed("encrypted", facet.properties()));
                }
                (None, false) => {}
            }
        }
        {
            let present = LoopFacet::check(&record);
            match (&mut self.loop_device, present) {
                (slot @ None, true) => {
                    let mut facet = LoopFacet::default();
                    facet.update(&record);
                    changes.push(FacetChange::Added("loop", facet.properties()));
                    *slot = Some(facet);
                }
                (slot @ Some(_), false) => {
                    *slot = None;
                    changes.push(FacetChange::Removed("loop"));
                }
                (Some(facet), true) => {
                    facet.update(&record);
                    changes.push(FacetChange::Changed("loop", facet.properties()));
                }
                (None, false) => {}
            }
        }
        {
            let present = NvmeNamespaceFacet::check(&record);
            match (&mut self.nvme_namespace, present) {
                (slot @ None, true) => {
                    let mut facet = NvmeNamespaceFacet::default();
                    facet.update(&record);
                    changes.push(FacetChange::Added("nvme_namespace", facet.properties()));
                    *slot = Some(facet);
                }
                (slot @ Some(_), false) => {
                    *slot = None;
                    changes.push(FacetChange::Removed("nvme_namespace"));
                }
                (Some(facet), true) => {
                    facet.update(&record);
                    changes.push(FacetChange::Changed("nvme_namespace", facet.properties()));
                }
                (None, false) => {}
            }
        }

        changes
    }

    /// Full facet map for the initial export.
    pub fn facet_map(&self) -> crate::bus::FacetMap {
        let mut facets = crate::bus::FacetMap::new();
        facets.insert("block".into(), self.block_properties());
        if let Some(f) = &self.partition_table {
            facets.insert("partition_table".into(), f.properties());
        }
        if let Some(f) = &self.partition {
            facets.insert("partition".into(), f.properties());
        }
        if let Some(f) = &self.filesystem {
            facets.insert("filesystem".into(), f.properties());
        }
        if let Some(f) = &self.swap {
            facets.insert("swap".into(), f.properties());
        }
        if let Some(f) = &self.encrypted {
            facets.insert("encrypted".into(), f.properties());
        }
        if let Some(f) = &self.loop_device {
            facets.insert("loop".into(), f.properties());
        }
        if let Some(f) = &self.nvme_namespace {
            facets.insert("nvme_namespace".into(), f.properties());
        }
        for ((module, facet_type), props) in &self.module_facets {
            facets.insert(format!("{}.{}", module, facet_type), props.clone());
        }
        facets
    }

    /// Sysfs path of the encrypted device backing this cleartext block,
    /// derived from the device-mapper slave link.
    pub fn crypto_backing_sysfs_path(&self) -> Option<String> {
        let uuid = self.record.property("DM_UUID")?;
        if !uuid.starts_with("CRYPT-") {
            return None;
        }
        self.record.dm_slave_paths().into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceRecord, Subsystem};

    fn ctx_table() -> MountTable {
        MountTable::parse("", "")
    }

    fn disk(name: &str) -> DeviceRecord {
        let mut r = DeviceRecord::synthetic(
            Subsystem::Block,
            &format!("/sys/block/{}", name),
            name,
        );
        r.devtype = Some("disk".into());
        r
    }

    fn partition(name: &str, number: u32, scheme: &str, ptype: &str) -> DeviceRecord {
        let mut r = DeviceRecord::synthetic(
            Subsystem::Block,
            &format!("/sys/block/sda/{}", name),
            name,
        );
        r.devtype = Some("partition".into());
        r.properties.insert("ID_PART_ENTRY_SCHEME".into(), scheme.into());
        r.properties
            .insert("ID_PART_ENTRY_NUMBER".into(), number.to_string());
        r.properties.insert("ID_PART_ENTRY_TYPE".into(), ptype.into());
        r
    }

    fn update(object: &mut BlockObject, record: DeviceRecord) -> Vec<FacetChange> {
        let table = ctx_table();
        let ctx = BlockContext::new(&table);
        object.update(Arc::new(record), &ctx)
    }

    #[test]
    fn test_partition_table_facet_on_partitioned_disk() {
        let mut r = disk("sda");
        r.properties.insert("ID_PART_TABLE_TYPE".into(), "gpt".into());
        let mut object = BlockObject::new(Arc::new(r.clone()));
        update(&mut object, r);
        assert!(object.partition_table.is_some());
        assert!(object.partition.is_none());
    }

    #[test]
    fn test_filesystem_signature_beats_table_unless_kernel_partitioned() {
        // blkid sees both a fs and a table; kernel has no children ->
        // filesystem wins.
        let mut r = disk("sdb");
        r.properties.insert("ID_PART_TABLE_TYPE".into(), "dos".into());
        r.properties.insert("ID_FS_USAGE".into(), "filesystem".into());
        r.properties.insert("ID_FS_TYPE".into(), "ext4".into());
        let mut object = BlockObject::new(Arc::new(r.clone()));
        update(&mut object, r.clone());
        assert!(object.partition_table.is_none());
        assert!(object.filesystem.is_some());

        // With kernel children the table wins and the fs facet drops.
        r.sysfs_children = vec!["sdb1".into()];
        update(&mut object, r);
        assert!(object.partition_table.is_some());
        assert!(object.filesystem.is_none());
    }

    #[test]
    fn test_dos_container_and_contained() {
        let table = ctx_table();
        let ctx = BlockContext::new(&table);

        let r = partition("sda3", 3, "dos", "0xf");
        let mut object = BlockObject::new(Arc::new(r.clone()));
        object.update(Arc::new(r), &ctx);
        let facet = object.partition.as_ref().unwrap();
        assert!(facet.is_container);
        assert!(!facet.is_contained);

        let r = partition("sda5", 5, "dos", "0x83");
        let mut object = BlockObject::new(Arc::new(r.clone()));
        object.update(Arc::new(r), &ctx);
        let facet = object.partition.as_ref().unwrap();
        assert!(!facet.is_container);
        assert!(facet.is_contained);

        // Plain primary is neither.
        let r = partition("sda1", 1, "dos", "0x83");
        let mut object = BlockObject::new(Arc::new(r.clone()));
        object.update(Arc::new(r), &ctx);
        let facet = object.partition.as_ref().unwrap();
        assert!(!facet.is_container);
        assert!(!facet.is_contained);
    }

    #[test]
    fn test_encrypted_facet_kinds() {
        let mut r = partition("sda2", 2, "gpt", "");
        r.properties.insert("ID_FS_USAGE".into(), "crypto".into());
        r.properties.insert("ID_FS_TYPE".into(), "crypto_LUKS".into());
        let mut object = BlockObject::new(Arc::new(r.clone()));
        update(&mut object, r);
        assert_eq!(object.encrypted.as_ref().unwrap().crypto_type, "luks");

        let mut r = partition("sda3", 3, "gpt", "");
        r.properties.insert("ID_FS_USAGE".into(), "crypto".into());
        r.properties.insert("ID_FS_TYPE".into(), "mystery".into());
        let mut object = BlockObject::new(Arc::new(r.clone()));
        update(&mut object, r);
        assert_eq!(object.encrypted.as_ref().unwrap().crypto_type, "unknown");
    }

    #[test]
    fn test_loop_facet() {
        let mut r = disk("loop0");
        r.sysfs_attrs
            .insert("loop/backing_file".into(), "/var/lib/img".into());
        let mut object = BlockObject::new(Arc::new(r.clone()));
        update(&mut object, r);
        let facet = object.loop_device.as_ref().unwrap();
        assert_eq!(facet.backing_file, "/var/lib/img");
    }

    #[test]
    fn test_facet_removed_when_predicate_flips() {
        let mut r = disk("sdc");
        r.properties.insert("ID_FS_USAGE".into(), "other".into());
        r.properties.insert("ID_FS_TYPE".into(), "swap".into());
        let mut object = BlockObject::new(Arc::new(r.clone()));
        update(&mut object, r.clone());
        assert!(object.swap.is_some());

        r.properties.remove("ID_FS_USAGE");
        r.properties.remove("ID_FS_TYPE");
        let changes = update(&mut object, r);
        assert!(object.swap.is_none());
        assert!(changes.contains(&FacetChange::Removed("swap")));
    }

    #[test]
    fn test_parent_disk_name() {
        assert_eq!(parent_disk_name("sda1").as_deref(), Some("sda"));
        assert_eq!(parent_disk_name("nvme0n1p2").as_deref(), Some("nvme0n1"));
        assert_eq!(parent_disk_name("mmcblk0p1").as_deref(), Some("mmcblk0"));
        assert_eq!(parent_disk_name("sda"), None);
    }

    #[test]
    fn test_nvme_namespace_facet() {
        let mut r = disk("nvme0n1");
        r.sysfs_attrs.insert("nsid".into(), "1".into());
        let mut object = BlockObject::new(Arc::new(r.clone()));
        update(&mut object, r);
        assert_eq!(object.nvme_namespace.as_ref().unwrap().nsid, 1);
    }
}
