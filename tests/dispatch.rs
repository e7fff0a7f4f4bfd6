//! End-to-end pipeline tests on synthetic device records.

use barrow::bus::{BusHub, BusSignal};
use barrow::config::ModuleLoadMode;
use barrow::device::{DeviceRecord, Subsystem};
use barrow::probe::{KnownPaths, ProbeWorker};
use barrow::registry::Registry;
use barrow::state::StateJournal;
use barrow::uevent::{Uevent, UeventAction};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn test_registry(tag: &str) -> (Arc<Registry>, Arc<BusHub>) {
    let dir = std::env::temp_dir().join(format!("barrow-itest-{}-{}", tag, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let hub = Arc::new(BusHub::new());
    let registry = Registry::new(
        Arc::clone(&hub),
        Arc::new(StateJournal::open(&dir).unwrap()),
        KnownPaths::new(),
        dir,
        ModuleLoadMode::Lazy,
        barrow::modules::builtin_modules(),
    );
    (registry, hub)
}

fn disk(name: &str, props: &[(&str, &str)]) -> Arc<DeviceRecord> {
    let mut record =
        DeviceRecord::synthetic(Subsystem::Block, &format!("/sys/block/{}", name), name);
    record.devtype = Some("disk".into());
    for (key, value) in props {
        record
            .properties
            .insert(key.to_string(), value.to_string());
    }
    Arc::new(record)
}

#[test]
fn drive_discovery_by_vpd_aggregates_paths() {
    let (registry, hub) = test_registry("s1");
    let identity: &[(&str, &str)] = &[
        ("ID_WWN_WITH_EXTENSION", "0x5000c500abcdef01"),
        ("ID_SERIAL", "S123"),
    ];

    registry.dispatch(UeventAction::Add, disk("sda", identity));
    registry.dispatch(UeventAction::Add, disk("sdb", identity));

    assert_eq!(registry.block_count(), 2);
    assert_eq!(registry.drive_count(), 1);

    let vpds = registry.drive_vpds();
    assert_eq!(vpds, vec!["0x5000c500abcdef01_S123".to_string()]);
    assert_eq!(
        registry.drive_device_names(&vpds[0]),
        vec!["sda".to_string(), "sdb".to_string()]
    );

    let drive_paths = hub.paths_under("/barrow/drives/");
    assert_eq!(drive_paths.len(), 1);
    assert!(drive_paths[0].ends_with("S123"));
}

#[test]
fn add_is_idempotent() {
    let (registry, hub) = test_registry("idem");
    let record = disk("sda", &[("ID_SERIAL", "S1"), ("ID_MODEL", "M")]);

    registry.dispatch(UeventAction::Add, Arc::clone(&record));
    let blocks_after_first = hub.paths_under("/barrow/block_devices/");
    let snapshot_after_first = hub.object("/barrow/block_devices/sda").unwrap();

    registry.dispatch(UeventAction::Add, record);
    assert_eq!(registry.block_count(), 1);
    assert_eq!(registry.drive_count(), 1);
    assert_eq!(hub.paths_under("/barrow/block_devices/"), blocks_after_first);
    assert_eq!(
        hub.object("/barrow/block_devices/sda").unwrap(),
        snapshot_after_first
    );
}

#[test]
fn remove_is_symmetric_and_drive_outlives_other_paths() {
    let (registry, hub) = test_registry("remove");
    let identity: &[(&str, &str)] = &[("ID_SERIAL", "S1"), ("ID_MODEL", "M")];

    registry.dispatch(UeventAction::Add, disk("sda", identity));
    registry.dispatch(UeventAction::Add, disk("sdb", identity));
    assert_eq!(registry.drive_count(), 1);

    registry.dispatch(UeventAction::Remove, disk("sda", identity));
    assert_eq!(registry.block_count(), 1);
    // sda was not the last record, the drive stays.
    assert_eq!(registry.drive_count(), 1);
    assert!(!hub.is_exported("/barrow/block_devices/sda"));

    registry.dispatch(UeventAction::Remove, disk("sdb", identity));
    assert_eq!(registry.block_count(), 0);
    assert_eq!(registry.drive_count(), 0);
    assert!(hub.paths_under("/barrow/drives/").is_empty());
}

#[test]
fn drive_exported_before_block_and_unexported_after() {
    let (registry, hub) = test_registry("order");
    let mut rx = hub.subscribe();
    let record = disk("sda", &[("ID_SERIAL", "S1")]);

    registry.dispatch(UeventAction::Add, Arc::clone(&record));
    registry.dispatch(UeventAction::Remove, record);

    let mut order = Vec::new();
    while let Ok(signal) = rx.try_recv() {
        match signal {
            BusSignal::ObjectAdded { path, .. } => order.push(format!("add {}", kind(&path))),
            BusSignal::ObjectRemoved { path } => order.push(format!("del {}", kind(&path))),
            _ => {}
        }
    }

    let add_drive = order.iter().position(|s| s == "add drive").unwrap();
    let add_block = order.iter().position(|s| s == "add block").unwrap();
    let del_block = order.iter().position(|s| s == "del block").unwrap();
    let del_drive = order.iter().position(|s| s == "del drive").unwrap();
    assert!(add_drive < add_block, "drive must export before its block");
    assert!(del_block < del_drive, "block must unexport before its drive");
}

fn kind(path: &str) -> &'static str {
    if path.starts_with("/barrow/drives/") {
        "drive"
    } else if path.starts_with("/barrow/block_devices/") {
        "block"
    } else {
        "other"
    }
}

#[tokio::test]
async fn spurious_media_change_is_dropped_for_unknown_paths() {
    let known = KnownPaths::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut probe = ProbeWorker::start(known.clone(), tx);

    let mut properties = HashMap::new();
    properties.insert("DEVTYPE".to_string(), "disk".to_string());
    properties.insert("DISK_MEDIA_CHANGE".to_string(), "1".to_string());
    let event = Uevent {
        action: UeventAction::Change,
        subsystem: Subsystem::Block,
        sysfs_path: "/sys/block/sr0".into(),
        properties,
    };

    // Unknown path: the event is swallowed.
    probe.enqueue(event.clone());
    let silent = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
    assert!(silent.is_err(), "spurious event must not be delivered");

    // Known path: the same event is delivered.
    known.insert("/sys/block/sr0");
    probe.enqueue(event);
    let delivered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event for a known path must be delivered")
        .unwrap();
    assert_eq!(delivered.action, UeventAction::Change);
    assert_eq!(delivered.record.sysfs_path, "/sys/block/sr0");

    probe.shutdown();
}

#[test]
fn mdraid_member_and_array_aggregate_by_uuid() {
    let (registry, hub) = test_registry("s3");

    registry.dispatch(
        UeventAction::Add,
        disk("sda", &[("ID_SERIAL", "S1"), ("UDISKS_MD_MEMBER_UUID", "u1")]),
    );

    let mut array = DeviceRecord::synthetic(Subsystem::Block, "/sys/block/md0", "md0");
    array.devtype = Some("disk".into());
    array
        .properties
        .insert("UDISKS_MD_UUID".into(), "u1".into());
    array.sysfs_attrs.insert("md/level".into(), "raid1".into());
    array
        .sysfs_attrs
        .insert("md/raid_disks".into(), "2".into());
    array
        .sysfs_attrs
        .insert("md/array_state".into(), "clean".into());
    registry.dispatch(UeventAction::Add, Arc::new(array));

    let mdraid_paths = hub.paths_under("/barrow/mdraid/");
    assert_eq!(mdraid_paths.len(), 1);
    let facets = hub.object(&mdraid_paths[0]).unwrap();
    let props = facets.get("mdraid").unwrap();
    assert_eq!(props.get("uuid").unwrap(), "u1");
    assert_eq!(props.get("running").unwrap(), true);
    assert_eq!(props.get("level").unwrap(), "raid1");
    assert_eq!(
        props.get("members").unwrap().as_array().unwrap().len(),
        1
    );
}

#[test]
fn bogus_mdraid_uuid_is_treated_as_absent() {
    let (registry, hub) = test_registry("bogus");
    registry.dispatch(
        UeventAction::Add,
        disk(
            "sda",
            &[
                ("ID_SERIAL", "S1"),
                ("UDISKS_MD_MEMBER_UUID", "00000000:00000000:00000000:00000000"),
            ],
        ),
    );
    assert!(hub.paths_under("/barrow/mdraid/").is_empty());
}

#[test]
fn black_listed_wwn_falls_back_to_model_serial() {
    let (registry, _hub) = test_registry("s4");
    registry.dispatch(
        UeventAction::Add,
        disk(
            "sda",
            &[
                ("ID_WWN_WITH_EXTENSION", "0x50f0000000000000"),
                ("ID_SERIAL", "XYZ"),
                ("ID_MODEL", "SP1604N"),
            ],
        ),
    );
    assert_eq!(registry.drive_vpds(), vec!["SP1604N_XYZ".to_string()]);
}

#[test]
fn dm_rules_disabled_flag_skips_dispatch() {
    let (registry, hub) = test_registry("dmflag");
    registry.dispatch(
        UeventAction::Add,
        disk(
            "dm-0",
            &[("ID_SERIAL", "S1"), ("DM_UDEV_DISABLE_OTHER_RULES_FLAG", "1")],
        ),
    );
    assert_eq!(registry.block_count(), 0);
    assert!(hub.paths_under("/barrow/block_devices/").is_empty());

    // The remove path is exempt from the flag.
    registry.dispatch(UeventAction::Add, disk("sda", &[("ID_SERIAL", "S2")]));
    registry.dispatch(
        UeventAction::Remove,
        disk(
            "sda",
            &[("ID_SERIAL", "S2"), ("DM_UDEV_DISABLE_OTHER_RULES_FLAG", "1")],
        ),
    );
    assert_eq!(registry.block_count(), 0);
}

#[test]
fn change_event_does_not_found_a_drive() {
    let (registry, _hub) = test_registry("changes");
    registry.dispatch(UeventAction::Change, disk("sda", &[("ID_SERIAL", "S1")]));
    assert_eq!(registry.drive_count(), 0);
    // The block object is still created.
    assert_eq!(registry.block_count(), 1);
}

#[test]
fn vpd_change_tears_down_old_association() {
    let (registry, _hub) = test_registry("vpdchange");
    registry.dispatch(UeventAction::Add, disk("sda", &[("ID_SERIAL", "S1")]));
    assert_eq!(registry.drive_vpds(), vec!["S1".to_string()]);

    registry.dispatch(UeventAction::Add, disk("sda", &[("ID_SERIAL", "S2")]));
    assert_eq!(registry.drive_vpds(), vec!["S2".to_string()]);
    assert_eq!(registry.drive_count(), 1);
}

#[test]
fn modules_coldplug_creates_iscsi_sessions() {
    let (registry, hub) = test_registry("modules");

    // A session record arrives before modules are loaded: nothing.
    let session = Arc::new(DeviceRecord::synthetic(
        Subsystem::IscsiConnection,
        "/sys/devices/platform/host2/session1",
        "session1",
    ));
    registry.dispatch(UeventAction::Add, Arc::clone(&session));
    assert_eq!(registry.module_object_count(), 0);

    registry.enable_modules();
    // Loading replays known records; the scsi session is not a block
    // record, so deliver it again.
    registry.dispatch(UeventAction::Add, session);
    assert_eq!(registry.module_object_count(), 1);
    let sessions = hub.paths_under("/barrow/iscsi/");
    assert_eq!(sessions, vec!["/barrow/iscsi/session1".to_string()]);
}
