//! Probe worker
//!
//! A single dedicated thread that turns raw uevents into `DeviceRecord`
//! snapshots: waits for udev to settle, drops spurious media-change
//! events for unknown devices, and synchronously reads the ATA/NVMe
//! identity data. Ordering within one sysfs path is preserved by the
//! single FIFO queue; ordering across paths is not.

use crate::device::{DeviceRecord, NvmeControllerInfo, Subsystem};
use crate::scsi;
use crate::uevent::{Uevent, UeventAction};
use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

/// Index of sysfs paths the registry currently knows, shared with the
/// probe worker so known devices still see their media-change events.
#[derive(Clone, Default)]
pub struct KnownPaths(Arc<Mutex<HashSet<String>>>);

impl KnownPaths {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, sysfs_path: &str) {
        self.0.lock().unwrap().insert(sysfs_path.to_string());
    }

    pub fn remove(&self, sysfs_path: &str) {
        self.0.lock().unwrap().remove(sysfs_path);
    }

    pub fn contains(&self, sysfs_path: &str) -> bool {
        self.0.lock().unwrap().contains(sysfs_path)
    }
}

/// A probed event ready for dispatch.
#[derive(Debug, Clone)]
pub struct ProbedUevent {
    pub action: UeventAction,
    pub record: Arc<DeviceRecord>,
}

pub enum ProbeRequest {
    Probe(Uevent),
    /// Sentinel; terminates the worker after in-flight requests finish.
    Shutdown,
}

pub struct ProbeWorker {
    tx: mpsc::Sender<ProbeRequest>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ProbeWorker {
    /// Start the worker thread. Probed events are posted to `out`.
    pub fn start(
        known: KnownPaths,
        out: tokio::sync::mpsc::UnboundedSender<ProbedUevent>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<ProbeRequest>();
        let handle = thread::Builder::new()
            .name("barrow-probe".into())
            .spawn(move || worker_loop(rx, known, out))
            .expect("failed to spawn probe thread");
        Self {
            tx,
            handle: Some(handle),
        }
    }

    pub fn enqueue(&self, event: Uevent) {
        let _ = self.tx.send(ProbeRequest::Probe(event));
    }

    /// Queue sender for feeding the worker from another thread.
    pub fn sender(&self) -> mpsc::Sender<ProbeRequest> {
        self.tx.clone()
    }

    pub fn shutdown(&mut self) {
        let _ = self.tx.send(ProbeRequest::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    rx: mpsc::Receiver<ProbeRequest>,
    known: KnownPaths,
    out: tokio::sync::mpsc::UnboundedSender<ProbedUevent>,
) {
    debug!("probe worker started");
    while let Ok(request) = rx.recv() {
        let event = match request {
            ProbeRequest::Probe(event) => event,
            ProbeRequest::Shutdown => break,
        };

        if event.action != UeventAction::Remove {
            settle_wait(&event);
        }

        if !known.contains(&event.sysfs_path) && uevent_is_spurious(&event) {
            trace!("dropping spurious uevent for {}", event.sysfs_path);
            continue;
        }

        let record = probe_device(&event);
        if out
            .send(ProbedUevent {
                action: event.action,
                record: Arc::new(record),
            })
            .is_err()
        {
            break;
        }
    }
    debug!("probe worker stopped");
}

/// Poll the udev-initialized flag; give up after 5 tries of 100 ms and
/// proceed regardless.
fn settle_wait(event: &Uevent) {
    for _ in 0..5 {
        if udev_initialized(event) {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
}

fn udev_initialized(event: &Uevent) -> bool {
    let major = event.properties.get("MAJOR").and_then(|v| v.parse::<u64>().ok());
    let minor = event.properties.get("MINOR").and_then(|v| v.parse::<u64>().ok());
    match (major, minor) {
        (Some(major), Some(minor)) => {
            std::path::Path::new(&format!("/run/udev/data/b{}:{}", major, minor)).exists()
        }
        // Devices without a node are reported initialized.
        _ => true,
    }
}

/// A `change` on a whole disk carrying only the media-change or
/// eject-request marker, with no usage type and no ID_TYPE, is noise
/// from the kernel's disk_uevents path.
fn uevent_is_spurious(event: &Uevent) -> bool {
    if event.action != UeventAction::Change {
        return false;
    }
    if event.subsystem != Subsystem::Block {
        return false;
    }
    if event.properties.get("DEVTYPE").map(String::as_str) != Some("disk") {
        return false;
    }
    if event.properties.contains_key("ID_TYPE") || event.properties.contains_key("ID_FS_USAGE") {
        return false;
    }
    event.properties.get("DISK_MEDIA_CHANGE").map(String::as_str) == Some("1")
        || event.properties.get("DISK_EJECT_REQUEST").map(String::as_str) == Some("1")
}

/// Build a fully enriched record straight from sysfs; used by coldplug
/// where there is no netlink environment to overlay.
pub fn build_record(subsystem: Subsystem, sysfs_path: &str) -> DeviceRecord {
    let mut record = DeviceRecord::from_sysfs(subsystem, sysfs_path);
    record.apply_property_fields();
    enrich(&mut record);
    record
}

/// Build the record and synchronously read the identity data.
fn probe_device(event: &Uevent) -> DeviceRecord {
    let mut record = DeviceRecord::from_sysfs(event.subsystem, &event.sysfs_path);

    // The netlink environment wins over the stale uevent file contents.
    for (key, value) in &event.properties {
        record.properties.insert(key.clone(), value.clone());
    }
    record.apply_property_fields();

    if event.action != UeventAction::Remove {
        enrich(&mut record);
    }
    record
}

fn enrich(record: &mut DeviceRecord) {
    if record.subsystem == Subsystem::Block && record.is_disk() && !record.subsystem_is_nvme() {
        let is_ata = record.has_property("ID_ATA")
            || record.property("ID_BUS") == Some("ata");
        if is_ata {
            if let Some(device_file) = record.device_file.clone() {
                match scsi::ata_identify(&device_file) {
                    Ok(blob) => {
                        if record.property("ID_TYPE") == Some("cd") {
                            record.ata_identify_packet = Some(blob);
                        } else {
                            record.ata_identify = Some(blob);
                        }
                    }
                    Err(e) => debug!("identify failed for {}: {}", device_file, e),
                }
            }
        }
    }

    if record.subsystem == Subsystem::Nvme {
        record.nvme_controller_info = Some(NvmeControllerInfo {
            model: record.sysfs_attr("model").map(str::to_string),
            serial: record.sysfs_attr("serial").map(str::to_string),
            firmware: record.sysfs_attr("firmware_rev").map(str::to_string),
            subsysnqn: record.sysfs_attr("subsysnqn").map(str::to_string),
            transport: record.sysfs_attr("transport").map(str::to_string),
            state: record.sysfs_attr("state").map(str::to_string),
            cntlid: record.sysfs_attr("cntlid").and_then(|v| v.parse().ok()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn change_event(props: &[(&str, &str)]) -> Uevent {
        let mut properties = HashMap::new();
        for (k, v) in props {
            properties.insert(k.to_string(), v.to_string());
        }
        Uevent {
            action: UeventAction::Change,
            subsystem: Subsystem::Block,
            sysfs_path: "/sys/block/sr0".into(),
            properties,
        }
    }

    #[test]
    fn test_media_change_only_is_spurious() {
        let event = change_event(&[("DEVTYPE", "disk"), ("DISK_MEDIA_CHANGE", "1")]);
        assert!(uevent_is_spurious(&event));
    }

    #[test]
    fn test_eject_request_only_is_spurious() {
        let event = change_event(&[("DEVTYPE", "disk"), ("DISK_EJECT_REQUEST", "1")]);
        assert!(uevent_is_spurious(&event));
    }

    #[test]
    fn test_id_type_is_not_spurious() {
        let event = change_event(&[
            ("DEVTYPE", "disk"),
            ("DISK_MEDIA_CHANGE", "1"),
            ("ID_TYPE", "cd"),
        ]);
        assert!(!uevent_is_spurious(&event));
    }

    #[test]
    fn test_partition_is_not_spurious() {
        let event = change_event(&[("DEVTYPE", "partition"), ("DISK_MEDIA_CHANGE", "1")]);
        assert!(!uevent_is_spurious(&event));
    }

    #[test]
    fn test_known_paths_index() {
        let known = KnownPaths::new();
        known.insert("/sys/block/sr0");
        assert!(known.contains("/sys/block/sr0"));
        known.remove("/sys/block/sr0");
        assert!(!known.contains("/sys/block/sr0"));
    }
}
