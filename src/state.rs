//! State journal
//!
//! Durable record of caller-initiated state that must be cleaned up
//! after a crash: mounted filesystems, unlocked encrypted devices, loop
//! devices and started RAID arrays. Kept as JSON files under the state
//! directory, rewritten atomically on every mutation. The periodic
//! `check` pass reconciles entries against current reality and reverses
//! stale state; it is idempotent.

use crate::device::{major, minor};
use crate::error::{Error, Result};
use crate::mounts::MountTable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountedFsEntry {
    pub device_number: u64,
    pub mount_point: String,
    pub uid: u32,
    pub fstab_mount: bool,
    pub mounted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockedCryptoEntry {
    pub cleartext_device: u64,
    pub crypto_device: u64,
    pub dm_uuid: Option<String>,
    pub uid: u32,
    pub unlocked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopEntry {
    pub device_file: String,
    pub backing_file: String,
    pub backing_file_device: u64,
    pub uid: u32,
    pub set_up_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdraidEntry {
    pub raid_device: u64,
    pub uid: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct JournalData {
    mounted_fs: Vec<MountedFsEntry>,
    unlocked_crypto: Vec<UnlockedCryptoEntry>,
    loops: Vec<LoopEntry>,
    mdraid: Vec<MdraidEntry>,
}

/// The journal itself. Interior mutex so operation workers can record
/// state without going through the registry lock.
pub struct StateJournal {
    path: PathBuf,
    data: Mutex<JournalData>,
}

impl StateJournal {
    /// Load or create the journal under `state_dir`.
    pub fn open(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join("journal.json");
        let data = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!("state journal corrupt, starting fresh: {}", e);
                JournalData::default()
            }),
            Err(_) => JournalData::default(),
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    fn persist(&self, data: &JournalData) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(data)?)?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| Error::failed(format!("rename {}: {}", self.path.display(), e)))?;
        Ok(())
    }

    pub fn add_mounted_fs(
        &self,
        mount_point: &str,
        device_number: u64,
        uid: u32,
        fstab_mount: bool,
    ) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.mounted_fs.retain(|e| e.device_number != device_number);
        data.mounted_fs.push(MountedFsEntry {
            device_number,
            mount_point: mount_point.to_string(),
            uid,
            fstab_mount,
            mounted_at: Utc::now(),
        });
        self.persist(&data)
    }

    pub fn find_mounted_fs(&self, device_number: u64) -> Option<MountedFsEntry> {
        self.data
            .lock()
            .unwrap()
            .mounted_fs
            .iter()
            .find(|e| e.device_number == device_number)
            .cloned()
    }

    pub fn remove_mounted_fs(&self, device_number: u64) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.mounted_fs.retain(|e| e.device_number != device_number);
        self.persist(&data)
    }

    pub fn add_unlocked_crypto_dev(
        &self,
        cleartext_device: u64,
        crypto_device: u64,
        dm_uuid: Option<&str>,
        uid: u32,
    ) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.unlocked_crypto
            .retain(|e| e.crypto_device != crypto_device);
        data.unlocked_crypto.push(UnlockedCryptoEntry {
            cleartext_device,
            crypto_device,
            dm_uuid: dm_uuid.map(str::to_string),
            uid,
            unlocked_at: Utc::now(),
        });
        self.persist(&data)
    }

    pub fn find_unlocked_crypto_dev(&self, crypto_device: u64) -> Option<UnlockedCryptoEntry> {
        self.data
            .lock()
            .unwrap()
            .unlocked_crypto
            .iter()
            .find(|e| e.crypto_device == crypto_device)
            .cloned()
    }

    pub fn remove_unlocked_crypto_dev(&self, crypto_device: u64) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.unlocked_crypto
            .retain(|e| e.crypto_device != crypto_device);
        self.persist(&data)
    }

    pub fn add_loop(
        &self,
        device_file: &str,
        backing_file: &str,
        backing_file_device: u64,
        uid: u32,
    ) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.loops.retain(|e| e.device_file != device_file);
        data.loops.push(LoopEntry {
            device_file: device_file.to_string(),
            backing_file: backing_file.to_string(),
            backing_file_device,
            uid,
            set_up_at: Utc::now(),
        });
        self.persist(&data)
    }

    pub fn has_loop(&self, device_file: &str) -> Option<LoopEntry> {
        self.data
            .lock()
            .unwrap()
            .loops
            .iter()
            .find(|e| e.device_file == device_file)
            .cloned()
    }

    pub fn remove_loop(&self, device_file: &str) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.loops.retain(|e| e.device_file != device_file);
        self.persist(&data)
    }

    pub fn add_mdraid(&self, raid_device: u64, uid: u32) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.mdraid.retain(|e| e.raid_device != raid_device);
        data.mdraid.push(MdraidEntry {
            raid_device,
            uid,
            started_at: Utc::now(),
        });
        self.persist(&data)
    }

    pub fn has_mdraid(&self, raid_device: u64) -> Option<MdraidEntry> {
        self.data
            .lock()
            .unwrap()
            .mdraid
            .iter()
            .find(|e| e.raid_device == raid_device)
            .cloned()
    }

    pub fn remove_mdraid(&self, raid_device: u64) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.mdraid.retain(|e| e.raid_device != raid_device);
        self.persist(&data)
    }

    /// Reconcile journal entries against the live system.
    pub fn check(&self) {
        let table = MountTable::load();
        self.check_with(&table, &block_device_present);
    }

    /// Reconciliation with injected inputs. Stale non-fstab mounts are
    /// unmounted and their mount points removed; entries whose devices
    /// vanished are dropped.
    pub fn check_with(&self, table: &MountTable, device_present: &dyn Fn(u64) -> bool) {
        let mut data = self.data.lock().unwrap();
        let mut changed = false;

        data.mounted_fs.retain(|entry| {
            if device_present(entry.device_number) && table.is_mounted(entry.device_number) {
                return true;
            }
            changed = true;
            if table.is_mounted(entry.device_number) {
                // Device still mounted but gone from /sys: unmount unless
                // the mount came from fstab.
                if !entry.fstab_mount {
                    info!("cleaning up stale mount {}", entry.mount_point);
                    let _ = Command::new("umount")
                        .args(["--lazy", &entry.mount_point])
                        .status();
                }
            }
            if !entry.fstab_mount {
                let _ = std::fs::remove_dir(&entry.mount_point);
            }
            debug!("dropping stale mounted-fs entry {}", entry.mount_point);
            false
        });

        data.unlocked_crypto.retain(|entry| {
            if device_present(entry.cleartext_device) {
                return true;
            }
            debug!(
                "dropping stale unlocked-crypto entry {}:{}",
                major(entry.crypto_device),
                minor(entry.crypto_device)
            );
            changed = true;
            false
        });

        data.loops.retain(|entry| {
            if Path::new(&entry.device_file).exists() {
                return true;
            }
            debug!("dropping stale loop entry {}", entry.device_file);
            changed = true;
            false
        });

        data.mdraid.retain(|entry| {
            if device_present(entry.raid_device) {
                return true;
            }
            debug!(
                "dropping stale mdraid entry {}:{}",
                major(entry.raid_device),
                minor(entry.raid_device)
            );
            changed = true;
            false
        });

        if changed {
            if let Err(e) = self.persist(&data) {
                warn!("failed to persist state journal: {}", e);
            }
        }
    }
}

fn block_device_present(device_number: u64) -> bool {
    Path::new(&format!(
        "/sys/dev/block/{}:{}",
        major(device_number),
        minor(device_number)
    ))
    .exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::makedev;

    fn temp_state_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "barrow-state-test-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_mounted_fs_roundtrip() {
        let dir = temp_state_dir("mounted");
        let journal = StateJournal::open(&dir).unwrap();
        let dev = makedev(8, 1);
        journal.add_mounted_fs("/run/media/u/disk", dev, 1000, false).unwrap();

        let entry = journal.find_mounted_fs(dev).unwrap();
        assert_eq!(entry.uid, 1000);
        assert!(!entry.fstab_mount);

        // Survives reopen.
        drop(journal);
        let journal = StateJournal::open(&dir).unwrap();
        assert!(journal.find_mounted_fs(dev).is_some());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_check_drops_vanished_devices() {
        let dir = temp_state_dir("check");
        let journal = StateJournal::open(&dir).unwrap();
        let dev = makedev(8, 1);
        journal.add_mounted_fs("/nonexistent/mp", dev, 0, true).unwrap();
        journal.add_mdraid(makedev(9, 0), 0).unwrap();

        let table = MountTable::parse("", "");
        journal.check_with(&table, &|_| false);

        assert!(journal.find_mounted_fs(dev).is_none());
        assert!(journal.has_mdraid(makedev(9, 0)).is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_check_is_idempotent() {
        let dir = temp_state_dir("idem");
        let journal = StateJournal::open(&dir).unwrap();
        journal.add_loop("/dev/loop9", "/tmp/img", makedev(8, 1), 1000).unwrap();

        let table = MountTable::parse("", "");
        journal.check_with(&table, &|_| true);
        journal.check_with(&table, &|_| true);
        // Loop entry dropped both times only because /dev/loop9 does not
        // exist in the test environment; second pass must not error.
        assert!(journal.has_loop("/dev/loop9").is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_unlocked_crypto_lookup() {
        let dir = temp_state_dir("crypto");
        let journal = StateJournal::open(&dir).unwrap();
        journal
            .add_unlocked_crypto_dev(makedev(253, 0), makedev(8, 2), Some("CRYPT-LUKS2"), 1000)
            .unwrap();
        let entry = journal.find_unlocked_crypto_dev(makedev(8, 2)).unwrap();
        assert_eq!(entry.cleartext_device, makedev(253, 0));
        journal.remove_unlocked_crypto_dev(makedev(8, 2)).unwrap();
        assert!(journal.find_unlocked_crypto_dev(makedev(8, 2)).is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
