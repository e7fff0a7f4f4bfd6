//! Housekeeping scheduler
//!
//! Every ten minutes (and once at startup) a sweep runs over all drive
//! objects and module-owned objects on a blocking worker: SMART refresh
//! for ATA drives, health-log refresh for NVMe controllers, module
//! hooks for the rest. Sweeps never overlap; one started while another
//! runs is dropped.

use crate::registry::{DriveTask, Registry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub struct Housekeeping {
    registry: Arc<Registry>,
    running: AtomicBool,
    last_sweep: Mutex<Option<Instant>>,
}

impl Housekeeping {
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            running: AtomicBool::new(false),
            last_sweep: Mutex::new(None),
        })
    }

    /// Periodic driver; runs one sweep immediately, then every
    /// `SWEEP_INTERVAL`.
    pub async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            self.clone().sweep().await;
        }
    }

    /// One sweep on a blocking worker. Re-entrance is refused, not
    /// queued.
    pub async fn sweep(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("housekeeping sweep already running, skipping");
            return;
        }

        let me = Arc::clone(&self);
        let result = tokio::task::spawn_blocking(move || me.sweep_blocking()).await;
        if let Err(e) = result {
            warn!("housekeeping worker panicked: {}", e);
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn sweep_blocking(&self) {
        let secs_since_last = {
            let mut last = self.last_sweep.lock().unwrap();
            let secs = last.map(|t| t.elapsed().as_secs()).unwrap_or(0);
            *last = Some(Instant::now());
            secs
        };
        debug!("housekeeping sweep ({}s since last)", secs_since_last);

        for vpd in self.registry.drive_vpds() {
            match self.registry.housekeep_drive(&vpd, false) {
                Ok(()) => {}
                Err(e) if e.is_recoverable() => {
                    // Asleep or busy drives are left alone until the
                    // next sweep.
                    info!("housekeeping skipped drive {}: {}", vpd, e);
                }
                Err(e) => warn!("housekeeping failed for drive {}: {}", vpd, e),
            }
        }

        self.registry.housekeep_module_objects(secs_since_last);
    }

    /// True while a sweep is in flight.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Drain deferred drive work: initial housekeeping for fresh drives and
/// configuration re-application on reconfigure events.
pub async fn run_drive_tasks(registry: Arc<Registry>, mut rx: UnboundedReceiver<DriveTask>) {
    while let Some(task) = rx.recv().await {
        let registry = Arc::clone(&registry);
        let result = tokio::task::spawn_blocking(move || match task {
            DriveTask::InitialHousekeeping(vpd) => {
                debug!("initial housekeeping for drive {}", vpd);
                if let Err(e) = registry.housekeep_drive(&vpd, true) {
                    warn!("initial housekeeping for drive {} failed: {}", vpd, e);
                }
            }
            DriveTask::ApplyConfiguration(vpd) => {
                registry.apply_drive_configuration(&vpd);
            }
        })
        .await;
        if let Err(e) = result {
            warn!("drive task worker panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusHub;
    use crate::config::ModuleLoadMode;
    use crate::probe::KnownPaths;
    use crate::state::StateJournal;

    fn test_registry(tag: &str) -> Arc<Registry> {
        let dir = std::env::temp_dir().join(format!("barrow-hk-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        Registry::new(
            Arc::new(BusHub::new()),
            Arc::new(StateJournal::open(&dir).unwrap()),
            KnownPaths::new(),
            dir,
            ModuleLoadMode::Lazy,
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_sweeps_do_not_overlap() {
        let housekeeping = Housekeeping::new(test_registry("overlap"));

        // Simulate an in-flight sweep; the next one must be dropped
        // without flipping the flag off.
        housekeeping.running.store(true, Ordering::SeqCst);
        housekeeping.clone().sweep().await;
        assert!(housekeeping.is_running());

        housekeeping.running.store(false, Ordering::SeqCst);
        housekeeping.clone().sweep().await;
        assert!(!housekeeping.is_running());
    }

    #[tokio::test]
    async fn test_empty_sweep_completes() {
        let housekeeping = Housekeeping::new(test_registry("empty"));
        housekeeping.clone().sweep().await;
        assert!(!housekeeping.is_running());
    }
}
