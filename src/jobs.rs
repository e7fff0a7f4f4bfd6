//! Job registry
//!
//! Tracks in-flight long operations and publishes them on the bus with
//! progress, byte rate and expected end time. Jobs are destroyed on
//! completion; cancellation is opt-in per job.

use crate::bus::{BusHub, FacetMap};
use crate::error::{Error, Result};
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use uuid::Uuid;

/// Cancellation token handed to operation workers.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Await cancellation; used in `tokio::select!` around helper runs.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                // Sender gone means the job can no longer be cancelled.
                std::future::pending::<()>().await;
            }
        }
    }

    /// A token that never fires, for non-cancellable work.
    pub fn none() -> Self {
        static NEVER: once_cell::sync::Lazy<watch::Sender<bool>> =
            once_cell::sync::Lazy::new(|| watch::channel(false).0);
        Self {
            rx: NEVER.subscribe(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub id: Uuid,
    pub kind: String,
    /// Object paths this job operates on.
    pub objects: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub progress: Option<f64>,
    /// Bytes per second.
    pub rate: Option<u64>,
    pub expected_end: Option<DateTime<Utc>>,
    pub uid: u32,
    pub cancellable: bool,
}

struct JobSlot {
    state: JobState,
    cancel_tx: watch::Sender<bool>,
}

/// Handle returned to the worker that owns the job.
pub struct JobHandle {
    pub id: Uuid,
    pub cancel: CancelToken,
}

pub struct JobRegistry {
    hub: Arc<BusHub>,
    jobs: Mutex<HashMap<Uuid, JobSlot>>,
}

impl JobRegistry {
    pub fn new(hub: Arc<BusHub>) -> Self {
        Self {
            hub,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn start(
        &self,
        kind: &str,
        objects: Vec<String>,
        uid: u32,
        cancellable: bool,
    ) -> JobHandle {
        let id = Uuid::new_v4();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let state = JobState {
            id,
            kind: kind.to_string(),
            objects,
            started_at: Utc::now(),
            progress: None,
            rate: None,
            expected_end: None,
            uid,
            cancellable,
        };

        let path = paths::job(&id.to_string());
        let mut facets = FacetMap::new();
        facets.insert("job".into(), job_properties(&state));
        self.hub.export(&path, facets);

        self.jobs.lock().unwrap().insert(
            id,
            JobSlot {
                state,
                cancel_tx,
            },
        );
        JobHandle {
            id,
            cancel: CancelToken { rx: cancel_rx },
        }
    }

    pub fn update_progress(
        &self,
        id: Uuid,
        progress: Option<f64>,
        rate: Option<u64>,
        expected_end: Option<DateTime<Utc>>,
    ) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(slot) = jobs.get_mut(&id) {
            slot.state.progress = progress.map(|p| p.clamp(0.0, 1.0));
            slot.state.rate = rate;
            slot.state.expected_end = expected_end;
            let props = job_properties(&slot.state);
            let path = paths::job(&id.to_string());
            drop(jobs);
            self.hub.publish_facet(&path, "job", props);
        }
    }

    /// Request cancellation. MDRaid sync jobs and other non-cancellable
    /// jobs refuse.
    pub fn cancel(&self, id: Uuid) -> Result<()> {
        let jobs = self.jobs.lock().unwrap();
        let slot = jobs
            .get(&id)
            .ok_or_else(|| Error::failed(format!("no such job {}", id)))?;
        if !slot.state.cancellable {
            return Err(Error::NotSupported(format!(
                "job {} ({}) is not cancellable",
                id, slot.state.kind
            )));
        }
        let _ = slot.cancel_tx.send(true);
        Ok(())
    }

    /// Finish a job and unexport it. Distinct outcomes: success, failure
    /// and cancellation (reported by the caller in `message`).
    pub fn complete(&self, id: Uuid, success: bool, message: &str) {
        let removed = self.jobs.lock().unwrap().remove(&id);
        if removed.is_some() {
            let path = paths::job(&id.to_string());
            self.hub
                .publish_facet(&path, "job", json!({"completed": success, "message": message}));
            self.hub.unexport(&path);
        }
    }

    pub fn get(&self, id: Uuid) -> Option<JobState> {
        self.jobs.lock().unwrap().get(&id).map(|s| s.state.clone())
    }

    pub fn list(&self) -> Vec<JobState> {
        let mut out: Vec<_> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .map(|s| s.state.clone())
            .collect();
        out.sort_by_key(|s| s.started_at);
        out
    }
}

fn job_properties(state: &JobState) -> serde_json::Value {
    json!({
        "id": state.id,
        "kind": state.kind,
        "objects": state.objects,
        "started_at": state.started_at,
        "progress": state.progress,
        "rate": state.rate,
        "expected_end": state.expected_end,
        "uid": state.uid,
        "cancellable": state.cancellable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> JobRegistry {
        JobRegistry::new(Arc::new(BusHub::new()))
    }

    #[test]
    fn test_job_lifecycle() {
        let jobs = registry();
        let handle = jobs.start("format-mkfs", vec!["/barrow/block_devices/sda1".into()], 0, true);
        assert!(jobs.get(handle.id).is_some());

        jobs.update_progress(handle.id, Some(0.5), Some(1_000_000), None);
        assert_eq!(jobs.get(handle.id).unwrap().progress, Some(0.5));

        jobs.complete(handle.id, true, "done");
        assert!(jobs.get(handle.id).is_none());
    }

    #[test]
    fn test_progress_clamped() {
        let jobs = registry();
        let handle = jobs.start("resize", vec![], 0, false);
        jobs.update_progress(handle.id, Some(1.7), None, None);
        assert_eq!(jobs.get(handle.id).unwrap().progress, Some(1.0));
    }

    #[test]
    fn test_cancel_refused_for_non_cancellable() {
        let jobs = registry();
        let handle = jobs.start("mdraid-sync", vec![], 0, false);
        assert!(matches!(
            jobs.cancel(handle.id),
            Err(Error::NotSupported(_))
        ));
        assert!(!handle.cancel.is_cancelled());
    }

    #[test]
    fn test_cancel_fires_token() {
        let jobs = registry();
        let handle = jobs.start("mount", vec![], 1000, true);
        jobs.cancel(handle.id).unwrap();
        assert!(handle.cancel.is_cancelled());
    }
}
