//! Per-pipeline admission and the single-writer registry of driven runs.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::cancellation::CancellationToken;
use crate::errors::EngineError;

/// A run currently being driven.
#[derive(Debug, Clone)]
pub(crate) struct DriverSlot {
    pub(crate) token: Arc<CancellationToken>,
    pub(crate) finished: Arc<Notify>,
}

/// Releases the driver slot when dropped.
#[derive(Debug)]
pub(crate) struct DriverGuard {
    run_id: Uuid,
    slot: DriverSlot,
    drivers: Arc<DashMap<Uuid, DriverSlot>>,
}

impl DriverGuard {
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.slot.token
    }
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.drivers.remove(&self.run_id);
        self.slot.finished.notify_waiters();
    }
}

/// Tracks the active run of each pipeline and the runs being driven.
#[derive(Debug, Default)]
pub(crate) struct Admission {
    active: DashMap<String, Uuid>,
    drivers: Arc<DashMap<Uuid, DriverSlot>>,
}

impl Admission {
    /// Makes `run_id` the active run of `pipeline_id` unless another run
    /// holds it. Returns the holder on conflict.
    pub(crate) fn try_acquire(&self, pipeline_id: &str, run_id: Uuid) -> Result<(), Uuid> {
        match self.active.entry(pipeline_id.to_string()) {
            Entry::Occupied(entry) if *entry.get() == run_id => Ok(()),
            Entry::Occupied(entry) => Err(*entry.get()),
            Entry::Vacant(entry) => {
                entry.insert(run_id);
                Ok(())
            }
        }
    }

    /// Frees `pipeline_id` if `run_id` holds it.
    pub(crate) fn release(&self, pipeline_id: &str, run_id: Uuid) {
        self.active.remove_if(pipeline_id, |_, holder| *holder == run_id);
    }

    /// Returns the active run of `pipeline_id`.
    pub(crate) fn holder(&self, pipeline_id: &str) -> Option<Uuid> {
        self.active.get(pipeline_id).map(|r| *r)
    }

    /// Claims exclusive write access to `run_id`.
    pub(crate) fn begin_drive(&self, run_id: Uuid) -> Result<DriverGuard, EngineError> {
        match self.drivers.entry(run_id) {
            Entry::Occupied(_) => Err(EngineError::RunBusy(run_id)),
            Entry::Vacant(entry) => {
                let slot = DriverSlot {
                    token: Arc::new(CancellationToken::new()),
                    finished: Arc::new(Notify::new()),
                };
                entry.insert(slot.clone());
                Ok(DriverGuard {
                    run_id,
                    slot,
                    drivers: Arc::clone(&self.drivers),
                })
            }
        }
    }

    /// Returns the slot of a run being driven.
    pub(crate) fn driver(&self, run_id: Uuid) -> Option<DriverSlot> {
        self.drivers.get(&run_id).map(|s| s.clone())
    }

    /// Returns true while `run_id` is being driven.
    pub(crate) fn is_driving(&self, run_id: Uuid) -> bool {
        self.drivers.contains_key(&run_id)
    }
}
