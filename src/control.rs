use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    aggregate::RunStore,
    api::{RunBackend, RunLocation},
    error::SyncError,
    events::MonitorEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The server acknowledged the command; the status change arrives on the stream.
    Sent,
    /// Another stop was still in flight, nothing was sent.
    AlreadyPending,
}

/// Out-of-band commands. Never touches run status itself.
pub struct RunControl {
    backend: Arc<dyn RunBackend>,
    store: Arc<RunStore>,
    location: RunLocation,
    events: broadcast::Sender<MonitorEvent>,
    stopping: AtomicBool,
    last_error: Mutex<Option<SyncError>>,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RunControl {
    pub fn new(
        backend: Arc<dyn RunBackend>,
        store: Arc<RunStore>,
        location: RunLocation,
        events: broadcast::Sender<MonitorEvent>,
    ) -> Self {
        Self { backend, store, location, events, stopping: AtomicBool::new(false), last_error: Mutex::new(None) }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.last_error.lock().clone()
    }

    pub async fn stop_run(&self) -> Result<StopOutcome, SyncError> {
        if !self.store.status().is_some_and(|s| s.is_active()) {
            return Err(self.fail(SyncError::action("run is not pending or running")));
        }
        if self.stopping.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Ok(StopOutcome::AlreadyPending);
        }
        let _guard = InFlight(&self.stopping);
        *self.last_error.lock() = None;

        match self.backend.stop_run(&self.location).await {
            Ok(()) => {
                info!(run_id = %self.location.run_id, "stop acknowledged");
                Ok(StopOutcome::Sent)
            }
            Err(e @ (SyncError::Action { .. } | SyncError::Auth)) => Err(self.fail(e)),
            Err(other) => Err(self.fail(SyncError::Action {
                message: other.to_string(),
                code: Some(other.code().to_string()),
            })),
        }
    }

    fn fail(&self, err: SyncError) -> SyncError {
        warn!(run_id = %self.location.run_id, error = %err, "run action failed");
        *self.last_error.lock() = Some(err.clone());
        let _ = self.events.send(MonitorEvent::ActionFailed(err.clone()));
        err
    }
}
