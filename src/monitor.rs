use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::{
    aggregate::RunStore,
    api::{HttpBackend, RunBackend, RunLocation},
    config::ClientCfg,
    connection::{ConnectionManager, ConnectionParts, ConnectionState},
    control::{RunControl, StopOutcome},
    error::SyncError,
    events::MonitorEvent,
    refresher::Refresher,
    types::RunDetail,
};

/// Live view of one run: resolve, stream, merge, and the stop command.
///
/// Dropping the monitor tears the stream down.
pub struct RunMonitor {
    location: RunLocation,
    store: Arc<RunStore>,
    connection: ConnectionManager,
    control: RunControl,
    events: broadcast::Sender<MonitorEvent>,
}

impl RunMonitor {
    /// Resolves `run_id` over HTTP. Not streaming yet; call [`RunMonitor::start`].
    pub async fn open(cfg: &ClientCfg, run_id: &str) -> Result<Self, SyncError> {
        let backend: Arc<dyn RunBackend> = Arc::new(HttpBackend::new(cfg.clone())?);
        Self::with_backend(backend, cfg, run_id).await
    }

    /// A run that cannot be resolved is final: nothing is retried.
    pub async fn with_backend(
        backend: Arc<dyn RunBackend>,
        cfg: &ClientCfg,
        run_id: &str,
    ) -> Result<Self, SyncError> {
        let location = backend.resolve_run(run_id).await?;
        info!(run_id = %location.run_id, session_id = %location.owning_session_id, "run resolved");

        let store = Arc::new(RunStore::new(cfg.max_logs));
        let (events, _) = broadcast::channel(cfg.broadcast_capacity);
        let refresher = Arc::new(Refresher::new(backend.clone(), store.clone(), location.clone()));
        let connection = ConnectionManager::new(ConnectionParts {
            backend: backend.clone(),
            location: location.clone(),
            store: store.clone(),
            refresher,
            format: cfg.frame_format.clone(),
            reconnect: cfg.reconnect.clone(),
            events: events.clone(),
        });
        let control = RunControl::new(backend, store.clone(), location.clone(), events.clone());
        Ok(Self { location, store, connection, control, events })
    }

    pub fn start(&self) {
        self.connection.connect();
    }

    pub fn reconnect(&self) {
        self.connection.reconnect();
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> RunDetail {
        self.store.snapshot()
    }

    pub fn location(&self) -> &RunLocation {
        &self.location
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.connection.last_error()
    }

    pub async fn stop_run(&self) -> Result<StopOutcome, SyncError> {
        self.control.stop_run().await
    }

    pub fn is_stopping(&self) -> bool {
        self.control.is_stopping()
    }

    pub fn action_error(&self) -> Option<SyncError> {
        self.control.last_error()
    }
}

impl Drop for RunMonitor {
    fn drop(&mut self) {
        self.connection.shutdown();
    }
}
