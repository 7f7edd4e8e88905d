//! Owns the one live event stream of a run and its reconnect schedule.
//!
//! ```text
//! Idle -> Connecting -> Streaming -> Idle            (clean end / run finished)
//!                                 -> Reconnecting -> Connecting
//!                                 -> Failed          (cap exceeded, auth)
//! ```
//!
//! Every `connect()` bumps a generation counter and cancels the previous
//! stream token and retry timer, so a superseded task can neither apply frames
//! nor schedule another retry.
//!
//! Sub-resource fetches hang off a separate shutdown token: a reconnect must not
//! abort a tree visualization fetch whose trigger will never be sent again.

use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    aggregate::RunStore,
    api::{RunBackend, RunLocation},
    backoff,
    config::{FrameFormat, ReconnectCfg},
    error::SyncError,
    events::{Frame, MonitorEvent},
    frame::FrameParser,
    refresher::Refresher,
    router::{EventRouter, RouteOutcome},
    types::RunStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Failed,
}

enum StreamEnd {
    Completed(RunStatus),
    Closed,
}

struct Status {
    state: ConnectionState,
    connected: bool,
    attempts: u32,
    generation: u64,
    last_error: Option<SyncError>,
    stream: Option<CancellationToken>,
    retry: Option<CancellationToken>,
}

struct Inner {
    backend: Arc<dyn RunBackend>,
    location: RunLocation,
    store: Arc<RunStore>,
    router: EventRouter,
    refresher: Arc<Refresher>,
    format: FrameFormat,
    reconnect: ReconnectCfg,
    events: broadcast::Sender<MonitorEvent>,
    status: Mutex<Status>,
    shutdown: CancellationToken,
}

/// Handle to the stream of one run. Clones share the same connection.
///
/// `connect`, `reconnect` and `disconnect` spawn onto the ambient tokio runtime.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

pub struct ConnectionParts {
    pub backend: Arc<dyn RunBackend>,
    pub location: RunLocation,
    pub store: Arc<RunStore>,
    pub refresher: Arc<Refresher>,
    pub format: FrameFormat,
    pub reconnect: ReconnectCfg,
    pub events: broadcast::Sender<MonitorEvent>,
}

impl ConnectionManager {
    pub fn new(parts: ConnectionParts) -> Self {
        let inner = Inner {
            backend: parts.backend,
            location: parts.location,
            store: parts.store,
            router: EventRouter::new(),
            refresher: parts.refresher,
            format: parts.format,
            reconnect: parts.reconnect,
            events: parts.events,
            status: Mutex::new(Status {
                state: ConnectionState::Idle,
                connected: false,
                attempts: 0,
                generation: 0,
                last_error: None,
                stream: None,
                retry: None,
            }),
            shutdown: CancellationToken::new(),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Replaces any in-flight stream with a fresh one. No-op for a finished run.
    pub fn connect(&self) {
        self.inner.connect(None);
    }

    /// Manual recovery: forgets past failures, then connects.
    pub fn reconnect(&self) {
        self.inner.status.lock().attempts = 0;
        self.inner.connect(None);
    }

    /// Cancels the stream and any pending retry. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let was_live = {
            let mut st = self.inner.status.lock();
            st.generation += 1;
            let had_stream = st.stream.take().map(|t| t.cancel()).is_some();
            let had_timer = st.retry.take().map(|t| t.cancel()).is_some();
            if st.state != ConnectionState::Failed {
                st.state = ConnectionState::Idle;
            }
            let was_live = had_stream || had_timer || st.connected;
            st.connected = false;
            was_live
        };
        if was_live {
            debug!(run_id = %self.inner.location.run_id, "stream disconnected");
            self.inner.emit(MonitorEvent::Disconnected);
        }
    }

    /// Disconnects and also aborts background sub-resource fetches.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.disconnect();
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.status.lock().state
    }

    pub fn attempts(&self) -> u32 {
        self.inner.status.lock().attempts
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status.lock().connected
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.inner.status.lock().last_error.clone()
    }
}

impl Inner {
    fn emit(&self, event: MonitorEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    fn is_current(&self, generation: u64, token: &CancellationToken) -> bool {
        self.status.lock().generation == generation && !token.is_cancelled()
    }

    /// `expected` is set by a retry timer: the retry only proceeds if nothing
    /// else connected or disconnected since it was scheduled.
    fn connect(self: &Arc<Self>, expected: Option<u64>) {
        if self.store.is_terminal() {
            info!(run_id = %self.location.run_id, "run already finished; not connecting");
            return;
        }
        let (token, generation) = {
            let mut st = self.status.lock();
            if expected.is_some_and(|g| g != st.generation) {
                return;
            }
            if let Some(prev) = st.stream.take() {
                prev.cancel();
            }
            if let Some(timer) = st.retry.take() {
                timer.cancel();
            }
            st.generation += 1;
            st.state = ConnectionState::Connecting;
            let token = CancellationToken::new();
            st.stream = Some(token.clone());
            (token, st.generation)
        };
        tokio::spawn(self.clone().run_stream(generation, token));
    }

    async fn run_stream(self: Arc<Self>, generation: u64, token: CancellationToken) {
        let connection_id = Uuid::new_v4().to_string();
        let result = tokio::select! {
            _ = token.cancelled() => {
                debug!(%connection_id, "stream cancelled");
                return;
            }
            r = self.stream_once(generation, &token, &connection_id) => r,
        };
        if token.is_cancelled() {
            return;
        }
        match result {
            Ok(StreamEnd::Completed(status)) => {
                self.finish(generation);
                info!(run_id = %self.location.run_id, ?status, "run finished; stream closed");
                self.emit(MonitorEvent::Completed { status });
            }
            Ok(StreamEnd::Closed) => {
                self.finish(generation);
                info!(run_id = %self.location.run_id, %connection_id, "stream ended");
                self.emit(MonitorEvent::Disconnected);
            }
            Err(e) => self.on_failure(generation, e),
        }
    }

    async fn stream_once(
        self: &Arc<Self>,
        generation: u64,
        token: &CancellationToken,
        connection_id: &str,
    ) -> Result<StreamEnd, SyncError> {
        let mut body = self.backend.open_stream(&self.location).await?;
        {
            let mut st = self.status.lock();
            // a disconnect or newer connect may have landed while the open was completing
            if st.generation != generation || token.is_cancelled() {
                debug!(%connection_id, "opened stream was superseded; dropping it");
                return Ok(StreamEnd::Closed);
            }
            st.connected = true;
            st.attempts = 0;
            st.state = ConnectionState::Streaming;
            st.last_error = None;
        }
        info!(run_id = %self.location.run_id, %connection_id, "stream connected");
        self.emit(MonitorEvent::Connected { connection_id: connection_id.to_string() });

        let mut parser = FrameParser::new(self.format.clone());
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for frame in parser.feed(&chunk) {
                if !self.is_current(generation, token) {
                    return Ok(StreamEnd::Closed);
                }
                if let Some(end) = self.handle_frame(frame) {
                    return Ok(end);
                }
            }
        }
        for frame in parser.finish() {
            if !self.is_current(generation, token) {
                return Ok(StreamEnd::Closed);
            }
            if let Some(end) = self.handle_frame(frame) {
                return Ok(end);
            }
        }
        Ok(StreamEnd::Closed)
    }

    fn handle_frame(self: &Arc<Self>, frame: Frame) -> Option<StreamEnd> {
        let frame_type = frame.kind.clone();
        match self.router.dispatch(&self.store, frame) {
            Ok(RouteOutcome::Merged) => {
                if frame_type == "initial" {
                    self.spawn_self_heal();
                }
                self.emit(MonitorEvent::Updated { frame_type });
                None
            }
            Ok(RouteOutcome::Ignored) => None,
            Ok(RouteOutcome::RunEvent(payload)) => {
                let refresher = self.refresher.clone();
                let events = self.events.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        r = refresher.on_run_event(&payload) => {
                            if let Ok(true) = r {
                                let _ = events.send(MonitorEvent::Updated { frame_type: "tree_viz".into() });
                            }
                        }
                    }
                });
                None
            }
            Ok(RouteOutcome::ServerError(e)) => {
                warn!(run_id = %self.location.run_id, error = %e, "server reported an error");
                self.status.lock().last_error = Some(e.clone());
                self.emit(MonitorEvent::StreamError(e));
                None
            }
            Ok(RouteOutcome::Completed(status)) => Some(StreamEnd::Completed(status)),
            Err(e) => {
                warn!(%frame_type, error = %e, "skipping frame");
                None
            }
        }
    }

    fn spawn_self_heal(&self) {
        let refresher = self.refresher.clone();
        let events = self.events.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                r = refresher.self_heal() => {
                    if let Ok(true) = r {
                        let _ = events.send(MonitorEvent::Updated { frame_type: "tree_viz".into() });
                    }
                }
            }
        });
    }

    fn finish(&self, generation: u64) {
        let mut st = self.status.lock();
        if st.generation == generation {
            st.state = ConnectionState::Idle;
            st.connected = false;
            st.stream = None;
        }
    }

    fn on_failure(self: &Arc<Self>, generation: u64, err: SyncError) {
        let mut st = self.status.lock();
        if st.generation != generation {
            return;
        }
        st.connected = false;
        st.stream = None;
        st.last_error = Some(err.clone());

        if err.is_fatal() {
            st.state = ConnectionState::Failed;
            drop(st);
            error!(run_id = %self.location.run_id, error = %err, "stream failed permanently");
            self.emit(MonitorEvent::Terminal(err));
            return;
        }
        if self.store.is_terminal() {
            st.state = ConnectionState::Idle;
            drop(st);
            info!(run_id = %self.location.run_id, error = %err, "stream dropped after run finished; not reconnecting");
            self.emit(MonitorEvent::Disconnected);
            return;
        }

        match backoff::next_retry(st.attempts, &self.reconnect) {
            Some(delay_ms) => {
                st.attempts += 1;
                st.state = ConnectionState::Reconnecting;
                let attempt = st.attempts;
                let timer = CancellationToken::new();
                st.retry = Some(timer.clone());
                drop(st);

                warn!(run_id = %self.location.run_id, error = %err, attempt, delay_ms, "stream failed; reconnecting");
                self.emit(MonitorEvent::StreamError(err));
                self.emit(MonitorEvent::ReconnectScheduled { attempt, delay_ms });

                let inner = self.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = timer.cancelled() => {}
                        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => inner.connect(Some(generation)),
                    }
                });
            }
            None => {
                st.state = ConnectionState::Failed;
                let terminal = SyncError::Terminal { attempts: st.attempts };
                st.last_error = Some(terminal.clone());
                drop(st);

                error!(run_id = %self.location.run_id, error = %err, "giving up on stream");
                self.emit(MonitorEvent::StreamError(err));
                self.emit(MonitorEvent::Terminal(terminal));
            }
        }
    }
}
