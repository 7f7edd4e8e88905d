//! In-memory `RunBackend` for unit tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    api::{ByteStream, RunBackend, RunLocation},
    error::SyncError,
    events::MonitorEvent,
    types::{ArtifactMetadata, RunDetail, RunInfo, RunStatus, TreeVizItem},
};

pub fn loc() -> RunLocation {
    RunLocation { run_id: "r-1".into(), owning_session_id: "s-1".into() }
}

pub fn running_detail() -> RunDetail {
    RunDetail {
        run: Some(RunInfo { id: "r-1".into(), status: RunStatus::Running, ..Default::default() }),
        ..Default::default()
    }
}

/// Writing end of one fake stream connection.
pub struct StreamFeed {
    tx: mpsc::UnboundedSender<Result<Bytes, SyncError>>,
}

impl StreamFeed {
    pub fn raw(&self, text: &str) {
        let _ = self.tx.send(Ok(Bytes::from(text.to_string())));
    }

    /// One json-lines frame.
    pub fn frame(&self, kind: &str, data: Value) {
        self.raw(&format!("{}\n", json!({ "type": kind, "data": data })));
    }

    pub fn fail(&self, message: &str) {
        let _ = self.tx.send(Err(SyncError::connection(message)));
    }
}

pub struct FakeBackend {
    streams: Mutex<VecDeque<Result<ByteStream, SyncError>>>,
    pub opens: AtomicUsize,
    pub stops: AtomicUsize,
    pub tree_fetches: AtomicUsize,
    pub artifact_fetches: AtomicUsize,
    pub stop_delay: Mutex<Duration>,
    /// When set, `open_stream` parks until the gate is notified.
    pub open_gate: Mutex<Option<Arc<Notify>>>,
    pub tree_delay: Mutex<Duration>,
    pub stop_result: Mutex<Result<(), SyncError>>,
    pub tree_viz: Mutex<Result<Vec<TreeVizItem>, SyncError>>,
    pub artifacts: Mutex<Result<Vec<ArtifactMetadata>, SyncError>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        let tree = serde_json::from_value(json!([{ "id": 1, "stage_id": "stage_1", "viz": {} }])).unwrap();
        let artifacts =
            serde_json::from_value(json!([{ "id": 9, "artifact_type": "plot", "filename": "tree.png" }])).unwrap();
        Self {
            streams: Mutex::new(VecDeque::new()),
            opens: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            tree_fetches: AtomicUsize::new(0),
            artifact_fetches: AtomicUsize::new(0),
            stop_delay: Mutex::new(Duration::ZERO),
            open_gate: Mutex::new(None),
            tree_delay: Mutex::new(Duration::ZERO),
            stop_result: Mutex::new(Ok(())),
            tree_viz: Mutex::new(Ok(tree)),
            artifacts: Mutex::new(Ok(artifacts)),
        }
    }

    pub fn push_failure(&self, err: SyncError) {
        self.streams.lock().push_back(Err(err));
    }

    pub fn push_stream(&self) -> StreamFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().push_back(Ok(UnboundedReceiverStream::new(rx).boxed()));
        StreamFeed { tx }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn tree_fetches(&self) -> usize {
        self.tree_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RunBackend for FakeBackend {
    async fn resolve_run(&self, run_id: &str) -> Result<RunLocation, SyncError> {
        if run_id == "r-1" {
            Ok(loc())
        } else {
            Err(SyncError::NotFound { run_id: run_id.to_string() })
        }
    }

    async fn open_stream(&self, _loc: &RunLocation) -> Result<ByteStream, SyncError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let gate = self.open_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.streams
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::connection("no stream queued")))
    }

    async fn stop_run(&self, _loc: &RunLocation) -> Result<(), SyncError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let delay = *self.stop_delay.lock();
        tokio::time::sleep(delay).await;
        self.stop_result.lock().clone()
    }

    async fn fetch_tree_viz(&self, _loc: &RunLocation) -> Result<Vec<TreeVizItem>, SyncError> {
        self.tree_fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.tree_delay.lock();
        tokio::time::sleep(delay).await;
        self.tree_viz.lock().clone()
    }

    async fn fetch_artifacts(&self, _loc: &RunLocation) -> Result<Vec<ArtifactMetadata>, SyncError> {
        self.artifact_fetches.fetch_add(1, Ordering::SeqCst);
        self.artifacts.lock().clone()
    }
}

/// Waits (bounded) for the first event matching `pred`.
pub async fn wait_for(
    rx: &mut broadcast::Receiver<MonitorEvent>,
    pred: impl Fn(&MonitorEvent) -> bool,
) -> MonitorEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(ev) if pred(&ev) => return ev,
                Ok(_) => continue,
                Err(e) => panic!("event channel failed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for monitor event")
}
