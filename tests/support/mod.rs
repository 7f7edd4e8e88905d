//! A small axum run server: resolve, event stream, stop and the two
//! sub-resources. Each stream connection is scripted from the test.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use runtail::{ClientCfg, MonitorEvent, ReconnectCfg};

pub const RUN_ID: &str = "run-42";
pub const SESSION_ID: &str = "conv-7";

type Chunk = Result<Bytes, std::io::Error>;

enum Plan {
    Status(StatusCode),
    Open(mpsc::UnboundedReceiver<Chunk>),
}

#[derive(Default)]
struct Shared {
    plans: Mutex<VecDeque<Plan>>,
    unauthorized: AtomicBool,
    stream_hits: AtomicUsize,
    stop_hits: AtomicUsize,
    tree_hits: AtomicUsize,
    artifact_hits: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct FakeRunServer {
    shared: Arc<Shared>,
}

/// Writing end of one scripted stream connection, `data:` framed.
pub struct Feed {
    tx: mpsc::UnboundedSender<Chunk>,
}

impl Feed {
    pub fn raw(&self, text: &str) {
        let _ = self.tx.send(Ok(Bytes::from(text.to_string())));
    }

    pub fn send(&self, kind: &str, data: Value) {
        self.raw(&format!("data: {}\n\n", json!({ "type": kind, "data": data })));
    }

    /// Aborts the response body mid-stream.
    pub fn break_connection(&self) {
        let _ = self.tx.send(Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")));
    }
}

impl FakeRunServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next stream connection answers with `status` and no body.
    pub fn refuse_next(&self, status: StatusCode) {
        self.shared.plans.lock().push_back(Plan::Status(status));
    }

    /// Next stream connection stays open until the returned feed is dropped.
    pub fn open_next(&self) -> Feed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.plans.lock().push_back(Plan::Open(rx));
        Feed { tx }
    }

    pub fn revoke_auth(&self) {
        self.shared.unauthorized.store(true, Ordering::SeqCst);
    }

    pub fn stream_hits(&self) -> usize {
        self.shared.stream_hits.load(Ordering::SeqCst)
    }

    pub fn stop_hits(&self) -> usize {
        self.shared.stop_hits.load(Ordering::SeqCst)
    }

    pub fn tree_hits(&self) -> usize {
        self.shared.tree_hits.load(Ordering::SeqCst)
    }

    pub fn artifact_hits(&self) -> usize {
        self.shared.artifact_hits.load(Ordering::SeqCst)
    }

    fn unauthorized(&self) -> bool {
        self.shared.unauthorized.load(Ordering::SeqCst)
    }

    /// Binds an ephemeral port and returns the base url.
    pub async fn spawn(&self) -> String {
        let app = Router::new()
            .route("/run/{run_id}", get(resolve))
            .route("/sessions/{session_id}/runs/{run_id}/events", get(events))
            .route("/sessions/{session_id}/runs/{run_id}/stop", post(stop))
            .route("/sessions/{session_id}/runs/{run_id}/tree-viz", get(tree_viz))
            .route("/sessions/{session_id}/runs/{run_id}/artifacts", get(artifacts))
            .with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fake server");
        });
        format!("http://{addr}")
    }
}

fn api_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn resolve(State(srv): State<FakeRunServer>, Path(run_id): Path<String>) -> Response {
    if srv.unauthorized() {
        return api_error(StatusCode::UNAUTHORIZED, "session expired");
    }
    if run_id != RUN_ID {
        return api_error(StatusCode::NOT_FOUND, "run not found");
    }
    Json(json!({ "run_id": RUN_ID, "conversation_id": SESSION_ID })).into_response()
}

async fn events(State(srv): State<FakeRunServer>, Path((session_id, run_id)): Path<(String, String)>) -> Response {
    srv.shared.stream_hits.fetch_add(1, Ordering::SeqCst);
    if srv.unauthorized() {
        return api_error(StatusCode::UNAUTHORIZED, "session expired");
    }
    if session_id != SESSION_ID || run_id != RUN_ID {
        return api_error(StatusCode::NOT_FOUND, "run not found");
    }
    let plan = srv.shared.plans.lock().pop_front();
    match plan {
        Some(Plan::Status(status)) => api_error(status, "stream unavailable"),
        Some(Plan::Open(rx)) => (
            [(header::CONTENT_TYPE, "text/event-stream"), (header::CACHE_CONTROL, "no-cache")],
            Body::from_stream(UnboundedReceiverStream::new(rx)),
        )
            .into_response(),
        None => api_error(StatusCode::SERVICE_UNAVAILABLE, "no stream scripted"),
    }
}

async fn stop(State(srv): State<FakeRunServer>) -> Response {
    srv.shared.stop_hits.fetch_add(1, Ordering::SeqCst);
    if srv.unauthorized() {
        return api_error(StatusCode::UNAUTHORIZED, "session expired");
    }
    tokio::time::sleep(Duration::from_millis(30)).await;
    Json(json!({ "status": "stopping" })).into_response()
}

async fn tree_viz(State(srv): State<FakeRunServer>) -> Json<Value> {
    srv.shared.tree_hits.fetch_add(1, Ordering::SeqCst);
    Json(json!([{ "id": 3, "stage_id": "stage_2_baseline", "viz": { "nodes": 12 } }]))
}

async fn artifacts(State(srv): State<FakeRunServer>) -> Json<Value> {
    srv.shared.artifact_hits.fetch_add(1, Ordering::SeqCst);
    Json(json!([{ "id": 11, "artifact_type": "plot", "filename": "tree.png" }]))
}

pub fn client_cfg(base_url: String) -> ClientCfg {
    ClientCfg {
        base_url,
        token: Some("tok".into()),
        reconnect: ReconnectCfg { base_delay_ms: 10, max_delay_ms: 200, max_attempts: 5, jitter_ms: 0 },
        ..Default::default()
    }
}

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
