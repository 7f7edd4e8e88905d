use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::{
    aggregate::{self, RunStore},
    error::SyncError,
    events::{CompletePayload, Frame, RunEventPayload, ServerErrorPayload},
    types::{RunDetail, RunStatus},
};

type MergeFn = fn(&mut RunDetail, Value, Option<usize>) -> Result<(), serde_json::Error>;

#[derive(Clone, Copy)]
enum Route {
    Merge(MergeFn),
    RunEvent,
    Complete,
    Error,
    Heartbeat,
}

/// What the connection layer has to do after a frame was routed.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Merged,
    Ignored,
    RunEvent(RunEventPayload),
    ServerError(SyncError),
    Completed(RunStatus),
}

fn decode<T: DeserializeOwned>(data: Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(data)
}

/// Frame-type dispatch table, built once per monitor.
pub struct EventRouter {
    table: HashMap<&'static str, Route>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        let mut table: HashMap<&'static str, Route> = HashMap::new();
        table.insert("initial", Route::Merge(|d, v, _| {
            aggregate::apply_initial(d, decode(v)?);
            Ok(())
        }));
        table.insert("stage_progress", Route::Merge(|d, v, _| {
            aggregate::push_stage_progress(d, decode(v)?);
            Ok(())
        }));
        table.insert("log", Route::Merge(|d, v, max_logs| {
            aggregate::prepend_log(d, decode(v)?, max_logs);
            Ok(())
        }));
        table.insert("artifact", Route::Merge(|d, v, _| {
            aggregate::push_artifact(d, decode(v)?);
            Ok(())
        }));
        table.insert("run_update", Route::Merge(|d, v, _| {
            aggregate::replace_run(d, decode(v)?);
            Ok(())
        }));
        table.insert("paper_generation_progress", Route::Merge(|d, v, _| {
            aggregate::push_paper_generation(d, decode(v)?);
            Ok(())
        }));
        table.insert("substage_event", Route::Merge(|d, v, _| {
            aggregate::push_substage_event(d, decode(v)?);
            Ok(())
        }));
        table.insert("best_node_selection", Route::Merge(|d, v, _| {
            aggregate::push_best_node(d, decode(v)?);
            Ok(())
        }));
        table.insert("run_event", Route::RunEvent);
        table.insert("complete", Route::Complete);
        table.insert("error", Route::Error);
        table.insert("heartbeat", Route::Heartbeat);
        Self { table }
    }

    /// Applies one frame. A payload that does not decode is a `Protocol` error
    /// and leaves the aggregate untouched.
    pub fn dispatch(&self, store: &RunStore, frame: Frame) -> Result<RouteOutcome, SyncError> {
        let Some(route) = self.table.get(frame.kind.as_str()).copied() else {
            debug!(frame_type = %frame.kind, "ignoring unknown frame type");
            return Ok(RouteOutcome::Ignored);
        };
        let kind = frame.kind;
        let protocol = |e: serde_json::Error| SyncError::Protocol(format!("bad {kind} payload: {e}"));
        match route {
            Route::Merge(merge) => {
                // every merge decodes before it mutates, so a bad payload leaves no trace
                let max_logs = store.max_logs();
                store.update(|d| merge(d, frame.data, max_logs)).map_err(protocol)?;
                Ok(RouteOutcome::Merged)
            }
            Route::RunEvent => Ok(RouteOutcome::RunEvent(decode(frame.data).map_err(protocol)?)),
            Route::Complete => {
                let payload = if frame.data.is_null() {
                    CompletePayload::default()
                } else {
                    decode::<CompletePayload>(frame.data).map_err(protocol)?
                };
                let status = store.update(|d| aggregate::set_terminal_status(d, payload.terminal_status()));
                Ok(RouteOutcome::Completed(status))
            }
            Route::Error => {
                let err = match decode::<ServerErrorPayload>(frame.data.clone()) {
                    Ok(p) => SyncError::Server { message: p.message, code: p.code },
                    Err(_) => SyncError::Server { message: frame.data.to_string(), code: None },
                };
                Ok(RouteOutcome::ServerError(err))
            }
            Route::Heartbeat => Ok(RouteOutcome::Ignored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with_run(status: &str) -> RunStore {
        let store = RunStore::new(None);
        let router = EventRouter::new();
        router
            .dispatch(&store, Frame::new("initial", json!({ "run": { "id": "r-1", "status": status } })))
            .unwrap();
        store
    }

    #[test]
    fn log_frame_is_prepended() {
        let store = store_with_run("running");
        let router = EventRouter::new();
        for id in [1, 2] {
            let out = router
                .dispatch(&store, Frame::new("log", json!({ "id": id, "level": "info", "message": "m" })))
                .unwrap();
            assert_eq!(out, RouteOutcome::Merged);
        }
        let ids: Vec<i64> = store.read(|d| d.logs.iter().map(|l| l.id).collect());
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn stage_progress_and_artifacts_append() {
        let store = store_with_run("running");
        let router = EventRouter::new();
        router.dispatch(&store, Frame::new("stage_progress", json!({ "stage": "1_initial", "progress": 0.5 }))).unwrap();
        router.dispatch(&store, Frame::new("stage_progress", json!({ "stage": "2_baseline", "progress": 0.1 }))).unwrap();
        router
            .dispatch(&store, Frame::new("artifact", json!({ "id": 1, "artifact_type": "plot", "filename": "a.png" })))
            .unwrap();
        let detail = store.snapshot();
        assert_eq!(detail.current_stage().map(|s| s.stage.as_str()), Some("2_baseline"));
        assert_eq!(detail.artifacts.len(), 1);
    }

    #[test]
    fn unknown_and_heartbeat_frames_change_nothing() {
        let store = store_with_run("running");
        let before = store.snapshot();
        let router = EventRouter::new();
        assert_eq!(router.dispatch(&store, Frame::new("shiny_new_kind", json!({ "x": 1 }))).unwrap(), RouteOutcome::Ignored);
        assert_eq!(router.dispatch(&store, Frame::new("heartbeat", Value::Null)).unwrap(), RouteOutcome::Ignored);
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn malformed_payload_is_protocol_error_and_not_applied() {
        let store = store_with_run("running");
        let before = store.snapshot();
        let router = EventRouter::new();
        let err = router.dispatch(&store, Frame::new("log", json!({ "level": 3 }))).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn complete_sets_terminal_status() {
        let store = store_with_run("running");
        let router = EventRouter::new();
        let out = router.dispatch(&store, Frame::new("complete", json!({ "status": "completed" }))).unwrap();
        assert_eq!(out, RouteOutcome::Completed(RunStatus::Completed));
        assert!(store.is_terminal());
    }

    #[test]
    fn error_frame_is_surfaced_verbatim() {
        let store = store_with_run("running");
        let router = EventRouter::new();
        let out = router
            .dispatch(&store, Frame::new("error", json!({ "message": "worker lost", "code": "pod_gone" })))
            .unwrap();
        assert_eq!(
            out,
            RouteOutcome::ServerError(SyncError::Server { message: "worker lost".into(), code: Some("pod_gone".into()) })
        );
    }

    #[test]
    fn run_event_is_forwarded_not_merged() {
        let store = store_with_run("running");
        let before = store.snapshot();
        let router = EventRouter::new();
        let out = router
            .dispatch(&store, Frame::new("run_event", json!({ "event_type": "tree_viz_stored", "metadata": {} })))
            .unwrap();
        assert!(matches!(out, RouteOutcome::RunEvent(p) if p.event_type == "tree_viz_stored"));
        assert_eq!(store.snapshot(), before);
    }
}
