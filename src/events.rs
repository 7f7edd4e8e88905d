use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::SyncError, types::RunStatus};

/// One logical `{type, data}` unit cut out of the byte stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self { kind: kind.into(), data }
    }
}

/// Payload of a `run_event` frame. Only the subtype tag is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEventPayload {
    #[serde(alias = "type")]
    pub event_type: String,
    #[serde(default)]
    pub metadata: Value,
}

pub const TREE_VIZ_STORED: &str = "tree_viz_stored";

/// Body of a `complete` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CompletePayload {
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub success: Option<bool>,
}

impl CompletePayload {
    pub fn terminal_status(&self) -> RunStatus {
        match (self.status, self.success) {
            (Some(s), _) if s.is_terminal() => s,
            (_, Some(false)) => RunStatus::Failed,
            _ => RunStatus::Completed,
        }
    }
}

/// Body of an `error` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerErrorPayload {
    #[serde(alias = "error")]
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

/// What consumers of a monitor are told about.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Connected { connection_id: String },
    Disconnected,
    Updated { frame_type: String },
    StreamError(SyncError),
    ReconnectScheduled { attempt: u32, delay_ms: u64 },
    Terminal(SyncError),
    Completed { status: RunStatus },
    ActionFailed(SyncError),
}
