use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Lifecycle of a run. Ordered: a run only ever moves to a higher rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    fn rank(self) -> u8 {
        match self {
            RunStatus::Pending => 0,
            RunStatus::Running => 1,
            RunStatus::Completed | RunStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Picks the status to keep when `next` arrives while `self` is current.
    pub fn advance(self, next: RunStatus) -> RunStatus {
        if next.rank() >= self.rank() && !self.is_terminal() { next } else { self }
    }
}

/// Accepts RFC 3339 as well as offset-less ISO timestamps (read as UTC).
fn lenient_ts<'de, D>(de: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(de)?;
    Ok(raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|n| n.and_utc())
            })
    }))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunInfo {
    #[serde(alias = "run_id")]
    pub id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub gpu_type: Option<String>,
    #[serde(default)]
    pub pod_id: Option<String>,
    #[serde(default)]
    pub pod_name: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default, deserialize_with = "lenient_ts")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub heartbeat_failures: u32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default, deserialize_with = "lenient_ts")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_ts")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_ts")]
    pub start_deadline_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProgressEntry {
    pub stage: String,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub max_iterations: u32,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub total_nodes: u32,
    #[serde(default)]
    pub good_nodes: u32,
    #[serde(default)]
    pub buggy_nodes: u32,
    #[serde(default)]
    pub best_metric: Option<String>,
    #[serde(default)]
    pub eta_s: Option<i64>,
    #[serde(default)]
    pub latest_iteration_time_s: Option<f64>,
    #[serde(default, deserialize_with = "lenient_ts")]
    pub created_at: Option<DateTime<Utc>>,
}

impl StageProgressEntry {
    pub fn clamped_progress(&self) -> f64 {
        self.progress.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub level: String,
    pub message: String,
    #[serde(default, alias = "timestamp", deserialize_with = "lenient_ts")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub id: i64,
    pub artifact_type: String,
    pub filename: String,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_ts")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub download_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperGenerationEvent {
    #[serde(default)]
    pub id: i64,
    pub step: String,
    #[serde(default)]
    pub substep: Option<String>,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub step_progress: f64,
    #[serde(default)]
    pub details: Option<Value>,
    #[serde(default, deserialize_with = "lenient_ts")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstageEvent {
    #[serde(default)]
    pub id: i64,
    pub stage: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub summary: Value,
    #[serde(default, deserialize_with = "lenient_ts")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestNodeSelection {
    #[serde(default)]
    pub id: i64,
    pub stage: String,
    pub node_id: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, deserialize_with = "lenient_ts")]
    pub created_at: Option<DateTime<Utc>>,
}

/// One stored tree visualization; the payload is opaque to this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeVizItem {
    #[serde(default)]
    pub id: i64,
    pub stage_id: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub viz: Value,
    #[serde(default, deserialize_with = "lenient_ts")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_ts")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Everything known about one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RunDetail {
    pub run: Option<RunInfo>,
    pub stage_progress: Vec<StageProgressEntry>,
    pub logs: Vec<LogEntry>,
    pub artifacts: Vec<ArtifactMetadata>,
    pub paper_generation_progress: Vec<PaperGenerationEvent>,
    pub substage_events: Vec<SubstageEvent>,
    pub best_node_selections: Vec<BestNodeSelection>,
    pub tree_viz: Option<Vec<TreeVizItem>>,
}

impl RunDetail {
    /// Latest stage entry; "current progress" is always the last one received.
    pub fn current_stage(&self) -> Option<&StageProgressEntry> {
        self.stage_progress.last()
    }

    pub fn status(&self) -> Option<RunStatus> {
        self.run.as_ref().map(|r| r.status)
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_some_and(RunStatus::is_terminal)
    }

    pub fn needs_tree_viz(&self) -> bool {
        self.run.is_some() && self.tree_viz.as_ref().map_or(true, Vec::is_empty)
    }
}
