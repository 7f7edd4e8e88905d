use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::SyncError;

/// Wire convention used by a stream endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameFormat {
    /// One JSON object per line.
    JsonLines,
    /// Records of prefixed lines separated by a blank line; the prefix is stripped.
    Prefixed { prefix: String },
}

impl FrameFormat {
    pub fn event_stream() -> Self {
        Self::Prefixed { prefix: "data:".into() }
    }
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self::event_stream()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectCfg {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub jitter_ms: u64,
}

impl Default for ReconnectCfg {
    fn default() -> Self {
        Self { base_delay_ms: 1_000, max_delay_ms: 30_000, max_attempts: 5, jitter_ms: 0 }
    }
}

/// Path templates; `{run_id}` and `{session_id}` are substituted per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointCfg {
    pub resolve: String,
    pub stream: String,
    pub stop: String,
    pub tree_viz: String,
    pub artifacts: String,
}

impl Default for EndpointCfg {
    fn default() -> Self {
        Self {
            resolve: "/run/{run_id}".into(),
            stream: "/sessions/{session_id}/runs/{run_id}/events".into(),
            stop: "/sessions/{session_id}/runs/{run_id}/stop".into(),
            tree_viz: "/sessions/{session_id}/runs/{run_id}/tree-viz".into(),
            artifacts: "/sessions/{session_id}/runs/{run_id}/artifacts".into(),
        }
    }
}

impl EndpointCfg {
    pub fn render(template: &str, run_id: &str, session_id: &str) -> String {
        template.replace("{run_id}", run_id).replace("{session_id}", session_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientCfg {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub frame_format: FrameFormat,
    pub reconnect: ReconnectCfg,
    pub endpoints: EndpointCfg,
    pub request_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_logs: Option<usize>,
    pub broadcast_capacity: usize,
}

impl Default for ClientCfg {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".into(),
            token: None,
            frame_format: FrameFormat::default(),
            reconnect: ReconnectCfg::default(),
            endpoints: EndpointCfg::default(),
            request_timeout_ms: 15_000,
            max_logs: None,
            broadcast_capacity: 256,
        }
    }
}

impl ClientCfg {
    /// Reads a YAML config file, then applies env overrides.
    pub async fn load(path: &Path) -> Result<Self, SyncError> {
        let txt = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SyncError::Config(format!("failed to read {}: {e}", path.display())))?;
        let cfg: ClientCfg = serde_yaml::from_str(&txt)
            .map_err(|e| SyncError::Config(format!("failed to parse {}: {e}", path.display())))?;
        cfg.with_env_overrides().validated()
    }

    pub fn from_env() -> Result<Self, SyncError> {
        Self::default().with_env_overrides().validated()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("RUNTAIL_BASE_URL") {
            if !url.trim().is_empty() {
                self.base_url = url.trim().to_string();
            }
        }
        if let Ok(token) = std::env::var("RUNTAIL_TOKEN") {
            if !token.trim().is_empty() {
                self.token = Some(token.trim().to_string());
            }
        }
        self
    }

    pub fn validated(self) -> Result<Self, SyncError> {
        if self.base_url.trim().is_empty() {
            return Err(SyncError::Config("base_url must not be empty".into()));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(SyncError::Config("reconnect.base_delay_ms must be greater than 0".into()));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(SyncError::Config("reconnect.max_delay_ms must be >= base_delay_ms".into()));
        }
        if let FrameFormat::Prefixed { prefix } = &self.frame_format {
            if prefix.is_empty() {
                return Err(SyncError::Config("frame_format.prefix must not be empty".into()));
            }
        }
        if self.broadcast_capacity == 0 {
            return Err(SyncError::Config("broadcast_capacity must be greater than 0".into()));
        }
        Ok(self)
    }
}
