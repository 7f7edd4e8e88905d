use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use reqwest::{header, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::{ClientCfg, EndpointCfg},
    error::SyncError,
    types::{ArtifactMetadata, TreeVizItem},
};

pub type ByteStream = BoxStream<'static, Result<Bytes, SyncError>>;

/// A run id resolved to the session that owns it. Every other endpoint needs both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLocation {
    pub run_id: String,
    #[serde(alias = "conversation_id", alias = "session_id")]
    pub owning_session_id: String,
}

/// The remote side of a run: snapshot lookup, event stream and side channels.
#[async_trait]
pub trait RunBackend: Send + Sync {
    async fn resolve_run(&self, run_id: &str) -> Result<RunLocation, SyncError>;
    async fn open_stream(&self, loc: &RunLocation) -> Result<ByteStream, SyncError>;
    async fn stop_run(&self, loc: &RunLocation) -> Result<(), SyncError>;
    async fn fetch_tree_viz(&self, loc: &RunLocation) -> Result<Vec<TreeVizItem>, SyncError>;
    async fn fetch_artifacts(&self, loc: &RunLocation) -> Result<Vec<ArtifactMetadata>, SyncError>;
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    cfg: ClientCfg,
}

impl HttpBackend {
    pub fn new(cfg: ClientCfg) -> Result<Self, SyncError> {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = cfg.token.as_deref() {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                .map_err(|e| SyncError::Config(format!("invalid token header: {e}")))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        // no client-wide timeout: it would also cut off the long-lived stream body
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self { client, cfg })
    }

    fn url(&self, template: &str, loc: &RunLocation) -> String {
        let path = EndpointCfg::render(template, &loc.run_id, &loc.owning_session_id);
        format!("{}{}", self.cfg.base_url.trim_end_matches('/'), path)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.request_timeout_ms)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, SyncError> {
        let resp = self.client.get(&url).timeout(self.request_timeout()).send().await?;
        let resp = check_status(resp)?;
        resp.json::<T>()
            .await
            .map_err(|e| SyncError::Protocol(format!("unexpected body from {url}: {e}")))
    }
}

/// 401 anywhere means the session is gone; everything else non-2xx is a plain failure.
fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, SyncError> {
    match resp.status() {
        StatusCode::UNAUTHORIZED => Err(SyncError::Auth),
        s if s.is_success() => Ok(resp),
        s => Err(SyncError::Connection {
            message: format!("{} returned {s}", resp.url().path()),
            status: Some(s.as_u16()),
        }),
    }
}

#[async_trait]
impl RunBackend for HttpBackend {
    async fn resolve_run(&self, run_id: &str) -> Result<RunLocation, SyncError> {
        let path = EndpointCfg::render(&self.cfg.endpoints.resolve, run_id, "");
        let url = format!("{}{}", self.cfg.base_url.trim_end_matches('/'), path);
        debug!(%run_id, %url, "resolving run");
        let resp = self.client.get(&url).timeout(self.request_timeout()).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound { run_id: run_id.to_string() });
        }
        let resp = check_status(resp)?;
        resp.json::<RunLocation>()
            .await
            .map_err(|e| SyncError::Protocol(format!("unexpected run lookup body: {e}")))
    }

    async fn open_stream(&self, loc: &RunLocation) -> Result<ByteStream, SyncError> {
        let url = self.url(&self.cfg.endpoints.stream, loc);
        let resp = self
            .client
            .get(&url)
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .send()
            .await?;
        let resp = check_status(resp)?;
        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| SyncError::connection(format!("stream read failed: {e}"))))
            .boxed())
    }

    async fn stop_run(&self, loc: &RunLocation) -> Result<(), SyncError> {
        let url = self.url(&self.cfg.endpoints.stop, loc);
        let resp = self
            .client
            .post(&url)
            .timeout(self.request_timeout())
            .send()
            .await
            .map_err(|e| SyncError::action(format!("stop request failed: {e}")))?;
        match resp.status() {
            StatusCode::UNAUTHORIZED => Err(SyncError::Auth),
            s if s.is_success() => Ok(()),
            s => {
                let body = resp.text().await.unwrap_or_default();
                Err(SyncError::Action {
                    message: if body.is_empty() { format!("stop returned {s}") } else { body },
                    code: Some(s.as_u16().to_string()),
                })
            }
        }
    }

    async fn fetch_tree_viz(&self, loc: &RunLocation) -> Result<Vec<TreeVizItem>, SyncError> {
        self.get_json(self.url(&self.cfg.endpoints.tree_viz, loc)).await
    }

    async fn fetch_artifacts(&self, loc: &RunLocation) -> Result<Vec<ArtifactMetadata>, SyncError> {
        self.get_json(self.url(&self.cfg.endpoints.artifacts, loc)).await
    }
}
