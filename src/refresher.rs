use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tracing::{debug, info, warn};

use crate::{
    aggregate::{self, RunStore},
    api::{RunBackend, RunLocation},
    error::SyncError,
    events::{RunEventPayload, TREE_VIZ_STORED},
    types::RunDetail,
};

/// Fetches sub-resources that are too large to ride the stream.
///
/// The server only signals that a tree visualization was stored; the payload is
/// fetched here and merged into the aggregate, along with a best-effort refresh
/// of the artifact list it usually comes with.
pub struct Refresher {
    backend: Arc<dyn RunBackend>,
    store: Arc<RunStore>,
    location: RunLocation,
    healed: AtomicBool,
}

/// Releases the self-heal latch unless the fetch ran to completion, so a
/// cancelled attempt does not use up the only one.
struct HealAttempt<'a> {
    healed: &'a AtomicBool,
    finished: bool,
}

impl Drop for HealAttempt<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.healed.store(false, Ordering::Release);
        }
    }
}

impl Refresher {
    pub fn new(backend: Arc<dyn RunBackend>, store: Arc<RunStore>, location: RunLocation) -> Self {
        Self { backend, store, location, healed: AtomicBool::new(false) }
    }

    /// Returns whether the event triggered a fetch. The artifact refresh is
    /// attempted even when the tree fetch failed; the tree error is returned.
    pub async fn on_run_event(&self, payload: &RunEventPayload) -> Result<bool, SyncError> {
        if payload.event_type != TREE_VIZ_STORED {
            debug!(event_type = %payload.event_type, "run event needs no refresh");
            return Ok(false);
        }
        let tree = self.fetch_tree_viz().await;
        match self.backend.fetch_artifacts(&self.location).await {
            Ok(artifacts) => {
                let n = artifacts.len();
                self.store.update(|d| aggregate::replace_artifacts(d, artifacts));
                debug!(artifacts = n, "artifact list refreshed");
            }
            Err(e) => warn!(run_id = %self.location.run_id, error = %e, "artifact refresh failed"),
        }
        tree.map(|_| true)
    }

    /// One fetch per aggregate lifetime for a stream that joined after the
    /// `tree_viz_stored` signal was already sent.
    pub async fn self_heal(&self) -> Result<bool, SyncError> {
        if !self.store.read(RunDetail::needs_tree_viz) {
            return Ok(false);
        }
        if self.healed.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        let mut attempt = HealAttempt { healed: &self.healed, finished: false };
        info!(run_id = %self.location.run_id, "tree visualization missing; fetching once");
        let result = self.fetch_tree_viz().await;
        attempt.finished = true;
        result.map(|_| true)
    }

    async fn fetch_tree_viz(&self) -> Result<(), SyncError> {
        let items = self.backend.fetch_tree_viz(&self.location).await.map_err(|e| {
            warn!(run_id = %self.location.run_id, error = %e, "tree visualization fetch failed");
            e
        })?;
        self.store.update(|d| aggregate::set_tree_viz(d, items));
        Ok(())
    }
}
