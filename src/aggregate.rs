//! The run-detail aggregate and the merge rules applied to it.
//!
//! `run` is a periodic full snapshot and is replaced; the progress, log and
//! artifact sequences are deltas and only ever grow. Nothing here replaces the
//! whole aggregate except an `initial` snapshot.

use parking_lot::RwLock;

use crate::types::{
    ArtifactMetadata, BestNodeSelection, LogEntry, PaperGenerationEvent, RunDetail, RunInfo, RunStatus,
    StageProgressEntry, SubstageEvent, TreeVizItem,
};

/// Shared, lock-protected aggregate. Every reader sees whole merges, never half of one.
#[derive(Debug, Default)]
pub struct RunStore {
    detail: RwLock<RunDetail>,
    max_logs: Option<usize>,
}

impl RunStore {
    pub fn new(max_logs: Option<usize>) -> Self {
        Self { detail: RwLock::new(RunDetail::default()), max_logs }
    }

    pub fn max_logs(&self) -> Option<usize> {
        self.max_logs
    }

    pub fn snapshot(&self) -> RunDetail {
        self.detail.read().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&RunDetail) -> R) -> R {
        f(&self.detail.read())
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut RunDetail) -> R) -> R {
        f(&mut self.detail.write())
    }

    pub fn is_terminal(&self) -> bool {
        self.read(RunDetail::is_terminal)
    }

    pub fn status(&self) -> Option<RunStatus> {
        self.read(RunDetail::status)
    }
}

/// Wholesale replacement from an `initial` frame.
///
/// For the same run the status still cannot go backwards, and a tree
/// visualization fetched earlier survives a snapshot that does not carry one.
pub fn apply_initial(detail: &mut RunDetail, mut snapshot: RunDetail) {
    if let (Some(current), Some(next)) = (detail.run.as_ref(), snapshot.run.as_mut()) {
        if current.id == next.id {
            next.status = current.status.advance(next.status);
            if snapshot.tree_viz.is_none() {
                snapshot.tree_viz = detail.tree_viz.take();
            }
        }
    }
    *detail = snapshot;
}

pub fn replace_run(detail: &mut RunDetail, mut run: RunInfo) {
    if let Some(current) = detail.run.as_ref() {
        run.status = current.status.advance(run.status);
    }
    detail.run = Some(run);
}

pub fn push_stage_progress(detail: &mut RunDetail, entry: StageProgressEntry) {
    detail.stage_progress.push(entry);
}

/// Newest first; trims the oldest entries past `max_logs`.
pub fn prepend_log(detail: &mut RunDetail, entry: LogEntry, max_logs: Option<usize>) {
    detail.logs.insert(0, entry);
    if let Some(max) = max_logs {
        detail.logs.truncate(max);
    }
}

pub fn push_artifact(detail: &mut RunDetail, artifact: ArtifactMetadata) {
    detail.artifacts.push(artifact);
}

pub fn push_paper_generation(detail: &mut RunDetail, event: PaperGenerationEvent) {
    detail.paper_generation_progress.push(event);
}

pub fn push_substage_event(detail: &mut RunDetail, event: SubstageEvent) {
    detail.substage_events.push(event);
}

pub fn push_best_node(detail: &mut RunDetail, selection: BestNodeSelection) {
    detail.best_node_selections.push(selection);
}

/// Returns the status actually stored. A run that was never populated gets a
/// placeholder so the terminal state is still observable.
pub fn set_terminal_status(detail: &mut RunDetail, status: RunStatus) -> RunStatus {
    let run = detail.run.get_or_insert_with(RunInfo::default);
    run.status = run.status.advance(status);
    run.status
}

pub fn set_tree_viz(detail: &mut RunDetail, items: Vec<TreeVizItem>) {
    detail.tree_viz = Some(items);
}

/// The artifact list from the server is authoritative over what the stream appended.
pub fn replace_artifacts(detail: &mut RunDetail, artifacts: Vec<ArtifactMetadata>) {
    detail.artifacts = artifacts;
}
