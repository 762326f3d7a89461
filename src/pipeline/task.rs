use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::PipelineStage;
use crate::digest::Digest;

/// Finite states a task moves through (spec §3). `Running` carries the
/// stage currently executing so a mid-flight snapshot is observable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    Pending,
    Running(PipelineStage),
    Completed,
    Errored { stage: PipelineStage, error_kind: &'static str, reason: String },
    MissingFile,
    AlreadyProcessed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Errored { .. } | TaskState::MissingFile | TaskState::AlreadyProcessed
        )
    }
}

/// A single file working its way through the pipeline (component C3's unit
/// of work). Identity is the path at submission time; `digest` is filled
/// in once the Hashing stage completes.
#[derive(Clone, Debug)]
pub struct Task {
    pub id: Uuid,
    pub path: PathBuf,
    pub digest: Option<Digest>,
    pub priority: bool,
    /// Bypasses rolling-window backpressure (spec §4.5 force-reprocess).
    pub force: bool,
    pub cancel: CancellationToken,
}

impl Task {
    pub fn new(path: PathBuf) -> Self {
        Self { id: Uuid::new_v4(), path, digest: None, priority: false, force: false, cancel: CancellationToken::new() }
    }

    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}
