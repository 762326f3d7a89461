use std::path::PathBuf;

use tokio::sync::broadcast;

use crate::cache::PipelineStage;
use crate::digest::Digest;

/// Shared fields every event carries.
#[derive(Clone, Debug)]
pub struct EventMeta {
    pub path: PathBuf,
    pub digest: Option<Digest>,
    pub at: u64,
}

/// Everything the core can report about pipeline and cache activity. A
/// single flat enum, not per-component channels: subscribers filter by
/// matching rather than juggling multiple streams.
#[derive(Clone, Debug)]
pub enum CoreEvent {
    TaskStageChanged { meta: EventMeta, stage: PipelineStage },
    TaskCompleted { meta: EventMeta },
    /// `stage` is the stage that was executing (or most recently entered)
    /// when the failure happened; `error_kind` is `CoreError::kind()`'s
    /// message-independent classification.
    TaskErrored { meta: EventMeta, stage: PipelineStage, error_kind: &'static str, reason: String },
    FileMissing { meta: EventMeta },
    AlreadyProcessed { meta: EventMeta },
    WindowPaused { at: u64 },
    WindowResumed { at: u64 },
    CacheHintCleared { digests: Vec<Digest> },
    CacheEntryEvicted { digest: Digest },
    PoolStatsChanged { queued: usize, running: usize },
}

/// In-process broadcast bus (component C7): a single `broadcast::Sender`
/// shared by every publisher, many independent subscribers, at-least-once
/// delivery. A publish with no subscribers is not an error — it's simply
/// dropped.
#[derive(Debug)]
pub struct InProcEventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: CoreEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }
}
