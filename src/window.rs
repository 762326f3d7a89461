use std::collections::VecDeque;

use tokio::sync::Mutex;

use crate::cache::CacheStore;
use crate::config::WindowConfig;
use crate::digest::Digest;
use crate::events::{CoreEvent, InProcEventBus};
use crate::pool::{TaskRunner, WorkerPool};
use std::sync::Arc;

/// Pause/resume control the window exerts over intake, decoupled from
/// `WorkerPool<R>`'s generic parameter.
pub trait FlowControl: Send + Sync {
    fn pause(&self);
    fn resume(&self);
}

impl<R: TaskRunner + 'static> FlowControl for WorkerPool<R> {
    fn pause(&self) {
        WorkerPool::pause(self)
    }

    fn resume(&self) {
        WorkerPool::resume(self)
    }
}

#[derive(Default)]
struct State {
    ready: VecDeque<Digest>,
    consumed_total: u64,
    paused: bool,
    /// Acknowledged digests since the last pause, and entries consumed
    /// while paused waiting to be forwarded as a `CacheStore.delete_many`
    /// hint once resume fires (spec §4.5).
    since_pause: u64,
    purge_on_resume: Vec<Digest>,
}

#[derive(Clone, Copy, Debug)]
pub struct WindowStatus {
    pub ready: usize,
    pub consumed_total: u64,
    pub paused: bool,
}

/// Rolling-window backpressure (component C5): caps how many completed,
/// unconsumed artifacts accumulate before intake pauses, and resumes once
/// the downstream consumer has drained enough of them. Pause/resume
/// transitions are edge-triggered — the event fires only when crossing
/// the watermark, never on every push/consume.
///
/// Pauses at `min_queue_buffer` (the soft watermark), ahead of the pool's
/// own hard `max_ready_items` cap, so the hard cap is never actually hit
/// in practice — `force`-flagged submissions are the only thing meant to
/// bypass either gate (spec §4.4/§4.5).
pub struct RollingWindow {
    config: WindowConfig,
    state: Mutex<State>,
    flow: Arc<dyn FlowControl>,
    events: Arc<InProcEventBus>,
    store: Arc<CacheStore>,
}

impl std::fmt::Debug for RollingWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollingWindow").field("config", &self.config).finish()
    }
}

impl RollingWindow {
    pub fn new(
        config: WindowConfig,
        flow: Arc<dyn FlowControl>,
        events: Arc<InProcEventBus>,
        store: Arc<CacheStore>,
    ) -> Self {
        Self { config, state: Mutex::new(State::default()), flow, events, store }
    }

    /// Called when a task completes: the digest becomes a ready,
    /// unconsumed artifact. May trigger a pause.
    pub async fn push_ready(&self, digest: Digest, at: u64) {
        let mut state = self.state.lock().await;
        state.ready.push_back(digest);

        if !state.paused && state.ready.len() >= self.config.min_queue_buffer {
            state.paused = true;
            self.flow.pause();
            self.events.publish(CoreEvent::WindowPaused { at });
        }
    }

    /// Downstream consumer acknowledges `digest`. Forwards a cache-hint
    /// deletion (spec §4.5) and may trigger a resume once the
    /// consumed-since-pause counter reaches `resume_threshold`.
    pub async fn mark_consumed(&self, digest: &Digest, at: u64) -> bool {
        let mut state = self.state.lock().await;
        let Some(pos) = state.ready.iter().position(|d| d == digest) else {
            return false;
        };
        state.ready.remove(pos);
        state.consumed_total += 1;

        if state.paused {
            state.since_pause += 1;
            state.purge_on_resume.push(digest.clone());
        }

        let should_resume = state.paused && state.since_pause >= self.config.resume_threshold as u64;
        let purged = if should_resume {
            state.paused = false;
            state.since_pause = 0;
            std::mem::take(&mut state.purge_on_resume)
        } else {
            Vec::new()
        };
        drop(state);

        self.events.publish(CoreEvent::CacheHintCleared { digests: vec![digest.clone()] });
        if should_resume {
            if !purged.is_empty() {
                self.store.delete_many(&purged).await;
            }
            self.flow.resume();
            self.events.publish(CoreEvent::WindowResumed { at });
        }
        true
    }

    pub async fn status(&self) -> WindowStatus {
        let state = self.state.lock().await;
        WindowStatus { ready: state.ready.len(), consumed_total: state.consumed_total, paused: state.paused }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }
}
