use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::cache::{CacheStatus, CacheStore};
use crate::clock::Clock;
use crate::digest::Digest;
use crate::error::Result;
use crate::events::{CoreEvent, InProcEventBus};
use crate::pipeline::Task;
use crate::pool::{TaskRunner, WorkerPool};
use crate::window::{RollingWindow, WindowStatus};

#[derive(Debug)]
pub struct CoordinatorStatus {
    pub cache: CacheStatus,
    pub window: WindowStatus,
    pub queued: usize,
    pub running: usize,
}

/// Top-level entry point (component C8): owns path <-> digest
/// reconciliation across renames and deletes, and wires submission through
/// to the worker pool, rolling window, and cache store.
pub struct PipelineCoordinator<R: TaskRunner + 'static> {
    store: Arc<CacheStore>,
    pool: Arc<WorkerPool<R>>,
    window: Arc<RollingWindow>,
    events: Arc<InProcEventBus>,
    clock: Arc<dyn Clock>,
    /// Path currently tracked by an in-flight (queued or running) task.
    active_tasks: Arc<DashMap<PathBuf, Uuid>>,
    /// Last digest successfully produced for a path, kept in sync across
    /// renames so a move never forces a re-hash (spec §4.6).
    path_digest: Arc<DashMap<PathBuf, Digest>>,
    /// Redirects for tasks renamed while in flight: a `Task`'s path is
    /// fixed at creation, so its completion event still reports the old
    /// path. Keyed by the path the in-flight task will report, valued by
    /// where that completion should actually land.
    renames: Arc<DashMap<PathBuf, PathBuf>>,
}

impl<R: TaskRunner + 'static> std::fmt::Debug for PipelineCoordinator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCoordinator")
            .field("active_tasks", &self.active_tasks.len())
            .field("tracked_paths", &self.path_digest.len())
            .finish()
    }
}

impl<R: TaskRunner + 'static> PipelineCoordinator<R> {
    /// Validates the window's invariant (SPEC_FULL.md §C: "checked once at
    /// `PipelineCoordinator` construction") before wiring anything up.
    pub fn new(
        store: Arc<CacheStore>,
        pool: Arc<WorkerPool<R>>,
        window: Arc<RollingWindow>,
        events: Arc<InProcEventBus>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        window.config().validate()?;

        let coordinator = Arc::new(Self {
            store,
            pool,
            window,
            events: events.clone(),
            clock,
            active_tasks: Arc::new(DashMap::new()),
            path_digest: Arc::new(DashMap::new()),
            renames: Arc::new(DashMap::new()),
        });
        coordinator.clone().spawn_event_listener(events);
        Ok(coordinator)
    }

    fn spawn_event_listener(self: Arc<Self>, events: Arc<InProcEventBus>) {
        let mut rx = events.subscribe();
        let window = self.window.clone();
        let path_digest = self.path_digest.clone();
        let active_tasks = self.active_tasks.clone();
        let renames = self.renames.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(CoreEvent::TaskCompleted { meta }) => {
                        let target = renames.remove(&meta.path).map(|(_, p)| p).unwrap_or(meta.path);
                        if let Some(digest) = meta.digest {
                            path_digest.insert(target.clone(), digest.clone());
                            window.push_ready(digest, meta.at).await;
                        }
                        active_tasks.remove(&target);
                    }
                    Ok(CoreEvent::TaskErrored { meta, .. })
                    | Ok(CoreEvent::FileMissing { meta })
                    | Ok(CoreEvent::AlreadyProcessed { meta }) => {
                        let target = renames.remove(&meta.path).map(|(_, p)| p).unwrap_or(meta.path);
                        active_tasks.remove(&target);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Enqueues `path` for normal-priority processing. Deduplicated against
    /// an already-queued or in-flight run for the same path (spec §4.4/
    /// §4.8): if one exists, its id is returned and no new task is created.
    pub async fn enqueue(&self, path: PathBuf) -> Uuid {
        let task = Task::new(path.clone());
        let id = task.id;
        if !self.pool.submit(task).await {
            return self.active_tasks.get(&path).map(|e| *e.value()).unwrap_or(id);
        }
        self.active_tasks.insert(path, id);
        id
    }

    pub async fn enqueue_priority(&self, path: PathBuf) -> Uuid {
        let task = Task::new(path.clone());
        let id = task.id;
        if !self.pool.submit_priority(task).await {
            return self.active_tasks.get(&path).map(|e| *e.value()).unwrap_or(id);
        }
        self.active_tasks.insert(path, id);
        id
    }

    /// Cancels a queued or running task for `path`, if any.
    pub async fn remove(&self, path: &PathBuf) -> bool {
        let Some((_, id)) = self.active_tasks.remove(path) else {
            return false;
        };
        self.pool.remove(id).await
    }

    /// Acknowledges downstream consumption of a ready digest (spec §4.5).
    pub async fn mark_consumed(&self, digest: &Digest) -> bool {
        self.window.mark_consumed(digest, self.clock.now()).await
    }

    pub fn set_priority(&self, digests: HashSet<Digest>) {
        self.store.set_priority(digests);
    }

    /// Reprocesses `path` unconditionally: invalidates any cached entry for
    /// the path's current digest, then bypasses both the cache hit check
    /// and rolling-window backpressure (spec §4.8).
    pub async fn force_reprocess(&self, path: PathBuf) -> Uuid {
        if let Some(digest) = self.path_digest.get(&path).map(|d| d.clone()) {
            self.store.delete_many(std::slice::from_ref(&digest)).await;
        }

        let task = Task::new(path.clone()).with_force(true);
        let id = task.id;
        if !self.pool.submit(task).await {
            return self.active_tasks.get(&path).map(|e| *e.value()).unwrap_or(id);
        }
        self.active_tasks.insert(path, id);
        id
    }

    /// A path was renamed on disk: carry its known digest forward without
    /// triggering a re-hash, and retarget any in-flight task bookkeeping.
    pub fn handle_rename(&self, old: &PathBuf, new: PathBuf) {
        if let Some((_, digest)) = self.path_digest.remove(old) {
            self.path_digest.insert(new.clone(), digest);
        }
        if let Some((_, id)) = self.active_tasks.remove(old) {
            // The task is fixed to `old` for the rest of its run, so its
            // eventual completion event still reports `old` — redirect it.
            self.renames.insert(old.clone(), new.clone());
            self.active_tasks.insert(new, id);
        }
    }

    /// A path was deleted on disk: stop tracking it and cancel any
    /// in-flight task. The cache entry itself is untouched — other paths
    /// may still share its digest.
    pub async fn handle_delete(&self, path: &PathBuf) {
        self.path_digest.remove(path);
        if let Some((_, id)) = self.active_tasks.remove(path) {
            self.pool.remove(id).await;
        }
    }

    pub fn events(&self) -> &Arc<InProcEventBus> {
        &self.events
    }

    pub fn digest_for_path(&self, path: &PathBuf) -> Option<Digest> {
        self.path_digest.get(path).map(|d| d.clone())
    }

    pub async fn status(&self) -> CoordinatorStatus {
        let pool_stats = self.pool.stats().await;
        CoordinatorStatus {
            cache: self.store.status(),
            window: self.window.status().await,
            queued: pool_stats.queued,
            running: pool_stats.running,
        }
    }
}
