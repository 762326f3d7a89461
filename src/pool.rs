use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::{CoreEvent, InProcEventBus};
use crate::pipeline::{PipelineWorker, Task, TaskState};

/// Executes a `Task` to completion. `PipelineWorker` is the production
/// implementation; tests substitute a stub to observe dispatch ordering
/// without running real pipeline stages.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &Task) -> TaskState;
}

#[async_trait]
impl TaskRunner for PipelineWorker {
    async fn run(&self, task: &Task) -> TaskState {
        PipelineWorker::run(self, task).await
    }
}

#[derive(Default)]
struct Queues {
    /// Force-reprocess requests: always dispatched next, pause or not.
    bypass: VecDeque<Task>,
    /// Priority front-jump lane: drained before `normal`, FIFO within itself.
    priority: VecDeque<Task>,
    normal: VecDeque<Task>,
}

impl Queues {
    fn len(&self) -> usize {
        self.bypass.len() + self.priority.len() + self.normal.len()
    }

    fn remove(&mut self, id: Uuid) -> Option<Task> {
        for queue in [&mut self.bypass, &mut self.priority, &mut self.normal] {
            if let Some(pos) = queue.iter().position(|t| t.id == id) {
                return queue.remove(pos);
            }
        }
        None
    }

    fn drain_all(&mut self) -> Vec<Task> {
        self.bypass
            .drain(..)
            .chain(self.priority.drain(..))
            .chain(self.normal.drain(..))
            .collect()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PoolStats {
    pub queued: usize,
    pub running: usize,
}

/// Bounded worker pool (component C4): a FIFO queue with a priority
/// front-jump lane and a force lane that bypasses pause, dispatched to at
/// most `max_workers` concurrent task executions.
pub struct WorkerPool<R: TaskRunner + 'static> {
    runner: Arc<R>,
    events: Arc<InProcEventBus>,
    queues: Mutex<Queues>,
    notify: Notify,
    semaphore: Arc<Semaphore>,
    running: Arc<DashMap<Uuid, (CancellationToken, std::path::PathBuf)>>,
    /// Paths currently queued or running, so `submit` can ignore a path
    /// that's already in flight instead of racing two workers on it.
    tracked: Arc<DashMap<std::path::PathBuf, Uuid>>,
    paused: AtomicBool,
    max_workers: usize,
}

impl<R: TaskRunner + 'static> std::fmt::Debug for WorkerPool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_workers", &self.max_workers)
            .field("running", &self.running.len())
            .finish()
    }
}

impl<R: TaskRunner + 'static> WorkerPool<R> {
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn new(runner: Arc<R>, events: Arc<InProcEventBus>, max_workers: usize) -> Arc<Self> {
        Arc::new(Self {
            runner,
            events,
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            running: Arc::new(DashMap::new()),
            tracked: Arc::new(DashMap::new()),
            paused: AtomicBool::new(false),
            max_workers: max_workers.max(1),
        })
    }

    /// Appends `task` to the appropriate lane unless its path is already
    /// queued or running (spec §4.4: "if not present, not in-flight").
    /// Returns whether it was actually submitted.
    pub async fn submit(&self, task: Task) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.tracked.entry(task.path.clone()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(task.id);
            }
        }

        let mut q = self.queues.lock().await;
        if task.force {
            q.bypass.push_back(task);
        } else if task.priority {
            q.priority.push_back(task);
        } else {
            q.normal.push_back(task);
        }
        drop(q);
        self.notify_stats().await;
        self.notify.notify_one();
        true
    }

    pub async fn submit_priority(&self, mut task: Task) -> bool {
        task.priority = true;
        self.submit(task).await
    }

    /// Removes a queued task, or cooperatively cancels one already running.
    /// Either way idempotent: a second call for the same id is a no-op.
    pub async fn remove(&self, id: Uuid) -> bool {
        let mut q = self.queues.lock().await;
        if let Some(task) = q.remove(id) {
            task.cancel.cancel();
            drop(q);
            self.tracked.remove(&task.path);
            self.notify_stats().await;
            return true;
        }
        drop(q);
        if let Some(entry) = self.running.get(&id) {
            entry.0.cancel();
            return true;
        }
        false
    }

    /// Drops every queued (not yet dispatched) task, cancelling each.
    /// Returns the number cleared.
    pub async fn clear_queue(&self) -> usize {
        let mut q = self.queues.lock().await;
        let drained = q.drain_all();
        drop(q);
        let count = drained.len();
        for task in drained {
            task.cancel.cancel();
            self.tracked.remove(&task.path);
        }
        self.notify_stats().await;
        count
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    pub async fn stats(&self) -> PoolStats {
        let q = self.queues.lock().await;
        PoolStats { queued: q.len(), running: self.running.len() }
    }

    async fn notify_stats(&self) {
        let stats = self.stats().await;
        self.events.publish(CoreEvent::PoolStatsChanged { queued: stats.queued, running: stats.running });
    }

    async fn pop_next(&self) -> Option<Task> {
        let mut q = self.queues.lock().await;
        if let Some(task) = q.bypass.pop_front() {
            return Some(task);
        }
        if self.paused.load(Ordering::Acquire) {
            return None;
        }
        if let Some(task) = q.priority.pop_front() {
            return Some(task);
        }
        q.normal.pop_front()
    }

    /// Spawns the background dispatch loop. Runs until the pool is dropped.
    pub fn spawn_dispatch_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.notify.notified().await;
                loop {
                    let permit = match self.semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let Some(task) = self.pop_next().await else {
                        drop(permit);
                        break;
                    };

                    let runner = self.runner.clone();
                    let running = self.running.clone();
                    let tracked = self.tracked.clone();
                    let id = task.id;
                    let path = task.path.clone();
                    running.insert(id, (task.cancel.clone(), path.clone()));
                    self.notify_stats().await;

                    let pool = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let _ = runner.run(&task).await;
                        running.remove(&id);
                        tracked.remove(&path);
                        pool.notify_stats().await;
                        pool.notify.notify_one();
                    });
                }
            }
        })
    }
}
