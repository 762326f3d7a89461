//! Preprocessing and cache coordination core for an event-photography
//! face-recognition assistant: content hashing, a persistent
//! priority-aware cache, a cancellable multi-stage pipeline, a bounded
//! worker pool, rolling-window backpressure, and an event bus tying it
//! all together. No HTTP, UI, auth, or database layer lives here.

pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod digest;
pub mod error;
pub mod events;
pub mod hash;
pub mod pipeline;
pub mod pool;
pub mod priority;
pub mod window;

pub use cache::{AdmitOutcome, AdmitRequest, Artifact, CacheEntry, CacheStatus, CacheStore, PipelineStage};
pub use clock::{Clock, SystemClock};
pub use config::{CacheConfig, CoreConfig, PoolConfig, WindowConfig};
pub use coordinator::{CoordinatorStatus, PipelineCoordinator};
pub use digest::Digest;
pub use error::{CoreError, Result};
pub use events::{CoreEvent, EventMeta, InProcEventBus};
pub use hash::{ContentHasher, Sha1FileHasher};
pub use pipeline::{PipelineWorker, Task, TaskState};
pub use pool::{PoolStats, TaskRunner, WorkerPool};
pub use priority::PriorityIndex;
pub use window::{FlowControl, RollingWindow, WindowStatus};
