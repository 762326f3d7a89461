use std::time::Instant;

/// Monotonic time source injected into the cache store and pipeline.
///
/// `completed_at` timestamps are only meaningful within one process
/// lifetime (spec §4.2 "clock skew across restart must not reorder
/// eviction") — on restart, callers re-seed from filesystem mtime instead
/// of trusting a prior `now()` value.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// Real wall/monotonic clock, measured in milliseconds since the clock was
/// created. Good enough for within-process ordering; never persisted
/// as-is across restarts.
#[derive(Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}
