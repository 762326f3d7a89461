use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Global knobs that tune the preprocessing core. All fields carry
/// defaults so a caller can override only what it cares about.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreConfig {
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    pub window: WindowConfig,
    /// File extensions (lowercase, no dot) routed through RAW decoding.
    pub raw_extensions: BTreeSet<String>,
    /// Broadcast channel capacity for the event bus.
    pub event_bus_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            pool: PoolConfig::default(),
            window: WindowConfig::default(),
            raw_extensions: ["nef", "cr2", "arw", "raw"]
                .into_iter()
                .map(String::from)
                .collect(),
            event_bus_capacity: 1024,
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> Result<()> {
        self.window.validate()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    pub root: PathBuf,
    /// Soft total size budget in bytes. Default: 1 GiB.
    pub budget_bytes: u64,
    /// Fixed per-entry overhead amortizing metadata, added to on-disk blob size.
    pub entry_overhead_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./cache"),
            budget_bytes: 1024 * 1024 * 1024,
            entry_overhead_bytes: 512,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct WindowConfig {
    pub max_ready_items: usize,
    pub min_queue_buffer: usize,
    pub resume_threshold: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_ready_items: 15,
            min_queue_buffer: 10,
            resume_threshold: 5,
        }
    }
}

impl WindowConfig {
    /// Enforces `max_ready_items >= min_queue_buffer > resume_threshold >= 1` (spec §4.5).
    pub fn validate(&self) -> Result<()> {
        if self.resume_threshold < 1 {
            return Err(CoreError::InvariantViolation {
                detail: "resume_threshold must be >= 1".into(),
            });
        }
        if self.min_queue_buffer <= self.resume_threshold {
            return Err(CoreError::InvariantViolation {
                detail: "min_queue_buffer must be > resume_threshold".into(),
            });
        }
        if self.max_ready_items < self.min_queue_buffer {
            return Err(CoreError::InvariantViolation {
                detail: "max_ready_items must be >= min_queue_buffer".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn window_invariant_is_checked() {
        let bad = WindowConfig {
            max_ready_items: 4,
            min_queue_buffer: 10,
            resume_threshold: 5,
        };
        assert!(bad.validate().is_err());

        let bad2 = WindowConfig {
            max_ready_items: 10,
            min_queue_buffer: 5,
            resume_threshold: 5,
        };
        assert!(bad2.validate().is_err());
    }
}
