use thiserror::Error;

use crate::digest::Digest;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("file not found: {path}")]
    FileMissing { path: std::path::PathBuf },

    #[error("cache storage full")]
    StorageFull,

    #[error("cache entry corrupted: {digest}")]
    StoreCorrupted { digest: Digest },

    #[error("face detection failed: {reason}")]
    FaceDetectionFailed { reason: String },

    #[error("thumbnail generation failed: {reason}")]
    ThumbnailFailed { reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invariant violated: {detail}")]
    InvariantViolation { detail: String },
}

impl CoreError {
    /// Stable, message-independent classification for event subscribers
    /// (spec §7: every error event carries an `error_kind` alongside the
    /// human-readable message).
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Io(_) => "io",
            CoreError::Serialization(_) => "serialization",
            CoreError::FileMissing { .. } => "file_missing",
            CoreError::StorageFull => "storage_full",
            CoreError::StoreCorrupted { .. } => "store_corrupted",
            CoreError::FaceDetectionFailed { .. } => "face_detection_failed",
            CoreError::ThumbnailFailed { .. } => "thumbnail_failed",
            CoreError::Cancelled => "cancelled",
            CoreError::InvariantViolation { .. } => "invariant_violation",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
