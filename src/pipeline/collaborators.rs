use std::path::Path;

use async_trait::async_trait;

use crate::cache::BBox;
use crate::error::Result;

/// Decodes a RAW file into a preview image (spec §4.1, §4.3). Failure here
/// is advisory: the caller logs it and proceeds without a preview rather
/// than failing the task.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RawDecoder: Send + Sync {
    async fn decode(&self, path: &Path) -> Result<Vec<u8>>;
}

/// Detects faces in an image buffer. Mandatory: failure here fails the
/// whole task (spec §4.3, §7).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn detect(&self, image: &[u8]) -> Result<Vec<BBox>>;
}

/// Crops one thumbnail per detected bounding box, in bbox order.
/// Mandatory: failure here fails the whole task.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ThumbnailCropper: Send + Sync {
    async fn crop(&self, image: &[u8], bboxes: &[BBox]) -> Result<Vec<Vec<u8>>>;
}

/// Filesystem access seam so tests never touch real disk for source
/// images (separate from the cache store's own filesystem use, which is
/// concrete since it owns its directory layout).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fs: Send + Sync {
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;
}

/// `Fs` backed by real `tokio::fs`.
#[derive(Debug, Default)]
pub struct TokioFs;

#[async_trait]
impl Fs for TokioFs {
    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        tokio::fs::read(path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                crate::error::CoreError::FileMissing { path: path.to_path_buf() }
            } else {
                crate::error::CoreError::Io(err)
            }
        })
    }
}
