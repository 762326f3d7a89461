use std::path::PathBuf;
use std::sync::Arc;

use faceprep_core::cache::BBox;
use faceprep_core::*;
use tempfile::TempDir;

pub fn write_file(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

/// A detector that always reports `faces` bounding boxes and counts calls,
/// so scenarios can assert on how many times detection actually ran.
#[derive(Clone)]
pub struct CountingDetector {
    pub calls: Arc<std::sync::atomic::AtomicUsize>,
    pub faces: usize,
}

#[async_trait::async_trait]
impl faceprep_core::pipeline::FaceDetector for CountingDetector {
    async fn detect(&self, _image: &[u8]) -> Result<Vec<faceprep_core::cache::BBox>> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok((0..self.faces).map(|i| BBox { x: i as i32, y: 0, w: 10, h: 10 }).collect())
    }
}

pub struct NoopDecoder;

#[async_trait::async_trait]
impl faceprep_core::pipeline::RawDecoder for NoopDecoder {
    async fn decode(&self, _path: &std::path::Path) -> Result<Vec<u8>> {
        Ok(vec![])
    }
}

pub struct FixedCropper;

#[async_trait::async_trait]
impl faceprep_core::pipeline::ThumbnailCropper for FixedCropper {
    async fn crop(&self, _image: &[u8], bboxes: &[BBox]) -> Result<Vec<Vec<u8>>> {
        Ok(bboxes.iter().map(|_| vec![0u8; 4]).collect())
    }
}

/// Deterministic clock for eviction-ordering scenarios: `SystemClock`'s
/// millisecond resolution can tie two fast-succeeding admissions, which
/// would make tie-break-by-digest (not admission order) decide eviction
/// order — exactly what the real store does, but not what these tests
/// want to assert against.
#[derive(Debug, Default)]
pub struct ManualClock(std::sync::atomic::AtomicU64);

impl ManualClock {
    pub fn advance(&self, by: u64) {
        self.0.fetch_add(by, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}
