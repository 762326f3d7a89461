use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use fs2::FileExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::cache::entry::{Artifact, BBox, CacheEntryRecord, PipelineStage};
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::digest::Digest;
use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, InProcEventBus};
use crate::priority::PriorityIndex;

/// Digest + everything cached for it (the public view of a cache hit).
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub digest: Digest,
    pub artifact: Artifact,
}

/// Outcome of an admission attempt (spec §4.2).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AdmitOutcome {
    Admitted,
    Replaced,
    Rejected(RejectReason),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejectReason {
    StorageFull,
}

/// Blob payload + stage outcome a `PipelineWorker` hands to the store for
/// atomic admission. The store, not the worker, owns the tmp-then-rename
/// protocol (spec §4.2).
#[derive(Clone, Debug, Default)]
pub struct AdmitRequest {
    pub decoded_preview: Option<Vec<u8>>,
    /// Thumbnail blobs, in face-bbox order.
    pub thumbnails: Vec<Vec<u8>>,
    pub face_bboxes: Vec<BBox>,
    pub stages_done: Vec<PipelineStage>,
}

#[derive(Clone, Copy, Debug)]
pub struct CacheStatus {
    pub entries: usize,
    pub bytes: u64,
    pub budget: u64,
    pub pct: f64,
}

#[derive(Debug, Default)]
pub struct EvictionReport {
    pub bytes_reclaimed: u64,
    pub evicted: Vec<Digest>,
}

/// Durable content-addressed artifact store (component C2). Directory
/// layout follows spec §6: `blobs/<shard>/`, `index/<digest>.json`, an
/// exclusive `lock`, and `tmp/` for in-flight writes.
pub struct CacheStore {
    root: PathBuf,
    budget_bytes: u64,
    entry_overhead_bytes: u64,
    index: DashMap<Digest, Artifact>,
    total_bytes: AtomicU64,
    priority: Arc<PriorityIndex>,
    clock: Arc<dyn Clock>,
    digest_locks: DashMap<Digest, Arc<AsyncMutex<()>>>,
    eviction_lock: AsyncMutex<()>,
    events: Arc<InProcEventBus>,
    _lock_file: std::fs::File,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("root", &self.root)
            .field("budget_bytes", &self.budget_bytes)
            .field("entries", &self.index.len())
            .field("bytes", &self.total_bytes.load(Ordering::Relaxed))
            .finish()
    }
}

impl CacheStore {
    /// Opens (or creates) the store at `config.root`, taking the exclusive
    /// directory lock, reaping orphaned temp files, and loading the
    /// existing index. `completed_at` on every loaded entry is re-seeded
    /// from the index file's mtime, since clock values from a prior
    /// process lifetime are not comparable (spec §4.2 "clock skew").
    pub async fn open(
        config: &CacheConfig,
        priority: Arc<PriorityIndex>,
        clock: Arc<dyn Clock>,
        events: Arc<InProcEventBus>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(config.root.join("blobs")).await?;
        tokio::fs::create_dir_all(config.root.join("index")).await?;
        tokio::fs::create_dir_all(config.root.join("tmp")).await?;

        let lock_path = config.root.join("lock");
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        lock_file.try_lock_exclusive().map_err(|_| {
            error!(root = ?config.root, "cache store already locked by another process");
            CoreError::InvariantViolation {
                detail: format!("cache store at {:?} is already locked by another process", config.root),
            }
        })?;

        let store = Self {
            root: config.root.clone(),
            budget_bytes: config.budget_bytes,
            entry_overhead_bytes: config.entry_overhead_bytes,
            index: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            priority,
            clock,
            digest_locks: DashMap::new(),
            eviction_lock: AsyncMutex::new(()),
            events,
            _lock_file: lock_file,
        };

        store.reap_orphan_temp_files().await?;
        store.load_index().await?;
        info!(root = ?store.root, entries = store.index.len(), "cache store opened");
        Ok(store)
    }

    async fn reap_orphan_temp_files(&self) -> Result<()> {
        let tmp_dir = self.root.join("tmp");
        let mut entries = tokio::fs::read_dir(&tmp_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().ends_with(".partial") {
                debug!(path = ?entry.path(), "reaping orphan temp file");
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
        Ok(())
    }

    async fn load_index(&self) -> Result<()> {
        let index_dir = self.root.join("index");
        let mut entries = tokio::fs::read_dir(&index_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(digest_str) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if digest_str.len() != Digest::HEX_LEN {
                continue;
            }
            let digest = Digest::from_hex(digest_str.to_string());
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(err) => {
                    warn!(?path, %err, "failed to read cache index entry, skipping");
                    continue;
                }
            };
            let record: CacheEntryRecord = match serde_json::from_slice(&bytes) {
                Ok(r) => r,
                Err(err) => {
                    warn!(?path, %err, "corrupted cache index entry, skipping");
                    continue;
                }
            };
            let mtime_ms = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);

            let mut artifact = record.into_artifact(Some(self.preview_path(&digest)));
            artifact.completed_at = mtime_ms;
            self.total_bytes.fetch_add(artifact.size_bytes, Ordering::Relaxed);
            self.index.insert(digest, artifact);
        }
        Ok(())
    }

    fn shard_dir(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join(digest.shard())
    }

    fn preview_path(&self, digest: &Digest) -> PathBuf {
        self.shard_dir(digest).join(format!("{digest}.preview.jpg"))
    }

    fn thumbs_dir(&self, digest: &Digest) -> PathBuf {
        self.shard_dir(digest).join(format!("{digest}.thumbs"))
    }

    fn index_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("index").join(format!("{digest}.json"))
    }

    fn tmp_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("tmp").join(format!("{digest}.{}.partial", Uuid::new_v4()))
    }

    fn digest_lock(&self, digest: &Digest) -> Arc<AsyncMutex<()>> {
        self.digest_locks.entry(digest.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// O(1), never blocks on writers to other digests: a pure in-memory
    /// index read (spec §4.2).
    pub fn lookup(&self, digest: &Digest) -> Option<CacheEntry> {
        self.index.get(digest).map(|a| CacheEntry { digest: digest.clone(), artifact: a.clone() })
    }

    /// Like `lookup`, but verifies the referenced blobs are actually present
    /// and sized as recorded; on mismatch the entry is treated as
    /// `StoreCorrupted` and removed, so the caller sees a cache miss
    /// (spec §7).
    pub async fn lookup_verified(&self, digest: &Digest) -> Result<Option<CacheEntry>> {
        let Some(entry) = self.lookup(digest) else {
            return Ok(None);
        };

        if let Some(preview) = &entry.artifact.decoded_preview
            && tokio::fs::metadata(preview).await.is_err()
        {
            warn!(%digest, "decoded preview missing on disk, evicting corrupted entry");
            self.remove_entry(digest).await;
            return Ok(None);
        }

        if entry.artifact.thumbnails_present {
            let thumbs_dir = self.thumbs_dir(digest);
            let mut count = 0usize;
            match tokio::fs::read_dir(&thumbs_dir).await {
                Ok(mut rd) => {
                    while let Some(e) = rd.next_entry().await.map_err(CoreError::Io)? {
                        if e.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                            count += 1;
                        }
                    }
                }
                Err(_) => count = 0,
            }
            if count != entry.artifact.face_count() {
                warn!(%digest, expected = entry.artifact.face_count(), found = count, "thumbnail count mismatch, evicting corrupted entry");
                self.remove_entry(digest).await;
                return Ok(None);
            }
        }

        Ok(Some(entry))
    }

    /// Atomically admits a completed artifact for `digest` (spec §4.2).
    /// Blobs land in `tmp/`, are fsynced, then renamed into place; the
    /// index record is written only after every blob rename succeeds, so a
    /// crash mid-admission leaves either the previous entry intact or none
    /// at all.
    pub async fn admit(&self, digest: &Digest, request: AdmitRequest) -> Result<AdmitOutcome> {
        let lock = self.digest_lock(digest);
        let _guard = lock.lock().await;

        let existed = self.index.contains_key(digest);

        match self.write_artifact(digest, &request).await {
            Ok(artifact) => {
                if let Some(old) = self.index.insert(digest.clone(), artifact.clone()) {
                    self.total_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
                }
                self.total_bytes.fetch_add(artifact.size_bytes, Ordering::Relaxed);
                Ok(if existed { AdmitOutcome::Replaced } else { AdmitOutcome::Admitted })
            }
            Err(CoreError::StorageFull) => Ok(AdmitOutcome::Rejected(RejectReason::StorageFull)),
            Err(err) => Err(err),
        }
    }

    async fn write_artifact(&self, digest: &Digest, request: &AdmitRequest) -> Result<Artifact> {
        tokio::fs::create_dir_all(self.shard_dir(digest)).await?;

        let mut size_bytes = self.entry_overhead_bytes;
        let mut decoded_preview = None;
        if let Some(bytes) = &request.decoded_preview {
            let target = self.preview_path(digest);
            self.write_blob_atomic(digest, &target, bytes).await?;
            size_bytes += bytes.len() as u64;
            decoded_preview = Some(target);
        }

        if !request.thumbnails.is_empty() {
            let thumbs_dir = self.thumbs_dir(digest);
            tokio::fs::create_dir_all(&thumbs_dir).await?;
            for (idx, bytes) in request.thumbnails.iter().enumerate() {
                let target = thumbs_dir.join(format!("{idx}.jpg"));
                self.write_blob_atomic(digest, &target, bytes).await?;
                size_bytes += bytes.len() as u64;
            }
        }

        let artifact = Artifact {
            decoded_preview,
            face_bboxes: request.face_bboxes.clone(),
            thumbnails_present: request.stages_done.contains(&PipelineStage::GeneratingThumbnails),
            completed_at: self.clock.now(),
            stages_done: request.stages_done.clone(),
            size_bytes,
        };

        let record = CacheEntryRecord::from(&artifact);
        let record_bytes = serde_json::to_vec_pretty(&record)?;
        self.write_blob_atomic(digest, &self.index_path(digest), &record_bytes).await?;

        Ok(artifact)
    }

    async fn write_blob_atomic(&self, digest: &Digest, target: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = self.tmp_path(digest);
        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, target).await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                if err.raw_os_error() == Some(libc_enospc()) {
                    Err(CoreError::StorageFull)
                } else {
                    Err(CoreError::Io(err))
                }
            }
        }
    }

    /// Idempotent, non-authoritative removal hint (spec §4.5). Priority
    /// digests are spared even when named here.
    pub async fn delete_many(&self, digests: &[Digest]) -> usize {
        let mut removed = 0;
        for digest in digests {
            if self.priority.contains(digest) {
                continue;
            }
            if self.index.contains_key(digest) {
                self.remove_entry(digest).await;
                removed += 1;
            }
        }
        removed
    }

    /// Replaces the priority set in one step (forwards to component C6).
    pub fn set_priority(&self, digests: HashSet<Digest>) {
        self.priority.set(digests);
    }

    async fn remove_entry(&self, digest: &Digest) {
        let lock = self.digest_lock(digest);
        let _guard = lock.lock().await;

        let Some((_, artifact)) = self.index.remove(digest) else {
            return;
        };
        self.total_bytes.fetch_sub(artifact.size_bytes, Ordering::Relaxed);
        let _ = tokio::fs::remove_file(self.preview_path(digest)).await;
        let _ = tokio::fs::remove_dir_all(self.thumbs_dir(digest)).await;
        let _ = tokio::fs::remove_file(self.index_path(digest)).await;
        self.events.publish(CoreEvent::CacheEntryEvicted { digest: digest.clone() });
    }

    /// Runs eviction when over budget, or unconditionally if `force`.
    /// Strict order (spec §4.2): oldest non-priority first, ties by
    /// lexicographically smallest digest; priority entries are never
    /// evicted while a non-priority candidate exists; if everything is
    /// priority and the store is still over budget, the oldest priority
    /// entry goes too.
    pub async fn tick_eviction(&self) -> Result<EvictionReport> {
        use tracing::Instrument;
        let span = info_span!("tick_eviction", bytes = self.total_bytes.load(Ordering::Relaxed), budget = self.budget_bytes);
        self.tick_eviction_inner().instrument(span).await
    }

    async fn tick_eviction_inner(&self) -> Result<EvictionReport> {
        let _guard = self.eviction_lock.lock().await;
        let mut report = EvictionReport::default();

        loop {
            if self.total_bytes.load(Ordering::Relaxed) <= self.budget_bytes {
                break;
            }

            let priority = self.priority.snapshot();
            let mut non_priority: Vec<(Digest, u64)> = Vec::new();
            let mut priority_entries: Vec<(Digest, u64)> = Vec::new();
            for entry in self.index.iter() {
                let d = entry.key().clone();
                let completed_at = entry.value().completed_at;
                if priority.contains(&d) {
                    priority_entries.push((d, completed_at));
                } else {
                    non_priority.push((d, completed_at));
                }
            }

            let candidate = if !non_priority.is_empty() {
                non_priority.into_iter().min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
            } else {
                priority_entries.into_iter().min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
            };

            let Some((digest, _)) = candidate else {
                break;
            };

            let size = self.index.get(&digest).map(|a| a.size_bytes).unwrap_or(0);
            self.remove_entry(&digest).await;
            report.bytes_reclaimed += size;
            report.evicted.push(digest);
        }

        if report.evicted.is_empty() {
            debug!("eviction tick reclaimed nothing");
        } else {
            info!(evicted = report.evicted.len(), bytes_reclaimed = report.bytes_reclaimed, "eviction tick complete");
        }
        Ok(report)
    }

    pub fn status(&self) -> CacheStatus {
        let bytes = self.total_bytes.load(Ordering::Relaxed);
        let pct = if self.budget_bytes == 0 {
            if bytes == 0 { 0.0 } else { f64::INFINITY }
        } else {
            (bytes as f64 / self.budget_bytes as f64) * 100.0
        };
        CacheStatus { entries: self.index.len(), bytes, budget: self.budget_bytes, pct }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn libc_enospc() -> i32 {
    28
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    async fn new_store(budget: u64) -> (CacheStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig { root: dir.path().to_path_buf(), budget_bytes: budget, entry_overhead_bytes: 0 };
        let priority = Arc::new(PriorityIndex::new());
        let clock = Arc::new(SystemClock::default());
        let events = Arc::new(InProcEventBus::new(16));
        let store = CacheStore::open(&config, priority, clock, events).await.unwrap();
        (store, dir)
    }

    fn digest_n(n: u8) -> Digest {
        Digest::from_hex(format!("{:02x}", n).repeat(20))
    }

    fn request_with(bytes: usize) -> AdmitRequest {
        AdmitRequest {
            decoded_preview: None,
            thumbnails: vec![vec![0u8; bytes]],
            face_bboxes: vec![BBox { x: 0, y: 0, w: 1, h: 1 }],
            stages_done: vec![PipelineStage::DetectingFaces, PipelineStage::GeneratingThumbnails],
        }
    }

    #[tokio::test]
    async fn admit_then_lookup_round_trips() {
        let (store, _dir) = new_store(1024 * 1024).await;
        let d = digest_n(0xaa);
        let outcome = store.admit(&d, request_with(10)).await.unwrap();
        assert_eq!(outcome, AdmitOutcome::Admitted);

        let entry = store.lookup(&d).expect("entry present");
        assert_eq!(entry.artifact.face_count(), 1);
        assert!(entry.artifact.thumbnails_present);
    }

    #[tokio::test]
    async fn second_admit_on_same_digest_replaces() {
        let (store, _dir) = new_store(1024 * 1024).await;
        let d = digest_n(0xbb);
        assert_eq!(store.admit(&d, request_with(10)).await.unwrap(), AdmitOutcome::Admitted);
        assert_eq!(store.admit(&d, request_with(20)).await.unwrap(), AdmitOutcome::Replaced);
    }

    #[tokio::test]
    async fn priority_is_never_evicted_while_non_priority_exists() {
        let (store, _dir) = new_store(100).await;
        let a = digest_n(0x01);
        let b = digest_n(0x02);
        store.admit(&a, request_with(100)).await.unwrap();
        store.admit(&b, request_with(100)).await.unwrap();
        store.set_priority(HashSet::from([a.clone()]));

        let report = store.tick_eviction().await.unwrap();
        assert!(report.evicted.contains(&b));
        assert!(!report.evicted.contains(&a));
        assert!(store.lookup(&a).is_some());
    }

    #[tokio::test]
    async fn all_priority_over_budget_evicts_oldest_priority() {
        let (store, _dir) = new_store(1).await;
        let a = digest_n(0x03);
        let b = digest_n(0x04);
        store.admit(&a, request_with(100)).await.unwrap();
        store.admit(&b, request_with(100)).await.unwrap();
        store.set_priority(HashSet::from([a.clone(), b.clone()]));

        let report = store.tick_eviction().await.unwrap();
        assert!(!report.evicted.is_empty());
    }

    #[tokio::test]
    async fn zero_budget_does_not_loop_forever() {
        let (store, _dir) = new_store(0).await;
        let a = digest_n(0x05);
        store.admit(&a, request_with(10)).await.unwrap();
        let report = store.tick_eviction().await.unwrap();
        assert_eq!(report.evicted.len(), 1);
        assert!(store.lookup(&a).is_none());
    }

    #[tokio::test]
    async fn delete_many_is_idempotent_and_respects_priority() {
        let (store, _dir) = new_store(1024 * 1024).await;
        let a = digest_n(0x06);
        store.admit(&a, request_with(10)).await.unwrap();
        store.set_priority(HashSet::from([a.clone()]));

        assert_eq!(store.delete_many(std::slice::from_ref(&a)).await, 0);
        assert!(store.lookup(&a).is_some());

        store.set_priority(HashSet::new());
        assert_eq!(store.delete_many(std::slice::from_ref(&a)).await, 1);
        assert_eq!(store.delete_many(std::slice::from_ref(&a)).await, 0);
    }

    #[tokio::test]
    async fn reopening_store_reloads_index() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig { root: dir.path().to_path_buf(), budget_bytes: 1024 * 1024, entry_overhead_bytes: 0 };
        let d = digest_n(0x07);
        {
            let store = CacheStore::open(
                &config,
                Arc::new(PriorityIndex::new()),
                Arc::new(SystemClock::default()),
                Arc::new(InProcEventBus::new(16)),
            )
            .await
            .unwrap();
            store.admit(&d, request_with(10)).await.unwrap();
        }
        let store = CacheStore::open(
            &config,
            Arc::new(PriorityIndex::new()),
            Arc::new(SystemClock::default()),
            Arc::new(InProcEventBus::new(16)),
        )
        .await
        .unwrap();
        assert!(store.lookup(&d).is_some());
    }
}
