//! End-to-end scenarios (spec §8 S1-S6), driven through the full stack:
//! `PipelineCoordinator` -> `WorkerPool<PipelineWorker>` -> `PipelineWorker`
//! -> `CacheStore`, with mocked detector/decoder/cropper collaborators.

mod support;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use faceprep_core::pipeline::TokioFs;
use faceprep_core::*;
use support::{write_file, CountingDetector, FixedCropper, ManualClock, NoopDecoder};

struct Harness {
    coordinator: Arc<PipelineCoordinator<PipelineWorker>>,
    events: tokio::sync::broadcast::Receiver<CoreEvent>,
    store: Arc<CacheStore>,
    detector_calls: Arc<AtomicUsize>,
    _dir: tempfile::TempDir,
}

async fn build(budget_bytes: u64, window: WindowConfig, max_workers: usize, faces: usize) -> Harness {
    build_with_clock(budget_bytes, window, max_workers, faces, Arc::new(SystemClock::default())).await
}

async fn build_with_clock(
    budget_bytes: u64,
    window: WindowConfig,
    max_workers: usize,
    faces: usize,
    clock: Arc<dyn Clock>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let cache_config = CacheConfig { root: dir.path().join("cache"), budget_bytes, entry_overhead_bytes: 0 };
    let events = Arc::new(InProcEventBus::new(256));
    let store = Arc::new(
        CacheStore::open(&cache_config, Arc::new(PriorityIndex::new()), clock.clone(), events.clone())
            .await
            .unwrap(),
    );
    let detector_calls = Arc::new(AtomicUsize::new(0));

    let worker = Arc::new(PipelineWorker::new(
        Arc::new(Sha1FileHasher),
        Arc::new(NoopDecoder),
        Arc::new(CountingDetector { calls: detector_calls.clone(), faces }),
        Arc::new(FixedCropper),
        Arc::new(TokioFs),
        store.clone(),
        events.clone(),
        clock.clone(),
        Arc::new(Default::default()),
    ));

    let pool = WorkerPool::new(worker, events.clone(), max_workers);
    pool.clone().spawn_dispatch_loop();

    let flow: Arc<dyn FlowControl> = pool.clone();
    let rolling_window = Arc::new(RollingWindow::new(window, flow, events.clone(), store.clone()));

    let rx = events.subscribe();
    let coordinator = PipelineCoordinator::new(store.clone(), pool, rolling_window, events, clock).unwrap();

    Harness { coordinator, events: rx, store, detector_calls, _dir: dir }
}

async fn wait_for<F: Fn(&CoreEvent) -> bool>(
    rx: &mut tokio::sync::broadcast::Receiver<CoreEvent>,
    timeout: Duration,
    pred: F,
) -> CoreEvent {
    tokio::time::timeout(timeout, async {
        loop {
            let event = rx.recv().await.expect("event bus closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event not observed before timeout")
}

#[tokio::test]
async fn s1_cache_hit_reruns_no_detection() {
    let mut h = build(16 * 1024, WindowConfig { max_ready_items: 15, min_queue_buffer: 10, resume_threshold: 5 }, 2, 2)
        .await;
    let path = write_file(&h._dir, "p.jpg", b"photo-bytes");

    h.coordinator.enqueue(path.clone()).await;
    wait_for(&mut h.events, Duration::from_secs(2), |e| matches!(e, CoreEvent::TaskCompleted { .. })).await;

    h.coordinator.enqueue(path).await;
    wait_for(&mut h.events, Duration::from_secs(2), |e| matches!(e, CoreEvent::AlreadyProcessed { .. })).await;

    assert_eq!(h.detector_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn s2_pause_resume_on_watermarks() {
    let window_config = WindowConfig { max_ready_items: 4, min_queue_buffer: 3, resume_threshold: 2 };
    let mut h = build(1024 * 1024, window_config, 1, 1).await;

    let mut paths = Vec::new();
    for i in 0..10 {
        paths.push(write_file(&h._dir, &format!("{i}.jpg"), format!("bytes-{i}").as_bytes()));
    }
    for path in &paths {
        h.coordinator.enqueue(path.clone()).await;
    }

    wait_for(&mut h.events, Duration::from_secs(5), |e| matches!(e, CoreEvent::WindowPaused { .. })).await;
    let status = h.coordinator.status().await;
    assert!(status.window.paused);

    for path in &paths[..2] {
        let digest = wait_digest_for(&h, path).await;
        h.coordinator.mark_consumed(&digest).await;
    }

    wait_for(&mut h.events, Duration::from_secs(5), |e| matches!(e, CoreEvent::WindowResumed { .. })).await;
    assert!(!h.coordinator.status().await.window.paused);
}

async fn wait_digest_for(h: &Harness, path: &PathBuf) -> Digest {
    for _ in 0..200 {
        if let Some(d) = h.coordinator.digest_for_path(path) {
            return d;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("digest for {path:?} never became available");
}

#[tokio::test]
async fn s3_priority_protects_entry_under_budget_pressure() {
    // One face => one 4-byte thumbnail and no stored preview (the source
    // files aren't raw), so each admitted artifact is 4 bytes. Budget one
    // entry's worth so admitting all three forces eviction down to one.
    let artifact_size = 4;
    let clock = Arc::new(ManualClock::default());
    let h = build_with_clock(artifact_size as u64, WindowConfig::default(), 1, 1, clock.clone())
        .await;

    let a = write_file(&h._dir, "a.jpg", b"a-bytes");
    let b = write_file(&h._dir, "b.jpg", b"b-bytes");
    let c = write_file(&h._dir, "c.jpg", b"c-bytes");

    for path in [&a, &b, &c] {
        h.coordinator.enqueue(path.clone()).await;
        wait_digest_for(&h, path).await;
        clock.advance(10);
    }

    let digest_a = wait_digest_for(&h, &a).await;
    h.coordinator.set_priority(std::collections::HashSet::from([digest_a.clone()]));

    let report = h.store.tick_eviction().await.unwrap();
    assert!(!report.evicted.contains(&digest_a));
    assert!(h.store.lookup(&digest_a).is_some());
}

#[tokio::test]
async fn s4_missing_file_mid_queue_does_not_block_siblings() {
    let mut h = build(1024 * 1024, WindowConfig::default(), 1, 1).await;
    let a = write_file(&h._dir, "a.jpg", b"a-bytes");
    let missing = h._dir.path().join("missing.jpg");
    let b = write_file(&h._dir, "b.jpg", b"b-bytes");

    h.coordinator.enqueue(a.clone()).await;
    h.coordinator.enqueue(missing.clone()).await;
    h.coordinator.enqueue(b.clone()).await;

    wait_for(&mut h.events, Duration::from_secs(3), |e| matches!(e, CoreEvent::FileMissing { .. })).await;

    let digest_a = wait_digest_for(&h, &a).await;
    let digest_b = wait_digest_for(&h, &b).await;
    assert!(h.store.lookup(&digest_a).is_some());
    assert!(h.store.lookup(&digest_b).is_some());
}

#[tokio::test]
async fn s5_rename_during_flight_still_completes_and_caches() {
    let h = build(1024 * 1024, WindowConfig::default(), 1, 1).await;
    let old_path = write_file(&h._dir, "old.jpg", b"renamed-bytes");
    let new_path = h._dir.path().join("new.jpg");

    h.coordinator.enqueue(old_path.clone()).await;
    h.coordinator.handle_rename(&old_path, new_path.clone());

    let digest = wait_digest_for_any(&h, &[old_path, new_path.clone()]).await;
    assert!(h.store.lookup(&digest).is_some());
    assert_eq!(h.coordinator.digest_for_path(&new_path), Some(digest));
}

async fn wait_digest_for_any(h: &Harness, paths: &[PathBuf]) -> Digest {
    for _ in 0..200 {
        for path in paths {
            if let Some(d) = h.coordinator.digest_for_path(path) {
                return d;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no digest became available for any of {paths:?}");
}

#[tokio::test]
async fn s6_storage_full_evicts_then_admits() {
    // Each admitted artifact is 4 bytes (one thumbnail, no stored preview).
    // Budget fits exactly one entry, so admitting a second forces eviction.
    let artifact_size = 4u64;
    let clock = Arc::new(ManualClock::default());
    let h = build_with_clock(artifact_size, WindowConfig::default(), 1, 1, clock.clone()).await;

    let a = write_file(&h._dir, "a.jpg", b"a-bytes");
    h.coordinator.enqueue(a.clone()).await;
    let digest_a = wait_digest_for(&h, &a).await;
    assert!(h.store.lookup(&digest_a).is_some());
    clock.advance(10);

    let b = write_file(&h._dir, "b.jpg", b"b-bytes");
    h.coordinator.enqueue(b.clone()).await;
    let digest_b = wait_digest_for(&h, &b).await;

    let report = h.store.tick_eviction().await.unwrap();
    assert!(h.store.lookup(&digest_b).is_some());
    assert!(report.evicted.contains(&digest_a) || h.store.lookup(&digest_a).is_none());
}
