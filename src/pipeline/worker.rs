use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::cache::{AdmitOutcome, AdmitRequest, CacheStore, PipelineStage, RejectReason};
use crate::clock::Clock;
use crate::digest::Digest;
use crate::error::CoreError;
use crate::events::{CoreEvent, EventMeta, InProcEventBus};
use crate::hash::ContentHasher;
use crate::pipeline::collaborators::{FaceDetector, Fs, RawDecoder, ThumbnailCropper};
use crate::pipeline::task::{Task, TaskState};

/// Runs a single task through every pipeline stage (component C3):
/// Hashing -> cache probe -> DecodingRaw (advisory) -> DetectingFaces
/// (mandatory) -> GeneratingThumbnails (mandatory) -> admission.
/// Cancellation is cooperative and only observed between stages (spec
/// §4.3) — a stage already running always finishes.
pub struct PipelineWorker {
    hasher: Arc<dyn ContentHasher>,
    decoder: Arc<dyn RawDecoder>,
    detector: Arc<dyn FaceDetector>,
    cropper: Arc<dyn ThumbnailCropper>,
    fs: Arc<dyn Fs>,
    store: Arc<CacheStore>,
    events: Arc<InProcEventBus>,
    clock: Arc<dyn Clock>,
    raw_extensions: Arc<BTreeSet<String>>,
}

impl std::fmt::Debug for PipelineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineWorker").field("raw_extensions", &self.raw_extensions).finish()
    }
}

impl PipelineWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hasher: Arc<dyn ContentHasher>,
        decoder: Arc<dyn RawDecoder>,
        detector: Arc<dyn FaceDetector>,
        cropper: Arc<dyn ThumbnailCropper>,
        fs: Arc<dyn Fs>,
        store: Arc<CacheStore>,
        events: Arc<InProcEventBus>,
        clock: Arc<dyn Clock>,
        raw_extensions: Arc<BTreeSet<String>>,
    ) -> Self {
        Self { hasher, decoder, detector, cropper, fs, store, events, clock, raw_extensions }
    }

    fn meta(&self, task: &Task, digest: Option<Digest>) -> EventMeta {
        EventMeta { path: task.path.clone(), digest, at: self.clock.now() }
    }

    fn is_raw(&self, task: &Task) -> bool {
        task.path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.raw_extensions.contains(&e.to_lowercase()))
            .unwrap_or(false)
    }

    fn stage_changed(&self, task: &Task, digest: Option<Digest>, stage: PipelineStage) {
        self.events.publish(CoreEvent::TaskStageChanged { meta: self.meta(task, digest), stage });
    }

    fn cancelled(&self, stage: PipelineStage) -> TaskState {
        self.fail(None, stage, None, CoreError::Cancelled)
    }

    pub async fn run(&self, task: &Task) -> TaskState {
        let span = info_span!("pipeline_task", path = %task.path.display(), task_id = %task.id);
        self.run_inner(task).instrument(span).await
    }

    async fn run_inner(&self, task: &Task) -> TaskState {
        self.stage_changed(task, None, PipelineStage::Hashing);
        debug!(path = %task.path.display(), "hashing");
        let digest = match self.hasher.hash(&task.path).await {
            Ok(d) => d,
            Err(CoreError::FileMissing { .. }) => {
                self.events.publish(CoreEvent::FileMissing { meta: self.meta(task, None) });
                return TaskState::MissingFile;
            }
            Err(err) => return self.fail(Some(task), PipelineStage::Hashing, None, err),
        };

        if !task.force {
            match self.store.lookup_verified(&digest).await {
                Ok(Some(_)) => {
                    self.events.publish(CoreEvent::AlreadyProcessed { meta: self.meta(task, Some(digest)) });
                    return TaskState::AlreadyProcessed;
                }
                Ok(None) => {}
                Err(err) => return self.fail(Some(task), PipelineStage::Hashing, Some(digest), err),
            }
        }

        if task.cancel.is_cancelled() {
            return self.cancelled(PipelineStage::Hashing);
        }

        let mut stages_done = vec![PipelineStage::Hashing];
        let mut decoded_preview = None;

        if self.is_raw(task) {
            self.stage_changed(task, Some(digest.clone()), PipelineStage::DecodingRaw);
            match self.decoder.decode(&task.path).await {
                Ok(bytes) => {
                    decoded_preview = Some(bytes);
                    stages_done.push(PipelineStage::DecodingRaw);
                }
                Err(err) => {
                    warn!(%digest, %err, "raw decode failed, proceeding without preview");
                }
            }
        }

        if task.cancel.is_cancelled() {
            return self.cancelled(PipelineStage::DecodingRaw);
        }

        let source_bytes = match &decoded_preview {
            Some(bytes) => bytes.clone(),
            None => match self.fs.read(&task.path).await {
                Ok(bytes) => bytes,
                Err(CoreError::FileMissing { .. }) => {
                    self.events.publish(CoreEvent::FileMissing { meta: self.meta(task, Some(digest)) });
                    return TaskState::MissingFile;
                }
                Err(err) => return self.fail(Some(task), PipelineStage::DecodingRaw, Some(digest), err),
            },
        };

        self.stage_changed(task, Some(digest.clone()), PipelineStage::DetectingFaces);
        debug!(%digest, "detecting faces");
        let bboxes = match self.detector.detect(&source_bytes).await {
            Ok(b) => b,
            Err(err) => return self.fail(Some(task), PipelineStage::DetectingFaces, Some(digest), err),
        };
        stages_done.push(PipelineStage::DetectingFaces);

        if task.cancel.is_cancelled() {
            return self.cancelled(PipelineStage::DetectingFaces);
        }

        self.stage_changed(task, Some(digest.clone()), PipelineStage::GeneratingThumbnails);
        debug!(%digest, faces = bboxes.len(), "generating thumbnails");
        let thumbnails = match self.cropper.crop(&source_bytes, &bboxes).await {
            Ok(t) => t,
            Err(err) => return self.fail(Some(task), PipelineStage::GeneratingThumbnails, Some(digest), err),
        };
        stages_done.push(PipelineStage::GeneratingThumbnails);

        let request = AdmitRequest { decoded_preview, thumbnails, face_bboxes: bboxes, stages_done };
        match self.store.admit(&digest, request).await {
            Ok(AdmitOutcome::Admitted) | Ok(AdmitOutcome::Replaced) => {
                info!(%digest, "task completed and admitted");
                self.events.publish(CoreEvent::TaskCompleted { meta: self.meta(task, Some(digest)) });
                TaskState::Completed
            }
            Ok(AdmitOutcome::Rejected(RejectReason::StorageFull)) => {
                warn!(%digest, "admission rejected, storage full: running a single eviction tick");
                if let Err(err) = self.store.tick_eviction().await {
                    error!(%digest, %err, "eviction tick itself failed");
                }
                self.fail(Some(task), PipelineStage::GeneratingThumbnails, Some(digest), CoreError::StorageFull)
            }
            Err(err) => self.fail(Some(task), PipelineStage::GeneratingThumbnails, Some(digest), err),
        }
    }

    fn fail(
        &self,
        task: Option<&Task>,
        stage: PipelineStage,
        digest: Option<Digest>,
        err: CoreError,
    ) -> TaskState {
        let reason = err.to_string();
        let error_kind = err.kind();
        error!(stage = ?stage, error_kind, %reason, "task failed");
        if let Some(task) = task {
            self.events.publish(CoreEvent::TaskErrored {
                meta: self.meta(task, digest),
                stage,
                error_kind,
                reason: reason.clone(),
            });
        }
        TaskState::Errored { stage, error_kind, reason }
    }
}
