use serde::{Deserialize, Serialize};

/// Total, ordered pipeline stages (spec §3). The set is closed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum PipelineStage {
    Hashing,
    DecodingRaw,
    DetectingFaces,
    GeneratingThumbnails,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 4] = [
        PipelineStage::Hashing,
        PipelineStage::DecodingRaw,
        PipelineStage::DetectingFaces,
        PipelineStage::GeneratingThumbnails,
    ];
}

/// Axis-aligned bounding box in detector-output order; never re-sorted.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

/// Per-digest cache record (spec §3 "Artifact").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    pub decoded_preview: Option<std::path::PathBuf>,
    pub face_bboxes: Vec<BBox>,
    pub thumbnails_present: bool,
    pub completed_at: u64,
    pub stages_done: Vec<PipelineStage>,
    /// On-disk size of everything belonging to this artifact, in bytes.
    pub size_bytes: u64,
}

impl Artifact {
    pub fn face_count(&self) -> usize {
        self.face_bboxes.len()
    }

    /// CacheEntry invariants (spec §3): non-empty `stages_done`, and
    /// `thumbnails_present` only set once the mandatory thumbnailing stage
    /// actually ran.
    pub fn is_well_formed(&self) -> bool {
        if self.stages_done.is_empty() {
            return false;
        }
        if self.thumbnails_present && !self.stages_done.contains(&PipelineStage::GeneratingThumbnails) {
            return false;
        }
        true
    }
}

/// On-disk schema for `index/<digest>.json` (spec §6). `extra` preserves
/// unknown fields across rewrites for forward compatibility.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheEntryRecord {
    pub face_count: usize,
    pub bboxes: Vec<(i32, i32, i32, i32)>,
    pub stages_done: Vec<String>,
    pub completed_at: u64,
    pub has_preview: bool,
    pub size_bytes: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn stage_name(stage: &PipelineStage) -> &'static str {
    match stage {
        PipelineStage::Hashing => "Hashing",
        PipelineStage::DecodingRaw => "DecodingRaw",
        PipelineStage::DetectingFaces => "DetectingFaces",
        PipelineStage::GeneratingThumbnails => "GeneratingThumbnails",
    }
}

fn stage_from_name(name: &str) -> Option<PipelineStage> {
    Some(match name {
        "Hashing" => PipelineStage::Hashing,
        "DecodingRaw" => PipelineStage::DecodingRaw,
        "DetectingFaces" => PipelineStage::DetectingFaces,
        "GeneratingThumbnails" => PipelineStage::GeneratingThumbnails,
        _ => return None,
    })
}

impl From<&Artifact> for CacheEntryRecord {
    fn from(artifact: &Artifact) -> Self {
        Self {
            face_count: artifact.face_count(),
            bboxes: artifact.face_bboxes.iter().map(|b| (b.x, b.y, b.w, b.h)).collect(),
            stages_done: artifact.stages_done.iter().map(|s| stage_name(s).to_string()).collect(),
            completed_at: artifact.completed_at,
            has_preview: artifact.decoded_preview.is_some(),
            size_bytes: artifact.size_bytes,
            extra: serde_json::Map::new(),
        }
    }
}

impl CacheEntryRecord {
    /// Reconstructs an `Artifact`, resolving `decoded_preview` against `preview_path`
    /// (the blob layout's deterministic path for this digest) when `has_preview` is set.
    pub fn into_artifact(self, preview_path: Option<std::path::PathBuf>) -> Artifact {
        Artifact {
            decoded_preview: if self.has_preview { preview_path } else { None },
            face_bboxes: self
                .bboxes
                .into_iter()
                .map(|(x, y, w, h)| BBox { x, y, w, h })
                .collect(),
            thumbnails_present: self.stages_done.iter().any(|s| s == "GeneratingThumbnails"),
            completed_at: self.completed_at,
            stages_done: self.stages_done.iter().filter_map(|s| stage_from_name(s)).collect(),
            size_bytes: self.size_bytes,
        }
    }
}
