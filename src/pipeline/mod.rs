pub mod collaborators;
pub mod task;
pub mod worker;

pub use collaborators::{FaceDetector, Fs, RawDecoder, ThumbnailCropper, TokioFs};
pub use task::{Task, TaskState};
pub use worker::PipelineWorker;
