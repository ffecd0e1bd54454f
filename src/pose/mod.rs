mod letterbox;
mod ort;

pub use self::letterbox::{LetterboxInfo, decode_person, prepare_frame_with_size};
pub use self::ort::{OrtPoseEstimator, OrtPoseEstimatorConfig};

use crate::types::{Frame, KeypointSet};

/// Black-box pose estimation capability consumed by the inference worker.
///
/// Implementations return every detected person; the pipeline uses instance 0.
/// Coordinates are pixels of the frame that was passed in.
pub trait PoseEstimator: Send + Sync + 'static {
    fn infer(&self, frame: &Frame) -> anyhow::Result<Vec<KeypointSet>>;

    /// Number of independent execution streams that may run `infer` concurrently.
    fn parallel_streams(&self) -> usize {
        1
    }

    fn label(&self) -> &str {
        "pose"
    }
}

/// Where the pose model should run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DeviceHint {
    #[default]
    Cpu,
    /// Hardware with `streams` independent execution queues.
    Accelerator { streams: usize },
}

impl DeviceHint {
    pub fn streams(&self) -> usize {
        match self {
            DeviceHint::Cpu => 1,
            DeviceHint::Accelerator { streams } => (*streams).max(1),
        }
    }
}
