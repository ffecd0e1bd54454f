//! Real-time garment overlay for live video, driven by 2-D body pose.
//!
//! Frames go in through [`FittingPipeline::process_frame`]; pose estimation runs
//! on a background worker and the overlay always uses the freshest pose that is
//! already available, so the caller's frame loop never waits on inference.

pub mod config;
pub mod error;
pub mod fitting;
pub mod garment;
pub mod model_download;
pub mod pipeline;
pub mod pose;
pub mod types;

pub use config::PipelineConfig;
pub use error::{ConfigError, FittingError, Result};
pub use garment::{BackgroundRemover, GarmentAsset, GarmentKeypoints};
pub use pipeline::{FittingPipeline, FrameOptions, LifecycleState, PipelineStats};
pub use pose::{DeviceHint, PoseEstimator};
pub use types::{Frame, Keypoint, KeypointIndex, KeypointSet, PoseResult};
