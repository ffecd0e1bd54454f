#![allow(dead_code)]

mod fixtures;
pub use fixtures::*;

pub use tryon_overlay::{
    FittingError, FittingPipeline, Frame, FrameOptions, GarmentAsset, KeypointIndex, KeypointSet,
    LifecycleState, PipelineConfig, PoseEstimator,
};
