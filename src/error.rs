use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FittingError {
    #[error("garment asset missing or unreadable: {what}")]
    AssetMissing {
        what: String,
        #[source]
        source: Option<image::ImageError>,
    },

    #[error("garment keypoints could not be detected: {0}")]
    DetectionFailed(String),

    #[error("{keypoint} confidence {confidence:.2} below threshold {threshold:.2}")]
    LowConfidence {
        keypoint: &'static str,
        confidence: f32,
        threshold: f32,
    },

    #[error("pose inference failed: {0}")]
    InferenceFailure(String),

    #[error("missing keypoints for warp: {0}")]
    MissingKeypoints(&'static str),

    #[error("image resampling failed: {0}")]
    Resample(String),

    #[error("keypoints are collinear, no affine transform exists")]
    DegenerateGeometry,

    #[error("pose model unavailable: {0}")]
    PoseModelUnavailable(String),

    #[error("failed to spawn inference worker")]
    WorkerSpawn(#[source] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} = {value} is outside the accepted range {range}")]
    OutOfRange {
        field: &'static str,
        value: String,
        range: &'static str,
    },

    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

pub type Result<T, E = FittingError> = std::result::Result<T, E>;
