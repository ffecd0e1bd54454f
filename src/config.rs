use std::{fs, path::Path, time::Duration};

use serde::Deserialize;

use crate::error::ConfigError;

/// Scale margin applied on top of the shoulder-width ratio when resizing the garment.
///
/// Two tunings of the original scaling logic exist: 1.1 (live fitting path) and
/// 1.25 (batched benchmark path). The live value is the default; override with
/// [`PipelineConfig::set_shoulder_margin`].
pub const DEFAULT_SHOULDER_MARGIN: f32 = 1.1;

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_INFERENCE_INTERVAL_SECS: f32 = 0.05;
pub const DEFAULT_FRAME_TIMEOUT_MS: u64 = 15;
pub const DEFAULT_INFERENCE_SCALE: f32 = 0.65;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1;
pub const DEFAULT_RESULT_CAPACITY: usize = 4;
pub const DEFAULT_SHOULDER_CONFIDENCE: f32 = 0.3;
pub const DEFAULT_KEYPOINT_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_RESIZE_CACHE_CAPACITY: usize = 5;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 1_000;

/// Tunables for the overlay pipeline. Every value goes through a range-checked
/// setter, so a constructed config is always valid.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    batch_size: usize,
    inference_interval: Duration,
    frame_timeout: Duration,
    inference_scale: f32,
    queue_capacity: usize,
    result_capacity: usize,
    shoulder_confidence: f32,
    keypoint_confidence: f32,
    shoulder_margin: f32,
    resize_cache_capacity: usize,
    interpolation_enabled: bool,
    shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            inference_interval: Duration::from_secs_f32(DEFAULT_INFERENCE_INTERVAL_SECS),
            frame_timeout: Duration::from_millis(DEFAULT_FRAME_TIMEOUT_MS),
            inference_scale: DEFAULT_INFERENCE_SCALE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            result_capacity: DEFAULT_RESULT_CAPACITY,
            shoulder_confidence: DEFAULT_SHOULDER_CONFIDENCE,
            keypoint_confidence: DEFAULT_KEYPOINT_CONFIDENCE,
            shoulder_margin: DEFAULT_SHOULDER_MARGIN,
            resize_cache_capacity: DEFAULT_RESIZE_CACHE_CAPACITY,
            interpolation_enabled: true,
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
        }
    }
}

fn check_usize(
    field: &'static str,
    value: usize,
    min: usize,
    max: usize,
    range: &'static str,
) -> Result<usize, ConfigError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value: value.to_string(),
            range,
        })
    }
}

fn check_unit(field: &'static str, value: f32) -> Result<f32, ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value: value.to_string(),
            range: "[0, 1]",
        })
    }
}

impl PipelineConfig {
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn set_batch_size(&mut self, value: usize) -> Result<(), ConfigError> {
        self.batch_size = check_usize("batch_size", value, 1, 64, "1..=64")?;
        Ok(())
    }

    pub fn inference_interval(&self) -> Duration {
        self.inference_interval
    }

    pub fn set_inference_interval(&mut self, seconds: f32) -> Result<(), ConfigError> {
        if !seconds.is_finite() || !(0.0..=2.0).contains(&seconds) {
            return Err(ConfigError::OutOfRange {
                field: "inference_interval",
                value: seconds.to_string(),
                range: "[0, 2] seconds",
            });
        }
        self.inference_interval = Duration::from_secs_f32(seconds);
        Ok(())
    }

    pub fn frame_timeout(&self) -> Duration {
        self.frame_timeout
    }

    pub fn set_frame_timeout_ms(&mut self, value: u64) -> Result<(), ConfigError> {
        if !(1..=1_000).contains(&value) {
            return Err(ConfigError::OutOfRange {
                field: "frame_timeout_ms",
                value: value.to_string(),
                range: "1..=1000",
            });
        }
        self.frame_timeout = Duration::from_millis(value);
        Ok(())
    }

    pub fn inference_scale(&self) -> f32 {
        self.inference_scale
    }

    pub fn set_inference_scale(&mut self, value: f32) -> Result<(), ConfigError> {
        if !value.is_finite() || value <= 0.0 || value > 1.0 {
            return Err(ConfigError::OutOfRange {
                field: "inference_scale",
                value: value.to_string(),
                range: "(0, 1]",
            });
        }
        self.inference_scale = value;
        Ok(())
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn set_queue_capacity(&mut self, value: usize) -> Result<(), ConfigError> {
        self.queue_capacity = check_usize("queue_capacity", value, 1, 64, "1..=64")?;
        Ok(())
    }

    pub fn result_capacity(&self) -> usize {
        self.result_capacity
    }

    pub fn set_result_capacity(&mut self, value: usize) -> Result<(), ConfigError> {
        self.result_capacity = check_usize("result_capacity", value, 1, 64, "1..=64")?;
        Ok(())
    }

    pub fn shoulder_confidence(&self) -> f32 {
        self.shoulder_confidence
    }

    pub fn set_shoulder_confidence(&mut self, value: f32) -> Result<(), ConfigError> {
        self.shoulder_confidence = check_unit("shoulder_confidence", value)?;
        Ok(())
    }

    pub fn keypoint_confidence(&self) -> f32 {
        self.keypoint_confidence
    }

    pub fn set_keypoint_confidence(&mut self, value: f32) -> Result<(), ConfigError> {
        self.keypoint_confidence = check_unit("keypoint_confidence", value)?;
        Ok(())
    }

    pub fn shoulder_margin(&self) -> f32 {
        self.shoulder_margin
    }

    pub fn set_shoulder_margin(&mut self, value: f32) -> Result<(), ConfigError> {
        if !value.is_finite() || !(1.0..=1.5).contains(&value) {
            return Err(ConfigError::OutOfRange {
                field: "shoulder_margin",
                value: value.to_string(),
                range: "[1.0, 1.5]",
            });
        }
        self.shoulder_margin = value;
        Ok(())
    }

    pub fn resize_cache_capacity(&self) -> usize {
        self.resize_cache_capacity
    }

    pub fn set_resize_cache_capacity(&mut self, value: usize) -> Result<(), ConfigError> {
        self.resize_cache_capacity =
            check_usize("resize_cache_capacity", value, 1, 64, "1..=64")?;
        Ok(())
    }

    pub fn interpolation_enabled(&self) -> bool {
        self.interpolation_enabled
    }

    pub fn set_interpolation_enabled(&mut self, value: bool) {
        self.interpolation_enabled = value;
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn set_shutdown_timeout_ms(&mut self, value: u64) -> Result<(), ConfigError> {
        if !(1..=10_000).contains(&value) {
            return Err(ConfigError::OutOfRange {
                field: "shutdown_timeout_ms",
                value: value.to_string(),
                range: "1..=10000",
            });
        }
        self.shutdown_timeout = Duration::from_millis(value);
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content)?;
        raw.validate()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }
}

/// On-disk shape; every field optional and funnelled through the setters.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    batch_size: Option<usize>,
    inference_interval: Option<f32>,
    frame_timeout_ms: Option<u64>,
    inference_scale: Option<f32>,
    queue_capacity: Option<usize>,
    result_capacity: Option<usize>,
    shoulder_confidence: Option<f32>,
    keypoint_confidence: Option<f32>,
    shoulder_margin: Option<f32>,
    resize_cache_capacity: Option<usize>,
    interpolation_enabled: Option<bool>,
    shutdown_timeout_ms: Option<u64>,
}

impl RawConfig {
    fn validate(self) -> Result<PipelineConfig, ConfigError> {
        let mut cfg = PipelineConfig::default();
        if let Some(v) = self.batch_size {
            cfg.set_batch_size(v)?;
        }
        if let Some(v) = self.inference_interval {
            cfg.set_inference_interval(v)?;
        }
        if let Some(v) = self.frame_timeout_ms {
            cfg.set_frame_timeout_ms(v)?;
        }
        if let Some(v) = self.inference_scale {
            cfg.set_inference_scale(v)?;
        }
        if let Some(v) = self.queue_capacity {
            cfg.set_queue_capacity(v)?;
        }
        if let Some(v) = self.result_capacity {
            cfg.set_result_capacity(v)?;
        }
        if let Some(v) = self.shoulder_confidence {
            cfg.set_shoulder_confidence(v)?;
        }
        if let Some(v) = self.keypoint_confidence {
            cfg.set_keypoint_confidence(v)?;
        }
        if let Some(v) = self.shoulder_margin {
            cfg.set_shoulder_margin(v)?;
        }
        if let Some(v) = self.resize_cache_capacity {
            cfg.set_resize_cache_capacity(v)?;
        }
        if let Some(v) = self.interpolation_enabled {
            cfg.set_interpolation_enabled(v);
        }
        if let Some(v) = self.shutdown_timeout_ms {
            cfg.set_shutdown_timeout_ms(v)?;
        }
        Ok(cfg)
    }
}
