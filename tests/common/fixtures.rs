use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use image::{DynamicImage, Rgba, RgbaImage};
use tryon_overlay::{
    FittingPipeline, Frame, FrameOptions, GarmentAsset, Keypoint, KeypointIndex, KeypointSet,
    PipelineConfig, PoseEstimator,
};

pub const FRAME_W: u32 = 640;
pub const FRAME_H: u32 = 480;
pub const BACKGROUND: [u8; 4] = [40, 60, 200, 255];
pub const GARMENT_COLOR: [u8; 4] = [220, 30, 30, 255];

/// Garment silhouette width in pixels: columns 40..=159 of a 200 px canvas.
pub const GARMENT_SHOULDER_WIDTH: f32 = 119.0;

/// 200x240 transparent canvas with an opaque block for the shirt body.
pub fn garment_image() -> RgbaImage {
    RgbaImage::from_fn(200, 240, |x, y| {
        if (40..160).contains(&x) && (20..220).contains(&y) {
            Rgba(GARMENT_COLOR)
        } else {
            Rgba([0, 0, 0, 0])
        }
    })
}

pub fn garment(config: &PipelineConfig) -> GarmentAsset {
    GarmentAsset::load(DynamicImage::ImageRgba8(garment_image()), true, None, config)
        .expect("synthetic garment loads")
}

/// Shirt with a tall collar: the body block starts at row 64, so the widest
/// row (and the shoulder line) is there, and the collar above it reaches well
/// over the wearer's face once warped.
pub fn collar_garment_image() -> RgbaImage {
    RgbaImage::from_fn(200, 350, |x, y| {
        let body = (40..160).contains(&x) && (64..344).contains(&y);
        let collar = (70..130).contains(&x) && y < 64;
        if body || collar {
            Rgba(GARMENT_COLOR)
        } else {
            Rgba([0, 0, 0, 0])
        }
    })
}

pub fn collar_garment(config: &PipelineConfig) -> GarmentAsset {
    GarmentAsset::load(DynamicImage::ImageRgba8(collar_garment_image()), true, None, config)
        .expect("collar garment loads")
}

/// Small timeouts so the worker reacts within a few milliseconds.
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.set_batch_size(1).unwrap();
    config.set_frame_timeout_ms(5).unwrap();
    config.set_inference_interval(0.01).unwrap();
    config.set_inference_scale(0.5).unwrap();
    config.set_shutdown_timeout_ms(2_000).unwrap();
    config
}

pub fn blank_frame() -> Frame {
    let image = RgbaImage::from_pixel(FRAME_W, FRAME_H, Rgba(BACKGROUND));
    Frame::from_image(image)
}

/// A frontal pose in 640x480 coordinates; shoulders 205 px apart at y = 200.
pub fn frontal_pose() -> KeypointSet {
    use KeypointIndex::*;
    let mut set = KeypointSet::default();
    let mut put = |index, x, y| *set.get_mut(index) = Keypoint::new(x, y, 0.9);
    put(Nose, 320.0, 110.0);
    put(LeftEye, 305.0, 95.0);
    put(RightEye, 335.0, 95.0);
    put(LeftEar, 290.0, 100.0);
    put(RightEar, 350.0, 100.0);
    put(LeftShoulder, 218.0, 200.0);
    put(RightShoulder, 423.0, 200.0);
    put(LeftElbow, 190.0, 300.0);
    put(RightElbow, 450.0, 300.0);
    put(LeftHip, 250.0, 420.0);
    put(RightHip, 390.0, 420.0);
    set
}

/// Returns a fixed pose, rescaled to whatever frame size it is handed.
pub struct StubEstimator {
    pose: Option<KeypointSet>,
    delay: Duration,
    calls: AtomicUsize,
}

impl StubEstimator {
    pub fn new(pose: KeypointSet) -> Arc<Self> {
        Self::delayed(pose, Duration::ZERO)
    }

    pub fn delayed(pose: KeypointSet, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            pose: Some(pose),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    /// Sees nobody in any frame.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            pose: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PoseEstimator for StubEstimator {
    fn infer(&self, frame: &Frame) -> anyhow::Result<Vec<KeypointSet>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        Ok(self
            .pose
            .map(|pose| {
                pose.scaled(
                    frame.width as f32 / FRAME_W as f32,
                    frame.height as f32 / FRAME_H as f32,
                )
            })
            .into_iter()
            .collect())
    }
}

pub struct FailingEstimator {
    pub calls: AtomicUsize,
}

impl FailingEstimator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

impl PoseEstimator for FailingEstimator {
    fn infer(&self, _frame: &Frame) -> anyhow::Result<Vec<KeypointSet>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("accelerator fell over")
    }
}

pub fn streaming_pipeline(estimator: Arc<dyn PoseEstimator>) -> FittingPipeline {
    let config = test_config();
    let garment = garment(&config);
    let pipeline = FittingPipeline::initialize(garment, estimator, config).unwrap();
    assert!(pipeline.start_streaming());
    pipeline
}

/// Feeds `frame` until one call composites an overlay, returning that output.
pub fn wait_for_overlay(
    pipeline: &mut FittingPipeline,
    frame: &Frame,
    options: FrameOptions,
    timeout: Duration,
) -> Option<Frame> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let before = pipeline.stats().overlays_composited;
        let out = pipeline.process_frame(frame.clone(), options);
        if pipeline.stats().overlays_composited > before {
            return Some(out);
        }
        thread::sleep(Duration::from_millis(5));
    }
    None
}

/// Feeds `frame` until the pipeline has taken in at least one pose result.
pub fn wait_for_results(pipeline: &mut FittingPipeline, frame: &Frame, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        pipeline.process_frame(frame.clone(), FrameOptions::default());
        if pipeline.stats().results_received > 0 {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Every channel within `tolerance` of `expected`.
pub fn near(actual: [u8; 4], expected: [u8; 4], tolerance: u8) -> bool {
    actual
        .iter()
        .zip(expected.iter())
        .all(|(a, e)| a.abs_diff(*e) <= tolerance)
}

pub fn pixel(frame: &Frame, x: u32, y: u32) -> [u8; 4] {
    let i = ((y * frame.width + x) * 4) as usize;
    [frame.rgba[i], frame.rgba[i + 1], frame.rgba[i + 2], frame.rgba[i + 3]]
}
