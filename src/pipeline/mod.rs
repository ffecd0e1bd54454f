#[cfg(feature = "camera-nokhwa")]
pub mod camera;
pub mod lifecycle;
pub mod pixel_format;
pub mod queue;
pub mod skeleton;
pub mod tracker;
pub mod worker;

#[cfg(feature = "camera-nokhwa")]
pub use camera::{CameraDevice, CameraStream, available_cameras, start_camera_stream};
pub use lifecycle::{LifecycleState, StreamingController};
pub use pixel_format::PixelLayout;
pub use worker::WorkerState;

use std::{
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use image::DynamicImage;

use self::{
    queue::{FrameJob, FrameQueue, ResultReceiver, frame_queue, result_channel},
    tracker::PoseTracker,
    worker::{WorkerHandle, WorkerSettings, spawn_worker},
};
use crate::{
    config::PipelineConfig,
    error::{FittingError, Result},
    fitting::{self, MaskParams, mask, warp},
    garment::{BackgroundRemover, GarmentAsset, resize_rgba_to},
    pose::{DeviceHint, OrtPoseEstimator, OrtPoseEstimatorConfig, PoseEstimator},
    types::{Frame, KeypointSet},
};

/// Per-call rendering switches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameOptions {
    pub draw_debug_overlay: bool,
    /// Three-point affine fit when set; shoulder-matched placement otherwise.
    pub use_warp: bool,
}

impl Default for FrameOptions {
    fn default() -> Self {
        Self {
            draw_debug_overlay: false,
            use_warp: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub overlays_composited: u64,
    pub frames_skipped: u64,
    pub frames_dropped: u64,
    pub results_received: u64,
    pub garment_loads: u64,
    pub garment_resizes: u64,
    pub measured_inference_interval: Option<Duration>,
}

/// The try-on compositor: owns the garment, the ingestion queue, the result
/// channel and the background inference worker.
pub struct FittingPipeline {
    config: PipelineConfig,
    garment: GarmentAsset,
    frames: FrameQueue,
    results: ResultReceiver,
    worker: Option<WorkerHandle>,
    tracker: PoseTracker,
    lifecycle: StreamingController,
    stats: PipelineStats,
}

impl FittingPipeline {
    /// Spawns the inference worker around `estimator` and leaves the pipeline
    /// ready with streaming off.
    pub fn initialize(
        garment: GarmentAsset,
        estimator: Arc<dyn PoseEstimator>,
        config: PipelineConfig,
    ) -> Result<Self> {
        let lifecycle = StreamingController::new();
        lifecycle.begin_initialize();

        let (frames, frame_rx) = frame_queue(config.queue_capacity());
        let (publisher, results) = result_channel(config.result_capacity());
        let worker = spawn_worker(estimator, frame_rx, publisher, WorkerSettings::from(&config))?;

        lifecycle.mark_ready();
        log::info!(
            "fitting pipeline ready (queue {}, results {}, inference scale {:.2})",
            config.queue_capacity(),
            config.result_capacity(),
            config.inference_scale()
        );

        Ok(Self {
            config,
            garment,
            frames,
            results,
            worker: Some(worker),
            tracker: PoseTracker::new(),
            lifecycle,
            stats: PipelineStats {
                garment_loads: 1,
                ..PipelineStats::default()
            },
        })
    }

    /// Loads the ONNX pose model at `model_path` and initializes around it.
    pub fn initialize_with_model(
        garment: GarmentAsset,
        model_path: &Path,
        device: DeviceHint,
        config: PipelineConfig,
    ) -> Result<Self> {
        if !model_path.exists() {
            return Err(FittingError::PoseModelUnavailable(format!(
                "{} does not exist",
                model_path.display()
            )));
        }
        let estimator = OrtPoseEstimator::new(model_path, device, OrtPoseEstimatorConfig::default())
            .map_err(|err| FittingError::PoseModelUnavailable(format!("{err:#}")))?;
        Self::initialize(garment, Arc::new(estimator), config)
    }

    /// Overlays the garment on `frame` using the freshest pose already available.
    ///
    /// Never waits for inference and never fails: any problem degrades to
    /// returning `frame` unchanged.
    pub fn process_frame(&mut self, frame: Frame, options: FrameOptions) -> Frame {
        if !self.lifecycle.is_streaming() || !frame.is_well_formed() {
            return frame;
        }
        self.stats.frames_processed += 1;

        self.submit_for_inference(&frame);
        self.tracker.observe_all(self.results.drain());

        let Some(keypoints) = self.current_keypoints(&frame) else {
            log::debug!("no pose available yet, passing frame through");
            self.stats.frames_skipped += 1;
            return frame;
        };

        match self.compose(&frame, &keypoints, options) {
            Ok(output) => {
                self.stats.overlays_composited += 1;
                output
            }
            Err(err) => {
                log::debug!("overlay skipped: {err}");
                self.stats.frames_skipped += 1;
                frame
            }
        }
    }

    fn submit_for_inference(&mut self, frame: &Frame) {
        let scale = self.config.inference_scale();
        let small = if scale < 1.0 {
            match downscale(frame, scale) {
                Ok(small) => small,
                Err(err) => {
                    log::warn!("inference downscale failed, submitting full frame: {err:?}");
                    frame.clone()
                }
            }
        } else {
            frame.clone()
        };
        self.frames
            .submit(FrameJob::new(small, frame.width, frame.height));
    }

    /// Tracked keypoints mapped onto this frame's resolution.
    fn current_keypoints(&self, frame: &Frame) -> Option<KeypointSet> {
        let latest = self.tracker.latest()?;
        let (src_w, src_h) = (latest.source_width, latest.source_height);
        let threshold = self
            .config
            .keypoint_confidence()
            .min(self.config.shoulder_confidence());
        let keypoints = self.tracker.current(
            Instant::now(),
            self.config.interpolation_enabled(),
            threshold,
        )?;
        if src_w == 0 || src_h == 0 || (src_w, src_h) == (frame.width, frame.height) {
            return Some(keypoints);
        }
        Some(keypoints.scaled(
            frame.width as f32 / src_w as f32,
            frame.height as f32 / src_h as f32,
        ))
    }

    fn compose(
        &mut self,
        frame: &Frame,
        keypoints: &KeypointSet,
        options: FrameOptions,
    ) -> Result<Frame> {
        let size = (frame.width, frame.height);
        let metrics = fitting::extract(
            keypoints,
            size,
            self.config.shoulder_confidence(),
            self.config.keypoint_confidence(),
        )?;

        let scaled = self.garment.resize_for_shoulder_width(metrics.shoulder_width)?;
        let garment_keypoints = self.garment.keypoints().scaled(scaled.scale);
        let mut layer = if options.use_warp {
            warp::warp(&scaled.image, &garment_keypoints, &metrics.keypoints, size)?
        } else {
            warp::place(
                &scaled.image,
                garment_keypoints.shoulder_midpoint(),
                warp::placement_target(metrics.shoulder_center),
                size,
            )
        };

        let Some(mut canvas) = frame.to_image() else {
            return Err(FittingError::Resample(
                "frame buffer does not match its dimensions".into(),
            ));
        };
        let params = MaskParams {
            keypoint_threshold: self.config.keypoint_confidence(),
            shoulder_threshold: self.config.shoulder_confidence(),
        };
        if let Some(protect) = fitting::protective_mask(keypoints, &canvas, params) {
            mask::apply(&mut layer, &protect);
        }
        fitting::composite(&mut canvas, &layer);

        let mut output = Frame {
            rgba: canvas.into_raw(),
            width: frame.width,
            height: frame.height,
            timestamp: frame.timestamp,
        };
        if options.draw_debug_overlay {
            skeleton::draw_skeleton(
                &mut output.rgba,
                output.width,
                output.height,
                keypoints,
                self.config.keypoint_confidence(),
            );
        }
        Ok(output)
    }

    pub fn start_streaming(&self) -> bool {
        self.lifecycle.start_streaming()
    }

    pub fn stop_streaming(&self) -> bool {
        self.lifecycle.stop_streaming()
    }

    pub fn is_streaming(&self) -> bool {
        self.lifecycle.is_streaming()
    }

    /// Cloneable handle to the streaming gate, for toggling from other threads.
    pub fn streaming_handle(&self) -> StreamingController {
        self.lifecycle.clone()
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn worker_state(&self) -> WorkerState {
        self.worker
            .as_ref()
            .map(WorkerHandle::state)
            .unwrap_or(WorkerState::Stopped)
    }

    /// Swaps in a new garment. The worker keeps running; cached resizes of the
    /// old garment go away with it.
    pub fn replace_garment(
        &mut self,
        image: DynamicImage,
        background_removed: bool,
        remover: Option<&dyn BackgroundRemover>,
    ) -> Result<()> {
        let garment = GarmentAsset::load(image, background_removed, remover, &self.config)?;
        self.stats.garment_loads += 1;
        self.stats.garment_resizes += self.garment.resize_count();
        self.garment = garment;
        log::info!("garment replaced");
        Ok(())
    }

    pub fn garment(&self) -> &GarmentAsset {
        &self.garment
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            frames_dropped: self.frames.dropped(),
            results_received: self.tracker.received(),
            garment_resizes: self.stats.garment_resizes + self.garment.resize_count(),
            measured_inference_interval: self.tracker.measured_interval(),
            ..self.stats.clone()
        }
    }

    /// Stops the worker (sentinel + bounded join) and drops the estimator handle.
    /// Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.lifecycle.shutdown();
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        self.frames.send_shutdown();
        worker.request_stop();
        worker.join_timeout(self.config.shutdown_timeout());
        self.tracker.clear();
        log::info!("fitting pipeline shut down");
    }
}

impl Drop for FittingPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn downscale(frame: &Frame, scale: f32) -> anyhow::Result<Frame> {
    let image = frame
        .to_image()
        .ok_or_else(|| anyhow::anyhow!("frame buffer does not match its dimensions"))?;
    let w = ((frame.width as f32 * scale).round() as u32).max(1);
    let h = ((frame.height as f32 * scale).round() as u32).max(1);
    let small = resize_rgba_to(&image, w, h)?;
    Ok(Frame {
        rgba: small.into_raw(),
        width: w,
        height: h,
        timestamp: frame.timestamp,
    })
}
