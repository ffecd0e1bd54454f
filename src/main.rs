use std::{
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use clap::Parser;

use tryon_overlay::{
    DeviceHint, FittingPipeline, Frame, FrameOptions, GarmentAsset, PipelineConfig,
    model_download::{self, ModelDownloadEvent},
};

#[derive(Parser)]
#[command(name = "tryon-overlay")]
#[command(about = "Overlay a garment image on a live camera feed using body pose")]
struct Cli {
    /// Garment image (PNG with transparency works best)
    #[arg(value_name = "GARMENT")]
    garment: PathBuf,

    /// Pipeline settings in TOML
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// ONNX pose model; downloaded from $TRYON_POSE_MODEL_URL when missing
    #[arg(long, value_name = "FILE")]
    model: Option<PathBuf>,

    /// Run on a still image instead of the camera
    #[arg(long, value_name = "FILE")]
    image: Option<PathBuf>,

    /// Camera index
    #[arg(long, default_value_t = 0)]
    camera: u32,

    /// Keep the camera image unmirrored
    #[arg(long)]
    no_mirror: bool,

    /// Draw the detected skeleton on top of the overlay
    #[arg(long)]
    debug_overlay: bool,

    /// Use shoulder-matched placement instead of the affine warp
    #[arg(long)]
    placement: bool,

    /// Stop after this many camera frames
    #[arg(long)]
    frames: Option<u64>,

    /// Where composited snapshots are written
    #[arg(long, value_name = "DIR", default_value = "snapshots")]
    output: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Cli::parse();

    let config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    let model_path = args
        .model
        .clone()
        .unwrap_or_else(model_download::default_pose_model_path);
    let url = model_download::configured_pose_model_url();
    model_download::ensure_pose_model_ready(&model_path, url.as_deref(), |event| {
        if let ModelDownloadEvent::AlreadyPresent = event {
            log::info!("pose model found at {}", model_path.display());
        }
    })?;

    let garment = GarmentAsset::open(&args.garment, true, None, &config)?;
    let mut pipeline =
        FittingPipeline::initialize_with_model(garment, &model_path, DeviceHint::Cpu, config)?;
    pipeline.start_streaming();

    let options = FrameOptions {
        draw_debug_overlay: args.debug_overlay,
        use_warp: !args.placement,
    };
    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("failed to create {}", args.output.display()))?;

    match &args.image {
        Some(path) => run_still(&mut pipeline, path, options, &args.output)?,
        None => run_camera(&mut pipeline, &args, options)?,
    }

    let stats = pipeline.stats();
    pipeline.shutdown();
    log::info!(
        "done: {} frames, {} composited, {} skipped, {} dropped before inference",
        stats.frames_processed,
        stats.overlays_composited,
        stats.frames_skipped,
        stats.frames_dropped
    );
    Ok(())
}

/// Feeds the same image until a pose arrives, then writes the composite.
fn run_still(
    pipeline: &mut FittingPipeline,
    path: &Path,
    options: FrameOptions,
    output: &Path,
) -> Result<()> {
    let image = image::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .to_rgba8();
    let frame = Frame::from_image(image);
    let deadline = Instant::now() + Duration::from_secs(10);

    while Instant::now() < deadline {
        let composited_before = pipeline.stats().overlays_composited;
        let out = pipeline.process_frame(frame.clone(), options);
        if pipeline.stats().overlays_composited > composited_before {
            return save_snapshot(&out, &output.join("still.png"));
        }
        thread::sleep(Duration::from_millis(30));
    }
    log::warn!("no usable pose found in {}", path.display());
    Ok(())
}

#[cfg(feature = "camera-nokhwa")]
fn run_camera(pipeline: &mut FittingPipeline, args: &Cli, options: FrameOptions) -> Result<()> {
    use crossbeam_channel::{RecvTimeoutError, bounded};
    use nokhwa::utils::CameraIndex;
    use tryon_overlay::pipeline::start_camera_stream;

    const SNAPSHOT_EVERY: u64 = 300;

    let (frame_tx, frame_rx) = bounded(1);
    let stream = start_camera_stream(CameraIndex::Index(args.camera), !args.no_mirror, frame_tx)?;

    let mut count = 0u64;
    let mut window_start = Instant::now();
    let mut window_frames = 0u32;
    loop {
        let frame = match frame_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("no camera frame for 2s");
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let out = pipeline.process_frame(frame, options);
        count += 1;
        window_frames += 1;

        if count % SNAPSHOT_EVERY == 0 {
            let path = args.output.join(format!("frame_{count:06}.png"));
            if let Err(err) = save_snapshot(&out, &path) {
                log::warn!("snapshot failed: {err:?}");
            }
        }

        let elapsed = window_start.elapsed();
        if elapsed >= Duration::from_secs(2) {
            let stats = pipeline.stats();
            log::info!(
                "{:.1} fps, inference every {:?}, {} composited",
                window_frames as f32 / elapsed.as_secs_f32(),
                stats.measured_inference_interval,
                stats.overlays_composited
            );
            window_start = Instant::now();
            window_frames = 0;
        }

        if args.frames.is_some_and(|limit| count >= limit) {
            break;
        }
    }

    log::info!(
        "camera delivered {} frames ({} missed while busy, {} undecodable)",
        stream.delivered(),
        stream.dropped(),
        stream.decode_errors()
    );
    stream.stop();
    Ok(())
}

#[cfg(not(feature = "camera-nokhwa"))]
fn run_camera(_pipeline: &mut FittingPipeline, _args: &Cli, _options: FrameOptions) -> Result<()> {
    anyhow::bail!("built without camera support; pass --image")
}

fn save_snapshot(frame: &Frame, path: &Path) -> Result<()> {
    let image = frame
        .to_image()
        .context("frame buffer does not match its dimensions")?;
    image
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    log::info!("wrote {}", path.display());
    Ok(())
}
