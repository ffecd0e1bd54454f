//! Webcam capture for the demo binary, feeding RGBA frames into a bounded channel.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Sender, TrySendError, bounded};
use nokhwa::{
    Buffer, Camera,
    pixel_format::RgbFormat,
    query,
    utils::{ApiBackend, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType},
};

use super::pixel_format::{self, PixelLayout};
use crate::types::Frame;

/// Consecutive read failures after which the capture thread gives up.
const MAX_READ_FAILURES: u32 = 50;
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

// Raw layouts skip the JPEG decoder, so they go first.
const CAPTURE_FORMATS: &[FrameFormat] = &[
    FrameFormat::RAWRGB,
    FrameFormat::RAWBGR,
    FrameFormat::YUYV,
    FrameFormat::NV12,
    FrameFormat::MJPEG,
    FrameFormat::GRAY,
];

#[derive(Clone, Debug)]
pub struct CameraDevice {
    pub index: CameraIndex,
    pub label: String,
}

pub fn available_cameras() -> Result<Vec<CameraDevice>> {
    Ok(query(ApiBackend::Auto)?
        .into_iter()
        .map(|info| CameraDevice {
            index: info.index().clone(),
            label: info.human_name(),
        })
        .collect())
}

/// Capture-side counters, shared with the running thread.
#[derive(Debug, Default)]
struct CaptureCounters {
    delivered: AtomicU64,
    busy_drops: AtomicU64,
    decode_errors: AtomicU64,
}

/// Handle to the capture thread. Dropping it stops and joins the thread.
#[derive(Debug)]
pub struct CameraStream {
    running: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CameraStream {
    /// Frames handed to the consumer so far.
    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }

    /// Frames discarded because the consumer still held the previous one.
    pub fn dropped(&self) -> u64 {
        self.counters.busy_drops.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.counters.decode_errors.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("camera capture thread panicked");
            }
        }
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.join();
    }
}

fn open_camera(index: &CameraIndex) -> Result<Camera> {
    let attempts = [
        RequestedFormat::with_formats(RequestedFormatType::AbsoluteHighestFrameRate, CAPTURE_FORMATS),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
    ];
    let mut last_err = None;
    for requested in attempts {
        let opened = Camera::new(index.clone(), requested).and_then(|mut camera| {
            camera.open_stream()?;
            Ok(camera)
        });
        match opened {
            Ok(camera) => return Ok(camera),
            Err(err) => last_err = Some(err),
        }
    }
    Err(match last_err {
        Some(err) => anyhow!(err).context(format!("camera {index} rejected every capture format")),
        None => anyhow!("camera {index} could not be opened"),
    })
}

fn layout_of(format: FrameFormat) -> PixelLayout {
    match format {
        FrameFormat::RAWRGB => PixelLayout::Rgb,
        FrameFormat::RAWBGR => PixelLayout::Bgr,
        FrameFormat::GRAY => PixelLayout::Gray,
        FrameFormat::YUYV => PixelLayout::Yuyv,
        FrameFormat::NV12 => PixelLayout::Nv12,
        FrameFormat::MJPEG => PixelLayout::Mjpeg,
    }
}

pub fn convert_camera_frame(buffer: &Buffer, mirror: bool) -> Result<Frame> {
    let resolution = buffer.resolution();
    pixel_format::to_frame(
        buffer.buffer(),
        resolution.width_x,
        resolution.height_y,
        layout_of(buffer.source_frame_format()),
        mirror,
    )
}

/// Opens camera `index` on a capture thread and forwards frames to `frame_tx`,
/// mirrored for a selfie preview when `mirror` is set.
///
/// Frames are offered with `try_send`; a consumer that is still busy simply
/// misses them. Returns once the camera stream is open, or with the open error.
pub fn start_camera_stream(
    index: CameraIndex,
    mirror: bool,
    frame_tx: Sender<Frame>,
) -> Result<CameraStream> {
    let running = Arc::new(AtomicBool::new(true));
    let counters = Arc::new(CaptureCounters::default());
    let (opened_tx, opened_rx) = bounded::<Result<()>>(1);

    let thread = {
        let running = running.clone();
        let counters = counters.clone();
        thread::Builder::new()
            .name("camera-capture".into())
            .spawn(move || {
                // nokhwa cameras are not Send on every backend, so open on this thread.
                let mut camera = match open_camera(&index) {
                    Ok(camera) => {
                        log::info!(
                            "camera {index} streaming {} at {} fps ({:?})",
                            camera.resolution(),
                            camera.frame_rate(),
                            camera.frame_format()
                        );
                        let _ = opened_tx.send(Ok(()));
                        camera
                    }
                    Err(err) => {
                        running.store(false, Ordering::SeqCst);
                        let _ = opened_tx.send(Err(err));
                        return;
                    }
                };
                capture_loop(&mut camera, mirror, &frame_tx, &running, &counters);
                running.store(false, Ordering::SeqCst);
            })
            .context("failed to spawn camera capture thread")?
    };

    let mut stream = CameraStream {
        running,
        counters,
        thread: Some(thread),
    };
    match opened_rx.recv() {
        Ok(Ok(())) => Ok(stream),
        Ok(Err(err)) => {
            stream.join();
            Err(err)
        }
        Err(_) => {
            stream.join();
            Err(anyhow!("camera capture thread exited before opening the camera"))
        }
    }
}

fn capture_loop(
    camera: &mut Camera,
    mirror: bool,
    frame_tx: &Sender<Frame>,
    running: &AtomicBool,
    counters: &CaptureCounters,
) {
    let mut failures = 0u32;
    while running.load(Ordering::Relaxed) {
        let buffer = match camera.frame() {
            Ok(buffer) => {
                failures = 0;
                buffer
            }
            Err(err) => {
                failures += 1;
                if failures >= MAX_READ_FAILURES {
                    log::error!("camera read failed {failures} times in a row, stopping: {err}");
                    break;
                }
                log::debug!("camera read failed: {err}");
                thread::sleep(READ_RETRY_DELAY);
                continue;
            }
        };

        let frame = match convert_camera_frame(&buffer, mirror) {
            Ok(frame) => frame,
            Err(err) => {
                counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("dropping undecodable camera frame: {err:?}");
                continue;
            }
        };

        match frame_tx.try_send(frame) {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                counters.busy_drops.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {
                log::info!("frame consumer went away, stopping capture");
                break;
            }
        }
    }
    if let Err(err) = camera.stop_stream() {
        log::warn!("failed to stop camera stream: {err}");
    }
}
