use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rayon::prelude::*;

use super::queue::{FrameJob, FrameReceiver, ResultPublisher, WorkItem};
use crate::{
    config::PipelineConfig,
    error::{FittingError, Result},
    pose::PoseEstimator,
    types::{KeypointSet, PoseResult},
};

const PACING_SLICE: Duration = Duration::from_millis(5);
const FAILURE_LOG_EVERY: u64 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Collecting = 1,
    Inferring = 2,
    Publishing = 3,
    Stopped = 4,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Collecting,
            2 => WorkerState::Inferring,
            3 => WorkerState::Publishing,
            4 => WorkerState::Stopped,
            _ => WorkerState::Idle,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub frame_timeout: Duration,
    pub inference_interval: Duration,
}

impl From<&PipelineConfig> for WorkerSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size(),
            frame_timeout: config.frame_timeout(),
            inference_interval: config.inference_interval(),
        }
    }
}

/// Owner of the background inference thread.
#[derive(Debug)]
pub struct WorkerHandle {
    handle: Option<thread::JoinHandle<()>>,
    state: Arc<AtomicU8>,
    stop: Arc<AtomicBool>,
    exited: Receiver<()>,
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && self.state() != WorkerState::Stopped
    }

    /// Asks the loop to stop pacing early; the shutdown sentinel does the rest.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Waits up to `timeout` for the thread to exit. Returns `false` if it had
    /// to be detached instead.
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    log::error!("inference worker panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("inference worker did not stop within {timeout:?}, detaching");
                false
            }
        }
    }
}

/// Starts the worker loop on a named thread. The estimator handle moves into the thread.
pub fn spawn_worker(
    estimator: Arc<dyn PoseEstimator>,
    frames: FrameReceiver,
    results: ResultPublisher,
    settings: WorkerSettings,
) -> Result<WorkerHandle> {
    let state = Arc::new(AtomicU8::new(WorkerState::Idle as u8));
    let stop = Arc::new(AtomicBool::new(false));
    let (exited_tx, exited) = crossbeam_channel::bounded(1);

    let worker = Worker {
        estimator,
        frames,
        results,
        settings,
        state: state.clone(),
        stop: stop.clone(),
        pool: None,
        consecutive_failures: 0,
    };

    let handle = thread::Builder::new()
        .name("pose-inference".into())
        .spawn(move || {
            let _exit = ExitSignal(exited_tx);
            worker.run();
        })
        .map_err(FittingError::WorkerSpawn)?;

    Ok(WorkerHandle {
        handle: Some(handle),
        state,
        stop,
        exited,
    })
}

/// Fires on drop so the owner can tell the thread finished, even after a panic.
struct ExitSignal(Sender<()>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

struct Worker {
    estimator: Arc<dyn PoseEstimator>,
    frames: FrameReceiver,
    results: ResultPublisher,
    settings: WorkerSettings,
    state: Arc<AtomicU8>,
    stop: Arc<AtomicBool>,
    pool: Option<rayon::ThreadPool>,
    consecutive_failures: u64,
}

impl Worker {
    fn run(mut self) {
        let streams = self.estimator.parallel_streams();
        if streams > 1 {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(streams)
                .thread_name(|i| format!("pose-stream-{i}"))
                .build()
            {
                Ok(pool) => self.pool = Some(pool),
                Err(err) => log::warn!("parallel inference pool unavailable: {err}"),
            }
        }
        log::info!(
            "inference worker started ({}, {} stream(s), batch {})",
            self.estimator.label(),
            streams,
            self.settings.batch_size
        );

        let mut batch = Vec::with_capacity(self.settings.batch_size);
        loop {
            self.set_state(WorkerState::Collecting);
            let shutdown = self.collect(&mut batch);
            if shutdown {
                break;
            }
            if batch.is_empty() {
                self.set_state(WorkerState::Idle);
                continue;
            }

            self.set_state(WorkerState::Inferring);
            let started = Instant::now();
            let outputs = self.infer_batch(&batch);
            let per_frame = started.elapsed() / batch.len() as u32;

            self.set_state(WorkerState::Publishing);
            for (job, output) in batch.drain(..).zip(outputs) {
                self.publish(job, output, per_frame);
            }

            self.pace(started);
        }

        self.set_state(WorkerState::Stopped);
        log::info!("inference worker stopped");
    }

    fn set_state(&self, state: WorkerState) {
        let prev = self.state.swap(state as u8, Ordering::AcqRel);
        if prev != state as u8 {
            log::trace!("worker {:?} -> {:?}", WorkerState::from_u8(prev), state);
        }
    }

    /// Fills `batch` up to `batch_size`; the first frame gets the full timeout,
    /// later ones half of it. Returns `true` once shutdown was requested.
    fn collect(&self, batch: &mut Vec<FrameJob>) -> bool {
        let mut timeout = self.settings.frame_timeout;
        while batch.len() < self.settings.batch_size {
            match self.frames.recv_timeout(timeout) {
                Ok(WorkItem::Frame(job)) => {
                    batch.push(job);
                    timeout = self.settings.frame_timeout / 2;
                }
                Ok(WorkItem::Shutdown) | Err(RecvTimeoutError::Disconnected) => return true,
                Err(RecvTimeoutError::Timeout) => break,
            }
        }
        false
    }

    fn infer_batch(&self, batch: &[FrameJob]) -> Vec<anyhow::Result<Vec<KeypointSet>>> {
        if let Some(pool) = self.pool.as_ref().filter(|_| batch.len() > 1) {
            match infer_parallel(pool, self.estimator.as_ref(), batch) {
                Ok(outputs) => return outputs.into_iter().map(Ok).collect(),
                Err(err) => {
                    log::warn!("parallel inference failed, rerunning batch sequentially: {err:?}")
                }
            }
        }
        batch
            .iter()
            .map(|job| self.estimator.infer(&job.frame))
            .collect()
    }

    fn publish(
        &mut self,
        job: FrameJob,
        output: anyhow::Result<Vec<KeypointSet>>,
        inference_time: Duration,
    ) {
        match output {
            Ok(instances) => {
                self.consecutive_failures = 0;
                let Some(first) = instances.first() else {
                    log::trace!("no person in frame");
                    return;
                };
                let (sx, sy) = job.upscale_factors();
                self.results.publish(PoseResult {
                    keypoints: first.scaled(sx, sy),
                    source_width: job.original_width,
                    source_height: job.original_height,
                    captured_at: job.frame.timestamp,
                    published_at: Instant::now(),
                    inference_time,
                });
            }
            Err(err) => {
                self.consecutive_failures += 1;
                let err = FittingError::InferenceFailure(format!("{err:#}"));
                if self.consecutive_failures == 1
                    || self.consecutive_failures % FAILURE_LOG_EVERY == 0
                {
                    log::warn!("{err} ({} in a row)", self.consecutive_failures);
                } else {
                    log::debug!("{err}");
                }
            }
        }
    }

    /// Sleeps out the rest of `inference_interval` in short slices so a stop
    /// request is noticed promptly.
    fn pace(&self, started: Instant) {
        let target = self.settings.inference_interval;
        while !self.stop.load(Ordering::Relaxed) {
            let elapsed = started.elapsed();
            if elapsed >= target {
                break;
            }
            thread::sleep((target - elapsed).min(PACING_SLICE));
        }
    }
}

/// One frame per pool thread; `install` returns only after every call has finished.
fn infer_parallel(
    pool: &rayon::ThreadPool,
    estimator: &dyn PoseEstimator,
    batch: &[FrameJob],
) -> anyhow::Result<Vec<Vec<KeypointSet>>> {
    pool.install(|| {
        batch
            .par_iter()
            .map(|job| estimator.infer(&job.frame))
            .collect()
    })
}
