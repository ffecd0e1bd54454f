//! Bounded freshest-wins channels between the caller and the inference worker.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use crate::types::{Frame, PoseResult};

/// A frame queued for inference, possibly downscaled from the caller's resolution.
#[derive(Clone, Debug)]
pub struct FrameJob {
    pub frame: Frame,
    pub original_width: u32,
    pub original_height: u32,
    pub submitted_at: Instant,
}

impl FrameJob {
    pub fn new(frame: Frame, original_width: u32, original_height: u32) -> Self {
        Self {
            frame,
            original_width,
            original_height,
            submitted_at: Instant::now(),
        }
    }

    /// Factors mapping inference-frame coordinates back to the original resolution.
    pub fn upscale_factors(&self) -> (f32, f32) {
        let sx = self.original_width as f32 / self.frame.width.max(1) as f32;
        let sy = self.original_height as f32 / self.frame.height.max(1) as f32;
        (sx, sy)
    }
}

#[derive(Debug)]
pub enum WorkItem {
    Frame(FrameJob),
    Shutdown,
}

/// Caller side of the ingestion queue.
///
/// Holds a receiver clone so stale frames can be evicted before a new one is
/// inserted; the queue therefore never exceeds its capacity.
#[derive(Debug)]
pub struct FrameQueue {
    tx: Sender<WorkItem>,
    evict: Receiver<WorkItem>,
    capacity: usize,
    dropped: u64,
}

/// Worker side of the ingestion queue.
#[derive(Debug)]
pub struct FrameReceiver {
    rx: Receiver<WorkItem>,
}

pub fn frame_queue(capacity: usize) -> (FrameQueue, FrameReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (
        FrameQueue {
            tx,
            evict: rx.clone(),
            capacity,
            dropped: 0,
        },
        FrameReceiver { rx },
    )
}

impl FrameQueue {
    /// Enqueues `job`, discarding the oldest pending frames first. Never blocks.
    pub fn submit(&mut self, job: FrameJob) {
        while self.tx.len() >= self.capacity {
            match self.evict.try_recv() {
                Ok(WorkItem::Frame(_)) => self.dropped += 1,
                Ok(WorkItem::Shutdown) => {
                    // Keep the sentinel ahead of anything newer.
                    let _ = self.tx.try_send(WorkItem::Shutdown);
                    return;
                }
                Err(_) => break,
            }
        }
        match self.tx.try_send(WorkItem::Frame(job)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.dropped += 1,
            Err(TrySendError::Disconnected(_)) => {
                log::trace!("inference worker gone, frame dropped");
            }
        }
    }

    /// Drops every pending frame and queues the shutdown sentinel.
    pub fn send_shutdown(&mut self) {
        while let Ok(item) = self.evict.try_recv() {
            if matches!(item, WorkItem::Frame(_)) {
                self.dropped += 1;
            }
        }
        if let Err(err) = self.tx.try_send(WorkItem::Shutdown) {
            log::debug!("shutdown sentinel not delivered: {err}");
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames discarded by the freshest-wins policy so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Pending frames, oldest first, removed from the queue.
    pub fn drain(&mut self) -> Vec<FrameJob> {
        self.evict
            .try_iter()
            .filter_map(|item| match item {
                WorkItem::Frame(job) => Some(job),
                WorkItem::Shutdown => None,
            })
            .collect()
    }
}

impl FrameReceiver {
    pub fn recv_timeout(&self, timeout: Duration) -> Result<WorkItem, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<WorkItem, TryRecvError> {
        self.rx.try_recv()
    }
}

/// Worker side of the result channel: publishing evicts the oldest result when full.
#[derive(Debug)]
pub struct ResultPublisher {
    tx: Sender<PoseResult>,
    evict: Receiver<PoseResult>,
}

/// Caller side of the result channel.
#[derive(Debug)]
pub struct ResultReceiver {
    rx: Receiver<PoseResult>,
}

pub fn result_channel(capacity: usize) -> (ResultPublisher, ResultReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    (
        ResultPublisher {
            tx,
            evict: rx.clone(),
        },
        ResultReceiver { rx },
    )
}

impl ResultPublisher {
    pub fn publish(&self, result: PoseResult) {
        let mut pending = result;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    let _ = self.evict.try_recv();
                    pending = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

impl ResultReceiver {
    /// Every result published since the last call, oldest first. Never blocks.
    pub fn drain(&self) -> Vec<PoseResult> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeypointSet;

    fn job(tag: u8) -> FrameJob {
        FrameJob::new(Frame::new(vec![tag; 4], 1, 1), 1, 1)
    }

    fn result(tag: u32) -> PoseResult {
        let now = Instant::now();
        PoseResult {
            keypoints: KeypointSet::default(),
            source_width: tag,
            source_height: 1,
            captured_at: now,
            published_at: now,
            inference_time: Duration::ZERO,
        }
    }

    #[test]
    fn burst_keeps_only_the_newest_frames() {
        let (mut queue, _rx) = frame_queue(2);
        for tag in 0..10u8 {
            queue.submit(job(tag));
            assert!(queue.len() <= 2);
        }
        let kept: Vec<u8> = queue.drain().iter().map(|j| j.frame.rgba[0]).collect();
        assert_eq!(kept, vec![8, 9]);
        assert_eq!(queue.dropped(), 8);
    }

    #[test]
    fn shutdown_replaces_pending_frames() {
        let (mut queue, rx) = frame_queue(1);
        queue.submit(job(1));
        queue.send_shutdown();
        assert!(matches!(rx.try_recv(), Ok(WorkItem::Shutdown)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn submit_after_shutdown_keeps_sentinel() {
        let (mut queue, rx) = frame_queue(1);
        queue.send_shutdown();
        queue.submit(job(3));
        assert!(matches!(rx.try_recv(), Ok(WorkItem::Shutdown)));
    }

    #[test]
    fn full_result_channel_evicts_oldest() {
        let (publisher, receiver) = result_channel(2);
        for tag in 0..5 {
            publisher.publish(result(tag));
        }
        let tags: Vec<u32> = receiver.drain().iter().map(|r| r.source_width).collect();
        assert_eq!(tags, vec![3, 4]);
        assert!(receiver.is_empty());
    }

    #[test]
    fn upscale_factors_follow_original_size() {
        let job = FrameJob::new(Frame::new(vec![0; 4 * 64 * 48], 64, 48), 128, 96);
        assert_eq!(job.upscale_factors(), (2.0, 2.0));
    }
}
