use std::time::{Duration, Instant};

use crate::types::{KeypointSet, PoseResult};

/// Weight of the newest sample in the smoothed inference interval.
const INTERVAL_SMOOTHING: f64 = 0.3;

/// Caller-side memory of the last two published poses.
///
/// Holds the last-known-good result so the compositor always has something
/// to work with, plus the measured spacing between results for interpolation.
#[derive(Debug, Default)]
pub struct PoseTracker {
    latest: Option<PoseResult>,
    previous: Option<PoseResult>,
    measured_interval: Option<Duration>,
    received: u64,
}

impl PoseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, result: PoseResult) {
        self.observe_all(std::iter::once(result));
    }

    /// Takes in everything drained from the result channel in one go.
    ///
    /// A worker batch publishes several results within microseconds, so only
    /// the newest one counts: it becomes `latest`, the old `latest` becomes
    /// `previous`, and their spacing is the single interval sample.
    pub fn observe_all<I>(&mut self, results: I)
    where
        I: IntoIterator<Item = PoseResult>,
    {
        let mut newest = None;
        let mut runner_up = None;
        for result in results {
            self.received += 1;
            runner_up = newest.replace(result);
        }
        let Some(newest) = newest else {
            return;
        };

        match self.latest.take() {
            Some(latest) => {
                let gap = newest.published_at.saturating_duration_since(latest.published_at);
                if !gap.is_zero() {
                    self.measured_interval = Some(match self.measured_interval {
                        Some(prev) => prev.mul_f64(1.0 - INTERVAL_SMOOTHING)
                            + gap.mul_f64(INTERVAL_SMOOTHING),
                        None => gap,
                    });
                }
                self.previous = Some(latest);
            }
            None => self.previous = runner_up,
        }
        self.latest = Some(newest);
    }

    pub fn latest(&self) -> Option<&PoseResult> {
        self.latest.as_ref()
    }

    pub fn measured_interval(&self) -> Option<Duration> {
        self.measured_interval
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Keypoints to use at `now`: interpolated between the last two results
    /// when enabled and possible, otherwise the latest result as is. Joints the
    /// previous result had below `threshold` are never blended.
    pub fn current(&self, now: Instant, interpolate: bool, threshold: f32) -> Option<KeypointSet> {
        let latest = self.latest.as_ref()?;
        if !interpolate {
            return Some(latest.keypoints);
        }
        let (Some(previous), Some(interval)) = (self.previous.as_ref(), self.measured_interval)
        else {
            return Some(latest.keypoints);
        };
        if !same_source(previous, latest) || interval.is_zero() {
            return Some(latest.keypoints);
        }
        let elapsed = now.saturating_duration_since(latest.published_at);
        let t = (elapsed.as_secs_f32() / interval.as_secs_f32()).clamp(0.0, 1.0);
        Some(previous.keypoints.lerp(&latest.keypoints, t, threshold))
    }

    pub fn clear(&mut self) {
        self.latest = None;
        self.previous = None;
        self.measured_interval = None;
    }
}

fn same_source(a: &PoseResult, b: &PoseResult) -> bool {
    a.source_width == b.source_width && a.source_height == b.source_height
}
