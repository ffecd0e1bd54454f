use std::time::{Duration, Instant};

use image::RgbaImage;

/// A captured video frame, always stored as tightly packed RGBA.
#[derive(Clone, Debug)]
pub struct Frame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(rgba: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            rgba,
            width,
            height,
            timestamp: Instant::now(),
        }
    }

    pub fn from_image(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height)
    }

    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.rgba.len()
                == (self.width as usize)
                    .saturating_mul(self.height as usize)
                    .saturating_mul(4)
    }

    pub fn to_image(&self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.rgba.clone())
    }

    pub fn into_image(self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.rgba)
    }
}

/// COCO-17 keypoint order, as produced by MoveNet/RTMPose style estimators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum KeypointIndex {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftEar = 3,
    RightEar = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
    LeftHip = 11,
    RightHip = 12,
    LeftKnee = 13,
    RightKnee = 14,
    LeftAnkle = 15,
    RightAnkle = 16,
}

impl KeypointIndex {
    pub const COUNT: usize = 17;

    pub const ALL: [KeypointIndex; KeypointIndex::COUNT] = [
        KeypointIndex::Nose,
        KeypointIndex::LeftEye,
        KeypointIndex::RightEye,
        KeypointIndex::LeftEar,
        KeypointIndex::RightEar,
        KeypointIndex::LeftShoulder,
        KeypointIndex::RightShoulder,
        KeypointIndex::LeftElbow,
        KeypointIndex::RightElbow,
        KeypointIndex::LeftWrist,
        KeypointIndex::RightWrist,
        KeypointIndex::LeftHip,
        KeypointIndex::RightHip,
        KeypointIndex::LeftKnee,
        KeypointIndex::RightKnee,
        KeypointIndex::LeftAnkle,
        KeypointIndex::RightAnkle,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            KeypointIndex::Nose => "nose",
            KeypointIndex::LeftEye => "left_eye",
            KeypointIndex::RightEye => "right_eye",
            KeypointIndex::LeftEar => "left_ear",
            KeypointIndex::RightEar => "right_ear",
            KeypointIndex::LeftShoulder => "left_shoulder",
            KeypointIndex::RightShoulder => "right_shoulder",
            KeypointIndex::LeftElbow => "left_elbow",
            KeypointIndex::RightElbow => "right_elbow",
            KeypointIndex::LeftWrist => "left_wrist",
            KeypointIndex::RightWrist => "right_wrist",
            KeypointIndex::LeftHip => "left_hip",
            KeypointIndex::RightHip => "right_hip",
            KeypointIndex::LeftKnee => "left_knee",
            KeypointIndex::RightKnee => "right_knee",
            KeypointIndex::LeftAnkle => "left_ankle",
            KeypointIndex::RightAnkle => "right_ankle",
        }
    }
}

/// A single landmark in pixel coordinates of the frame it was inferred on.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }

    pub fn is_valid(&self, threshold: f32) -> bool {
        self.confidence >= threshold && self.x.is_finite() && self.y.is_finite()
    }

    pub fn point(&self) -> (f32, f32) {
        (self.x, self.y)
    }
}

/// One detected person: a fixed-length COCO-17 keypoint array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeypointSet {
    pub keypoints: [Keypoint; KeypointIndex::COUNT],
}

impl KeypointSet {
    pub fn new(keypoints: [Keypoint; KeypointIndex::COUNT]) -> Self {
        Self { keypoints }
    }

    pub fn get(&self, index: KeypointIndex) -> &Keypoint {
        &self.keypoints[index as usize]
    }

    pub fn get_mut(&mut self, index: KeypointIndex) -> &mut Keypoint {
        &mut self.keypoints[index as usize]
    }

    /// Returns the landmark only when it clears `threshold`.
    pub fn confident(&self, index: KeypointIndex, threshold: f32) -> Option<(f32, f32)> {
        let kp = self.get(index);
        kp.is_valid(threshold).then(|| kp.point())
    }

    pub fn confidences(&self) -> [f32; KeypointIndex::COUNT] {
        self.keypoints.map(|kp| kp.confidence)
    }

    pub fn points(&self) -> Vec<(f32, f32)> {
        self.keypoints.iter().map(Keypoint::point).collect()
    }

    /// Multiplies every coordinate by the given factors (confidences untouched).
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            keypoints: self
                .keypoints
                .map(|kp| Keypoint::new(kp.x * sx, kp.y * sy, kp.confidence)),
        }
    }

    /// Linear blend of positions from `self` toward `next`; confidences come from `next`.
    ///
    /// Joints that `self` held below `threshold` have no usable earlier position
    /// and take `next`'s position unchanged.
    pub fn lerp(&self, next: &KeypointSet, t: f32, threshold: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        let mut keypoints = next.keypoints;
        for (out, prev) in keypoints.iter_mut().zip(self.keypoints.iter()) {
            if !prev.is_valid(threshold) {
                continue;
            }
            out.x = prev.x + (out.x - prev.x) * t;
            out.y = prev.y + (out.y - prev.y) * t;
        }
        Self { keypoints }
    }
}

impl Default for KeypointSet {
    fn default() -> Self {
        Self {
            keypoints: [Keypoint::default(); KeypointIndex::COUNT],
        }
    }
}

/// A published inference result, already mapped back to the caller's resolution.
#[derive(Clone, Debug)]
pub struct PoseResult {
    pub keypoints: KeypointSet,
    pub source_width: u32,
    pub source_height: u32,
    pub captured_at: Instant,
    pub published_at: Instant,
    pub inference_time: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypoint_index_round_trips_through_usize() {
        assert_eq!(KeypointIndex::COUNT, 17);
        assert_eq!(KeypointIndex::from_index(0), Some(KeypointIndex::Nose));
        assert_eq!(KeypointIndex::from_index(6), Some(KeypointIndex::RightShoulder));
        assert_eq!(KeypointIndex::from_index(16), Some(KeypointIndex::RightAnkle));
        assert_eq!(KeypointIndex::from_index(17), None);
    }

    #[test]
    fn confident_filters_low_scores() {
        let mut set = KeypointSet::default();
        *set.get_mut(KeypointIndex::LeftShoulder) = Keypoint::new(10.0, 20.0, 0.2);
        *set.get_mut(KeypointIndex::RightShoulder) = Keypoint::new(30.0, 20.0, 0.9);
        assert_eq!(set.confident(KeypointIndex::LeftShoulder, 0.3), None);
        assert_eq!(
            set.confident(KeypointIndex::RightShoulder, 0.3),
            Some((30.0, 20.0))
        );
    }

    #[test]
    fn lerp_moves_positions_and_keeps_latest_confidence() {
        let mut a = KeypointSet::default();
        let mut b = KeypointSet::default();
        *a.get_mut(KeypointIndex::Nose) = Keypoint::new(0.0, 0.0, 0.4);
        *b.get_mut(KeypointIndex::Nose) = Keypoint::new(10.0, 20.0, 0.8);
        let mid = a.lerp(&b, 0.5, 0.3);
        let nose = mid.get(KeypointIndex::Nose);
        assert!((nose.x - 5.0).abs() < 1e-5);
        assert!((nose.y - 10.0).abs() < 1e-5);
        assert_eq!(nose.confidence, 0.8);
    }

    #[test]
    fn lerp_skips_joints_missing_from_the_earlier_set() {
        let mut a = KeypointSet::default();
        let mut b = KeypointSet::default();
        *a.get_mut(KeypointIndex::LeftShoulder) = Keypoint::new(0.0, 0.0, 0.05);
        *b.get_mut(KeypointIndex::LeftShoulder) = Keypoint::new(218.0, 200.0, 0.9);
        let mid = a.lerp(&b, 0.1, 0.3);
        let shoulder = mid.get(KeypointIndex::LeftShoulder);
        assert_eq!((shoulder.x, shoulder.y), (218.0, 200.0));
        assert_eq!(shoulder.confidence, 0.9);
    }

    #[test]
    fn frame_shape_check() {
        let frame = Frame::new(vec![0; 4 * 4 * 3], 4, 3);
        assert!(frame.is_well_formed());
        let bad = Frame::new(vec![0; 10], 4, 3);
        assert!(!bad.is_well_formed());
    }
}
