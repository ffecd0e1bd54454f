use crate::{
    error::{FittingError, Result},
    types::{KeypointIndex, KeypointSet},
};

/// Torso height used when neither hip is confidently detected, in shoulder widths.
const TORSO_FALLBACK_RATIO: f32 = 1.5;

/// Named body joints consumed by the warp and placement stages.
///
/// Shoulders are always present; the remaining joints are `None` when their
/// confidence is below the general keypoint threshold.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BodyKeypoints {
    pub left_shoulder: (f32, f32),
    pub right_shoulder: (f32, f32),
    pub left_elbow: Option<(f32, f32)>,
    pub right_elbow: Option<(f32, f32)>,
    pub left_hip: Option<(f32, f32)>,
    pub right_hip: Option<(f32, f32)>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BodyMetrics {
    pub shoulder_center: (f32, f32),
    pub shoulder_width: f32,
    pub torso_height: f32,
    pub keypoints: BodyKeypoints,
}

/// Turns a frame-space keypoint set into the measurements used for fitting.
///
/// Fails with [`FittingError::LowConfidence`] when either shoulder is below
/// `shoulder_threshold`; callers skip the overlay for that frame.
pub fn extract(
    keypoints: &KeypointSet,
    frame_size: (u32, u32),
    shoulder_threshold: f32,
    keypoint_threshold: f32,
) -> Result<BodyMetrics> {
    let left_shoulder = confident_shoulder(keypoints, KeypointIndex::LeftShoulder, shoulder_threshold)?;
    let right_shoulder =
        confident_shoulder(keypoints, KeypointIndex::RightShoulder, shoulder_threshold)?;

    let (w, h) = frame_size;
    let clamp = |(x, y): (f32, f32)| {
        (
            x.clamp(0.0, w.saturating_sub(1) as f32),
            y.clamp(0.0, h.saturating_sub(1) as f32),
        )
    };
    let left_shoulder = clamp(left_shoulder);
    let right_shoulder = clamp(right_shoulder);
    let optional = |index| keypoints.confident(index, keypoint_threshold).map(clamp);

    let body = BodyKeypoints {
        left_shoulder,
        right_shoulder,
        left_elbow: optional(KeypointIndex::LeftElbow),
        right_elbow: optional(KeypointIndex::RightElbow),
        left_hip: optional(KeypointIndex::LeftHip),
        right_hip: optional(KeypointIndex::RightHip),
    };

    let shoulder_center = midpoint(left_shoulder, right_shoulder);
    let shoulder_width = distance(left_shoulder, right_shoulder);
    let torso_height = match (body.left_hip, body.right_hip) {
        (Some(l), Some(r)) => (midpoint(l, r).1 - shoulder_center.1).abs(),
        (Some(hip), None) | (None, Some(hip)) => (hip.1 - shoulder_center.1).abs(),
        (None, None) => shoulder_width * TORSO_FALLBACK_RATIO,
    };

    Ok(BodyMetrics {
        shoulder_center,
        shoulder_width,
        torso_height,
        keypoints: body,
    })
}

fn confident_shoulder(
    keypoints: &KeypointSet,
    index: KeypointIndex,
    threshold: f32,
) -> Result<(f32, f32)> {
    let kp = keypoints.get(index);
    if kp.is_valid(threshold) {
        Ok(kp.point())
    } else {
        Err(FittingError::LowConfidence {
            keypoint: index.name(),
            confidence: kp.confidence,
            threshold,
        })
    }
}

pub(crate) fn midpoint(a: (f32, f32), b: (f32, f32)) -> (f32, f32) {
    ((a.0 + b.0) * 0.5, (a.1 + b.1) * 0.5)
}

pub(crate) fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Keypoint;

    fn pose(left_conf: f32) -> KeypointSet {
        let mut set = KeypointSet::default();
        *set.get_mut(KeypointIndex::LeftShoulder) = Keypoint::new(200.0, 150.0, left_conf);
        *set.get_mut(KeypointIndex::RightShoulder) = Keypoint::new(440.0, 150.0, 0.9);
        *set.get_mut(KeypointIndex::LeftHip) = Keypoint::new(230.0, 390.0, 0.8);
        *set.get_mut(KeypointIndex::RightHip) = Keypoint::new(410.0, 390.0, 0.8);
        set
    }

    #[test]
    fn measures_upright_torso() {
        let metrics = extract(&pose(0.9), (640, 480), 0.3, 0.5).unwrap();
        assert_eq!(metrics.shoulder_center, (320.0, 150.0));
        assert!((metrics.shoulder_width - 240.0).abs() < 1e-4);
        assert!((metrics.torso_height - 240.0).abs() < 1e-4);
        assert!(metrics.keypoints.left_elbow.is_none());
        assert_eq!(metrics.keypoints.left_hip, Some((230.0, 390.0)));
    }

    #[test]
    fn shoulder_width_is_euclidean() {
        let mut set = pose(0.9);
        *set.get_mut(KeypointIndex::RightShoulder) = Keypoint::new(380.0, 270.0, 0.9);
        let metrics = extract(&set, (640, 480), 0.3, 0.5).unwrap();
        assert!((metrics.shoulder_width - 216.333).abs() < 1e-2);
    }

    #[test]
    fn weak_shoulder_is_low_confidence() {
        let err = extract(&pose(0.2), (640, 480), 0.3, 0.5).unwrap_err();
        match err {
            FittingError::LowConfidence {
                keypoint,
                confidence,
                ..
            } => {
                assert_eq!(keypoint, "left_shoulder");
                assert!((confidence - 0.2).abs() < 1e-6);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_hips_fall_back_to_shoulder_ratio() {
        let mut set = pose(0.9);
        set.get_mut(KeypointIndex::LeftHip).confidence = 0.1;
        set.get_mut(KeypointIndex::RightHip).confidence = 0.1;
        let metrics = extract(&set, (640, 480), 0.3, 0.5).unwrap();
        assert!((metrics.torso_height - 360.0).abs() < 1e-3);
    }
}
