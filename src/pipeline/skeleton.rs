use crate::types::{KeypointIndex, KeypointSet};

use KeypointIndex::*;

/// COCO-17 limb connections.
pub const CONNECTIONS: &[(KeypointIndex, KeypointIndex)] = &[
    (Nose, LeftEye),
    (Nose, RightEye),
    (LeftEye, LeftEar),
    (RightEye, RightEar),
    (LeftShoulder, RightShoulder),
    (LeftShoulder, LeftElbow),
    (LeftElbow, LeftWrist),
    (RightShoulder, RightElbow),
    (RightElbow, RightWrist),
    (LeftShoulder, LeftHip),
    (RightShoulder, RightHip),
    (LeftHip, RightHip),
    (LeftHip, LeftKnee),
    (LeftKnee, LeftAnkle),
    (RightHip, RightKnee),
    (RightKnee, RightAnkle),
];

const LINE_COLOR: [u8; 4] = [0, 255, 0, 255];
const POINT_COLOR: [u8; 4] = [248, 113, 113, 255];

/// Draws the confident joints and the limbs between them onto an RGBA buffer.
pub fn draw_skeleton(
    buffer: &mut [u8],
    width: u32,
    height: u32,
    keypoints: &KeypointSet,
    threshold: f32,
) {
    // Roughly 2 px at 640 wide, thicker on larger frames.
    let thickness = ((width.max(height) / 320) as i32).max(2);
    let at = |index: KeypointIndex| {
        keypoints
            .confident(index, threshold)
            .map(|(x, y)| (x.round() as i32, y.round() as i32))
    };

    for &(a, b) in CONNECTIONS {
        if let (Some(pa), Some(pb)) = (at(a), at(b)) {
            draw_line(buffer, width, height, pa, pb, LINE_COLOR, thickness);
        }
    }

    let radius = thickness + 1;
    for index in KeypointIndex::ALL {
        if let Some(p) = at(index) {
            draw_disc(buffer, width, height, p, radius, POINT_COLOR);
        }
    }
}

fn draw_line(
    buffer: &mut [u8],
    width: u32,
    height: u32,
    (mut x0, mut y0): (i32, i32),
    (x1, y1): (i32, i32),
    color: [u8; 4],
    thickness: i32,
) {
    let dx = (x1 - x0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let dy = -(y1 - y0).abs();
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let radius = (thickness - 1) / 2;

    loop {
        if radius > 0 {
            draw_disc(buffer, width, height, (x0, y0), radius, color);
        } else {
            put_pixel_safe(buffer, width, height, x0, y0, color);
        }
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

fn draw_disc(
    buffer: &mut [u8],
    width: u32,
    height: u32,
    (cx, cy): (i32, i32),
    radius: i32,
    color: [u8; 4],
) {
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= radius * radius {
                put_pixel_safe(buffer, width, height, cx + dx, cy + dy, color);
            }
        }
    }
}

fn put_pixel_safe(buffer: &mut [u8], width: u32, height: u32, x: i32, y: i32, color: [u8; 4]) {
    if x < 0 || y < 0 || x as u32 >= width || y as u32 >= height {
        return;
    }
    let idx = ((y as u32 * width + x as u32) as usize) * 4;
    if let Some(px) = buffer.get_mut(idx..idx + 4) {
        px.copy_from_slice(&color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Keypoint;

    #[test]
    fn draws_only_confident_limbs() {
        let (w, h) = (64u32, 64u32);
        let mut buffer = vec![0u8; (w * h * 4) as usize];
        let mut set = KeypointSet::default();
        *set.get_mut(LeftShoulder) = Keypoint::new(10.0, 20.0, 0.9);
        *set.get_mut(RightShoulder) = Keypoint::new(50.0, 20.0, 0.9);
        *set.get_mut(LeftHip) = Keypoint::new(10.0, 60.0, 0.1);

        draw_skeleton(&mut buffer, w, h, &set, 0.3);

        let px = |x: u32, y: u32| {
            let i = ((y * w + x) * 4) as usize;
            [buffer[i], buffer[i + 1], buffer[i + 2], buffer[i + 3]]
        };
        assert_eq!(px(30, 20), LINE_COLOR);
        assert_eq!(px(10, 20), POINT_COLOR);
        assert_eq!(px(10, 45), [0, 0, 0, 0]);
    }

    #[test]
    fn off_frame_points_are_clipped() {
        let mut buffer = vec![0u8; 8 * 8 * 4];
        let mut set = KeypointSet::default();
        *set.get_mut(LeftShoulder) = Keypoint::new(-30.0, 4.0, 0.9);
        *set.get_mut(RightShoulder) = Keypoint::new(40.0, 4.0, 0.9);
        draw_skeleton(&mut buffer, 8, 8, &set, 0.3);
        assert!(buffer.chunks_exact(4).any(|px| px == LINE_COLOR));
    }
}
