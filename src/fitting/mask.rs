use image::{GrayImage, Luma, RgbaImage, imageops};
use imageproc::{
    distance_transform::Norm,
    drawing::{draw_filled_ellipse_mut, draw_polygon_mut},
    filter::gaussian_blur_f32,
    morphology,
    point::Point,
};
use rayon::prelude::*;

use crate::{
    fitting::metrics::{distance, midpoint},
    types::{KeypointIndex, KeypointSet},
};

/// Face width estimated from each sizing cue.
const FACE_WIDTH_PER_EYE_DISTANCE: f32 = 2.5;
const FACE_WIDTH_PER_EAR_DISTANCE: f32 = 1.1;
const FACE_WIDTH_PER_SHOULDER_WIDTH: f32 = 0.5;

const ELLIPSE_HALF_WIDTH: f32 = 0.55;
const ELLIPSE_HALF_HEIGHT: f32 = 0.72;
const NECK_TOP_HALF_WIDTH: f32 = 0.35;
const NECK_BOTTOM_HALF_WIDTH: f32 = 0.3;

const MIN_SAMPLE_PIXELS: usize = 16;
const CHROMA_STD_FLOOR: f32 = 4.0;
const MORPH_RADIUS: u8 = 2;
const EDGE_BLUR_SIGMA: f32 = 2.0;
/// Padding around the protected region before filtering: dilation reach plus
/// the blur kernel radius (3 sigma), with slack for rasterization.
const FILTER_MARGIN: u32 = 12;

/// Where the face size estimate came from, in priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaceCue {
    Eyes,
    Ears,
    Shoulders,
}

#[derive(Clone, Copy, Debug)]
pub struct FaceRegion {
    pub center: (f32, f32),
    pub half_width: f32,
    pub half_height: f32,
    pub cue: FaceCue,
}

impl FaceRegion {
    pub fn chin_y(&self) -> f32 {
        self.center.1 + self.half_height
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MaskParams {
    pub keypoint_threshold: f32,
    pub shoulder_threshold: f32,
}

/// Soft face/neck mask (255 = fully protected) for a frame, or `None` when no
/// keypoint gives a usable head position.
pub fn protective_mask(
    keypoints: &KeypointSet,
    frame: &RgbaImage,
    params: MaskParams,
) -> Option<GrayImage> {
    let (w, h) = frame.dimensions();
    if w == 0 || h == 0 {
        return None;
    }
    let face = face_region(keypoints, params)?;
    let shoulders = shoulder_line(keypoints, params.shoulder_threshold);
    let roi = geometric_roi((w, h), &face, shoulders);

    let gated = keypoints
        .confident(KeypointIndex::Nose, params.keypoint_threshold)
        .and_then(|nose| sample_skin_range(frame, nose, face.half_width * 0.3))
        .map(|range| intersect_skin(frame, &roi, &range));

    let mask = match gated {
        Some(mask) => mask,
        None => {
            log::debug!("skin sampling unavailable, using geometric face mask");
            roi
        }
    };

    let Some((x, y, cw, ch)) = filter_window((w, h), &face, shoulders) else {
        return Some(GrayImage::new(w, h));
    };
    let window = imageops::crop_imm(&mask, x, y, cw, ch).to_image();
    let window = morphology::close(&window, Norm::LInf, MORPH_RADIUS);
    let window = morphology::open(&window, Norm::LInf, MORPH_RADIUS);
    let window = gaussian_blur_f32(&window, EDGE_BLUR_SIGMA);

    let mut out = GrayImage::new(w, h);
    imageops::replace(&mut out, &window, i64::from(x), i64::from(y));
    Some(out)
}

/// Frame-clipped box `(x, y, width, height)` around the face ellipse and neck,
/// padded by `FILTER_MARGIN`. `None` when it misses the frame entirely.
fn filter_window(
    (w, h): (u32, u32),
    face: &FaceRegion,
    shoulders: Option<((f32, f32), f32)>,
) -> Option<(u32, u32, u32, u32)> {
    let mut min = (face.center.0 - face.half_width, face.center.1 - face.half_height);
    let mut max = (face.center.0 + face.half_width, face.center.1 + face.half_height);
    for p in neck_polygon(face, shoulders).into_iter().flatten() {
        min = (min.0.min(p.x as f32), min.1.min(p.y as f32));
        max = (max.0.max(p.x as f32), max.1.max(p.y as f32));
    }

    let margin = FILTER_MARGIN as f32;
    let x0 = (min.0 - margin).floor().max(0.0);
    let y0 = (min.1 - margin).floor().max(0.0);
    let x1 = (max.0 + margin).ceil().min(w as f32);
    let y1 = (max.1 + margin).ceil().min(h as f32);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
}

/// Scales garment alpha by `1 - mask` so protected pixels fade out smoothly.
pub fn apply(garment: &mut RgbaImage, mask: &GrayImage) {
    if garment.dimensions() != mask.dimensions() {
        log::warn!(
            "protective mask {:?} does not match garment {:?}, skipping",
            mask.dimensions(),
            garment.dimensions()
        );
        return;
    }
    let mask = mask.as_raw();
    garment
        .par_chunks_exact_mut(4)
        .zip(mask.par_iter())
        .for_each(|(px, &m)| {
            if m > 0 && px[3] > 0 {
                px[3] = ((px[3] as u16 * (255 - m as u16) + 127) / 255) as u8;
            }
        });
}

/// Face ellipse sized from eyes, then ears, then shoulders.
pub fn face_region(keypoints: &KeypointSet, params: MaskParams) -> Option<FaceRegion> {
    let kp = |index| keypoints.confident(index, params.keypoint_threshold);
    let nose = kp(KeypointIndex::Nose);
    let eyes = kp(KeypointIndex::LeftEye).zip(kp(KeypointIndex::RightEye));
    let ears = kp(KeypointIndex::LeftEar).zip(kp(KeypointIndex::RightEar));
    let shoulders = shoulder_line(keypoints, params.shoulder_threshold);

    let (face_width, anchor, cue) = if let Some((l, r)) = eyes {
        let fw = distance(l, r) * FACE_WIDTH_PER_EYE_DISTANCE;
        let mid = midpoint(l, r);
        (fw, (mid.0, mid.1 + fw * 0.15), FaceCue::Eyes)
    } else if let Some((l, r)) = ears {
        let fw = distance(l, r) * FACE_WIDTH_PER_EAR_DISTANCE;
        (fw, midpoint(l, r), FaceCue::Ears)
    } else if let Some((mid, sw)) = shoulders {
        let fw = sw * FACE_WIDTH_PER_SHOULDER_WIDTH;
        let half_height = fw * ELLIPSE_HALF_HEIGHT;
        (fw, (mid.0, mid.1 - sw * 0.25 - half_height), FaceCue::Shoulders)
    } else {
        return None;
    };

    if !(face_width.is_finite() && face_width >= 1.0) {
        return None;
    }

    Some(FaceRegion {
        center: nose.unwrap_or(anchor),
        half_width: face_width * ELLIPSE_HALF_WIDTH,
        half_height: face_width * ELLIPSE_HALF_HEIGHT,
        cue,
    })
}

fn shoulder_line(keypoints: &KeypointSet, threshold: f32) -> Option<((f32, f32), f32)> {
    let l = keypoints.confident(KeypointIndex::LeftShoulder, threshold)?;
    let r = keypoints.confident(KeypointIndex::RightShoulder, threshold)?;
    Some((midpoint(l, r), distance(l, r)))
}

/// Filled ellipse over the face plus a trapezoid from the chin line down to the shoulder line.
pub fn geometric_roi(
    (w, h): (u32, u32),
    face: &FaceRegion,
    shoulders: Option<((f32, f32), f32)>,
) -> GrayImage {
    let mut roi = GrayImage::new(w, h);
    draw_filled_ellipse_mut(
        &mut roi,
        (face.center.0.round() as i32, face.center.1.round() as i32),
        face.half_width.round().max(1.0) as i32,
        face.half_height.round().max(1.0) as i32,
        Luma([255]),
    );

    if let Some(poly) = neck_polygon(face, shoulders) {
        draw_polygon_mut(&mut roi, &poly, Luma([255]));
    }
    roi
}

/// Neck trapezoid from just above the chin down to the shoulder line, or to
/// one face height below the chin without shoulders.
fn neck_polygon(face: &FaceRegion, shoulders: Option<((f32, f32), f32)>) -> Option<[Point<i32>; 4]> {
    let chin_y = face.chin_y();
    let (base_x, base_y, base_half) = match shoulders {
        Some((mid, sw)) => (mid.0, mid.1, sw * NECK_BOTTOM_HALF_WIDTH),
        None => (face.center.0, chin_y + face.half_height, face.half_width * 1.2),
    };
    let top_half = face.half_width * 2.0 * NECK_TOP_HALF_WIDTH;
    if base_y - chin_y < 1.0 || top_half < 1.0 || base_half < 1.0 {
        return None;
    }
    Some([
        Point::new((face.center.0 - top_half).round() as i32, chin_y.round() as i32 - 1),
        Point::new((face.center.0 + top_half).round() as i32, chin_y.round() as i32 - 1),
        Point::new((base_x + base_half).round() as i32, base_y.round() as i32),
        Point::new((base_x - base_half).round() as i32, base_y.round() as i32),
    ])
}

/// Accepted Cr/Cb interval (mean +- 2 std) learned from a window around the nose.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SkinRange {
    pub cr: (f32, f32),
    pub cb: (f32, f32),
}

impl SkinRange {
    fn contains(&self, cr: f32, cb: f32) -> bool {
        cr >= self.cr.0 && cr <= self.cr.1 && cb >= self.cb.0 && cb <= self.cb.1
    }
}

pub fn sample_skin_range(frame: &RgbaImage, center: (f32, f32), half_size: f32) -> Option<SkinRange> {
    let (w, h) = frame.dimensions();
    let half = half_size.max(3.0);
    let x0 = (center.0 - half).floor();
    let y0 = (center.1 - half).floor();
    let x1 = (center.0 + half).ceil();
    let y1 = (center.1 + half).ceil();
    if x1 <= 0.0 || y1 <= 0.0 || x0 >= w as f32 || y0 >= h as f32 {
        return None;
    }
    let (x0, y0) = (x0.max(0.0) as u32, y0.max(0.0) as u32);
    let (x1, y1) = ((x1 as u32).min(w), (y1 as u32).min(h));

    let mut samples = Vec::with_capacity(((x1 - x0) * (y1 - y0)) as usize);
    for y in y0..y1 {
        for x in x0..x1 {
            let p = frame.get_pixel(x, y);
            let (_, cr, cb) = ycrcb(p[0], p[1], p[2]);
            samples.push((cr, cb));
        }
    }
    if samples.len() < MIN_SAMPLE_PIXELS {
        return None;
    }

    let n = samples.len() as f32;
    let (sum_cr, sum_cb) = samples
        .iter()
        .fold((0.0, 0.0), |(a, b), (cr, cb)| (a + cr, b + cb));
    let (mean_cr, mean_cb) = (sum_cr / n, sum_cb / n);
    let (var_cr, var_cb) = samples.iter().fold((0.0, 0.0), |(a, b), (cr, cb)| {
        (a + (cr - mean_cr).powi(2), b + (cb - mean_cb).powi(2))
    });
    let std_cr = (var_cr / n).sqrt().max(CHROMA_STD_FLOOR);
    let std_cb = (var_cb / n).sqrt().max(CHROMA_STD_FLOOR);

    Some(SkinRange {
        cr: (mean_cr - 2.0 * std_cr, mean_cr + 2.0 * std_cr),
        cb: (mean_cb - 2.0 * std_cb, mean_cb + 2.0 * std_cb),
    })
}

fn intersect_skin(frame: &RgbaImage, roi: &GrayImage, range: &SkinRange) -> GrayImage {
    let (w, h) = frame.dimensions();
    let mut out = GrayImage::new(w, h);
    let dst: &mut [u8] = &mut out;
    dst.par_iter_mut()
        .zip(frame.par_chunks_exact(4))
        .zip(roi.as_raw().par_iter())
        .for_each(|((dst, px), &inside)| {
            if inside > 0 {
                let (_, cr, cb) = ycrcb(px[0], px[1], px[2]);
                if range.contains(cr, cb) {
                    *dst = 255;
                }
            }
        });
    out
}

/// BT.601 full-range YCrCb, matching the usual 8-bit offsets.
fn ycrcb(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cr = (r - y) * 0.713 + 128.0;
    let cb = (b - y) * 0.564 + 128.0;
    (y, cr, cb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Keypoint;
    use image::Rgba;

    const PARAMS: MaskParams = MaskParams {
        keypoint_threshold: 0.5,
        shoulder_threshold: 0.3,
    };

    fn face_pose() -> KeypointSet {
        let mut set = KeypointSet::default();
        *set.get_mut(KeypointIndex::Nose) = Keypoint::new(160.0, 80.0, 0.9);
        *set.get_mut(KeypointIndex::LeftEye) = Keypoint::new(148.0, 70.0, 0.9);
        *set.get_mut(KeypointIndex::RightEye) = Keypoint::new(172.0, 70.0, 0.9);
        *set.get_mut(KeypointIndex::LeftEar) = Keypoint::new(135.0, 75.0, 0.9);
        *set.get_mut(KeypointIndex::RightEar) = Keypoint::new(185.0, 75.0, 0.9);
        *set.get_mut(KeypointIndex::LeftShoulder) = Keypoint::new(110.0, 160.0, 0.9);
        *set.get_mut(KeypointIndex::RightShoulder) = Keypoint::new(210.0, 160.0, 0.9);
        set
    }

    fn skin_frame() -> RgbaImage {
        let mut frame = RgbaImage::from_pixel(320, 240, Rgba([30, 60, 200, 255]));
        for y in 40..170 {
            for x in 120..200 {
                frame.put_pixel(x, y, Rgba([224, 172, 138, 255]));
            }
        }
        frame
    }

    #[test]
    fn face_size_prefers_eyes_then_ears_then_shoulders() {
        let mut set = face_pose();
        assert_eq!(face_region(&set, PARAMS).unwrap().cue, FaceCue::Eyes);

        set.get_mut(KeypointIndex::LeftEye).confidence = 0.1;
        let ears = face_region(&set, PARAMS).unwrap();
        assert_eq!(ears.cue, FaceCue::Ears);
        assert!((ears.half_width - 50.0 * 1.1 * ELLIPSE_HALF_WIDTH).abs() < 1e-3);

        set.get_mut(KeypointIndex::RightEar).confidence = 0.1;
        assert_eq!(face_region(&set, PARAMS).unwrap().cue, FaceCue::Shoulders);

        set.get_mut(KeypointIndex::LeftShoulder).confidence = 0.1;
        assert!(face_region(&set, PARAMS).is_none());
    }

    #[test]
    fn mask_covers_face_and_spares_torso() {
        let frame = skin_frame();
        let mask = protective_mask(&face_pose(), &frame, PARAMS).unwrap();
        assert!(mask.get_pixel(160, 80)[0] > 200);
        assert_eq!(mask.get_pixel(160, 230)[0], 0);
        assert_eq!(mask.get_pixel(10, 10)[0], 0);
    }

    #[test]
    fn filtering_stays_inside_padded_face_window() {
        let frame = skin_frame();
        let pose = face_pose();
        let mask = protective_mask(&pose, &frame, PARAMS).unwrap();
        assert_eq!(mask.dimensions(), frame.dimensions());

        let face = face_region(&pose, PARAMS).unwrap();
        let shoulders = shoulder_line(&pose, PARAMS.shoulder_threshold);
        let (x, y, cw, ch) = filter_window(frame.dimensions(), &face, shoulders).unwrap();
        assert!(cw < frame.width() || ch < frame.height());

        // Same result as filtering the whole frame.
        let range = sample_skin_range(&frame, (160.0, 80.0), face.half_width * 0.3).unwrap();
        let full = intersect_skin(&frame, &geometric_roi(frame.dimensions(), &face, shoulders), &range);
        let full = morphology::close(&full, Norm::LInf, MORPH_RADIUS);
        let full = morphology::open(&full, Norm::LInf, MORPH_RADIUS);
        let full = gaussian_blur_f32(&full, EDGE_BLUR_SIGMA);
        for (px, py, m) in mask.enumerate_pixels() {
            let inside = px >= x && px < x + cw && py >= y && py < y + ch;
            if !inside {
                assert_eq!(m[0], 0, "({px},{py}) outside window");
            }
            let diff = (m[0] as i16 - full.get_pixel(px, py)[0] as i16).abs();
            assert!(diff <= 1, "({px},{py}) differs by {diff}");
        }
    }

    #[test]
    fn window_clips_to_frame_edges() {
        let face = FaceRegion {
            center: (2.0, 3.0),
            half_width: 10.0,
            half_height: 12.0,
            cue: FaceCue::Eyes,
        };
        let (x, y, cw, ch) = filter_window((40, 60), &face, None).unwrap();
        assert_eq!((x, y), (0, 0));
        assert!(x + cw <= 40 && y + ch <= 60);

        let offscreen = FaceRegion {
            center: (-200.0, -200.0),
            ..face
        };
        assert!(filter_window((40, 60), &offscreen, None).is_none());
    }

    #[test]
    fn sampling_outside_frame_falls_back_to_geometry() {
        let frame = RgbaImage::from_pixel(320, 240, Rgba([30, 60, 200, 255]));
        assert!(sample_skin_range(&frame, (-50.0, -50.0), 5.0).is_none());

        // No usable nose and no skin anywhere: the ellipse alone still protects the face.
        let mut set = face_pose();
        set.get_mut(KeypointIndex::Nose).confidence = 0.1;
        let mask = protective_mask(&set, &frame, PARAMS).unwrap();
        assert!(mask.get_pixel(160, 79)[0] > 200);
    }

    #[test]
    fn skin_gate_rejects_non_skin_pixels_inside_roi() {
        let mut frame = skin_frame();
        // A blue patch right over the cheek.
        for y in 60..100 {
            for x in 175..200 {
                frame.put_pixel(x, y, Rgba([30, 60, 200, 255]));
            }
        }
        let mask = protective_mask(&face_pose(), &frame, PARAMS).unwrap();
        assert!(mask.get_pixel(160, 80)[0] > 200);
        assert!(mask.get_pixel(192, 80)[0] < 64);
    }

    #[test]
    fn apply_zeroes_alpha_where_protected() {
        let mut garment = RgbaImage::from_pixel(4, 1, Rgba([9, 9, 9, 255]));
        let mask = GrayImage::from_raw(4, 1, vec![255, 128, 0, 255]).unwrap();
        apply(&mut garment, &mask);
        let alphas: Vec<u8> = garment.pixels().map(|p| p[3]).collect();
        assert_eq!(alphas, vec![0, 127, 255, 0]);
    }
}
