use image::{RgbaImage, imageops};
use rayon::prelude::*;

use crate::{
    error::{FittingError, Result},
    fitting::metrics::{BodyKeypoints, distance, midpoint},
    garment::GarmentKeypoints,
};

/// Fraction of shoulder width the synthetic center point sits below the shoulder line.
pub const CENTER_OFFSET_RATIO: f32 = 0.8;
pub const CENTER_OFFSET_MIN: f32 = 60.0;
pub const CENTER_OFFSET_MAX: f32 = 150.0;

/// Vertical lift applied in placement mode so the collar sits slightly above the shoulders.
pub const PLACEMENT_LIFT_PX: f32 = 20.0;

const DET_EPSILON: f64 = 1e-6;

/// Row-major 2x3 affine matrix: `x' = a*x + b*y + c`, `y' = d*x + e*y + f`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffineTransform {
    pub m: [f32; 6],
}

impl AffineTransform {
    /// Solves the unique transform taking each `src[i]` onto `dst[i]`.
    pub fn from_points(src: [(f32, f32); 3], dst: [(f32, f32); 3]) -> Result<Self> {
        let [(x0, y0), (x1, y1), (x2, y2)] = src.map(|(x, y)| (x as f64, y as f64));
        let det = x0 * (y1 - y2) - y0 * (x1 - x2) + (x1 * y2 - x2 * y1);
        if !det.is_finite() || det.abs() < DET_EPSILON {
            return Err(FittingError::DegenerateGeometry);
        }

        // Cramer's rule, once per output coordinate.
        let solve = |t: [f64; 3]| {
            let [t0, t1, t2] = t;
            let a = t0 * (y1 - y2) - y0 * (t1 - t2) + (t1 * y2 - t2 * y1);
            let b = x0 * (t1 - t2) - t0 * (x1 - x2) + (x1 * t2 - x2 * t1);
            let c = x0 * (y1 * t2 - y2 * t1) - y0 * (x1 * t2 - x2 * t1) + t0 * (x1 * y2 - x2 * y1);
            [(a / det) as f32, (b / det) as f32, (c / det) as f32]
        };
        let [a, b, c] = solve(dst.map(|p| p.0 as f64));
        let [d, e, f] = solve(dst.map(|p| p.1 as f64));
        Ok(Self {
            m: [a, b, c, d, e, f],
        })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        let [a, b, c, d, e, f] = self.m;
        (a * x + b * y + c, d * x + e * y + f)
    }

    pub fn invert(&self) -> Result<Self> {
        let [a, b, c, d, e, f] = self.m.map(|v| v as f64);
        let det = a * e - b * d;
        if !det.is_finite() || det.abs() < DET_EPSILON {
            return Err(FittingError::DegenerateGeometry);
        }
        let ia = e / det;
        let ib = -b / det;
        let id = -d / det;
        let ie = a / det;
        let ic = -(ia * c + ib * f);
        let if_ = -(id * c + ie * f);
        Ok(Self {
            m: [ia, ib, ic, id, ie, if_].map(|v| v as f32),
        })
    }
}

/// Offset of the synthetic center point below the shoulder midpoint.
pub fn center_offset(shoulder_width: f32) -> f32 {
    (shoulder_width * CENTER_OFFSET_RATIO).clamp(CENTER_OFFSET_MIN, CENTER_OFFSET_MAX)
}

/// `[right shoulder, left shoulder, center]` for one side of the correspondence.
pub fn anchor_points(left: (f32, f32), right: (f32, f32)) -> [(f32, f32); 3] {
    let mid = midpoint(left, right);
    let center = (mid.0, mid.1 + center_offset(distance(left, right)));
    [right, left, center]
}

/// Solves the garment-to-frame transform from the shoulder correspondences.
pub fn solve_transform(garment: &GarmentKeypoints, body: &BodyKeypoints) -> Result<AffineTransform> {
    if !finite(garment.left_shoulder) || !finite(garment.right_shoulder) {
        return Err(FittingError::MissingKeypoints("garment shoulders"));
    }
    if !finite(body.left_shoulder) || !finite(body.right_shoulder) {
        return Err(FittingError::MissingKeypoints("body shoulders"));
    }
    AffineTransform::from_points(
        anchor_points(garment.left_shoulder, garment.right_shoulder),
        anchor_points(body.left_shoulder, body.right_shoulder),
    )
}

/// Maps `garment` into a transparent canvas of `output` size so its shoulders land on the body's.
pub fn warp(
    garment: &RgbaImage,
    garment_keypoints: &GarmentKeypoints,
    body: &BodyKeypoints,
    output: (u32, u32),
) -> Result<RgbaImage> {
    let transform = solve_transform(garment_keypoints, body)?;
    warp_with(garment, &transform, output)
}

/// Inverse-maps every covered output pixel into garment space with bilinear sampling.
pub fn warp_with(
    garment: &RgbaImage,
    transform: &AffineTransform,
    output: (u32, u32),
) -> Result<RgbaImage> {
    let (out_w, out_h) = output;
    let mut canvas = RgbaImage::new(out_w, out_h);
    if out_w == 0 || out_h == 0 || garment.width() == 0 || garment.height() == 0 {
        return Ok(canvas);
    }
    let inverse = transform.invert()?;

    let Some((x_range, y_range)) = covered_region(garment, transform, output) else {
        return Ok(canvas);
    };

    let stride = out_w as usize * 4;
    canvas
        .par_chunks_exact_mut(stride)
        .enumerate()
        .skip(y_range.0)
        .take(y_range.1 - y_range.0)
        .for_each(|(y, row)| {
            for x in x_range.0..x_range.1 {
                let (sx, sy) = inverse.apply((x as f32, y as f32));
                let px = sample_rgba(garment, sx, sy);
                row[x * 4..x * 4 + 4].copy_from_slice(&px);
            }
        });

    Ok(canvas)
}

/// Translation-only placement: `anchor` in garment space lands on `target` in frame space.
pub fn place(
    garment: &RgbaImage,
    anchor: (f32, f32),
    target: (f32, f32),
    output: (u32, u32),
) -> RgbaImage {
    let mut canvas = RgbaImage::new(output.0, output.1);
    let dx = (target.0 - anchor.0).round() as i64;
    let dy = (target.1 - anchor.1).round() as i64;
    imageops::replace(&mut canvas, garment, dx, dy);
    canvas
}

/// Placement target for resize-only mode: the shoulder center raised by [`PLACEMENT_LIFT_PX`].
pub fn placement_target(shoulder_center: (f32, f32)) -> (f32, f32) {
    (shoulder_center.0, shoulder_center.1 - PLACEMENT_LIFT_PX)
}

/// Output-space bounding box (half-open, clamped) of the transformed garment rectangle.
fn covered_region(
    garment: &RgbaImage,
    transform: &AffineTransform,
    (out_w, out_h): (u32, u32),
) -> Option<((usize, usize), (usize, usize))> {
    let (gw, gh) = (garment.width() as f32, garment.height() as f32);
    let corners = [(0.0, 0.0), (gw, 0.0), (0.0, gh), (gw, gh)].map(|p| transform.apply(p));
    let (mut min_x, mut min_y) = (f32::MAX, f32::MAX);
    let (mut max_x, mut max_y) = (f32::MIN, f32::MIN);
    for (x, y) in corners {
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);
    }

    let x0 = (min_x.floor() - 1.0).max(0.0) as usize;
    let y0 = (min_y.floor() - 1.0).max(0.0) as usize;
    let x1 = ((max_x.ceil() + 1.0).max(0.0) as usize).min(out_w as usize);
    let y1 = ((max_y.ceil() + 1.0).max(0.0) as usize).min(out_h as usize);
    (x0 < x1 && y0 < y1).then_some(((x0, x1), (y0, y1)))
}

/// Bilinear RGBA fetch; taps outside the image contribute fully transparent black.
fn sample_rgba(image: &RgbaImage, x: f32, y: f32) -> [u8; 4] {
    if x.is_nan() || y.is_nan() {
        return [0; 4];
    }
    let (w, h) = (image.width() as i64, image.height() as i64);
    if x <= -1.0 || y <= -1.0 || x >= w as f32 || y >= h as f32 {
        return [0; 4];
    }

    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (ix, iy) = (x0 as i64, y0 as i64);

    let fetch = |cx: i64, cy: i64| -> [f32; 4] {
        if cx < 0 || cy < 0 || cx >= w || cy >= h {
            return [0.0; 4];
        }
        let p = image.get_pixel(cx as u32, cy as u32).0;
        [p[0] as f32, p[1] as f32, p[2] as f32, p[3] as f32]
    };
    let c00 = fetch(ix, iy);
    let c10 = fetch(ix + 1, iy);
    let c01 = fetch(ix, iy + 1);
    let c11 = fetch(ix + 1, iy + 1);

    let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
    let mut out = [0u8; 4];
    for c in 0..4 {
        let v = lerp(lerp(c00[c], c10[c], fx), lerp(c01[c], c11[c], fx), fy);
        out[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    out
}

fn finite(p: (f32, f32)) -> bool {
    p.0.is_finite() && p.1.is_finite()
}
