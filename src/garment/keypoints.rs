use image::{GrayImage, Luma, RgbaImage};
use imageproc::contours::{BorderType, Contour, find_contours};

use crate::error::{FittingError, Result};

/// Fraction of the garment height scanned for the shoulder line.
const SHOULDER_BAND: f32 = 0.2;
/// How far above the shoulder line the neck walk may go, as a fraction of height.
const NECK_SEARCH: f32 = 0.15;
const ELBOW_HEIGHT: f32 = 0.4;
const ELBOW_SPREAD: f32 = 0.05;
const HIP_HEIGHT: f32 = 0.85;
const HIP_TO_SHOULDER: f32 = 0.7;
/// Luma threshold used when the garment image carries no transparency.
const OPAQUE_MASK_THRESHOLD: u8 = 10;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeypointSource {
    /// Derived from the garment silhouette.
    Silhouette,
    /// Proportional estimate of a generic garment outline.
    Proportional,
}

/// Anatomical anchor points of a garment image, in garment pixel space.
///
/// Sides follow the image: `left_shoulder` is the one with the smaller x, which
/// lines up with the wearer's left shoulder in a mirrored (selfie) preview.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GarmentKeypoints {
    pub left_shoulder: (f32, f32),
    pub right_shoulder: (f32, f32),
    pub neck: (f32, f32),
    pub center: (f32, f32),
    pub left_elbow: (f32, f32),
    pub right_elbow: (f32, f32),
    pub left_hip: (f32, f32),
    pub right_hip: (f32, f32),
    pub shoulder_width: f32,
    pub bounding_box: BoundingBox,
    pub source: KeypointSource,
}

impl GarmentKeypoints {
    /// Coordinates multiplied by `scale`; the bounding box and shoulder width follow.
    pub fn scaled(&self, scale: f32) -> Self {
        let s = |p: (f32, f32)| (p.0 * scale, p.1 * scale);
        let bb = self.bounding_box;
        Self {
            left_shoulder: s(self.left_shoulder),
            right_shoulder: s(self.right_shoulder),
            neck: s(self.neck),
            center: s(self.center),
            left_elbow: s(self.left_elbow),
            right_elbow: s(self.right_elbow),
            left_hip: s(self.left_hip),
            right_hip: s(self.right_hip),
            shoulder_width: self.shoulder_width * scale,
            bounding_box: BoundingBox {
                x: (bb.x as f32 * scale).round() as u32,
                y: (bb.y as f32 * scale).round() as u32,
                width: (bb.width as f32 * scale).round() as u32,
                height: (bb.height as f32 * scale).round() as u32,
            },
            source: self.source,
        }
    }

    pub fn shoulder_midpoint(&self) -> (f32, f32) {
        (
            (self.left_shoulder.0 + self.right_shoulder.0) / 2.0,
            (self.left_shoulder.1 + self.right_shoulder.1) / 2.0,
        )
    }
}

/// Foreground mask: alpha when the image has transparency, luma otherwise.
pub fn silhouette_mask(image: &RgbaImage) -> GrayImage {
    let has_transparency = image.pixels().any(|px| px[3] < 255);
    let mut mask = GrayImage::new(image.width(), image.height());
    for (x, y, px) in image.enumerate_pixels() {
        let on = if has_transparency {
            px[3] > 0
        } else {
            let luma = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
            luma > OPAQUE_MASK_THRESHOLD as f32
        };
        if on {
            mask.put_pixel(x, y, Luma([255]));
        }
    }
    mask
}

/// Detects keypoints from the silhouette, falling back to proportional estimates.
pub fn detect_or_estimate(image: &RgbaImage) -> GarmentKeypoints {
    match detect(image) {
        Ok(keypoints) => keypoints,
        Err(err) => {
            log::warn!("garment keypoint detection fell back to proportional estimate: {err}");
            let whole = BoundingBox {
                x: 0,
                y: 0,
                width: image.width().max(1),
                height: image.height().max(1),
            };
            let mask = silhouette_mask(image);
            let bbox = largest_outer_contour(&mask)
                .map(|contour| contour_bounds(&contour.points))
                .unwrap_or(whole);
            estimate_from_bbox(bbox)
        }
    }
}

pub fn detect(image: &RgbaImage) -> Result<GarmentKeypoints> {
    let mask = silhouette_mask(image);
    let contour = largest_outer_contour(&mask)
        .ok_or_else(|| FittingError::DetectionFailed("no garment contour found".into()))?;
    let bbox = contour_bounds(&contour.points);

    let band = (bbox.height as f32 * SHOULDER_BAND) as u32;
    let widest = widest_row(&mask, bbox, band).ok_or_else(|| {
        FittingError::DetectionFailed("no shoulder candidates in the top band".into())
    })?;

    let left_shoulder = (widest.left as f32, widest.row as f32);
    let right_shoulder = (widest.right as f32, widest.row as f32);
    let shoulder_width = (widest.right - widest.left) as f32;
    if shoulder_width <= 0.0 {
        return Err(FittingError::DetectionFailed(
            "garment shoulder line has zero width".into(),
        ));
    }

    let neck_x = (widest.left + widest.right) / 2;
    let search_floor = widest
        .row
        .saturating_sub((bbox.height as f32 * NECK_SEARCH) as u32);
    let mut neck_y = widest.row;
    let mut row = widest.row;
    while row > search_floor {
        if mask.get_pixel(neck_x, row)[0] > 0 {
            neck_y = row;
            row -= 1;
        } else {
            break;
        }
    }

    let center = polygon_centroid(&contour.points).unwrap_or((
        bbox.x as f32 + bbox.width as f32 / 2.0,
        bbox.y as f32 + bbox.height as f32 / 2.0,
    ));

    let elbow_y = bbox.y as f32 + bbox.height as f32 * ELBOW_HEIGHT;
    let elbow_dx = bbox.width as f32 * ELBOW_SPREAD;
    let hip_y = bbox.y as f32 + bbox.height as f32 * HIP_HEIGHT;
    let hip_half = shoulder_width * HIP_TO_SHOULDER / 2.0;

    let keypoints = GarmentKeypoints {
        left_shoulder,
        right_shoulder,
        neck: (neck_x as f32, neck_y as f32),
        center,
        left_elbow: (left_shoulder.0 - elbow_dx, elbow_y),
        right_elbow: (right_shoulder.0 + elbow_dx, elbow_y),
        left_hip: (center.0 - hip_half, hip_y),
        right_hip: (center.0 + hip_half, hip_y),
        shoulder_width,
        bounding_box: bbox,
        source: KeypointSource::Silhouette,
    };
    log::info!(
        "garment shoulders detected: width={shoulder_width}px at {:?} / {:?}",
        keypoints.left_shoulder,
        keypoints.right_shoulder
    );
    Ok(keypoints)
}

/// Generic front-facing garment proportions inside `bbox`.
pub fn estimate_from_bbox(bbox: BoundingBox) -> GarmentKeypoints {
    let (x, y) = (bbox.x as f32, bbox.y as f32);
    let (w, h) = (bbox.width as f32, bbox.height as f32);
    GarmentKeypoints {
        left_shoulder: (x + w * 0.15, y + h * 0.1),
        right_shoulder: (x + w * 0.85, y + h * 0.1),
        neck: (x + w / 2.0, y + h * 0.05),
        center: (x + w / 2.0, y + h / 2.0),
        left_elbow: (x + w * 0.1, y + h * 0.4),
        right_elbow: (x + w * 0.9, y + h * 0.4),
        left_hip: (x + w * 0.3, y + h * 0.85),
        right_hip: (x + w * 0.7, y + h * 0.85),
        shoulder_width: w * 0.7,
        bounding_box: bbox,
        source: KeypointSource::Proportional,
    }
}

struct RowSpan {
    row: u32,
    left: u32,
    right: u32,
}

fn widest_row(mask: &GrayImage, bbox: BoundingBox, band: u32) -> Option<RowSpan> {
    let x_end = (bbox.x + bbox.width).min(mask.width());
    let y_end = (bbox.y + band).min(mask.height());
    let mut widest: Option<RowSpan> = None;
    for row in bbox.y..y_end {
        let mut cols = (bbox.x..x_end).filter(|&x| mask.get_pixel(x, row)[0] > 0);
        let Some(left) = cols.next() else {
            continue;
        };
        let right = cols.last().unwrap_or(left);
        let better = widest
            .as_ref()
            .is_none_or(|best| right - left > best.right - best.left);
        if better {
            widest = Some(RowSpan { row, left, right });
        }
    }
    widest
}

fn largest_outer_contour(mask: &GrayImage) -> Option<Contour<i32>> {
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .max_by(|a, b| {
            let key = |c: &Contour<i32>| (shoelace_area(&c.points), c.points.len());
            let (area_a, len_a) = key(a);
            let (area_b, len_b) = key(b);
            area_a.total_cmp(&area_b).then(len_a.cmp(&len_b))
        })
}

fn contour_bounds(points: &[imageproc::point::Point<i32>]) -> BoundingBox {
    let min_x = points.iter().map(|p| p.x).min().unwrap_or(0).max(0);
    let min_y = points.iter().map(|p| p.y).min().unwrap_or(0).max(0);
    let max_x = points.iter().map(|p| p.x).max().unwrap_or(0).max(min_x);
    let max_y = points.iter().map(|p| p.y).max().unwrap_or(0).max(min_y);
    BoundingBox {
        x: min_x as u32,
        y: min_y as u32,
        width: (max_x - min_x + 1) as u32,
        height: (max_y - min_y + 1) as u32,
    }
}

fn shoelace_area(points: &[imageproc::point::Point<i32>]) -> f64 {
    signed_area(points).abs()
}

fn signed_area(points: &[imageproc::point::Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut acc = 0.0f64;
    for (i, p) in points.iter().enumerate() {
        let q = points[(i + 1) % points.len()];
        acc += p.x as f64 * q.y as f64 - q.x as f64 * p.y as f64;
    }
    acc / 2.0
}

/// First-order polygon moments (the contour centroid).
fn polygon_centroid(points: &[imageproc::point::Point<i32>]) -> Option<(f32, f32)> {
    let area = signed_area(points);
    if area.abs() < f64::EPSILON {
        return None;
    }
    let (mut cx, mut cy) = (0.0f64, 0.0f64);
    for (i, p) in points.iter().enumerate() {
        let q = points[(i + 1) % points.len()];
        let cross = p.x as f64 * q.y as f64 - q.x as f64 * p.y as f64;
        cx += (p.x as f64 + q.x as f64) * cross;
        cy += (p.y as f64 + q.y as f64) * cross;
    }
    Some(((cx / (6.0 * area)) as f32, (cy / (6.0 * area)) as f32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    /// T-shirt-like silhouette: a wide shoulder block over a narrower body.
    fn tshirt(width: u32, height: u32) -> RgbaImage {
        let mut img = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 0]));
        for y in 20..180 {
            let (x0, x1) = if y < 60 { (20, 180) } else { (50, 150) };
            for x in x0..x1 {
                img.put_pixel(x, y, Rgba([200, 30, 30, 255]));
            }
        }
        // Collar stub above the shoulder line.
        for y in 10..20 {
            for x in 90..110 {
                img.put_pixel(x, y, Rgba([200, 30, 30, 255]));
            }
        }
        img
    }

    #[test]
    fn detects_shoulder_line_from_silhouette() {
        let kp = detect(&tshirt(200, 200)).unwrap();
        assert_eq!(kp.source, KeypointSource::Silhouette);
        assert_eq!(kp.shoulder_width, 159.0);
        assert_eq!(kp.left_shoulder.0, 20.0);
        assert_eq!(kp.right_shoulder.0, 179.0);
        assert!(kp.left_shoulder.1 >= 20.0 && kp.left_shoulder.1 < 60.0);
        // Neck walks up into the collar.
        assert!(kp.neck.1 < kp.left_shoulder.1);
        assert!(kp.center.1 > kp.left_shoulder.1);
        assert!(kp.left_hip.0 < kp.right_hip.0);
    }

    #[test]
    fn empty_image_falls_back_to_proportions() {
        let img = RgbaImage::from_pixel(100, 50, Rgba([0, 0, 0, 0]));
        assert!(matches!(detect(&img), Err(FittingError::DetectionFailed(_))));
        let kp = detect_or_estimate(&img);
        assert_eq!(kp.source, KeypointSource::Proportional);
        assert!((kp.shoulder_width - 70.0).abs() < 1e-4);
        assert!((kp.left_shoulder.0 - 15.0).abs() < 1e-4);
    }

    #[test]
    fn opaque_images_are_masked_by_luma() {
        let mut img = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 0, 255]));
        img.put_pixel(3, 3, Rgba([255, 255, 255, 255]));
        let mask = silhouette_mask(&img);
        assert_eq!(mask.get_pixel(3, 3)[0], 255);
        assert_eq!(mask.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn scaling_keeps_proportions() {
        let kp = estimate_from_bbox(BoundingBox {
            x: 0,
            y: 0,
            width: 100,
            height: 100,
        });
        let half = kp.scaled(0.5);
        assert!((half.shoulder_width - 35.0).abs() < 1e-4);
        assert!((half.left_shoulder.0 - 7.5).abs() < 1e-4);
        assert_eq!(half.bounding_box.width, 50);
    }
}
