use anyhow::{Context, Result, anyhow};
use fast_image_resize as fir;
use ndarray::Array4;
use rayon::prelude::*;

use crate::types::{Frame, Keypoint, KeypointIndex, KeypointSet};

#[derive(Clone, Debug, PartialEq)]
pub struct LetterboxInfo {
    pub target_size: u32,
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub orig_w: u32,
    pub orig_h: u32,
}

impl LetterboxInfo {
    pub fn new(orig_w: u32, orig_h: u32, target_size: u32) -> Self {
        let scale = target_size as f32 / (orig_w.max(orig_h).max(1) as f32);
        let new_w = (orig_w as f32 * scale).round().max(1.0) as u32;
        let new_h = (orig_h as f32 * scale).round().max(1.0) as u32;
        Self {
            target_size,
            scale,
            pad_x: ((target_size as i64 - new_w as i64) / 2).max(0) as f32,
            pad_y: ((target_size as i64 - new_h as i64) / 2).max(0) as f32,
            orig_w,
            orig_h,
        }
    }

    /// Maps a point normalised to the square model input back to source pixels.
    pub fn project_normalized(&self, nx: f32, ny: f32) -> (f32, f32) {
        let px = (nx * self.target_size as f32 - self.pad_x) / self.scale;
        let py = (ny * self.target_size as f32 - self.pad_y) / self.scale;
        (
            px.clamp(0.0, self.orig_w.saturating_sub(1) as f32),
            py.clamp(0.0, self.orig_h.saturating_sub(1) as f32),
        )
    }
}

/// Letterboxes `frame` into a `target_size` square NHWC tensor with raw 0..255 RGB values.
pub fn prepare_frame_with_size(
    frame: &Frame,
    target_size: u32,
) -> Result<(Array4<f32>, LetterboxInfo)> {
    if !frame.is_well_formed() {
        return Err(anyhow!(
            "frame buffer size mismatch: got {} bytes for {}x{}",
            frame.rgba.len(),
            frame.width,
            frame.height
        ));
    }

    let letterbox = LetterboxInfo::new(frame.width, frame.height, target_size);
    let new_w = (frame.width as f32 * letterbox.scale).round().max(1.0) as u32;
    let new_h = (frame.height as f32 * letterbox.scale).round().max(1.0) as u32;

    let src_image = fir::images::Image::from_vec_u8(
        frame.width,
        frame.height,
        frame.rgba.clone(),
        fir::PixelType::U8x4,
    )?;
    let mut dst_image = fir::images::Image::new(new_w, new_h, fir::PixelType::U8x4);
    let mut resizer = fir::Resizer::new();
    let resize_options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
    resizer
        .resize(&src_image, &mut dst_image, Some(&resize_options))
        .context("fast resize failed")?;
    let resized = dst_image.into_vec();

    let pad_x = letterbox.pad_x as usize;
    let pad_y = letterbox.pad_y as usize;
    let mut canvas = vec![0u8; (target_size as usize) * (target_size as usize) * 4];
    let dst_stride = target_size as usize * 4;
    let src_stride = new_w as usize * 4;
    for row in 0..(new_h as usize).min(target_size as usize - pad_y) {
        let dst_offset = (pad_y + row) * dst_stride + pad_x * 4;
        let src_offset = row * src_stride;
        let copy_len = src_stride.min(dst_stride - pad_x * 4);
        canvas[dst_offset..dst_offset + copy_len]
            .copy_from_slice(&resized[src_offset..src_offset + copy_len]);
    }

    let values: Vec<f32> = canvas
        .par_chunks_exact(4)
        .flat_map_iter(|px| [px[0] as f32, px[1] as f32, px[2] as f32])
        .collect();
    let input = Array4::<f32>::from_shape_vec(
        (1, target_size as usize, target_size as usize, 3),
        values,
    )
    .map_err(|err| anyhow!("failed to build input tensor: {err}"))?;

    Ok((input, letterbox))
}

/// Decodes one person from `(y, x, score)` triples normalised to the model input.
pub fn decode_person(triples: &[f32], letterbox: &LetterboxInfo) -> Result<KeypointSet> {
    if triples.len() < KeypointIndex::COUNT * 3 {
        return Err(anyhow!(
            "unexpected keypoint length: got {}, need {}",
            triples.len(),
            KeypointIndex::COUNT * 3
        ));
    }

    let mut set = KeypointSet::default();
    for (slot, chunk) in set
        .keypoints
        .iter_mut()
        .zip(triples.chunks_exact(3).take(KeypointIndex::COUNT))
    {
        let (x, y) = letterbox.project_normalized(chunk[1], chunk[0]);
        *slot = Keypoint::new(x, y, chunk[2].clamp(0.0, 1.0));
    }
    Ok(set)
}
