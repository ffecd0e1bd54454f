use image::RgbaImage;
use rayon::prelude::*;

use crate::garment::resize_rgba_to;

/// Blends `garment` over `frame` in place: `out = frame * (1 - a) + garment * a`.
///
/// A garment of a different size is resampled to the frame first. Frame alpha is left untouched.
pub fn composite(frame: &mut RgbaImage, garment: &RgbaImage) {
    if frame.dimensions() != garment.dimensions() {
        log::warn!(
            "garment layer {:?} does not match frame {:?}, resampling before blend",
            garment.dimensions(),
            frame.dimensions()
        );
        match resize_rgba_to(garment, frame.width(), frame.height()) {
            Ok(resized) => blend(frame, &resized),
            Err(err) => log::warn!("garment layer resample failed, skipping blend: {err:?}"),
        }
        return;
    }
    blend(frame, garment);
}

fn blend(frame: &mut RgbaImage, garment: &RgbaImage) {
    let layer = garment.as_raw();
    frame
        .par_chunks_exact_mut(4)
        .zip(layer.par_chunks_exact(4))
        .for_each(|(dst, src)| {
            let a = src[3] as u32;
            if a == 0 {
                return;
            }
            if a == 255 {
                dst[..3].copy_from_slice(&src[..3]);
                return;
            }
            let inv = 255 - a;
            for c in 0..3 {
                dst[c] = ((dst[c] as u32 * inv + src[c] as u32 * a + 127) / 255) as u8;
            }
        });
}
