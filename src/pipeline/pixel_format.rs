//! Conversion of caller and camera pixel layouts into the pipeline's RGBA frames.

use anyhow::{Result, anyhow};
use rayon::prelude::*;
use yuv::{
    YuvBiPlanarImage, YuvConversionMode, YuvPackedImage, YuvRange, YuvStandardMatrix,
    yuv_nv12_to_rgba, yuyv422_to_rgba,
};
use zune_jpeg::{
    JpegDecoder,
    zune_core::{bytestream::ZCursor, colorspace::ColorSpace, options::DecoderOptions},
};

use crate::types::Frame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    Rgb,
    Bgr,
    Rgba,
    Gray,
    Yuyv,
    Nv12,
    Mjpeg,
}

/// Decodes `data` into an RGBA [`Frame`], optionally mirroring it horizontally
/// for a selfie-style preview.
pub fn to_frame(
    data: &[u8],
    width: u32,
    height: u32,
    layout: PixelLayout,
    mirror: bool,
) -> Result<Frame> {
    let (rgba, width, height) = match layout {
        PixelLayout::Rgb => (packed_to_rgba(data, width, height, Packing::Rgb)?, width, height),
        PixelLayout::Bgr => (packed_to_rgba(data, width, height, Packing::Bgr)?, width, height),
        PixelLayout::Rgba => (packed_to_rgba(data, width, height, Packing::Rgba)?, width, height),
        PixelLayout::Gray => (gray_to_rgba(data, width, height)?, width, height),
        PixelLayout::Yuyv => (yuyv_to_rgba(data, width, height)?, width, height),
        PixelLayout::Nv12 => (nv12_to_rgba(data, width, height)?, width, height),
        PixelLayout::Mjpeg => mjpeg_to_rgba(data)?,
    };
    let mut frame = Frame::new(rgba, width, height);
    if mirror {
        mirror_rows(&mut frame);
    }
    Ok(frame)
}

pub fn mirror_rows(frame: &mut Frame) {
    let stride = frame.width as usize * 4;
    if stride == 0 {
        return;
    }
    frame.rgba.par_chunks_exact_mut(stride).for_each(|row| {
        let w = row.len() / 4;
        for x in 0..w / 2 {
            let (l, r) = (x * 4, (w - 1 - x) * 4);
            for c in 0..4 {
                row.swap(l + c, r + c);
            }
        }
    });
}

#[derive(Clone, Copy)]
enum Packing {
    Rgb,
    Bgr,
    Rgba,
}

fn packed_to_rgba(data: &[u8], width: u32, height: u32, packing: Packing) -> Result<Vec<u8>> {
    let channels = match packing {
        Packing::Rgba => 4,
        _ => 3,
    };
    let pixels = width as usize * height as usize;
    let expected_len = pixels * channels;
    if data.len() < expected_len {
        return Err(anyhow!(
            "packed buffer too small: got {}, expected {}",
            data.len(),
            expected_len
        ));
    }
    if let Packing::Rgba = packing {
        return Ok(data[..expected_len].to_vec());
    }

    let mut rgba = vec![0u8; pixels * 4];
    rgba.par_chunks_mut(4)
        .zip(data.par_chunks_exact(3))
        .for_each(|(dst, src)| {
            match packing {
                Packing::Bgr => {
                    dst[0] = src[2];
                    dst[1] = src[1];
                    dst[2] = src[0];
                }
                _ => dst[..3].copy_from_slice(src),
            }
            dst[3] = 255;
        });
    Ok(rgba)
}

fn gray_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let expected_len = width as usize * height as usize;
    if data.len() < expected_len {
        return Err(anyhow!(
            "gray buffer too small: got {}, expected {}",
            data.len(),
            expected_len
        ));
    }

    let mut rgba = vec![0u8; expected_len * 4];
    rgba.par_chunks_mut(4)
        .zip(data[..expected_len].par_iter().copied())
        .for_each(|(dst, value)| {
            dst[..3].fill(value);
            dst[3] = 255;
        });
    Ok(rgba)
}

fn nv12_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let y_plane_len = width as usize * height as usize;
    let uv_plane_len = y_plane_len / 2;
    if data.len() < y_plane_len + uv_plane_len {
        return Err(anyhow!(
            "NV12 buffer too small: got {}, expected {}",
            data.len(),
            y_plane_len + uv_plane_len
        ));
    }

    let image = YuvBiPlanarImage {
        y_plane: &data[..y_plane_len],
        y_stride: width,
        uv_plane: &data[y_plane_len..y_plane_len + uv_plane_len],
        uv_stride: width,
        width,
        height,
    };
    let mut rgba = vec![0u8; y_plane_len * 4];
    yuv_nv12_to_rgba(
        &image,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
        YuvConversionMode::Balanced,
    )
    .map_err(|err| anyhow!("NV12 to RGBA failed: {err:?}"))?;
    Ok(rgba)
}

fn yuyv_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let expected_len = width as usize * height as usize * 2;
    if data.len() < expected_len {
        return Err(anyhow!(
            "YUYV buffer too small: got {}, expected {}",
            data.len(),
            expected_len
        ));
    }

    let packed = YuvPackedImage {
        yuy: data,
        yuy_stride: width * 2,
        width,
        height,
    };
    let mut rgba = vec![0u8; width as usize * height as usize * 4];
    yuyv422_to_rgba(
        &packed,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
    )
    .map_err(|err| anyhow!("YUYV422 to RGBA failed: {err:?}"))?;
    Ok(rgba)
}

/// MJPEG carries its own dimensions; the decoded size wins over the declared one.
fn mjpeg_to_rgba(data: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let options = DecoderOptions::default().jpeg_set_out_colorspace(ColorSpace::RGBA);
    let mut decoder = JpegDecoder::new_with_options(ZCursor::new(data), options);
    let rgba = decoder
        .decode()
        .map_err(|err| anyhow!("MJPEG decode failed: {err:?}"))?;
    let info = decoder
        .info()
        .ok_or_else(|| anyhow!("MJPEG decoder reported no image info"))?;
    let (width, height) = u32::try_from(info.width)
        .and_then(|w| u32::try_from(info.height).map(|h| (w, h)))
        .map_err(|_| anyhow!("MJPEG dimensions do not fit u32"))?;
    let expected_len = width as usize * height as usize * 4;
    if rgba.len() < expected_len {
        return Err(anyhow!(
            "MJPEG decode produced too few bytes: got {}, expected {}",
            rgba.len(),
            expected_len
        ));
    }
    Ok((rgba, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgr_is_swapped_and_opaque() {
        let frame = to_frame(&[1, 2, 3, 4, 5, 6], 2, 1, PixelLayout::Bgr, false).unwrap();
        assert_eq!(frame.rgba, vec![3, 2, 1, 255, 6, 5, 4, 255]);
    }

    #[test]
    fn gray_expands_to_rgba() {
        let frame = to_frame(&[7, 9], 2, 1, PixelLayout::Gray, false).unwrap();
        assert_eq!(frame.rgba, vec![7, 7, 7, 255, 9, 9, 9, 255]);
    }

    #[test]
    fn mirror_flips_each_row() {
        let frame = to_frame(&[1, 1, 1, 2, 2, 2, 3, 3, 3], 3, 1, PixelLayout::Rgb, true).unwrap();
        assert_eq!(
            frame.rgba,
            vec![3, 3, 3, 255, 2, 2, 2, 255, 1, 1, 1, 255]
        );
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(to_frame(&[0; 5], 2, 1, PixelLayout::Rgb, false).is_err());
        assert!(to_frame(&[0; 3], 2, 2, PixelLayout::Nv12, false).is_err());
        assert!(to_frame(&[0; 3], 2, 1, PixelLayout::Yuyv, false).is_err());
    }

    #[test]
    fn garbage_mjpeg_is_an_error() {
        assert!(to_frame(&[0, 1, 2, 3], 2, 2, PixelLayout::Mjpeg, false).is_err());
    }
}
