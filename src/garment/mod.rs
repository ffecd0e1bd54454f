mod cache;
mod keypoints;

pub use self::cache::{BUCKET_PX, ResizeCache, ScaledGarment};
pub use self::keypoints::{
    BoundingBox, GarmentKeypoints, KeypointSource, detect, detect_or_estimate,
    estimate_from_bbox, silhouette_mask,
};

use std::{path::Path, sync::Arc};

use anyhow::Context;
use fast_image_resize as fir;
use image::{DynamicImage, RgbaImage};

use crate::{
    config::PipelineConfig,
    error::{FittingError, Result},
};

/// Scale factors outside this range are clamped before resampling.
const MIN_SCALE: f32 = 0.05;
const MAX_SCALE: f32 = 8.0;

/// Background-removal collaborator, used once when a garment is loaded.
pub trait BackgroundRemover: Send + Sync {
    fn remove(&self, image: &RgbaImage) -> anyhow::Result<RgbaImage>;
}

/// A garment image with its derived keypoints and a memo of shoulder-matched resizes.
#[derive(Debug)]
pub struct GarmentAsset {
    image: Arc<RgbaImage>,
    keypoints: GarmentKeypoints,
    cache: ResizeCache,
    margin: f32,
}

impl GarmentAsset {
    pub fn open(
        path: &Path,
        background_removed: bool,
        remover: Option<&dyn BackgroundRemover>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let image = image::open(path).map_err(|source| FittingError::AssetMissing {
            what: path.display().to_string(),
            source: Some(source),
        })?;
        log::info!("loaded garment image {}", path.display());
        Self::load(image, background_removed, remover, config)
    }

    pub fn load(
        image: DynamicImage,
        background_removed: bool,
        remover: Option<&dyn BackgroundRemover>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let rgba = image.to_rgba8();
        if rgba.width() == 0 || rgba.height() == 0 {
            return Err(FittingError::AssetMissing {
                what: "garment image is empty".into(),
                source: None,
            });
        }

        let rgba = match (background_removed, remover) {
            (false, Some(remover)) => match remover.remove(&rgba) {
                Ok(cut) if cut.dimensions() == rgba.dimensions() => cut,
                Ok(cut) => {
                    log::warn!(
                        "background removal changed size {:?} -> {:?}, using original",
                        rgba.dimensions(),
                        cut.dimensions()
                    );
                    rgba
                }
                Err(err) => {
                    log::warn!("background removal failed, using original garment: {err:?}");
                    rgba
                }
            },
            _ => rgba,
        };

        let keypoints = keypoints::detect_or_estimate(&rgba);
        log::info!(
            "garment ready: {}x{}, shoulder width {:.1}px ({:?})",
            rgba.width(),
            rgba.height(),
            keypoints.shoulder_width,
            keypoints.source
        );

        Ok(Self {
            image: Arc::new(rgba),
            keypoints,
            cache: ResizeCache::new(config.resize_cache_capacity()),
            margin: config.shoulder_margin(),
        })
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn keypoints(&self) -> &GarmentKeypoints {
        &self.keypoints
    }

    pub fn margin(&self) -> f32 {
        self.margin
    }

    /// `(body / garment shoulder width) * margin`.
    pub fn scale_for(&self, body_shoulder_width: f32) -> f32 {
        shoulder_matched_scale(self.keypoints.shoulder_width, body_shoulder_width, self.margin)
    }

    /// Garment scaled so its shoulders match `body_shoulder_width`, memoised per 10 px bucket.
    pub fn resize_for_shoulder_width(&mut self, body_shoulder_width: f32) -> Result<ScaledGarment> {
        if let Some(hit) = self.cache.get(body_shoulder_width) {
            return Ok(hit);
        }

        let scale = self.scale_for(body_shoulder_width).clamp(MIN_SCALE, MAX_SCALE);
        let resized = resize_rgba(&self.image, scale)
            .map_err(|err| FittingError::Resample(format!("{err:#}")))?;
        let actual = resized.width() as f32 / self.image.width() as f32;
        log::debug!(
            "garment resized {}x{} -> {}x{} (scale {scale:.3})",
            self.image.width(),
            self.image.height(),
            resized.width(),
            resized.height()
        );
        let scaled = ScaledGarment {
            image: Arc::new(resized),
            scale: actual,
        };
        self.cache.insert(body_shoulder_width, scaled.clone());
        Ok(scaled)
    }

    /// Number of real resamples performed so far.
    pub fn resize_count(&self) -> u64 {
        self.cache.misses()
    }

    pub fn cache(&self) -> &ResizeCache {
        &self.cache
    }
}

pub fn shoulder_matched_scale(garment_width: f32, body_width: f32, margin: f32) -> f32 {
    if garment_width <= f32::EPSILON || !body_width.is_finite() {
        return 1.0;
    }
    body_width / garment_width * margin
}

/// Resamples an RGBA image by `scale` (alpha-aware) with fast_image_resize.
pub fn resize_rgba(image: &RgbaImage, scale: f32) -> anyhow::Result<RgbaImage> {
    let new_w = ((image.width() as f32 * scale) as u32).max(1);
    let new_h = ((image.height() as f32 * scale) as u32).max(1);
    resize_rgba_to(image, new_w, new_h)
}

pub fn resize_rgba_to(image: &RgbaImage, new_w: u32, new_h: u32) -> anyhow::Result<RgbaImage> {
    let src = fir::images::Image::from_vec_u8(
        image.width(),
        image.height(),
        image.as_raw().clone(),
        fir::PixelType::U8x4,
    )?;
    let mut dst = fir::images::Image::new(new_w, new_h, fir::PixelType::U8x4);
    let options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::Bilinear));
    fir::Resizer::new()
        .resize(&src, &mut dst, Some(&options))
        .context("fast resize failed")?;
    RgbaImage::from_raw(new_w, new_h, dst.into_vec())
        .context("resized buffer does not match its dimensions")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    struct FailingRemover;

    impl BackgroundRemover for FailingRemover {
        fn remove(&self, _image: &RgbaImage) -> anyhow::Result<RgbaImage> {
            Err(anyhow::anyhow!("model offline"))
        }
    }

    struct WhiteKeyRemover;

    impl BackgroundRemover for WhiteKeyRemover {
        fn remove(&self, image: &RgbaImage) -> anyhow::Result<RgbaImage> {
            let mut out = image.clone();
            for px in out.pixels_mut() {
                if px[0] > 240 && px[1] > 240 && px[2] > 240 {
                    px[3] = 0;
                }
            }
            Ok(out)
        }
    }

    fn garment_on_white() -> DynamicImage {
        let mut img = RgbaImage::from_pixel(100, 120, Rgba([255, 255, 255, 255]));
        for y in 10..110 {
            for x in 10..90 {
                img.put_pixel(x, y, Rgba([20, 40, 160, 255]));
            }
        }
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn scale_law_matches_margin() {
        let scale = shoulder_matched_scale(200.0, 300.0, 1.25);
        assert!((scale - 1.875).abs() < 1e-5);
        assert_eq!(shoulder_matched_scale(0.0, 300.0, 1.25), 1.0);
    }

    #[test]
    fn remover_output_drives_keypoints() {
        let cfg = PipelineConfig::default();
        let asset =
            GarmentAsset::load(garment_on_white(), false, Some(&WhiteKeyRemover), &cfg).unwrap();
        assert_eq!(asset.keypoints().source, KeypointSource::Silhouette);
        assert_eq!(asset.keypoints().left_shoulder.0, 10.0);
        assert_eq!(asset.keypoints().right_shoulder.0, 89.0);
    }

    #[test]
    fn failed_removal_keeps_original_image() {
        let cfg = PipelineConfig::default();
        let asset =
            GarmentAsset::load(garment_on_white(), false, Some(&FailingRemover), &cfg).unwrap();
        assert_eq!(asset.image().dimensions(), (100, 120));
        assert_eq!(asset.image().get_pixel(0, 0)[3], 255);
    }

    #[test]
    fn empty_image_is_rejected() {
        let cfg = PipelineConfig::default();
        let empty = DynamicImage::ImageRgba8(RgbaImage::new(0, 0));
        assert!(matches!(
            GarmentAsset::load(empty, true, None, &cfg),
            Err(FittingError::AssetMissing { .. })
        ));
    }

    #[test]
    fn missing_file_is_asset_missing() {
        let cfg = PipelineConfig::default();
        let err = GarmentAsset::open(Path::new("/nonexistent/garment.png"), true, None, &cfg)
            .unwrap_err();
        assert!(matches!(err, FittingError::AssetMissing { .. }));
    }

    #[test]
    fn same_bucket_resizes_once() {
        let cfg = PipelineConfig::default();
        let mut asset =
            GarmentAsset::load(garment_on_white(), false, Some(&WhiteKeyRemover), &cfg).unwrap();
        let a = asset.resize_for_shoulder_width(301.0).unwrap();
        let b = asset.resize_for_shoulder_width(305.0).unwrap();
        assert_eq!(asset.resize_count(), 1);
        assert!(Arc::ptr_eq(&a.image, &b.image));
        asset.resize_for_shoulder_width(315.0).unwrap();
        assert_eq!(asset.resize_count(), 2);
    }

    #[test]
    fn resized_garment_tracks_scale() {
        let mut cfg = PipelineConfig::default();
        cfg.set_shoulder_margin(1.0).unwrap();
        let mut asset =
            GarmentAsset::load(garment_on_white(), false, Some(&WhiteKeyRemover), &cfg).unwrap();
        let garment_width = asset.keypoints().shoulder_width;
        let scaled = asset.resize_for_shoulder_width(garment_width * 2.0).unwrap();
        assert_eq!(scaled.image.width(), 200);
        assert!((scaled.scale - 2.0).abs() < 1e-3);
    }
}
