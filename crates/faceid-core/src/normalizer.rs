//! Face normalization: margin crop, bicubic resize, prewhitening.
//!
//! Registration stores the resized crop (before whitening) in the processed
//! corpus; training reloads it and whitens it through [`Normalizer::standardize`].
//! Recognition runs the same crop and whitening in memory. Both paths therefore
//! share one channel order, checked again by the embedder.

use crate::locator::{LocatedFace, MarginPolicy};
use crate::types::{ChannelOrder, Detection, NormalizedFace, PixelBox};
use image::imageops::FilterType;
use image::RgbImage;
use thiserror::Error;

/// Side of the canonical face patch (FaceNet input).
pub const DEFAULT_IMAGE_SIZE: u32 = 160;

/// Channel order produced by every normalization path.
pub const CANONICAL_ORDER: ChannelOrder = ChannelOrder::Rgb;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("degenerate face region ({x0}, {y0}, {x1}, {y1}) in {width}x{height} image")]
    DegenerateRegion {
        x0: f32,
        y0: f32,
        x1: f32,
        y1: f32,
        width: u32,
        height: u32,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    image_size: u32,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE_SIZE)
    }
}

impl Normalizer {
    pub fn new(image_size: u32) -> Self {
        Self { image_size }
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// Crop a located face and resize it to the canonical square.
    pub fn crop(&self, image: &RgbImage, face: &LocatedFace) -> Result<RgbImage, NormalizeError> {
        self.crop_region(image, &face.region, face.margin)
    }

    /// Expand `region` by the margin policy, clamp to the image, crop and
    /// resize with a bicubic filter.
    pub fn crop_region(
        &self,
        image: &RgbImage,
        region: &Detection,
        margin: MarginPolicy,
    ) -> Result<RgbImage, NormalizeError> {
        let (width, height) = image.dimensions();
        let half = margin.half();
        let expanded = Detection {
            x0: region.x0 - half,
            y0: region.y0 - half,
            x1: region.x1 + half,
            y1: region.y1 + half,
            score: region.score,
        };

        let bb: PixelBox = expanded.clamp_to(width, height).ok_or(NormalizeError::DegenerateRegion {
            x0: expanded.x0,
            y0: expanded.y0,
            x1: expanded.x1,
            y1: expanded.y1,
            width,
            height,
        })?;

        let cropped = image::imageops::crop_imm(image, bb.x0, bb.y0, bb.width(), bb.height()).to_image();
        Ok(image::imageops::resize(
            &cropped,
            self.image_size,
            self.image_size,
            FilterType::CatmullRom,
        ))
    }

    /// Whiten a canonical crop: subtract the mean and divide by
    /// `max(std, 1/sqrt(N))` over all `N` channel values.
    ///
    /// Crops of a different size are resized first.
    pub fn standardize(&self, crop: &RgbImage) -> NormalizedFace {
        let size = self.image_size;
        let resized;
        let crop = if crop.dimensions() == (size, size) {
            crop
        } else {
            resized = image::imageops::resize(crop, size, size, FilterType::CatmullRom);
            &resized
        };

        let raw = crop.as_raw();
        let n = raw.len() as f64;
        let mean = raw.iter().map(|&v| v as f64).sum::<f64>() / n;
        let variance = raw.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
        let std_adj = variance.sqrt().max(1.0 / n.sqrt());

        NormalizedFace {
            size: size as usize,
            order: CANONICAL_ORDER,
            data: raw.iter().map(|&v| ((v as f64 - mean) / std_adj) as f32).collect(),
        }
    }

    /// Crop, resize and whiten in one step.
    pub fn normalize(&self, image: &RgbImage, face: &LocatedFace) -> Result<NormalizedFace, NormalizeError> {
        Ok(self.standardize(&self.crop(image, face)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::LocatorStage;
    use image::Rgb;

    fn located(region: Detection, margin: MarginPolicy) -> LocatedFace {
        LocatedFace { region, stage: LocatorStage::Primary, margin }
    }

    /// Image whose pixel value encodes its column, to check crop offsets.
    fn column_ramp(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, _| Rgb([x as u8, 0, 0]))
    }

    #[test]
    fn test_crop_output_size() {
        let image = column_ramp(200, 150);
        let face = located(Detection::new(60.0, 40.0, 120.0, 110.0, 0.9), MarginPolicy::Fixed(44));
        let crop = Normalizer::default().crop(&image, &face).unwrap();
        assert_eq!(crop.dimensions(), (160, 160));
    }

    #[test]
    fn test_margin_split_evenly() {
        // Identity-size normalizer so the crop is not resampled.
        let image = column_ramp(200, 200);
        let normalizer = Normalizer::new(104);
        let face = located(Detection::new(50.0, 50.0, 110.0, 110.0, 0.9), MarginPolicy::Fixed(44));
        let crop = normalizer.crop(&image, &face).unwrap();
        // 60px box + 22px each side = 104px starting at column 28
        assert_eq!(crop.get_pixel(0, 0)[0], 28);
        assert_eq!(crop.get_pixel(103, 0)[0], 131);
    }

    #[test]
    fn test_margin_clamped_to_image() {
        let image = column_ramp(100, 100);
        let normalizer = Normalizer::new(50);
        let face = located(Detection::new(5.0, 5.0, 55.0, 55.0, 0.9), MarginPolicy::Fixed(44));
        // Clamped region is 0..77 horizontally, so the left edge is near column 0.
        let crop = normalizer.crop(&image, &face).unwrap();
        assert!(crop.get_pixel(0, 0)[0] <= 2);
    }

    #[test]
    fn test_no_margin_policy() {
        let image = column_ramp(100, 100);
        let normalizer = Normalizer::new(40);
        let face = located(Detection::new(30.0, 30.0, 70.0, 70.0, 0.0), MarginPolicy::None);
        let crop = normalizer.crop(&image, &face).unwrap();
        assert_eq!(crop.get_pixel(0, 0)[0], 30);
        assert_eq!(crop.get_pixel(39, 0)[0], 69);
    }

    #[test]
    fn test_degenerate_region_rejected() {
        let image = column_ramp(100, 100);
        let face = located(Detection::new(300.0, 300.0, 400.0, 400.0, 0.9), MarginPolicy::None);
        let err = Normalizer::default().crop(&image, &face).unwrap_err();
        assert!(matches!(err, NormalizeError::DegenerateRegion { .. }));
    }

    #[test]
    fn test_whitening_zero_mean_unit_std() {
        let crop = RgbImage::from_fn(160, 160, |x, y| Rgb([(x + y) as u8, x as u8, y as u8]));
        let face = Normalizer::default().standardize(&crop);

        let n = face.data.len() as f32;
        let mean = face.data.iter().sum::<f32>() / n;
        let var = face.data.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 1e-3, "mean = {mean}");
        assert!((var.sqrt() - 1.0).abs() < 1e-3, "std = {}", var.sqrt());
    }

    #[test]
    fn test_whitening_uniform_patch_is_finite() {
        let crop = RgbImage::from_pixel(160, 160, Rgb([128, 128, 128]));
        let face = Normalizer::default().standardize(&crop);
        assert!(face.data.iter().all(|v| v.is_finite() && *v == 0.0));
    }

    #[test]
    fn test_channel_order_is_rgb() {
        let crop = RgbImage::from_pixel(160, 160, Rgb([250, 10, 10]));
        let face = Normalizer::default().standardize(&crop);
        assert_eq!(face.order, ChannelOrder::Rgb);
        assert!(face.at(5, 5, 0) > 0.0);
        assert!(face.at(5, 5, 1) < 0.0);
        assert!(face.at(5, 5, 2) < 0.0);
    }

    #[test]
    fn test_standardize_resizes_off_size_crops() {
        let crop = RgbImage::from_pixel(80, 90, Rgb([1, 2, 3]));
        let face = Normalizer::default().standardize(&crop);
        assert_eq!(face.size, 160);
        assert_eq!(face.data.len(), 160 * 160 * 3);
    }
}
