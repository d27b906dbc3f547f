//! Fallback face locator.
//!
//! Always yields exactly one face region for a decodable image, trying in order:
//! the primary detector (largest box wins), the coarse cascade over grayscale
//! (largest box, widened to a square), and finally a deterministic center crop.

use crate::cascade::CoarseDetector;
use crate::detector::FaceDetector;
use crate::types::Detection;
use image::RgbImage;
use serde::Serialize;
use std::sync::Arc;

/// Margin split evenly around primary detections, in pixels.
pub const DEFAULT_MARGIN: u32 = 44;

/// Side of the square built around a cascade box, relative to its longer side.
const CASCADE_EXPANSION: f32 = 1.4;

/// Vertical center of the crop for portrait images, as a fraction of height.
const PORTRAIT_CENTER_Y: f32 = 0.4;

/// Which stage of the locator produced a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorStage {
    Primary,
    Cascade,
    CenterCrop,
}

/// Margin added around a region before cropping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarginPolicy {
    /// Total margin in pixels; half goes on each side.
    Fixed(u32),
    /// Region is already framed; crop as-is.
    None,
}

impl MarginPolicy {
    pub fn half(&self) -> f32 {
        match self {
            MarginPolicy::Fixed(m) => *m as f32 / 2.0,
            MarginPolicy::None => 0.0,
        }
    }
}

/// A face region chosen by the locator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocatedFace {
    pub region: Detection,
    pub stage: LocatorStage,
    pub margin: MarginPolicy,
}

pub struct FallbackLocator {
    primary: Arc<dyn FaceDetector>,
    coarse: Option<Arc<dyn CoarseDetector>>,
    margin: u32,
}

impl FallbackLocator {
    pub fn new(
        primary: Arc<dyn FaceDetector>,
        coarse: Option<Arc<dyn CoarseDetector>>,
        margin: u32,
    ) -> Self {
        Self { primary, coarse, margin }
    }

    pub fn locate(&self, image: &RgbImage) -> LocatedFace {
        let (width, height) = image.dimensions();

        match self.primary.detect(image) {
            Ok(detections) => {
                if let Some(region) = select_largest(&detections) {
                    tracing::debug!(
                        candidates = detections.len(),
                        area = region.area(),
                        "primary detector selected largest face"
                    );
                    return LocatedFace {
                        region,
                        stage: LocatorStage::Primary,
                        margin: MarginPolicy::Fixed(self.margin),
                    };
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "primary detector failed; trying fallbacks");
            }
        }

        if let Some(coarse) = &self.coarse {
            let gray = image::imageops::grayscale(image);
            let detections = coarse.detect_gray(&gray);
            if let Some(largest) = select_largest(&detections) {
                tracing::debug!(candidates = detections.len(), "cascade located face");
                return LocatedFace {
                    region: expand_to_square(&largest, width, height),
                    stage: LocatorStage::Cascade,
                    margin: MarginPolicy::None,
                };
            }
        }

        tracing::warn!(width, height, "no face detected, using center crop");
        LocatedFace {
            region: center_crop(width, height),
            stage: LocatorStage::CenterCrop,
            margin: MarginPolicy::None,
        }
    }
}

/// Largest box by area; equal areas go to the higher score.
pub fn select_largest(detections: &[Detection]) -> Option<Detection> {
    detections.iter().copied().max_by(|a, b| {
        a.area()
            .total_cmp(&b.area())
            .then_with(|| a.score.total_cmp(&b.score))
    })
}

/// Square of side `max(w, h) * 1.4` around the box center, clamped to the image.
fn expand_to_square(det: &Detection, width: u32, height: u32) -> Detection {
    let cx = det.x0 + det.width() / 2.0;
    let cy = det.y0 + det.height() / 2.0;
    let half = det.width().max(det.height()) * CASCADE_EXPANSION / 2.0;

    Detection {
        x0: (cx - half).round().max(0.0),
        y0: (cy - half).round().max(0.0),
        x1: (cx + half).round().min(width as f32),
        y1: (cy + half).round().min(height as f32),
        score: det.score,
    }
}

/// Square crop of side `min(width, height)` around the image center.
///
/// Portrait images (height > width) center vertically at 40% of the height.
/// The end is `start + side`, so odd sizes keep the full side before clamping.
pub fn center_crop(width: u32, height: u32) -> Detection {
    let (w, h) = (width as i64, height as i64);
    let side = w.min(h);
    let cx = w / 2;
    let cy = if h > w {
        (height as f32 * PORTRAIT_CENTER_Y) as i64
    } else {
        h / 2
    };

    let x0 = cx - side / 2;
    let y0 = cy - side / 2;

    Detection {
        x0: x0.max(0) as f32,
        y0: y0.max(0) as f32,
        x1: (x0 + side).min(w) as f32,
        y1: (y0 + side).min(h) as f32,
        score: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorError;
    use image::GrayImage;

    struct FixedDetector(Vec<Detection>);

    impl FaceDetector for FixedDetector {
        fn detect(&self, _image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    struct FailingDetector;

    impl FaceDetector for FailingDetector {
        fn detect(&self, _image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
            Err(DetectorError::InferenceFailed("boom".into()))
        }
    }

    struct FixedCascade(Vec<Detection>);

    impl CoarseDetector for FixedCascade {
        fn detect_gray(&self, _gray: &GrayImage) -> Vec<Detection> {
            self.0.clone()
        }
    }

    fn locator(primary: Vec<Detection>, cascade: Option<Vec<Detection>>) -> FallbackLocator {
        FallbackLocator::new(
            Arc::new(FixedDetector(primary)),
            cascade.map(|c| Arc::new(FixedCascade(c)) as Arc<dyn CoarseDetector>),
            DEFAULT_MARGIN,
        )
    }

    #[test]
    fn test_largest_face_wins() {
        let small = Detection::new(0.0, 0.0, 20.0, 20.0, 0.99);
        let large = Detection::new(50.0, 50.0, 110.0, 120.0, 0.60);
        let image = RgbImage::new(200, 200);

        let located = locator(vec![small, large], None).locate(&image);
        assert_eq!(located.stage, LocatorStage::Primary);
        assert_eq!(located.region, large);
        assert_eq!(located.margin, MarginPolicy::Fixed(44));
    }

    #[test]
    fn test_equal_area_tie_broken_by_score() {
        let a = Detection::new(0.0, 0.0, 30.0, 30.0, 0.7);
        let b = Detection::new(100.0, 100.0, 130.0, 130.0, 0.9);
        assert_eq!(select_largest(&[a, b]), Some(b));
        assert_eq!(select_largest(&[b, a]), Some(b));
        assert_eq!(select_largest(&[]), None);
    }

    #[test]
    fn test_cascade_used_when_primary_abstains() {
        let face = Detection::new(40.0, 40.0, 90.0, 100.0, 5.0);
        let image = RgbImage::new(200, 200);

        let located = locator(vec![], Some(vec![face])).locate(&image);
        assert_eq!(located.stage, LocatorStage::Cascade);
        assert_eq!(located.margin, MarginPolicy::None);
        // center (65, 70), side 60 * 1.4 = 84
        assert_eq!(located.region.x0, 23.0);
        assert_eq!(located.region.y0, 28.0);
        assert_eq!(located.region.x1, 107.0);
        assert_eq!(located.region.y1, 112.0);
    }

    #[test]
    fn test_cascade_square_clamped_to_image() {
        let face = Detection::new(0.0, 0.0, 50.0, 50.0, 5.0);
        let region = expand_to_square(&face, 60, 60);
        assert_eq!((region.x0, region.y0), (0.0, 0.0));
        assert_eq!((region.x1, region.y1), (60.0, 60.0));
    }

    #[test]
    fn test_center_crop_when_nothing_found() {
        let image = RgbImage::new(300, 200);
        let located = locator(vec![], Some(vec![])).locate(&image);
        assert_eq!(located.stage, LocatorStage::CenterCrop);
        assert_eq!(located.region, Detection::new(50.0, 0.0, 250.0, 200.0, 0.0));
    }

    #[test]
    fn test_primary_error_falls_through() {
        let image = RgbImage::new(100, 100);
        let located = FallbackLocator::new(Arc::new(FailingDetector), None, DEFAULT_MARGIN)
            .locate(&image);
        assert_eq!(located.stage, LocatorStage::CenterCrop);
        assert_eq!(located.region, Detection::new(0.0, 0.0, 100.0, 100.0, 0.0));
    }

    #[test]
    fn test_center_crop_portrait_shifted_up() {
        // cy = 0.4 * 300 = 120, side 100 → rows 70..170
        let region = center_crop(100, 300);
        assert_eq!(region, Detection::new(0.0, 70.0, 100.0, 170.0, 0.0));
    }

    #[test]
    fn test_center_crop_tall_portrait_clamps_top() {
        let region = center_crop(90, 100);
        // cy = 40, side 90 → y0 = -5 clamped to 0, y1 = 85
        assert_eq!(region, Detection::new(0.0, 0.0, 90.0, 85.0, 0.0));
    }

    #[test]
    fn test_center_crop_odd_sizes_keep_full_side() {
        // side 51, cx 50 → x0 = 25, x1 = 76; cy 25 → y0 = 0, y1 = 51
        let region = center_crop(101, 51);
        assert_eq!(region, Detection::new(25.0, 0.0, 76.0, 51.0, 0.0));
    }

    #[test]
    fn test_center_crop_tiny_image_is_non_empty() {
        let region = center_crop(1, 1);
        assert!(region.clamp_to(1, 1).is_some());
    }
}
