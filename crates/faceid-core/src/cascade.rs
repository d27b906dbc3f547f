//! Secondary coarse detector: SeetaFace funnel-structured cascade via `rustface`.

use crate::types::Detection;
use image::GrayImage;
use rustface::{ImageData, Model};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

const CASCADE_MIN_FACE_SIZE: u32 = 20;
const CASCADE_SCORE_THRESHOLD: f64 = 2.0;
const CASCADE_PYRAMID_SCALE: f32 = 0.8;
const CASCADE_WINDOW_STEP: u32 = 4;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade model not found: {0}")]
    ModelNotFound(String),
    #[error("failed to read cascade model: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse grayscale detector consulted when the primary detector abstains.
pub trait CoarseDetector: Send + Sync {
    fn detect_gray(&self, gray: &GrayImage) -> Vec<Detection>;
}

/// SeetaFace frontal cascade.
pub struct CascadeDetector {
    model: Model,
}

impl CascadeDetector {
    pub fn load(model_path: &Path) -> Result<Self, CascadeError> {
        if !model_path.exists() {
            return Err(CascadeError::ModelNotFound(model_path.display().to_string()));
        }
        let model = rustface::read_model(BufReader::new(File::open(model_path)?))?;
        tracing::info!(path = %model_path.display(), "loaded SeetaFace cascade model");
        Ok(Self { model })
    }
}

/// The cascade rejects images smaller than its minimum window.
fn fits_window(gray: &GrayImage) -> bool {
    gray.width() >= CASCADE_MIN_FACE_SIZE && gray.height() >= CASCADE_MIN_FACE_SIZE
}

fn to_detection(x: i32, y: i32, width: u32, height: u32, score: f64) -> Detection {
    let x0 = x as f32;
    let y0 = y as f32;
    Detection::new(x0, y0, x0 + width as f32, y0 + height as f32, score as f32)
}

impl CoarseDetector for CascadeDetector {
    fn detect_gray(&self, gray: &GrayImage) -> Vec<Detection> {
        if !fits_window(gray) {
            return Vec::new();
        }

        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(CASCADE_MIN_FACE_SIZE);
        detector.set_score_thresh(CASCADE_SCORE_THRESHOLD);
        detector.set_pyramid_scale_factor(CASCADE_PYRAMID_SCALE);
        detector.set_slide_window_step(CASCADE_WINDOW_STEP, CASCADE_WINDOW_STEP);

        let mut image = ImageData::new(gray.as_raw(), gray.width(), gray.height());
        detector
            .detect(&mut image)
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                to_detection(bbox.x(), bbox.y(), bbox.width(), bbox.height(), face.score())
            })
            .collect()
    }
}
