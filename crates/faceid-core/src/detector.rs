//! Primary face detector: SCRFD via ONNX Runtime.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor-free decoding and NMS post-processing.
//! Any detector that yields axis-aligned boxes can stand in through [`FaceDetector`].

use crate::types::Detection;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MIN_FACE_SIZE: u32 = 20;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Face-bounding-box detector.
///
/// An empty result is a normal outcome; errors are reserved for corrupt
/// input or a broken model session. Implementations must be deterministic.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError>;
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Mutex<Session>,
    input_size: usize,
    score_threshold: f32,
    min_face_size: u32,
    /// Per-stride output indices [(score, bbox)] for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(
        model_path: &Path,
        score_threshold: f32,
        min_face_size: u32,
    ) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        // Score and bbox heads per stride; keypoint heads, when exported, are ignored.
        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires at least 6 outputs (3 strides × score/bbox), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session: Mutex::new(session),
            input_size: SCRFD_INPUT_SIZE,
            score_threshold,
            min_face_size,
            stride_indices,
        })
    }

    /// Resize an RGB image into a NCHW float tensor with letterbox padding.
    fn preprocess(&self, image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
        let (width, height) = (image.width() as f32, image.height() as f32);
        let size = self.input_size;
        let scale = (size as f32 / width).min(size as f32 / height);

        let new_w = ((width * scale).round() as usize).clamp(1, size);
        let new_h = ((height * scale).round() as usize).clamp(1, size);
        let pad_x = (size - new_w) as f32 / 2.0;
        let pad_y = (size - new_h) as f32 / 2.0;

        let resized = image::imageops::resize(image, new_w as u32, new_h as u32, FilterType::Triangle);

        // Padding stays at 0.0, i.e. the normalized SCRFD_MEAN.
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        let pad_x_start = pad_x.floor() as usize;
        let pad_y_start = pad_y.floor() as usize;

        for (x, y, pixel) in resized.enumerate_pixels() {
            let ty = pad_y_start + y as usize;
            let tx = pad_x_start + x as usize;
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        (tensor, LetterboxInfo { scale, pad_x, pad_y })
    }
}

impl FaceDetector for ScrfdDetector {
    /// Detect faces, returning boxes sorted by confidence (highest first).
    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectorError::InvalidImage(format!(
                "{}x{} image",
                image.width(),
                image.height()
            )));
        }

        let (input, letterbox) = self.preprocess(image);

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::InferenceFailed("detector session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            all_detections.extend(decode_stride(
                scores,
                bboxes,
                stride,
                self.input_size,
                &letterbox,
                self.score_threshold,
            ));
        }

        let min = self.min_face_size as f32;
        let mut result: Vec<Detection> = nms(all_detections, SCRFD_NMS_THRESHOLD)
            .into_iter()
            .filter(|d| d.width() >= min && d.height() >= min)
            .collect();
        result.sort_by(|a, b| b.score.total_cmp(&a.score));

        tracing::debug!(faces = result.len(), "SCRFD detection finished");
        Ok(result)
    }
}

/// Discover output tensor ordering by name.
///
/// SCRFD exports either name their heads ("score_8", "bbox_16", ...) or use
/// generic numeric names. Unrecognized names fall back to the standard
/// positional ordering: [0-2] = scores, [3-5] = bboxes.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(indices) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [indices[0], indices[1], indices[2]]
        }
        None => {
            tracing::info!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes"
            );
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Detection> {
    let grid = input_size / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid) as f32 * s;
        let anchor_cy = (anchor_idx / grid) as f32 * s;

        // bbox: [left, top, right, bottom] distances in stride units
        let off = idx * 4;
        let Some(d) = bboxes.get(off..off + 4) else {
            continue;
        };

        let unmap_x = |x: f32| (x - letterbox.pad_x) / letterbox.scale;
        let unmap_y = |y: f32| (y - letterbox.pad_y) / letterbox.scale;

        detections.push(Detection {
            x0: unmap_x(anchor_cx - d[0] * s),
            y0: unmap_y(anchor_cy - d[1] * s),
            x1: unmap_x(anchor_cx + d[2] * s),
            y1: unmap_y(anchor_cy + d[3] * s),
            score,
        });
    }

    detections
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Compute Intersection-over-Union between two boxes.
fn iou(a: &Detection, b: &Detection) -> f32 {
    let inter_w = (a.x1.min(b.x1) - a.x0.max(b.x0)).max(0.0);
    let inter_h = (a.y1.min(b.y1) - a.y0.max(b.y0)).max(0.0);
    let inter_area = inter_w * inter_h;
    let union_area = a.area() + b.area() - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
