use serde::{Deserialize, Serialize};

/// Axis-aligned face box in source-image pixel coordinates, with detector confidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
    pub score: f32,
}

impl Detection {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32, score: f32) -> Self {
        Self { x0, y0, x1, y1, score }
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    /// Box area; zero for inverted or empty boxes.
    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Clamp to `[0, width] × [0, height]` and truncate to whole pixels.
    ///
    /// Returns `None` when the clamped box has zero or negative extent.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<PixelBox> {
        let x0 = self.x0.max(0.0) as u32;
        let y0 = self.y0.max(0.0) as u32;
        let x1 = self.x1.min(width as f32).max(0.0) as u32;
        let y1 = self.y1.min(height as f32).max(0.0) as u32;
        PixelBox::new(x0, y0, x1, y1)
    }
}

/// Integer box `[x0, x1) × [y0, y1)` inside an image. Always non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelBox {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl PixelBox {
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Option<Self> {
        (x1 > x0 && y1 > y0).then_some(Self { x0, y0, x1, y1 })
    }

    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }
}

/// Channel layout of a [`NormalizedFace`].
///
/// Registration and recognition must feed the embedder the same layout;
/// the embedder rejects patches whose order differs from its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Canonical whitened face patch, `size × size × 3`, row-major HWC.
#[derive(Debug, Clone)]
pub struct NormalizedFace {
    pub size: usize,
    pub order: ChannelOrder,
    pub data: Vec<f32>,
}

impl NormalizedFace {
    /// Value at row `y`, column `x`, channel `c`.
    pub fn at(&self, y: usize, x: usize, c: usize) -> f32 {
        self.data[(y * self.size + x) * 3 + c]
    }
}

/// Face embedding vector (512-dimensional for FaceNet 20180402).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "20180402-114759").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Scale to unit L2 norm. Zero vectors are returned unchanged.
    pub fn l2_normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut self.values {
                *v /= norm;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_area() {
        let d = Detection::new(10.0, 20.0, 30.0, 60.0, 0.9);
        assert_eq!(d.width(), 20.0);
        assert_eq!(d.height(), 40.0);
        assert_eq!(d.area(), 800.0);
    }

    #[test]
    fn test_inverted_detection_has_zero_area() {
        let d = Detection::new(30.0, 20.0, 10.0, 60.0, 0.9);
        assert_eq!(d.area(), 0.0);
    }

    #[test]
    fn test_clamp_to_image_bounds() {
        let d = Detection::new(-5.0, -3.5, 120.7, 90.2, 0.8);
        let b = d.clamp_to(100, 80).unwrap();
        assert_eq!(b, PixelBox { x0: 0, y0: 0, x1: 100, y1: 80 });
    }

    #[test]
    fn test_clamp_degenerate_box() {
        // Entirely right of the image: collapses to zero width
        let d = Detection::new(150.0, 10.0, 180.0, 40.0, 0.8);
        assert!(d.clamp_to(100, 100).is_none());

        let flat = Detection::new(10.0, 10.0, 40.0, 10.4, 0.8);
        assert!(flat.clamp_to(100, 100).is_none());
    }

    #[test]
    fn test_l2_normalized() {
        let e = Embedding::new(vec![3.0, 4.0]).l2_normalized();
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        assert!((e.values[1] - 0.8).abs() < 1e-6);

        let zero = Embedding::new(vec![0.0, 0.0]).l2_normalized();
        assert_eq!(zero.values, vec![0.0, 0.0]);
    }
}
