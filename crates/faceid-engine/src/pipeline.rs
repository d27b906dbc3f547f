//! Pipeline orchestration for alignment, training and recognition.

use crate::corpus::{CorpusError, CorpusLayout};
use faceid_core::embedder::embed_faces;
use faceid_core::{
    CoarseDetector, ClassifierArtifact, ClassifierError, DetectorError, EmbedderError,
    FaceDetector, FaceEmbedder, FallbackLocator, MarginPolicy, NormalizeError, Normalizer,
    PixelBox, TrainerParams, TrainingSet,
};
use image::{ImageFormat, RgbImage};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("processed corpus has no people")]
    EmptyCorpus,
    #[error("person {0:?} has no usable images")]
    EmptyClass(String),
    #[error("corpus: {0}")]
    Corpus(#[from] CorpusError),
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("classifier: {0}")]
    Classifier(#[from] ClassifierError),
}

/// Why a single raw image produced no processed crop.
#[derive(Error, Debug)]
pub enum AlignError {
    #[error("decode {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("crop: {0}")]
    Crop(#[from] NormalizeError),
    #[error("write {path}: {source}")]
    Write {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Outcome of aligning a set of raw images into the processed corpus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlignmentReport {
    pub attempted: usize,
    pub aligned: usize,
    /// Outputs that already existed and were left untouched.
    pub skipped_existing: usize,
    pub failed: usize,
}

impl AlignmentReport {
    /// Images with a processed output after this run.
    pub fn usable(&self) -> usize {
        self.aligned + self.skipped_existing
    }
}

/// One classified face from a recognition image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceScore {
    pub label: String,
    pub confidence: f32,
    pub bbox: PixelBox,
}

/// All faces the detector found in one image and those that were classified.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaceScan {
    pub detected_faces: usize,
    pub scores: Vec<FaceScore>,
}

pub struct Pipeline {
    detector: Arc<dyn FaceDetector>,
    locator: FallbackLocator,
    normalizer: Normalizer,
    embedder: Arc<dyn FaceEmbedder>,
    margin: u32,
    batch_size: usize,
}

impl Pipeline {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        coarse: Option<Arc<dyn CoarseDetector>>,
        embedder: Arc<dyn FaceEmbedder>,
        normalizer: Normalizer,
        margin: u32,
        batch_size: usize,
    ) -> Self {
        Self {
            locator: FallbackLocator::new(detector.clone(), coarse, margin),
            detector,
            normalizer,
            embedder,
            margin,
            batch_size,
        }
    }

    /// Align every raw image of a person, skipping outputs that already exist.
    pub fn align_person(&self, corpus: &CorpusLayout, name: &str) -> Result<AlignmentReport, CorpusError> {
        let raw = corpus.raw_images(name)?;
        self.align_images(corpus, name, &raw)
    }

    /// Locate, crop and store each raw image as `<processed>/<name>/<stem>.png`.
    ///
    /// Images that fail to decode or crop are counted and skipped. The
    /// person's processed directory is created by the first successful write.
    pub fn align_images(
        &self,
        corpus: &CorpusLayout,
        name: &str,
        raw_paths: &[PathBuf],
    ) -> Result<AlignmentReport, CorpusError> {
        let mut report = AlignmentReport::default();
        for raw in raw_paths {
            report.attempted += 1;
            let out = corpus.processed_path_for(name, raw);
            if out.exists() {
                report.skipped_existing += 1;
                continue;
            }
            match self.align_one(raw, &out) {
                Ok(()) => report.aligned += 1,
                Err(e) => {
                    tracing::warn!(path = %raw.display(), error = %e, "alignment skipped image");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            person = name,
            attempted = report.attempted,
            aligned = report.aligned,
            skipped_existing = report.skipped_existing,
            failed = report.failed,
            "alignment finished"
        );
        Ok(report)
    }

    fn align_one(&self, raw: &Path, out: &Path) -> Result<(), AlignError> {
        let image = image::open(raw)
            .map_err(|source| AlignError::Decode {
                path: raw.to_path_buf(),
                source,
            })?
            .to_rgb8();
        let located = self.locator.locate(&image);
        let crop = self.normalizer.crop(&image, &located)?;

        if let Some(dir) = out.parent() {
            std::fs::create_dir_all(dir).map_err(|source| AlignError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        // Write beside the target and rename so a crash never leaves a partial output.
        let tmp = out.with_file_name(format!(
            ".{}.tmp",
            out.file_name().map(|f| f.to_string_lossy()).unwrap_or_default()
        ));
        crop.save_with_format(&tmp, ImageFormat::Png)
            .map_err(|source| AlignError::Write {
                path: tmp.clone(),
                source,
            })?;
        std::fs::rename(&tmp, out).map_err(|source| {
            let _ = std::fs::remove_file(&tmp);
            AlignError::Io {
                path: out.to_path_buf(),
                source,
            }
        })?;

        tracing::debug!(
            path = %raw.display(),
            stage = ?located.stage,
            x0 = located.region.x0,
            y0 = located.region.y0,
            x1 = located.region.x1,
            y1 = located.region.y1,
            "aligned image"
        );
        Ok(())
    }

    /// Embed the whole processed corpus. Labels follow the sorted person list.
    pub fn load_training_set(&self, corpus: &CorpusLayout) -> Result<TrainingSet, TrainingError> {
        let people = corpus.list_people()?;
        if people.is_empty() {
            return Err(TrainingError::EmptyCorpus);
        }

        let mut faces = Vec::new();
        let mut labels = Vec::new();
        for (label, name) in people.iter().enumerate() {
            let before = faces.len();
            for path in corpus.processed_images(name)? {
                match image::open(&path) {
                    Ok(img) => {
                        faces.push(self.normalizer.standardize(&img.to_rgb8()));
                        labels.push(label);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "unreadable processed image skipped");
                    }
                }
            }
            if faces.len() == before {
                return Err(TrainingError::EmptyClass(name.clone()));
            }
        }

        let embeddings = embed_faces(self.embedder.as_ref(), &faces, self.batch_size)?;
        Ok(TrainingSet {
            class_names: people,
            embeddings,
            labels,
        })
    }

    /// Rebuild a classifier from the entire processed corpus.
    pub fn train(&self, corpus: &CorpusLayout, params: &TrainerParams) -> Result<ClassifierArtifact, TrainingError> {
        let set = self.load_training_set(corpus)?;
        let artifact = ClassifierArtifact::train(&set, params)?;
        tracing::info!(
            classes = artifact.class_names.len(),
            samples = artifact.sample_count,
            dim = artifact.embedding_dim,
            "classifier trained"
        );
        Ok(artifact)
    }

    /// Detect every face, then normalize, embed and classify each independently.
    ///
    /// Degenerate boxes and per-face failures are skipped; only a detector
    /// failure on the whole image is returned as an error.
    pub fn scan(&self, image: &RgbImage, artifact: &ClassifierArtifact) -> Result<FaceScan, DetectorError> {
        let (width, height) = image.dimensions();
        let detections = self.detector.detect(image)?;
        let mut scan = FaceScan {
            detected_faces: detections.len(),
            scores: Vec::with_capacity(detections.len()),
        };

        for (i, det) in detections.iter().enumerate() {
            let Some(bbox) = det.clamp_to(width, height) else {
                tracing::debug!(face = i, "degenerate box skipped");
                continue;
            };
            let crop = match self
                .normalizer
                .crop_region(image, det, MarginPolicy::Fixed(self.margin))
            {
                Ok(crop) => crop,
                Err(e) => {
                    tracing::warn!(face = i, error = %e, "face crop failed");
                    continue;
                }
            };
            let face = self.normalizer.standardize(&crop);

            let embedding = match embed_faces(self.embedder.as_ref(), std::slice::from_ref(&face), 1) {
                Ok(mut e) if !e.is_empty() => e.swap_remove(0),
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(face = i, error = %e, "face embedding failed");
                    continue;
                }
            };
            match artifact.predict(&embedding) {
                Ok(prediction) => {
                    tracing::debug!(
                        face = i,
                        label = %prediction.label,
                        confidence = prediction.probability,
                        "face classified"
                    );
                    scan.scores.push(FaceScore {
                        label: prediction.label,
                        confidence: prediction.probability,
                        bbox,
                    });
                }
                Err(e) => {
                    tracing::warn!(face = i, error = %e, "face classification failed");
                }
            }
        }
        Ok(scan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceid_core::{Detection, Embedding, NormalizedFace};
    use image::Rgb;
    use std::fs;

    /// Whole-image box for textured images, nothing for flat ones.
    struct TextureDetector;

    impl FaceDetector for TextureDetector {
        fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
            let first = image.get_pixel(0, 0);
            if image.pixels().all(|p| p == first) {
                return Ok(Vec::new());
            }
            let (w, h) = image.dimensions();
            Ok(vec![Detection::new(0.0, 0.0, w as f32, h as f32, 0.99)])
        }
    }

    struct ListDetector(Vec<Detection>);

    impl FaceDetector for ListDetector {
        fn detect(&self, _image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    /// Mean of each channel over the whitened patch.
    struct ChannelMeanEmbedder;

    impl FaceEmbedder for ChannelMeanEmbedder {
        fn embed_batch(&self, faces: &[NormalizedFace]) -> Result<Vec<Embedding>, EmbedderError> {
            Ok(faces
                .iter()
                .map(|f| {
                    let mut sums = [0.0f32; 3];
                    for (i, v) in f.data.iter().enumerate() {
                        sums[i % 3] += v;
                    }
                    let n = (f.data.len() / 3) as f32;
                    Embedding::new(sums.iter().map(|s| s / n).collect())
                })
                .collect())
        }
    }

    fn pipeline(detector: Arc<dyn FaceDetector>) -> Pipeline {
        Pipeline::new(
            detector,
            None,
            Arc::new(ChannelMeanEmbedder),
            Normalizer::new(32),
            8,
            4,
        )
    }

    /// Mostly `color` with a darker square in the middle.
    fn face_image(color: [u8; 3]) -> RgbImage {
        RgbImage::from_fn(64, 64, |x, y| {
            if (16..48).contains(&x) && (16..48).contains(&y) {
                Rgb([color[0] / 2, color[1] / 2, color[2] / 2])
            } else {
                Rgb(color)
            }
        })
    }

    fn write_raw(corpus: &CorpusLayout, name: &str, file: &str, img: &RgbImage) -> PathBuf {
        let dir = corpus.raw_dir(name);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(file);
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_align_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = CorpusLayout::new(dir.path().join("raw"), dir.path().join("processed"));
        write_raw(&corpus, "Alice", "a_0.png", &face_image([200, 40, 40]));
        write_raw(&corpus, "Alice", "a_1.png", &face_image([210, 30, 30]));
        let p = pipeline(Arc::new(TextureDetector));

        let first = p.align_person(&corpus, "Alice").unwrap();
        assert_eq!(first.aligned, 2);
        assert_eq!(first.skipped_existing, 0);

        let out = corpus.processed_dir("Alice").join("a_0.png");
        let before = fs::read(&out).unwrap();

        let second = p.align_person(&corpus, "Alice").unwrap();
        assert_eq!(second.aligned, 0);
        assert_eq!(second.skipped_existing, 2);
        assert_eq!(fs::read(&out).unwrap(), before);
        assert_eq!(corpus.processed_images("Alice").unwrap().len(), 2);
    }

    #[test]
    fn test_align_skips_undecodable() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = CorpusLayout::new(dir.path().join("raw"), dir.path().join("processed"));
        write_raw(&corpus, "Bob", "b_0.png", &face_image([40, 40, 200]));
        fs::write(corpus.raw_dir("Bob").join("b_1.jpg"), b"garbage").unwrap();

        let report = pipeline(Arc::new(TextureDetector)).align_person(&corpus, "Bob").unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.aligned, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.usable(), 1);
    }

    #[test]
    fn test_align_uniform_image_uses_center_crop() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = CorpusLayout::new(dir.path().join("raw"), dir.path().join("processed"));
        let blank = RgbImage::from_pixel(40, 80, Rgb([128, 128, 128]));
        write_raw(&corpus, "Blank", "c_0.png", &blank);

        let report = pipeline(Arc::new(TextureDetector)).align_person(&corpus, "Blank").unwrap();
        assert_eq!(report.aligned, 1);
        let crop = image::open(corpus.processed_dir("Blank").join("c_0.png")).unwrap();
        assert_eq!((crop.width(), crop.height()), (32, 32));
    }

    #[test]
    fn test_training_set_labels_follow_sorted_people() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = CorpusLayout::new(dir.path().join("raw"), dir.path().join("processed"));
        for (name, color) in [("Zoe", [40, 200, 40]), ("Amy", [200, 40, 40])] {
            write_raw(&corpus, name, "x_0.png", &face_image(color));
            write_raw(&corpus, name, "x_1.png", &face_image(color));
        }
        let p = pipeline(Arc::new(TextureDetector));
        p.align_person(&corpus, "Zoe").unwrap();
        p.align_person(&corpus, "Amy").unwrap();

        let set = p.load_training_set(&corpus).unwrap();
        assert_eq!(set.class_names, vec!["Amy", "Zoe"]);
        assert_eq!(set.labels, vec![0, 0, 1, 1]);
        assert_eq!(set.embeddings.len(), 4);
    }

    #[test]
    fn test_training_rejects_empty_corpus_and_class() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = CorpusLayout::new(dir.path().join("raw"), dir.path().join("processed"));
        let p = pipeline(Arc::new(TextureDetector));
        assert!(matches!(p.load_training_set(&corpus), Err(TrainingError::EmptyCorpus)));

        fs::create_dir_all(corpus.processed_dir("Ghost")).unwrap();
        assert!(matches!(p.load_training_set(&corpus), Err(TrainingError::EmptyCorpus)));

        fs::write(corpus.processed_dir("Ghost").join("g_0.png"), b"truncated").unwrap();
        assert!(matches!(
            p.load_training_set(&corpus),
            Err(TrainingError::EmptyClass(name)) if name == "Ghost"
        ));
    }

    #[test]
    fn test_failed_alignment_leaves_no_processed_dir() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = CorpusLayout::new(dir.path().join("raw"), dir.path().join("processed"));
        write_raw(&corpus, "Alice", "a_0.png", &face_image([200, 40, 40]));
        fs::create_dir_all(corpus.raw_dir("Bob")).unwrap();
        fs::write(corpus.raw_dir("Bob").join("x_0.jpg"), b"garbage").unwrap();
        let p = pipeline(Arc::new(TextureDetector));
        p.align_person(&corpus, "Alice").unwrap();

        let report = p.align_person(&corpus, "Bob").unwrap();
        assert_eq!((report.attempted, report.aligned, report.failed), (1, 0, 1));
        assert!(!corpus.processed_dir("Bob").exists());
        assert_eq!(corpus.list_people().unwrap(), vec!["Alice"]);
        assert_eq!(
            p.train(&corpus, &TrainerParams::default()).unwrap().class_names,
            vec!["Alice"]
        );
    }

    #[test]
    fn test_scan_skips_degenerate_boxes() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = CorpusLayout::new(dir.path().join("raw"), dir.path().join("processed"));
        for (name, color) in [("Red", [220, 30, 30]), ("Blue", [30, 30, 220])] {
            write_raw(&corpus, name, "x_0.png", &face_image(color));
        }
        let aligner = pipeline(Arc::new(TextureDetector));
        aligner.align_person(&corpus, "Red").unwrap();
        aligner.align_person(&corpus, "Blue").unwrap();
        let artifact = aligner.train(&corpus, &TrainerParams::default()).unwrap();

        let scanner = pipeline(Arc::new(ListDetector(vec![
            Detection::new(0.0, 0.0, 64.0, 64.0, 0.9),
            Detection::new(100.0, 100.0, 120.0, 120.0, 0.9),
            Detection::new(30.0, 30.0, 30.0, 50.0, 0.9),
        ])));
        let scan = scanner.scan(&face_image([220, 30, 30]), &artifact).unwrap();
        assert_eq!(scan.detected_faces, 3);
        assert_eq!(scan.scores.len(), 1);
        assert_eq!(scan.scores[0].label, "Red");
        assert_eq!(scan.scores[0].bbox, PixelBox::new(0, 0, 64, 64).unwrap());
    }
}
