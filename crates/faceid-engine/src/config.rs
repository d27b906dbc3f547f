use faceid_core::detector::{DEFAULT_MIN_FACE_SIZE, DEFAULT_SCORE_THRESHOLD};
use faceid_core::embedder::DEFAULT_BATCH_SIZE;
use faceid_core::locator::DEFAULT_MARGIN;
use faceid_core::normalizer::DEFAULT_IMAGE_SIZE;
use faceid_core::TrainerParams;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Canonical recognition threshold: a face matches when its classifier
/// probability is at least this value.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.70;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Toml {
        path: String,
        source: toml::de::Error,
    },
}

/// Engine configuration.
///
/// Loaded from an optional TOML file, then overridden by `FACEID_*`
/// environment variables. Unset paths derive from `data_dir`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for the corpus, database and models unless overridden below.
    pub data_dir: PathBuf,
    /// Raw uploads, one directory per person.
    pub raw_dir: Option<PathBuf>,
    /// Normalized face crops, one directory per person.
    pub processed_dir: Option<PathBuf>,
    /// Directory containing ONNX model files.
    pub model_dir: Option<PathBuf>,
    /// Path to the SQLite database file.
    pub db_path: Option<PathBuf>,
    /// Path to the classifier artifact.
    pub classifier_path: Option<PathBuf>,
    /// Model file names, relative to `model_dir` unless absolute.
    pub detector_model: String,
    pub embedder_model: String,
    pub cascade_model: String,
    /// Minimum classifier probability for a match.
    pub confidence_threshold: f32,
    pub detector_score_threshold: f32,
    /// Smallest face side, in pixels, kept from the primary detector.
    pub min_face_size: u32,
    /// Total margin around primary detections, in pixels.
    pub margin: u32,
    /// Side of the normalized face patch.
    pub image_size: u32,
    pub embed_batch_size: usize,
    pub training: TrainerParams,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("faceid");

        Self {
            data_dir,
            raw_dir: None,
            processed_dir: None,
            model_dir: None,
            db_path: None,
            classifier_path: None,
            detector_model: "det_10g.onnx".to_string(),
            embedder_model: "facenet_20180402.onnx".to_string(),
            cascade_model: "seeta_fd_frontal_v1.0.bin".to_string(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            detector_score_threshold: DEFAULT_SCORE_THRESHOLD,
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            margin: DEFAULT_MARGIN,
            image_size: DEFAULT_IMAGE_SIZE,
            embed_batch_size: DEFAULT_BATCH_SIZE,
            training: TrainerParams::default(),
        }
    }
}

impl Config {
    /// Defaults overridden by `FACEID_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Load a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Toml {
            path: path.display().to_string(),
            source,
        })?;
        Ok(config.with_env_overrides())
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("FACEID_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        env_path("FACEID_RAW_DIR", &mut self.raw_dir);
        env_path("FACEID_PROCESSED_DIR", &mut self.processed_dir);
        env_path("FACEID_MODEL_DIR", &mut self.model_dir);
        env_path("FACEID_DB_PATH", &mut self.db_path);
        env_path("FACEID_CLASSIFIER_PATH", &mut self.classifier_path);

        self.detector_model = env_or("FACEID_DETECTOR_MODEL", self.detector_model);
        self.embedder_model = env_or("FACEID_EMBEDDER_MODEL", self.embedder_model);
        self.cascade_model = env_or("FACEID_CASCADE_MODEL", self.cascade_model);
        self.confidence_threshold = env_or("FACEID_CONFIDENCE_THRESHOLD", self.confidence_threshold);
        self.detector_score_threshold =
            env_or("FACEID_DETECTOR_SCORE_THRESHOLD", self.detector_score_threshold);
        self.min_face_size = env_or("FACEID_MIN_FACE_SIZE", self.min_face_size);
        self.margin = env_or("FACEID_MARGIN", self.margin);
        self.image_size = env_or("FACEID_IMAGE_SIZE", self.image_size);
        self.embed_batch_size = env_or("FACEID_EMBED_BATCH_SIZE", self.embed_batch_size);
        self.training.epochs = env_or("FACEID_TRAIN_EPOCHS", self.training.epochs);
        self.training.learning_rate = env_or("FACEID_TRAIN_LEARNING_RATE", self.training.learning_rate);
        self.training.l2 = env_or("FACEID_TRAIN_L2", self.training.l2);
        self
    }

    /// Configuration rooted at `data_dir` with every other setting at its default.
    pub fn rooted_at(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.raw_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("Dataset").join("raw"))
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.processed_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("Dataset").join("processed"))
    }

    pub fn model_dir(&self) -> PathBuf {
        self.model_dir.clone().unwrap_or_else(|| self.data_dir.join("models"))
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| self.data_dir.join("faces.db"))
    }

    pub fn classifier_path(&self) -> PathBuf {
        self.classifier_path
            .clone()
            .unwrap_or_else(|| self.model_dir().join("facemodel.json"))
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir().join(&self.detector_model)
    }

    /// Path to the FaceNet embedding model.
    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir().join(&self.embedder_model)
    }

    /// Path to the SeetaFace cascade model.
    pub fn cascade_model_path(&self) -> PathBuf {
        self.model_dir().join(&self.cascade_model)
    }
}

fn env_path(key: &str, slot: &mut Option<PathBuf>) {
    if let Ok(v) = std::env::var(key) {
        *slot = Some(PathBuf::from(v));
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
