//! faceid-core: face localization, normalization, embedding and identity classification.
//!
//! Uses SCRFD for primary face detection and FaceNet for embeddings, both via
//! ONNX Runtime, with a SeetaFace cascade and a center-crop heuristic as fallbacks.
//! Identities are classified by a softmax model trained over the embeddings.

pub mod cascade;
pub mod classifier;
pub mod detector;
pub mod embedder;
pub mod locator;
pub mod normalizer;
pub mod types;

pub use cascade::{CascadeDetector, CoarseDetector};
pub use classifier::{ClassifierArtifact, ClassifierError, Prediction, TrainerParams, TrainingSet};
pub use detector::{DetectorError, FaceDetector, ScrfdDetector};
pub use embedder::{embed_faces, EmbedderError, FaceEmbedder, FacenetEmbedder};
pub use locator::{FallbackLocator, LocatedFace, LocatorStage, MarginPolicy};
pub use normalizer::{NormalizeError, Normalizer};
pub use types::{ChannelOrder, Detection, Embedding, NormalizedFace, PixelBox};
