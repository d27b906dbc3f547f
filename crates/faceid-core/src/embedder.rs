//! FaceNet embedding extractor via ONNX Runtime.
//!
//! Maps whitened 160×160 RGB patches to L2-normalized embeddings using the
//! 20180402-114759 FaceNet model exported to ONNX (NHWC input).

use crate::normalizer::CANONICAL_ORDER;
use crate::types::{ChannelOrder, Embedding, NormalizedFace};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const FACENET_MODEL_VERSION: &str = "20180402-114759";

pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("channel order mismatch: embedder expects {expected:?}, face is {actual:?}")]
    ChannelOrderMismatch {
        expected: ChannelOrder,
        actual: ChannelOrder,
    },
    #[error("inconsistent patch sizes in batch: {0} vs {1}")]
    MixedSizes(usize, usize),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Forward pass from normalized faces to embeddings. Stateless across calls.
pub trait FaceEmbedder: Send + Sync {
    /// Channel order the model was trained on.
    fn expected_order(&self) -> ChannelOrder {
        CANONICAL_ORDER
    }

    /// Embed one batch; returns exactly one embedding per face, in order.
    fn embed_batch(&self, faces: &[NormalizedFace]) -> Result<Vec<Embedding>, EmbedderError>;
}

/// Embed any number of faces in batches of `batch_size`.
///
/// Every registration and recognition call goes through here, so the channel
/// order of each face is checked against the embedder before inference.
pub fn embed_faces(
    embedder: &dyn FaceEmbedder,
    faces: &[NormalizedFace],
    batch_size: usize,
) -> Result<Vec<Embedding>, EmbedderError> {
    let expected = embedder.expected_order();
    if let Some(face) = faces.iter().find(|f| f.order != expected) {
        return Err(EmbedderError::ChannelOrderMismatch {
            expected,
            actual: face.order,
        });
    }

    let mut embeddings = Vec::with_capacity(faces.len());
    for chunk in faces.chunks(batch_size.max(1)) {
        let batch = embedder.embed_batch(chunk)?;
        if batch.len() != chunk.len() {
            return Err(EmbedderError::InferenceFailed(format!(
                "embedder returned {} embeddings for {} faces",
                batch.len(),
                chunk.len()
            )));
        }
        embeddings.extend(batch);
    }
    Ok(embeddings)
}

/// FaceNet-based embedder.
pub struct FacenetEmbedder {
    session: Mutex<Session>,
}

impl FacenetEmbedder {
    /// Load the FaceNet ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, EmbedderError> {
        if !model_path.exists() {
            return Err(EmbedderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded FaceNet model"
        );

        Ok(Self { session: Mutex::new(session) })
    }
}

impl FaceEmbedder for FacenetEmbedder {
    fn embed_batch(&self, faces: &[NormalizedFace]) -> Result<Vec<Embedding>, EmbedderError> {
        if faces.is_empty() {
            return Ok(Vec::new());
        }

        let input = to_nhwc(faces)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| EmbedderError::InferenceFailed("embedder session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.is_empty() || raw.len() % faces.len() != 0 {
            return Err(EmbedderError::InferenceFailed(format!(
                "output of {} values does not split into {} embeddings",
                raw.len(),
                faces.len()
            )));
        }
        let dim = raw.len() / faces.len();

        Ok(raw
            .chunks_exact(dim)
            .map(|values| Embedding {
                values: values.to_vec(),
                model_version: Some(FACENET_MODEL_VERSION.to_string()),
            }
            .l2_normalized())
            .collect())
    }
}

/// Stack whitened patches into a `[N, size, size, 3]` tensor.
fn to_nhwc(faces: &[NormalizedFace]) -> Result<Array4<f32>, EmbedderError> {
    let size = faces[0].size;
    let mut data = Vec::with_capacity(faces.len() * size * size * 3);
    for face in faces {
        if face.size != size {
            return Err(EmbedderError::MixedSizes(size, face.size));
        }
        data.extend_from_slice(&face.data);
    }
    Array4::from_shape_vec((faces.len(), size, size, 3), data)
        .map_err(|e| EmbedderError::InferenceFailed(format!("input tensor shape: {e}")))
}
