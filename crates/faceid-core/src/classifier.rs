//! Identity classifier: multinomial logistic regression over face embeddings.
//!
//! The trained model and its ordered class names form one artifact, persisted as
//! JSON. Saving writes a fresh temporary file, reloads it for verification, and
//! only then renames it over the previous artifact.

use crate::types::Embedding;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("training corpus has no classes")]
    EmptyCorpus,
    #[error("class {0:?} has no images")]
    EmptyClass(String),
    #[error("label {label} out of range for {classes} classes")]
    LabelOutOfRange { label: usize, classes: usize },
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("corrupt classifier artifact: {0}")]
    Corrupt(String),
    #[error("artifact verification failed: {0}")]
    VerificationFailed(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Gradient-descent hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerParams {
    pub epochs: usize,
    pub learning_rate: f32,
    pub l2: f32,
}

impl Default for TrainerParams {
    fn default() -> Self {
        Self { epochs: 300, learning_rate: 0.5, l2: 1e-4 }
    }
}

/// Labelled embeddings; `labels[i]` indexes into `class_names`.
#[derive(Debug, Clone, Default)]
pub struct TrainingSet {
    pub class_names: Vec<String>,
    pub embeddings: Vec<Embedding>,
    pub labels: Vec<usize>,
}

impl TrainingSet {
    /// Check the set is trainable and return the embedding dimension.
    fn validate(&self) -> Result<usize, ClassifierError> {
        let classes = self.class_names.len();
        if classes == 0 {
            return Err(ClassifierError::EmptyCorpus);
        }
        if self.labels.len() != self.embeddings.len() {
            return Err(ClassifierError::Corrupt(format!(
                "{} labels for {} embeddings",
                self.labels.len(),
                self.embeddings.len()
            )));
        }

        let mut counts = vec![0usize; classes];
        for &label in &self.labels {
            let slot = counts
                .get_mut(label)
                .ok_or(ClassifierError::LabelOutOfRange { label, classes })?;
            *slot += 1;
        }
        if let Some(empty) = counts.iter().position(|&c| c == 0) {
            return Err(ClassifierError::EmptyClass(self.class_names[empty].clone()));
        }

        let dim = self.embeddings[0].dim();
        if dim == 0 {
            return Err(ClassifierError::DimensionMismatch { expected: 1, actual: 0 });
        }
        if let Some(bad) = self.embeddings.iter().find(|e| e.dim() != dim) {
            return Err(ClassifierError::DimensionMismatch { expected: dim, actual: bad.dim() });
        }
        Ok(dim)
    }
}

/// Arg-max class and its probability.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub class_index: usize,
    pub probability: f32,
}

/// Trained classifier plus the ordered class names it was trained on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierArtifact {
    pub class_names: Vec<String>,
    pub embedding_dim: usize,
    /// One row of `embedding_dim` weights per class.
    weights: Vec<Vec<f32>>,
    bias: Vec<f32>,
    pub sample_count: usize,
    pub trained_at: String,
}

impl ClassifierArtifact {
    /// Fit a softmax classifier with full-batch gradient descent from zero
    /// initialization. Deterministic for a given training set.
    pub fn train(set: &TrainingSet, params: &TrainerParams) -> Result<Self, ClassifierError> {
        let dim = set.validate()?;
        let n = set.embeddings.len();
        let k = set.class_names.len();

        let mut x = Array2::<f32>::zeros((n, dim));
        for (mut row, e) in x.rows_mut().into_iter().zip(&set.embeddings) {
            row.assign(&ArrayView1::from(e.values.as_slice()));
        }
        let mut y = Array2::<f32>::zeros((n, k));
        for (i, &label) in set.labels.iter().enumerate() {
            y[[i, label]] = 1.0;
        }

        let mut w = Array2::<f32>::zeros((k, dim));
        let mut b = Array1::<f32>::zeros(k);
        let scale = 1.0 / n as f32;

        for _ in 0..params.epochs {
            let mut probs = x.dot(&w.t()) + &b;
            for mut row in probs.rows_mut() {
                let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                row.mapv_inplace(|v| (v - max).exp());
                let sum = row.sum();
                row /= sum;
            }
            let grad = (probs - &y) * scale;
            let grad_w = grad.t().dot(&x) + &w * params.l2;
            let grad_b = grad.sum_axis(Axis(0));
            w.scaled_add(-params.learning_rate, &grad_w);
            b.scaled_add(-params.learning_rate, &grad_b);
        }

        tracing::info!(
            classes = k,
            samples = n,
            dim,
            epochs = params.epochs,
            "trained identity classifier"
        );

        Ok(Self {
            class_names: set.class_names.clone(),
            embedding_dim: dim,
            weights: w.rows().into_iter().map(|r| r.to_vec()).collect(),
            bias: b.to_vec(),
            sample_count: n,
            trained_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Class probabilities for one embedding, in `class_names` order.
    pub fn probabilities(&self, embedding: &Embedding) -> Result<Vec<f32>, ClassifierError> {
        if embedding.dim() != self.embedding_dim {
            return Err(ClassifierError::DimensionMismatch {
                expected: self.embedding_dim,
                actual: embedding.dim(),
            });
        }

        let mut logits: Vec<f32> = self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(row, bias)| row.iter().zip(&embedding.values).map(|(w, v)| w * v).sum::<f32>() + bias)
            .collect();
        softmax_in_place(&mut logits);
        Ok(logits)
    }

    /// Most probable class; ties go to the lower class index.
    pub fn predict(&self, embedding: &Embedding) -> Result<Prediction, ClassifierError> {
        let probs = self.probabilities(embedding)?;
        let (class_index, probability) = probs
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best });

        Ok(Prediction {
            label: self.class_names[class_index].clone(),
            class_index,
            probability,
        })
    }

    /// Load and shape-check an artifact.
    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let bytes = fs::read(path)?;
        let artifact: Self = serde_json::from_slice(&bytes)?;
        artifact.check_shape()?;
        Ok(artifact)
    }

    /// Persist atomically: write a temporary sibling, verify it loads back
    /// identically, then rename it over `path`.
    pub fn save(&self, path: &Path) -> Result<(), ClassifierError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = temp_path(path);

        let result = self.write_verified(&tmp).and_then(|()| Ok(fs::rename(&tmp, path)?));
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result?;

        tracing::debug!(path = %path.display(), classes = self.class_names.len(), "classifier artifact written");
        Ok(())
    }

    fn write_verified(&self, tmp: &Path) -> Result<(), ClassifierError> {
        let mut file = fs::File::create(tmp)?;
        file.write_all(&serde_json::to_vec_pretty(self)?)?;
        file.sync_all()?;
        drop(file);

        let reloaded = Self::load(tmp)?;
        if &reloaded != self {
            return Err(ClassifierError::VerificationFailed(format!(
                "reloaded artifact differs from trained model ({} classes)",
                reloaded.class_names.len()
            )));
        }
        Ok(())
    }

    fn check_shape(&self) -> Result<(), ClassifierError> {
        let k = self.class_names.len();
        if k == 0 {
            return Err(ClassifierError::Corrupt("no class names".into()));
        }
        if self.weights.len() != k || self.bias.len() != k {
            return Err(ClassifierError::Corrupt(format!(
                "{k} classes but {} weight rows and {} biases",
                self.weights.len(),
                self.bias.len()
            )));
        }
        if self.weights.iter().any(|row| row.len() != self.embedding_dim) {
            return Err(ClassifierError::Corrupt(format!(
                "weight rows do not match embedding dimension {}",
                self.embedding_dim
            )));
        }
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "classifier".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

fn softmax_in_place(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in values.iter_mut() {
        *v /= sum;
    }
}
