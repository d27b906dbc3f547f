//! Retraining controller: keeps the classifier artifact in step with the
//! processed corpus.
//!
//! The live artifact sits behind an `RwLock<Option<Arc<_>>>`. Readers clone the
//! `Arc` and classify against that snapshot. A rebuild trains from the whole
//! corpus, saves and verifies the file, and only then swaps the reference, so
//! a failed rebuild leaves both the file and the served artifact unchanged.

use crate::corpus::{CorpusError, CorpusLayout};
use crate::pipeline::{Pipeline, TrainingError};
use faceid_core::{ClassifierArtifact, ClassifierError, TrainerParams};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierState {
    /// No artifact loaded.
    Untrained,
    /// Artifact class names match the processed corpus.
    Ready,
    /// Artifact was trained on a different set of people.
    Stale,
}

/// What a sync did to the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum SyncOutcome {
    Rebuilt { class_names: Vec<String> },
    Cleared,
    Unchanged,
    /// The rebuild or removal failed; the previous artifact is still served.
    Failed { error: String },
}

pub struct RetrainController {
    artifact_path: PathBuf,
    params: TrainerParams,
    slot: RwLock<Option<Arc<ClassifierArtifact>>>,
}

impl RetrainController {
    pub fn new(artifact_path: impl Into<PathBuf>, params: TrainerParams) -> Self {
        Self {
            artifact_path: artifact_path.into(),
            params,
            slot: RwLock::new(None),
        }
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    /// Snapshot of the artifact currently served to recognition.
    pub fn current(&self) -> Option<Arc<ClassifierArtifact>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn install(&self, artifact: Option<Arc<ClassifierArtifact>>) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = artifact;
    }

    pub fn state(&self, corpus: &CorpusLayout) -> Result<ClassifierState, CorpusError> {
        let Some(artifact) = self.current() else {
            return Ok(ClassifierState::Untrained);
        };
        if artifact.class_names == corpus.list_people()? {
            Ok(ClassifierState::Ready)
        } else {
            Ok(ClassifierState::Stale)
        }
    }

    /// Train over the entire corpus, persist with verification, then swap.
    pub fn rebuild(
        &self,
        pipeline: &Pipeline,
        corpus: &CorpusLayout,
    ) -> Result<Arc<ClassifierArtifact>, TrainingError> {
        let artifact = pipeline.train(corpus, &self.params)?;
        if let Some(dir) = self.artifact_path.parent() {
            std::fs::create_dir_all(dir).map_err(ClassifierError::from)?;
        }
        artifact.save(&self.artifact_path)?;

        let artifact = Arc::new(artifact);
        self.install(Some(artifact.clone()));
        tracing::info!(
            path = %self.artifact_path.display(),
            classes = ?artifact.class_names,
            "classifier artifact swapped in"
        );
        Ok(artifact)
    }

    /// Delete the artifact file and stop serving it.
    pub fn clear(&self) -> Result<(), ClassifierError> {
        match std::fs::remove_file(&self.artifact_path) {
            Ok(()) => {
                tracing::info!(path = %self.artifact_path.display(), "classifier artifact removed");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.install(None);
        Ok(())
    }

    /// Bring the artifact in line after the set of people changed: rebuild
    /// over the whole corpus, or delete it when the corpus is empty.
    pub fn sync(&self, pipeline: &Pipeline, corpus: &CorpusLayout) -> Result<SyncOutcome, TrainingError> {
        if corpus.list_people()?.is_empty() {
            self.clear()?;
            return Ok(SyncOutcome::Cleared);
        }
        let artifact = self.rebuild(pipeline, corpus)?;
        Ok(SyncOutcome::Rebuilt {
            class_names: artifact.class_names.clone(),
        })
    }

    /// Load the artifact from disk and reconcile it with the corpus.
    ///
    /// A stale, corrupt or missing artifact is rebuilt when the corpus has
    /// people; an artifact with no people left is deleted. If the rebuild
    /// fails, a stale artifact stays loaded.
    pub fn reconcile_on_startup(
        &self,
        pipeline: &Pipeline,
        corpus: &CorpusLayout,
    ) -> Result<SyncOutcome, TrainingError> {
        let on_disk = if self.artifact_path.exists() {
            match ClassifierArtifact::load(&self.artifact_path) {
                Ok(artifact) => Some(artifact),
                Err(e) => {
                    tracing::warn!(
                        path = %self.artifact_path.display(),
                        error = %e,
                        "classifier artifact unreadable; will rebuild"
                    );
                    None
                }
            }
        } else {
            None
        };

        let people = corpus.list_people()?;
        match on_disk {
            Some(artifact) if artifact.class_names == people => {
                tracing::info!(classes = ?people, "classifier artifact loaded");
                self.install(Some(Arc::new(artifact)));
                Ok(SyncOutcome::Unchanged)
            }
            Some(artifact) => {
                tracing::warn!(
                    artifact = ?artifact.class_names,
                    corpus = ?people,
                    "classifier artifact is stale"
                );
                // Serve the stale artifact until a rebuild succeeds.
                self.install(Some(Arc::new(artifact)));
                self.sync(pipeline, corpus)
            }
            None if people.is_empty() => {
                self.clear()?;
                Ok(SyncOutcome::Unchanged)
            }
            None => {
                tracing::info!(classes = ?people, "no classifier artifact; training");
                self.sync(pipeline, corpus)
            }
        }
    }
}
