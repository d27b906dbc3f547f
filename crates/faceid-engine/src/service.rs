//! `FaceService`: the owned service object behind every operation.
//!
//! Mutations (register, retrain, delete, align) are serialized by a writer
//! mutex. Recognition takes no lock beyond the artifact snapshot.

use crate::config::Config;
use crate::controller::{ClassifierState, RetrainController, SyncOutcome};
use crate::corpus::{validate_name, CorpusError, CorpusLayout};
use crate::pipeline::{AlignmentReport, FaceScore, Pipeline, TrainingError};
use crate::store::{Identity, IdentityStore, SqliteIdentityStore, StoreError};
use chrono::{DateTime, Utc};
use faceid_core::{
    ClassifierError, CoarseDetector, DetectorError, FaceDetector, FaceEmbedder, Normalizer,
    PixelBox,
};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("no image data uploaded")]
    EmptyUpload,
    #[error("no classifier available; register at least one person")]
    NoClassifier,
    #[error("classifier: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("training: {0}")]
    Training(#[from] TrainingError),
    #[error("no image of {name:?} could be aligned ({attempted} attempted)")]
    AlignmentFailed { name: String, attempted: usize },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("corpus: {0}")]
    Corpus(CorpusError),
}

impl From<CorpusError> for ServiceError {
    fn from(e: CorpusError) -> Self {
        match e {
            CorpusError::InvalidName(name) => ServiceError::InvalidInput(format!("invalid name {name:?}")),
            other => ServiceError::Corpus(other),
        }
    }
}

/// A face whose classifier confidence reached the threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionMatch {
    pub person_id: String,
    pub name: String,
    pub confidence: f32,
    pub bbox: PixelBox,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionReport {
    /// Boxes returned by the detector, including ones later skipped.
    pub detected_faces: usize,
    /// Faces that made it through normalization, embedding and classification.
    pub classified_faces: usize,
    pub matches: Vec<RecognitionMatch>,
    /// Highest-confidence classified face, matched or not.
    pub best_candidate: Option<FaceScore>,
    pub threshold: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub identity: Identity,
    pub alignment: AlignmentReport,
    pub class_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Deletion {
    pub identity: Identity,
    pub files_removed: usize,
    /// The person's last registration was removed along with their images.
    pub person_removed: bool,
    pub classifier: Option<SyncOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub classifier: ClassifierState,
    pub class_names: Vec<String>,
    pub identities: usize,
    pub threshold: f32,
    pub trained_at: Option<String>,
}

pub struct FaceService {
    pipeline: Pipeline,
    corpus: CorpusLayout,
    store: Arc<dyn IdentityStore>,
    controller: RetrainController,
    threshold: f32,
    writer: Mutex<()>,
}

impl FaceService {
    pub fn new(
        pipeline: Pipeline,
        corpus: CorpusLayout,
        store: Arc<dyn IdentityStore>,
        controller: RetrainController,
        threshold: f32,
    ) -> Self {
        Self {
            pipeline,
            corpus,
            store,
            controller,
            threshold,
            writer: Mutex::new(()),
        }
    }

    /// Build the service from configuration and loaded models, then reconcile
    /// the classifier artifact with the processed corpus.
    pub fn open(
        config: &Config,
        detector: Arc<dyn FaceDetector>,
        coarse: Option<Arc<dyn CoarseDetector>>,
        embedder: Arc<dyn FaceEmbedder>,
    ) -> Result<Self, ServiceError> {
        let corpus = CorpusLayout::new(config.raw_dir(), config.processed_dir());
        corpus.ensure_roots()?;
        let store = SqliteIdentityStore::open(&config.db_path())?;

        let pipeline = Pipeline::new(
            detector,
            coarse,
            embedder,
            Normalizer::new(config.image_size),
            config.margin,
            config.embed_batch_size,
        );
        let controller = RetrainController::new(config.classifier_path(), config.training);

        let service = Self::new(
            pipeline,
            corpus,
            Arc::new(store),
            controller,
            config.confidence_threshold,
        );
        match service.reconcile() {
            Ok(outcome) => tracing::info!(?outcome, "classifier reconciled with corpus"),
            Err(e) => tracing::warn!(error = %e, "classifier reconciliation failed"),
        }
        Ok(service)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Match the artifact on disk against the processed corpus.
    pub fn reconcile(&self) -> Result<SyncOutcome, ServiceError> {
        let _guard = self.lock_writer();
        Ok(self.controller.reconcile_on_startup(&self.pipeline, &self.corpus)?)
    }

    /// Store and align a person's photos, then rebuild the classifier.
    ///
    /// Succeeds iff at least one image aligned and training succeeded. On
    /// failure the registration row and its files are rolled back.
    pub fn register(&self, name: &str, images: Vec<Vec<u8>>) -> Result<Registration, ServiceError> {
        let name = validate_name(name)?.to_string();
        let images: Vec<Vec<u8>> = images.into_iter().filter(|b| !b.is_empty()).collect();
        if images.is_empty() {
            return Err(ServiceError::EmptyUpload);
        }

        let _guard = self.lock_writer();
        let identity = self.store.create_identity(&name)?;
        tracing::info!(person = %name, person_id = %identity.person_id, images = images.len(), "registering");

        match self.register_inner(&identity, &images) {
            Ok((alignment, class_names)) => Ok(Registration {
                identity,
                alignment,
                class_names,
            }),
            Err(e) => {
                tracing::warn!(person = %name, error = %e, "registration failed; rolling back");
                self.rollback(&identity);
                Err(e)
            }
        }
    }

    fn register_inner(
        &self,
        identity: &Identity,
        images: &[Vec<u8>],
    ) -> Result<(AlignmentReport, Vec<String>), ServiceError> {
        let name = &identity.display_name;
        let mut raw_paths = Vec::with_capacity(images.len());
        for (index, bytes) in images.iter().enumerate() {
            raw_paths.push(self.corpus.save_raw(name, &identity.person_id, index, bytes)?);
        }

        let alignment = self.pipeline.align_images(&self.corpus, name, &raw_paths)?;
        if alignment.aligned == 0 {
            return Err(ServiceError::AlignmentFailed {
                name: name.clone(),
                attempted: alignment.attempted,
            });
        }

        let artifact = self.controller.rebuild(&self.pipeline, &self.corpus)?;
        Ok((alignment, artifact.class_names.clone()))
    }

    fn rollback(&self, identity: &Identity) {
        let name = &identity.display_name;
        if let Err(e) = self.corpus.remove_registration_files(name, &identity.person_id) {
            tracing::warn!(person = %name, error = %e, "rollback: removing files failed");
        }
        if let Err(e) = self.store.delete_identity(&identity.person_id) {
            tracing::warn!(person = %name, error = %e, "rollback: removing row failed");
        }
        let cleanup = match self.store.count_by_name(name) {
            Ok(0) => self.corpus.remove_person(name),
            Ok(_) => self.corpus.prune_empty_processed(name).map(|_| ()),
            Err(e) => {
                tracing::warn!(person = %name, error = %e, "rollback: counting rows failed");
                Ok(())
            }
        };
        if let Err(e) = cleanup {
            tracing::warn!(person = %name, error = %e, "rollback: directory cleanup failed");
        }
    }

    /// Classify every face in an image.
    ///
    /// An image with no faces yields an empty report, not an error.
    pub fn recognize(&self, bytes: &[u8]) -> Result<RecognitionReport, ServiceError> {
        if bytes.is_empty() {
            return Err(ServiceError::EmptyUpload);
        }
        let artifact = self.controller.current().ok_or(ServiceError::NoClassifier)?;
        let image = image::load_from_memory(bytes)
            .map_err(|e| ServiceError::InvalidImage(e.to_string()))?
            .to_rgb8();

        let scan = self.pipeline.scan(&image, &artifact)?;

        let mut matches = Vec::new();
        for score in &scan.scores {
            if score.confidence < self.threshold {
                tracing::debug!(label = %score.label, confidence = score.confidence, "below threshold");
                continue;
            }
            match self.store.find_by_name(&score.label)? {
                Some(identity) => matches.push(RecognitionMatch {
                    person_id: identity.person_id,
                    name: score.label.clone(),
                    confidence: score.confidence,
                    bbox: score.bbox,
                    registered_at: identity.registered_at,
                }),
                None => {
                    tracing::warn!(label = %score.label, "classifier label has no identity row; dropped");
                }
            }
        }

        let best_candidate = scan
            .scores
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .cloned();

        tracing::info!(
            detected = scan.detected_faces,
            classified = scan.scores.len(),
            matched = matches.len(),
            "recognition finished"
        );
        Ok(RecognitionReport {
            detected_faces: scan.detected_faces,
            classified_faces: scan.scores.len(),
            matches,
            best_candidate,
            threshold: self.threshold,
        })
    }

    /// Rebuild the classifier over the whole processed corpus.
    pub fn retrain(&self) -> Result<Vec<String>, ServiceError> {
        let _guard = self.lock_writer();
        let artifact = self.controller.rebuild(&self.pipeline, &self.corpus)?;
        Ok(artifact.class_names.clone())
    }

    /// Remove one registration. When it was the person's last, their corpus
    /// directories go too and the classifier is rebuilt or deleted.
    pub fn delete_identity(&self, person_id: &str) -> Result<Deletion, ServiceError> {
        let _guard = self.lock_writer();
        let identity = self
            .store
            .delete_identity(person_id)?
            .ok_or_else(|| ServiceError::NotFound(format!("identity {person_id}")))?;
        let name = &identity.display_name;

        let files_removed = self.corpus.remove_registration_files(name, person_id)?;
        let remaining = self.store.count_by_name(name)?;
        let person_removed = remaining == 0;
        let people_changed = if person_removed {
            self.corpus.remove_person(name)?;
            true
        } else {
            self.corpus.prune_empty_processed(name)?
        };

        tracing::info!(
            person = %name,
            person_id,
            files_removed,
            remaining,
            "identity deleted"
        );

        // The deletion has committed; a failed sync is reported, not returned.
        let classifier = people_changed.then(|| {
            self.controller
                .sync(&self.pipeline, &self.corpus)
                .unwrap_or_else(|e| {
                    tracing::error!(person = %name, error = %e, "classifier sync after delete failed");
                    SyncOutcome::Failed { error: e.to_string() }
                })
        });

        Ok(Deletion {
            identity,
            files_removed,
            person_removed,
            classifier,
        })
    }

    /// Re-run alignment over every raw image of a person. New crops trigger a
    /// rebuild.
    pub fn align_person(&self, name: &str) -> Result<AlignmentReport, ServiceError> {
        let name = validate_name(name)?;
        let _guard = self.lock_writer();
        if self.corpus.raw_images(name)?.is_empty() {
            return Err(ServiceError::NotFound(format!("raw images for {name:?}")));
        }

        let report = self.pipeline.align_person(&self.corpus, name)?;
        if report.usable() == 0 {
            self.corpus.prune_empty_processed(name)?;
        }
        if report.aligned > 0 {
            self.controller.rebuild(&self.pipeline, &self.corpus)?;
        }
        Ok(report)
    }

    pub fn list_identities(&self) -> Result<Vec<Identity>, ServiceError> {
        Ok(self.store.list_identities()?)
    }

    pub fn status(&self) -> Result<Status, ServiceError> {
        let artifact = self.controller.current();
        Ok(Status {
            classifier: self.controller.state(&self.corpus)?,
            class_names: artifact.as_ref().map(|a| a.class_names.clone()).unwrap_or_default(),
            identities: self.store.list_identities()?.len(),
            threshold: self.threshold,
            trained_at: artifact.map(|a| a.trained_at.clone()),
        })
    }

    pub fn corpus(&self) -> &CorpusLayout {
        &self.corpus
    }

    pub fn controller(&self) -> &RetrainController {
        &self.controller
    }
}
