use crate::config::Config;
use crate::pipeline::AlignmentReport;
use crate::service::{
    Deletion, FaceService, RecognitionReport, Registration, ServiceError, Status,
};
use crate::store::Identity;
use faceid_core::{
    CascadeDetector, CoarseDetector, DetectorError, EmbedderError, FaceDetector, FaceEmbedder,
    FacenetEmbedder, ScrfdDetector,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("blocking task failed: {0}")]
    Join(String),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Mutating requests, executed one at a time on the engine thread.
enum EngineRequest {
    Register {
        name: String,
        images: Vec<Vec<u8>>,
        reply: oneshot::Sender<Result<Registration, ServiceError>>,
    },
    Retrain {
        reply: oneshot::Sender<Result<Vec<String>, ServiceError>>,
    },
    Delete {
        person_id: String,
        reply: oneshot::Sender<Result<Deletion, ServiceError>>,
    },
    Align {
        name: String,
        reply: oneshot::Sender<Result<AlignmentReport, ServiceError>>,
    },
}

/// Clone-safe handle to the engine.
///
/// Mutations are queued to the engine thread; reads run on the blocking pool
/// against the current classifier snapshot.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    service: Arc<FaceService>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, ServiceError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    async fn read<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&FaceService) -> Result<T, ServiceError> + Send + 'static,
    {
        let service = self.service.clone();
        let result = tokio::task::spawn_blocking(move || f(&service))
            .await
            .map_err(|e| EngineError::Join(e.to_string()))?;
        Ok(result?)
    }

    /// Register a person from raw image bytes and rebuild the classifier.
    pub async fn register(&self, name: String, images: Vec<Vec<u8>>) -> Result<Registration, EngineError> {
        self.request(|reply| EngineRequest::Register { name, images, reply })
            .await
    }

    pub async fn retrain(&self) -> Result<Vec<String>, EngineError> {
        self.request(|reply| EngineRequest::Retrain { reply }).await
    }

    pub async fn delete_identity(&self, person_id: String) -> Result<Deletion, EngineError> {
        self.request(|reply| EngineRequest::Delete { person_id, reply })
            .await
    }

    pub async fn align_person(&self, name: String) -> Result<AlignmentReport, EngineError> {
        self.request(|reply| EngineRequest::Align { name, reply }).await
    }

    /// Classify every face in an image against the current classifier.
    pub async fn recognize(&self, bytes: Vec<u8>) -> Result<RecognitionReport, EngineError> {
        self.read(move |service| service.recognize(&bytes)).await
    }

    pub async fn list_identities(&self) -> Result<Vec<Identity>, EngineError> {
        self.read(|service| service.list_identities()).await
    }

    pub async fn status(&self) -> Result<Status, EngineError> {
        self.read(|service| service.status()).await
    }
}

/// Load models, open the service and spawn the engine thread.
///
/// Fails fast if the detector or embedder model cannot be loaded. A missing
/// cascade model only disables the cascade fallback.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let detector_path = config.detector_model_path();
    let detector = ScrfdDetector::load(
        &detector_path,
        config.detector_score_threshold,
        config.min_face_size,
    )?;
    tracing::info!(path = %detector_path.display(), "SCRFD detector loaded");

    let embedder_path = config.embedder_model_path();
    let embedder = FacenetEmbedder::load(&embedder_path)?;
    tracing::info!(path = %embedder_path.display(), "FaceNet embedder loaded");

    let cascade_path = config.cascade_model_path();
    let coarse: Option<Arc<dyn CoarseDetector>> = match CascadeDetector::load(&cascade_path) {
        Ok(cascade) => {
            tracing::info!(path = %cascade_path.display(), "cascade detector loaded");
            Some(Arc::new(cascade))
        }
        Err(e) => {
            tracing::warn!(
                path = %cascade_path.display(),
                error = %e,
                "cascade detector unavailable; fallback goes straight to center crop"
            );
            None
        }
    };

    let detector: Arc<dyn FaceDetector> = Arc::new(detector);
    let embedder: Arc<dyn FaceEmbedder> = Arc::new(embedder);
    let service = FaceService::open(config, detector, coarse, embedder)?;
    spawn_with_service(Arc::new(service))
}

/// Spawn the engine thread over an already-built service.
pub fn spawn_with_service(service: Arc<FaceService>) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);
    let worker = service.clone();

    std::thread::Builder::new()
        .name("faceid-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Register { name, images, reply } => {
                        let _ = reply.send(worker.register(&name, images));
                    }
                    EngineRequest::Retrain { reply } => {
                        let _ = reply.send(worker.retrain());
                    }
                    EngineRequest::Delete { person_id, reply } => {
                        let _ = reply.send(worker.delete_identity(&person_id));
                    }
                    EngineRequest::Align { name, reply } => {
                        let _ = reply.send(worker.align_person(&name));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, service })
}

