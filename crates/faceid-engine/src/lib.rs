pub mod config;
pub mod controller;
pub mod corpus;
pub mod engine;
pub mod pipeline;
pub mod service;
pub mod store;

pub use config::{Config, ConfigError};
pub use controller::{ClassifierState, RetrainController, SyncOutcome};
pub use corpus::{CorpusError, CorpusLayout};
pub use engine::{spawn_engine, spawn_with_service, EngineError, EngineHandle};
pub use pipeline::{AlignError, AlignmentReport, FaceScore, Pipeline, TrainingError};
pub use service::{
    Deletion, FaceService, RecognitionMatch, RecognitionReport, Registration, ServiceError, Status,
};
pub use store::{Identity, IdentityStore, SqliteIdentityStore, StoreError};
