// src/error.rs

//! Fatal startup errors. Runtime failures are handled locally (logged and
//! degraded) and never surface through this type; see the pipeline modules.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid embedding dimension: {0}")]
    InvalidEmbeddingDim(usize),

    #[error("unsupported vector backend: '{0}' (expected 'milvus' or 'local')")]
    UnsupportedBackend(String),

    #[error("missing required credential: {0}")]
    MissingCredential(&'static str),

    #[error("invalid memory marker pair: {0}")]
    InvalidMarker(String),

    #[error("counter store initialization failed: {0}")]
    CounterStore(String),

    #[error("collection bootstrap failed: {0}")]
    CollectionBootstrap(String),
}
