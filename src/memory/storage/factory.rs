// src/memory/storage/factory.rs

//! Backend selection at startup. Unknown names are a fatal configuration
//! error, not a runtime fallback.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::config::MemoryConfig;
use crate::error::StartupError;
use crate::memory::storage::local::LocalVectorStore;
use crate::memory::storage::milvus::MilvusHttpStore;
use crate::memory::traits::VectorStore;

pub fn create_vector_store(config: &MemoryConfig) -> Result<Arc<dyn VectorStore>, StartupError> {
    match config.vector_backend.as_str() {
        "milvus" => {
            info!("Using Milvus vector backend at {}", config.milvus_url);
            Ok(Arc::new(MilvusHttpStore::new(config.milvus_url.clone())))
        }
        "local" => {
            info!("Using local vector backend under {}", config.local_data_dir);
            Ok(Arc::new(LocalVectorStore::new(Some(PathBuf::from(
                &config.local_data_dir,
            )))))
        }
        other => Err(StartupError::UnsupportedBackend(other.to_string())),
    }
}
