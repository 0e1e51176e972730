// src/memory/traits.rs

//! Seams to the external collaborators: vector store backends, the
//! embedding provider, the summarization LLM, and the host's persona
//! resolution. Everything behind these traits is replaceable (and mocked
//! in tests).

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::memory::storage::schema::CollectionSchema;
use crate::memory::types::{ChatCompletion, DeleteOutcome, InsertOutcome, MemoryRecord};

/// Opaque handle to the host request that originated a session. The core
/// never looks inside it; it only hands it back to the [`HostResolver`].
pub type EventHandle = Arc<dyn Any + Send + Sync>;

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn connect(&self) -> Result<()>;
    fn is_connected(&self) -> bool;
    async fn disconnect(&self) -> Result<()>;

    async fn has_collection(&self, name: &str) -> Result<bool>;
    async fn create_collection(&self, name: &str, schema: &CollectionSchema) -> Result<()>;
    async fn create_index(
        &self,
        name: &str,
        field: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<()>;
    async fn load_collection(&self, name: &str) -> Result<()>;
    async fn list_collections(&self) -> Result<Vec<String>>;

    async fn insert(&self, name: &str, records: Vec<MemoryRecord>) -> Result<InsertOutcome>;

    /// Scalar-filtered query (no vector). Returns raw field maps.
    async fn query(
        &self,
        name: &str,
        filter: &str,
        output_fields: &[&str],
        limit: usize,
    ) -> Result<Vec<Value>>;

    /// Vector similarity search; one inner vec of raw hits per query vector.
    #[allow(clippy::too_many_arguments)]
    async fn search(
        &self,
        name: &str,
        vectors: Vec<Vec<f32>>,
        vector_field: &str,
        search_params: &Value,
        limit: usize,
        filter: &str,
        output_fields: &[&str],
    ) -> Result<Vec<Vec<Value>>>;

    async fn delete(&self, name: &str, filter: &str) -> Result<DeleteOutcome>;
    async fn flush(&self, names: &[&str]) -> Result<()>;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// One vector per input text, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dim(&self) -> usize;

    /// Optional capability; providers without a cheap probe keep the
    /// default no-op.
    async fn test_connection(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// `extra` carries configured model parameters, passed through verbatim.
    async fn chat(&self, prompt: &str, system: &str, extra: &Value) -> Result<ChatCompletion>;
}

/// Host-side session and persona resolution. The handle is whatever request
/// context the host stored when the session was created.
pub trait HostResolver: Send + Sync {
    /// Conversation id for the originating request.
    fn current_session_id(&self, origin: &EventHandle) -> Option<String>;

    /// Persona bound to the originating request, if any.
    fn persona_id(&self, origin: &EventHandle) -> Option<String>;

    /// The host's globally configured default persona, if any.
    fn default_persona(&self) -> Option<String>;
}
