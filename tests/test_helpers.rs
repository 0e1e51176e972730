// tests/test_helpers.rs

//! Shared mocks and builders for the integration tests. The vector store
//! is the real local backend (optionally wrapped in a call recorder); the
//! embedding and chat providers are deterministic stand-ins.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use engram::config::MemoryConfig;
use engram::memory::storage::local::LocalVectorStore;
use engram::memory::storage::schema::CollectionSchema;
use engram::memory::traits::{
    ChatProvider, EmbeddingProvider, EventHandle, HostResolver, VectorStore,
};
use engram::memory::types::{ChatCompletion, DeleteOutcome, InsertOutcome, MemoryRecord};
use engram::memory::MemoryService;

pub const TEST_DIM: usize = 4;

pub fn test_config() -> MemoryConfig {
    MemoryConfig {
        vector_backend: "local".to_string(),
        milvus_url: String::new(),
        local_data_dir: String::new(),
        collection_name: "test_memory".to_string(),
        embedding_dim: TEST_DIM,
        index_params: serde_json::json!({"metric_type": "L2", "index_type": "AUTOINDEX", "params": {}}),
        search_params: serde_json::json!({"metric_type": "L2", "params": {}}),
        create_index_timeout: 10,
        flush_after_insert: false,
        embedding_service: "mock".to_string(),
        embedding_model: String::new(),
        embedding_key: String::new(),
        embedding_url: String::new(),
        llm_url: String::new(),
        llm_key: String::new(),
        llm_model: String::new(),
        summary_system_prompt: "Summarize into a long-term memory entry:".to_string(),
        summary_llm_params: serde_json::json!({}),
        num_pairs_threshold: 10,
        summary_check_interval: 300,
        summary_time_threshold: 1800,
        top_k: 5,
        search_timeout: 10,
        use_personality_filtering: false,
        default_persona: "default_persona".to_string(),
        injection_method: "user_prompt".to_string(),
        memory_prefix: "<long_term_memory>".to_string(),
        memory_suffix: "</long_term_memory>".to_string(),
        memory_entry_format: "- [{time}] {content}".to_string(),
        kept_memory_blocks: 0,
    }
}

pub async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("create in-memory sqlite")
}

pub struct MockResolver {
    pub session_id: String,
    pub persona: Option<String>,
    pub default_persona: Option<String>,
}

impl HostResolver for MockResolver {
    fn current_session_id(&self, _origin: &EventHandle) -> Option<String> {
        Some(self.session_id.clone())
    }

    fn persona_id(&self, _origin: &EventHandle) -> Option<String> {
        self.persona.clone()
    }

    fn default_persona(&self) -> Option<String> {
        self.default_persona.clone()
    }
}

/// Deterministic embeddings: a fixed-direction unit vector, so every text
/// is "similar" to every other. `empty` and `fail` simulate the two
/// degraded provider behaviors.
pub struct MockEmbeddings {
    pub empty: bool,
    pub fail: bool,
}

impl MockEmbeddings {
    pub fn working() -> Self {
        Self {
            empty: false,
            fail: false,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.fail {
            return Err(anyhow!("embedding backend unavailable"));
        }
        if self.empty {
            return Ok(texts.iter().map(|_| Vec::new()).collect());
        }
        Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
    }

    fn dim(&self) -> usize {
        TEST_DIM
    }
}

/// Canned chat completions with an optional artificial delay, plus call
/// and prompt recording for trigger assertions.
pub struct MockChat {
    pub reply: String,
    pub delay: Duration,
    pub calls: AtomicUsize,
    pub last_prompt: std::sync::Mutex<String>,
}

impl MockChat {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            last_prompt: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn slow(reply: &str, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::replying(reply)
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for MockChat {
    async fn chat(&self, prompt: &str, _system: &str, _extra: &Value) -> Result<ChatCompletion> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = prompt.to_string();
        Ok(ChatCompletion {
            text: self.reply.clone(),
            role: "assistant".to_string(),
        })
    }
}

/// Wraps the local backend and counts calls, for asserting which
/// operations a pipeline actually reached.
pub struct RecordingStore {
    inner: LocalVectorStore,
    pub search_calls: AtomicUsize,
    pub insert_calls: AtomicUsize,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self {
            inner: LocalVectorStore::new(None),
            search_calls: AtomicUsize::new(0),
            insert_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl VectorStore for RecordingStore {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }

    async fn has_collection(&self, name: &str) -> Result<bool> {
        self.inner.has_collection(name).await
    }

    async fn create_collection(&self, name: &str, schema: &CollectionSchema) -> Result<()> {
        self.inner.create_collection(name, schema).await
    }

    async fn create_index(
        &self,
        name: &str,
        field: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<()> {
        self.inner.create_index(name, field, params, timeout).await
    }

    async fn load_collection(&self, name: &str) -> Result<()> {
        self.inner.load_collection(name).await
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        self.inner.list_collections().await
    }

    async fn insert(&self, name: &str, records: Vec<MemoryRecord>) -> Result<InsertOutcome> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.insert(name, records).await
    }

    async fn query(
        &self,
        name: &str,
        filter: &str,
        output_fields: &[&str],
        limit: usize,
    ) -> Result<Vec<Value>> {
        self.inner.query(name, filter, output_fields, limit).await
    }

    async fn search(
        &self,
        name: &str,
        vectors: Vec<Vec<f32>>,
        vector_field: &str,
        search_params: &Value,
        limit: usize,
        filter: &str,
        output_fields: &[&str],
    ) -> Result<Vec<Vec<Value>>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .search(
                name,
                vectors,
                vector_field,
                search_params,
                limit,
                filter,
                output_fields,
            )
            .await
    }

    async fn delete(&self, name: &str, filter: &str) -> Result<DeleteOutcome> {
        self.inner.delete(name, filter).await
    }

    async fn flush(&self, names: &[&str]) -> Result<()> {
        self.inner.flush(names).await
    }
}

/// The pieces a test usually wants to poke at afterwards.
pub struct TestHarness {
    pub service: Arc<MemoryService>,
    pub store: Arc<RecordingStore>,
    pub chat: Arc<MockChat>,
    pub origin: EventHandle,
}

pub async fn build_harness(config: MemoryConfig, chat: MockChat, session_id: &str) -> TestHarness {
    build_harness_with_embedder(config, chat, session_id, MockEmbeddings::working()).await
}

pub async fn build_harness_with_embedder(
    config: MemoryConfig,
    chat: MockChat,
    session_id: &str,
    embedder: MockEmbeddings,
) -> TestHarness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let pool = memory_pool().await;
    let store = Arc::new(RecordingStore::new());
    let chat = Arc::new(chat);
    let resolver = Arc::new(MockResolver {
        session_id: session_id.to_string(),
        persona: None,
        default_persona: None,
    });

    let service = MemoryService::initialize(
        config,
        pool,
        store.clone(),
        Arc::new(embedder),
        chat.clone(),
        resolver,
    )
    .await
    .expect("initialize memory service");

    TestHarness {
        service,
        store,
        chat,
        origin: Arc::new(()) as EventHandle,
    }
}

/// Pre-insert a stored memory for retrieval tests.
pub async fn seed_memory(store: &RecordingStore, collection: &str, session_id: &str, content: &str) {
    store
        .insert(
            collection,
            vec![MemoryRecord {
                memory_id: None,
                personality_id: "default_persona".to_string(),
                session_id: session_id.to_string(),
                content: content.to_string(),
                vector: vec![1.0, 0.0, 0.0, 0.0],
                create_time: 1_700_000_000,
            }],
        )
        .await
        .expect("seed memory");
}
