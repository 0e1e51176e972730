// src/memory/service.rs

//! MemoryService - the facade the host wires in. Owns the session store,
//! both pipelines, and the background sweeper's lifecycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MemoryConfig;
use crate::error::StartupError;
use crate::llm::{OpenAiChatClient, OpenAiEmbeddings};
use crate::memory::markers::MemoryMarker;
use crate::memory::recall::{RecallPipeline, resolve_persona};
use crate::memory::scheduler::spawn_summary_sweeper;
use crate::memory::session::{CounterStore, SessionStore, migration};
use crate::memory::storage::factory::create_vector_store;
use crate::memory::storage::schema::CollectionSchema;
use crate::memory::summarization::SummarizationService;
use crate::memory::traits::{
    ChatProvider, EmbeddingProvider, EventHandle, HostResolver, VectorStore,
};
use crate::memory::types::{
    ChatCompletion, MemoryHit, OUTPUT_FIELDS, PromptRequest, Role, VECTOR_FIELD,
};

/// Upper bound on records pulled for a listing before sorting client-side.
const LIST_FETCH_CAP: usize = 1000;

pub struct MemoryService {
    config: Arc<MemoryConfig>,
    sessions: Arc<SessionStore>,
    store: Arc<dyn VectorStore>,
    resolver: Arc<dyn HostResolver>,
    recall: RecallPipeline,
    summarizer: SummarizationService,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl MemoryService {
    /// Convenience wiring for hosts that use the built-in clients: the
    /// backend comes from the factory, embeddings and summarization chat
    /// from the OpenAI-compatible clients.
    pub async fn from_config(
        config: MemoryConfig,
        pool: SqlitePool,
        resolver: Arc<dyn HostResolver>,
    ) -> Result<Arc<Self>, StartupError> {
        config.validate()?;
        let store = create_vector_store(&config)?;
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(OpenAiEmbeddings::new(
            &config.embedding_url,
            &config.embedding_key,
            &config.embedding_model,
            config.embedding_dim,
        ));
        let llm: Arc<dyn ChatProvider> = Arc::new(OpenAiChatClient::new(
            &config.llm_url,
            &config.llm_key,
            &config.llm_model,
        ));
        Self::initialize(config, pool, store, embedder, llm, resolver).await
    }

    /// Wire up the whole memory layer. Configuration problems abort here;
    /// an unreachable vector store does not (retrieval and summarization
    /// degrade to no-ops until it comes back).
    pub async fn initialize(
        config: MemoryConfig,
        pool: SqlitePool,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn ChatProvider>,
        resolver: Arc<dyn HostResolver>,
    ) -> Result<Arc<Self>, StartupError> {
        config.validate()?;
        let config = Arc::new(config);

        migration::run_migrations(&pool)
            .await
            .map_err(|e| StartupError::CounterStore(format!("{e:#}")))?;
        let sessions = Arc::new(SessionStore::new(CounterStore::new(pool)));

        let marker = MemoryMarker::new(&config.memory_prefix, &config.memory_suffix)
            .map_err(|e| StartupError::InvalidMarker(format!("{e:#}")))?;

        match store.connect().await {
            Ok(()) => {
                Self::ensure_collection(store.as_ref(), &config)
                    .await
                    .map_err(|e| StartupError::CollectionBootstrap(format!("{e:#}")))?;
            }
            Err(e) => {
                // Expected during startup races; pipelines precondition-skip
                // until the store is reachable.
                warn!("Vector store unreachable at startup, running degraded: {:#}", e);
            }
        }

        if let Err(e) = embedder.test_connection().await {
            warn!("Embedding provider probe failed: {:#}", e);
        }

        let recall = RecallPipeline::new(
            config.clone(),
            store.clone(),
            embedder.clone(),
            sessions.clone(),
            resolver.clone(),
            marker,
        );
        let summarizer = SummarizationService::new(
            config.clone(),
            store.clone(),
            embedder,
            llm,
            sessions.clone(),
            resolver.clone(),
        );

        info!(
            "Memory service initialized (collection: '{}', backend connected: {})",
            config.collection_name,
            store.is_connected()
        );
        Ok(Arc::new(Self {
            config,
            sessions,
            store,
            resolver,
            recall,
            summarizer,
            sweeper: Mutex::new(None),
        }))
    }

    /// Create, index, and load the active collection when missing.
    /// The vector dimension is fixed here for the collection's lifetime.
    async fn ensure_collection(store: &dyn VectorStore, config: &MemoryConfig) -> Result<()> {
        let name = &config.collection_name;
        if store.has_collection(name).await? {
            store.load_collection(name).await?;
            debug!("Collection '{}' already present", name);
            return Ok(());
        }

        info!("Collection '{}' missing, bootstrapping", name);
        let schema = CollectionSchema::memory_collection(config.embedding_dim);
        store.create_collection(name, &schema).await?;
        store
            .create_index(
                name,
                VECTOR_FIELD,
                &config.index_params,
                Duration::from_secs(config.create_index_timeout),
            )
            .await?;
        store.load_collection(name).await?;
        Ok(())
    }

    /// Start the background sweeper. Idempotent.
    pub async fn start(&self) {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_some() {
            debug!("Summary sweeper already running");
            return;
        }
        let token = CancellationToken::new();
        let handle = spawn_summary_sweeper(
            self.summarizer.clone(),
            self.sessions.clone(),
            self.config.clone(),
            token.clone(),
        );
        *sweeper = Some((token, handle));
    }

    /// Cancel the sweeper and wait a bounded grace period. In-flight
    /// summarization tasks are left to complete or fail on their own; a
    /// cancellation mid-store would be worse than a late write.
    pub async fn shutdown(&self) {
        let Some((token, handle)) = self.sweeper.lock().await.take() else {
            return;
        };
        token.cancel();
        match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(_) => info!("Summary sweeper stopped"),
            Err(_) => warn!("Summary sweeper did not stop within the 5s grace period"),
        }
    }

    /// Called before the host sends the request to its LLM: retrieves
    /// relevant memories and rewrites `req` in place. Never errors.
    pub async fn on_user_turn(&self, origin: EventHandle, req: &mut PromptRequest) {
        self.recall.handle_user_turn(origin, req).await;
    }

    /// Called after the host's LLM responds: records the assistant turn
    /// and evaluates the count-based summarization trigger. Never errors.
    pub async fn on_assistant_turn(&self, origin: EventHandle, completion: &ChatCompletion) {
        if completion.role != Role::Assistant.as_str() {
            debug!(
                "LLM response role '{}' is not assistant, not recording",
                completion.role
            );
            return;
        }
        let Some(session_id) = self.resolver.current_session_id(&origin) else {
            error!("Cannot resolve current session id, response not recorded");
            return;
        };
        let persona_id = resolve_persona(self.resolver.as_ref(), &self.config, Some(&origin));

        self.sessions
            .add_message(&session_id, Role::Assistant, &completion.text, Some(origin))
            .await;
        self.sessions.counters().increment(&session_id).await;

        self.summarizer
            .evaluate_count_trigger(&session_id, persona_id)
            .await;
    }

    /// Admin-style purge: delete every memory of one session, then flush
    /// so the deletion is immediately visible.
    pub async fn purge_session_memory(&self, session_id: &str) -> Result<u64> {
        let filter = format!("session_id == \"{}\"", session_id);
        let outcome = self
            .store
            .delete(&self.config.collection_name, &filter)
            .await?;
        self.store
            .flush(&[self.config.collection_name.as_str()])
            .await?;
        info!(
            "Purged {} memories for session {}",
            outcome.deleted, session_id
        );
        Ok(outcome.deleted)
    }

    /// Newest-first listing of one session's stored memories.
    pub async fn list_session_records(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryHit>> {
        let filter = format!("session_id == \"{}\"", session_id);
        let raw = self
            .store
            .query(
                &self.config.collection_name,
                &filter,
                &OUTPUT_FIELDS,
                LIST_FETCH_CAP,
            )
            .await?;

        let mut hits: Vec<MemoryHit> = raw.iter().filter_map(MemoryHit::from_fields).collect();
        hits.sort_by_key(|hit| std::cmp::Reverse(hit.create_time));
        hits.truncate(limit);
        Ok(hits)
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Direct access to the summarizer (trigger evaluation is also
    /// reachable through `on_assistant_turn`).
    pub fn summarizer(&self) -> &SummarizationService {
        &self.summarizer
    }
}
