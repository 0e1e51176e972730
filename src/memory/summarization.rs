// src/memory/summarization.rs

//! Summarization pipeline and trigger evaluation.
//!
//! Each pipeline run is a fresh linear pass: preconditions, LLM summary,
//! text extraction, embedding, store, optional flush. Any stage failure
//! logs and aborts with nothing partially written. Runs are fire-and-forget
//! background tasks; a failed run loses its span (logged, not retried).
//!
//! Both trigger paths (count-based after each assistant turn, time-based
//! from the sweeper) evaluate and reset inside one per-session guard, so
//! they can never double-summarize the same span.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MemoryConfig;
use crate::memory::markers::format_dialogue;
use crate::memory::recall::resolve_persona;
use crate::memory::session::SessionStore;
use crate::memory::traits::{ChatProvider, EmbeddingProvider, HostResolver, VectorStore};
use crate::memory::types::MemoryRecord;

#[derive(Clone)]
pub struct SummarizationService {
    config: Arc<MemoryConfig>,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Arc<dyn ChatProvider>,
    sessions: Arc<SessionStore>,
    resolver: Arc<dyn HostResolver>,
    trigger_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SummarizationService {
    pub fn new(
        config: Arc<MemoryConfig>,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn ChatProvider>,
        sessions: Arc<SessionStore>,
        resolver: Arc<dyn HostResolver>,
    ) -> Self {
        Self {
            config,
            store,
            embedder,
            llm,
            sessions,
            resolver,
            trigger_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Advisory lock serializing trigger evaluation per session.
    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.trigger_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Launch one summarization run in the background. The caller never
    /// waits; terminal failures are logged by the task itself.
    pub fn spawn_summarize(
        &self,
        persona_id: Option<String>,
        session_id: String,
        dialogue: String,
    ) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = service
                .summarize_and_store(persona_id.as_deref(), &session_id, &dialogue)
                .await
            {
                error!("Summarization for session {} failed: {:#}", session_id, e);
            }
        })
    }

    /// The pipeline: check preconditions, summarize via the LLM, extract
    /// the text, embed it, store the record, optionally flush.
    async fn summarize_and_store(
        &self,
        persona_id: Option<&str>,
        session_id: &str,
        dialogue: &str,
    ) -> Result<()> {
        // Preconditions come before the LLM spend.
        if !self.store.is_connected() {
            bail!("vector store not connected, cannot store a summary");
        }
        let dialogue = dialogue.trim();
        if dialogue.is_empty() {
            warn!(
                "Nothing to summarize for session {} (empty dialogue), skipping",
                session_id
            );
            return Ok(());
        }

        let completion = self
            .llm
            .chat(
                dialogue,
                &self.config.summary_system_prompt,
                &self.config.summary_llm_params,
            )
            .await
            .context("summarization LLM call failed")?;

        let summary = completion.text.trim();
        if summary.is_empty() {
            bail!("LLM returned an empty summary");
        }
        info!(
            "Summary generated for session {} ({} chars)",
            session_id,
            summary.len()
        );

        let vectors = self
            .embedder
            .embed(&[summary.to_string()])
            .await
            .context("failed to embed summary")?;
        let vector = vectors
            .into_iter()
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("embedding provider returned no vector for the summary"))?;

        let record = MemoryRecord {
            memory_id: None,
            personality_id: persona_id
                .unwrap_or(&self.config.default_persona)
                .to_string(),
            session_id: session_id.to_string(),
            content: summary.to_string(),
            vector,
            create_time: Utc::now().timestamp(),
        };

        let collection = &self.config.collection_name;
        let outcome = self
            .store
            .insert(collection, vec![record])
            .await
            .context("failed to store summary")?;
        if outcome.inserted == 0 {
            bail!("vector store reported zero inserted records");
        }
        info!(
            "Stored summary memory {:?} for session {}",
            outcome.ids, session_id
        );

        if self.config.flush_after_insert {
            // Trades write latency for read-after-write visibility.
            if let Err(e) = self.store.flush(&[collection.as_str()]).await {
                error!("Flush of collection '{}' after insert failed: {:#}", collection, e);
            }
        }
        Ok(())
    }

    /// Count-based trigger, evaluated after every assistant turn. Returns
    /// true when a summarization was launched.
    ///
    /// The counter resets immediately after the launch, not after the
    /// pipeline resolves: the same span must not re-trigger while the run
    /// is in flight, at the accepted cost of losing the span if the run
    /// later fails.
    pub async fn evaluate_count_trigger(
        &self,
        session_id: &str,
        persona_id: Option<String>,
    ) -> bool {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let history = self.sessions.get_history(session_id).await;
        if !self
            .sessions
            .counters()
            .adjust_if_necessary(session_id, history.len())
            .await
        {
            return false;
        }

        let count = self.sessions.counters().get(session_id).await;
        let threshold = self.config.num_pairs_threshold;
        if count < threshold as i64 {
            debug!(
                "Session {} at {}/{} turns, below the summarization threshold",
                session_id, count, threshold
            );
            return false;
        }

        info!(
            "Session {} reached {}/{} turns, launching summarization",
            session_id, count, threshold
        );
        let dialogue = format_dialogue(&history, threshold);
        self.spawn_summarize(persona_id, session_id.to_string(), dialogue);

        self.sessions.counters().reset(session_id).await;
        self.sessions.update_summary_time(session_id).await;
        true
    }

    /// Time-based trigger, evaluated by the background sweeper. Catches
    /// sessions that went quiet before reaching the count threshold;
    /// summarizes ALL pending turns, not a fixed window.
    pub async fn evaluate_time_trigger(&self, session_id: &str, now: f64) -> bool {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let Some(snapshot) = self.sessions.get_full_context(session_id).await else {
            debug!("Session {} vanished before its sweep, skipping", session_id);
            return false;
        };

        let count = self.sessions.counters().get(session_id).await;
        let elapsed = now - snapshot.last_summary_time;
        let threshold = self.config.summary_time_threshold as f64;
        if count <= 0 || elapsed <= threshold {
            debug!(
                "Session {} not overdue: {} pending turns, {:.0}s/{:.0}s since last summary",
                session_id, count, elapsed, threshold
            );
            return false;
        }

        info!(
            "Session {} idle {:.0}s (threshold {:.0}s) with {} pending turns, forcing summarization",
            session_id, elapsed, threshold, count
        );
        let dialogue = format_dialogue(&snapshot.history, count as usize);

        let persona_id = match &snapshot.origin {
            Some(origin) => resolve_persona(self.resolver.as_ref(), &self.config, Some(origin)),
            None => {
                warn!(
                    "Session {} has no origin handle, summarizing without a persona",
                    session_id
                );
                None
            }
        };

        self.spawn_summarize(persona_id, session_id.to_string(), dialogue);
        self.sessions.counters().reset(session_id).await;
        self.sessions.update_summary_time(session_id).await;
        true
    }
}
