// src/memory/recall.rs

//! Retrieval pipeline: embed the inbound user turn, search the vector
//! store for relevant memories, and splice them into the outbound request.
//!
//! Nothing in here propagates to the turn-handling caller. Missing
//! prerequisites are an expected, frequent non-error path (the feature may
//! be half-configured), and backend failures abort retrieval for this turn
//! only.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::MemoryConfig;
use crate::memory::markers::{MemoryMarker, trim_system_messages};
use crate::memory::session::SessionStore;
use crate::memory::traits::{EmbeddingProvider, EventHandle, HostResolver, VectorStore};
use crate::memory::types::{
    ChatMessage, ContextMessage, InjectionMethod, MemoryHit, OUTPUT_FIELDS, PERSONA_NONE_SENTINEL,
    PRIMARY_FIELD, PromptRequest, Role, VECTOR_FIELD,
};

/// Resolve the effective persona for memory operations: the session's own
/// persona when set (and not the "no persona" sentinel), else the host's
/// default, else the configured placeholder when personality filtering is
/// on, else none.
pub(crate) fn resolve_persona(
    resolver: &dyn HostResolver,
    config: &MemoryConfig,
    origin: Option<&EventHandle>,
) -> Option<String> {
    let session_persona = origin
        .and_then(|o| resolver.persona_id(o))
        .filter(|p| !p.is_empty() && p != PERSONA_NONE_SENTINEL);
    if session_persona.is_some() {
        return session_persona;
    }

    if let Some(default) = resolver.default_persona() {
        info!("No session persona set, using host default persona '{}'", default);
        return Some(default);
    }

    if config.use_personality_filtering {
        warn!(
            "No persona configured anywhere; personality filtering is on, \
             using placeholder '{}'",
            config.default_persona
        );
        return Some(config.default_persona.clone());
    }

    info!("No persona configured; memory operations will not distinguish personas");
    None
}

pub struct RecallPipeline {
    config: Arc<MemoryConfig>,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    sessions: Arc<SessionStore>,
    resolver: Arc<dyn HostResolver>,
    marker: MemoryMarker,
}

impl RecallPipeline {
    pub fn new(
        config: Arc<MemoryConfig>,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        sessions: Arc<SessionStore>,
        resolver: Arc<dyn HostResolver>,
        marker: MemoryMarker,
    ) -> Self {
        Self {
            config,
            store,
            embedder,
            sessions,
            resolver,
            marker,
        }
    }

    /// The configured injection method, falling back to user-prompt
    /// injection (with a warning) for unknown names.
    fn injection_method(&self) -> InjectionMethod {
        match InjectionMethod::parse(&self.config.injection_method) {
            Some(method) => method,
            None => {
                warn!(
                    "Unknown memory injection method '{}', falling back to user_prompt",
                    self.config.injection_method
                );
                InjectionMethod::UserPrompt
            }
        }
    }

    /// RAG entry point, called before the host sends `req` to its LLM.
    /// Mutates `req` in place; never errors to the caller.
    pub async fn handle_user_turn(&self, origin: EventHandle, req: &mut PromptRequest) {
        if !self.store.is_connected() {
            debug!("Vector store not connected, skipping memory retrieval");
            return;
        }

        let Some(session_id) = self.resolver.current_session_id(&origin) else {
            error!("Cannot resolve current session id, memory retrieval aborted");
            return;
        };
        let persona_id = resolve_persona(self.resolver.as_ref(), &self.config, Some(&origin));

        // First encounter: seed the tracked history from the request's own
        // context so the summarizer sees turns that predate us.
        self.sessions
            .ensure_session(&session_id, seed_from_contexts(&req.contexts), Some(origin.clone()))
            .await;

        // Strip previously injected blocks before the new turn is recorded,
        // so retries never accumulate memory text.
        self.clean_request(req);

        self.sessions
            .add_message(&session_id, Role::User, &req.prompt, Some(origin))
            .await;
        self.sessions.counters().increment(&session_id).await;
        debug!("User turn recorded for session {}", session_id);

        let query_vector = match self.embedder.embed(&[req.prompt.clone()]).await {
            Ok(mut vectors) if !vectors.is_empty() && !vectors[0].is_empty() => {
                vectors.swap_remove(0)
            }
            Ok(_) => {
                error!("Embedding provider returned no vector for the query, retrieval aborted");
                return;
            }
            Err(e) => {
                error!("Failed to embed user query: {:#}", e);
                return;
            }
        };

        let Some(hits) = self.search_memories(&query_vector, &session_id, persona_id.as_deref()).await
        else {
            return;
        };

        if hits.is_empty() {
            info!("No relevant memories found for session {}", session_id);
            return;
        }
        self.inject(&hits, req);
    }

    /// Session- (and optionally persona-) scoped vector search. `None`
    /// means the search failed or timed out; an empty vec means no hits.
    async fn search_memories(
        &self,
        query_vector: &[f32],
        session_id: &str,
        persona_id: Option<&str>,
    ) -> Option<Vec<MemoryHit>> {
        let mut filters = vec![format!("{} > 0", PRIMARY_FIELD)];
        filters.push(format!("session_id == \"{}\"", session_id));
        if self.config.use_personality_filtering {
            match persona_id {
                Some(persona) => {
                    filters.push(format!("personality_id == \"{}\"", persona));
                    debug!("Search filtered to persona '{}'", persona);
                }
                None => {
                    debug!("Personality filtering on but no persona resolved, not filtering")
                }
            }
        }
        let expression = filters.join(" and ");

        let collection = &self.config.collection_name;
        let timeout = Duration::from_secs(self.config.search_timeout);
        info!(
            "Searching collection '{}' (top_k: {}, filter: '{}', timeout: {:?})",
            collection, self.config.top_k, expression, timeout
        );

        let search = self.store.search(
            collection,
            vec![query_vector.to_vec()],
            VECTOR_FIELD,
            &self.config.search_params,
            self.config.top_k,
            &expression,
            &OUTPUT_FIELDS,
        );

        let raw = match tokio::time::timeout(timeout, search).await {
            Ok(Ok(per_query)) => per_query,
            Ok(Err(e)) => {
                error!("Vector search failed: {:#}", e);
                return None;
            }
            Err(_) => {
                error!("Vector search timed out after {:?}", timeout);
                return None;
            }
        };

        let hits_for_query = raw.into_iter().next().unwrap_or_default();
        let total = hits_for_query.len();
        let hits: Vec<MemoryHit> = hits_for_query
            .iter()
            .filter_map(MemoryHit::from_fields)
            .collect();
        if hits.len() < total {
            warn!("Skipped {} malformed search hits", total - hits.len());
        }
        info!("Search produced {} usable memories", hits.len());
        Some(hits)
    }

    /// Format the hits into one marked block and splice it into the
    /// request per the configured injection method.
    fn inject(&self, hits: &[MemoryHit], req: &mut PromptRequest) {
        let body = hits
            .iter()
            .map(|hit| {
                self.config
                    .memory_entry_format
                    .replace("{time}", &hit.display_time())
                    .replace("{content}", &hit.content)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let block = self.marker.encode(&body);
        info!("Injecting {} memories into the outbound request", hits.len());

        match self.injection_method() {
            InjectionMethod::UserPrompt => {
                req.prompt = format!("{}\n{}", block, req.prompt);
            }
            InjectionMethod::SystemPrompt => {
                if req.system_prompt.is_empty() {
                    req.system_prompt = block;
                } else {
                    req.system_prompt = format!("{}\n{}", req.system_prompt, block);
                }
            }
            InjectionMethod::InsertSystemPrompt => {
                req.contexts
                    .push(ContextMessage::text(Role::System.as_str(), block));
            }
        }
    }

    /// Remove previously injected memory content from the request,
    /// keeping the configured number of recent blocks. Mirrors the three
    /// injection methods.
    pub fn clean_request(&self, req: &mut PromptRequest) {
        let keep = self.config.kept_memory_blocks;
        match self.injection_method() {
            InjectionMethod::UserPrompt => {
                let contexts = std::mem::take(&mut req.contexts);
                req.contexts = self.marker.strip_from_messages(contexts, keep);
            }
            InjectionMethod::SystemPrompt => {
                req.system_prompt = self.marker.strip_from_text(&req.system_prompt, keep);
            }
            InjectionMethod::InsertSystemPrompt => {
                let contexts = std::mem::take(&mut req.contexts);
                req.contexts = trim_system_messages(contexts, keep);
            }
        }
    }
}

/// Convert host-supplied context messages into seed history. Messages with
/// non-string content or unknown roles are skipped; they are outside the
/// summarizable dialogue.
fn seed_from_contexts(contexts: &[ContextMessage]) -> Vec<ChatMessage> {
    contexts
        .iter()
        .filter_map(|message| {
            let role = Role::from_str(&message.role).ok()?;
            let content = message.content.as_str()?;
            Some(ChatMessage::now(role, content))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_skips_non_string_and_unknown_roles() {
        let contexts = vec![
            ContextMessage::text("user", "hello"),
            ContextMessage::text("tool", "ignored"),
            ContextMessage {
                role: "user".to_string(),
                content: serde_json::json!({"parts": []}),
            },
            ContextMessage::text("assistant", "hi"),
        ];
        let seeded = seed_from_contexts(&contexts);
        assert_eq!(seeded.len(), 2);
        assert_eq!(seeded[0].role, Role::User);
        assert_eq!(seeded[1].role, Role::Assistant);
    }
}
