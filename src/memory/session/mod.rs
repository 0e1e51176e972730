// src/memory/session/mod.rs

//! Single source of truth for per-session conversation state: volatile
//! history plus the origin handle in memory, counters and summary
//! timestamps write-through to SQLite.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::memory::traits::EventHandle;
use crate::memory::types::{ChatMessage, Role, unix_now};

pub mod counter;
pub mod migration;

pub use counter::CounterStore;

/// Per-session in-memory state. History grows until process restart; the
/// durable counter, not truncation, marks summarization progress.
pub struct SessionState {
    pub history: Vec<ChatMessage>,
    pub last_summary_time: f64,
    pub origin: Option<EventHandle>,
}

/// Cloned-out view of one session for callers that must not hold the map
/// lock (the scheduler, the summarizer).
pub struct SessionSnapshot {
    pub history: Vec<ChatMessage>,
    pub last_summary_time: f64,
    pub origin: Option<EventHandle>,
}

pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionState>>,
    counters: CounterStore,
}

impl SessionStore {
    pub fn new(counters: CounterStore) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            counters,
        }
    }

    pub fn counters(&self) -> &CounterStore {
        &self.counters
    }

    /// Upsert a session; the single creation path for both the retrieval
    /// and response sides. No-op when already tracked. Returns true when
    /// the session was created by this call.
    ///
    /// On creation the last-summary time loads from durable storage; when
    /// absent it is set to now and written through.
    pub async fn ensure_session(
        &self,
        session_id: &str,
        seed_history: Vec<ChatMessage>,
        origin: Option<EventHandle>,
    ) -> bool {
        {
            let sessions = self.sessions.read().await;
            if sessions.contains_key(session_id) {
                debug!("Session {} already tracked, skipping init", session_id);
                return false;
            }
        }

        let last_summary_time = match self.counters.last_summary_time(session_id).await {
            Some(loaded) => {
                info!(
                    "Loaded last summary time {} for session {} from storage",
                    loaded, session_id
                );
                loaded
            }
            None => {
                let now = unix_now();
                self.counters.set_last_summary_time(session_id, now).await;
                info!(
                    "No stored summary time for session {}, initialized to now",
                    session_id
                );
                now
            }
        };

        if origin.is_none() {
            warn!(
                "Session {} created without an origin handle; persona resolution \
                 will be unavailable for background summarization",
                session_id
            );
        }

        let mut sessions = self.sessions.write().await;
        // A concurrent creator may have won the race between the read
        // above and this write; keep the first entry.
        if sessions.contains_key(session_id) {
            return false;
        }
        sessions.insert(
            session_id.to_string(),
            SessionState {
                history: seed_history,
                last_summary_time,
                origin,
            },
        );
        info!("Session {} tracked", session_id);
        true
    }

    /// Append one turn, implicitly creating the session when needed.
    /// Counters are untouched; callers increment separately.
    pub async fn add_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        origin: Option<EventHandle>,
    ) {
        self.ensure_session(session_id, Vec::new(), origin).await;

        let mut sessions = self.sessions.write().await;
        if let Some(state) = sessions.get_mut(session_id) {
            state.history.push(ChatMessage::now(role, content));
            debug!(
                "Message ({}) appended to session {} history",
                role.as_str(),
                session_id
            );
        }
    }

    /// Full history copy; empty for unknown sessions, never an error.
    pub async fn get_history(&self, session_id: &str) -> Vec<ChatMessage> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|state| state.history.clone())
            .unwrap_or_default()
    }

    /// Full session view; `None` for unknown sessions.
    pub async fn get_full_context(&self, session_id: &str) -> Option<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|state| SessionSnapshot {
            history: state.history.clone(),
            last_summary_time: state.last_summary_time,
            origin: state.origin.clone(),
        })
    }

    /// In-memory last-summary time; `None` for unknown sessions.
    pub async fn summary_time(&self, session_id: &str) -> Option<f64> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|state| state.last_summary_time)
    }

    /// Set the last-summary time to now, in memory and durably.
    pub async fn update_summary_time(&self, session_id: &str) {
        let now = unix_now();
        {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(session_id) {
                Some(state) => state.last_summary_time = now,
                None => {
                    warn!(
                        "Summary-time update for untracked session {}, ignoring",
                        session_id
                    );
                    return;
                }
            }
        }
        self.counters.set_last_summary_time(session_id, now).await;
    }

    /// Ids of every tracked session (the scheduler's sweep set).
    pub async fn tracked_sessions(&self) -> Vec<String> {
        let sessions = self.sessions.read().await;
        sessions.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SessionStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("create in-memory sqlite");
        migration::run_migrations(&pool).await.unwrap();
        SessionStore::new(CounterStore::new(pool))
    }

    #[tokio::test]
    async fn ensure_session_is_idempotent() {
        let sessions = store().await;
        let seed = vec![ChatMessage::now(Role::User, "hello")];

        assert!(sessions.ensure_session("s1", seed, None).await);
        // A second init must not clobber the seeded history.
        assert!(!sessions.ensure_session("s1", Vec::new(), None).await);
        assert_eq!(sessions.get_history("s1").await.len(), 1);
    }

    #[tokio::test]
    async fn ensure_session_persists_initial_summary_time() {
        let sessions = store().await;
        sessions.ensure_session("s1", Vec::new(), None).await;

        let in_memory = sessions.summary_time("s1").await.unwrap();
        let durable = sessions.counters().last_summary_time("s1").await.unwrap();
        assert!((in_memory - durable).abs() < 1e-6);
    }

    #[tokio::test]
    async fn add_message_implicitly_creates_the_session() {
        let sessions = store().await;
        sessions.add_message("s1", Role::User, "hi", None).await;
        sessions.add_message("s1", Role::Assistant, "hello", None).await;

        let history = sessions.get_history("s1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
        assert!(sessions.tracked_sessions().await.contains(&"s1".to_string()));
    }

    #[tokio::test]
    async fn unknown_sessions_read_as_empty() {
        let sessions = store().await;
        assert!(sessions.get_history("nope").await.is_empty());
        assert!(sessions.get_full_context("nope").await.is_none());
        assert!(sessions.summary_time("nope").await.is_none());
    }

    #[tokio::test]
    async fn update_summary_time_moves_forward_and_persists() {
        let sessions = store().await;
        sessions.ensure_session("s1", Vec::new(), None).await;
        let initial = sessions.summary_time("s1").await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        sessions.update_summary_time("s1").await;

        let updated = sessions.summary_time("s1").await.unwrap();
        assert!(updated > initial);
        let durable = sessions.counters().last_summary_time("s1").await.unwrap();
        assert!((updated - durable).abs() < 1e-6);
    }

    #[tokio::test]
    async fn reloads_summary_time_from_durable_storage() {
        let sessions = store().await;
        sessions
            .counters()
            .set_last_summary_time("s1", 1_700_000_000.0)
            .await;

        sessions.ensure_session("s1", Vec::new(), None).await;
        let loaded = sessions.summary_time("s1").await.unwrap();
        assert!((loaded - 1_700_000_000.0).abs() < 1e-6);
    }
}
