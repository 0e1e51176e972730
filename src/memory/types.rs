// src/memory/types.rs

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// Primary key field of the memory collection.
pub const PRIMARY_FIELD: &str = "memory_id";
/// Vector field of the memory collection.
pub const VECTOR_FIELD: &str = "vector";
/// Fields requested back from query/search operations.
pub const OUTPUT_FIELDS: [&str; 5] = [
    "content",
    "create_time",
    "session_id",
    "personality_id",
    PRIMARY_FIELD,
];
/// Sentinel the host uses for "this conversation explicitly has no persona".
pub const PERSONA_NONE_SENTINEL: &str = "[%None]";

pub const MAX_PERSONA_LEN: usize = 256;
pub const MAX_SESSION_ID_LEN: usize = 72;
pub const MAX_CONTENT_LEN: usize = 4096;

/// A persisted, embedded summary of past dialogue.
/// Immutable once written; removed only by explicit purge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Auto-assigned by the vector store on insert.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_id: Option<i64>,
    pub personality_id: String,
    pub session_id: String,
    pub content: String,
    pub vector: Vec<f32>,
    /// Unix seconds.
    pub create_time: i64,
}

/// A normalized search/query hit. Raw backend hits that cannot be shaped
/// into this are skipped, not fatal.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryHit {
    pub memory_id: i64,
    pub content: String,
    pub create_time: i64,
    pub session_id: String,
    pub personality_id: String,
}

impl MemoryHit {
    /// Shape one raw field map into a hit. Returns `None` for malformed
    /// entries (missing id or content).
    pub fn from_fields(fields: &Value) -> Option<Self> {
        let memory_id = fields.get(PRIMARY_FIELD)?.as_i64()?;
        let content = fields.get("content")?.as_str()?.to_string();
        Some(Self {
            memory_id,
            content,
            create_time: fields.get("create_time").and_then(Value::as_i64).unwrap_or(0),
            session_id: fields
                .get("session_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            personality_id: fields
                .get("personality_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    /// Human-readable creation time for prompt injection.
    pub fn display_time(&self) -> String {
        match DateTime::<Utc>::from_timestamp(self.create_time, 0) {
            Some(ts) => ts.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string(),
            None => format!("timestamp({})", self.create_time),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            _ => Err(()),
        }
    }
}

/// One turn in the in-memory session history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: String,
}

impl ChatMessage {
    pub fn now(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

/// One message of the outbound LLM payload. `content` stays a loose JSON
/// value so non-string payloads (image parts etc.) pass through the marker
/// stripping untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: String,
    pub content: Value,
}

impl ContextMessage {
    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Value::String(content.into()),
        }
    }
}

/// The outbound LLM request the host hands in for memory injection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptRequest {
    pub prompt: String,
    pub system_prompt: String,
    pub contexts: Vec<ContextMessage>,
}

/// A chat-completion result from the LLM provider.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub text: String,
    pub role: String,
}

/// Where retrieved memories get spliced into the outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionMethod {
    UserPrompt,
    SystemPrompt,
    InsertSystemPrompt,
}

impl InjectionMethod {
    /// Returns `None` for unknown names; callers fall back to
    /// `UserPrompt` with a warning.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user_prompt" => Some(Self::UserPrompt),
            "system_prompt" => Some(Self::SystemPrompt),
            "insert_system_prompt" => Some(Self::InsertSystemPrompt),
            _ => None,
        }
    }
}

/// Outcome of a vector-store insert.
#[derive(Debug, Clone, Default)]
pub struct InsertOutcome {
    pub inserted: u64,
    pub ids: Vec<i64>,
}

/// Outcome of a filtered delete.
#[derive(Debug, Clone, Default)]
pub struct DeleteOutcome {
    pub deleted: u64,
}

/// Current unix time as float seconds (the durable timestamp unit).
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hit_from_well_formed_fields() {
        let fields = json!({
            "memory_id": 42,
            "content": "user likes tea",
            "create_time": 1700000000,
            "session_id": "s1",
            "personality_id": "p1",
        });
        let hit = MemoryHit::from_fields(&fields).expect("well-formed hit");
        assert_eq!(hit.memory_id, 42);
        assert_eq!(hit.content, "user likes tea");
        assert_eq!(hit.session_id, "s1");
    }

    #[test]
    fn hit_skips_malformed_fields() {
        // Missing content entirely.
        assert!(MemoryHit::from_fields(&json!({"memory_id": 1})).is_none());
        // Non-numeric primary key.
        assert!(MemoryHit::from_fields(&json!({"memory_id": "x", "content": "c"})).is_none());
    }

    #[test]
    fn role_round_trips() {
        for role in [Role::User, Role::Assistant, Role::System] {
            assert_eq!(role.as_str().parse::<Role>(), Ok(role));
        }
        assert!("tool".parse::<Role>().is_err());
    }

    #[test]
    fn unknown_injection_method_is_none() {
        assert_eq!(
            InjectionMethod::parse("user_prompt"),
            Some(InjectionMethod::UserPrompt)
        );
        assert_eq!(InjectionMethod::parse("footer"), None);
    }
}
