// src/config/mod.rs

//! Environment-driven configuration. Every knob has a default so the crate
//! works out of the box against a local backend; `validate` catches the
//! handful of settings that must abort startup when wrong.

use std::str::FromStr;

use once_cell::sync::Lazy;
use serde_json::{Value, json};

use crate::error::StartupError;

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    // ── Vector Store Configuration
    pub vector_backend: String,
    pub milvus_url: String,
    pub local_data_dir: String,
    pub collection_name: String,
    pub embedding_dim: usize,
    pub index_params: Value,
    pub search_params: Value,
    pub create_index_timeout: u64,
    pub flush_after_insert: bool,

    // ── Embedding Service Configuration
    pub embedding_service: String,
    pub embedding_model: String,
    pub embedding_key: String,
    pub embedding_url: String,

    // ── Summarization LLM Configuration
    pub llm_url: String,
    pub llm_key: String,
    pub llm_model: String,
    pub summary_system_prompt: String,
    pub summary_llm_params: Value,

    // ── Trigger Configuration
    pub num_pairs_threshold: usize,
    pub summary_check_interval: u64,
    /// Seconds of quiet before a forced summary; `<= 0` disables the
    /// time-based trigger entirely.
    pub summary_time_threshold: i64,

    // ── Retrieval & Injection Configuration
    pub top_k: usize,
    pub search_timeout: u64,
    pub use_personality_filtering: bool,
    pub default_persona: String,
    pub injection_method: String,
    pub memory_prefix: String,
    pub memory_suffix: String,
    pub memory_entry_format: String,
    pub kept_memory_blocks: usize,
}

fn env_var_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(val) => {
            let clean_val = val.split('#').next().unwrap_or("").trim();
            match clean_val.parse::<T>() {
                Ok(parsed) => parsed,
                Err(_) => {
                    eprintln!("Config: {} = '{}' (parse failed, using default)", key, val);
                    default
                }
            }
        }
        Err(_) => default,
    }
}

/// JSON-valued env vars (index/search params, extra LLM params).
fn env_json_or(key: &str, default: Value) -> Value {
    match std::env::var(key) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                eprintln!("Config: {} is not valid JSON ({}), using default", key, e);
                default
            }
        },
        Err(_) => default,
    }
}

impl MemoryConfig {
    pub fn from_env() -> Self {
        // Load from .env file first if it exists; a missing file is fine.
        let _ = dotenvy::dotenv();

        Self {
            vector_backend: env_var_or("ENGRAM_VECTOR_BACKEND", "local".to_string()),
            milvus_url: env_var_or("ENGRAM_MILVUS_URL", "http://localhost:19530".to_string()),
            local_data_dir: env_var_or("ENGRAM_LOCAL_DATA_DIR", "./engram_data".to_string()),
            collection_name: env_var_or("ENGRAM_COLLECTION", "engram_memory".to_string()),
            embedding_dim: env_var_or("ENGRAM_EMBEDDING_DIM", 768),
            index_params: env_json_or(
                "ENGRAM_INDEX_PARAMS",
                json!({"metric_type": "L2", "index_type": "AUTOINDEX", "params": {}}),
            ),
            search_params: env_json_or(
                "ENGRAM_SEARCH_PARAMS",
                json!({"metric_type": "L2", "params": {"nprobe": 10}}),
            ),
            create_index_timeout: env_var_or("ENGRAM_CREATE_INDEX_TIMEOUT", 60),
            flush_after_insert: env_var_or("ENGRAM_FLUSH_AFTER_INSERT", false),
            embedding_service: env_var_or("ENGRAM_EMBEDDING_SERVICE", "openai".to_string()),
            embedding_model: env_var_or(
                "ENGRAM_EMBEDDING_MODEL",
                "text-embedding-3-small".to_string(),
            ),
            embedding_key: env_var_or("OPENAI_API_KEY", String::new()),
            embedding_url: env_var_or(
                "ENGRAM_EMBEDDING_URL",
                "https://api.openai.com/v1".to_string(),
            ),
            llm_url: env_var_or("ENGRAM_LLM_URL", "https://api.openai.com/v1".to_string()),
            llm_key: env_var_or("OPENAI_API_KEY", String::new()),
            llm_model: env_var_or("ENGRAM_LLM_MODEL", "gpt-4o-mini".to_string()),
            summary_system_prompt: env_var_or(
                "ENGRAM_SUMMARY_PROMPT",
                "Summarize the following conversation into a concise, objective \
                 long-term memory entry containing the key facts:"
                    .to_string(),
            ),
            summary_llm_params: env_json_or("ENGRAM_SUMMARY_LLM_PARAMS", json!({})),
            num_pairs_threshold: env_var_or("ENGRAM_NUM_PAIRS", 10),
            summary_check_interval: env_var_or("ENGRAM_SUMMARY_CHECK_INTERVAL", 300),
            summary_time_threshold: env_var_or("ENGRAM_SUMMARY_TIME_THRESHOLD", 1800),
            top_k: env_var_or("ENGRAM_TOP_K", 5),
            search_timeout: env_var_or("ENGRAM_SEARCH_TIMEOUT", 10),
            use_personality_filtering: env_var_or("ENGRAM_PERSONALITY_FILTERING", false),
            default_persona: env_var_or("ENGRAM_DEFAULT_PERSONA", "default_persona".to_string()),
            injection_method: env_var_or("ENGRAM_INJECTION_METHOD", "user_prompt".to_string()),
            memory_prefix: env_var_or("ENGRAM_MEMORY_PREFIX", "<long_term_memory>".to_string()),
            memory_suffix: env_var_or("ENGRAM_MEMORY_SUFFIX", "</long_term_memory>".to_string()),
            memory_entry_format: env_var_or(
                "ENGRAM_MEMORY_ENTRY_FORMAT",
                "- [{time}] {content}".to_string(),
            ),
            kept_memory_blocks: env_var_or("ENGRAM_KEPT_MEMORY_BLOCKS", 0),
        }
    }

    /// Startup-time validation; failures here are fatal and abort
    /// initialization entirely.
    pub fn validate(&self) -> Result<(), StartupError> {
        if self.embedding_dim == 0 {
            return Err(StartupError::InvalidEmbeddingDim(self.embedding_dim));
        }
        match self.vector_backend.as_str() {
            "milvus" | "local" => {}
            other => return Err(StartupError::UnsupportedBackend(other.to_string())),
        }
        if self.embedding_service == "openai" && self.embedding_key.is_empty() {
            return Err(StartupError::MissingCredential("OPENAI_API_KEY"));
        }
        Ok(())
    }

    /// True when the time-based summarization trigger is enabled.
    pub fn time_trigger_enabled(&self) -> bool {
        self.summary_time_threshold > 0
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Environment-backed config instance, loaded once on first use. Hosts
/// that manage their own configuration build a `MemoryConfig` directly.
pub static CONFIG: Lazy<MemoryConfig> = Lazy::new(MemoryConfig::from_env);
