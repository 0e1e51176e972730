//! Memory lifecycle engine
//!
//! - Session: per-session history plus durable counters/timestamps
//! - Recall: query embedding, vector search, idempotent prompt injection
//! - Summarization: trigger evaluation and the summarize-and-store pipeline
//! - Scheduler: background sweep for sessions that go quiet
//! - Storage: Milvus-like and local vector backends behind one trait

pub mod markers;
pub mod recall;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod storage;
pub mod summarization;
pub mod traits;
pub mod types;

pub use self::markers::MemoryMarker;
pub use self::service::MemoryService;
pub use self::session::{CounterStore, SessionStore};
pub use self::summarization::SummarizationService;
pub use self::traits::{ChatProvider, EmbeddingProvider, EventHandle, HostResolver, VectorStore};
pub use self::types::{
    ChatCompletion, ChatMessage, ContextMessage, InjectionMethod, MemoryHit, MemoryRecord,
    PromptRequest, Role,
};
