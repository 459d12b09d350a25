//! Session context management for Vesper.
//!
//! An LLM session's token budget is finite; inlined files and long
//! histories eventually blow past it. [`ContextEngine`] watches usage after
//! every append and applies one of three graduated compaction levels:
//!
//! - **Soft** (50%): stale full-mode file references compress to summaries.
//! - **Hard** (65%): low-relevance older messages are pruned, scored
//!   against the recent tail (embeddings when available, keyword overlap
//!   otherwise).
//! - **Emergency** (80%): everything but the newest messages collapses
//!   into a single summary message.
//!
//! State lives in a SQLite store ([`SessionStore`]) with a versioned
//! schema and an append-only compaction audit trail. The embedding and
//! summarization endpoints are best-effort collaborators: when they are
//! down, scoring degrades to keywords and summaries degrade to a
//! structural digest — an append never fails because of them.

mod compaction;
pub mod embedder;
pub mod engine;
pub mod error;
pub mod scoring;
pub mod store;
pub mod summarizer;
pub mod tokens;

pub use compaction::SUMMARY_MARKER;
pub use embedder::{cosine_similarity, EmbeddingClient, HttpEmbedder, DEFAULT_EMBEDDING_MODEL};
pub use engine::{
    CompactionLevel, CompactionStats, ContextEngine, EngineConfig, EngineStatus, Thresholds,
};
pub use error::ContextError;
pub use scoring::RelevanceScorer;
pub use store::{
    CompactionEvent, CompactionStrategy, FileMode, FileReference, MessageRecord, Role,
    SessionConfig, SessionRecord, SessionStore, SessionSummary, SessionUpdate,
};
pub use summarizer::{fallback_summary, OllamaSummarizer, Summarizer};
pub use tokens::estimate_tokens;
