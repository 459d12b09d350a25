/// Errors surfaced by the store and the engine.
///
/// External dependencies (embedder, summarizer) never produce an error —
/// their absence degrades to lexical scoring or the structural summary.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("schema migration failed ({reason}); pre-migration backup at {backup}")]
    Migration { reason: String, backup: String },
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invariant violation: {0}")]
    Invariant(String),
}
