use serde::{Deserialize, Serialize};

/// Message author. The store rejects anything outside this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
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

    pub(crate) fn from_db(s: &str) -> rusqlite::Result<Role> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(bad_text(format!("unknown role: {other}"))),
        }
    }
}

/// How a file's content is inlined into a message. Soft compaction rewrites
/// `Full` references to `Summary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileMode {
    Full,
    Summary,
    Extract,
    Lines,
}

impl FileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileMode::Full => "full",
            FileMode::Summary => "summary",
            FileMode::Extract => "extract",
            FileMode::Lines => "lines",
        }
    }

    pub(crate) fn from_db(s: &str) -> rusqlite::Result<FileMode> {
        match s {
            "full" => Ok(FileMode::Full),
            "summary" => Ok(FileMode::Summary),
            "extract" => Ok(FileMode::Extract),
            "lines" => Ok(FileMode::Lines),
            other => Err(bad_text(format!("unknown file mode: {other}"))),
        }
    }
}

/// Which algorithm produced a compaction event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStrategy {
    FileCompress,
    MessagePrune,
    LlmSummary,
}

impl CompactionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompactionStrategy::FileCompress => "file_compress",
            CompactionStrategy::MessagePrune => "message_prune",
            CompactionStrategy::LlmSummary => "llm_summary",
        }
    }

    pub(crate) fn from_db(s: &str) -> rusqlite::Result<CompactionStrategy> {
        match s {
            "file_compress" => Ok(CompactionStrategy::FileCompress),
            "message_prune" => Ok(CompactionStrategy::MessagePrune),
            "llm_summary" => Ok(CompactionStrategy::LlmSummary),
            other => Err(bad_text(format!("unknown strategy: {other}"))),
        }
    }
}

fn bad_text(msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, msg.into())
}

/// Fields for a new session row. Only the id is required.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub id: String,
    pub context: String,
    pub max_context_tokens: i64,
    pub history_json: Option<String>,
    pub metadata_json: Option<String>,
    pub model_name: Option<String>,
    pub system_prompt: Option<String>,
}

impl SessionConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            context: String::new(),
            max_context_tokens: 64_000,
            history_json: None,
            metadata_json: None,
            model_name: None,
            system_prompt: None,
        }
    }

    pub fn with_max_context_tokens(mut self, tokens: i64) -> Self {
        self.max_context_tokens = tokens;
        self
    }

    pub fn with_model_name(mut self, model: impl Into<String>) -> Self {
        self.model_name = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_history_json(mut self, history: impl Into<String>) -> Self {
        self.history_json = Some(history.into());
        self
    }
}

/// A full session row.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub context: String,
    pub created_at: String,
    pub last_used: String,
    pub max_context_tokens: i64,
    pub history_json: Option<String>,
    pub metadata_json: Option<String>,
    pub model_name: Option<String>,
    pub system_prompt: Option<String>,
}

/// The slim row returned by `list_sessions`.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: String,
    pub last_used: String,
    pub max_context_tokens: i64,
    pub model_name: Option<String>,
}

/// The closed set of columns `update_session` may touch. Anything else is
/// unrepresentable — there is no string-keyed update path into the schema.
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    Context(String),
    LastUsed(String),
    HistoryJson(Option<String>),
    MetadataJson(Option<String>),
    MaxContextTokens(i64),
    SystemPrompt(Option<String>),
}

impl SessionUpdate {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            SessionUpdate::Context(_) => "context",
            SessionUpdate::LastUsed(_) => "last_used",
            SessionUpdate::HistoryJson(_) => "history_json",
            SessionUpdate::MetadataJson(_) => "metadata_json",
            SessionUpdate::MaxContextTokens(_) => "max_context_tokens",
            SessionUpdate::SystemPrompt(_) => "system_prompt",
        }
    }

    pub(crate) fn value(&self) -> Box<dyn rusqlite::ToSql + '_> {
        match self {
            SessionUpdate::Context(v) => Box::new(v),
            SessionUpdate::LastUsed(v) => Box::new(v),
            SessionUpdate::HistoryJson(v) => Box::new(v),
            SessionUpdate::MetadataJson(v) => Box::new(v),
            SessionUpdate::MaxContextTokens(v) => Box::new(v),
            SessionUpdate::SystemPrompt(v) => Box::new(v),
        }
    }
}

/// A message row.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: i64,
    pub role: Role,
    pub content: String,
    pub tokens: i64,
    pub timestamp: String,
    pub is_summary: bool,
}

/// A file reference row.
#[derive(Debug, Clone)]
pub struct FileReference {
    pub id: i64,
    pub message_id: i64,
    pub file_path: String,
    pub mode: FileMode,
    pub tokens: i64,
}

/// A compaction audit row.
#[derive(Debug, Clone)]
pub struct CompactionEvent {
    pub id: i64,
    pub timestamp: String,
    pub level: i64,
    pub tokens_before: i64,
    pub tokens_after: i64,
    pub tokens_freed: i64,
    pub strategy: CompactionStrategy,
    pub details: Option<String>,
}
