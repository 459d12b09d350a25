//! Emergency-compaction summarization. The LLM call is an external
//! collaborator behind a trait; the deterministic structural fallback lives
//! here too, so Level 3 always has something to write.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::{MessageRecord, Role};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_SUMMARY_MODEL: &str = "llama3.2:3b";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-message excerpt length fed to the summarizer.
const EXCERPT_CHARS: usize = 500;

const SUMMARY_PROMPT: &str = "\
Create a concise summary (max 300 words) of this conversation.

Preserve:
1. User's main goal/question
2. Key technical points discussed
3. Important code/file references
4. Decisions or conclusions reached

Omit:
- Verbose explanations
- Redundant information
- Greeting/politeness";

/// Natural-language summarizer seam. Implementations must never fail — an
/// empty string signals "no summary" and emergency compaction substitutes
/// [`fallback_summary`].
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[MessageRecord]) -> String;
}

/// Summarizer backed by an Ollama-style `/api/generate` endpoint. A small
/// model is enough here — the output is capped at ~300 words anyway.
pub struct OllamaSummarizer {
    client: reqwest::Client,
    base_url: String,
    model: String,
    cancel: CancellationToken,
}

impl OllamaSummarizer {
    pub fn new() -> Self {
        Self {
            client: http_client(DEFAULT_TIMEOUT),
            base_url: DEFAULT_BASE_URL.into(),
            model: DEFAULT_SUMMARY_MODEL.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        let url: String = url.into();
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }

    /// Cancellation signal honored by in-flight requests; a cancelled
    /// summarize resolves to the empty string.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl Default for OllamaSummarizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Summarizer for OllamaSummarizer {
    async fn summarize(&self, messages: &[MessageRecord]) -> String {
        if messages.is_empty() {
            return String::new();
        }

        let conversation = messages
            .iter()
            .map(|m| format!("{}: {}...", m.role.as_str().to_uppercase(), excerpt(&m.content)))
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = format!("{SUMMARY_PROMPT}\n\nCONVERSATION:\n{conversation}\n\nSUMMARY:");

        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": 0.3, "num_predict": 500 },
        });

        debug!(model = %self.model, messages = messages.len(), "requesting summary");

        let request = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body);
        let response = tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!("summary request cancelled");
                return String::new();
            }
            result = request.send() => result,
        };

        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(status = %response.status(), "summarizer endpoint refused");
                return String::new();
            }
            Err(e) => {
                warn!(error = %e, "summary request failed");
                return String::new();
            }
        };

        match response.json::<Value>().await {
            Ok(parsed) => parsed["response"].as_str().unwrap_or("").trim().to_string(),
            Err(e) => {
                warn!(error = %e, "malformed summarizer response");
                String::new()
            }
        }
    }
}

/// Structural summary used when no summarizer is configured or it returned
/// nothing: message counts, the opening of the conversation, and how much
/// code/file material it carried.
pub fn fallback_summary(messages: &[MessageRecord]) -> String {
    let user_count = messages.iter().filter(|m| m.role == Role::User).count();
    let assistant_count = messages.iter().filter(|m| m.role == Role::Assistant).count();

    let mut parts = vec![format!(
        "Conversation contained {user_count} user messages and {assistant_count} assistant responses."
    )];

    if let Some(first) = messages.first() {
        let opening: String = first.content.chars().take(200).collect();
        parts.push(format!("Started with: {opening}..."));
    }

    let code_count = messages.iter().filter(|m| m.content.contains("```")).count();
    if code_count > 0 {
        parts.push(format!("Included {code_count} code-related exchanges."));
    }

    let file_ref_count = messages
        .iter()
        .filter(|m| m.content.contains("@./") || m.content.contains("@/"))
        .count();
    if file_ref_count > 0 {
        parts.push(format!("Referenced files in {file_ref_count} messages."));
    }

    parts.join("\n")
}

fn excerpt(content: &str) -> String {
    content.chars().take(EXCERPT_CHARS).collect()
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, content: &str) -> MessageRecord {
        MessageRecord {
            id: 0,
            role,
            content: content.into(),
            tokens: 1,
            timestamp: "2026-01-01T00:00:00Z".into(),
            is_summary: false,
        }
    }

    #[test]
    fn fallback_counts_roles() {
        let messages = vec![
            msg(Role::User, "question one"),
            msg(Role::Assistant, "answer one"),
            msg(Role::User, "question two"),
        ];
        let summary = fallback_summary(&messages);
        assert!(summary.contains("2 user messages"));
        assert!(summary.contains("1 assistant responses"));
        assert!(summary.contains("Started with: question one..."));
    }

    #[test]
    fn fallback_notes_code_and_file_material() {
        let messages = vec![
            msg(Role::User, "look at @./src/main.rs"),
            msg(Role::Assistant, "```rust\nfn main() {}\n```"),
        ];
        let summary = fallback_summary(&messages);
        assert!(summary.contains("Included 1 code-related exchanges."));
        assert!(summary.contains("Referenced files in 1 messages."));
    }

    #[test]
    fn fallback_omits_absent_sections() {
        let messages = vec![msg(Role::User, "plain text only")];
        let summary = fallback_summary(&messages);
        assert!(!summary.contains("code-related"));
        assert!(!summary.contains("Referenced files"));
    }

    #[test]
    fn fallback_truncates_opening_to_200_chars() {
        let long = "x".repeat(500);
        let summary = fallback_summary(&[msg(Role::User, &long)]);
        let line = summary.lines().nth(1).unwrap();
        assert_eq!(line, format!("Started with: {}...", "x".repeat(200)));
    }

    #[test]
    fn excerpt_truncates_long_content() {
        let long = "y".repeat(900);
        assert_eq!(excerpt(&long).chars().count(), 500);
        assert_eq!(excerpt("short"), "short");
    }
}
