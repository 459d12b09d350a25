//! The three graduated compaction strategies. Each runs the steps its level
//! requires and records at most one audit event per invocation, with the
//! substeps captured in the event's details blob.

use serde_json::json;
use tracing::{debug, info};

use crate::engine::EngineConfig;
use crate::error::ContextError;
use crate::scoring::RelevanceScorer;
use crate::store::{CompactionStrategy, FileMode, SessionStore};
use crate::summarizer::{fallback_summary, Summarizer};
use crate::tokens::estimate_tokens;

/// Token floor for a recompressed file reference.
const SUMMARY_FLOOR_TOKENS: i64 = 50;
/// A structural summary runs about a tenth of the full content.
const SUMMARY_DIVISOR: i64 = 10;

pub const SUMMARY_MARKER: &str = "[Previous conversation summary]";

/// What a single strategy invocation did.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CompactionOutcome {
    pub tokens_freed: i64,
    pub recorded: bool,
}

/// Level 1: rewrite stale full-mode file references down to summary
/// budgets. Conversation history is untouched.
pub(crate) fn soft_compact(
    store: &SessionStore,
    session_id: &str,
    config: &EngineConfig,
) -> Result<CompactionOutcome, ContextError> {
    let tokens_before = store.get_message_tokens(session_id)?;

    let (compressed, saved) =
        compress_stale_files(store, session_id, config.stale_file_threshold)?;

    let tokens_after = store.get_message_tokens(session_id)?;
    let mut recorded = false;
    if compressed > 0 {
        store.record_compaction(
            session_id,
            1,
            tokens_before,
            tokens_after,
            CompactionStrategy::FileCompress,
            Some(&json!({ "files_compressed": compressed, "tokens_saved": saved }).to_string()),
        )?;
        recorded = true;
        info!(
            session = session_id,
            files = compressed,
            saved,
            "soft compaction compressed stale files"
        );
    }

    Ok(CompactionOutcome {
        tokens_freed: tokens_before - tokens_after,
        recorded,
    })
}

/// Level 2: soft pass first, then drop the least relevant older messages.
/// The newest `min_messages_to_keep` are never touched.
pub(crate) async fn hard_compact(
    store: &SessionStore,
    session_id: &str,
    config: &EngineConfig,
    scorer: &RelevanceScorer,
) -> Result<CompactionOutcome, ContextError> {
    let tokens_before = store.get_message_tokens(session_id)?;

    let (compressed, _) = compress_stale_files(store, session_id, config.stale_file_threshold)?;

    let messages = store.load_messages(session_id, None, true)?;
    let mut deleted = 0usize;
    let mut kept = messages.len();

    if messages.len() > config.min_messages_to_keep {
        let split = messages.len() - config.min_messages_to_keep;
        let (candidates, protected) = messages.split_at(split);

        let context = protected
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let scores = scorer.score_batch(candidates, &context).await;

        // Rank by score; equal scores prefer the newer message.
        let mut ranked: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.0.cmp(&a.0))
        });

        let keep_count = ((candidates.len() as f64 * config.relevance_keep_percentage).ceil()
            as usize)
            .max(1);
        let delete_ids: Vec<i64> = ranked
            .iter()
            .skip(keep_count)
            .map(|&(idx, _)| candidates[idx].id)
            .collect();

        debug!(
            session = session_id,
            candidates = candidates.len(),
            keep = keep_count,
            drop = delete_ids.len(),
            "ranked prune candidates"
        );

        deleted = store.delete_messages(&delete_ids)?;
        kept = messages.len() - deleted;
    }

    let tokens_after = store.get_message_tokens(session_id)?;
    let mut recorded = false;
    if deleted > 0 || compressed > 0 {
        store.record_compaction(
            session_id,
            2,
            tokens_before,
            tokens_after,
            CompactionStrategy::MessagePrune,
            Some(
                &json!({
                    "messages_deleted": deleted,
                    "messages_kept": kept,
                    "files_compressed": compressed,
                })
                .to_string(),
            ),
        )?;
        recorded = true;
        info!(
            session = session_id,
            deleted,
            kept,
            freed = tokens_before - tokens_after,
            "hard compaction pruned low-relevance messages"
        );
    }

    Ok(CompactionOutcome {
        tokens_freed: tokens_before - tokens_after,
        recorded,
    })
}

/// Level 3: recompress every remaining full-mode reference, then collapse
/// everything but the newest `emergency_keep` messages into one summary
/// message. The summarizer is best-effort; the structural fallback always
/// produces something.
pub(crate) async fn emergency_compact(
    store: &SessionStore,
    session_id: &str,
    config: &EngineConfig,
    summarizer: Option<&dyn Summarizer>,
) -> Result<CompactionOutcome, ContextError> {
    let tokens_before = store.get_message_tokens(session_id)?;

    // Every full-mode reference is fair game now.
    let (compressed, _) = compress_stale_files(store, session_id, 0)?;

    let messages = store.load_messages(session_id, None, true)?;
    let keep = config.emergency_keep.min(messages.len());
    let older = &messages[..messages.len() - keep];

    if older.is_empty() {
        let tokens_after = store.get_message_tokens(session_id)?;
        return Ok(CompactionOutcome {
            tokens_freed: tokens_before - tokens_after,
            recorded: false,
        });
    }

    let mut summary = match summarizer {
        Some(summarizer) => summarizer.summarize(older).await,
        None => String::new(),
    };
    if summary.trim().is_empty() {
        debug!(session = session_id, "summarizer unavailable, using structural fallback");
        summary = fallback_summary(older);
    }
    let summary_tokens = estimate_tokens(&summary);

    let delete_ids: Vec<i64> = older.iter().map(|m| m.id).collect();
    store.replace_with_summary(
        session_id,
        &delete_ids,
        &format!("{SUMMARY_MARKER}\n{summary}"),
        summary_tokens,
    )?;

    let tokens_after = store.get_message_tokens(session_id)?;
    store.record_compaction(
        session_id,
        3,
        tokens_before,
        tokens_after,
        CompactionStrategy::LlmSummary,
        Some(
            &json!({
                "messages_summarized": older.len(),
                "summary_tokens": summary_tokens,
                "files_compressed": compressed,
            })
            .to_string(),
        ),
    )?;
    info!(
        session = session_id,
        summarized = older.len(),
        summary_tokens,
        freed = tokens_before - tokens_after,
        "emergency compaction summarized history"
    );

    Ok(CompactionOutcome {
        tokens_freed: tokens_before - tokens_after,
        recorded: true,
    })
}

/// Shared recompression step: every stale full-mode reference drops to
/// `max(50, tokens / 10)`, clamped so a tiny reference never grows.
fn compress_stale_files(
    store: &SessionStore,
    session_id: &str,
    stale_threshold: usize,
) -> Result<(usize, i64), ContextError> {
    let stale = store.get_stale_files(session_id, stale_threshold, Some(FileMode::Full))?;

    let mut compressed = 0usize;
    let mut saved = 0i64;
    for reference in stale {
        let budget = SUMMARY_FLOOR_TOKENS
            .max(reference.tokens / SUMMARY_DIVISOR)
            .min(reference.tokens);
        if budget >= reference.tokens {
            continue;
        }
        store.update_file_reference_mode(reference.id, FileMode::Summary, budget)?;
        saved += reference.tokens - budget;
        compressed += 1;
        debug!(
            session = session_id,
            path = %reference.file_path,
            from = reference.tokens,
            to = budget,
            "compressed stale file reference"
        );
    }
    Ok((compressed, saved))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Role, SessionConfig};

    fn setup() -> (tempfile::TempDir, SessionStore, EngineConfig) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path().join("sessions.db")).unwrap();
        store.create_session(&SessionConfig::new("s1")).unwrap();
        let config = EngineConfig {
            max_tokens: 1_000,
            ..EngineConfig::default()
        };
        (dir, store, config)
    }

    fn pad_messages(store: &SessionStore, n: usize, tokens: i64) {
        for i in 0..n {
            store
                .save_message("s1", Role::User, &format!("filler {i}"), tokens, None, false)
                .unwrap();
        }
    }

    #[test]
    fn soft_compresses_stale_full_reference() {
        let (_dir, store, config) = setup();
        let msg = store.save_message("s1", Role::User, "old", 1_000, None, false).unwrap();
        store.track_file_reference(msg, "/a.py", FileMode::Full, 1_000).unwrap();
        pad_messages(&store, 5, 10);

        let outcome = soft_compact(&store, "s1", &config).unwrap();
        assert_eq!(outcome.tokens_freed, 900);
        assert!(outcome.recorded);

        let refs = store.get_file_references("s1", Some("/a.py")).unwrap();
        assert_eq!(refs[0].mode, FileMode::Summary);
        assert_eq!(refs[0].tokens, 100); // max(50, 1000 / 10)

        let history = store.get_compaction_history("s1", None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].strategy, CompactionStrategy::FileCompress);
        assert_eq!(history[0].tokens_freed, 900);
        assert!(history[0].details.as_ref().unwrap().contains("\"files_compressed\":1"));
    }

    #[test]
    fn soft_respects_token_floor() {
        let (_dir, store, config) = setup();
        let msg = store.save_message("s1", Role::User, "old", 300, None, false).unwrap();
        store.track_file_reference(msg, "/small.py", FileMode::Full, 300).unwrap();
        pad_messages(&store, 5, 10);

        soft_compact(&store, "s1", &config).unwrap();
        let refs = store.get_file_references("s1", Some("/small.py")).unwrap();
        assert_eq!(refs[0].tokens, 50); // floor, not 30
    }

    #[test]
    fn soft_with_nothing_stale_records_no_event() {
        let (_dir, store, config) = setup();
        pad_messages(&store, 3, 100);

        let outcome = soft_compact(&store, "s1", &config).unwrap();
        assert_eq!(outcome.tokens_freed, 0);
        assert!(!outcome.recorded);
        assert!(store.get_compaction_history("s1", None).unwrap().is_empty());
    }

    #[test]
    fn soft_twice_frees_nothing_second_time() {
        let (_dir, store, config) = setup();
        let msg = store.save_message("s1", Role::User, "old", 800, None, false).unwrap();
        store.track_file_reference(msg, "/a.py", FileMode::Full, 800).unwrap();
        pad_messages(&store, 5, 10);

        let first = soft_compact(&store, "s1", &config).unwrap();
        assert!(first.tokens_freed > 0);

        let second = soft_compact(&store, "s1", &config).unwrap();
        assert_eq!(second.tokens_freed, 0);
        assert!(!second.recorded);
        assert_eq!(store.get_compaction_history("s1", None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hard_prunes_lowest_relevance_candidate() {
        let (_dir, store, config) = setup();
        for content in [
            "apple banana",
            "dog elephant",
            "python code function",
            "python code class",
            "python code method",
            "python code variable",
        ] {
            store.save_message("s1", Role::User, content, 100, None, false).unwrap();
        }

        let scorer = RelevanceScorer::lexical();
        let outcome = hard_compact(&store, "s1", &config, &scorer).await.unwrap();
        assert_eq!(outcome.tokens_freed, 100);
        assert!(outcome.recorded);

        let remaining = store.load_messages("s1", None, true).unwrap();
        assert_eq!(remaining.len(), 5);
        // Both candidates scored 0 against the python-heavy tail; the tie
        // keeps the newer one.
        assert!(remaining.iter().all(|m| m.content != "apple banana"));
        assert!(remaining.iter().any(|m| m.content == "dog elephant"));

        let history = store.get_compaction_history("s1", None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].strategy, CompactionStrategy::MessagePrune);
        assert!(history[0].details.as_ref().unwrap().contains("\"messages_deleted\":1"));
        assert!(history[0].details.as_ref().unwrap().contains("\"messages_kept\":5"));
    }

    #[tokio::test]
    async fn hard_is_noop_at_or_below_protected_count() {
        let (_dir, store, config) = setup();
        pad_messages(&store, 4, 100);

        let scorer = RelevanceScorer::lexical();
        let outcome = hard_compact(&store, "s1", &config, &scorer).await.unwrap();
        assert_eq!(outcome.tokens_freed, 0);
        assert!(!outcome.recorded);
        assert_eq!(store.load_messages("s1", None, true).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn hard_protected_tail_untouched() {
        let (_dir, store, config) = setup();
        for i in 0..8 {
            store
                .save_message("s1", Role::User, &format!("unique topic {i}"), 50, None, false)
                .unwrap();
        }
        let before = store.load_messages("s1", None, true).unwrap();
        let tail_before: Vec<_> = before[4..].iter().map(|m| (m.id, m.content.clone())).collect();

        let scorer = RelevanceScorer::lexical();
        hard_compact(&store, "s1", &config, &scorer).await.unwrap();

        let after = store.load_messages("s1", None, true).unwrap();
        let tail_after: Vec<_> = after[after.len() - 4..]
            .iter()
            .map(|m| (m.id, m.content.clone()))
            .collect();
        assert_eq!(tail_before, tail_after);
    }

    #[tokio::test]
    async fn hard_runs_file_compression_prelude() {
        let (_dir, store, config) = setup();
        let msg = store.save_message("s1", Role::User, "with file", 600, None, false).unwrap();
        store.track_file_reference(msg, "/b.py", FileMode::Full, 500).unwrap();
        pad_messages(&store, 3, 10);

        // Only 4 messages: pruning is a no-op, but the stale file still
        // compresses and the invocation records one event.
        let scorer = RelevanceScorer::lexical();
        let outcome = hard_compact(&store, "s1", &config, &scorer).await.unwrap();
        assert_eq!(outcome.tokens_freed, 450);
        assert!(outcome.recorded);

        let history = store.get_compaction_history("s1", None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].level, 2);
        assert!(history[0].details.as_ref().unwrap().contains("\"files_compressed\":1"));
    }

    struct FixedSummarizer(String);

    #[async_trait::async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, _messages: &[crate::store::MessageRecord]) -> String {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn emergency_replaces_older_history_with_summary() {
        let (_dir, store, config) = setup();
        for i in 0..10 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store
                .save_message("s1", role, &format!("exchange {i}"), 90, None, false)
                .unwrap();
        }

        let outcome = emergency_compact(&store, "s1", &config, None).await.unwrap();
        assert!(outcome.recorded);
        assert!(outcome.tokens_freed > 0);

        let messages = store.load_messages("s1", None, true).unwrap();
        assert_eq!(messages.len(), 5); // 4 protected + 1 summary

        // Protected tail survives byte-identical.
        for (i, m) in messages[..4].iter().enumerate() {
            assert_eq!(m.content, format!("exchange {}", i + 6));
            assert_eq!(m.tokens, 90);
        }

        let summary = &messages[4];
        assert!(summary.is_summary);
        assert_eq!(summary.role, Role::System);
        assert!(summary.content.starts_with(SUMMARY_MARKER));
        assert!(summary.content.contains("user messages"));
        assert!(summary.content.contains("assistant responses"));

        let history = store.get_compaction_history("s1", None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].strategy, CompactionStrategy::LlmSummary);
        assert!(history[0].details.as_ref().unwrap().contains("\"messages_summarized\":6"));
    }

    #[tokio::test]
    async fn emergency_uses_configured_summarizer() {
        let (_dir, store, config) = setup();
        pad_messages(&store, 6, 100);

        let summarizer = FixedSummarizer("the model's summary".into());
        emergency_compact(&store, "s1", &config, Some(&summarizer)).await.unwrap();

        let messages = store.load_messages("s1", None, true).unwrap();
        let summary = messages.last().unwrap();
        assert_eq!(
            summary.content,
            format!("{SUMMARY_MARKER}\nthe model's summary")
        );
    }

    #[tokio::test]
    async fn emergency_empty_summarizer_output_falls_back() {
        let (_dir, store, config) = setup();
        pad_messages(&store, 6, 100);

        let summarizer = FixedSummarizer(String::new());
        emergency_compact(&store, "s1", &config, Some(&summarizer)).await.unwrap();

        let messages = store.load_messages("s1", None, true).unwrap();
        assert!(messages.last().unwrap().content.contains("user messages"));
    }

    #[tokio::test]
    async fn emergency_with_no_older_messages_stops() {
        let (_dir, store, config) = setup();
        pad_messages(&store, 4, 100);

        let outcome = emergency_compact(&store, "s1", &config, None).await.unwrap();
        assert!(!outcome.recorded);
        assert_eq!(store.load_messages("s1", None, true).unwrap().len(), 4);
        assert!(store.get_compaction_history("s1", None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn emergency_compresses_even_live_files() {
        let (_dir, store, config) = setup();
        pad_messages(&store, 5, 10);
        // Reference in the newest message — live for soft, but emergency
        // compresses everything.
        let msg = store.save_message("s1", Role::User, "fresh file", 910, None, false).unwrap();
        store.track_file_reference(msg, "/fresh.py", FileMode::Full, 900).unwrap();

        emergency_compact(&store, "s1", &config, None).await.unwrap();
        let refs = store.get_file_references("s1", Some("/fresh.py")).unwrap();
        assert_eq!(refs[0].mode, FileMode::Summary);
        assert_eq!(refs[0].tokens, 90);
    }
}
