//! The context engine: one instance per session. Appends persist through
//! the store, then the threshold ladder decides which compaction level (if
//! any) runs. Cooldown gates keep bursty usage from thrashing.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::compaction::{emergency_compact, hard_compact, soft_compact};
use crate::embedder::{EmbeddingClient, HttpEmbedder, DEFAULT_EMBEDDING_MODEL};
use crate::error::ContextError;
use crate::scoring::RelevanceScorer;
use crate::store::{CompactionEvent, FileMode, Role, SessionStore};
use crate::summarizer::Summarizer;

/// Tuning knobs for one engine instance. Defaults match a 64k-token
/// session with the standard 50/65/80 ladder.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard ceiling for this session's token budget.
    pub max_tokens: i64,
    /// Usage fraction at which stale files start compressing.
    pub soft_threshold: f64,
    /// Usage fraction at which low-relevance messages are pruned.
    pub hard_threshold: f64,
    /// Usage fraction at which history is summarized.
    pub emergency_threshold: f64,
    /// A file unreferenced in this many newest messages is stale.
    pub stale_file_threshold: usize,
    /// Newest messages no level-1/2 compaction may touch.
    pub min_messages_to_keep: usize,
    /// Newest messages protected during emergency compaction.
    pub emergency_keep: usize,
    /// Fraction of prune candidates kept, by relevance.
    pub relevance_keep_percentage: f64,
    /// Appends required between two compactions.
    pub min_messages_between_compaction: usize,
    /// Wall-clock gap required between two compactions.
    pub min_time_between_compaction: std::time::Duration,
    /// When false the scorer skips embeddings entirely.
    pub use_vector_scoring: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_tokens: 64_000,
            soft_threshold: 0.50,
            hard_threshold: 0.65,
            emergency_threshold: 0.80,
            stale_file_threshold: 3,
            min_messages_to_keep: 4,
            emergency_keep: 4,
            relevance_keep_percentage: 0.50,
            min_messages_between_compaction: 2,
            min_time_between_compaction: std::time::Duration::from_secs(30),
            use_vector_scoring: true,
        }
    }
}

/// Which rung of the ladder an invocation selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CompactionLevel {
    None,
    Soft,
    Hard,
    Emergency,
}

impl CompactionLevel {
    pub fn as_i64(self) -> i64 {
        match self {
            CompactionLevel::None => 0,
            CompactionLevel::Soft => 1,
            CompactionLevel::Hard => 2,
            CompactionLevel::Emergency => 3,
        }
    }
}

/// Threshold values, as percentages of the token ceiling.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub soft: f64,
    pub hard: f64,
    pub emergency: f64,
}

/// Snapshot of the engine for inspection and telemetry.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub session_id: String,
    pub max_tokens: i64,
    pub current_tokens: i64,
    pub usage_percentage: f64,
    pub message_count: usize,
    pub thresholds: Thresholds,
    pub level: CompactionLevel,
    pub can_compact: bool,
    pub messages_since_compaction: usize,
    pub last_compaction: Option<CompactionEvent>,
}

/// Aggregate view over the session's compaction audit trail.
#[derive(Debug, Clone)]
pub struct CompactionStats {
    pub total_compactions: usize,
    pub total_tokens_freed: i64,
    pub soft_count: usize,
    pub hard_count: usize,
    pub emergency_count: usize,
    /// Up to the five most recent events, newest first.
    pub recent: Vec<CompactionEvent>,
}

/// Session-scoped context manager. Owns the store handle, the scorer, and
/// the cooldown state; external collaborators (embedder, summarizer) are
/// best-effort and never fail a user-visible append.
pub struct ContextEngine {
    store: SessionStore,
    session_id: String,
    config: EngineConfig,
    scorer: RelevanceScorer,
    summarizer: Option<Box<dyn Summarizer>>,
    last_compaction_time: Option<DateTime<Utc>>,
    messages_since_compaction: usize,
}

impl ContextEngine {
    /// Build an engine for `session_id`. The time half of the cooldown is
    /// seeded from the session's most recent compaction event, so a
    /// restarted process doesn't immediately re-compact.
    pub fn new(
        store: SessionStore,
        session_id: impl Into<String>,
        config: EngineConfig,
    ) -> Result<Self, ContextError> {
        let session_id = session_id.into();
        let last_compaction_time = store
            .get_last_compaction(&session_id)?
            .and_then(|event| DateTime::parse_from_rfc3339(&event.timestamp).ok())
            .map(|ts| ts.with_timezone(&Utc));

        let scorer = if config.use_vector_scoring {
            RelevanceScorer::semantic(Box::new(HttpEmbedder::new(DEFAULT_EMBEDDING_MODEL)))
        } else {
            RelevanceScorer::lexical()
        };

        Ok(Self {
            store,
            session_id,
            config,
            scorer,
            summarizer: None,
            last_compaction_time,
            messages_since_compaction: 0,
        })
    }

    /// Replace the default embedding client. Ignored when vector scoring is
    /// disabled.
    pub fn with_embedder(mut self, embedder: Box<dyn EmbeddingClient>) -> Self {
        if self.config.use_vector_scoring {
            self.scorer = RelevanceScorer::semantic(embedder);
        }
        self
    }

    pub fn with_summarizer(mut self, summarizer: Box<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Persist a message (and its file references), then let the threshold
    /// ladder decide whether to compact. Returns the new message id.
    pub async fn append(
        &mut self,
        role: Role,
        content: &str,
        tokens: i64,
        file_refs: &[(&str, FileMode, i64)],
    ) -> Result<i64, ContextError> {
        let message_id = self
            .store
            .save_message(&self.session_id, role, content, tokens, None, false)?;
        for &(path, mode, ref_tokens) in file_refs {
            self.store
                .track_file_reference(message_id, path, mode, ref_tokens)?;
        }
        self.store.touch_session(&self.session_id)?;
        self.messages_since_compaction += 1;

        self.auto_compact().await?;
        Ok(message_id)
    }

    /// Evaluate the ladder and run the selected level. `None` means the
    /// cooldown suppressed the check entirely; `Some(CompactionLevel::None)`
    /// means usage is below the soft threshold.
    pub async fn auto_compact(&mut self) -> Result<Option<CompactionLevel>, ContextError> {
        if !self.can_compact() {
            debug!(
                session = %self.session_id,
                messages_since = self.messages_since_compaction,
                "compaction suppressed by cooldown"
            );
            return Ok(None);
        }

        let level = self.determine_level()?;
        if level != CompactionLevel::None {
            info!(session = %self.session_id, level = level.as_i64(), "running compaction");
        }
        let outcome = self.run_level(level).await?;
        if outcome.recorded {
            self.reset_cooldown();
        }
        Ok(Some(level))
    }

    /// Run one level regardless of cooldown. Returns the tokens freed.
    pub async fn force_compact(&mut self, level: CompactionLevel) -> Result<i64, ContextError> {
        let outcome = self.run_level(level).await?;
        if outcome.recorded {
            self.reset_cooldown();
        }
        Ok(outcome.tokens_freed)
    }

    async fn run_level(
        &mut self,
        level: CompactionLevel,
    ) -> Result<crate::compaction::CompactionOutcome, ContextError> {
        match level {
            CompactionLevel::None => Ok(Default::default()),
            CompactionLevel::Soft => soft_compact(&self.store, &self.session_id, &self.config),
            CompactionLevel::Hard => {
                hard_compact(&self.store, &self.session_id, &self.config, &self.scorer).await
            }
            CompactionLevel::Emergency => {
                emergency_compact(
                    &self.store,
                    &self.session_id,
                    &self.config,
                    self.summarizer.as_deref(),
                )
                .await
            }
        }
    }

    pub fn status(&self) -> Result<EngineStatus, ContextError> {
        let current_tokens = self.store.get_message_tokens(&self.session_id)?;
        let message_count = self.store.load_messages(&self.session_id, None, true)?.len();
        Ok(EngineStatus {
            session_id: self.session_id.clone(),
            max_tokens: self.config.max_tokens,
            current_tokens,
            usage_percentage: self.usage_of(current_tokens) * 100.0,
            message_count,
            thresholds: Thresholds {
                soft: self.config.soft_threshold * 100.0,
                hard: self.config.hard_threshold * 100.0,
                emergency: self.config.emergency_threshold * 100.0,
            },
            level: level_for(&self.config, self.usage_of(current_tokens)),
            can_compact: self.can_compact(),
            messages_since_compaction: self.messages_since_compaction,
            last_compaction: self.store.get_last_compaction(&self.session_id)?,
        })
    }

    pub fn stats(&self) -> Result<CompactionStats, ContextError> {
        let history = self.store.get_compaction_history(&self.session_id, None)?;
        let count_level = |level: i64| history.iter().filter(|e| e.level == level).count();
        Ok(CompactionStats {
            total_compactions: history.len(),
            total_tokens_freed: self.store.get_total_tokens_freed(&self.session_id)?,
            soft_count: count_level(1),
            hard_count: count_level(2),
            emergency_count: count_level(3),
            recent: history.into_iter().take(5).collect(),
        })
    }

    fn determine_level(&self) -> Result<CompactionLevel, ContextError> {
        let current = self.store.get_message_tokens(&self.session_id)?;
        Ok(level_for(&self.config, self.usage_of(current)))
    }

    fn usage_of(&self, current_tokens: i64) -> f64 {
        if self.config.max_tokens <= 0 {
            return 0.0;
        }
        current_tokens as f64 / self.config.max_tokens as f64
    }

    fn can_compact(&self) -> bool {
        if self.messages_since_compaction < self.config.min_messages_between_compaction {
            return false;
        }
        match self.last_compaction_time {
            Some(last) => {
                let min = chrono::Duration::from_std(self.config.min_time_between_compaction)
                    .unwrap_or(chrono::Duration::MAX);
                Utc::now().signed_duration_since(last) >= min
            }
            None => true,
        }
    }

    fn reset_cooldown(&mut self) {
        self.last_compaction_time = Some(Utc::now());
        self.messages_since_compaction = 0;
    }
}

fn level_for(config: &EngineConfig, usage: f64) -> CompactionLevel {
    if usage >= config.emergency_threshold {
        CompactionLevel::Emergency
    } else if usage >= config.hard_threshold {
        CompactionLevel::Hard
    } else if usage >= config.soft_threshold {
        CompactionLevel::Soft
    } else {
        CompactionLevel::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CompactionStrategy, SessionConfig};

    fn test_config() -> EngineConfig {
        EngineConfig {
            max_tokens: 1_000,
            use_vector_scoring: false,
            ..EngineConfig::default()
        }
    }

    fn engine_with(config: EngineConfig) -> (tempfile::TempDir, ContextEngine) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path().join("sessions.db")).unwrap();
        store.create_session(&SessionConfig::new("s1")).unwrap();
        let engine = ContextEngine::new(store, "s1", config).unwrap();
        (dir, engine)
    }

    #[tokio::test]
    async fn no_compaction_below_soft_threshold() {
        let (_dir, mut engine) = engine_with(test_config());
        engine.append(Role::User, "a question", 400, &[]).await.unwrap();

        let status = engine.status().unwrap();
        assert_eq!(status.current_tokens, 400);
        assert!((status.usage_percentage - 40.0).abs() < 1e-9);
        assert_eq!(status.level, CompactionLevel::None);
        assert_eq!(status.message_count, 1);
        assert!(status.last_compaction.is_none());
        assert_eq!(engine.stats().unwrap().total_compactions, 0);
    }

    #[tokio::test]
    async fn forced_soft_compaction_compresses_stale_file() {
        let (_dir, mut engine) = engine_with(test_config());
        // Seed through the store so nothing compacts during setup.
        let store = engine.store();
        let old = store.save_message("s1", Role::User, "old", 1_000, None, false).unwrap();
        store.track_file_reference(old, "/a.py", FileMode::Full, 1_000).unwrap();
        for i in 0..5 {
            store
                .save_message("s1", Role::User, &format!("note {i}"), 10, None, false)
                .unwrap();
        }

        let freed = engine.force_compact(CompactionLevel::Soft).await.unwrap();
        assert_eq!(freed, 900);

        let refs = engine.store().get_file_references("s1", Some("/a.py")).unwrap();
        assert_eq!(refs[0].mode, FileMode::Summary);
        assert_eq!(refs[0].tokens, 100);

        let history = engine.store().get_compaction_history("s1", None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].strategy, CompactionStrategy::FileCompress);
        assert_eq!(history[0].tokens_freed, 900);
    }

    #[tokio::test]
    async fn append_triggers_soft_compaction_organically() {
        let (_dir, mut engine) = engine_with(test_config());
        engine.append(Role::User, "intro", 100, &[]).await.unwrap();
        engine
            .append(Role::User, "here is @./lib.rs", 430, &[("/lib.rs", FileMode::Full, 400)])
            .await
            .unwrap();
        for i in 0..3 {
            engine
                .append(Role::User, &format!("follow-up {i}"), 10, &[])
                .await
                .unwrap();
        }

        // The reference went stale once three newer messages landed; the
        // soft pass on the last append compressed it.
        let history = engine.store().get_compaction_history("s1", None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].strategy, CompactionStrategy::FileCompress);
        assert_eq!(history[0].tokens_freed, 350);
        assert_eq!(engine.status().unwrap().current_tokens, 210);
    }

    #[tokio::test]
    async fn cooldown_suppresses_thrash() {
        let config = EngineConfig {
            min_messages_between_compaction: 3,
            ..test_config()
        };
        let (_dir, mut engine) = engine_with(config);

        for i in 0..10 {
            engine
                .append(Role::User, &format!("chunk {i}"), 80, &[])
                .await
                .unwrap();
        }

        // Usage climbed through the hard threshold on the way, but the
        // message-count and wall-clock gates allow exactly one prune.
        let history = engine.store().get_compaction_history("s1", None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].strategy, CompactionStrategy::MessagePrune);
    }

    #[tokio::test]
    async fn few_appends_produce_at_most_one_event() {
        let config = EngineConfig {
            min_messages_between_compaction: 5,
            ..test_config()
        };
        let (_dir, mut engine) = engine_with(config);

        // Threshold exceeded immediately, but fewer appends than the gate.
        for _ in 0..4 {
            engine.append(Role::User, "big", 300, &[]).await.unwrap();
        }
        assert!(engine.store().get_compaction_history("s1", None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn auto_compact_returns_none_under_cooldown() {
        let (_dir, mut engine) = engine_with(test_config());
        engine.append(Role::User, "only one", 900, &[]).await.unwrap();

        // One append < min_messages_between_compaction.
        assert_eq!(engine.auto_compact().await.unwrap(), None);
    }

    #[tokio::test]
    async fn time_cooldown_seeded_from_audit_trail() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path().join("sessions.db")).unwrap();
        store.create_session(&SessionConfig::new("s1")).unwrap();
        store
            .record_compaction("s1", 1, 1_000, 500, CompactionStrategy::FileCompress, None)
            .unwrap();

        let config = EngineConfig {
            min_messages_between_compaction: 0,
            ..test_config()
        };
        let engine = ContextEngine::new(store, "s1", config).unwrap();
        // The event was seconds ago; the 30s gate holds.
        assert!(!engine.status().unwrap().can_compact);

        let store = SessionStore::open(dir.path().join("sessions.db")).unwrap();
        let config = EngineConfig {
            min_messages_between_compaction: 0,
            min_time_between_compaction: std::time::Duration::ZERO,
            ..test_config()
        };
        let engine = ContextEngine::new(store, "s1", config).unwrap();
        assert!(engine.status().unwrap().can_compact);
    }

    #[tokio::test]
    async fn unreachable_embedder_degrades_instead_of_failing() {
        let config = EngineConfig {
            max_tokens: 1_000,
            use_vector_scoring: true,
            min_messages_between_compaction: 0,
            min_time_between_compaction: std::time::Duration::ZERO,
            ..EngineConfig::default()
        };
        let (_dir, mut engine) = engine_with(config);
        let dead = crate::embedder::HttpEmbedder::new("nomic-embed-text")
            .with_base_url("http://127.0.0.1:9")
            .with_timeout(std::time::Duration::from_millis(200));
        engine = engine.with_embedder(Box::new(dead));

        let store = engine.store();
        for i in 0..8 {
            store
                .save_message("s1", Role::User, &format!("topic {i}"), 90, None, false)
                .unwrap();
        }

        // 720/1000 sits in the hard band; scoring falls back to keywords.
        let level = engine.auto_compact().await.unwrap();
        assert_eq!(level, Some(CompactionLevel::Hard));
        let history = engine.store().get_compaction_history("s1", None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].strategy, CompactionStrategy::MessagePrune);
    }

    #[tokio::test]
    async fn status_and_stats_reflect_history() {
        let (_dir, mut engine) = engine_with(test_config());
        let store = engine.store();
        let old = store.save_message("s1", Role::User, "old", 700, None, false).unwrap();
        store.track_file_reference(old, "/a.py", FileMode::Full, 600).unwrap();
        for i in 0..6 {
            store
                .save_message("s1", Role::User, &format!("note {i}"), 10, None, false)
                .unwrap();
        }

        engine.force_compact(CompactionLevel::Soft).await.unwrap();
        engine.force_compact(CompactionLevel::Hard).await.unwrap();

        let stats = engine.stats().unwrap();
        assert_eq!(stats.total_compactions, 2);
        assert_eq!(stats.soft_count, 1);
        assert_eq!(stats.hard_count, 1);
        assert_eq!(stats.emergency_count, 0);
        assert!(stats.total_tokens_freed > 0);
        assert_eq!(stats.recent.len(), 2);
        assert_eq!(stats.recent[0].level, 2); // newest first

        let status = engine.status().unwrap();
        assert_eq!(status.last_compaction.unwrap().level, 2);
        assert_eq!(status.messages_since_compaction, 0);
        assert_eq!(status.thresholds.soft, 50.0);
        assert_eq!(status.thresholds.hard, 65.0);
        assert_eq!(status.thresholds.emergency, 80.0);
    }

    #[tokio::test]
    async fn emergency_level_selected_above_threshold() {
        let config = EngineConfig {
            min_messages_between_compaction: 0,
            ..test_config()
        };
        let (_dir, mut engine) = engine_with(config);
        let store = engine.store();
        for i in 0..10 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store
                .save_message("s1", role, &format!("exchange {i}"), 90, None, false)
                .unwrap();
        }

        let level = engine.auto_compact().await.unwrap();
        assert_eq!(level, Some(CompactionLevel::Emergency));

        let messages = engine.store().load_messages("s1", None, true).unwrap();
        assert_eq!(messages.len(), 5);
        let summary = messages.last().unwrap();
        assert!(summary.is_summary);
        assert!(summary.content.starts_with("[Previous conversation summary]"));
    }

    #[tokio::test]
    async fn force_compact_at_level_none_is_noop() {
        let (_dir, mut engine) = engine_with(test_config());
        engine.append(Role::User, "hello", 100, &[]).await.unwrap();
        assert_eq!(engine.force_compact(CompactionLevel::None).await.unwrap(), 0);
    }
}
