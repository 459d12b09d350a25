//! Relevance scoring for message pruning. Semantic scoring via embedding
//! cosine when a backend is up, keyword Jaccard otherwise, with the same
//! boost rules on both paths.

use std::collections::HashSet;

use tracing::debug;

use crate::embedder::{cosine_similarity, EmbeddingClient};
use crate::store::{MessageRecord, Role};

const ASSISTANT_BOOST: f32 = 1.10;
const CODE_BLOCK_BOOST: f32 = 1.20;
const FILE_REF_BOOST: f32 = 1.15;

/// Scores a candidate message against a context string, in [0, 1].
pub struct RelevanceScorer {
    embedder: Option<Box<dyn EmbeddingClient>>,
}

impl RelevanceScorer {
    /// Keyword-only scorer. Used when vector scoring is disabled.
    pub fn lexical() -> Self {
        Self { embedder: None }
    }

    /// Scorer with a semantic backend. An unavailable backend degrades to
    /// keyword scoring at call time.
    pub fn semantic(embedder: Box<dyn EmbeddingClient>) -> Self {
        Self {
            embedder: Some(embedder),
        }
    }

    pub async fn score(&self, message: &MessageRecord, context: &str) -> f32 {
        let context_embedding = self.context_embedding(context).await;
        self.score_one(message, context, context_embedding.as_deref())
            .await
    }

    /// Score many candidates against one context. The context is embedded
    /// once; candidates whose own embedding fails fall back individually.
    pub async fn score_batch(&self, messages: &[MessageRecord], context: &str) -> Vec<f32> {
        let context_embedding = self.context_embedding(context).await;
        let mut scores = Vec::with_capacity(messages.len());
        for message in messages {
            scores.push(
                self.score_one(message, context, context_embedding.as_deref())
                    .await,
            );
        }
        scores
    }

    async fn context_embedding(&self, context: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        if !embedder.is_available().await {
            return None;
        }
        embedder.embed(context).await
    }

    async fn score_one(
        &self,
        message: &MessageRecord,
        context: &str,
        context_embedding: Option<&[f32]>,
    ) -> f32 {
        if let Some(context_embedding) = context_embedding {
            if let Some(embedder) = self.embedder.as_ref() {
                if let Some(message_embedding) = embedder.embed(&message.content).await {
                    let similarity =
                        cosine_similarity(Some(&message_embedding), Some(context_embedding));
                    let base = (similarity + 1.0) / 2.0;
                    return apply_boosts(message.role, &message.content, base);
                }
                debug!(message = message.id, "message embedding failed, falling back to keywords");
            }
        }
        keyword_score(message.role, &message.content, context)
    }
}

/// Jaccard similarity over keyword sets, boosted. The set view makes the
/// score insensitive to token order within a message.
pub fn keyword_score(role: Role, content: &str, context: &str) -> f32 {
    let message_words = keywords(content);
    let context_words = keywords(context);
    if message_words.is_empty() || context_words.is_empty() {
        return 0.0;
    }

    let intersection = message_words.intersection(&context_words).count();
    let union = message_words.union(&context_words).count();
    let base = intersection as f32 / union as f32;
    apply_boosts(role, content, base)
}

/// Alphanumeric tokens of length >= 3, lowercased.
fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|word| word.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

fn apply_boosts(role: Role, content: &str, base: f32) -> f32 {
    let mut score = base;
    if role == Role::Assistant {
        score *= ASSISTANT_BOOST;
    }
    if content.contains("```") {
        score *= CODE_BLOCK_BOOST;
    }
    if content.contains("@./") || content.contains("@/") {
        score *= FILE_REF_BOOST;
    }
    score.min(1.0)
}
