//! Embedding endpoint adapter. Wraps an Ollama-style HTTP API behind a
//! trait so the scorer can be tested with a mock, with an instance-scoped
//! LRU cache and a memoized liveness probe.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";
const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_CACHE_CAPACITY: usize = 256;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Embedding backend seam. Failures are expressed as `None` — the scorer
/// degrades to lexical matching, it never errors.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed a text. `None` for empty input or any backend failure.
    async fn embed(&self, text: &str) -> Option<Vec<f32>>;

    /// Whether the backend answers at all. Memoized per client.
    async fn is_available(&self) -> bool;
}

/// Client for an HTTP embedding endpoint speaking
/// `POST {model, prompt}` → `{"embedding": [f32...]}`.
///
/// Tries the primary model, then the fallback. Successful vectors are
/// cached in an LRU keyed by a SHA-256 of `model:text`.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    fallback_model: Option<String>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
    available: OnceCell<bool>,
    cancel: CancellationToken,
}

impl HttpEmbedder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: http_client(DEFAULT_TIMEOUT),
            base_url: DEFAULT_BASE_URL.into(),
            model: model.into(),
            fallback_model: None,
            cache: Mutex::new(LruCache::new(cache_capacity(DEFAULT_CACHE_CAPACITY))),
            available: OnceCell::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        let url: String = url.into();
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Model to try when the primary fails — typically the session's chat
    /// model, which may also support embeddings.
    pub fn with_fallback_model(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = Some(model.into());
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = Mutex::new(LruCache::new(cache_capacity(capacity)));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }

    /// Cancellation signal honored by in-flight requests; a cancelled embed
    /// resolves to `None`.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().expect("embed cache poisoned").len()
    }

    pub fn clear_cache(&self) {
        self.cache.lock().expect("embed cache poisoned").clear();
    }

    async fn request_embedding(&self, model: &str, text: &str) -> Option<Vec<f32>> {
        let request = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&EmbedRequest { model, prompt: text });

        let response = tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!(model, "embedding request cancelled");
                return None;
            }
            result = request.send() => match result {
                Ok(response) => response,
                Err(e) => {
                    debug!(model, error = %e, "embedding request failed");
                    return None;
                }
            },
        };

        if !response.status().is_success() {
            debug!(model, status = %response.status(), "embedding endpoint refused");
            return None;
        }

        match response.json::<EmbedResponse>().await {
            Ok(parsed) if !parsed.embedding.is_empty() => Some(parsed.embedding),
            Ok(_) => None,
            Err(e) => {
                debug!(model, error = %e, "malformed embedding response");
                None
            }
        }
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbedder {
    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        if text.trim().is_empty() {
            return None;
        }

        let models = [Some(&self.model), self.fallback_model.as_ref()];
        for model in models.into_iter().flatten() {
            let key = cache_key(model, text);
            let hit = {
                let mut cache = self.cache.lock().expect("embed cache poisoned");
                cache.get(&key).cloned()
            };
            if hit.is_some() {
                return hit;
            }

            if let Some(vector) = self.request_embedding(model, text).await {
                self.cache
                    .lock()
                    .expect("embed cache poisoned")
                    .put(key, vector.clone());
                return Some(vector);
            }
        }
        None
    }

    /// Probes the endpoint with a short sentinel embed and remembers the
    /// answer for the client's lifetime.
    async fn is_available(&self) -> bool {
        *self
            .available
            .get_or_init(|| async {
                let up = self.embed("ping").await.is_some();
                if !up {
                    warn!(
                        model = %self.model,
                        base_url = %self.base_url,
                        "embedding endpoint unavailable, relevance scoring will be lexical"
                    );
                }
                up
            })
            .await
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

fn cache_capacity(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1")
}

fn cache_key(model: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update(b":");
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cosine similarity in [-1, 1]. Zero when either side is `None`, empty, or
/// zero-norm, or when the lengths differ.
pub fn cosine_similarity(a: Option<&[f32]>, b: Option<&[f32]>) -> f32 {
    let (Some(a), Some(b)) = (a, b) else {
        return 0.0;
    };
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|y| y * y).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
