//! Embedding service abstraction and providers.
//!
//! - `OpenAiEmbeddings` talks to any OpenAI-compatible `/embeddings` endpoint.
//! - `HashingEmbedder` is deterministic and offline (character trigram feature hashing).

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::EmbeddingError;

/// An embedding service: one fixed-dimension vector per input string.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier, part of the embedding cache key.
    fn model_name(&self) -> &str;

    /// Vector dimension this provider produces.
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts. Output order matches input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

// ── OpenAI-compatible HTTP provider ─────────────────────────────────

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// OpenAI-compatible embedding provider.
pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbeddings {
    pub fn new(api_key: SecretString, model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: OPENAI_BASE_URL.to_string(),
            model: model.into(),
            dimensions,
        }
    }

    /// Point at a different OpenAI-compatible server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: Some(self.dimensions),
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbeddingError::RequestFailed {
                provider: "openai".to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("HTTP {status}: {detail}"),
            });
        }

        let mut parsed: EmbeddingResponse =
            response
                .json()
                .await
                .map_err(|e| EmbeddingError::InvalidResponse {
                    provider: "openai".to_string(),
                    reason: e.to_string(),
                })?;

        if parsed.data.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                actual: parsed.data.len(),
            });
        }

        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

impl std::fmt::Debug for OpenAiEmbeddings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbeddings")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

// ── Offline hashing embedder ────────────────────────────────────────

/// Deterministic embedder for offline operation and tests.
///
/// Each lowercase word contributes its padded character trigrams, hashed into
/// signed buckets. Texts sharing word fragments ("query", "queries") land close.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    model: String,
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            model: format!("hashing-trigram-{dimensions}"),
            dimensions: dimensions.max(1),
        }
    }

    /// Embed one text synchronously.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let padded: Vec<char> = format!(" {} ", word.to_lowercase()).chars().collect();
            for trigram in padded.windows(3) {
                let hash = feature_hash(trigram.iter().collect::<String>().as_bytes());
                let bucket = (hash % self.dimensions as u64) as usize;
                let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
                vector[bucket] += sign;
            }
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// First eight bytes of the SHA-256 digest, stable across platforms and releases.
fn feature_hash(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::similarity::cosine_similarity;

    #[test]
    fn hashing_embedder_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed_text("Slow database queries");
        let b = embedder.embed_text("Slow database queries");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hashing_embedder_ranks_related_text_higher() {
        let embedder = HashingEmbedder::new(256);
        let query = embedder.embed_text("python exception handling");
        let related = embedder.embed_text("handling exceptions in python code");
        let unrelated = embedder.embed_text("kubernetes ingress certificates");
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let embedder = HashingEmbedder::new(8);
        assert!(embedder.embed_text("   ").iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn batch_embedding_preserves_order() {
        let embedder = HashingEmbedder::new(32);
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let vectors = embedder.embed(&texts).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], embedder.embed_text("alpha"));
        assert_eq!(vectors[1], embedder.embed_text("beta"));
    }
}
