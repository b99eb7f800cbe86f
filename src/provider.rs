//! Embedding providers.
//!
//! [`EmbeddingProvider`] is the seam between the pipeline and whatever turns text into
//! vectors. Two implementations ship with the crate:
//!
//! - [`OpenAiEmbedder`]: any OpenAI-compatible `/embeddings` endpoint, with credential
//!   rotation, retry and timeout from [`crate::remote`].
//! - [`HashingEmbedder`]: offline feature hashing, for local runs without credentials.
//!
//! Providers never touch the embedding cache; callers decide what to store.

use async_trait::async_trait;
use futures::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::config::{EmbeddingKind, EmbeddingSettings};
use crate::error::{RagError, RagResult};
use crate::remote::{CredentialPool, RemoteClient, RemoteFailure, RetryPolicy};
use crate::search;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Identifier of the model producing the vectors. Cached vectors are keyed by it.
    fn model_id(&self) -> &str;

    /// Embed `texts`, returning one vector per input in input order.
    async fn embed_batch(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> RagResult<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| RagError::EmbeddingUnavailable {
            attempts: 1,
            reason: "provider returned no vector".to_string(),
        })
    }
}

/// Embed `texts` in batches of `batch_size` with at most `concurrency` calls in flight.
///
/// Yields `(offset, result)` per batch in input order, where `offset` is the index of the
/// batch's first text. A failed batch does not stop the following ones.
pub fn embed_all<'a>(
    provider: &'a dyn EmbeddingProvider,
    texts: &'a [String],
    batch_size: usize,
    concurrency: usize,
) -> impl Stream<Item = (usize, RagResult<Vec<Vec<f32>>>)> + Send + 'a {
    let step = batch_size.max(1);
    stream::iter(texts.chunks(step).enumerate().map(move |(index, chunk)| async move {
        (index * step, provider.embed_batch(chunk).await)
    }))
    .buffered(concurrency.max(1))
}

/// Build the provider described by `settings`.
pub fn from_settings(settings: &EmbeddingSettings) -> RagResult<Arc<dyn EmbeddingProvider>> {
    Ok(match settings.kind {
        EmbeddingKind::Hashing => Arc::new(HashingEmbedder::new(
            settings.dimensions.unwrap_or(HashingEmbedder::DEFAULT_DIMENSIONS),
        )),
        EmbeddingKind::OpenAi => Arc::new(OpenAiEmbedder::from_settings(settings)?),
    })
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible `POST /embeddings` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    client: RemoteClient,
    model: String,
    dimensions: Option<usize>,
    model_id: String,
}

impl OpenAiEmbedder {
    pub fn new(client: RemoteClient, model: &str, dimensions: Option<usize>) -> Self {
        let model_id = match dimensions {
            Some(d) => format!("{model}@{d}"),
            None => model.to_string(),
        };
        Self {
            client,
            model: model.to_string(),
            dimensions,
            model_id,
        }
    }

    pub fn from_settings(settings: &EmbeddingSettings) -> RagResult<Self> {
        let credentials = CredentialPool::new(
            settings.credentials(),
            Duration::from_secs(settings.rotation_window_secs),
        );
        if credentials.is_empty() {
            warn!(
                "No embedding credentials configured, calling {} without authorization",
                settings.api_base
            );
        } else {
            info!(
                "Embedding with {} via {} ({} credential(s))",
                settings.model,
                settings.api_base,
                credentials.len()
            );
        }
        let retry = RetryPolicy::new(
            settings.max_retries,
            Duration::from_millis(settings.backoff_base_ms),
            Duration::from_millis(settings.backoff_max_ms),
        );
        let client = RemoteClient::new(
            &settings.api_base,
            credentials,
            retry,
            Duration::from_secs(settings.timeout_secs),
        );
        Ok(Self::new(client, &settings.model, settings.dimensions))
    }

    /// Replace the wall clock used for credential selection.
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.client = self.client.with_clock(clock);
        self
    }
}

fn unavailable(failure: RemoteFailure) -> RagError {
    RagError::EmbeddingUnavailable {
        attempts: failure.attempts,
        reason: failure.reason,
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed_batch(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Embedding batch of {} text(s)", texts.len());

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.dimensions,
        };
        let response: EmbeddingResponse = self
            .client
            .post_json("embeddings", &request)
            .await
            .map_err(unavailable)?;

        if response.data.len() != texts.len() {
            return Err(RagError::EmbeddingUnavailable {
                attempts: 1,
                reason: format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    response.data.len()
                ),
            });
        }

        let mut data = response.data;
        if data.iter().all(|d| d.index.is_some()) {
            data.sort_by_key(|d| d.index);
        }
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Offline embedder: hashes tokens into a fixed number of signed buckets and L2-normalises.
///
/// Texts sharing vocabulary land close together. No semantics beyond that.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
    model_id: String,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMENSIONS: usize = 256;

    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            model_id: format!("hashing-{dimensions}"),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in search::tokenize(text) {
            let hash = blake3::hash(token.as_bytes());
            let bytes = hash.as_bytes();
            let bucket = u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]) as usize
                % self.dimensions;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed_batch(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}
