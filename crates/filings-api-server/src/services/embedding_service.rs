use crate::config::EmbeddingConfig;
use crate::utils::limiters::Limiters;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::debug;

/// Batch-capable embedding contract. Vectors are fixed-dimension f32.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// One vector per input text, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

const CACHE_MAX_ENTRIES: usize = 4096;

/// OpenAI-wire-format embedding client with a bounded in-process cache for
/// repeated query embeddings.
pub struct EmbeddingService {
    client: Client,
    config: EmbeddingConfig,
    cache: RwLock<HashMap<String, Vec<f32>>>,
    limiters: Arc<Limiters>,
}

impl EmbeddingService {
    pub fn new(config: EmbeddingConfig, limiters: Arc<Limiters>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("Failed to build embedding HTTP client")?;

        Ok(Self {
            client,
            config,
            cache: RwLock::new(HashMap::new()),
            limiters,
        })
    }

    async fn request_embeddings(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let (_permit, wait) = Limiters::acquire_timed(
            self.limiters.embedding.clone(),
            self.limiters.acquire_timeout,
            "embedding",
        )
        .await?;

        debug!(wait_ms = wait.as_millis() as u64, op = "embedding", "wait_queue");

        let exec_start = Instant::now();

        let url = format!("{}/v1/embeddings", self.config.base_url);
        let mut request_builder = self.client.post(&url).json(&EmbeddingRequest {
            input: inputs,
            model: &self.config.model,
        });

        if let Some(key) = &self.config.api_key {
            request_builder = request_builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = request_builder
            .send()
            .await
            .context("Failed to connect to embedding server")?;

        debug!(exec_ms = exec_start.elapsed().as_millis() as u64, op = "embedding", "exec");

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding API error ({}): {}", status, body);
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;

        if body.data.len() != inputs.len() {
            anyhow::bail!(
                "Embedding count mismatch: sent {}, got {}",
                inputs.len(),
                body.data.len()
            );
        }

        let mut vectors = Vec::with_capacity(body.data.len());
        for data in body.data {
            if data.embedding.len() != self.config.dimension {
                anyhow::bail!(
                    "Embedding dimension mismatch: expected {}, got {}",
                    self.config.dimension,
                    data.embedding.len()
                );
            }
            vectors.push(data.embedding);
        }

        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for EmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        {
            let cache = self.cache.read().await;
            if let Some(embedding) = cache.get(text) {
                debug!("Embedding cache hit ({} chars)", text.len());
                return Ok(embedding.clone());
            }
        }

        let inputs = vec![text.to_string()];
        let mut vectors = self.request_embeddings(&inputs).await?;
        let embedding = vectors.pop().context("Empty embedding response")?;

        {
            let mut cache = self.cache.write().await;
            if cache.len() >= CACHE_MAX_ENTRIES {
                cache.clear();
            }
            cache.insert(text.to_string(), embedding.clone());
        }

        Ok(embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        debug!(
            "Embedding {} texts in batches of {}",
            texts.len(),
            self.config.batch_size
        );

        let batch_size = self.config.batch_size.max(1);
        let mut all_vectors = Vec::with_capacity(texts.len());

        // Serial batches keep the limiter queue shallow.
        for batch in texts.chunks(batch_size) {
            let vectors = self.request_embeddings(batch).await?;
            all_vectors.extend(vectors);
        }

        Ok(all_vectors)
    }
}
