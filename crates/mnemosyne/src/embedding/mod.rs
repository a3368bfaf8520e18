//! Embedding providers
//!
//! Text is vectorized through the [`EmbeddingProvider`] trait. The stock
//! implementation calls an OpenAI-compatible `/embeddings` endpoint over
//! HTTP with the API key taken from the environment.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::{MnemosyneError, Result};

/// Turns text into fixed-dimension vectors
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Dimension of the vectors this provider produces.
    fn dimension(&self) -> usize;

    /// Whether the provider is ready to serve requests.
    async fn is_available(&self) -> bool;

    /// Provider name for logs.
    fn name(&self) -> &str;
}

/// Embedding provider backed by an OpenAI-compatible HTTP API
#[derive(Debug)]
pub struct RemoteEmbedder {
    client: Client,
    config: EmbeddingConfig,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl RemoteEmbedder {
    /// Create a new remote embedder. The API key is read from the
    /// environment variable named in the config.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = env::var(&config.api_key_env).map_err(|_| {
            MnemosyneError::Config(format!("API key env var '{}' not set", config.api_key_env))
        })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MnemosyneError::Embedding(e.to_string()))?;

        tracing::info!(
            model = %config.model,
            api_url = %config.api_url,
            dimension = config.dimension,
            "RemoteEmbedder initialized"
        );

        Ok(Self {
            client,
            config: config.clone(),
            api_key,
        })
    }

    /// Call the embeddings endpoint with exponential backoff on 429s.
    async fn call_api(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: self.config.model.clone(),
            input: vec![text.to_string()],
        };

        let url = format!("{}/embeddings", self.config.api_url.trim_end_matches('/'));
        debug!("Calling embedding API at: {}", url);

        let mut last_error = None;
        let mut delay = Duration::from_secs(1);
        const MAX_RETRIES: u32 = 3;

        for attempt in 0..MAX_RETRIES {
            match self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&request)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();

                    if status == 429 {
                        warn!(
                            "Rate limited on attempt {}/{}, waiting {:?}",
                            attempt + 1,
                            MAX_RETRIES,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                        continue;
                    }

                    if !status.is_success() {
                        let error_text = response
                            .text()
                            .await
                            .unwrap_or_else(|_| "Unknown error".to_string());
                        return Err(MnemosyneError::Embedding(format!(
                            "API returned {status}: {error_text}"
                        )));
                    }

                    let parsed: EmbeddingResponse = response
                        .json()
                        .await
                        .map_err(|e| MnemosyneError::Embedding(e.to_string()))?;

                    return parsed
                        .data
                        .into_iter()
                        .next()
                        .map(|d| d.embedding)
                        .ok_or_else(|| {
                            MnemosyneError::Embedding("Empty embedding response".to_string())
                        });
                }
                Err(e) => {
                    let err_msg = e.to_string();
                    last_error = Some(err_msg.clone());
                    if attempt < MAX_RETRIES - 1 {
                        warn!(
                            "Request failed on attempt {}/{}, retrying: {}",
                            attempt + 1,
                            MAX_RETRIES,
                            err_msg
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(MnemosyneError::Embedding(format!(
            "Failed after {} retries: {}",
            MAX_RETRIES,
            last_error.unwrap_or_else(|| "Unknown error".to_string())
        )))
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedding = self.call_api(text).await?;

        if embedding.len() != self.config.dimension {
            return Err(MnemosyneError::Embedding(format!(
                "Dimension mismatch: expected {}, got {}",
                self.config.dimension,
                embedding.len()
            )));
        }

        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    async fn is_available(&self) -> bool {
        !self.api_key.is_empty() && !self.config.api_url.is_empty()
    }

    fn name(&self) -> &str {
        "remote"
    }
}
