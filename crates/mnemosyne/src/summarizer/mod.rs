//! Summarization providers
//!
//! Condenses a block of conversation into a single long-term memory entry
//! via the [`SummaryProvider`] trait. The stock implementation calls an
//! OpenAI-compatible `/chat/completions` endpoint with the configured
//! instruction as the system message.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SummarizerConfig;
use crate::error::{MnemosyneError, Result};

/// Condenses conversation transcripts into memory entries
#[async_trait]
pub trait SummaryProvider: Send + Sync {
    /// Summarize a transcript. The returned text is guaranteed non-blank.
    async fn summarize(&self, transcript: &str) -> Result<String>;

    /// Whether the provider is ready to serve requests.
    async fn is_available(&self) -> bool;

    /// Provider name for logs.
    fn name(&self) -> &str;
}

/// Summarizer backed by an OpenAI-compatible HTTP API
#[derive(Debug)]
pub struct RemoteSummarizer {
    client: Client,
    config: SummarizerConfig,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

impl RemoteSummarizer {
    /// Create a new remote summarizer. The API key is read from the
    /// environment variable named in the config.
    pub fn new(config: &SummarizerConfig) -> Result<Self> {
        let api_key = env::var(&config.api_key_env).map_err(|_| {
            MnemosyneError::Config(format!("API key env var '{}' not set", config.api_key_env))
        })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MnemosyneError::Summarization(e.to_string()))?;

        tracing::info!(
            model = %config.model,
            api_url = %config.api_url,
            "RemoteSummarizer initialized"
        );

        Ok(Self {
            client,
            config: config.clone(),
            api_key,
        })
    }

    /// Call the chat completions endpoint with exponential backoff on 429s.
    async fn call_api(&self, transcript: &str) -> Result<String> {
        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: self.config.instruction.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: transcript.to_string(),
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let url = format!(
            "{}/chat/completions",
            self.config.api_url.trim_end_matches('/')
        );
        debug!("Calling summarization API at: {}", url);

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
                        return Err(MnemosyneError::Summarization(format!(
                            "API returned {status}: {error_text}"
                        )));
                    }

                    let completion: ChatCompletionResponse = response
                        .json()
                        .await
                        .map_err(|e| MnemosyneError::Summarization(e.to_string()))?;

                    return completion
                        .choices
                        .into_iter()
                        .next()
                        .map(|c| c.message.content)
                        .ok_or_else(|| {
                            MnemosyneError::Summarization("Empty response".to_string())
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

        Err(MnemosyneError::Summarization(format!(
            "Failed after {} retries: {}",
            MAX_RETRIES,
            last_error.unwrap_or_else(|| "Unknown error".to_string())
        )))
    }
}

#[async_trait]
impl SummaryProvider for RemoteSummarizer {
    async fn summarize(&self, transcript: &str) -> Result<String> {
        let summary = self.call_api(transcript).await?;
        let summary = summary.trim().to_string();

        if summary.is_empty() {
            return Err(MnemosyneError::Summarization(
                "Summarizer returned blank text".to_string(),
            ));
        }

        Ok(summary)
    }

    async fn is_available(&self) -> bool {
        !self.api_key.is_empty() && !self.config.api_url.is_empty()
    }

    fn name(&self) -> &str {
        "remote"
    }
}
