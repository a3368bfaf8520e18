use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{MnemosyneError, Result};

/// Main configuration structure for Mnemosyne
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Memory injection and retrieval configuration
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Summarization scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Vector store and counter storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Embedding provider configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Summarization provider configuration
    #[serde(default)]
    pub summarizer: SummarizerConfig,
}

impl Config {
    /// Load configuration from an explicit path, or search the default
    /// locations (`~/.mnemosyne/config.toml`, the platform config dir,
    /// `./config.toml`). Missing files fall back to defaults.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        if let Some(path) = path {
            tracing::info!("Loading config from: {}", path.display());
            return Self::from_file(&path);
        }

        let default_paths = [
            dirs::home_dir().map(|h| h.join(".mnemosyne").join("config.toml")),
            dirs::config_dir().map(|c| c.join("mnemosyne").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(path);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Config::default())
    }

    fn from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MnemosyneError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| MnemosyneError::Config(format!("Failed to parse config: {e}")))
    }
}

/// Memory injection and retrieval configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    /// Where retrieved memory is spliced: "user_prompt", "system_prompt",
    /// or "insert_system_prompt"
    #[serde(default = "default_injection_method")]
    pub injection_method: String,
    /// How many of the most recent memory blocks survive cleanup.
    /// Negative retains all, zero removes all.
    #[serde(default)]
    pub retention_length: i32,
    /// Number of memories retrieved per query
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Vector search timeout in seconds
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
    /// Opening marker of the injected memory block
    #[serde(default = "default_block_prefix")]
    pub block_prefix: String,
    /// Closing marker of the injected memory block
    #[serde(default = "default_block_suffix")]
    pub block_suffix: String,
    /// Per-entry template with `{time}` and `{content}` placeholders
    #[serde(default = "default_entry_format")]
    pub entry_format: String,
    /// Constrain search and storage to the active persona
    #[serde(default)]
    pub persona_filtering: bool,
    /// Persona used when the conversation has none
    #[serde(default)]
    pub default_persona_id: Option<String>,
    /// Maximum retained turns per session (0 = unbounded)
    #[serde(default)]
    pub max_history: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            injection_method: default_injection_method(),
            retention_length: 0,
            top_k: default_top_k(),
            search_timeout_secs: default_search_timeout_secs(),
            block_prefix: default_block_prefix(),
            block_suffix: default_block_suffix(),
            entry_format: default_entry_format(),
            persona_filtering: false,
            default_persona_id: None,
            max_history: 0,
        }
    }
}

fn default_injection_method() -> String {
    "user_prompt".to_string()
}

fn default_top_k() -> usize {
    5
}

fn default_search_timeout_secs() -> u64 {
    5
}

fn default_block_prefix() -> String {
    "<Mnemosyne>\nRelevant long-term memories:".to_string()
}

fn default_block_suffix() -> String {
    "</Mnemosyne>".to_string()
}

fn default_entry_format() -> String {
    "- [{time}] {content}".to_string()
}

/// Summarization scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Number of accumulated turns that triggers inline summarization
    #[serde(default = "default_pair_threshold")]
    pub pair_threshold: usize,
    /// Sweep wake-up interval in seconds
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Idle seconds since the last summary before the sweep fires.
    /// Non-positive disables time-based triggering.
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_secs: i64,
    /// Grace period granted to in-flight summaries on shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Upper bound on concurrently running summarization tasks
    #[serde(default = "default_max_concurrent_summaries")]
    pub max_concurrent_summaries: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pair_threshold: default_pair_threshold(),
            check_interval_secs: default_check_interval_secs(),
            idle_threshold_secs: default_idle_threshold_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            max_concurrent_summaries: default_max_concurrent_summaries(),
        }
    }
}

fn default_pair_threshold() -> usize {
    10
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_idle_threshold_secs() -> i64 {
    3600
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_max_concurrent_summaries() -> usize {
    4
}

/// Vector store and counter storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base directory for the vector store and the counter database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Collection (table) holding memory records
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            collection: default_collection(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".mnemosyne"))
        .unwrap_or_else(|| PathBuf::from(".mnemosyne"))
}

fn default_collection() -> String {
    "mnemosyne_memories".to_string()
}

/// Embedding provider configuration (OpenAI-compatible `/embeddings`)
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    /// API base URL
    #[serde(default)]
    pub api_url: String,
    /// Environment variable name for the API key
    #[serde(default = "default_embedding_api_key_env")]
    pub api_key_env: String,
    /// Model identifier
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Embedding dimension; must match the vector store schema
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
    /// Request timeout in seconds
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key_env: default_embedding_api_key_env(),
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_provider_timeout_secs(),
        }
    }
}

fn default_embedding_api_key_env() -> String {
    "EMBEDDING_API_KEY".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimension() -> usize {
    1024
}

fn default_provider_timeout_secs() -> u64 {
    30
}

/// Summarization provider configuration (OpenAI-compatible `/chat/completions`)
#[derive(Debug, Clone, Deserialize)]
pub struct SummarizerConfig {
    /// API base URL
    #[serde(default)]
    pub api_url: String,
    /// Environment variable name for the API key
    #[serde(default = "default_summarizer_api_key_env")]
    pub api_key_env: String,
    /// Model identifier
    #[serde(default = "default_summarizer_model")]
    pub model: String,
    /// Request timeout in seconds
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
    /// Instruction prepended as the system message
    #[serde(default = "default_instruction")]
    pub instruction: String,
    /// Completion cap for the condensed memory
    #[serde(default = "default_summary_max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature
    #[serde(default = "default_summary_temperature")]
    pub temperature: f32,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key_env: default_summarizer_api_key_env(),
            model: default_summarizer_model(),
            timeout_secs: default_provider_timeout_secs(),
            instruction: default_instruction(),
            max_tokens: default_summary_max_tokens(),
            temperature: default_summary_temperature(),
        }
    }
}

fn default_summarizer_api_key_env() -> String {
    "SUMMARIZER_API_KEY".to_string()
}

fn default_summarizer_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_instruction() -> String {
    "Condense the following multi-turn dialogue into one concise, objective \
     long-term memory entry that captures the key information:"
        .to_string()
}

fn default_summary_max_tokens() -> u32 {
    512
}

fn default_summary_temperature() -> f32 {
    0.2
}
