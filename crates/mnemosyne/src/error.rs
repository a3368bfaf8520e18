//! Error types for Mnemosyne

use thiserror::Error;

/// Main error type for Mnemosyne operations
#[derive(Error, Debug)]
pub enum MnemosyneError {
    /// Vector store errors (LanceDB, collection lifecycle, search/insert)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Embedding provider errors
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Summarization provider errors
    #[error("Summarization error: {0}")]
    Summarization(String),

    /// Turn counter persistence errors
    #[error("Counter error: {0}")]
    Counter(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Mnemosyne operations
pub type Result<T> = std::result::Result<T, MnemosyneError>;
