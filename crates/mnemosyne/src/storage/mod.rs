//! Vector store gateway
//!
//! The engine talks to its vector database through the [`VectorStore`]
//! trait so the backend can be swapped (or mocked) without touching the
//! retrieval or summarization paths.

pub mod filter;
pub mod lance;

pub use filter::SearchFilter;
pub use lance::LanceGateway;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A memory to be persisted; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub session_id: String,
    pub persona_id: Option<String>,
    pub content: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl NewMemory {
    pub fn new(
        session_id: impl Into<String>,
        persona_id: Option<String>,
        content: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            persona_id,
            content: content.into(),
            embedding,
            created_at: Utc::now(),
        }
    }
}

/// One search result row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHit {
    pub memory_id: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Vector distance reported by the store; smaller is closer
    pub distance: f32,
}

/// Backend-agnostic vector store interface
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Persist a memory and return its assigned id.
    async fn insert(&self, memory: NewMemory) -> Result<i64>;

    /// Nearest-neighbor search constrained by `filter`, best matches first.
    async fn search(
        &self,
        embedding: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<MemoryHit>>;

    /// Make previously inserted rows durable and visible to search.
    async fn flush(&self) -> Result<()>;

    /// Total stored memories.
    async fn count(&self) -> Result<usize>;

    /// Whether the backend is reachable right now.
    async fn is_available(&self) -> bool;

    /// Backend name for logs.
    fn name(&self) -> &str;
}
