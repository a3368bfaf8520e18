//! Memory retrieval pipeline
//!
//! Embeds the incoming query, runs a filtered nearest-neighbor search with
//! a hard timeout, and returns the surviving hits. Callers decide what to
//! do with an error; the engine treats every failure as "no memories".

use std::sync::Arc;
use std::time::Duration;

use crate::config::MemoryConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{MnemosyneError, Result};
use crate::storage::{MemoryHit, SearchFilter, VectorStore};

pub struct RetrievalPipeline {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    top_k: usize,
    search_timeout: Duration,
}

impl RetrievalPipeline {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        config: &MemoryConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            top_k: config.top_k,
            search_timeout: Duration::from_secs(config.search_timeout_secs),
        }
    }

    /// Retrieve the memories most relevant to `query` under `filter`.
    /// Blank queries short-circuit to an empty result without touching the
    /// providers.
    pub async fn retrieve(&self, query: &str, filter: &SearchFilter) -> Result<Vec<MemoryHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let embedding = self.embedder.embed(query).await?;

        let hits = tokio::time::timeout(
            self.search_timeout,
            self.store.search(&embedding, filter, self.top_k),
        )
        .await
        .map_err(|_| {
            MnemosyneError::Storage(format!(
                "Vector search timed out after {:?}",
                self.search_timeout
            ))
        })??;

        tracing::debug!(
            hits = hits.len(),
            filter = %filter.to_expr(),
            "Retrieved memories"
        );

        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NewMemory;
    use crate::testing::{MockEmbedder, MockVectorStore};

    fn pipeline(
        embedder: Arc<MockEmbedder>,
        store: Arc<MockVectorStore>,
        timeout_secs: u64,
    ) -> RetrievalPipeline {
        let config = MemoryConfig {
            top_k: 2,
            search_timeout_secs: timeout_secs,
            ..MemoryConfig::default()
        };
        RetrievalPipeline::new(embedder, store, &config)
    }

    #[tokio::test]
    async fn test_retrieve_returns_closest_hits() {
        let embedder = Arc::new(MockEmbedder::new(8));
        let store = Arc::new(MockVectorStore::new());

        for topic in ["rust", "gardening", "cooking"] {
            store
                .insert(NewMemory::new(
                    "s1",
                    None,
                    format!("about {topic}"),
                    embedder.vector_for(topic),
                ))
                .await
                .unwrap();
        }

        let pipeline = pipeline(embedder, store, 5);
        let hits = pipeline.retrieve("rust", &SearchFilter::new()).await.unwrap();

        assert_eq!(hits.len(), 2); // top_k
        assert_eq!(hits[0].content, "about rust");
    }

    #[tokio::test]
    async fn test_blank_query_short_circuits() {
        let embedder = Arc::new(MockEmbedder::new(8));
        let store = Arc::new(MockVectorStore::new());
        let pipeline = pipeline(embedder.clone(), store, 5);

        let hits = pipeline.retrieve("   ", &SearchFilter::new()).await.unwrap();
        assert!(hits.is_empty());
        // The embedder was never called
        assert_eq!(embedder.call_count(), 0);
    }

    #[tokio::test]
    async fn test_embedding_failure_propagates() {
        let embedder = Arc::new(MockEmbedder::new(8));
        embedder.set_fail(true);
        let store = Arc::new(MockVectorStore::new());
        let pipeline = pipeline(embedder, store, 5);

        let result = pipeline.retrieve("query", &SearchFilter::new()).await;
        assert!(matches!(result, Err(MnemosyneError::Embedding(_))));
    }

    #[tokio::test]
    async fn test_search_failure_propagates() {
        let embedder = Arc::new(MockEmbedder::new(8));
        let store = Arc::new(MockVectorStore::new());
        store.set_fail_search(true);
        let pipeline = pipeline(embedder, store, 5);

        let result = pipeline.retrieve("query", &SearchFilter::new()).await;
        assert!(matches!(result, Err(MnemosyneError::Storage(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_search_times_out() {
        let embedder = Arc::new(MockEmbedder::new(8));
        let store = Arc::new(MockVectorStore::new());
        store.set_search_delay(Some(Duration::from_secs(30)));
        let pipeline = pipeline(embedder, store, 1);

        let result = pipeline.retrieve("query", &SearchFilter::new()).await;
        match result {
            Err(MnemosyneError::Storage(msg)) => assert!(msg.contains("timed out")),
            other => panic!("Expected timeout error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_filter_is_forwarded() {
        let embedder = Arc::new(MockEmbedder::new(8));
        let store = Arc::new(MockVectorStore::new());

        store
            .insert(NewMemory::new("mine", None, "visible", embedder.vector_for("q")))
            .await
            .unwrap();
        store
            .insert(NewMemory::new("other", None, "hidden", embedder.vector_for("q")))
            .await
            .unwrap();

        let pipeline = pipeline(embedder, store, 5);
        let filter = SearchFilter::new().with_session_id("mine");
        let hits = pipeline.retrieve("q", &filter).await.unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "visible");
    }
}
