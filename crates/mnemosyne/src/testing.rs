//! Test doubles for the engine's collaborators
//!
//! Deterministic, dependency-free implementations of the provider and
//! storage traits. Failure injection is built in so degradation paths can
//! be exercised without a real backend.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::embedding::EmbeddingProvider;
use crate::error::{MnemosyneError, Result};
use crate::storage::{MemoryHit, NewMemory, SearchFilter, VectorStore};
use crate::summarizer::SummaryProvider;

/// Embedder producing deterministic pseudo-random vectors from a hash of
/// the input text. Equal inputs embed equally; different inputs almost
/// never collide.
pub struct MockEmbedder {
    dimension: usize,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        (0..self.dimension)
            .map(|i| {
                let mut hasher = DefaultHasher::new();
                text.hash(&mut hasher);
                i.hash(&mut hasher);
                // Map the hash into [-1, 1]
                (hasher.finish() % 2000) as f32 / 1000.0 - 1.0
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(MnemosyneError::Embedding("mock embedder failure".to_string()));
        }
        Ok(self.vector_for(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn is_available(&self) -> bool {
        !self.fail.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

struct StoredMemory {
    memory_id: i64,
    memory: NewMemory,
}

/// In-memory vector store with linear search and real filter evaluation.
pub struct MockVectorStore {
    records: Mutex<Vec<StoredMemory>>,
    next_id: AtomicI64,
    fail_insert: AtomicBool,
    fail_search: AtomicBool,
    flushes: AtomicUsize,
    search_delay: Mutex<Option<Duration>>,
}

impl MockVectorStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            fail_insert: AtomicBool::new(false),
            fail_search: AtomicBool::new(false),
            flushes: AtomicUsize::new(0),
            search_delay: Mutex::new(None),
        }
    }

    pub fn set_fail_insert(&self, fail: bool) {
        self.fail_insert.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_search(&self, fail: bool) {
        self.fail_search.store(fail, Ordering::SeqCst);
    }

    /// Delay every search by this much, for exercising timeout handling.
    pub fn set_search_delay(&self, delay: Option<Duration>) {
        *self.search_delay.lock().expect("lock poisoned") = delay;
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn contents(&self) -> Vec<String> {
        self.records
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|r| r.memory.content.clone())
            .collect()
    }

    fn matches(filter: &SearchFilter, stored: &StoredMemory) -> bool {
        if stored.memory_id <= 0 {
            return false;
        }
        if let Some(session_id) = filter.session_id() {
            if stored.memory.session_id != session_id {
                return false;
            }
        }
        if let Some(persona_id) = filter.persona_id() {
            if stored.memory.persona_id.as_deref() != Some(persona_id) {
                return false;
            }
        }
        true
    }

    fn distance(a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt()
    }
}

impl Default for MockVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for MockVectorStore {
    async fn insert(&self, memory: NewMemory) -> Result<i64> {
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(MnemosyneError::Storage("mock insert failure".to_string()));
        }
        let memory_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.records
            .lock()
            .expect("lock poisoned")
            .push(StoredMemory { memory_id, memory });
        Ok(memory_id)
    }

    async fn search(
        &self,
        embedding: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<MemoryHit>> {
        let delay = *self.search_delay.lock().expect("lock poisoned");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_search.load(Ordering::SeqCst) {
            return Err(MnemosyneError::Storage("mock search failure".to_string()));
        }

        let records = self.records.lock().expect("lock poisoned");
        let mut hits: Vec<MemoryHit> = records
            .iter()
            .filter(|r| Self::matches(filter, r))
            .map(|r| MemoryHit {
                memory_id: r.memory_id,
                content: r.memory.content.clone(),
                created_at: r.memory.created_at,
                distance: Self::distance(embedding, &r.memory.embedding),
            })
            .collect();

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.records.lock().expect("lock poisoned").len())
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Summarizer returning a canned response and recording what it was asked
/// to condense.
pub struct MockSummarizer {
    response: Mutex<String>,
    fail: AtomicBool,
    transcripts: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
}

impl MockSummarizer {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: Mutex::new(response.into()),
            fail: AtomicBool::new(false),
            transcripts: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
        }
    }

    /// Delay every summarize call by this much, for exercising in-flight
    /// deduplication.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().expect("lock poisoned") = delay;
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_response(&self, response: impl Into<String>) {
        *self.response.lock().expect("lock poisoned") = response.into();
    }

    /// Every transcript this summarizer has been handed, in order.
    pub fn transcripts(&self) -> Vec<String> {
        self.transcripts.lock().expect("lock poisoned").clone()
    }

    pub fn call_count(&self) -> usize {
        self.transcripts.lock().expect("lock poisoned").len()
    }
}

#[async_trait]
impl SummaryProvider for MockSummarizer {
    async fn summarize(&self, transcript: &str) -> Result<String> {
        let delay = *self.delay.lock().expect("lock poisoned");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.transcripts
            .lock()
            .expect("lock poisoned")
            .push(transcript.to_string());

        if self.fail.load(Ordering::SeqCst) {
            return Err(MnemosyneError::Summarization(
                "mock summarizer failure".to_string(),
            ));
        }

        let response = self.response.lock().expect("lock poisoned").clone();
        if response.trim().is_empty() {
            return Err(MnemosyneError::Summarization(
                "Summarizer returned blank text".to_string(),
            ));
        }
        Ok(response)
    }

    async fn is_available(&self) -> bool {
        !self.fail.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_embedder_is_deterministic() {
        let embedder = MockEmbedder::new(16);

        let a = embedder.embed("hello").await.unwrap();
        let b = embedder.embed("hello").await.unwrap();
        let c = embedder.embed("goodbye").await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert_eq!(embedder.call_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_store_search_orders_by_distance() {
        let store = MockVectorStore::new();
        let embedder = MockEmbedder::new(8);

        let near = embedder.vector_for("rust");
        store
            .insert(NewMemory::new("s1", None, "about rust", near.clone()))
            .await
            .unwrap();
        store
            .insert(NewMemory::new(
                "s1",
                None,
                "about gardening",
                embedder.vector_for("gardening"),
            ))
            .await
            .unwrap();

        let hits = store.search(&near, &SearchFilter::new(), 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "about rust");
    }

    #[tokio::test]
    async fn test_mock_store_filter_evaluation() {
        let store = MockVectorStore::new();

        store
            .insert(NewMemory::new("s1", Some("p1".to_string()), "a", vec![0.0; 4]))
            .await
            .unwrap();
        store
            .insert(NewMemory::new("s2", Some("p1".to_string()), "b", vec![0.0; 4]))
            .await
            .unwrap();
        store
            .insert(NewMemory::new("s1", Some("p2".to_string()), "c", vec![0.0; 4]))
            .await
            .unwrap();

        let filter = SearchFilter::new().with_session_id("s1").with_persona_id("p1");
        let hits = store.search(&[0.0; 4], &filter, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "a");
    }

    #[tokio::test]
    async fn test_mock_summarizer_records_transcripts() {
        let summarizer = MockSummarizer::new("condensed");

        let result = summarizer.summarize("user:hi\n").await.unwrap();
        assert_eq!(result, "condensed");
        assert_eq!(summarizer.transcripts(), vec!["user:hi\n".to_string()]);

        summarizer.set_fail(true);
        assert!(summarizer.summarize("user:again\n").await.is_err());
        assert_eq!(summarizer.call_count(), 2);
    }
}
