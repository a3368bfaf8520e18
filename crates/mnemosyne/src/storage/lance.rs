//! LanceDB-backed vector store
//!
//! One table holds every memory row. The table is created on first open and
//! an ANN index is built once the row count justifies it. Ids are assigned
//! locally from a wall-clock-seeded counter, so they stay unique across
//! restarts without scanning the table.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator,
    StringArray, TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use lancedb::Table;
use lancedb::connection::Connection;
use lancedb::index::Index;
use lancedb::index::vector::IvfPqIndexBuilder;
use lancedb::query::{ExecutableQuery, QueryBase};

use crate::error::{MnemosyneError, Result};
use crate::storage::filter::SearchFilter;
use crate::storage::{MemoryHit, NewMemory, VectorStore};

/// IVF-PQ training needs this many rows before an index is worth building
const MIN_ROWS_FOR_INDEX: usize = 256;

/// Upper bound on stored content bytes; longer summaries are truncated
const MAX_CONTENT_LEN: usize = 65_535;

pub struct LanceGateway {
    connection: Connection,
    table: Table,
    schema: Arc<Schema>,
    dimension: i32,
    next_id: AtomicI64,
}

impl LanceGateway {
    /// Connect to (or create) the memory table under `path`.
    pub async fn open(path: &Path, collection: &str, dimension: usize) -> Result<Self> {
        let uri = path
            .to_str()
            .ok_or_else(|| MnemosyneError::Storage("Invalid path encoding".to_string()))?;

        let connection = lancedb::connect(uri)
            .execute()
            .await
            .map_err(|e| MnemosyneError::Storage(format!("Failed to connect to LanceDB: {e}")))?;

        let dimension = i32::try_from(dimension)
            .map_err(|_| MnemosyneError::Storage(format!("Invalid dimension: {dimension}")))?;
        let schema = Self::memory_schema(dimension);

        let existing = connection
            .table_names()
            .execute()
            .await
            .map_err(|e| MnemosyneError::Storage(format!("Failed to list tables: {e}")))?;

        let table = if existing.contains(&collection.to_string()) {
            connection
                .open_table(collection)
                .execute()
                .await
                .map_err(|e| MnemosyneError::Storage(format!("Failed to open table: {e}")))?
        } else {
            let batch = Self::empty_batch(schema.clone(), dimension);
            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema.clone());
            connection
                .create_table(collection, Box::new(batches))
                .execute()
                .await
                .map_err(|e| MnemosyneError::Storage(format!("Failed to create table: {e}")))?
        };

        let gateway = Self {
            connection,
            table,
            schema,
            dimension,
            next_id: AtomicI64::new(Utc::now().timestamp_micros()),
        };
        gateway.ensure_index().await?;

        Ok(gateway)
    }

    fn memory_schema(dimension: i32) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("memory_id", DataType::Int64, false),
            Field::new("session_id", DataType::Utf8, false),
            Field::new("persona_id", DataType::Utf8, true),
            Field::new("content", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimension,
                ),
                false,
            ),
            Field::new(
                "created_at",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
        ]))
    }

    fn empty_batch(schema: Arc<Schema>, dimension: i32) -> RecordBatch {
        let empty_ids: Vec<i64> = vec![];
        let empty_strings: Vec<Option<&str>> = vec![];
        let empty_timestamps: Vec<i64> = vec![];
        let empty_embeddings: Vec<Option<Vec<Option<f32>>>> = vec![];

        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(empty_ids)),
                Arc::new(StringArray::from(empty_strings.clone())),
                Arc::new(StringArray::from(empty_strings.clone())),
                Arc::new(StringArray::from(empty_strings)),
                Arc::new(FixedSizeListArray::from_iter_primitive::<
                    arrow_array::types::Float32Type,
                    _,
                    _,
                >(empty_embeddings, dimension)),
                Arc::new(TimestampMicrosecondArray::from(empty_timestamps).with_timezone("UTC")),
            ],
        )
        .expect("Schema matches columns")
    }

    /// Build the ANN index if enough rows have accumulated. Safe to call on
    /// every open.
    async fn ensure_index(&self) -> Result<()> {
        let row_count = self
            .table
            .count_rows(None)
            .await
            .map_err(|e| MnemosyneError::Storage(format!("Failed to count rows: {e}")))?;

        if row_count < MIN_ROWS_FOR_INDEX {
            return Ok(());
        }

        let ivf_pq = IvfPqIndexBuilder::default()
            .num_partitions(256)
            .num_sub_vectors(16);

        self.table
            .create_index(&["embedding"], Index::IvfPq(ivf_pq))
            .execute()
            .await
            .map_err(|e| MnemosyneError::Storage(format!("Failed to create vector index: {e}")))?;

        Ok(())
    }

    fn memory_to_batch(&self, memory_id: i64, memory: &NewMemory) -> Result<RecordBatch> {
        if memory.embedding.len() != self.dimension as usize {
            return Err(MnemosyneError::Storage(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                memory.embedding.len()
            )));
        }

        let embeddings: Vec<Option<Vec<Option<f32>>>> =
            vec![Some(memory.embedding.iter().map(|&v| Some(v)).collect())];
        let content = truncate_content(&memory.content);

        RecordBatch::try_new(
            self.schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![memory_id])),
                Arc::new(StringArray::from(vec![memory.session_id.as_str()])),
                Arc::new(StringArray::from(vec![memory.persona_id.as_deref()])),
                Arc::new(StringArray::from(vec![content])),
                Arc::new(FixedSizeListArray::from_iter_primitive::<
                    arrow_array::types::Float32Type,
                    _,
                    _,
                >(embeddings, self.dimension)),
                Arc::new(
                    TimestampMicrosecondArray::from(vec![memory.created_at.timestamp_micros()])
                        .with_timezone("UTC"),
                ),
            ],
        )
        .map_err(|e| MnemosyneError::Storage(format!("Failed to create RecordBatch: {e}")))
    }

    fn batch_to_hit(batch: &RecordBatch, row: usize) -> Result<MemoryHit> {
        let id_array = batch
            .column_by_name("memory_id")
            .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
            .ok_or_else(|| MnemosyneError::Storage("Missing memory_id column".to_string()))?;

        let content_array = batch
            .column_by_name("content")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .ok_or_else(|| MnemosyneError::Storage("Missing content column".to_string()))?;

        let created_at_array = batch
            .column_by_name("created_at")
            .and_then(|c| c.as_any().downcast_ref::<TimestampMicrosecondArray>())
            .ok_or_else(|| MnemosyneError::Storage("Missing created_at column".to_string()))?;

        if id_array.is_null(row) || content_array.is_null(row) {
            return Err(MnemosyneError::Storage(format!(
                "Null required field at row {row}"
            )));
        }

        let created_at = Utc
            .timestamp_micros(created_at_array.value(row))
            .single()
            .ok_or_else(|| MnemosyneError::Storage("Invalid created_at timestamp".to_string()))?;

        // Appended by the search engine; absent on plain scans
        let distance = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
            .map(|a| a.value(row))
            .unwrap_or(0.0);

        Ok(MemoryHit {
            memory_id: id_array.value(row),
            content: content_array.value(row).to_string(),
            created_at,
            distance,
        })
    }
}

/// Cap content at the schema bound, backing off to a char boundary.
fn truncate_content(content: &str) -> &str {
    if content.len() <= MAX_CONTENT_LEN {
        return content;
    }
    let mut end = MAX_CONTENT_LEN;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    &content[..end]
}

#[async_trait]
impl VectorStore for LanceGateway {
    async fn insert(&self, memory: NewMemory) -> Result<i64> {
        let memory_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let batch = self.memory_to_batch(memory_id, &memory)?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], self.schema.clone());

        self.table
            .add(Box::new(batches))
            .execute()
            .await
            .map_err(|e| MnemosyneError::Storage(format!("Failed to insert memory: {e}")))?;

        Ok(memory_id)
    }

    async fn search(
        &self,
        embedding: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<MemoryHit>> {
        let query = self
            .table
            .query()
            .nearest_to(embedding)
            .map_err(|e| MnemosyneError::Storage(format!("Failed to create vector query: {e}")))?
            .limit(limit)
            .only_if(filter.to_expr());

        let stream = query
            .execute()
            .await
            .map_err(|e| MnemosyneError::Storage(format!("Failed to execute search: {e}")))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| MnemosyneError::Storage(format!("Failed to collect results: {e}")))?;

        let mut hits = Vec::new();
        for batch in &batches {
            for row in 0..batch.num_rows() {
                match Self::batch_to_hit(batch, row) {
                    Ok(hit) => hits.push(hit),
                    Err(e) => {
                        // A corrupt row should not sink the whole result set
                        tracing::warn!(row, error = %e, "Skipping malformed search hit");
                    }
                }
            }
        }

        Ok(hits)
    }

    async fn flush(&self) -> Result<()> {
        // Each add() commits synchronously; nothing is buffered here
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        self.table
            .count_rows(None)
            .await
            .map_err(|e| MnemosyneError::Storage(format!("Failed to count memories: {e}")))
    }

    async fn is_available(&self) -> bool {
        self.connection.table_names().execute().await.is_ok()
    }

    fn name(&self) -> &str {
        "lancedb"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIM: usize = 8;

    async fn open_store(dir: &Path) -> LanceGateway {
        LanceGateway::open(dir, "test_memories", DIM).await.unwrap()
    }

    fn memory(session: &str, persona: Option<&str>, content: &str, fill: f32) -> NewMemory {
        NewMemory::new(
            session,
            persona.map(|p| p.to_string()),
            content,
            vec![fill; DIM],
        )
    }

    #[tokio::test]
    async fn test_open_creates_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.is_available().await);
    }

    #[tokio::test]
    async fn test_reopen_existing_table() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path()).await;
            store
                .insert(memory("s1", None, "persisted", 0.5))
                .await
                .unwrap();
        }

        let store = open_store(dir.path()).await;
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let a = store.insert(memory("s1", None, "first", 0.1)).await.unwrap();
        let b = store
            .insert(memory("s1", None, "second", 0.2))
            .await
            .unwrap();

        assert!(b > a);
        assert!(a > 0);
    }

    #[tokio::test]
    async fn test_search_returns_closest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        store.insert(memory("s1", None, "near", 0.5)).await.unwrap();
        store.insert(memory("s1", None, "far", 0.9)).await.unwrap();

        let hits = store
            .search(&vec![0.5; DIM], &SearchFilter::new(), 10)
            .await
            .unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "near");
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[tokio::test]
    async fn test_search_respects_session_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        store
            .insert(memory("s1", None, "mine", 0.5))
            .await
            .unwrap();
        store
            .insert(memory("s2", None, "other", 0.5))
            .await
            .unwrap();

        let filter = SearchFilter::new().with_session_id("s1");
        let hits = store.search(&vec![0.5; DIM], &filter, 10).await.unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "mine");
    }

    #[tokio::test]
    async fn test_search_respects_persona_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        store
            .insert(memory("s1", Some("helper"), "as helper", 0.5))
            .await
            .unwrap();
        store
            .insert(memory("s1", Some("critic"), "as critic", 0.5))
            .await
            .unwrap();

        let filter = SearchFilter::new()
            .with_session_id("s1")
            .with_persona_id("helper");
        let hits = store.search(&vec![0.5; DIM], &filter, 10).await.unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "as helper");
    }

    #[tokio::test]
    async fn test_search_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        for i in 0..5 {
            store
                .insert(memory("s1", None, &format!("m{i}"), 0.1 * i as f32))
                .await
                .unwrap();
        }

        let hits = store
            .search(&vec![0.2; DIM], &SearchFilter::new(), 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_insert_rejects_wrong_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let bad = NewMemory::new("s1", None, "bad", vec![0.5; DIM + 1]);
        let result = store.insert(bad).await;
        assert!(matches!(result, Err(MnemosyneError::Storage(_))));
    }

    #[test]
    fn test_truncate_content() {
        let short = "hello";
        assert_eq!(truncate_content(short), "hello");

        let long = "x".repeat(MAX_CONTENT_LEN + 100);
        assert_eq!(truncate_content(&long).len(), MAX_CONTENT_LEN);

        // Multi-byte character straddling the bound is dropped whole
        let mut tricky = "x".repeat(MAX_CONTENT_LEN - 1);
        tricky.push('é');
        tricky.push_str("tail");
        let truncated = truncate_content(&tricky);
        assert!(truncated.len() <= MAX_CONTENT_LEN);
        assert!(truncated.chars().all(|c| c == 'x'));
    }

    #[tokio::test]
    async fn test_flush_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store.flush().await.unwrap();
    }
}
