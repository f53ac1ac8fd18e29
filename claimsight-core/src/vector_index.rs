//! Vector index client.
//!
//! `VectorIndex` is the contract the pipeline uses to store chunk
//! embeddings and find nearest neighbours. Two backends are provided: an
//! in-memory index for tests and single-process use, and a SQLite-backed
//! index that persists across runs. Both scan by brute force and report
//! cosine distance (`1 - cosine similarity`, lower is closer).

use crate::chunker::Chunk;
use crate::config::{VectorBackend, VectorIndexConfig};
use crate::error::{RagError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::debug;

/// Metadata stored next to every chunk embedding.
///
/// `page_number` and `policy_id` serialize as explicit `null` when absent
/// so every stored entry has the same shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub document_id: String,
    pub policy_id: Option<String>,
    pub chunk_index: usize,
    pub page_number: Option<u32>,
}

/// One entry to upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub document: String,
    pub metadata: ChunkMetadata,
}

impl IndexRecord {
    /// Build records from parallel arrays, rejecting mismatched lengths.
    pub fn zip(
        ids: Vec<String>,
        vectors: Vec<Vec<f32>>,
        documents: Vec<String>,
        metadatas: Vec<ChunkMetadata>,
    ) -> Result<Vec<Self>> {
        let n = ids.len();
        if vectors.len() != n || documents.len() != n || metadatas.len() != n {
            return Err(RagError::validation(format!(
                "upsert arrays differ in length: {} ids, {} vectors, {} documents, {} metadatas",
                n,
                vectors.len(),
                documents.len(),
                metadatas.len()
            )));
        }
        Ok(ids
            .into_iter()
            .zip(vectors)
            .zip(documents)
            .zip(metadatas)
            .map(|(((id, vector), document), metadata)| Self {
                id,
                vector,
                document,
                metadata,
            })
            .collect())
    }
}

/// Equality filter over chunk metadata. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexFilter {
    pub document_id: Option<String>,
    pub policy_id: Option<String>,
}

impl IndexFilter {
    pub fn for_document(document_id: impl Into<String>) -> Self {
        Self {
            document_id: Some(document_id.into()),
            policy_id: None,
        }
    }

    pub fn for_policy(policy_id: impl Into<String>) -> Self {
        Self {
            document_id: None,
            policy_id: Some(policy_id.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.document_id.is_none() && self.policy_id.is_none()
    }

    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        self.document_id
            .as_ref()
            .is_none_or(|d| *d == metadata.document_id)
            && self
                .policy_id
                .as_ref()
                .is_none_or(|p| metadata.policy_id.as_ref() == Some(p))
    }

    /// Short label used as the scope in logs and errors.
    pub fn scope_label(&self) -> String {
        match (&self.document_id, &self.policy_id) {
            (Some(d), Some(p)) => format!("document:{d}/policy:{p}"),
            (Some(d), None) => format!("document:{d}"),
            (None, Some(p)) => format!("policy:{p}"),
            (None, None) => "all".to_string(),
        }
    }
}

/// A chunk returned from a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedChunk {
    /// Storage id in the vector index.
    pub id: String,
    pub chunk: Chunk,
    /// Cosine distance to the query; lower is more similar.
    pub distance: f32,
}

impl RetrievedChunk {
    fn from_parts(id: String, document: String, metadata: ChunkMetadata, distance: f32) -> Self {
        Self {
            id,
            chunk: Chunk {
                text: document,
                chunk_index: metadata.chunk_index,
                page_number: metadata.page_number,
                document_id: Some(metadata.document_id),
                policy_id: metadata.policy_id,
            },
            distance,
        }
    }
}

/// Contract over a similarity index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or overwrite records. The collection is created if missing.
    /// Returns the number of records written.
    async fn upsert(&self, records: Vec<IndexRecord>) -> Result<usize>;

    /// Up to `k` nearest records matching `filter`, ascending by distance.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<RetrievedChunk>>;

    /// Remove every record matching `filter` and return how many were removed.
    /// An empty filter is rejected.
    async fn delete_by(&self, filter: &IndexFilter) -> Result<usize>;

    /// Number of records matching `filter`.
    async fn count(&self, filter: &IndexFilter) -> Result<usize>;

    fn backend_name(&self) -> &str;
}

/// Cosine distance between two vectors. Zero vectors are maximally unrelated
/// to everything (distance 1).
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

fn check_dimensions(query: &[f32], stored: &[f32], id: &str) -> Result<()> {
    if query.len() != stored.len() {
        return Err(RagError::validation(format!(
            "query vector has {} dimensions but '{id}' has {}",
            query.len(),
            stored.len()
        )));
    }
    Ok(())
}

/// Sort ascending by distance (ties broken by id) and keep the first `k`.
fn rank(mut hits: Vec<RetrievedChunk>, k: usize) -> Vec<RetrievedChunk> {
    hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
    hits.truncate(k);
    hits
}

fn reject_empty_filter(filter: &IndexFilter) -> Result<()> {
    if filter.is_empty() {
        return Err(RagError::validation(
            "delete requires a document or policy filter",
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

type Collection = BTreeMap<String, IndexRecord>;

/// Process-local vector index.
pub struct InMemoryVectorIndex {
    collection: String,
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryVectorIndex {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            collections: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new("policy_chunks")
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, records: Vec<IndexRecord>) -> Result<usize> {
        let mut collections = self.collections.write().await;
        let collection = collections.entry(self.collection.clone()).or_default();
        let written = records.len();
        for record in records {
            collection.insert(record.id.clone(), record);
        }
        debug!(
            collection = self.collection.as_str(),
            written,
            total = collection.len(),
            "Upserted records"
        );
        Ok(written)
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<RetrievedChunk>> {
        let collections = self.collections.read().await;
        let Some(collection) = collections.get(&self.collection) else {
            return Ok(Vec::new());
        };

        let mut hits = Vec::new();
        for record in collection.values().filter(|r| filter.matches(&r.metadata)) {
            check_dimensions(vector, &record.vector, &record.id)?;
            hits.push(RetrievedChunk::from_parts(
                record.id.clone(),
                record.document.clone(),
                record.metadata.clone(),
                cosine_distance(vector, &record.vector),
            ));
        }
        Ok(rank(hits, k))
    }

    async fn delete_by(&self, filter: &IndexFilter) -> Result<usize> {
        reject_empty_filter(filter)?;
        let mut collections = self.collections.write().await;
        let Some(collection) = collections.get_mut(&self.collection) else {
            return Ok(0);
        };
        let before = collection.len();
        collection.retain(|_, record| !filter.matches(&record.metadata));
        Ok(before - collection.len())
    }

    async fn count(&self, filter: &IndexFilter) -> Result<usize> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(&self.collection)
            .map(|c| c.values().filter(|r| filter.matches(&r.metadata)).count())
            .unwrap_or(0))
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS chunk_vectors (
    collection   TEXT NOT NULL,
    id           TEXT NOT NULL,
    document     TEXT NOT NULL,
    document_id  TEXT NOT NULL,
    policy_id    TEXT,
    metadata     TEXT NOT NULL,
    embedding    TEXT NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE INDEX IF NOT EXISTS chunk_vectors_document ON chunk_vectors (collection, document_id);
CREATE INDEX IF NOT EXISTS chunk_vectors_policy ON chunk_vectors (collection, policy_id);
";

const FILTER_CLAUSE: &str =
    "collection = ?1 AND (?2 IS NULL OR document_id = ?2) AND (?3 IS NULL OR policy_id = ?3)";

/// Persistent vector index on a single SQLite file.
pub struct SqliteVectorIndex {
    collection: String,
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteVectorIndex {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path, collection: impl Into<String>) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path)?;
        Self::with_connection(conn, collection)
    }

    /// In-memory SQLite database, mostly useful for tests.
    pub fn open_in_memory(collection: impl Into<String>) -> Result<Self> {
        Self::with_connection(rusqlite::Connection::open_in_memory()?, collection)
    }

    fn with_connection(conn: rusqlite::Connection, collection: impl Into<String>) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            collection: collection.into(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection, &str) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let collection = self.collection.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard, &collection)
        })
        .await
        .map_err(|e| RagError::upstream(operation, "sqlite", e.to_string()))?
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, records: Vec<IndexRecord>) -> Result<usize> {
        self.with_conn("vector_upsert", move |conn, collection| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO chunk_vectors
                         (collection, id, document, document_id, policy_id, metadata, embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT (collection, id) DO UPDATE SET
                         document = excluded.document,
                         document_id = excluded.document_id,
                         policy_id = excluded.policy_id,
                         metadata = excluded.metadata,
                         embedding = excluded.embedding",
                )?;
                for record in &records {
                    stmt.execute(rusqlite::params![
                        collection,
                        record.id,
                        record.document,
                        record.metadata.document_id,
                        record.metadata.policy_id,
                        serde_json::to_string(&record.metadata)?,
                        serde_json::to_string(&record.vector)?,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(records.len())
        })
        .await
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<RetrievedChunk>> {
        let query = vector.to_vec();
        let filter = filter.clone();
        self.with_conn("vector_query", move |conn, collection| {
            let sql = format!(
                "SELECT id, document, metadata, embedding FROM chunk_vectors WHERE {FILTER_CLAUSE}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params![collection, filter.document_id, filter.policy_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )?;

            let mut hits = Vec::new();
            for row in rows {
                let (id, document, metadata, embedding) = row?;
                let metadata: ChunkMetadata = serde_json::from_str(&metadata)?;
                let stored: Vec<f32> = serde_json::from_str(&embedding)?;
                check_dimensions(&query, &stored, &id)?;
                let distance = cosine_distance(&query, &stored);
                hits.push(RetrievedChunk::from_parts(id, document, metadata, distance));
            }
            Ok(rank(hits, k))
        })
        .await
    }

    async fn delete_by(&self, filter: &IndexFilter) -> Result<usize> {
        reject_empty_filter(filter)?;
        let filter = filter.clone();
        self.with_conn("vector_delete", move |conn, collection| {
            let sql = format!("DELETE FROM chunk_vectors WHERE {FILTER_CLAUSE}");
            let removed = conn.execute(
                &sql,
                rusqlite::params![collection, filter.document_id, filter.policy_id],
            )?;
            Ok(removed)
        })
        .await
    }

    async fn count(&self, filter: &IndexFilter) -> Result<usize> {
        let filter = filter.clone();
        self.with_conn("vector_count", move |conn, collection| {
            let sql = format!("SELECT COUNT(*) FROM chunk_vectors WHERE {FILTER_CLAUSE}");
            let count: i64 = conn.query_row(
                &sql,
                rusqlite::params![collection, filter.document_id, filter.policy_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    fn backend_name(&self) -> &str {
        "sqlite"
    }
}

/// Open the backend selected in configuration.
pub fn open_vector_index(config: &VectorIndexConfig) -> Result<Arc<dyn VectorIndex>> {
    match config.backend {
        VectorBackend::Memory => Ok(Arc::new(InMemoryVectorIndex::new(
            config.collection.clone(),
        ))),
        VectorBackend::Sqlite => Ok(Arc::new(SqliteVectorIndex::open(
            &config.db_path,
            config.collection.clone(),
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        id: &str,
        vector: Vec<f32>,
        doc: &str,
        policy: Option<&str>,
        page: Option<u32>,
    ) -> IndexRecord {
        IndexRecord {
            id: id.to_string(),
            vector,
            document: format!("text of {id}"),
            metadata: ChunkMetadata {
                document_id: doc.to_string(),
                policy_id: policy.map(str::to_string),
                chunk_index: 0,
                page_number: page,
            },
        }
    }

    fn sample() -> Vec<IndexRecord> {
        vec![
            record("a", vec![1.0, 0.0], "doc-1", Some("pol-1"), Some(1)),
            record("b", vec![0.7, 0.7], "doc-1", Some("pol-1"), None),
            record("c", vec![0.0, 1.0], "doc-2", Some("pol-2"), Some(3)),
        ]
    }

    async fn exercise_backend(index: &dyn VectorIndex) {
        assert!(index.query(&[1.0, 0.0], 5, &IndexFilter::default()).await.unwrap().is_empty());
        assert_eq!(index.upsert(sample()).await.unwrap(), 3);

        let hits = index.query(&[1.0, 0.0], 5, &IndexFilter::default()).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(hits[0].distance.abs() < 1e-6);
        for pair in hits.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
        assert_eq!(hits[1].chunk.page_number, None);

        let scoped = index
            .query(&[1.0, 0.0], 5, &IndexFilter::for_policy("pol-2"))
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].chunk.policy_id.as_deref(), Some("pol-2"));

        let limited = index.query(&[1.0, 0.0], 1, &IndexFilter::default()).await.unwrap();
        assert_eq!(limited.len(), 1);

        // Re-upserting an id overwrites it.
        index
            .upsert(vec![record("a", vec![0.0, 1.0], "doc-1", Some("pol-1"), Some(2))])
            .await
            .unwrap();
        assert_eq!(index.count(&IndexFilter::default()).await.unwrap(), 3);
        let hits = index.query(&[0.0, 1.0], 5, &IndexFilter::for_document("doc-1")).await.unwrap();
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[0].chunk.page_number, Some(2));

        assert_eq!(index.delete_by(&IndexFilter::for_document("doc-1")).await.unwrap(), 2);
        assert_eq!(index.delete_by(&IndexFilter::for_document("doc-1")).await.unwrap(), 0);
        assert_eq!(index.delete_by(&IndexFilter::for_policy("nope")).await.unwrap(), 0);
        assert_eq!(index.count(&IndexFilter::default()).await.unwrap(), 1);

        assert!(matches!(
            index.delete_by(&IndexFilter::default()).await,
            Err(RagError::Validation { .. })
        ));
        assert!(matches!(
            index.query(&[1.0, 0.0, 0.0], 5, &IndexFilter::default()).await,
            Err(RagError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_in_memory_backend() {
        let index = InMemoryVectorIndex::new("test");
        exercise_backend(&index).await;
        assert_eq!(index.backend_name(), "memory");
    }

    #[tokio::test]
    async fn test_sqlite_backend() {
        let index = SqliteVectorIndex::open_in_memory("test").unwrap();
        exercise_backend(&index).await;
        assert_eq!(index.backend_name(), "sqlite");
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vectors.db");
        {
            let index = SqliteVectorIndex::open(&path, "policies").unwrap();
            index.upsert(sample()).await.unwrap();
        }
        let reopened = SqliteVectorIndex::open(&path, "policies").unwrap();
        assert_eq!(reopened.count(&IndexFilter::default()).await.unwrap(), 3);

        // Collections are isolated from each other.
        let other = SqliteVectorIndex::open(&path, "other").unwrap();
        assert_eq!(other.count(&IndexFilter::default()).await.unwrap(), 0);
    }

    #[test]
    fn test_zip_rejects_mismatched_lengths() {
        let meta = ChunkMetadata {
            document_id: "d".into(),
            policy_id: None,
            chunk_index: 0,
            page_number: None,
        };
        let err = IndexRecord::zip(
            vec!["a".into(), "b".into()],
            vec![vec![1.0]],
            vec!["x".into(), "y".into()],
            vec![meta.clone(), meta],
        )
        .unwrap_err();
        assert!(matches!(err, RagError::Validation { .. }));
    }

    #[test]
    fn test_metadata_serializes_null_page() {
        let meta = ChunkMetadata {
            document_id: "d".into(),
            policy_id: None,
            chunk_index: 4,
            page_number: None,
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("pageNumber").unwrap().is_null());
        assert!(json.get("policyId").unwrap().is_null());
    }

    #[test]
    fn test_cosine_distance() {
        assert!(cosine_distance(&[1.0, 0.0], &[1.0, 0.0]).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
    }

    #[test]
    fn test_filter_matches_and_labels() {
        let meta = ChunkMetadata {
            document_id: "doc-1".into(),
            policy_id: Some("pol-1".into()),
            chunk_index: 0,
            page_number: None,
        };
        assert!(IndexFilter::default().matches(&meta));
        assert!(IndexFilter::for_policy("pol-1").matches(&meta));
        assert!(!IndexFilter::for_policy("pol-2").matches(&meta));
        assert!(!IndexFilter::for_document("doc-2").matches(&meta));
        assert_eq!(IndexFilter::for_policy("pol-1").scope_label(), "policy:pol-1");
    }
}
