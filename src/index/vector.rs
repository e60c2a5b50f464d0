//! Vector index: dense+sparse storage with metadata filtering
//!
//! The SQLite implementation stores dense vectors as little-endian f32
//! blobs and sparse vectors as JSON, and scores hybrid queries with
//! min-max-normalized cosine and BM25 components. Re-indexing a document
//! replaces its vectors inside one transaction so readers never observe
//! partial duplicate state.

use super::embedding::cosine_similarity;
use super::sparse::SparseVector;
use crate::error::{IndexError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

/// Maximum records per upsert batch
const UPSERT_BATCH: usize = 100;

/// Metadata carried on every vector, a subset of Document and Chunk fields
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorMetadata {
    pub document_id: String,
    pub chunk_index: usize,
    pub ticker: Option<String>,
    pub company: Option<String>,
    pub doc_type: String,
    pub source_type: String,
    pub fiscal_year: Option<i32>,
    pub section: Option<String>,
    pub page: u32,
    /// RFC3339 extraction timestamp, used for recency tie-breaks
    pub extracted_at: String,
}

/// A vector record ready for upsert
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub chunk_id: String,
    pub dense: Vec<f32>,
    pub sparse: SparseVector,
    pub metadata: VectorMetadata,
    pub text_enriched: String,
    pub text_raw: String,
}

/// Metadata filter for queries and deletes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    pub document_id: Option<String>,
    pub ticker: Option<String>,
    pub doc_type: Option<String>,
    pub source_type: Option<String>,
    pub fiscal_year: Option<i32>,
}

impl MetadataFilter {
    pub fn for_document(document_id: impl Into<String>) -> Self {
        Self {
            document_id: Some(document_id.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.document_id.is_none()
            && self.ticker.is_none()
            && self.doc_type.is_none()
            && self.source_type.is_none()
            && self.fiscal_year.is_none()
    }
}

/// A scored query result
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub score: f32,
    pub metadata: VectorMetadata,
    pub text_enriched: String,
    pub text_raw: String,
}

/// Index statistics
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub total_vectors: usize,
    pub total_documents: usize,
    pub dimension: usize,
}

/// Trait for vector index implementations
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Upsert records in batches
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<usize>;

    /// Atomically delete a document's vectors and upsert replacements
    async fn replace_document(
        &self,
        document_id: &str,
        records: Vec<VectorRecord>,
    ) -> Result<usize>;

    /// Hybrid query over dense and optional sparse components
    async fn query(
        &self,
        dense: &[f32],
        sparse: Option<&SparseVector>,
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredChunk>>;

    /// Delete vectors matching a filter, returning the count removed
    async fn delete(&self, filter: &MetadataFilter) -> Result<u64>;

    /// Fetch a single chunk by id
    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<ScoredChunk>>;

    /// Whether any chunk exists for (document_id, page), for citation checks
    async fn has_page(&self, document_id: &str, page: u32) -> Result<bool>;

    /// Index statistics
    async fn stats(&self) -> Result<IndexStats>;

    /// Persist an auxiliary value (e.g. the sparse vocabulary)
    async fn save_meta(&self, key: &str, value: &str) -> Result<()>;

    /// Load an auxiliary value
    async fn load_meta(&self, key: &str) -> Result<Option<String>>;
}

/// SQLite-backed vector index
pub struct SqliteVectorIndex {
    pool: SqlitePool,
    dimension: usize,
    hybrid_alpha: f64,
}

impl SqliteVectorIndex {
    /// Open (creating if missing) the index database
    pub async fn new(
        database_url: &str,
        dimension: usize,
        hybrid_alpha: f64,
        max_connections: u32,
    ) -> Result<Self> {
        info!(database_url, dimension, "initializing vector index");
        crate::store::ensure_sqlite_dir(database_url)?;

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vectors (
                chunk_id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                dense BLOB NOT NULL,
                sparse TEXT NOT NULL,
                ticker TEXT,
                company TEXT,
                doc_type TEXT NOT NULL,
                source_type TEXT NOT NULL,
                fiscal_year INTEGER,
                section TEXT,
                page INTEGER NOT NULL,
                extracted_at TEXT NOT NULL,
                text_enriched TEXT NOT NULL,
                text_raw TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_document ON vectors(document_id)")
            .execute(&pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS index_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            dimension,
            hybrid_alpha,
        })
    }

    /// Serialize a dense vector as little-endian f32 bytes
    pub fn serialize_dense(vector: &[f32]) -> Vec<u8> {
        vector.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Deserialize a dense vector from storage
    pub fn deserialize_dense(data: &[u8]) -> Vec<f32> {
        data.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn check_dimension(&self, record: &VectorRecord) -> Result<()> {
        if record.dense.len() != self.dimension {
            return Err(IndexError::InvalidDimension {
                expected: self.dimension,
                actual: record.dense.len(),
            }
            .into());
        }
        Ok(())
    }

    async fn insert_batch(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        records: &[VectorRecord],
    ) -> Result<()> {
        for record in records {
            let sparse_json = serde_json::to_string(&record.sparse)?;
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO vectors
                    (chunk_id, document_id, chunk_index, dense, sparse, ticker, company,
                     doc_type, source_type, fiscal_year, section, page, extracted_at,
                     text_enriched, text_raw)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                "#,
            )
            .bind(&record.chunk_id)
            .bind(&record.metadata.document_id)
            .bind(record.metadata.chunk_index as i64)
            .bind(Self::serialize_dense(&record.dense))
            .bind(&sparse_json)
            .bind(&record.metadata.ticker)
            .bind(&record.metadata.company)
            .bind(&record.metadata.doc_type)
            .bind(&record.metadata.source_type)
            .bind(record.metadata.fiscal_year)
            .bind(&record.metadata.section)
            .bind(record.metadata.page as i64)
            .bind(&record.metadata.extracted_at)
            .bind(&record.text_enriched)
            .bind(&record.text_raw)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    fn filter_clause(filter: &MetadataFilter) -> (String, Vec<BindValue>) {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();

        if let Some(v) = &filter.document_id {
            clauses.push("document_id = ?".to_string());
            binds.push(BindValue::Text(v.clone()));
        }
        if let Some(v) = &filter.ticker {
            clauses.push("ticker = ?".to_string());
            binds.push(BindValue::Text(v.clone()));
        }
        if let Some(v) = &filter.doc_type {
            clauses.push("doc_type = ?".to_string());
            binds.push(BindValue::Text(v.clone()));
        }
        if let Some(v) = &filter.source_type {
            clauses.push("source_type = ?".to_string());
            binds.push(BindValue::Text(v.clone()));
        }
        if let Some(v) = filter.fiscal_year {
            clauses.push("fiscal_year = ?".to_string());
            binds.push(BindValue::Int(v as i64));
        }

        let clause = if clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            clauses.join(" AND ")
        };
        (clause, binds)
    }

    fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<(ScoredChunk, Vec<f32>, SparseVector)> {
        let dense = Self::deserialize_dense(row.get::<Vec<u8>, _>("dense").as_slice());
        let sparse: SparseVector = serde_json::from_str(&row.get::<String, _>("sparse"))?;
        let chunk = ScoredChunk {
            chunk_id: row.get("chunk_id"),
            score: 0.0,
            metadata: VectorMetadata {
                document_id: row.get("document_id"),
                chunk_index: row.get::<i64, _>("chunk_index") as usize,
                ticker: row.get("ticker"),
                company: row.get("company"),
                doc_type: row.get("doc_type"),
                source_type: row.get("source_type"),
                fiscal_year: row.get("fiscal_year"),
                section: row.get("section"),
                page: row.get::<i64, _>("page") as u32,
                extracted_at: row.get("extracted_at"),
            },
            text_enriched: row.get("text_enriched"),
            text_raw: row.get("text_raw"),
        };
        Ok((chunk, dense, sparse))
    }
}

enum BindValue {
    Text(String),
    Int(i64),
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    binds: &'q [BindValue],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for bind in binds {
        query = match bind {
            BindValue::Text(v) => query.bind(v),
            BindValue::Int(v) => query.bind(v),
        };
    }
    query
}

/// Min-max normalize scores to [0, 1]; constant slices map to 1.0
fn min_max_normalize(scores: &mut [f32]) {
    let (mut min, mut max) = (f32::MAX, f32::MIN);
    for s in scores.iter() {
        min = min.min(*s);
        max = max.max(*s);
    }
    let range = max - min;
    for s in scores.iter_mut() {
        *s = if range > f32::EPSILON {
            (*s - min) / range
        } else {
            1.0
        };
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<usize> {
        for record in &records {
            self.check_dimension(record)?;
        }

        let total = records.len();
        for batch in records.chunks(UPSERT_BATCH) {
            let mut tx = self.pool.begin().await?;
            Self::insert_batch(&mut tx, batch).await?;
            tx.commit().await?;
        }
        debug!(count = total, "upserted vectors");
        Ok(total)
    }

    async fn replace_document(
        &self,
        document_id: &str,
        records: Vec<VectorRecord>,
    ) -> Result<usize> {
        for record in &records {
            self.check_dimension(record)?;
            if record.metadata.document_id != document_id {
                return Err(IndexError::UpsertFailed(format!(
                    "record {} does not belong to document {}",
                    record.chunk_id, document_id
                ))
                .into());
            }
        }

        // Delete and re-upsert under one transaction: readers see either
        // the old vectors or the new set, never both.
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        for batch in records.chunks(UPSERT_BATCH) {
            Self::insert_batch(&mut tx, batch).await?;
        }
        tx.commit().await?;

        info!(document_id, count = records.len(), "replaced document vectors");
        Ok(records.len())
    }

    async fn query(
        &self,
        dense: &[f32],
        sparse: Option<&SparseVector>,
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredChunk>> {
        if dense.len() != self.dimension {
            return Err(IndexError::InvalidDimension {
                expected: self.dimension,
                actual: dense.len(),
            }
            .into());
        }

        let (clause, binds) = Self::filter_clause(filter);
        let sql = format!("SELECT * FROM vectors WHERE {}", clause);
        let rows = bind_all(sqlx::query(&sql), &binds)
            .fetch_all(&self.pool)
            .await?;

        let mut chunks = Vec::with_capacity(rows.len());
        let mut dense_scores = Vec::with_capacity(rows.len());
        let mut sparse_scores = Vec::with_capacity(rows.len());
        for row in &rows {
            let (chunk, row_dense, row_sparse) = Self::row_to_chunk(row)?;
            dense_scores.push(cosine_similarity(dense, &row_dense));
            sparse_scores.push(sparse.map_or(0.0, |q| q.dot(&row_sparse)));
            chunks.push(chunk);
        }

        if chunks.is_empty() {
            return Ok(vec![]);
        }

        min_max_normalize(&mut dense_scores);
        let use_sparse = sparse.is_some_and(|q| !q.is_empty());
        if use_sparse {
            min_max_normalize(&mut sparse_scores);
        }

        let alpha = if use_sparse { self.hybrid_alpha as f32 } else { 1.0 };
        for (i, chunk) in chunks.iter_mut().enumerate() {
            chunk.score = alpha * dense_scores[i] + (1.0 - alpha) * sparse_scores[i];
        }

        chunks.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        chunks.truncate(top_k);
        Ok(chunks)
    }

    async fn delete(&self, filter: &MetadataFilter) -> Result<u64> {
        let (clause, binds) = Self::filter_clause(filter);
        let sql = format!("DELETE FROM vectors WHERE {}", clause);
        let result = bind_all(sqlx::query(&sql), &binds)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<ScoredChunk>> {
        let row = sqlx::query("SELECT * FROM vectors WHERE chunk_id = ?")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(Self::row_to_chunk(&row)?.0)),
            None => Ok(None),
        }
    }

    async fn has_page(&self, document_id: &str, page: u32) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM vectors WHERE document_id = ?1 AND page = ?2 LIMIT 1")
            .bind(document_id)
            .bind(page as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COUNT(DISTINCT document_id) AS documents FROM vectors",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(IndexStats {
            total_vectors: row.get::<i64, _>("total") as usize,
            total_documents: row.get::<i64, _>("documents") as usize,
            dimension: self.dimension,
        })
    }

    async fn save_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO index_meta (key, value) VALUES (?1, ?2)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_meta(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM index_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(chunk_id: &str, document_id: &str, dense: Vec<f32>) -> VectorRecord {
        let chunk_index = chunk_id
            .rsplit(':')
            .next()
            .and_then(|i| i.parse().ok())
            .unwrap_or(0);
        VectorRecord {
            chunk_id: chunk_id.to_string(),
            dense,
            sparse: SparseVector::default(),
            metadata: VectorMetadata {
                document_id: document_id.to_string(),
                chunk_index,
                ticker: Some("AAPL".to_string()),
                company: Some("Apple Inc.".to_string()),
                doc_type: "filing".to_string(),
                source_type: "official".to_string(),
                fiscal_year: Some(2024),
                section: Some("Item 1A. Risk Factors".to_string()),
                page: 30,
                extracted_at: "2025-01-01T00:00:00Z".to_string(),
            },
            text_enriched: format!("[Document: test] chunk {}", chunk_id),
            text_raw: format!("chunk {}", chunk_id),
        }
    }

    async fn index() -> SqliteVectorIndex {
        SqliteVectorIndex::new("sqlite::memory:", 4, 0.7, 1)
            .await
            .unwrap()
    }

    #[test]
    fn test_dense_serialization_roundtrip() {
        let vector = vec![1.5, -2.25, 0.0, 42.0];
        let bytes = SqliteVectorIndex::serialize_dense(&vector);
        assert_eq!(SqliteVectorIndex::deserialize_dense(&bytes), vector);
    }

    #[tokio::test]
    async fn test_upsert_and_query() {
        let index = index().await;
        index
            .upsert(vec![
                record("doc:0", "doc", vec![1.0, 0.0, 0.0, 0.0]),
                record("doc:1", "doc", vec![0.0, 1.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let results = index
            .query(&[1.0, 0.0, 0.0, 0.0], None, 1, &MetadataFilter::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "doc:0");
    }

    #[tokio::test]
    async fn test_metadata_filter() {
        let index = index().await;
        let mut other = record("other:0", "other", vec![1.0, 0.0, 0.0, 0.0]);
        other.metadata.ticker = Some("MSFT".to_string());
        index
            .upsert(vec![record("doc:0", "doc", vec![1.0, 0.0, 0.0, 0.0]), other])
            .await
            .unwrap();

        let filter = MetadataFilter {
            ticker: Some("AAPL".to_string()),
            ..Default::default()
        };
        let results = index
            .query(&[1.0, 0.0, 0.0, 0.0], None, 10, &filter)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].metadata.ticker.as_deref(), Some("AAPL"));
    }

    #[tokio::test]
    async fn test_replace_document_removes_stale_vectors() {
        let index = index().await;
        index
            .upsert(vec![
                record("doc:0", "doc", vec![1.0, 0.0, 0.0, 0.0]),
                record("doc:1", "doc", vec![0.0, 1.0, 0.0, 0.0]),
                record("doc:2", "doc", vec![0.0, 0.0, 1.0, 0.0]),
            ])
            .await
            .unwrap();

        // Re-index with fewer chunks; the third must not survive.
        index
            .replace_document(
                "doc",
                vec![
                    record("doc:0", "doc", vec![1.0, 0.0, 0.0, 0.0]),
                    record("doc:1", "doc", vec![0.0, 1.0, 0.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let stats = index.stats().await.unwrap();
        assert_eq!(stats.total_vectors, 2);
        assert!(index.get_chunk("doc:2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_document_rejects_foreign_records() {
        let index = index().await;
        let result = index
            .replace_document("doc", vec![record("other:0", "other", vec![0.0; 4])])
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let index = index().await;
        let result = index.upsert(vec![record("doc:0", "doc", vec![1.0, 0.0])]).await;
        assert!(result.is_err());

        let result = index
            .query(&[1.0, 0.0], None, 5, &MetadataFilter::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_delete_by_filter() {
        let index = index().await;
        index
            .upsert(vec![
                record("a:0", "a", vec![1.0, 0.0, 0.0, 0.0]),
                record("b:0", "b", vec![0.0, 1.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let removed = index.delete(&MetadataFilter::for_document("a")).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(index.stats().await.unwrap().total_vectors, 1);
    }

    #[tokio::test]
    async fn test_meta_roundtrip() {
        let index = index().await;
        assert!(index.load_meta("vocab").await.unwrap().is_none());
        index.save_meta("vocab", "{\"a\":1}").await.unwrap();
        assert_eq!(
            index.load_meta("vocab").await.unwrap().as_deref(),
            Some("{\"a\":1}")
        );
    }

    #[tokio::test]
    async fn test_hybrid_scoring_uses_sparse() {
        let index = index().await;
        let mut weak = record("doc:0", "doc", vec![1.0, 0.0, 0.0, 0.0]);
        weak.sparse = SparseVector {
            indices: vec![7],
            values: vec![0.1],
        };
        let mut strong = record("doc:1", "doc", vec![1.0, 0.0, 0.0, 0.0]);
        strong.sparse = SparseVector {
            indices: vec![7],
            values: vec![5.0],
        };
        index.upsert(vec![weak, strong]).await.unwrap();

        let query_sparse = SparseVector {
            indices: vec![7],
            values: vec![1.0],
        };
        // Identical dense vectors, so the sparse component decides.
        let results = index
            .query(
                &[1.0, 0.0, 0.0, 0.0],
                Some(&query_sparse),
                2,
                &MetadataFilter::default(),
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk_id, "doc:1");
    }
}
