//! Semantic response cache
//!
//! Entries are keyed by the L2-normalized query embedding. A lookup
//! returns the nearest unexpired entry whose cosine similarity clears the
//! configured threshold. TTL is authoritative: expired entries are treated
//! as absent by readers even before the store reclaims them.

use crate::config::CacheConfig;
use crate::error::Result;
use crate::index::embedding::{cosine_similarity, normalize_l2};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

/// Tool/citation trace stored with each cached response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheTrace {
    /// Document ids cited by the cached answer
    pub documents: Vec<String>,
    /// Tools invoked while producing it
    pub tools: Vec<String>,
}

/// A cache hit
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub canonical_query: String,
    pub response: String,
    pub similarity: f32,
    pub trace: CacheTrace,
}

/// SQLite-backed semantic cache
pub struct ResponseCache {
    pool: SqlitePool,
    config: CacheConfig,
}

impl ResponseCache {
    /// Open the cache database
    pub async fn new(database_url: &str, config: CacheConfig) -> Result<Self> {
        info!(database_url, enabled = config.enabled, "initializing response cache");
        crate::store::ensure_sqlite_dir(database_url)?;

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS response_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                canonical_query TEXT NOT NULL,
                embedding BLOB NOT NULL,
                response TEXT NOT NULL,
                trace TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                last_accessed TEXT NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cache_last_accessed ON response_cache(last_accessed)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, config })
    }

    fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    fn deserialize_embedding(data: &[u8]) -> Vec<f32> {
        data.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Look up the nearest unexpired entry above the similarity threshold
    pub async fn lookup(&self, query_embedding: &[f32]) -> Result<Option<CacheHit>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let mut query = query_embedding.to_vec();
        normalize_l2(&mut query);

        let rows = sqlx::query("SELECT * FROM response_cache")
            .fetch_all(&self.pool)
            .await?;

        let now = Utc::now();
        let ttl = Duration::seconds(self.config.ttl_secs);
        let mut best: Option<(i64, f32, CacheHit)> = None;

        for row in rows {
            let created_at: String = row.get("created_at");
            let created = DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(now);

            // Expired entries are absent to readers regardless of whether
            // reclamation has run.
            if now.signed_duration_since(created) > ttl {
                continue;
            }

            let embedding = Self::deserialize_embedding(&row.get::<Vec<u8>, _>("embedding"));
            let similarity = cosine_similarity(&query, &embedding);
            if similarity < self.config.similarity_threshold {
                continue;
            }

            if best.as_ref().map_or(true, |(_, s, _)| similarity > *s) {
                let trace: CacheTrace =
                    serde_json::from_str(&row.get::<String, _>("trace")).unwrap_or_default();
                best = Some((
                    row.get("id"),
                    similarity,
                    CacheHit {
                        canonical_query: row.get("canonical_query"),
                        response: row.get("response"),
                        similarity,
                        trace,
                    },
                ));
            }
        }

        match best {
            Some((id, similarity, hit)) => {
                sqlx::query(
                    "UPDATE response_cache SET last_accessed = ?1, hit_count = hit_count + 1 WHERE id = ?2",
                )
                .bind(now.to_rfc3339())
                .bind(id)
                .execute(&self.pool)
                .await?;
                debug!(similarity, query = hit.canonical_query, "semantic cache hit");
                Ok(Some(hit))
            }
            None => Ok(None),
        }
    }

    /// Store a response keyed by its query embedding
    pub async fn store(
        &self,
        query: &str,
        query_embedding: &[f32],
        response: &str,
        trace: &CacheTrace,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let mut embedding = query_embedding.to_vec();
        normalize_l2(&mut embedding);
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO response_cache
                (canonical_query, embedding, response, trace, created_at, last_accessed)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(query)
        .bind(Self::serialize_embedding(&embedding))
        .bind(response)
        .bind(serde_json::to_string(trace)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.enforce_size_limit().await?;
        debug!(query, "cached response");
        Ok(())
    }

    /// Purge entries whose trace cites a document
    pub async fn invalidate_by_document(&self, document_id: &str) -> Result<usize> {
        let rows = sqlx::query("SELECT id, trace FROM response_cache")
            .fetch_all(&self.pool)
            .await?;

        let mut removed = 0;
        for row in rows {
            let trace: CacheTrace =
                serde_json::from_str(&row.get::<String, _>("trace")).unwrap_or_default();
            if trace.documents.iter().any(|d| d == document_id) {
                sqlx::query("DELETE FROM response_cache WHERE id = ?")
                    .bind(row.get::<i64, _>("id"))
                    .execute(&self.pool)
                    .await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(document_id, removed, "invalidated cache entries");
        }
        Ok(removed)
    }

    /// Delete entries past their TTL
    pub async fn reclaim_expired(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::seconds(self.config.ttl_secs);
        let result = sqlx::query("DELETE FROM response_cache WHERE created_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn enforce_size_limit(&self) -> Result<()> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM response_cache")
            .fetch_one(&self.pool)
            .await?;

        if count.0 > self.config.max_entries as i64 {
            let to_remove = count.0 - self.config.max_entries as i64;
            sqlx::query(
                r#"
                DELETE FROM response_cache
                WHERE id IN (
                    SELECT id FROM response_cache
                    ORDER BY last_accessed ASC
                    LIMIT ?
                )
                "#,
            )
            .bind(to_remove)
            .execute(&self.pool)
            .await?;
            info!(evicted = to_remove, "cache size limit enforced");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    async fn cache(config: CacheConfig) -> ResponseCache {
        ResponseCache::new("sqlite::memory:", config).await.unwrap()
    }

    fn embed(text: &str) -> Vec<f32> {
        MockLlmClient::pseudo_embedding(text, 64)
    }

    #[tokio::test]
    async fn test_exact_match_hit() {
        let cache = cache(CacheConfig::default()).await;
        let query = "Compare gross margins across tech companies";
        let embedding = embed(query);

        cache
            .store(query, &embedding, "Margins compared.", &CacheTrace::default())
            .await
            .unwrap();

        let hit = cache.lookup(&embedding).await.unwrap().unwrap();
        assert_eq!(hit.response, "Margins compared.");
        assert!(hit.similarity > 0.999);
    }

    #[tokio::test]
    async fn test_dissimilar_query_misses() {
        let cache = cache(CacheConfig::default()).await;
        cache
            .store(
                "gross margins",
                &embed("gross margins"),
                "answer",
                &CacheTrace::default(),
            )
            .await
            .unwrap();

        // Pseudo-embeddings of unrelated text land far below 0.95.
        let miss = cache.lookup(&embed("supply chain risks")).await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_absent_to_readers() {
        let config = CacheConfig {
            ttl_secs: 0,
            ..Default::default()
        };
        let cache = cache(config).await;
        let embedding = embed("query");

        cache
            .store("query", &embedding, "answer", &CacheTrace::default())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        // Entry still physically present, but readers treat it as absent.
        assert!(cache.lookup(&embedding).await.unwrap().is_none());

        let reclaimed = cache.reclaim_expired().await.unwrap();
        assert_eq!(reclaimed, 1);
    }

    #[tokio::test]
    async fn test_invalidate_by_document() {
        let cache = cache(CacheConfig::default()).await;
        let trace = CacheTrace {
            documents: vec!["aapl_10-k_2024".to_string()],
            tools: vec!["document_search".to_string()],
        };
        cache
            .store("q1", &embed("q1"), "a1", &trace)
            .await
            .unwrap();
        cache
            .store("q2", &embed("q2"), "a2", &CacheTrace::default())
            .await
            .unwrap();

        let removed = cache.invalidate_by_document("aapl_10-k_2024").await.unwrap();
        assert_eq!(removed, 1);

        assert!(cache.lookup(&embed("q1")).await.unwrap().is_none());
        assert!(cache.lookup(&embed("q2")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_disabled_cache_never_hits() {
        let config = CacheConfig {
            enabled: false,
            ..Default::default()
        };
        let cache = cache(config).await;
        let embedding = embed("query");
        cache
            .store("query", &embedding, "answer", &CacheTrace::default())
            .await
            .unwrap();
        assert!(cache.lookup(&embedding).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_size_limit_evicts_lru() {
        let config = CacheConfig {
            max_entries: 2,
            ..Default::default()
        };
        let cache = cache(config).await;

        for i in 0..4 {
            let query = format!("query number {}", i);
            cache
                .store(&query, &embed(&query), "answer", &CacheTrace::default())
                .await
                .unwrap();
        }

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM response_cache")
            .fetch_one(&cache.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 2);
    }
}
