//! Durable conversation checkpoints
//!
//! Snapshots are opaque versioned JSON keyed by conversation id. Saves
//! are atomic and monotonic: a snapshot with a version at or below the
//! stored one is a conflict. An in-process lock registry serializes turns
//! per conversation.

use crate::error::{AgentError, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

/// Validate a conversation id at the boundary: must be a UUID v4.
/// Runs before any store access.
pub fn validate_conversation_id(id: &str) -> Result<Uuid> {
    let uuid = Uuid::parse_str(id)
        .map_err(|_| AgentError::Validation(format!("conversation_id is not a UUID: {}", id)))?;
    if uuid.get_version_num() != 4 {
        return Err(AgentError::Validation(format!(
            "conversation_id is not UUID v4: {}",
            id
        )));
    }
    Ok(uuid)
}

/// A loaded snapshot
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub version: i64,
    pub state_json: String,
}

/// Per-conversation async lock registry. Turns on one conversation are
/// strictly serialized; distinct conversations proceed independently.
#[derive(Default)]
pub struct ConversationLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for one conversation, waiting behind any active turn
    pub async fn acquire(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// SQLite-backed checkpoint store
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    /// Open the store, creating the table if missing
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        info!(database_url, "initializing checkpoint store");
        super::ensure_sqlite_dir(database_url)?;

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                conversation_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Save a snapshot. The version must be strictly greater than the
    /// stored version; otherwise the save is a [`AgentError::CheckpointConflict`].
    pub async fn save(&self, conversation_id: &str, version: i64, state_json: &str) -> Result<()> {
        validate_conversation_id(conversation_id)?;

        let result = sqlx::query(
            r#"
            INSERT INTO checkpoints (conversation_id, version, state, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(conversation_id) DO UPDATE SET
                version = excluded.version,
                state = excluded.state,
                updated_at = excluded.updated_at
            WHERE excluded.version > checkpoints.version
            "#,
        )
        .bind(conversation_id)
        .bind(version)
        .bind(state_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AgentError::CheckpointConflict {
                conversation_id: conversation_id.to_string(),
            });
        }

        debug!(conversation_id, version, "checkpoint saved");
        Ok(())
    }

    /// Load the latest snapshot for a conversation
    pub async fn load(&self, conversation_id: &str) -> Result<Option<Snapshot>> {
        validate_conversation_id(conversation_id)?;

        let row = sqlx::query("SELECT version, state FROM checkpoints WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| Snapshot {
            version: r.get("version"),
            state_json: r.get("state"),
        }))
    }

    /// Delete a conversation's snapshot
    pub async fn delete(&self, conversation_id: &str) -> Result<()> {
        validate_conversation_id(conversation_id)?;
        sqlx::query("DELETE FROM checkpoints WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Liveness probe for health checks
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    #[test]
    fn test_conversation_id_validation() {
        assert!(validate_conversation_id(&new_id()).is_ok());
        assert!(validate_conversation_id("not-a-uuid").is_err());
        assert!(validate_conversation_id("").is_err());
        // Valid UUID but wrong version (v1 layout).
        assert!(validate_conversation_id("c232ab00-9414-11ec-b3c8-9f6bdeced846").is_err());
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let store = CheckpointStore::new("sqlite::memory:", 1).await.unwrap();
        let id = new_id();

        assert!(store.load(&id).await.unwrap().is_none());

        store.save(&id, 1, r#"{"turn":1}"#).await.unwrap();
        let snapshot = store.load(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.state_json, r#"{"turn":1}"#);

        store.save(&id, 2, r#"{"turn":2}"#).await.unwrap();
        let snapshot = store.load(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.version, 2);
    }

    #[tokio::test]
    async fn test_version_regression_conflicts() {
        let store = CheckpointStore::new("sqlite::memory:", 1).await.unwrap();
        let id = new_id();

        store.save(&id, 5, "{}").await.unwrap();

        // Equal and lower versions both conflict.
        let equal = store.save(&id, 5, "{}").await;
        assert!(matches!(equal, Err(AgentError::CheckpointConflict { .. })));
        let lower = store.save(&id, 3, "{}").await;
        assert!(matches!(lower, Err(AgentError::CheckpointConflict { .. })));

        // State is unchanged after the conflicts.
        assert_eq!(store.load(&id).await.unwrap().unwrap().version, 5);
    }

    #[tokio::test]
    async fn test_invalid_id_rejected_before_store_access() {
        let store = CheckpointStore::new("sqlite::memory:", 1).await.unwrap();
        assert!(store.save("bogus", 1, "{}").await.is_err());
        assert!(store.load("bogus").await.is_err());
    }

    #[tokio::test]
    async fn test_locks_serialize_per_conversation() {
        let locks = Arc::new(ConversationLocks::new());
        let id = new_id();

        let guard = locks.acquire(&id).await;

        // A second acquire on the same conversation must wait.
        let locks2 = locks.clone();
        let id2 = id.clone();
        let pending = tokio::spawn(async move {
            let _guard = locks2.acquire(&id2).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        // A different conversation proceeds immediately.
        let _other = locks.acquire(&new_id()).await;

        drop(guard);
        pending.await.unwrap();
    }
}
