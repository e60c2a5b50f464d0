//! Knowledge graph store: entities, relations, k-hop traversal

use crate::error::{IndexError, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use tracing::{debug, info};

/// Entity categories recognized by the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Organization,
    Person,
    Location,
    Regulation,
    Concept,
    Product,
    Metric,
    Document,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Organization => "Organization",
            EntityType::Person => "Person",
            EntityType::Location => "Location",
            EntityType::Regulation => "Regulation",
            EntityType::Concept => "Concept",
            EntityType::Product => "Product",
            EntityType::Metric => "Metric",
            EntityType::Document => "Document",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Organization" => Some(EntityType::Organization),
            "Person" => Some(EntityType::Person),
            "Location" => Some(EntityType::Location),
            "Regulation" => Some(EntityType::Regulation),
            "Concept" => Some(EntityType::Concept),
            "Product" => Some(EntityType::Product),
            "Metric" => Some(EntityType::Metric),
            "Document" => Some(EntityType::Document),
            _ => None,
        }
    }
}

/// Relation categories between entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationType {
    Mentions,
    RelatedTo,
    GovernedBy,
    Reported,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::Mentions => "MENTIONS",
            RelationType::RelatedTo => "RELATED_TO",
            RelationType::GovernedBy => "GOVERNED_BY",
            RelationType::Reported => "REPORTED",
        }
    }
}

/// A stored entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: i64,
    pub entity_type: EntityType,
    pub canonical_name: String,
    pub aliases: Vec<String>,
}

/// Result of a graph traversal
#[derive(Debug, Clone)]
pub struct RelatedEntity {
    pub entity: Entity,
    pub distance: u32,
    pub supporting_chunks: Vec<String>,
}

/// SQLite-backed graph store
pub struct GraphStore {
    pool: SqlitePool,
}

impl GraphStore {
    /// Open (creating if missing) the graph database
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        info!(database_url, "initializing graph store");
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
            CREATE TABLE IF NOT EXISTS entities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                canonical_name TEXT NOT NULL,
                aliases TEXT NOT NULL DEFAULT '[]',
                UNIQUE(entity_type, canonical_name)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                src_entity_id INTEGER NOT NULL REFERENCES entities(id),
                dst_entity_id INTEGER NOT NULL REFERENCES entities(id),
                relation_type TEXT NOT NULL,
                source_chunk_id TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 1.0,
                UNIQUE(src_entity_id, dst_entity_id, relation_type, source_chunk_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_relations_src ON relations(src_entity_id)")
            .execute(&pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_relations_dst ON relations(dst_entity_id)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Idempotent entity merge keyed by (type, canonical_name); aliases
    /// union on conflict. Returns the entity id.
    pub async fn merge_entity(
        &self,
        entity_type: EntityType,
        canonical_name: &str,
        aliases: &[String],
    ) -> Result<i64> {
        let name = canonical_name.trim();
        if name.is_empty() {
            return Err(IndexError::UnknownEntity("empty canonical name".to_string()).into());
        }

        let existing = sqlx::query(
            "SELECT id, aliases FROM entities WHERE entity_type = ?1 AND canonical_name = ?2",
        )
        .bind(entity_type.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some(row) => {
                let id: i64 = row.get("id");
                let mut stored: Vec<String> =
                    serde_json::from_str(&row.get::<String, _>("aliases")).unwrap_or_default();
                let mut changed = false;
                for alias in aliases {
                    if !stored.iter().any(|a| a.eq_ignore_ascii_case(alias)) {
                        stored.push(alias.clone());
                        changed = true;
                    }
                }
                if changed {
                    sqlx::query("UPDATE entities SET aliases = ?1 WHERE id = ?2")
                        .bind(serde_json::to_string(&stored)?)
                        .bind(id)
                        .execute(&self.pool)
                        .await?;
                }
                Ok(id)
            }
            None => {
                let result = sqlx::query(
                    "INSERT INTO entities (entity_type, canonical_name, aliases) VALUES (?1, ?2, ?3)",
                )
                .bind(entity_type.as_str())
                .bind(name)
                .bind(serde_json::to_string(aliases)?)
                .execute(&self.pool)
                .await?;
                Ok(result.last_insert_rowid())
            }
        }
    }

    /// Idempotent relation merge. Both endpoints must exist.
    pub async fn merge_relation(
        &self,
        src_entity_id: i64,
        dst_entity_id: i64,
        relation_type: RelationType,
        source_chunk_id: &str,
        confidence: f64,
    ) -> Result<()> {
        for id in [src_entity_id, dst_entity_id] {
            let exists = sqlx::query("SELECT 1 FROM entities WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            if exists.is_none() {
                return Err(IndexError::UnknownEntity(format!("entity id {}", id)).into());
            }
        }

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO relations
                (src_entity_id, dst_entity_id, relation_type, source_chunk_id, confidence)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(src_entity_id)
        .bind(dst_entity_id)
        .bind(relation_type.as_str())
        .bind(source_chunk_id)
        .bind(confidence.clamp(0.0, 1.0))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Resolve an entity by canonical name or alias (case-insensitive)
    pub async fn resolve(&self, name: &str) -> Result<Option<Entity>> {
        let rows = sqlx::query("SELECT * FROM entities")
            .fetch_all(&self.pool)
            .await?;

        let target = name.trim().to_lowercase();
        for row in rows {
            let entity = Self::row_to_entity(&row)?;
            if entity.canonical_name.to_lowercase() == target
                || entity.aliases.iter().any(|a| a.to_lowercase() == target)
            {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    /// BFS from the named entities, up to `max_hops` (capped at 2).
    /// Returns discovered neighbors with their distance and the chunk ids
    /// of the relations crossed to reach them.
    pub async fn find_related(
        &self,
        entity_names: &[String],
        max_hops: u32,
    ) -> Result<Vec<RelatedEntity>> {
        let max_hops = max_hops.min(2);

        let mut seeds = Vec::new();
        for name in entity_names {
            if let Some(entity) = self.resolve(name).await? {
                seeds.push(entity);
            }
        }
        if seeds.is_empty() {
            return Ok(vec![]);
        }

        // Adjacency over both directions of every relation.
        let relation_rows = sqlx::query(
            "SELECT src_entity_id, dst_entity_id, source_chunk_id FROM relations",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut adjacency: HashMap<i64, Vec<(i64, String)>> = HashMap::new();
        for row in &relation_rows {
            let src: i64 = row.get("src_entity_id");
            let dst: i64 = row.get("dst_entity_id");
            let chunk: String = row.get("source_chunk_id");
            adjacency.entry(src).or_default().push((dst, chunk.clone()));
            adjacency.entry(dst).or_default().push((src, chunk));
        }

        let mut visited: HashSet<i64> = seeds.iter().map(|e| e.entity_id).collect();
        let mut queue: VecDeque<(i64, u32)> =
            seeds.iter().map(|e| (e.entity_id, 0)).collect();
        let mut found: HashMap<i64, (u32, Vec<String>)> = HashMap::new();

        while let Some((current, distance)) = queue.pop_front() {
            if distance >= max_hops {
                continue;
            }
            if let Some(neighbors) = adjacency.get(&current) {
                for (neighbor, chunk) in neighbors {
                    let entry = found
                        .entry(*neighbor)
                        .or_insert_with(|| (distance + 1, Vec::new()));
                    if !entry.1.contains(chunk) {
                        entry.1.push(chunk.clone());
                    }
                    if visited.insert(*neighbor) {
                        queue.push_back((*neighbor, distance + 1));
                    }
                }
            }
        }

        // Seeds themselves are not results.
        for seed in &seeds {
            found.remove(&seed.entity_id);
        }

        let mut results = Vec::new();
        for (entity_id, (distance, supporting_chunks)) in found {
            let row = sqlx::query("SELECT * FROM entities WHERE id = ?")
                .bind(entity_id)
                .fetch_one(&self.pool)
                .await?;
            results.push(RelatedEntity {
                entity: Self::row_to_entity(&row)?,
                distance,
                supporting_chunks,
            });
        }
        results.sort_by(|a, b| {
            a.distance
                .cmp(&b.distance)
                .then_with(|| a.entity.canonical_name.cmp(&b.entity.canonical_name))
        });

        debug!(
            seeds = seeds.len(),
            found = results.len(),
            max_hops,
            "graph traversal complete"
        );
        Ok(results)
    }

    /// Total entity and relation counts
    pub async fn stats(&self) -> Result<(usize, usize)> {
        let entities: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entities")
            .fetch_one(&self.pool)
            .await?;
        let relations: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM relations")
            .fetch_one(&self.pool)
            .await?;
        Ok((entities.0 as usize, relations.0 as usize))
    }

    /// Remove relations sourced from a document's chunks
    pub async fn delete_document_relations(&self, document_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM relations WHERE source_chunk_id LIKE ?")
            .bind(format!("{}:%", document_id))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    fn row_to_entity(row: &sqlx::sqlite::SqliteRow) -> Result<Entity> {
        let type_str: String = row.get("entity_type");
        let entity_type = EntityType::parse(&type_str)
            .ok_or_else(|| IndexError::UnknownEntity(format!("bad entity type {}", type_str)))?;
        Ok(Entity {
            entity_id: row.get("id"),
            entity_type,
            canonical_name: row.get("canonical_name"),
            aliases: serde_json::from_str(&row.get::<String, _>("aliases")).unwrap_or_default(),
        })
    }
}
