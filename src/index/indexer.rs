//! Indexing pipeline: chunks to vectors and graph entries
//!
//! Chunks each extracted document, encodes dense and sparse vectors,
//! replaces the document's vectors atomically, merges entities and
//! relations into the graph, and records completion in the manifest.
//! The manifest makes re-runs over unchanged documents produce zero
//! index writes.

use super::chunker::{chunk_pages, Chunk, ChunkerConfig};
use super::embedding::EmbeddingService;
use super::entities::EntityExtractor;
use super::graph::GraphStore;
use super::sparse::SparseEncoder;
use super::vector::{VectorIndex, VectorMetadata, VectorRecord};
use crate::error::Result;
use crate::extraction::manifest::Manifest;
use crate::extraction::types::{DocType, ExtractionRecord, SourceType};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Meta key under which the sparse vocabulary is persisted
const SPARSE_VOCAB_KEY: &str = "sparse_vocab";

/// Summary of an indexing run
#[derive(Debug, Default)]
pub struct IndexSummary {
    pub indexed_documents: usize,
    pub skipped_documents: usize,
    pub total_chunks: usize,
}

/// Drives the chunk → encode → upsert pipeline
pub struct Indexer {
    embeddings: EmbeddingService,
    vector_index: Arc<dyn VectorIndex>,
    graph: Arc<GraphStore>,
    chunker: ChunkerConfig,
    entity_extractor: EntityExtractor,
    extracted_dir: PathBuf,
}

impl Indexer {
    pub fn new(
        embeddings: EmbeddingService,
        vector_index: Arc<dyn VectorIndex>,
        graph: Arc<GraphStore>,
        extracted_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            embeddings,
            vector_index,
            graph,
            chunker: ChunkerConfig::default(),
            entity_extractor: EntityExtractor::new(),
            extracted_dir: extracted_dir.into(),
        }
    }

    /// Index every record, honoring the manifest unless `reindex` forces
    /// a full rebuild.
    pub async fn index_all(
        &self,
        records: &[ExtractionRecord],
        reindex: bool,
    ) -> Result<IndexSummary> {
        let manifest_path = Manifest::path_in(&self.extracted_dir);
        let manifest = Manifest::load(&manifest_path)?;

        let pending: Vec<&ExtractionRecord> = records
            .iter()
            .filter(|r| manifest.needs_indexing(&r.metadata.document_id, reindex))
            .collect();

        let mut summary = IndexSummary {
            skipped_documents: records.len() - pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            info!("index up to date, nothing to do");
            return Ok(summary);
        }

        // The sparse vocabulary spans the whole corpus so query-time
        // encoding matches index-time weights.
        let encoder = self.build_vocabulary(records).await?;

        for record in pending {
            let chunks = self.index_document(record, &encoder).await?;
            summary.indexed_documents += 1;
            summary.total_chunks += chunks;
        }

        Ok(summary)
    }

    /// Index one document with the given encoder, updating the manifest
    pub async fn index_document(
        &self,
        record: &ExtractionRecord,
        encoder: &SparseEncoder,
    ) -> Result<usize> {
        let document_id = &record.metadata.document_id;
        let chunks = chunk_pages(&record.metadata, &record.pages, &self.chunker);
        info!(document_id, chunks = chunks.len(), "indexing document");

        let enriched: Vec<String> = chunks.iter().map(|c| c.text_enriched.clone()).collect();
        let dense_vectors = self.embeddings.embed_batch(&enriched).await?;

        let vector_records: Vec<VectorRecord> = chunks
            .iter()
            .zip(dense_vectors)
            .map(|(chunk, dense)| VectorRecord {
                chunk_id: chunk.chunk_id.clone(),
                dense,
                sparse: encoder.encode(&chunk.text_enriched),
                metadata: vector_metadata(record, chunk),
                text_enriched: chunk.text_enriched.clone(),
                text_raw: chunk.text_raw.clone(),
            })
            .collect();

        let count = vector_records.len();
        self.vector_index
            .replace_document(document_id, vector_records)
            .await?;

        self.index_graph(document_id, &chunks).await?;

        // Manifest last, only after every store write succeeded.
        let manifest_path = Manifest::path_in(&self.extracted_dir);
        let mut manifest = Manifest::load(&manifest_path)?;
        if manifest.documents.contains_key(document_id) {
            manifest.record_indexing(document_id, count)?;
            manifest.save(&manifest_path)?;
        }

        Ok(count)
    }

    /// Load the persisted sparse encoder, if any
    pub async fn load_encoder(&self) -> Result<Option<SparseEncoder>> {
        match self.vector_index.load_meta(SPARSE_VOCAB_KEY).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn build_vocabulary(&self, records: &[ExtractionRecord]) -> Result<SparseEncoder> {
        let mut corpus = Vec::new();
        for record in records {
            for chunk in chunk_pages(&record.metadata, &record.pages, &self.chunker) {
                corpus.push(chunk.text_enriched);
            }
        }
        let encoder = SparseEncoder::build(&corpus);
        debug!(
            documents = records.len(),
            vocab = encoder.vocab_size(),
            "built sparse vocabulary"
        );
        self.vector_index
            .save_meta(SPARSE_VOCAB_KEY, &serde_json::to_string(&encoder)?)
            .await?;
        Ok(encoder)
    }

    async fn index_graph(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        // Re-indexing drops this document's old relations first; entities
        // persist because other documents may reference them.
        self.graph.delete_document_relations(document_id).await?;

        for chunk in chunks {
            let relations = self.entity_extractor.extract_relations(&chunk.text_raw);
            for relation in relations {
                let src = self
                    .graph
                    .merge_entity(relation.src_type, &relation.src, &[])
                    .await?;
                let dst = self
                    .graph
                    .merge_entity(relation.dst_type, &relation.dst, &[])
                    .await?;
                self.graph
                    .merge_relation(
                        src,
                        dst,
                        relation.relation_type,
                        &chunk.chunk_id,
                        relation.confidence,
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

fn vector_metadata(record: &ExtractionRecord, chunk: &Chunk) -> VectorMetadata {
    let meta = &record.metadata;
    VectorMetadata {
        document_id: meta.document_id.clone(),
        chunk_index: chunk.chunk_index,
        ticker: meta.ticker.clone(),
        company: meta.company.clone(),
        doc_type: match meta.doc_type {
            DocType::Filing => "filing".to_string(),
            DocType::Reference => "reference".to_string(),
        },
        source_type: match meta.source_type {
            SourceType::Official => "official".to_string(),
            SourceType::News => "news".to_string(),
            SourceType::Research => "research".to_string(),
            SourceType::Policy => "policy".to_string(),
        },
        fiscal_year: meta.fiscal_year,
        section: chunk.section.clone(),
        page: chunk.start_page,
        extracted_at: meta.extracted_at.to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::extraction::types::{ContentType, DocumentMetadata, PageExtraction};
    use crate::index::vector::{MetadataFilter, SqliteVectorIndex};
    use crate::llm::MockLlmClient;
    use chrono::Utc;
    use std::path::Path;
    use tempfile::tempdir;

    fn record(document_id: &str, text: &str) -> ExtractionRecord {
        ExtractionRecord {
            metadata: DocumentMetadata {
                document_id: document_id.to_string(),
                doc_type: DocType::Filing,
                source_type: SourceType::Official,
                ticker: Some("AAPL".to_string()),
                company: Some("Apple Inc.".to_string()),
                fiscal_year: Some(2024),
                publication_date: None,
                source: None,
                file_hash: "hash".to_string(),
                page_count: 1,
                extracted_at: Utc::now(),
                extraction_cost: 0.0,
            },
            pages: vec![PageExtraction {
                page_number: 1,
                section: Some("Item 1A. Risk Factors".to_string()),
                content_type: ContentType::Narrative,
                text: text.to_string(),
                tables: vec![],
                financial_metrics: None,
                segment_data: vec![],
                geographic_data: vec![],
                risk_factors: vec![],
                cross_references: vec![],
                key_claims: vec![],
                entities: vec![],
                error: None,
            }],
            consolidated: None,
        }
    }

    async fn indexer(dir: &Path) -> (Indexer, Arc<SqliteVectorIndex>, Arc<GraphStore>) {
        let vector_index = Arc::new(
            SqliteVectorIndex::new("sqlite::memory:", 32, 0.7, 1)
                .await
                .unwrap(),
        );
        let graph = Arc::new(GraphStore::new("sqlite::memory:", 1).await.unwrap());
        let embeddings = EmbeddingService::new(
            Arc::new(MockLlmClient::with_dimension(32)),
            &EmbeddingConfig {
                model: "mock".to_string(),
                dimension: 32,
                batch_size: 25,
            },
        );
        let indexer = Indexer::new(
            embeddings,
            vector_index.clone() as Arc<dyn VectorIndex>,
            graph.clone(),
            dir,
        );
        (indexer, vector_index, graph)
    }

    #[tokio::test]
    async fn test_index_all_writes_vectors_and_manifest() {
        let dir = tempdir().unwrap();
        let manifest_path = Manifest::path_in(dir.path());
        let mut manifest = Manifest::default();
        manifest.record_extraction("aapl_10-k_2024", "hash", 0.1);
        manifest.save(&manifest_path).unwrap();

        let (indexer, vector_index, graph) = indexer(dir.path()).await;
        let records = vec![record(
            "aapl_10-k_2024",
            "Apple Inc. reported revenue of $394,328 million. Supply chain disruption remains a risk.",
        )];

        let summary = indexer.index_all(&records, false).await.unwrap();
        assert_eq!(summary.indexed_documents, 1);
        assert!(summary.total_chunks > 0);

        // Vector count matches manifest chunk count.
        let stats = vector_index.stats().await.unwrap();
        let manifest = Manifest::load(&manifest_path).unwrap();
        let entry = &manifest.documents["aapl_10-k_2024"];
        assert!(entry.indexed_to_vi);
        assert_eq!(entry.chunk_count, Some(stats.total_vectors));

        // Entity relations landed in the graph.
        let (entities, relations) = graph.stats().await.unwrap();
        assert!(entities > 0);
        assert!(relations > 0);

        // The sparse vocabulary was persisted for query-time use.
        assert!(indexer.load_encoder().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reindex_idempotent() {
        let dir = tempdir().unwrap();
        let manifest_path = Manifest::path_in(dir.path());
        let mut manifest = Manifest::default();
        manifest.record_extraction("aapl_10-k_2024", "hash", 0.1);
        manifest.save(&manifest_path).unwrap();

        let (indexer, vector_index, _) = indexer(dir.path()).await;
        let records = vec![record("aapl_10-k_2024", "Some filing narrative text here.")];

        indexer.index_all(&records, false).await.unwrap();
        let first = vector_index.stats().await.unwrap().total_vectors;

        // Second run: manifest says indexed, zero writes.
        let summary = indexer.index_all(&records, false).await.unwrap();
        assert_eq!(summary.indexed_documents, 0);
        assert_eq!(summary.skipped_documents, 1);
        assert_eq!(vector_index.stats().await.unwrap().total_vectors, first);

        // Forced reindex replaces rather than duplicates.
        let summary = indexer.index_all(&records, true).await.unwrap();
        assert_eq!(summary.indexed_documents, 1);
        assert_eq!(vector_index.stats().await.unwrap().total_vectors, first);
    }

    #[tokio::test]
    async fn test_indexed_vectors_carry_metadata() {
        let dir = tempdir().unwrap();
        let manifest_path = Manifest::path_in(dir.path());
        let mut manifest = Manifest::default();
        manifest.record_extraction("aapl_10-k_2024", "hash", 0.1);
        manifest.save(&manifest_path).unwrap();

        let (indexer, vector_index, _) = indexer(dir.path()).await;
        let records = vec![record(
            "aapl_10-k_2024",
            "Supply chain risks could disrupt manufacturing capacity.",
        )];
        indexer.index_all(&records, false).await.unwrap();

        let query = MockLlmClient::pseudo_embedding("supply chain", 32);
        let results = vector_index
            .query(&query, None, 5, &MetadataFilter::default())
            .await
            .unwrap();
        assert!(!results.is_empty());
        let hit = &results[0];
        assert_eq!(hit.metadata.ticker.as_deref(), Some("AAPL"));
        assert_eq!(hit.metadata.doc_type, "filing");
        assert_eq!(hit.metadata.fiscal_year, Some(2024));
        assert!(hit.metadata.section.as_deref().unwrap().contains("Risk Factors"));
        assert!(hit.text_enriched.starts_with("[Document:"));
    }
}
