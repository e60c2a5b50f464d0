//! Hybrid document retrieval tool
//!
//! Pipeline: query expansion → parallel hybrid retrieval plus knowledge
//! graph candidates → reciprocal-rank fusion with a configurable graph
//! boost → model rerank → contextual compression → citations. Every
//! stage fails open to the next when it produces nothing.

use super::Tool;
use crate::config::RagConfig;
use crate::error::{AgentError, Result};
use crate::events::Citation;
use crate::index::chunker::split_sentences;
use crate::index::embedding::EmbeddingService;
use crate::index::entities::EntityExtractor;
use crate::index::graph::GraphStore;
use crate::index::sparse::SparseEncoder;
use crate::index::vector::{MetadataFilter, ScoredChunk, VectorIndex};
use crate::llm::{user_message, LlmClient};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Meta key where the indexer persisted the sparse vocabulary
const SPARSE_VOCAB_KEY: &str = "sparse_vocab";

/// One retrieved passage after compression
#[derive(Debug, Clone, Serialize)]
pub struct Passage {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub score: f32,
    pub section: Option<String>,
    pub page: u32,
    pub source_type: String,
}

/// Final ranked retrieval output
#[derive(Debug, Clone, Serialize)]
pub struct RankedPassages {
    pub passages: Vec<Passage>,
    pub citations: Vec<Citation>,
}

struct FusionEntry {
    chunk: ScoredChunk,
    rrf_score: f64,
    contributing_lists: usize,
    best_rank: usize,
}

/// The retrieval tool
pub struct RagTool {
    llm: Arc<dyn LlmClient>,
    expansion_model: String,
    rerank_model: String,
    embeddings: EmbeddingService,
    vector_index: Arc<dyn VectorIndex>,
    graph: Arc<GraphStore>,
    entity_extractor: EntityExtractor,
    config: RagConfig,
    encoder: OnceCell<Option<Arc<SparseEncoder>>>,
}

impl RagTool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        expansion_model: impl Into<String>,
        rerank_model: impl Into<String>,
        embeddings: EmbeddingService,
        vector_index: Arc<dyn VectorIndex>,
        graph: Arc<GraphStore>,
        config: RagConfig,
    ) -> Self {
        Self {
            llm,
            expansion_model: expansion_model.into(),
            rerank_model: rerank_model.into(),
            embeddings,
            vector_index,
            graph,
            entity_extractor: EntityExtractor::new(),
            config,
            encoder: OnceCell::new(),
        }
    }

    /// Retrieve, fuse, rerank, and compress passages for a question
    pub async fn retrieve(
        &self,
        question: &str,
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<RankedPassages> {
        let queries = self.expand_query(question).await;
        debug!(variants = queries.len(), "query set ready");

        let ranked_lists = self.parallel_retrieve(&queries, filter).await;
        let kg_chunk_ids = self.graph_candidates(question).await;

        let fused = self.fuse(ranked_lists, &kg_chunk_ids).await;
        if fused.is_empty() {
            return Ok(RankedPassages {
                passages: vec![],
                citations: vec![],
            });
        }

        let reranked = self.rerank(question, fused).await;
        let kept: Vec<(f32, ScoredChunk)> = reranked.into_iter().take(top_k).collect();

        let mut passages = Vec::with_capacity(kept.len());
        let mut citations: Vec<Citation> = Vec::new();
        for (score, chunk) in kept {
            let citation = Citation {
                document_id: chunk.metadata.document_id.clone(),
                company: chunk.metadata.company.clone(),
                section: chunk.metadata.section.clone(),
                page: chunk.metadata.page,
            };
            // Coalesce duplicate (document_id, page) citations.
            if !citations
                .iter()
                .any(|c| c.document_id == citation.document_id && c.page == citation.page)
            {
                citations.push(citation);
            }

            passages.push(Passage {
                text: compress_passage(question, &chunk.text_enriched),
                chunk_id: chunk.chunk_id,
                document_id: chunk.metadata.document_id,
                score,
                section: chunk.metadata.section,
                page: chunk.metadata.page,
                source_type: chunk.metadata.source_type,
            });
        }

        Ok(RankedPassages {
            passages,
            citations,
        })
    }

    /// Generate paraphrases; failure falls back to the original alone
    async fn expand_query(&self, question: &str) -> Vec<String> {
        let mut queries = vec![question.to_string()];
        if self.config.expansion_count == 0 {
            return queries;
        }

        let prompt = crate::extraction::prompts::QUERY_EXPANSION_PROMPT
            .replace("{n}", &self.config.expansion_count.to_string())
            .replace("{query}", question);

        match self
            .llm
            .generate(&self.expansion_model, &[user_message(prompt)])
            .await
        {
            Ok(response) => {
                if let Ok(Value::Array(items)) = serde_json::from_str(response.text.trim()) {
                    for item in items.iter().take(self.config.expansion_count) {
                        if let Some(text) = item.as_str() {
                            if !text.trim().is_empty() {
                                queries.push(text.trim().to_string());
                            }
                        }
                    }
                }
            }
            Err(err) => warn!(error = %err, "query expansion failed, using original only"),
        }
        queries
    }

    /// Issue one hybrid query per variant, concurrently
    async fn parallel_retrieve(
        &self,
        queries: &[String],
        filter: &MetadataFilter,
    ) -> Vec<Vec<ScoredChunk>> {
        let encoder = self.sparse_encoder().await;

        let futures = queries.iter().map(|query| {
            let encoder = encoder.clone();
            async move {
                let dense = self.embeddings.embed_one(query).await?;
                let sparse = encoder.as_ref().map(|e| e.encode(query));
                self.vector_index
                    .query(
                        &dense,
                        sparse.as_ref(),
                        self.config.retrieval_top_k,
                        filter,
                    )
                    .await
            }
        });

        join_all(futures)
            .await
            .into_iter()
            .filter_map(|r| match r {
                Ok(list) => Some(list),
                Err(err) => {
                    warn!(error = %err, "retrieval variant failed");
                    None
                }
            })
            .collect()
    }

    async fn sparse_encoder(&self) -> Option<Arc<SparseEncoder>> {
        self.encoder
            .get_or_init(|| async {
                match self.vector_index.load_meta(SPARSE_VOCAB_KEY).await {
                    Ok(Some(json)) => serde_json::from_str(&json).ok().map(Arc::new),
                    _ => None,
                }
            })
            .await
            .clone()
    }

    /// Entity extraction over the question, then graph traversal to
    /// supporting chunk ids
    async fn graph_candidates(&self, question: &str) -> HashSet<String> {
        if self.config.kg_boost == 0.0 {
            return HashSet::new();
        }
        let names: Vec<String> = self
            .entity_extractor
            .extract_entities(question)
            .into_iter()
            .map(|e| e.name)
            .collect();
        if names.is_empty() {
            return HashSet::new();
        }

        match self.graph.find_related(&names, 2).await {
            Ok(related) => related
                .into_iter()
                .flat_map(|r| r.supporting_chunks)
                .collect(),
            Err(err) => {
                warn!(error = %err, "graph traversal failed, skipping boost");
                HashSet::new()
            }
        }
    }

    /// Reciprocal-rank fusion across ranked lists plus the graph set
    async fn fuse(
        &self,
        ranked_lists: Vec<Vec<ScoredChunk>>,
        kg_chunk_ids: &HashSet<String>,
    ) -> Vec<FusionEntry> {
        let k = self.config.rrf_k;
        let mut entries: HashMap<String, FusionEntry> = HashMap::new();

        for list in ranked_lists {
            for (rank0, chunk) in list.into_iter().enumerate() {
                let rank = rank0 + 1;
                let contribution = 1.0 / (k + rank as f64);
                let entry = entries
                    .entry(chunk.chunk_id.clone())
                    .or_insert_with(|| FusionEntry {
                        chunk,
                        rrf_score: 0.0,
                        contributing_lists: 0,
                        best_rank: usize::MAX,
                    });
                entry.rrf_score += contribution;
                entry.contributing_lists += 1;
                entry.best_rank = entry.best_rank.min(rank);
            }
        }

        // Graph-corroborated candidates: multiply their fused score, and
        // pull in chunks the vector search missed entirely.
        for (position, chunk_id) in kg_chunk_ids.iter().enumerate() {
            let kg_contribution = self.config.kg_boost / (k + (position + 1) as f64);
            if let Some(entry) = entries.get_mut(chunk_id) {
                entry.rrf_score =
                    entry.rrf_score * self.config.kg_boost.max(1.0) + kg_contribution;
                entry.contributing_lists += 1;
                continue;
            }
            if let Ok(Some(chunk)) = self.vector_index.get_chunk(chunk_id).await {
                entries.insert(
                    chunk_id.clone(),
                    FusionEntry {
                        chunk,
                        rrf_score: kg_contribution,
                        contributing_lists: 1,
                        best_rank: position + 1,
                    },
                );
            }
        }

        let mut fused: Vec<FusionEntry> = entries.into_values().collect();
        fused.sort_by(|a, b| {
            b.rrf_score
                .partial_cmp(&a.rrf_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.contributing_lists.cmp(&a.contributing_lists))
                .then_with(|| a.best_rank.cmp(&b.best_rank))
                .then_with(|| {
                    b.chunk
                        .metadata
                        .extracted_at
                        .cmp(&a.chunk.metadata.extracted_at)
                })
        });
        fused.truncate(self.config.rerank_top_n);
        fused
    }

    /// Cross-encoder style rerank: the model scores each (question,
    /// passage) pair in [0, 1]. Unparseable scores fall back to fusion
    /// order.
    async fn rerank(&self, question: &str, fused: Vec<FusionEntry>) -> Vec<(f32, ScoredChunk)> {
        let futures = fused.iter().map(|entry| {
            let prompt = crate::extraction::prompts::RERANK_PROMPT
                .replace("{question}", question)
                .replace("{passage}", &entry.chunk.text_enriched);
            async move {
                self.llm
                    .generate(&self.rerank_model, &[user_message(prompt)])
                    .await
                    .ok()
                    .and_then(|r| parse_score(&r.text))
            }
        });
        let scores = join_all(futures).await;

        let total = fused.len().max(1) as f32;
        let mut scored: Vec<(f32, ScoredChunk)> = fused
            .into_iter()
            .zip(scores)
            .enumerate()
            .map(|(position, (entry, score))| {
                // Fusion-order fallback keeps relative ordering stable.
                let fallback = 1.0 - position as f32 / total;
                (score.unwrap_or(fallback), entry.chunk)
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }
}

/// Parse a bare float score out of model output, clamped to [0, 1]
fn parse_score(text: &str) -> Option<f32> {
    let cleaned = text.trim().trim_matches(|c: char| !c.is_ascii_digit() && c != '.');
    cleaned.parse::<f32>().ok().map(|s| s.clamp(0.0, 1.0))
}

/// Keep only the sentences relevant to the question, preserving the
/// source prefix line
fn compress_passage(question: &str, text_enriched: &str) -> String {
    let (prefix, body) = match text_enriched.split_once("\n\n") {
        Some((prefix, body)) if prefix.starts_with("[Document:") => (Some(prefix), body),
        _ => (None, text_enriched),
    };

    let question_terms: HashSet<String> = content_terms(question);
    let sentences = split_sentences(body);
    let mut kept: Vec<&str> = sentences
        .iter()
        .filter(|s| {
            let terms = content_terms(s);
            !question_terms.is_disjoint(&terms)
        })
        .map(String::as_str)
        .collect();

    // Nothing matched: keep the first sentence rather than dropping the
    // passage.
    if kept.is_empty() {
        if let Some(first) = sentences.first() {
            kept.push(first);
        }
    }

    match prefix {
        Some(prefix) => format!("{}\n\n{}", prefix, kept.join(" ")),
        None => kept.join(" "),
    }
}

/// Lowercased content words of length ≥ 4 (rough stopword cut)
fn content_terms(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 4)
        .map(String::from)
        .collect()
}

#[async_trait]
impl Tool for RagTool {
    fn name(&self) -> &'static str {
        "document_search"
    }

    fn description(&self) -> &'static str {
        "Search extracted 10-K filings and reference documents for narrative content: risk factors, strategy, management discussion, news claims"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": { "type": "string", "description": "What to search for" },
                "ticker": { "type": "string", "description": "Restrict to one company ticker" },
                "doc_type": { "type": "string", "enum": ["filing", "reference"] },
                "source_type": { "type": "string", "enum": ["official", "news", "research", "policy"] },
                "fiscal_year": { "type": "integer" }
            },
            "required": ["question"]
        })
    }

    async fn invoke(&self, params: Value) -> Result<Value> {
        let question = params
            .get("question")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::Validation("missing 'question' parameter".to_string()))?;

        let filter = MetadataFilter {
            document_id: None,
            ticker: params
                .get("ticker")
                .and_then(Value::as_str)
                .map(|t| t.to_uppercase()),
            doc_type: params
                .get("doc_type")
                .and_then(Value::as_str)
                .map(String::from),
            source_type: params
                .get("source_type")
                .and_then(Value::as_str)
                .map(String::from),
            fiscal_year: params
                .get("fiscal_year")
                .and_then(Value::as_i64)
                .map(|y| y as i32),
        };

        let ranked = self.retrieve(question, self.config.top_k, &filter).await?;
        Ok(serde_json::to_value(ranked)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::index::sparse::SparseVector;
    use crate::index::vector::{SqliteVectorIndex, VectorMetadata, VectorRecord};
    use crate::llm::MockLlmClient;

    fn record(
        chunk_id: &str,
        document_id: &str,
        text: &str,
        dense: Vec<f32>,
        source_type: &str,
    ) -> VectorRecord {
        VectorRecord {
            chunk_id: chunk_id.to_string(),
            dense,
            sparse: SparseVector::default(),
            metadata: VectorMetadata {
                document_id: document_id.to_string(),
                chunk_index: 0,
                ticker: Some("AAPL".to_string()),
                company: Some("Apple Inc.".to_string()),
                doc_type: "filing".to_string(),
                source_type: source_type.to_string(),
                fiscal_year: Some(2024),
                section: Some("Item 1A. Risk Factors".to_string()),
                page: 30,
                extracted_at: "2025-01-01T00:00:00Z".to_string(),
            },
            text_enriched: format!(
                "[Document: Apple Inc. 10-K FY2024] [Section: Item 1A. Risk Factors] [Page: 30]\n\n{}",
                text
            ),
            text_raw: text.to_string(),
        }
    }

    async fn tool_with(records: Vec<VectorRecord>, mock: MockLlmClient) -> RagTool {
        let dim = 16;
        let vector_index = Arc::new(
            SqliteVectorIndex::new("sqlite::memory:", dim, 0.7, 1)
                .await
                .unwrap(),
        );
        vector_index.upsert(records).await.unwrap();
        let graph = Arc::new(GraphStore::new("sqlite::memory:", 1).await.unwrap());
        let llm: Arc<dyn LlmClient> = Arc::new(mock);
        let embeddings = EmbeddingService::new(
            llm.clone(),
            &EmbeddingConfig {
                model: "mock".to_string(),
                dimension: dim,
                batch_size: 25,
            },
        );
        RagTool::new(
            llm,
            "small",
            "small",
            embeddings,
            vector_index,
            graph,
            RagConfig {
                expansion_count: 0,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_parse_score() {
        assert_eq!(parse_score("0.85"), Some(0.85));
        assert_eq!(parse_score(" 0.5 \n"), Some(0.5));
        assert_eq!(parse_score("2.5"), Some(1.0));
        assert_eq!(parse_score("not a number"), None);
    }

    #[test]
    fn test_compress_preserves_prefix_and_relevant_sentences() {
        let enriched = "[Document: Apple Inc. 10-K FY2024] [Section: Item 1A. Risk Factors] [Page: 30]\n\nSupply chain disruption could hurt margins. The weather was pleasant. Component shortages affect supply timelines.";
        let compressed = compress_passage("What supply chain risks exist?", enriched);

        assert!(compressed.starts_with("[Document: Apple Inc. 10-K FY2024]"));
        assert!(compressed.contains("Supply chain disruption"));
        assert!(compressed.contains("supply timelines"));
        assert!(!compressed.contains("weather"));
    }

    #[test]
    fn test_compress_keeps_first_sentence_when_nothing_matches() {
        let enriched = "[Document: D] [Section: S] [Page: 1]\n\nAlpha beta. Gamma delta.";
        let compressed = compress_passage("zzz qqq", enriched);
        assert!(compressed.contains("Alpha beta."));
    }

    #[tokio::test]
    async fn test_retrieve_returns_cited_passages() {
        let query_vec = MockLlmClient::pseudo_embedding("What supply chain risks does Apple mention?", 16);
        let mock = MockLlmClient::with_dimension(16);
        // Rerank scores (one per fused candidate, highest for the risk chunk).
        mock.push_response("0.9");
        mock.push_response("0.2");

        let records = vec![
            record(
                "aapl_10-k_2024:0",
                "aapl_10-k_2024",
                "Supply chain disruption and component shortages are key risks Apple faces.",
                query_vec.clone(),
                "official",
            ),
            record(
                "aapl_10-k_2024:1",
                "aapl_10-k_2024",
                "The board met four times during the fiscal year.",
                MockLlmClient::pseudo_embedding("unrelated governance text", 16),
                "official",
            ),
        ];

        let tool = tool_with(records, mock).await;
        let filter = MetadataFilter {
            ticker: Some("AAPL".to_string()),
            ..Default::default()
        };
        let ranked = tool
            .retrieve("What supply chain risks does Apple mention?", 5, &filter)
            .await
            .unwrap();

        assert!(!ranked.passages.is_empty());
        let top = &ranked.passages[0];
        assert_eq!(top.document_id, "aapl_10-k_2024");
        assert!(top.section.as_deref().unwrap().contains("Risk Factors"));

        // Citations resolve and coalesce per (document_id, page).
        assert_eq!(ranked.citations.len(), 1);
        assert_eq!(ranked.citations[0].page, 30);
    }

    #[tokio::test]
    async fn test_retrieve_empty_index_fails_open() {
        let mock = MockLlmClient::with_dimension(16);
        let tool = tool_with(vec![], mock).await;
        let ranked = tool
            .retrieve("anything", 5, &MetadataFilter::default())
            .await
            .unwrap();
        assert!(ranked.passages.is_empty());
        assert!(ranked.citations.is_empty());
    }

    #[tokio::test]
    async fn test_filter_restricts_source_type() {
        let query_vec = MockLlmClient::pseudo_embedding("NVDA AI chip demand", 16);
        let mock = MockLlmClient::with_dimension(16);
        mock.push_response("0.9");

        let mut news = record(
            "nvda_news:0",
            "nvda_news",
            "News claims NVDA AI chip demand is surging.",
            query_vec.clone(),
            "news",
        );
        news.metadata.ticker = Some("NVDA".to_string());
        let mut filing = record(
            "nvda_10-k_2024:0",
            "nvda_10-k_2024",
            "Demand concentration is a risk factor.",
            query_vec.clone(),
            "official",
        );
        filing.metadata.ticker = Some("NVDA".to_string());

        let tool = tool_with(vec![news, filing], mock).await;
        let filter = MetadataFilter {
            source_type: Some("news".to_string()),
            ..Default::default()
        };
        let ranked = tool.retrieve("NVDA AI chip demand", 5, &filter).await.unwrap();
        assert_eq!(ranked.passages.len(), 1);
        assert_eq!(ranked.passages[0].source_type, "news");
    }
}
