//! Dense embedding service over the model client

use crate::config::EmbeddingConfig;
use crate::error::{IndexError, Result};
use crate::llm::LlmClient;
use std::sync::Arc;
use tracing::debug;

/// Batched embedding front-end with dimension enforcement
pub struct EmbeddingService {
    llm: Arc<dyn LlmClient>,
    model: String,
    dimension: usize,
    batch_size: usize,
}

impl EmbeddingService {
    pub fn new(llm: Arc<dyn LlmClient>, config: &EmbeddingConfig) -> Self {
        Self {
            llm,
            model: config.model.clone(),
            dimension: config.dimension,
            batch_size: config.batch_size.max(1),
        }
    }

    /// The configured vector dimension
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed a single text
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self.llm.embed(&self.model, text).await?;
        self.check_dimension(&vector)?;
        Ok(vector)
    }

    /// Embed many texts in batches
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            debug!(batch = batch.len(), "embedding batch");
            let vectors = self.llm.embed_batch(&self.model, batch).await?;
            for vector in &vectors {
                self.check_dimension(vector)?;
            }
            out.extend(vectors);
        }
        Ok(out)
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(IndexError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            }
            .into());
        }
        Ok(())
    }
}

/// Cosine similarity between two dense vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// L2-normalize a vector in place; zero vectors are left untouched
pub fn normalize_l2(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}
