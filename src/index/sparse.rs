//! BM25-style sparse encoding over the corpus vocabulary
//!
//! The vocabulary and document-frequency statistics are built once during
//! indexing and persisted next to the vectors, so query-time encoding uses
//! the same weights as index-time encoding.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const K1: f32 = 1.2;
const B: f32 = 0.75;

/// A sparse term vector: parallel term indices and weights
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Dot product with another sparse vector
    pub fn dot(&self, other: &SparseVector) -> f32 {
        let mut score = 0.0;
        let mut a = 0;
        let mut b = 0;
        // Indices are sorted ascending by construction.
        while a < self.indices.len() && b < other.indices.len() {
            match self.indices[a].cmp(&other.indices[b]) {
                std::cmp::Ordering::Less => a += 1,
                std::cmp::Ordering::Greater => b += 1,
                std::cmp::Ordering::Equal => {
                    score += self.values[a] * other.values[b];
                    a += 1;
                    b += 1;
                }
            }
        }
        score
    }
}

/// BM25 encoder with corpus statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SparseEncoder {
    vocab: HashMap<String, u32>,
    doc_freq: Vec<u32>,
    doc_count: u32,
    avg_doc_len: f32,
}

impl SparseEncoder {
    /// Build an encoder from a corpus of texts
    pub fn build(corpus: &[String]) -> Self {
        let mut vocab: HashMap<String, u32> = HashMap::new();
        let mut doc_freq: Vec<u32> = Vec::new();
        let mut total_len = 0usize;

        for text in corpus {
            let terms = tokenize(text);
            total_len += terms.len();

            let mut seen: HashMap<&str, ()> = HashMap::new();
            for term in &terms {
                if seen.insert(term.as_str(), ()).is_none() {
                    let next_id = vocab.len() as u32;
                    let id = *vocab.entry(term.clone()).or_insert(next_id);
                    if id as usize >= doc_freq.len() {
                        doc_freq.resize(id as usize + 1, 0);
                    }
                    doc_freq[id as usize] += 1;
                }
            }
        }

        let doc_count = corpus.len() as u32;
        let avg_doc_len = if doc_count > 0 {
            total_len as f32 / doc_count as f32
        } else {
            0.0
        };

        Self {
            vocab,
            doc_freq,
            doc_count,
            avg_doc_len,
        }
    }

    /// Number of distinct terms
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Encode text into BM25-weighted sparse terms. Terms outside the
    /// vocabulary are dropped; encoding is deterministic for a given
    /// encoder state.
    pub fn encode(&self, text: &str) -> SparseVector {
        let terms = tokenize(text);
        if terms.is_empty() || self.doc_count == 0 {
            return SparseVector::default();
        }
        let doc_len = terms.len() as f32;

        let mut term_freq: HashMap<u32, f32> = HashMap::new();
        for term in &terms {
            if let Some(&id) = self.vocab.get(term) {
                *term_freq.entry(id).or_insert(0.0) += 1.0;
            }
        }

        let mut pairs: Vec<(u32, f32)> = term_freq
            .into_iter()
            .map(|(id, tf)| {
                let df = self.doc_freq[id as usize] as f32;
                let n = self.doc_count as f32;
                let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                let norm = K1 * (1.0 - B + B * doc_len / self.avg_doc_len.max(1.0));
                let weight = idf * (tf * (K1 + 1.0)) / (tf + norm);
                (id, weight)
            })
            .filter(|(_, w)| *w > 0.0)
            .collect();
        pairs.sort_by_key(|(id, _)| *id);

        SparseVector {
            indices: pairs.iter().map(|(id, _)| *id).collect(),
            values: pairs.iter().map(|(_, w)| *w).collect(),
        }
    }
}

/// Lowercased alphanumeric terms of length ≥ 2
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<String> {
        vec![
            "Apple reported record iPhone revenue this fiscal year".to_string(),
            "Supply chain risks could disrupt component availability".to_string(),
            "Amazon web services revenue grew across all regions".to_string(),
            "Risk factors include supply chain concentration".to_string(),
        ]
    }

    #[test]
    fn test_encoder_deterministic() {
        let encoder = SparseEncoder::build(&corpus());
        let a = encoder.encode("supply chain revenue");
        let b = encoder.encode("supply chain revenue");
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn test_rare_terms_weighted_higher() {
        let encoder = SparseEncoder::build(&corpus());
        // "iphone" appears in one document, "revenue" in two.
        let vector = encoder.encode("iphone revenue");
        assert_eq!(vector.indices.len(), 2);

        let weights: HashMap<u32, f32> = vector
            .indices
            .iter()
            .zip(vector.values.iter())
            .map(|(i, v)| (*i, *v))
            .collect();
        let iphone_id = *encoder.vocab.get("iphone").unwrap();
        let revenue_id = *encoder.vocab.get("revenue").unwrap();
        assert!(weights[&iphone_id] > weights[&revenue_id]);
    }

    #[test]
    fn test_out_of_vocabulary_dropped() {
        let encoder = SparseEncoder::build(&corpus());
        let vector = encoder.encode("zyzzyva quux");
        assert!(vector.is_empty());
    }

    #[test]
    fn test_sparse_dot() {
        let a = SparseVector {
            indices: vec![1, 3, 5],
            values: vec![1.0, 2.0, 3.0],
        };
        let b = SparseVector {
            indices: vec![3, 5, 7],
            values: vec![4.0, 5.0, 6.0],
        };
        // 2*4 + 3*5
        assert_eq!(a.dot(&b), 23.0);
        assert_eq!(a.dot(&SparseVector::default()), 0.0);
    }

    #[test]
    fn test_encoder_roundtrip_serde() {
        let encoder = SparseEncoder::build(&corpus());
        let json = serde_json::to_string(&encoder).unwrap();
        let restored: SparseEncoder = serde_json::from_str(&json).unwrap();
        assert_eq!(
            restored.encode("supply chain"),
            encoder.encode("supply chain")
        );
    }
}
