//! Sentence-aware chunking with contextual enrichment
//!
//! Sentences are grouped into chunks that respect paragraph boundaries and
//! never split mid-sentence. Each chunk is enriched with a structured
//! `[Document: …] [Section: …] [Page: …]` prefix; the enriched text is what
//! gets embedded, the raw text is kept for response snippets.

use crate::extraction::types::{DocumentMetadata, PageExtraction};
use serde::{Deserialize, Serialize};

/// Chunking parameters
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Target chunk size in approximate tokens
    pub max_tokens: usize,
    /// Approximate tokens carried over between adjacent chunks
    pub overlap_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            overlap_tokens: 50,
        }
    }
}

/// A chunk of document text ready for encoding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Globally unique: `{document_id}:{chunk_index}`
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub text_raw: String,
    pub text_enriched: String,
    pub token_count: usize,
    pub start_page: u32,
    pub end_page: u32,
    pub section: Option<String>,
}

/// Approximate token count: tokens ≈ words / 0.75
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    (words as f64 / 0.75).ceil() as usize
}

struct Sentence {
    text: String,
    page: u32,
    section: Option<String>,
    paragraph_end: bool,
}

/// Chunk the pages of one document
pub fn chunk_pages(
    metadata: &DocumentMetadata,
    pages: &[PageExtraction],
    config: &ChunkerConfig,
) -> Vec<Chunk> {
    let sentences = collect_sentences(pages);
    if sentences.is_empty() {
        return vec![];
    }

    let title = document_title(metadata);
    let mut chunks = Vec::new();
    let mut current: Vec<&Sentence> = Vec::new();
    let mut current_tokens = 0;

    let mut iter = sentences.iter().peekable();
    while let Some(sentence) = iter.next() {
        let tokens = estimate_tokens(&sentence.text);
        current.push(sentence);
        current_tokens += tokens;

        // Close the chunk at the budget, preferring a paragraph boundary
        // once we are within reach of it.
        let over_budget = current_tokens >= config.max_tokens;
        let near_budget = current_tokens >= config.max_tokens.saturating_sub(64);
        let at_paragraph = sentence.paragraph_end;
        let last = iter.peek().is_none();

        if last || over_budget || (near_budget && at_paragraph) {
            push_chunk(&mut chunks, metadata, &title, &current);

            if last {
                break;
            }

            // Seed the next chunk with trailing sentences as overlap.
            let mut overlap: Vec<&Sentence> = Vec::new();
            let mut overlap_tokens = 0;
            for s in current.iter().rev().copied() {
                let t = estimate_tokens(&s.text);
                if overlap_tokens + t > config.overlap_tokens {
                    break;
                }
                overlap.push(s);
                overlap_tokens += t;
            }
            overlap.reverse();
            current = overlap;
            current_tokens = overlap_tokens;
        }
    }

    chunks
}

fn push_chunk(
    chunks: &mut Vec<Chunk>,
    metadata: &DocumentMetadata,
    title: &str,
    sentences: &[&Sentence],
) {
    if sentences.is_empty() {
        return;
    }
    let text_raw = sentences
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    if text_raw.trim().is_empty() {
        return;
    }

    let start_page = sentences.iter().map(|s| s.page).min().unwrap_or(1);
    let end_page = sentences.iter().map(|s| s.page).max().unwrap_or(start_page);
    let section = sentences.iter().find_map(|s| s.section.clone());

    let chunk_index = chunks.len();
    let text_enriched = format!(
        "[Document: {}] [Section: {}] [Page: {}]\n\n{}",
        title,
        section.as_deref().unwrap_or("General"),
        start_page,
        text_raw
    );

    chunks.push(Chunk {
        chunk_id: format!("{}:{}", metadata.document_id, chunk_index),
        document_id: metadata.document_id.clone(),
        chunk_index,
        token_count: estimate_tokens(&text_raw),
        text_raw,
        text_enriched,
        start_page,
        end_page,
        section,
    });
}

fn document_title(metadata: &DocumentMetadata) -> String {
    match (&metadata.company, metadata.fiscal_year) {
        (Some(company), Some(year)) => format!("{} 10-K FY{}", company, year),
        (Some(company), None) => company.clone(),
        _ => metadata.document_id.clone(),
    }
}

fn collect_sentences(pages: &[PageExtraction]) -> Vec<Sentence> {
    let mut sentences = Vec::new();
    for page in pages {
        if page.error.is_some() || page.text.trim().is_empty() {
            continue;
        }
        for paragraph in page.text.split("\n\n") {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }
            let split = split_sentences(paragraph);
            let count = split.len();
            for (i, text) in split.into_iter().enumerate() {
                sentences.push(Sentence {
                    text,
                    page: page.page_number,
                    section: page.section.clone(),
                    paragraph_end: i + 1 == count,
                });
            }
        }
    }
    sentences
}

/// Abbreviations that do not end a sentence
const ABBREVIATIONS: &[&str] = &[
    "inc", "corp", "co", "ltd", "llc", "vs", "no", "u.s", "u.k", "e.g", "i.e", "etc", "mr", "ms",
    "dr", "jr", "sr", "fy", "approx",
];

/// Split a paragraph into sentences without breaking on common
/// abbreviations or decimal numbers
pub fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut start = 0;

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '.' || c == '!' || c == '?' {
            let followed_by_break = chars
                .get(i + 1)
                .map_or(true, |next| next.is_whitespace());
            let next_starts_sentence = chars
                .iter()
                .skip(i + 1)
                .find(|ch| !ch.is_whitespace())
                .map_or(true, |ch| ch.is_uppercase() || !ch.is_alphanumeric());

            let word_before: String = text[..char_byte_index(text, i)]
                .split_whitespace()
                .last()
                .unwrap_or("")
                .trim_end_matches('.')
                .to_lowercase();
            let is_abbreviation = c == '.' && ABBREVIATIONS.contains(&word_before.as_str());

            let decimal = c == '.'
                && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())
                && i > 0
                && chars[i - 1].is_ascii_digit();

            if followed_by_break && next_starts_sentence && !is_abbreviation && !decimal {
                let end = char_byte_index(text, i + 1);
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence.to_string());
                }
                start = end;
            }
        }
        i += 1;
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

fn char_byte_index(text: &str, char_index: usize) -> usize {
    text.char_indices()
        .nth(char_index)
        .map_or(text.len(), |(b, _)| b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::types::{ContentType, DocType, SourceType};
    use chrono::Utc;

    fn metadata() -> DocumentMetadata {
        DocumentMetadata {
            document_id: "aapl_10-k_2024".to_string(),
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
        }
    }

    fn page(number: u32, section: Option<&str>, text: &str) -> PageExtraction {
        PageExtraction {
            page_number: number,
            section: section.map(String::from),
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
        }
    }

    #[test]
    fn test_split_sentences_basic() {
        let sentences =
            split_sentences("Revenue grew this year. Margins expanded. What drove it?");
        assert_eq!(sentences.len(), 3);
        assert_eq!(sentences[0], "Revenue grew this year.");
    }

    #[test]
    fn test_split_sentences_abbreviations_and_decimals() {
        let sentences = split_sentences(
            "Apple Inc. reported revenue of $394.3 billion. The U.S. segment led growth.",
        );
        assert_eq!(sentences.len(), 2);
        assert!(sentences[0].starts_with("Apple Inc. reported"));
        assert!(sentences[0].contains("394.3"));
    }

    #[test]
    fn test_estimate_tokens() {
        // 6 words / 0.75 = 8 tokens.
        assert_eq!(estimate_tokens("one two three four five six"), 8);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_chunk_enrichment_prefix() {
        let pages = vec![page(
            3,
            Some("Item 1A. Risk Factors"),
            "Supply chain disruption could hurt margins. We depend on single-source vendors.",
        )];
        let chunks = chunk_pages(&metadata(), &pages, &ChunkerConfig::default());

        assert_eq!(chunks.len(), 1);
        let chunk = &chunks[0];
        assert_eq!(chunk.chunk_id, "aapl_10-k_2024:0");
        assert!(chunk
            .text_enriched
            .starts_with("[Document: Apple Inc. 10-K FY2024] [Section: Item 1A. Risk Factors] [Page: 3]\n\n"));
        assert!(!chunk.text_raw.starts_with("[Document"));
        assert_eq!(chunk.start_page, 3);
        assert_eq!(chunk.end_page, 3);
    }

    #[test]
    fn test_chunks_respect_token_budget_and_never_split_sentences() {
        let sentence = "The company generated significant operating cash flow during the period under review.";
        let long_text = vec![sentence; 120].join(" ");
        let pages = vec![page(1, None, &long_text)];

        let config = ChunkerConfig::default();
        let chunks = chunk_pages(&metadata(), &pages, &config);
        assert!(chunks.len() > 1);

        for chunk in &chunks {
            // Budget plus one sentence of slack, since sentences are atomic.
            assert!(chunk.token_count <= config.max_tokens + estimate_tokens(sentence));
            assert!(chunk.text_raw.ends_with('.'));
        }

        // Consecutive chunks share overlap text.
        let first_tail: Vec<&str> = chunks[0].text_raw.split_whitespace().rev().take(5).collect();
        let second_head: Vec<&str> = chunks[1].text_raw.split_whitespace().take(5).collect();
        assert!(!first_tail.is_empty() && !second_head.is_empty());
    }

    #[test]
    fn test_chunk_indices_sequential() {
        let long_text = vec!["A complete sentence with enough words to count for several tokens."; 100].join(" ");
        let pages = vec![page(1, None, &long_text), page(2, None, &long_text)];
        let chunks = chunk_pages(&metadata(), &pages, &ChunkerConfig::default());

        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert_eq!(chunk.chunk_id, format!("aapl_10-k_2024:{}", i));
        }
    }

    #[test]
    fn test_failed_pages_excluded() {
        let pages = vec![
            page(1, None, "Good page content here."),
            PageExtraction::failed(2, "model error"),
        ];
        let chunks = chunk_pages(&metadata(), &pages, &ChunkerConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_page, 1);
    }
}
