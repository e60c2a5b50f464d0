//! Document processing orchestration
//!
//! Drives extraction over a directory of PDFs: detects document type,
//! computes content hashes for change detection, consults the manifest to
//! skip finished work, consolidates filing pages into the SQL-ready view,
//! and persists results atomically.

use super::consolidate::consolidate;
use super::manifest::{file_hash, Manifest};
use super::types::{DocType, DocumentMetadata, ExtractionRecord, SourceType};
use super::vlm::VlmExtractor;
use crate::config::ExtractionConfig;
use crate::error::{ExtractionError, Result};
use chrono::Utc;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Flags controlling a processing run
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessOptions {
    /// Re-extract even if the manifest says the document is done
    pub force: bool,
    /// Re-extract only when the content hash changed
    pub if_changed: bool,
    /// Report what would happen without calling the model or writing
    pub dry_run: bool,
}

/// Outcome of processing one document
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Manifest said the document is current
    Skipped { document_id: String },
    /// Dry run: the document would have been extracted
    WouldExtract { document_id: String },
    /// Extraction completed and was persisted
    Extracted(Box<ExtractionRecord>),
}

/// Summary of a directory processing run
#[derive(Debug, Default)]
pub struct ProcessSummary {
    pub extracted: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Per-document status line for operators
#[derive(Debug, serde::Serialize)]
pub struct DocumentStatus {
    pub document_id: String,
    pub file_hash: String,
    pub extracted_at: String,
    pub extraction_cost: f64,
    pub indexed_to_vi: bool,
    pub chunk_count: Option<usize>,
}

/// Orchestrates extraction for a corpus directory
pub struct DocumentProcessor {
    config: ExtractionConfig,
    extractor: VlmExtractor,
}

impl DocumentProcessor {
    pub fn new(config: ExtractionConfig, extractor: VlmExtractor) -> Self {
        Self { config, extractor }
    }

    fn manifest_path(&self) -> PathBuf {
        Manifest::path_in(Path::new(&self.config.extracted_dir))
    }

    /// Process a single PDF
    pub async fn process(&self, pdf_path: &Path, opts: ProcessOptions) -> Result<ProcessOutcome> {
        let document_id = document_id_from_path(pdf_path);
        let content = std::fs::read(pdf_path)?;
        let hash = file_hash(&content);

        let manifest_path = self.manifest_path();
        let mut manifest = Manifest::load(&manifest_path)?;

        if !manifest.needs_extraction(&document_id, &hash, opts.force, opts.if_changed) {
            info!(document_id, "extraction up to date, skipping");
            return Ok(ProcessOutcome::Skipped { document_id });
        }

        if opts.dry_run {
            return Ok(ProcessOutcome::WouldExtract { document_id });
        }

        let filename = pdf_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let doc_type = DocType::from_filename(filename);

        let output = self.extractor.extract(pdf_path, doc_type).await?;
        let page_count = output.pages.len() as u32;

        let (ticker, fiscal_year) = filename_facts(filename);
        let consolidated = if doc_type == DocType::Filing {
            Some(consolidate(&output.pages, fiscal_year))
        } else {
            None
        };

        let metadata = DocumentMetadata {
            document_id: document_id.clone(),
            doc_type,
            source_type: source_type_for(doc_type, filename),
            company: ticker.as_deref().map(company_name_for),
            ticker,
            fiscal_year,
            publication_date: output.reference_fields.publication_date.clone(),
            source: output
                .reference_fields
                .source
                .clone()
                .or(output.reference_fields.headline.clone()),
            file_hash: hash.clone(),
            page_count,
            extracted_at: Utc::now(),
            extraction_cost: output.estimated_cost,
        };

        let record = ExtractionRecord {
            metadata,
            pages: output.pages,
            consolidated,
        };

        // Extraction JSON first, manifest second; both atomic. A crash
        // between the two leaves a re-extractable document, never a
        // manifest entry without its JSON.
        self.write_record(&record)?;
        manifest.record_extraction(&document_id, &hash, record.metadata.extraction_cost);
        manifest.save(&manifest_path)?;

        info!(
            document_id,
            pages = page_count,
            cost = record.metadata.extraction_cost,
            "extraction complete"
        );
        Ok(ProcessOutcome::Extracted(Box::new(record)))
    }

    /// Process every PDF in the raw directory, optionally filtered by type
    pub async fn process_all(
        &self,
        doc_types: Option<&[DocType]>,
        opts: ProcessOptions,
    ) -> Result<ProcessSummary> {
        let mut summary = ProcessSummary::default();

        for path in pdf_paths(Path::new(&self.config.raw_dir))? {
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            if let Some(filter) = doc_types {
                if !filter.contains(&DocType::from_filename(filename)) {
                    continue;
                }
            }

            match self.process(&path, opts).await {
                Ok(ProcessOutcome::Skipped { .. }) => summary.skipped += 1,
                Ok(_) => summary.extracted += 1,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "document failed");
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Manifest-backed status report
    pub fn status(&self) -> Result<Vec<DocumentStatus>> {
        let manifest = Manifest::load(&self.manifest_path())?;
        Ok(manifest
            .documents
            .iter()
            .map(|(id, entry)| DocumentStatus {
                document_id: id.clone(),
                file_hash: entry.file_hash.clone(),
                extracted_at: entry.extracted_at.to_rfc3339(),
                extraction_cost: entry.extraction_cost,
                indexed_to_vi: entry.indexed_to_vi,
                chunk_count: entry.chunk_count,
            })
            .collect())
    }

    /// Load a previously persisted extraction record
    pub fn load_record(&self, document_id: &str) -> Result<ExtractionRecord> {
        let path = self.record_path(document_id);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ExtractionError::Manifest(format!(
                "missing extraction for {}: {}",
                document_id, e
            ))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// All persisted extraction records
    pub fn load_all_records(&self) -> Result<Vec<ExtractionRecord>> {
        let manifest = Manifest::load(&self.manifest_path())?;
        let mut records = Vec::new();
        for document_id in manifest.documents.keys() {
            records.push(self.load_record(document_id)?);
        }
        Ok(records)
    }

    fn record_path(&self, document_id: &str) -> PathBuf {
        Path::new(&self.config.extracted_dir).join(format!("{}.json", document_id))
    }

    fn write_record(&self, record: &ExtractionRecord) -> Result<()> {
        let path = self.record_path(&record.metadata.document_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(record)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Stable document id from a file path: lowercased stem, spaces collapsed
pub fn document_id_from_path(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Pull (ticker, fiscal_year) hints out of a filename like `AAPL_10-K_2024.pdf`
fn filename_facts(filename: &str) -> (Option<String>, Option<i32>) {
    let stem = filename.rsplit_once('.').map_or(filename, |(s, _)| s);

    let year_re = Regex::new(r"(19|20)\d{2}").expect("static regex");
    let fiscal_year = year_re
        .find_iter(stem)
        .last()
        .and_then(|m| m.as_str().parse().ok());

    let ticker = stem
        .split(['_', '-', ' '])
        .next()
        .filter(|t| {
            (1..=5).contains(&t.len()) && t.chars().all(|c| c.is_ascii_alphabetic())
        })
        .map(|t| t.to_uppercase());

    (ticker, fiscal_year)
}

fn source_type_for(doc_type: DocType, filename: &str) -> SourceType {
    if doc_type == DocType::Filing {
        return SourceType::Official;
    }
    let lower = filename.to_lowercase();
    if lower.contains("news") || lower.contains("article") {
        SourceType::News
    } else if lower.contains("policy") || lower.contains("fed") || lower.contains("regulation") {
        SourceType::Policy
    } else {
        SourceType::Research
    }
}

/// Known large-cap names for friendlier answers; unknown tickers pass through
fn company_name_for(ticker: &str) -> String {
    match ticker {
        "AAPL" => "Apple Inc.".to_string(),
        "MSFT" => "Microsoft Corporation".to_string(),
        "AMZN" => "Amazon.com, Inc.".to_string(),
        "GOOGL" | "GOOG" => "Alphabet Inc.".to_string(),
        "META" => "Meta Platforms, Inc.".to_string(),
        "NVDA" => "NVIDIA Corporation".to_string(),
        "TSLA" => "Tesla, Inc.".to_string(),
        other => other.to_string(),
    }
}

fn pdf_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
        {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_from_path() {
        assert_eq!(
            document_id_from_path(Path::new("/data/AAPL_10-K_2024.pdf")),
            "aapl_10-k_2024"
        );
        assert_eq!(
            document_id_from_path(Path::new("Fed Rate Policy.pdf")),
            "fed_rate_policy"
        );
    }

    #[test]
    fn test_filename_facts() {
        let (ticker, year) = filename_facts("AAPL_10-K_2024.pdf");
        assert_eq!(ticker.as_deref(), Some("AAPL"));
        assert_eq!(year, Some(2024));

        let (ticker, year) = filename_facts("nvda_news_ai_demand.pdf");
        assert_eq!(ticker.as_deref(), Some("NVDA"));
        assert_eq!(year, None);

        // A leading long word is not mistaken for a ticker.
        let (ticker, _) = filename_facts("quarterly_review_2023.pdf");
        assert_eq!(ticker, None);
    }

    #[test]
    fn test_source_type_detection() {
        assert_eq!(
            source_type_for(DocType::Filing, "AAPL_10-K_2024.pdf"),
            SourceType::Official
        );
        assert_eq!(
            source_type_for(DocType::Reference, "nvda_news_chips.pdf"),
            SourceType::News
        );
        assert_eq!(
            source_type_for(DocType::Reference, "fed_policy_2025.pdf"),
            SourceType::Policy
        );
        assert_eq!(
            source_type_for(DocType::Reference, "semis_outlook.pdf"),
            SourceType::Research
        );
    }
}
