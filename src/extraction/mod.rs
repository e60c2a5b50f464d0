//! Document extraction pipeline
//!
//! Converts raw PDFs into per-page structured JSON plus a consolidated,
//! SQL-ready view, tracked by a crash-safe manifest.

pub mod consolidate;
pub mod manifest;
pub mod processor;
pub mod prompts;
pub mod types;
pub mod vlm;

pub use manifest::{Manifest, ManifestEntry};
pub use processor::{
    DocumentProcessor, DocumentStatus, ProcessOptions, ProcessOutcome, ProcessSummary,
};
pub use types::{
    ConsolidatedView, ContentType, DocType, DocumentMetadata, ExtractionRecord, GeographicRevenue,
    MetricSet, PageExtraction, PageTable, RiskFactor, SegmentRevenue, SourceType,
};
pub use vlm::VlmExtractor;
