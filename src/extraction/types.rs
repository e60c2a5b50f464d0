//! Extraction data model: documents, pages, and the consolidated view

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Document category, detected from the filename
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    Filing,
    Reference,
}

impl DocType {
    /// Detect the document type from a filename
    pub fn from_filename(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("10-k") || lower.contains("10k") || lower.contains("annual") {
            DocType::Filing
        } else {
            DocType::Reference
        }
    }
}

/// Provenance category of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Official,
    News,
    Research,
    Policy,
}

/// Dominant content of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Narrative,
    Table,
    Mixed,
}

/// A table preserved with header/row structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PageTable {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
}

/// One fiscal year of normalized financial metrics, in millions USD
/// (EPS in dollars, shares in millions)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricSet {
    #[serde(default)]
    pub fiscal_year: Option<i32>,
    #[serde(default)]
    pub revenue: Option<f64>,
    #[serde(default)]
    pub cost_of_revenue: Option<f64>,
    #[serde(default)]
    pub gross_profit: Option<f64>,
    #[serde(default)]
    pub operating_income: Option<f64>,
    #[serde(default)]
    pub operating_expenses: Option<f64>,
    #[serde(default)]
    pub net_income: Option<f64>,
    #[serde(default)]
    pub total_assets: Option<f64>,
    #[serde(default)]
    pub total_liabilities: Option<f64>,
    #[serde(default)]
    pub stockholders_equity: Option<f64>,
    #[serde(default)]
    pub cash_and_equivalents: Option<f64>,
    #[serde(default)]
    pub operating_cash_flow: Option<f64>,
    #[serde(default)]
    pub capital_expenditures: Option<f64>,
    #[serde(default)]
    pub eps_basic: Option<f64>,
    #[serde(default)]
    pub eps_diluted: Option<f64>,
    #[serde(default)]
    pub shares_outstanding: Option<f64>,
}

impl MetricSet {
    /// Fill this set's null fields from `other`, leaving present values alone
    pub fn merge_non_null(&mut self, other: &MetricSet) {
        macro_rules! fill {
            ($($field:ident),*) => {
                $(if self.$field.is_none() { self.$field = other.$field; })*
            };
        }
        fill!(
            revenue,
            cost_of_revenue,
            gross_profit,
            operating_income,
            operating_expenses,
            net_income,
            total_assets,
            total_liabilities,
            stockholders_equity,
            cash_and_equivalents,
            operating_cash_flow,
            capital_expenditures,
            eps_basic,
            eps_diluted,
            shares_outstanding
        );
    }

    /// Whether every metric field is null
    pub fn is_empty(&self) -> bool {
        self.revenue.is_none()
            && self.cost_of_revenue.is_none()
            && self.gross_profit.is_none()
            && self.operating_income.is_none()
            && self.operating_expenses.is_none()
            && self.net_income.is_none()
            && self.total_assets.is_none()
            && self.total_liabilities.is_none()
            && self.stockholders_equity.is_none()
            && self.cash_and_equivalents.is_none()
            && self.operating_cash_flow.is_none()
            && self.capital_expenditures.is_none()
            && self.eps_basic.is_none()
            && self.eps_diluted.is_none()
            && self.shares_outstanding.is_none()
    }
}

/// Revenue attributed to a business segment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentRevenue {
    pub segment: String,
    #[serde(default)]
    pub fiscal_year: Option<i32>,
    #[serde(default)]
    pub revenue: Option<f64>,
}

/// Revenue attributed to a geographic region
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeographicRevenue {
    pub region: String,
    #[serde(default)]
    pub fiscal_year: Option<i32>,
    #[serde(default)]
    pub revenue: Option<f64>,
}

/// A risk factor disclosed in a filing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskFactor {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Structured content of one extracted page. Immutable after extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageExtraction {
    pub page_number: u32,
    #[serde(default)]
    pub section: Option<String>,
    pub content_type: ContentType,
    pub text: String,
    #[serde(default)]
    pub tables: Vec<PageTable>,
    #[serde(default)]
    pub financial_metrics: Option<MetricSet>,
    #[serde(default)]
    pub segment_data: Vec<SegmentRevenue>,
    #[serde(default)]
    pub geographic_data: Vec<GeographicRevenue>,
    #[serde(default)]
    pub risk_factors: Vec<RiskFactor>,
    #[serde(default)]
    pub cross_references: Vec<String>,
    /// Factual claims, populated for reference documents
    #[serde(default)]
    pub key_claims: Vec<String>,
    /// Named entities, populated for reference documents
    #[serde(default)]
    pub entities: Vec<String>,
    /// Per-page extraction failure, recorded without aborting the document
    #[serde(default)]
    pub error: Option<String>,
}

impl PageExtraction {
    /// An empty page carrying only an error marker
    pub fn failed(page_number: u32, error: impl Into<String>) -> Self {
        Self {
            page_number,
            section: None,
            content_type: ContentType::Narrative,
            text: String::new(),
            tables: vec![],
            financial_metrics: None,
            segment_data: vec![],
            geographic_data: vec![],
            risk_factors: vec![],
            cross_references: vec![],
            key_claims: vec![],
            entities: vec![],
            error: Some(error.into()),
        }
    }
}

/// Document-level metadata produced by extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: String,
    pub doc_type: DocType,
    pub source_type: SourceType,
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub fiscal_year: Option<i32>,
    #[serde(default)]
    pub publication_date: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    pub file_hash: String,
    pub page_count: u32,
    pub extracted_at: DateTime<Utc>,
    pub extraction_cost: f64,
}

/// Consolidated, SQL-ready view of a filing document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsolidatedView {
    /// At most one metric set per fiscal year
    pub financial_metrics_by_year: BTreeMap<i32, MetricSet>,
    pub segment_revenue: Vec<SegmentRevenue>,
    pub geographic_revenue: Vec<GeographicRevenue>,
    pub risk_factors: Vec<RiskFactor>,
}

/// The full persisted result of extracting one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub metadata: DocumentMetadata,
    pub pages: Vec<PageExtraction>,
    #[serde(default)]
    pub consolidated: Option<ConsolidatedView>,
}

impl ExtractionRecord {
    /// Count of pages that extracted without error
    pub fn successful_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.error.is_none()).count()
    }
}
