//! Model-driven page extraction
//!
//! Each page is fed to the extraction model with a doc-type-specialized
//! prompt and parsed into the Page schema. Malformed model output gets one
//! repair retry with a stricter prompt; a page that still fails is recorded
//! as a per-page error and extraction continues.

use super::prompts::{FILING_PAGE_PROMPT, JSON_REPAIR_SUFFIX, REFERENCE_PAGE_PROMPT};
use super::types::{
    ContentType, DocType, GeographicRevenue, MetricSet, PageExtraction, PageTable, RiskFactor,
    SegmentRevenue,
};
use crate::error::{ExtractionError, Result};
use crate::llm::{LlmClient, PagePayload};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Blended model cost estimate per 1K tokens, used for manifest accounting
const COST_PER_1K_TOKENS: f64 = 0.009;

/// Document-level fields surfaced from reference extraction
#[derive(Debug, Clone, Default)]
pub struct ReferenceFields {
    pub headline: Option<String>,
    pub publication_date: Option<String>,
    pub source: Option<String>,
}

/// Result of extracting every page of one document
#[derive(Debug)]
pub struct VlmOutput {
    pub pages: Vec<PageExtraction>,
    pub reference_fields: ReferenceFields,
    pub estimated_cost: f64,
}

/// Page extraction driver over an [`LlmClient`]
pub struct VlmExtractor {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl VlmExtractor {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    /// Extract every page of a PDF into the Page schema
    pub async fn extract(&self, pdf_path: &Path, doc_type: DocType) -> Result<VlmOutput> {
        let page_texts = load_page_texts(pdf_path)?;
        info!(
            path = %pdf_path.display(),
            pages = page_texts.len(),
            ?doc_type,
            "extracting document"
        );

        let prompt = match doc_type {
            DocType::Filing => FILING_PAGE_PROMPT,
            DocType::Reference => REFERENCE_PAGE_PROMPT,
        };

        let mut pages = Vec::with_capacity(page_texts.len());
        let mut reference_fields = ReferenceFields::default();
        let mut estimated_cost = 0.0;

        for (index, text) in page_texts.iter().enumerate() {
            let page_number = (index + 1) as u32;
            let payload = PagePayload::Text(text.clone());

            let page = match self.extract_page(prompt, &payload, page_number).await {
                Ok((value, response_len)) => {
                    estimated_cost += estimate_cost(prompt.len() + text.len(), response_len);
                    if doc_type == DocType::Reference {
                        capture_reference_fields(&value, &mut reference_fields);
                    }
                    parse_page(&value, page_number, doc_type)
                }
                Err(err) => {
                    warn!(page = page_number, error = %err, "page extraction failed");
                    PageExtraction::failed(page_number, err.to_string())
                }
            };
            pages.push(page);
        }

        Ok(VlmOutput {
            pages,
            reference_fields,
            estimated_cost,
        })
    }

    /// One page: model call, JSON parse, single repair retry
    async fn extract_page(
        &self,
        prompt: &str,
        payload: &PagePayload,
        page_number: u32,
    ) -> Result<(Value, usize)> {
        let raw = self.llm.describe_page(&self.model, prompt, payload).await?;

        match parse_json_object(&raw) {
            Some(value) => Ok((value, raw.len())),
            None => {
                debug!(page = page_number, "malformed model output, retrying with repair prompt");
                let repair_prompt = format!("{}{}", prompt, JSON_REPAIR_SUFFIX);
                let raw = self
                    .llm
                    .describe_page(&self.model, &repair_prompt, payload)
                    .await?;
                let len = raw.len();
                parse_json_object(&raw)
                    .map(|v| (v, len))
                    .ok_or_else(|| ExtractionError::MalformedOutput { page: page_number as usize }.into())
            }
        }
    }
}

/// Read per-page text from a PDF
fn load_page_texts(path: &Path) -> Result<Vec<String>> {
    let pages = pdf_extract::extract_text_by_pages(path).map_err(|e| {
        ExtractionError::UnreadablePdf {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    })?;
    if pages.is_empty() {
        return Err(ExtractionError::UnreadablePdf {
            path: path.display().to_string(),
            reason: "no pages".to_string(),
        }
        .into());
    }
    Ok(pages)
}

/// Estimate model cost from character counts (≈ 4 chars per token)
fn estimate_cost(input_chars: usize, output_chars: usize) -> f64 {
    let tokens = (input_chars + output_chars) as f64 / 4.0;
    tokens / 1000.0 * COST_PER_1K_TOKENS
}

/// Parse a JSON object out of model output, tolerating code fences and
/// surrounding prose
pub fn parse_json_object(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();

    // Direct parse first.
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    // Strip markdown fences.
    let without_fences = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim);
    if let Some(inner) = without_fences {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(inner) {
            return Some(value);
        }
    }

    // Last resort: the outermost brace span.
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Normalize a monetary value to raw millions of USD.
///
/// Accepts numbers, or strings with currency symbols, commas, parentheses
/// for negatives, and magnitude words (thousand/million/billion).
pub fn normalize_monetary(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let lower = s.trim().to_lowercase();
            if lower.is_empty() || lower == "null" || lower == "n/a" || lower == "-" {
                return None;
            }

            let negative = lower.contains('(') && lower.contains(')');
            let magnitude = if lower.contains("billion") || lower.ends_with('b') {
                1000.0
            } else if lower.contains("thousand") || lower.ends_with('k') {
                0.001
            } else {
                // Bare numbers and "million" are already in millions.
                1.0
            };

            let numeric: String = lower
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            let parsed: f64 = numeric.parse().ok()?;
            let signed = if negative { -parsed.abs() } else { parsed };
            Some(signed * magnitude)
        }
        _ => None,
    }
}

/// Normalize a plain numeric field (EPS, ratios) without magnitude handling
fn normalize_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s
            .trim()
            .trim_start_matches('$')
            .replace(',', "")
            .parse()
            .ok(),
        _ => None,
    }
}

fn get_str(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
        .map(String::from)
}

fn get_year(value: &Value, key: &str) -> Option<i32> {
    match value.get(key) {
        Some(Value::Number(n)) => n.as_i64().map(|y| y as i32),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn get_string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn capture_reference_fields(value: &Value, fields: &mut ReferenceFields) {
    if fields.headline.is_none() {
        fields.headline = get_str(value, "headline");
    }
    if fields.publication_date.is_none() {
        fields.publication_date = get_str(value, "publication_date");
    }
    if fields.source.is_none() {
        fields.source = get_str(value, "source");
    }
}

fn parse_metric_set(value: &Value) -> Option<MetricSet> {
    let obj = value.get("financial_metrics")?;
    if !obj.is_object() {
        return None;
    }

    let metric = |key: &str| obj.get(key).and_then(normalize_monetary);
    let set = MetricSet {
        fiscal_year: get_year(obj, "fiscal_year"),
        revenue: metric("revenue"),
        cost_of_revenue: metric("cost_of_revenue"),
        gross_profit: metric("gross_profit"),
        operating_income: metric("operating_income"),
        operating_expenses: metric("operating_expenses"),
        net_income: metric("net_income"),
        total_assets: metric("total_assets"),
        total_liabilities: metric("total_liabilities"),
        stockholders_equity: metric("stockholders_equity"),
        cash_and_equivalents: metric("cash_and_equivalents"),
        operating_cash_flow: metric("operating_cash_flow"),
        capital_expenditures: metric("capital_expenditures"),
        eps_basic: obj.get("eps_basic").and_then(normalize_number),
        eps_diluted: obj.get("eps_diluted").and_then(normalize_number),
        shares_outstanding: metric("shares_outstanding"),
    };

    if set.is_empty() {
        None
    } else {
        Some(set)
    }
}

fn parse_tables(value: &Value) -> Vec<PageTable> {
    value
        .get("tables")
        .and_then(Value::as_array)
        .map(|tables| {
            tables
                .iter()
                .filter_map(|t| {
                    let headers = get_string_list(t, "headers");
                    let rows: Vec<Vec<String>> = t
                        .get("rows")
                        .and_then(Value::as_array)
                        .map(|rows| {
                            rows.iter()
                                .filter_map(Value::as_array)
                                .map(|row| {
                                    row.iter()
                                        .map(|cell| match cell {
                                            Value::String(s) => s.clone(),
                                            other => other.to_string(),
                                        })
                                        .collect()
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    if headers.is_empty() && rows.is_empty() {
                        return None;
                    }
                    Some(PageTable {
                        title: get_str(t, "title"),
                        headers,
                        rows,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Build a [`PageExtraction`] from validated model output
pub fn parse_page(value: &Value, page_number: u32, doc_type: DocType) -> PageExtraction {
    let content_type = match get_str(value, "content_type").as_deref() {
        Some("table") => ContentType::Table,
        Some("mixed") => ContentType::Mixed,
        _ => ContentType::Narrative,
    };

    let segment_data = value
        .get("segment_data")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    Some(SegmentRevenue {
                        segment: get_str(item, "segment")?,
                        fiscal_year: get_year(item, "fiscal_year"),
                        revenue: item.get("revenue").and_then(normalize_monetary),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let geographic_data = value
        .get("geographic_data")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    Some(GeographicRevenue {
                        region: get_str(item, "region")?,
                        fiscal_year: get_year(item, "fiscal_year"),
                        revenue: item.get("revenue").and_then(normalize_monetary),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let risk_factors = value
        .get("risk_factors")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    Some(RiskFactor {
                        title: get_str(item, "title")?,
                        description: get_str(item, "description"),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    PageExtraction {
        page_number,
        section: get_str(value, "section"),
        content_type,
        text: get_str(value, "text").unwrap_or_default(),
        tables: parse_tables(value),
        financial_metrics: if doc_type == DocType::Filing {
            parse_metric_set(value)
        } else {
            None
        },
        segment_data,
        geographic_data,
        risk_factors,
        cross_references: get_string_list(value, "cross_references"),
        key_claims: get_string_list(value, "key_claims"),
        entities: get_string_list(value, "entities"),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_monetary() {
        assert_eq!(normalize_monetary(&json!(394328.0)), Some(394_328.0));
        assert_eq!(normalize_monetary(&json!("$394,328")), Some(394_328.0));
        assert_eq!(normalize_monetary(&json!("$394.3 billion")), Some(394_300.0));
        assert_eq!(normalize_monetary(&json!("2.5 million")), Some(2.5));
        assert_eq!(normalize_monetary(&json!("(1,200)")), Some(-1_200.0));
        assert_eq!(normalize_monetary(&json!("750 thousand")), Some(0.75));
        assert_eq!(normalize_monetary(&json!("N/A")), None);
        assert_eq!(normalize_monetary(&json!(null)), None);
    }

    #[test]
    fn test_parse_json_object_variants() {
        assert!(parse_json_object(r#"{"a": 1}"#).is_some());
        assert!(parse_json_object("```json\n{\"a\": 1}\n```").is_some());
        assert!(parse_json_object("Here is the data: {\"a\": 1} done").is_some());
        assert!(parse_json_object("no json here").is_none());
        assert!(parse_json_object("[1, 2, 3]").is_none());
    }

    #[test]
    fn test_parse_filing_page() {
        let value = json!({
            "section": "Item 8. Financial Statements",
            "content_type": "table",
            "text": "Consolidated statements of operations",
            "tables": [{
                "title": "Net sales",
                "headers": ["Category", "2024"],
                "rows": [["iPhone", "200,583"]]
            }],
            "financial_metrics": {
                "fiscal_year": 2024,
                "revenue": "$394,328",
                "net_income": 93736,
                "eps_diluted": "6.13"
            },
            "segment_data": [
                {"segment": "iPhone", "fiscal_year": 2024, "revenue": "200,583"}
            ],
            "geographic_data": [],
            "risk_factors": [],
            "cross_references": ["See Note 11"]
        });

        let page = parse_page(&value, 45, DocType::Filing);
        assert_eq!(page.page_number, 45);
        assert_eq!(page.content_type, ContentType::Table);
        let metrics = page.financial_metrics.unwrap();
        assert_eq!(metrics.revenue, Some(394_328.0));
        assert_eq!(metrics.eps_diluted, Some(6.13));
        assert_eq!(page.segment_data[0].revenue, Some(200_583.0));
        assert_eq!(page.tables.len(), 1);
        assert_eq!(page.cross_references, vec!["See Note 11"]);
    }

    #[test]
    fn test_parse_reference_page_has_no_metrics() {
        let value = json!({
            "section": null,
            "content_type": "narrative",
            "text": "Demand for AI chips is surging.",
            "headline": "NVDA demand outlook",
            "publication_date": "2025-04-02",
            "source": "Example Wire",
            "key_claims": ["AI chip demand doubled"],
            "entities": ["NVDA"],
            // Even if a reference page carries metric-shaped data, the
            // filing-only field stays null.
            "financial_metrics": {"revenue": 100}
        });

        let page = parse_page(&value, 1, DocType::Reference);
        assert!(page.financial_metrics.is_none());
        assert_eq!(page.key_claims, vec!["AI chip demand doubled"]);
        assert_eq!(page.entities, vec!["NVDA"]);

        let mut fields = ReferenceFields::default();
        capture_reference_fields(&value, &mut fields);
        assert_eq!(fields.publication_date.as_deref(), Some("2025-04-02"));
        assert_eq!(fields.source.as_deref(), Some("Example Wire"));
    }

    #[test]
    fn test_cost_estimate_positive() {
        let cost = estimate_cost(4000, 1000);
        assert!(cost > 0.0);
        assert!(cost < 1.0);
    }
}
