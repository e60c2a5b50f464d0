//! Consolidation of per-page extractions into the SQL-ready view

use super::types::{ConsolidatedView, MetricSet, PageExtraction};
use std::collections::BTreeMap;

/// Merge pages into a consolidated view.
///
/// Financial metrics merge per fiscal year with a non-null policy: the
/// first page to report a value wins, later pages only fill nulls.
/// Segment and geographic rows dedupe on the exact tuple; risk factors
/// dedupe on title (case-insensitive).
pub fn consolidate(pages: &[PageExtraction], default_fiscal_year: Option<i32>) -> ConsolidatedView {
    let mut by_year: BTreeMap<i32, MetricSet> = BTreeMap::new();
    let mut view = ConsolidatedView::default();

    for page in pages {
        if page.error.is_some() {
            continue;
        }

        if let Some(metrics) = &page.financial_metrics {
            if !metrics.is_empty() {
                if let Some(year) = metrics.fiscal_year.or(default_fiscal_year) {
                    by_year
                        .entry(year)
                        .and_modify(|existing| existing.merge_non_null(metrics))
                        .or_insert_with(|| {
                            let mut owned = metrics.clone();
                            owned.fiscal_year = Some(year);
                            owned
                        });
                }
            }
        }

        for segment in &page.segment_data {
            let mut segment = segment.clone();
            segment.fiscal_year = segment.fiscal_year.or(default_fiscal_year);
            if !view.segment_revenue.contains(&segment) {
                view.segment_revenue.push(segment);
            }
        }

        for region in &page.geographic_data {
            let mut region = region.clone();
            region.fiscal_year = region.fiscal_year.or(default_fiscal_year);
            if !view.geographic_revenue.contains(&region) {
                view.geographic_revenue.push(region);
            }
        }

        for risk in &page.risk_factors {
            let title_key = risk.title.trim().to_lowercase();
            if title_key.is_empty() {
                continue;
            }
            let seen = view
                .risk_factors
                .iter()
                .any(|r| r.title.trim().to_lowercase() == title_key);
            if !seen {
                view.risk_factors.push(risk.clone());
            }
        }
    }

    view.financial_metrics_by_year = by_year;
    view
}
