//! Loads consolidated extraction records into the relational store
//!
//! One transaction per document: the company row upserts by ticker, then
//! metric, segment, geographic, and risk rows. A constraint failure rolls
//! back that document only. Dry-run mode validates without writing.

use super::relational::RelationalStore;
use crate::error::{AgentError, Result};
use crate::extraction::types::{DocType, ExtractionRecord};
use sqlx::Row;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of loading one document
#[derive(Debug, Default)]
pub struct LoadSummary {
    pub metric_rows: usize,
    pub segment_rows: usize,
    pub geographic_rows: usize,
    pub risk_rows: usize,
    pub warnings: Vec<String>,
}

/// Loader over the relational writer role
pub struct SqlLoader {
    store: Arc<RelationalStore>,
}

impl SqlLoader {
    pub fn new(store: Arc<RelationalStore>) -> Self {
        Self { store }
    }

    /// Validate a record against the loading invariants without writing
    pub fn validate(record: &ExtractionRecord) -> Result<()> {
        if record.metadata.doc_type != DocType::Filing {
            return Err(AgentError::Validation(format!(
                "{} is not a filing",
                record.metadata.document_id
            )));
        }
        if record.metadata.ticker.is_none() {
            return Err(AgentError::Validation(format!(
                "{} has no ticker",
                record.metadata.document_id
            )));
        }
        let consolidated = record.consolidated.as_ref().ok_or_else(|| {
            AgentError::Validation(format!(
                "{} has no consolidated view",
                record.metadata.document_id
            ))
        })?;
        for (year, metrics) in &consolidated.financial_metrics_by_year {
            if metrics.fiscal_year.is_some_and(|y| y != *year) {
                return Err(AgentError::Validation(format!(
                    "metric set year {} disagrees with key {}",
                    metrics.fiscal_year.unwrap_or_default(),
                    year
                )));
            }
        }
        Ok(())
    }

    /// Load one record; `dry_run` validates only
    pub async fn load(&self, record: &ExtractionRecord, dry_run: bool) -> Result<LoadSummary> {
        Self::validate(record)?;
        let mut summary = LoadSummary::default();

        let meta = &record.metadata;
        let ticker = meta.ticker.as_deref().expect("validated above");
        let consolidated = record.consolidated.as_ref().expect("validated above");

        if consolidated.financial_metrics_by_year.is_empty() {
            summary
                .warnings
                .push(format!("{}: no financial metrics to load", meta.document_id));
        }

        if dry_run {
            info!(document_id = meta.document_id, "dry run, no writes");
            return Ok(summary);
        }

        let mut tx = self.store.writer().begin().await?;

        // Upsert company by ticker.
        sqlx::query(
            r#"
            INSERT INTO companies (ticker, name, filing_date, document_id)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(ticker) DO UPDATE SET
                name = excluded.name,
                filing_date = excluded.filing_date,
                document_id = excluded.document_id
            "#,
        )
        .bind(ticker)
        .bind(meta.company.as_deref().unwrap_or(ticker))
        .bind(meta.extracted_at.format("%Y-%m-%d").to_string())
        .bind(&meta.document_id)
        .execute(&mut *tx)
        .await?;

        let company_id: i64 = sqlx::query("SELECT id FROM companies WHERE ticker = ?")
            .bind(ticker)
            .fetch_one(&mut *tx)
            .await?
            .get("id");

        for (year, metrics) in &consolidated.financial_metrics_by_year {
            if metrics.revenue.is_none() {
                summary.warnings.push(format!(
                    "{} FY{}: revenue missing, inserting null",
                    meta.document_id, year
                ));
            }
            sqlx::query(
                r#"
                INSERT INTO financial_metrics
                    (company_id, fiscal_year, revenue, cost_of_revenue, gross_profit,
                     operating_income, operating_expenses, net_income, total_assets,
                     total_liabilities, stockholders_equity, cash_and_equivalents,
                     operating_cash_flow, capital_expenditures, eps_basic, eps_diluted,
                     shares_outstanding)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                ON CONFLICT(company_id, fiscal_year) DO UPDATE SET
                    revenue = excluded.revenue,
                    cost_of_revenue = excluded.cost_of_revenue,
                    gross_profit = excluded.gross_profit,
                    operating_income = excluded.operating_income,
                    operating_expenses = excluded.operating_expenses,
                    net_income = excluded.net_income,
                    total_assets = excluded.total_assets,
                    total_liabilities = excluded.total_liabilities,
                    stockholders_equity = excluded.stockholders_equity,
                    cash_and_equivalents = excluded.cash_and_equivalents,
                    operating_cash_flow = excluded.operating_cash_flow,
                    capital_expenditures = excluded.capital_expenditures,
                    eps_basic = excluded.eps_basic,
                    eps_diluted = excluded.eps_diluted,
                    shares_outstanding = excluded.shares_outstanding
                "#,
            )
            .bind(company_id)
            .bind(*year)
            .bind(metrics.revenue)
            .bind(metrics.cost_of_revenue)
            .bind(metrics.gross_profit)
            .bind(metrics.operating_income)
            .bind(metrics.operating_expenses)
            .bind(metrics.net_income)
            .bind(metrics.total_assets)
            .bind(metrics.total_liabilities)
            .bind(metrics.stockholders_equity)
            .bind(metrics.cash_and_equivalents)
            .bind(metrics.operating_cash_flow)
            .bind(metrics.capital_expenditures)
            .bind(metrics.eps_basic)
            .bind(metrics.eps_diluted)
            .bind(metrics.shares_outstanding)
            .execute(&mut *tx)
            .await?;
            summary.metric_rows += 1;
        }

        // Detail tables reload wholesale for the company: delete then
        // insert keeps re-loads idempotent.
        sqlx::query("DELETE FROM segment_revenue WHERE company_id = ?")
            .bind(company_id)
            .execute(&mut *tx)
            .await?;
        for segment in &consolidated.segment_revenue {
            if segment.revenue.is_none() {
                summary.warnings.push(format!(
                    "{} segment '{}': revenue missing, inserting null",
                    meta.document_id, segment.segment
                ));
            }
            sqlx::query(
                "INSERT INTO segment_revenue (company_id, fiscal_year, segment, revenue) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(company_id)
            .bind(segment.fiscal_year)
            .bind(&segment.segment)
            .bind(segment.revenue)
            .execute(&mut *tx)
            .await?;
            summary.segment_rows += 1;
        }

        sqlx::query("DELETE FROM geographic_revenue WHERE company_id = ?")
            .bind(company_id)
            .execute(&mut *tx)
            .await?;
        for region in &consolidated.geographic_revenue {
            sqlx::query(
                "INSERT INTO geographic_revenue (company_id, fiscal_year, region, revenue) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(company_id)
            .bind(region.fiscal_year)
            .bind(&region.region)
            .bind(region.revenue)
            .execute(&mut *tx)
            .await?;
            summary.geographic_rows += 1;
        }

        sqlx::query("DELETE FROM risk_factors WHERE company_id = ?")
            .bind(company_id)
            .execute(&mut *tx)
            .await?;
        for risk in &consolidated.risk_factors {
            sqlx::query(
                "INSERT INTO risk_factors (company_id, fiscal_year, title, description) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(company_id)
            .bind(meta.fiscal_year)
            .bind(&risk.title)
            .bind(&risk.description)
            .execute(&mut *tx)
            .await?;
            summary.risk_rows += 1;
        }

        tx.commit().await?;

        for warning in &summary.warnings {
            warn!("{}", warning);
        }
        info!(
            document_id = meta.document_id,
            metric_rows = summary.metric_rows,
            segment_rows = summary.segment_rows,
            "loaded into relational store"
        );
        Ok(summary)
    }

    /// Load many records, optionally restricted to one ticker. A failed
    /// document rolls back alone and does not stop the run.
    pub async fn load_all(
        &self,
        records: &[ExtractionRecord],
        ticker: Option<&str>,
        dry_run: bool,
    ) -> Result<Vec<(String, Result<LoadSummary>)>> {
        let mut results = Vec::new();
        for record in records {
            if record.metadata.doc_type != DocType::Filing {
                continue;
            }
            if let Some(filter) = ticker {
                if record.metadata.ticker.as_deref() != Some(filter) {
                    continue;
                }
            }
            let outcome = self.load(record, dry_run).await;
            results.push((record.metadata.document_id.clone(), outcome));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::types::{
        ConsolidatedView, DocumentMetadata, MetricSet, RiskFactor, SegmentRevenue, SourceType,
    };
    use chrono::Utc;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn filing(ticker: &str, revenue: f64) -> ExtractionRecord {
        let mut by_year = BTreeMap::new();
        by_year.insert(
            2024,
            MetricSet {
                fiscal_year: Some(2024),
                revenue: Some(revenue),
                net_income: Some(revenue * 0.2),
                ..Default::default()
            },
        );
        ExtractionRecord {
            metadata: DocumentMetadata {
                document_id: format!("{}_10-k_2024", ticker.to_lowercase()),
                doc_type: DocType::Filing,
                source_type: SourceType::Official,
                ticker: Some(ticker.to_string()),
                company: Some(format!("{} Corp", ticker)),
                fiscal_year: Some(2024),
                publication_date: None,
                source: None,
                file_hash: "hash".to_string(),
                page_count: 1,
                extracted_at: Utc::now(),
                extraction_cost: 0.0,
            },
            pages: vec![],
            consolidated: Some(ConsolidatedView {
                financial_metrics_by_year: by_year,
                segment_revenue: vec![SegmentRevenue {
                    segment: "Products".to_string(),
                    fiscal_year: Some(2024),
                    revenue: Some(revenue * 0.8),
                }],
                geographic_revenue: vec![],
                risk_factors: vec![RiskFactor {
                    title: "Competition".to_string(),
                    description: None,
                }],
            }),
        }
    }

    async fn loader() -> (SqlLoader, Arc<RelationalStore>) {
        let store = Arc::new(RelationalStore::new("sqlite::memory:", 1).await.unwrap());
        (SqlLoader::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_load_and_roundtrip() {
        let (loader, store) = loader().await;
        let record = filing("AAPL", 394_328.0);
        let summary = loader.load(&record, false).await.unwrap();
        assert_eq!(summary.metric_rows, 1);
        assert_eq!(summary.segment_rows, 1);
        assert_eq!(summary.risk_rows, 1);

        let output = store
            .execute_readonly(
                "SELECT c.ticker, m.revenue, m.net_income FROM companies c JOIN financial_metrics m ON m.company_id = c.id WHERE m.fiscal_year = 2024 LIMIT 10",
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(output.rows.len(), 1);
        assert_eq!(output.rows[0][0], Value::from("AAPL"));
        assert_eq!(output.rows[0][1].as_f64(), Some(394_328.0));
    }

    #[tokio::test]
    async fn test_reload_idempotent() {
        let (loader, store) = loader().await;
        let record = filing("AAPL", 394_328.0);
        loader.load(&record, false).await.unwrap();
        loader.load(&record, false).await.unwrap();

        let output = store
            .execute_readonly(
                "SELECT COUNT(*) AS n FROM financial_metrics LIMIT 1",
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(output.rows[0][0], Value::from(1));

        let output = store
            .execute_readonly(
                "SELECT COUNT(*) AS n FROM segment_revenue LIMIT 1",
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(output.rows[0][0], Value::from(1));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let (loader, store) = loader().await;
        loader.load(&filing("AAPL", 100.0), true).await.unwrap();

        let output = store
            .execute_readonly("SELECT COUNT(*) AS n FROM companies LIMIT 1", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.rows[0][0], Value::from(0));
    }

    #[tokio::test]
    async fn test_validation_rejects_reference_docs() {
        let (loader, _) = loader().await;
        let mut record = filing("AAPL", 100.0);
        record.metadata.doc_type = DocType::Reference;
        assert!(loader.load(&record, false).await.is_err());
    }

    #[tokio::test]
    async fn test_validation_rejects_missing_ticker() {
        let (loader, _) = loader().await;
        let mut record = filing("AAPL", 100.0);
        record.metadata.ticker = None;
        assert!(loader.load(&record, false).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_fields_warn_and_null() {
        let (loader, _) = loader().await;
        let mut record = filing("AAPL", 100.0);
        record
            .consolidated
            .as_mut()
            .unwrap()
            .financial_metrics_by_year
            .get_mut(&2024)
            .unwrap()
            .revenue = None;

        let summary = loader.load(&record, false).await.unwrap();
        assert!(summary.warnings.iter().any(|w| w.contains("revenue missing")));
    }

    #[tokio::test]
    async fn test_load_all_filters_by_ticker() {
        let (loader, store) = loader().await;
        let records = vec![filing("AAPL", 100.0), filing("MSFT", 200.0)];
        let results = loader.load_all(&records, Some("MSFT"), false).await.unwrap();
        assert_eq!(results.len(), 1);

        let output = store
            .execute_readonly("SELECT ticker FROM companies LIMIT 10", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.rows.len(), 1);
        assert_eq!(output.rows[0][0], Value::from("MSFT"));
    }
}
