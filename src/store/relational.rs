//! Relational store for normalized 10-K financials
//!
//! Two handles over one SQLite database: a writer used only by the loader
//! and a query-only reader used only by the SQL tool. Reader statements
//! run under a hard timeout.

use crate::error::{AgentError, Result};
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Result of a read-only query, column-major metadata with row values
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryOutput {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// SQLite-backed relational store
pub struct RelationalStore {
    writer: SqlitePool,
    reader: SqlitePool,
}

impl RelationalStore {
    /// Open the store, creating the schema if missing
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        info!(database_url, "initializing relational store");
        super::ensure_sqlite_dir(database_url)?;

        let writer_options = SqliteConnectOptions::from_str(database_url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .foreign_keys(true);
        let writer = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(writer_options)
            .await?;

        Self::create_schema(&writer).await?;

        // In-memory databases are per-pool, so the reader shares the
        // writer pool there; file databases get a dedicated query-only
        // pool.
        let reader = if database_url.contains(":memory:") {
            writer.clone()
        } else {
            let reader_options = SqliteConnectOptions::from_str(database_url)
                .map_err(sqlx::Error::from)?
                .foreign_keys(true)
                .pragma("query_only", "1");
            SqlitePoolOptions::new()
                .max_connections(max_connections)
                .connect_with(reader_options)
                .await?
        };

        Ok(Self { writer, reader })
    }

    async fn create_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS companies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticker TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                sector TEXT,
                fiscal_year_end TEXT,
                filing_date TEXT,
                document_id TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS financial_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id INTEGER NOT NULL REFERENCES companies(id) ON DELETE CASCADE,
                fiscal_year INTEGER NOT NULL,
                revenue REAL,
                cost_of_revenue REAL,
                gross_profit REAL,
                operating_income REAL,
                operating_expenses REAL,
                net_income REAL,
                total_assets REAL,
                total_liabilities REAL,
                stockholders_equity REAL,
                cash_and_equivalents REAL,
                operating_cash_flow REAL,
                capital_expenditures REAL,
                eps_basic REAL,
                eps_diluted REAL,
                shares_outstanding REAL,
                currency TEXT NOT NULL DEFAULT 'USD',
                UNIQUE(company_id, fiscal_year)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS segment_revenue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id INTEGER NOT NULL REFERENCES companies(id) ON DELETE CASCADE,
                fiscal_year INTEGER,
                segment TEXT NOT NULL,
                revenue REAL,
                currency TEXT NOT NULL DEFAULT 'USD'
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS geographic_revenue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id INTEGER NOT NULL REFERENCES companies(id) ON DELETE CASCADE,
                fiscal_year INTEGER,
                region TEXT NOT NULL,
                revenue REAL,
                currency TEXT NOT NULL DEFAULT 'USD'
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS risk_factors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id INTEGER NOT NULL REFERENCES companies(id) ON DELETE CASCADE,
                fiscal_year INTEGER,
                title TEXT NOT NULL,
                description TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Writer pool, for the loader only
    pub fn writer(&self) -> &SqlitePool {
        &self.writer
    }

    /// Execute a validated SELECT on the read-only handle under a timeout
    pub async fn execute_readonly(&self, sql: &str, timeout: Duration) -> Result<QueryOutput> {
        let rows = tokio::time::timeout(timeout, sqlx::query(sql).fetch_all(&self.reader))
            .await
            .map_err(|_| {
                AgentError::Timeout("sql query exceeded statement timeout".to_string())
            })??;

        let columns = rows
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let mut out_rows = Vec::with_capacity(rows.len());
        for row in &rows {
            out_rows.push(decode_row(row)?);
        }

        Ok(QueryOutput {
            columns,
            rows: out_rows,
        })
    }

    /// Liveness probe for health checks
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.reader).await?;
        Ok(())
    }
}

fn decode_row(row: &SqliteRow) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(row.columns().len());
    for (i, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "INTEGER" => row
                .try_get::<Option<i64>, _>(i)?
                .map_or(Value::Null, Value::from),
            "REAL" => row
                .try_get::<Option<f64>, _>(i)?
                .map_or(Value::Null, Value::from),
            "TEXT" => row
                .try_get::<Option<String>, _>(i)?
                .map_or(Value::Null, Value::from),
            "NULL" => Value::Null,
            // Expression columns come back with empty type info; try the
            // common decodings in order.
            _ => row
                .try_get::<Option<f64>, _>(i)
                .ok()
                .flatten()
                .map(Value::from)
                .or_else(|| {
                    row.try_get::<Option<i64>, _>(i)
                        .ok()
                        .flatten()
                        .map(Value::from)
                })
                .or_else(|| {
                    row.try_get::<Option<String>, _>(i)
                        .ok()
                        .flatten()
                        .map(Value::from)
                })
                .unwrap_or(Value::Null),
        };
        values.push(value);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_and_query() {
        let store = RelationalStore::new("sqlite::memory:", 1).await.unwrap();

        sqlx::query(
            "INSERT INTO companies (ticker, name) VALUES ('AAPL', 'Apple Inc.')",
        )
        .execute(store.writer())
        .await
        .unwrap();

        let output = store
            .execute_readonly(
                "SELECT ticker, name FROM companies LIMIT 10",
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert_eq!(output.columns, vec!["ticker", "name"]);
        assert_eq!(output.rows.len(), 1);
        assert_eq!(output.rows[0][0], Value::from("AAPL"));
    }

    #[tokio::test]
    async fn test_unique_metric_per_fiscal_year() {
        let store = RelationalStore::new("sqlite::memory:", 1).await.unwrap();

        sqlx::query("INSERT INTO companies (ticker, name) VALUES ('AAPL', 'Apple Inc.')")
            .execute(store.writer())
            .await
            .unwrap();

        sqlx::query(
            "INSERT INTO financial_metrics (company_id, fiscal_year, revenue) VALUES (1, 2024, 100.0)",
        )
        .execute(store.writer())
        .await
        .unwrap();

        let duplicate = sqlx::query(
            "INSERT INTO financial_metrics (company_id, fiscal_year, revenue) VALUES (1, 2024, 200.0)",
        )
        .execute(store.writer())
        .await;
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn test_cascade_delete() {
        let store = RelationalStore::new("sqlite::memory:", 1).await.unwrap();

        sqlx::query("INSERT INTO companies (ticker, name) VALUES ('AAPL', 'Apple Inc.')")
            .execute(store.writer())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO financial_metrics (company_id, fiscal_year, revenue) VALUES (1, 2024, 100.0)",
        )
        .execute(store.writer())
        .await
        .unwrap();

        sqlx::query("DELETE FROM companies WHERE ticker = 'AAPL'")
            .execute(store.writer())
            .await
            .unwrap();

        let output = store
            .execute_readonly("SELECT id FROM financial_metrics LIMIT 5", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_orphan_metric_rejected() {
        let store = RelationalStore::new("sqlite::memory:", 1).await.unwrap();
        let result = sqlx::query(
            "INSERT INTO financial_metrics (company_id, fiscal_year, revenue) VALUES (99, 2024, 1.0)",
        )
        .execute(store.writer())
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_currency_defaults_to_usd() {
        let store = RelationalStore::new("sqlite::memory:", 1).await.unwrap();
        sqlx::query("INSERT INTO companies (ticker, name) VALUES ('AAPL', 'Apple Inc.')")
            .execute(store.writer())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO financial_metrics (company_id, fiscal_year) VALUES (1, 2024)",
        )
        .execute(store.writer())
        .await
        .unwrap();

        let output = store
            .execute_readonly(
                "SELECT currency FROM financial_metrics LIMIT 1",
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(output.rows[0][0], Value::from("USD"));
    }

    #[tokio::test]
    async fn test_expression_columns_decode() {
        let store = RelationalStore::new("sqlite::memory:", 1).await.unwrap();
        sqlx::query("INSERT INTO companies (ticker, name) VALUES ('AAPL', 'Apple Inc.')")
            .execute(store.writer())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO financial_metrics (company_id, fiscal_year, revenue, net_income) VALUES (1, 2024, 394328, 93736)",
        )
        .execute(store.writer())
        .await
        .unwrap();

        let output = store
            .execute_readonly(
                "SELECT net_income * 100.0 / revenue AS margin FROM financial_metrics LIMIT 1",
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        let margin = output.rows[0][0].as_f64().unwrap();
        assert!((margin - 23.77).abs() < 0.1);
    }
}
