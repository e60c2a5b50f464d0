//! Natural-language-to-SQL tool with a strict safety layer
//!
//! The planner model translates the question into SQL; the validator then
//! enforces SELECT-only statements over whitelisted tables and columns
//! with a bounded LIMIT before anything touches the read-only connection.

use super::Tool;
use crate::error::{AgentError, Result};
use crate::extraction::prompts::sql_generation_prompt;
use crate::llm::{user_message, LlmClient};
use crate::store::relational::{QueryOutput, RelationalStore};
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Hard cap on returned rows
const MAX_LIMIT: u64 = 100;

/// Tables the tool may reference
pub const ALLOWED_TABLES: &[&str] = &[
    "companies",
    "financial_metrics",
    "segment_revenue",
    "geographic_revenue",
    "risk_factors",
];

/// Columns allowed per table
pub fn allowed_columns(table: &str) -> &'static [&'static str] {
    match table {
        "companies" => &[
            "id",
            "ticker",
            "name",
            "sector",
            "fiscal_year_end",
            "filing_date",
            "document_id",
        ],
        "financial_metrics" => &[
            "id",
            "company_id",
            "fiscal_year",
            "revenue",
            "cost_of_revenue",
            "gross_profit",
            "operating_income",
            "operating_expenses",
            "net_income",
            "total_assets",
            "total_liabilities",
            "stockholders_equity",
            "cash_and_equivalents",
            "operating_cash_flow",
            "capital_expenditures",
            "eps_basic",
            "eps_diluted",
            "shares_outstanding",
            "currency",
        ],
        "segment_revenue" => &[
            "id",
            "company_id",
            "fiscal_year",
            "segment",
            "revenue",
            "currency",
        ],
        "geographic_revenue" => &[
            "id",
            "company_id",
            "fiscal_year",
            "region",
            "revenue",
            "currency",
        ],
        "risk_factors" => &["id", "company_id", "fiscal_year", "title", "description"],
        _ => &[],
    }
}

/// Keywords that must never appear in generated SQL
const DENIED_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "drop", "alter", "truncate", "create", "grant", "revoke",
    "attach", "detach", "pragma", "reindex", "vacuum", "replace",
];

/// SQL vocabulary that is not a column reference
const SQL_WORDS: &[&str] = &[
    "select", "from", "join", "inner", "left", "right", "outer", "cross", "on", "where", "group",
    "by", "order", "limit", "offset", "as", "and", "or", "not", "in", "like", "between", "is",
    "null", "desc", "asc", "distinct", "having", "case", "when", "then", "else", "end", "union",
    "all", "exists", "count", "sum", "avg", "min", "max", "round", "abs", "coalesce", "cast",
    "length", "upper", "lower", "total", "integer", "real", "text", "nullif", "ifnull",
];

/// Answer produced by the tool
#[derive(Debug, Serialize)]
pub struct SqlAnswer {
    pub narrative: String,
    pub table: QueryOutput,
    pub sql: String,
    pub row_count: usize,
}

/// Validate raw model SQL and return the sanitized statement.
///
/// Enforces: single SELECT statement, comments stripped, no denied
/// keywords, whitelisted tables and columns, LIMIT clamped to 100.
pub fn validate_sql(raw: &str) -> Result<String> {
    let mut sql = strip_comments(raw).trim().to_string();
    sql = sql.trim_end_matches(';').trim().to_string();

    if sql.is_empty() {
        return Err(AgentError::Validation("empty SQL statement".to_string()));
    }
    if sql.contains(';') {
        return Err(AgentError::Validation(
            "multi-statement SQL is not allowed".to_string(),
        ));
    }
    if !sql.to_lowercase().starts_with("select") {
        return Err(AgentError::Validation(
            "only SELECT statements are allowed".to_string(),
        ));
    }

    let without_literals = strip_string_literals(&sql);
    let lowered = without_literals.to_lowercase();

    let word_re = Regex::new(r"[a-z_][a-z0-9_]*").expect("static regex");
    let words: Vec<&str> = word_re.find_iter(&lowered).map(|m| m.as_str()).collect();

    for denied in DENIED_KEYWORDS {
        if words.contains(denied) {
            return Err(AgentError::Validation(format!(
                "disallowed keyword: {}",
                denied.to_uppercase()
            )));
        }
    }

    // Tables referenced after FROM/JOIN must be whitelisted, and their
    // aliases are collected for column checking.
    let table_re =
        Regex::new(r"\b(?:from|join)\s+([a-z_][a-z0-9_]*)(?:\s+(?:as\s+)?([a-z_][a-z0-9_]*))?")
            .expect("static regex");
    let mut tables: Vec<String> = Vec::new();
    let mut aliases: HashSet<String> = HashSet::new();
    for caps in table_re.captures_iter(&lowered) {
        let table = caps[1].to_string();
        if !ALLOWED_TABLES.contains(&table.as_str()) {
            return Err(AgentError::Validation(format!(
                "table not allowed: {}",
                table
            )));
        }
        if let Some(alias) = caps.get(2) {
            let alias = alias.as_str();
            if !SQL_WORDS.contains(&alias) {
                aliases.insert(alias.to_string());
            }
        }
        tables.push(table);
    }
    if tables.is_empty() {
        return Err(AgentError::Validation(
            "statement references no table".to_string(),
        ));
    }

    let allowed: HashSet<&str> = tables
        .iter()
        .flat_map(|t| allowed_columns(t).iter().copied())
        .collect();

    for word in &words {
        if SQL_WORDS.contains(word)
            || DENIED_KEYWORDS.contains(word)
            || tables.iter().any(|t| t == word)
            || aliases.contains(*word)
        {
            continue;
        }
        if !allowed.contains(word) {
            return Err(AgentError::Validation(format!(
                "column not allowed: {}",
                word
            )));
        }
    }

    // Clamp or inject LIMIT.
    let limit_re = Regex::new(r"(?i)\blimit\s+(\d+)").expect("static regex");
    if let Some(caps) = limit_re.captures(&sql) {
        let limit: u64 = caps[1].parse().unwrap_or(MAX_LIMIT);
        if limit > MAX_LIMIT {
            sql = limit_re
                .replace(&sql, format!("LIMIT {}", MAX_LIMIT).as_str())
                .to_string();
        }
    } else {
        sql = format!("{} LIMIT {}", sql, MAX_LIMIT);
    }

    Ok(sql)
}

fn strip_comments(sql: &str) -> String {
    let line_re = Regex::new(r"--[^\n]*").expect("static regex");
    let block_re = Regex::new(r"(?s)/\*.*?\*/").expect("static regex");
    let without_line = line_re.replace_all(sql, " ");
    block_re.replace_all(&without_line, " ").to_string()
}

fn strip_string_literals(sql: &str) -> String {
    let literal_re = Regex::new(r"'(?:[^']|'')*'").expect("static regex");
    literal_re.replace_all(sql, "''").to_string()
}

/// Schema description inlined into the generation prompt
pub fn schema_description() -> String {
    let mut out = String::new();
    for table in ALLOWED_TABLES {
        out.push_str(&format!("{}({})\n", table, allowed_columns(table).join(", ")));
    }
    out.push_str(
        "\nfinancial_metrics, segment_revenue, geographic_revenue, and risk_factors join to companies via company_id.",
    );
    out
}

/// The NL-to-SQL tool
pub struct SqlTool {
    llm: Arc<dyn LlmClient>,
    model: String,
    store: Arc<RelationalStore>,
    statement_timeout: Duration,
}

impl SqlTool {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        model: impl Into<String>,
        store: Arc<RelationalStore>,
        statement_timeout: Duration,
    ) -> Self {
        Self {
            llm,
            model: model.into(),
            store,
            statement_timeout,
        }
    }

    /// Answer a natural-language question against the financial database
    pub async fn answer(&self, question: &str) -> Result<SqlAnswer> {
        let prompt = sql_generation_prompt(&schema_description(), question);
        let response = self
            .llm
            .generate(&self.model, &[user_message(prompt)])
            .await?;

        let raw_sql = strip_fences(&response.text);
        debug!(sql = raw_sql, "generated SQL");

        let sql = validate_sql(&raw_sql)?;

        let table = match self.store.execute_readonly(&sql, self.statement_timeout).await {
            Ok(output) => output,
            Err(AgentError::Timeout(_)) => {
                return Err(AgentError::ToolFailed {
                    tool: "sql_query".to_string(),
                    reason: "query too expensive, please refine the question".to_string(),
                })
            }
            Err(err) => {
                warn!(error = %err, "sql execution failed");
                return Err(AgentError::ToolFailed {
                    tool: "sql_query".to_string(),
                    reason: "the database could not answer this query".to_string(),
                });
            }
        };

        let narrative = format_narrative(question, &table);
        Ok(SqlAnswer {
            row_count: table.rows.len(),
            narrative,
            table,
            sql,
        })
    }
}

fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```sql")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
        .to_string()
}

fn format_narrative(question: &str, output: &QueryOutput) -> String {
    if output.is_empty() {
        return "No data found for this question.".to_string();
    }

    let mut narrative = format!(
        "Found {} row{} for: {}\n",
        output.rows.len(),
        if output.rows.len() == 1 { "" } else { "s" },
        question
    );
    for row in output.rows.iter().take(5) {
        let rendered: Vec<String> = output
            .columns
            .iter()
            .zip(row.iter())
            .map(|(col, val)| format!("{}={}", col, render_value(val)))
            .collect();
        narrative.push_str(&format!("  {}\n", rendered.join(", ")));
    }
    narrative
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{}", f as i64)
                } else {
                    format!("{:.2}", f)
                }
            } else {
                n.to_string()
            }
        }
        other => other.to_string(),
    }
}

#[async_trait]
impl Tool for SqlTool {
    fn name(&self) -> &'static str {
        "sql_query"
    }

    fn description(&self) -> &'static str {
        "Answer questions about stored 10-K financial metrics (revenue, income, segments, regions, risks) with a safe SQL query"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": { "type": "string", "description": "The financial question to answer from the database" }
            },
            "required": ["question"]
        })
    }

    async fn invoke(&self, params: Value) -> Result<Value> {
        let question = params
            .get("question")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::Validation("missing 'question' parameter".to_string()))?;

        let answer = self.answer(question).await?;
        Ok(serde_json::to_value(answer)?)
    }
}
