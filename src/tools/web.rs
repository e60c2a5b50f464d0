//! Web search tool behind a circuit breaker
//!
//! Returns normalized results with source URLs and retrieval timestamps.
//! Without credentials the tool serves deterministic mock results so the
//! agent stays runnable.

use super::Tool;
use crate::config::ToolsConfig;
use crate::error::{AgentError, Result};
use crate::resilience::{CircuitBreaker, RetryPolicy};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

/// A normalized web search result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub published_at: Option<String>,
    pub retrieved_at: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    results: Vec<ApiResult>,
}

#[derive(Debug, Deserialize)]
struct ApiResult {
    title: String,
    url: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    published_at: Option<String>,
}

/// Web search over an external API
pub struct WebSearchTool {
    client: reqwest::Client,
    api_key: Option<String>,
    endpoint: Option<String>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl WebSearchTool {
    pub fn new(config: &ToolsConfig, timeout: Duration) -> Self {
        if config.web_search_api_key.is_none() {
            info!("web search credentials absent; tool will serve mock results");
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: config.web_search_api_key.clone(),
            endpoint: config.web_search_endpoint.clone(),
            breaker: CircuitBreaker::new("web_search"),
            retry: RetryPolicy::default(),
        }
    }

    /// Search the web for a query
    pub async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        let (Some(api_key), Some(endpoint)) = (&self.api_key, &self.endpoint) else {
            return Ok(mock_results(query, max_results));
        };

        let results = self
            .breaker
            .call(self.retry.run("web_search", || {
                self.fetch(endpoint, api_key, query, max_results)
            }))
            .await?;
        debug!(query, count = results.len(), "web search complete");
        Ok(results)
    }

    async fn fetch(
        &self,
        endpoint: &str,
        api_key: &str,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>> {
        let response = self
            .client
            .get(endpoint)
            .bearer_auth(api_key)
            .query(&[("q", query), ("count", &max_results.to_string())])
            .send()
            .await?;

        if response.status().as_u16() == 429 {
            return Err(AgentError::Throttled("web search rate limited".to_string()));
        }
        if !response.status().is_success() {
            return Err(AgentError::ToolFailed {
                tool: "web_search".to_string(),
                reason: format!("status {}", response.status()),
            });
        }

        let parsed: ApiResponse = response.json().await?;
        let retrieved_at = Utc::now().to_rfc3339();
        Ok(parsed
            .results
            .into_iter()
            .take(max_results)
            .map(|r| SearchResult {
                title: r.title,
                url: r.url,
                snippet: r.snippet,
                published_at: r.published_at,
                retrieved_at: retrieved_at.clone(),
            })
            .collect())
    }
}

/// Deterministic placeholder results for credential-less runs
fn mock_results(query: &str, max_results: usize) -> Vec<SearchResult> {
    let retrieved_at = Utc::now().to_rfc3339();
    (0..max_results.min(3))
        .map(|i| SearchResult {
            title: format!("[mock] result {} for '{}'", i + 1, query),
            url: format!("https://example.com/search/{}", i + 1),
            snippet: format!(
                "Mock search snippet {} mentioning {}. Configure WEB_SEARCH_API_KEY for live results.",
                i + 1,
                query
            ),
            published_at: None,
            retrieved_at: retrieved_at.clone(),
        })
        .collect()
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &'static str {
        "web_search"
    }

    fn description(&self) -> &'static str {
        "Search the web for recent news and context not present in stored filings"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "max_results": { "type": "integer", "default": 5 }
            },
            "required": ["query"]
        })
    }

    async fn invoke(&self, params: Value) -> Result<Value> {
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::Validation("missing 'query' parameter".to_string()))?;
        let max_results = params
            .get("max_results")
            .and_then(Value::as_u64)
            .unwrap_or(5) as usize;

        let results = self.search(query, max_results).await?;
        Ok(json!({ "results": results }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_mode_without_credentials() {
        let tool = WebSearchTool::new(&ToolsConfig::default(), Duration::from_secs(5));
        let results = tool.search("NVDA AI chip demand", 5).await.unwrap();
        assert!(!results.is_empty());
        assert!(results[0].title.contains("[mock]"));
        assert!(results[0].url.starts_with("https://"));
    }

    #[tokio::test]
    async fn test_invoke_requires_query() {
        let tool = WebSearchTool::new(&ToolsConfig::default(), Duration::from_secs(5));
        assert!(tool.invoke(json!({})).await.is_err());

        let result = tool.invoke(json!({"query": "test"})).await.unwrap();
        assert!(result["results"].is_array());
    }
}
