//! Live market data tool behind a circuit breaker
//!
//! Quotes carry their source and timestamp. Without credentials the tool
//! serves deterministic mock quotes so the agent stays runnable.

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

/// A normalized market quote
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub change_percent: f64,
    pub currency: String,
    pub as_of: String,
    pub source: String,
}

#[derive(Debug, Deserialize)]
struct ApiQuote {
    #[serde(default)]
    price: f64,
    #[serde(default)]
    change_percent: f64,
    #[serde(default)]
    currency: Option<String>,
}

/// Market data over an external API
pub struct MarketDataTool {
    client: reqwest::Client,
    api_key: Option<String>,
    endpoint: Option<String>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl MarketDataTool {
    pub fn new(config: &ToolsConfig, timeout: Duration) -> Self {
        if config.market_api_key.is_none() {
            info!("market data credentials absent; tool will serve mock quotes");
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: config.market_api_key.clone(),
            endpoint: config.market_endpoint.clone(),
            breaker: CircuitBreaker::new("market_data"),
            retry: RetryPolicy::default(),
        }
    }

    /// Fetch a quote for one symbol
    pub async fn quote(&self, symbol: &str) -> Result<Quote> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() || symbol.len() > 5 || !symbol.chars().all(|c| c.is_ascii_alphabetic())
        {
            return Err(AgentError::Validation(format!(
                "invalid ticker symbol: {}",
                symbol
            )));
        }

        let (Some(api_key), Some(endpoint)) = (&self.api_key, &self.endpoint) else {
            return Ok(mock_quote(&symbol));
        };

        let quote = self
            .breaker
            .call(
                self.retry
                    .run("market_data", || self.fetch(endpoint, api_key, &symbol)),
            )
            .await?;
        debug!(symbol = quote.symbol, price = quote.price, "quote fetched");
        Ok(quote)
    }

    async fn fetch(&self, endpoint: &str, api_key: &str, symbol: &str) -> Result<Quote> {
        let url = format!("{}/quote/{}", endpoint.trim_end_matches('/'), symbol);
        let response = self.client.get(&url).bearer_auth(api_key).send().await?;

        if response.status().as_u16() == 429 {
            return Err(AgentError::Throttled("market data rate limited".to_string()));
        }
        if !response.status().is_success() {
            return Err(AgentError::ToolFailed {
                tool: "market_data".to_string(),
                reason: format!("status {}", response.status()),
            });
        }

        let parsed: ApiQuote = response.json().await?;
        Ok(Quote {
            symbol: symbol.to_string(),
            price: parsed.price,
            change_percent: parsed.change_percent,
            currency: parsed.currency.unwrap_or_else(|| "USD".to_string()),
            as_of: Utc::now().to_rfc3339(),
            source: url,
        })
    }
}

/// Deterministic placeholder quote derived from the symbol
fn mock_quote(symbol: &str) -> Quote {
    let seed: u32 = symbol.bytes().map(u32::from).sum();
    Quote {
        symbol: symbol.to_string(),
        price: 50.0 + f64::from(seed % 400),
        change_percent: f64::from(seed % 7) - 3.0,
        currency: "USD".to_string(),
        as_of: Utc::now().to_rfc3339(),
        source: "mock://market-data".to_string(),
    }
}

#[async_trait]
impl Tool for MarketDataTool {
    fn name(&self) -> &'static str {
        "market_data"
    }

    fn description(&self) -> &'static str {
        "Fetch a live market quote for a ticker symbol (price, daily change)"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "symbol": { "type": "string", "description": "Ticker symbol, e.g. AAPL" }
            },
            "required": ["symbol"]
        })
    }

    async fn invoke(&self, params: Value) -> Result<Value> {
        let symbol = params
            .get("symbol")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::Validation("missing 'symbol' parameter".to_string()))?;

        let quote = self.quote(symbol).await?;
        Ok(serde_json::to_value(quote)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_quote_deterministic() {
        let tool = MarketDataTool::new(&ToolsConfig::default(), Duration::from_secs(5));
        let a = tool.quote("AAPL").await.unwrap();
        let b = tool.quote("aapl").await.unwrap();
        assert_eq!(a.symbol, "AAPL");
        assert_eq!(a.price, b.price);
        assert_eq!(a.currency, "USD");
    }

    #[tokio::test]
    async fn test_invalid_symbol_rejected() {
        let tool = MarketDataTool::new(&ToolsConfig::default(), Duration::from_secs(5));
        assert!(tool.quote("").await.is_err());
        assert!(tool.quote("TOOLONG").await.is_err());
        assert!(tool.quote("AA'PL").await.is_err());
    }

    #[tokio::test]
    async fn test_invoke_shape() {
        let tool = MarketDataTool::new(&ToolsConfig::default(), Duration::from_secs(5));
        let result = tool.invoke(json!({"symbol": "NVDA"})).await.unwrap();
        assert_eq!(result["symbol"], "NVDA");
        assert!(result["price"].as_f64().is_some());
    }
}
