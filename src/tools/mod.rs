//! Tool capability layer
//!
//! Every tool exposes the same small surface: a name, a description, a
//! JSON input schema, and an invoke call returning JSON. The planner sees
//! only this metadata and JSON-shaped results, so new tools are added by
//! implementing the trait and registering.

pub mod market;
pub mod rag;
pub mod sql;
pub mod web;

pub use market::MarketDataTool;
pub use rag::RagTool;
pub use sql::SqlTool;
pub use web::WebSearchTool;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The capability every tool implements
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable tool name the planner refers to
    fn name(&self) -> &'static str;

    /// One-line description shown to the planner
    fn description(&self) -> &'static str;

    /// JSON schema of the accepted parameters
    fn input_schema(&self) -> Value;

    /// Execute with JSON parameters, returning a JSON result
    async fn invoke(&self, params: Value) -> Result<Value>;
}

/// Registry of available tools, ordered by name
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    /// Render tool metadata for the planner prompt
    pub fn describe_for_planner(&self) -> String {
        let mut out = String::new();
        for tool in self.tools.values() {
            out.push_str(&format!(
                "- {}: {}\n  parameters: {}\n",
                tool.name(),
                tool.description(),
                tool.input_schema()
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn description(&self) -> &'static str {
            "Echoes its parameters"
        }
        fn input_schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn invoke(&self, params: Value) -> Result<Value> {
            Ok(params)
        }
    }

    #[tokio::test]
    async fn test_registry_roundtrip() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        assert_eq!(registry.names(), vec!["echo"]);
        let tool = registry.get("echo").unwrap();
        let result = tool.invoke(serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(result["x"], 1);
        assert!(registry.get("missing").is_none());

        let description = registry.describe_for_planner();
        assert!(description.contains("echo: Echoes"));
    }
}
