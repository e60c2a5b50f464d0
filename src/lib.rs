//! TenK Agent Library
//!
//! An agentic backend that answers natural-language financial questions
//! about SEC 10-K filings and related reference documents:
//! - Planner/tool state machine with durable checkpoints and streaming
//! - Hybrid retrieval (dense + sparse) with knowledge-graph boosting
//! - Natural-language-to-SQL over a normalized financial schema
//! - Semantic response caching and input/output verification
//!
//! # Example
//!
//! ```rust,no_run
//! use tenk_agent::{Agent, AgentConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AgentConfig::from_env()?;
//!     let agent = Agent::new(config).await?;
//!
//!     let (conversation_id, events) = agent
//!         .chat("Which company had the highest revenue in 2024?", None)
//!         .await?;
//!
//!     println!("conversation {} produced {} events", conversation_id, events.len());
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod extraction;
pub mod index;
pub mod llm;
pub mod planner;
pub mod resilience;
pub mod store;
pub mod tools;
pub mod verifier;

// Re-export main types
pub use agent::{Agent, ChatHandle, ConversationState, HealthReport};
pub use cache::{CacheHit, CacheTrace, ResponseCache};
pub use config::{AgentConfig, Environment, RagConfig, VerifierPolicy};
pub use error::{AgentError, Result};
pub use events::{AgentEvent, Citation};
pub use extraction::{DocType, DocumentProcessor, ExtractionRecord, Manifest, VlmExtractor};
pub use index::{GraphStore, Indexer, SparseEncoder, SqliteVectorIndex, VectorIndex};
pub use llm::{HttpLlmClient, LlmClient, Message, MockLlmClient, Role};
pub use planner::{PlannedToolCall, Planner, PlannerDecision};
pub use store::{CheckpointStore, RelationalStore, SqlLoader};
pub use tools::{MarketDataTool, RagTool, SqlTool, Tool, ToolRegistry, WebSearchTool};
pub use verifier::{VerdictLabel, Verifier};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
