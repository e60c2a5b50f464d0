//! Configuration management for the agent backend

use serde::{Deserialize, Serialize};

/// Deployment environment, selects the secret source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Local,
    Cloud,
}

/// Verification policy level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifierPolicy {
    Strict,
    Moderate,
    Permissive,
}

/// Main configuration for the agent backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Deployment environment
    #[serde(default = "default_environment")]
    pub environment: Environment,

    /// Structured log verbosity (DEBUG, INFO, WARN, ERROR)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// CSV of origins accepted by the transport layer
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// LLM configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Store connection configuration
    #[serde(default)]
    pub stores: StoreConfig,

    /// RAG pipeline tunables
    #[serde(default)]
    pub rag: RagConfig,

    /// Verifier gates
    #[serde(default)]
    pub verifier: VerifierConfig,

    /// Semantic response cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Agent behavior settings
    #[serde(default)]
    pub agent: AgentBehaviorConfig,

    /// Document extraction settings
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// External tool credentials and endpoints
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Language model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model endpoint URL; absent switches every model call to mock mode
    pub endpoint: Option<String>,

    /// API key for the model endpoint
    pub api_key: Option<String>,

    /// Model for planning and final answers
    pub planner_model: String,

    /// Model for input/output verification
    pub verifier_model: String,

    /// Vision-capable model for document extraction
    pub vlm_model: String,

    /// Maximum tokens for generation
    pub max_tokens: u32,

    /// Temperature for generation
    pub temperature: f32,

    /// Per-call timeout in seconds
    pub timeout_secs: u64,
}

/// Embedding service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding model identifier
    pub model: String,

    /// Dense vector dimension; must equal the index dimension
    pub dimension: usize,

    /// Batch size for embed_batch
    pub batch_size: usize,
}

/// Store connection configuration. Each store is a SQLite database with a
/// bounded connection pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Vector index and graph store database
    pub index_db: String,

    /// Normalized financial metrics database
    pub relational_db: String,

    /// Conversation checkpoint database
    pub checkpoint_db: String,

    /// Semantic response cache database
    pub cache_db: String,

    /// Maximum connections per pool
    pub max_connections: u32,
}

/// RAG pipeline tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    /// Passages returned to the planner
    pub top_k: usize,

    /// Candidates fetched per query variant
    pub retrieval_top_k: usize,

    /// Reciprocal-rank fusion constant
    pub rrf_k: f64,

    /// Multiplicative weight for graph-corroborated candidates; 1.0 is
    /// neutral, values above favor chunks backed by entity relations,
    /// 0.0 removes graph influence
    pub kg_boost: f64,

    /// Fused candidates passed to the reranker
    pub rerank_top_n: usize,

    /// Query paraphrases generated during expansion
    pub expansion_count: usize,

    /// Dense weight in hybrid scoring; sparse gets the complement
    pub hybrid_alpha: f64,
}

/// Verifier gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// Policy level for both gates
    pub policy: VerifierPolicy,

    /// Enable the input gate
    pub check_input: bool,

    /// Enable the output gate
    pub check_output: bool,
}

/// Semantic response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable or disable the cache
    pub enabled: bool,

    /// Time-to-live for entries in seconds
    pub ttl_secs: i64,

    /// Minimum cosine similarity for a hit
    pub similarity_threshold: f32,

    /// Maximum number of entries before LRU eviction
    pub max_entries: usize,
}

/// Agent behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentBehaviorConfig {
    /// Maximum planner/tool rounds per turn
    pub max_tool_rounds: usize,

    /// Overall turn budget in seconds
    pub turn_budget_secs: u64,

    /// Per-call timeout for vector/graph queries in seconds
    pub retrieval_timeout_secs: u64,

    /// Per-call timeout for relational queries in seconds
    pub sql_timeout_secs: u64,

    /// Per-call timeout for web/market tools in seconds
    pub external_timeout_secs: u64,

    /// Turns of history presented to the planner
    pub max_history_turns: usize,
}

/// Document extraction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Directory of raw PDFs
    pub raw_dir: String,

    /// Directory for extraction JSON and the manifest
    pub extracted_dir: String,

    /// Maximum retries for throttled model calls
    pub max_retries: usize,
}

/// External tool credentials. Absent credentials switch the tool to mock mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Web search API key
    pub web_search_api_key: Option<String>,

    /// Web search endpoint
    pub web_search_endpoint: Option<String>,

    /// Market data API key
    pub market_api_key: Option<String>,

    /// Market data endpoint
    pub market_endpoint: Option<String>,
}

fn default_environment() -> Environment {
    Environment::Local
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            planner_model: "anthropic.claude-3-5-sonnet-20241022-v2:0".to_string(),
            verifier_model: "anthropic.claude-3-5-haiku-20241022-v1:0".to_string(),
            vlm_model: "anthropic.claude-3-5-sonnet-20241022-v2:0".to_string(),
            max_tokens: 4096,
            temperature: 0.0,
            timeout_secs: 60,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "amazon.titan-embed-text-v2:0".to_string(),
            dimension: 1024,
            batch_size: 25,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            index_db: "sqlite:.tenk/index.db".to_string(),
            relational_db: "sqlite:.tenk/financials.db".to_string(),
            checkpoint_db: "sqlite:.tenk/checkpoints.db".to_string(),
            cache_db: "sqlite:.tenk/cache.db".to_string(),
            max_connections: 5,
        }
    }
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            retrieval_top_k: 15,
            rrf_k: 60.0,
            kg_boost: 1.0,
            rerank_top_n: 15,
            expansion_count: 3,
            hybrid_alpha: 0.7,
        }
    }
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            policy: VerifierPolicy::Moderate,
            check_input: true,
            check_output: true,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 7 * 24 * 3600,
            similarity_threshold: 0.95,
            max_entries: 1000,
        }
    }
}

impl Default for AgentBehaviorConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 8,
            turn_budget_secs: 120,
            retrieval_timeout_secs: 10,
            sql_timeout_secs: 30,
            external_timeout_secs: 15,
            max_history_turns: 20,
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            raw_dir: "documents/raw".to_string(),
            extracted_dir: "documents/extracted".to_string(),
            max_retries: 3,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            log_level: default_log_level(),
            allowed_origins: vec![],
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            stores: StoreConfig::default(),
            rag: RagConfig::default(),
            verifier: VerifierConfig::default(),
            cache: CacheConfig::default(),
            agent: AgentBehaviorConfig::default(),
            extraction: ExtractionConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let config = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yml::from_str(&content)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        Ok(config)
    }

    /// Load configuration from the process environment, applying overrides
    /// on top of defaults. In the local environment a `.env` file is read
    /// first.
    pub fn from_env() -> anyhow::Result<Self> {
        if std::env::var("ENVIRONMENT").as_deref() != Ok("cloud") {
            // Local secrets come from a dotenv file when present.
            let _ = dotenv::dotenv();
        }

        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    /// Apply recognized environment variables onto this configuration
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ENVIRONMENT") {
            if v.eq_ignore_ascii_case("cloud") {
                self.environment = Environment::Cloud;
            }
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("ALLOWED_ORIGINS") {
            self.allowed_origins = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("LLM_ENDPOINT") {
            self.llm.endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("PLANNER_MODEL_ID") {
            self.llm.planner_model = v;
        }
        if let Ok(v) = std::env::var("VERIFIER_MODEL_ID") {
            self.llm.verifier_model = v;
        }
        if let Ok(v) = std::env::var("EMBED_MODEL_ID") {
            self.embedding.model = v;
        }
        if let Ok(v) = std::env::var("VLM_MODEL_ID") {
            self.llm.vlm_model = v;
        }
        if let Ok(Ok(v)) = std::env::var("RAG_TOP_K").map(|v| v.parse()) {
            self.rag.top_k = v;
        }
        if let Ok(Ok(v)) = std::env::var("RAG_RRF_K").map(|v| v.parse()) {
            self.rag.rrf_k = v;
        }
        if let Ok(Ok(v)) = std::env::var("RAG_KG_BOOST").map(|v| v.parse()) {
            self.rag.kg_boost = v;
        }
        if let Ok(Ok(v)) = std::env::var("RAG_RERANK_TOP_N").map(|v| v.parse()) {
            self.rag.rerank_top_n = v;
        }
        if let Ok(v) = std::env::var("WEB_SEARCH_API_KEY") {
            self.tools.web_search_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("MARKET_API_KEY") {
            self.tools.market_api_key = Some(v);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(endpoint) = &self.llm.endpoint {
            if !endpoint.starts_with("http") {
                return Err(anyhow::anyhow!("Invalid LLM endpoint: {}", endpoint));
            }
        }

        if self.llm.planner_model.is_empty() {
            return Err(anyhow::anyhow!("Planner model id cannot be empty"));
        }

        if self.embedding.dimension == 0 {
            return Err(anyhow::anyhow!("Embedding dimension must be greater than 0"));
        }

        if self.embedding.batch_size == 0 {
            return Err(anyhow::anyhow!("Embedding batch size must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.cache.similarity_threshold) {
            return Err(anyhow::anyhow!(
                "Cache similarity threshold must be between 0.0 and 1.0"
            ));
        }

        if self.rag.rrf_k <= 0.0 {
            return Err(anyhow::anyhow!("RRF k must be positive"));
        }

        if self.rag.kg_boost < 0.0 {
            return Err(anyhow::anyhow!("KG boost must be non-negative"));
        }

        if self.rag.top_k == 0 || self.rag.retrieval_top_k == 0 {
            return Err(anyhow::anyhow!("RAG top_k values must be greater than 0"));
        }

        if self.agent.max_tool_rounds == 0 {
            return Err(anyhow::anyhow!("Max tool rounds must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.rag.hybrid_alpha) {
            return Err(anyhow::anyhow!("Hybrid alpha must be between 0.0 and 1.0"));
        }

        Ok(())
    }

    /// Whether LLM calls should use the mock client
    pub fn llm_is_mock(&self) -> bool {
        self.llm.endpoint.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rag.rrf_k, 60.0);
        assert_eq!(config.rag.top_k, 5);
        assert_eq!(config.cache.similarity_threshold, 0.95);
        assert_eq!(config.embedding.dimension, 1024);
        assert!(config.llm_is_mock());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AgentConfig::default();
        assert!(config.validate().is_ok());

        config.llm.endpoint = Some("not-a-url".to_string());
        assert!(config.validate().is_err());

        config = AgentConfig::default();
        config.embedding.dimension = 0;
        assert!(config.validate().is_err());

        config = AgentConfig::default();
        config.rag.kg_boost = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_roundtrip_toml() {
        let config = AgentConfig::default();
        let serialized = toml::to_string(&config).unwrap();
        let parsed: AgentConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.rag.rrf_k, config.rag.rrf_k);
        assert_eq!(parsed.stores.max_connections, config.stores.max_connections);
    }
}
