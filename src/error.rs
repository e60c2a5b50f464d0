//! Error handling for the agent backend

use thiserror::Error;

/// Result type alias for the agent backend
pub type Result<T> = std::result::Result<T, AgentError>;

/// Main error type for the agent backend
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("input rejected: {0}")]
    InputRejected(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("tool unavailable: {tool}: circuit open")]
    ToolUnavailable { tool: String },

    #[error("tool failed: {tool}: {reason}")]
    ToolFailed { tool: String, reason: String },

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("checkpoint conflict for conversation {conversation_id}")]
    CheckpointConflict { conversation_id: String },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors from language model operations
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("throttled by provider")]
    Throttled,

    #[error("timeout: operation took too long")]
    Timeout,
}

/// Errors from document extraction
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("unreadable PDF: {path}: {reason}")]
    UnreadablePdf { path: String, reason: String },

    #[error("page {page} extraction failed: {reason}")]
    PageFailed { page: usize, reason: String },

    #[error("malformed model output on page {page}")]
    MalformedOutput { page: usize },

    #[error("manifest error: {0}")]
    Manifest(String),
}

/// Errors from indexing and retrieval stores
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("store not initialized")]
    NotInitialized,

    #[error("invalid vector dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("upsert failed: {0}")]
    UpsertFailed(String),

    #[error("unknown entity: {0}")]
    UnknownEntity(String),
}

impl AgentError {
    /// Check if the error is retryable with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Throttled(_)
                | AgentError::Llm(LlmError::Throttled)
                | AgentError::Llm(LlmError::ConnectionFailed(_))
                | AgentError::Http(_)
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            AgentError::InputRejected(_) => "input_rejected",
            AgentError::Validation(_) => "validation",
            AgentError::ToolUnavailable { .. } => "tool_unavailable",
            AgentError::ToolFailed { .. } => "tool_failed",
            AgentError::Throttled(_) => "throttled",
            AgentError::Timeout(_) => "timeout",
            AgentError::CheckpointConflict { .. } => "checkpoint_conflict",
            AgentError::Llm(_) => "llm",
            AgentError::Extraction(_) => "extraction",
            AgentError::Index(_) => "index",
            AgentError::Config(_) => "config",
            AgentError::Io(_) => "io",
            AgentError::Serialization(_) => "serialization",
            AgentError::Http(_) => "http",
            AgentError::Database(_) => "database",
            AgentError::Internal(_) => "internal",
        }
    }

    /// Message safe to surface to end users. Never leaks internals.
    pub fn user_message(&self) -> String {
        match self {
            AgentError::InputRejected(reason) => {
                format!("Your request could not be processed: {}", reason)
            }
            AgentError::Validation(reason) => format!("Invalid request: {}", reason),
            AgentError::ToolUnavailable { tool } => {
                format!("The {} tool is temporarily unavailable.", tool)
            }
            AgentError::Timeout(_) => {
                "The request took too long to process. Please try a simpler question.".to_string()
            }
            AgentError::Throttled(_) => {
                "The service is busy right now. Please retry shortly.".to_string()
            }
            _ => "An internal error occurred while processing your request.".to_string(),
        }
    }
}
