//! HTTP surface for the agent backend
//!
//! Two endpoints consumed by the transport layer: `POST /chat` streams
//! newline-delimited JSON events, `GET /health` reports collaborator
//! status. Transport concerns beyond these contracts (auth, rate
//! limiting) belong to the gateway in front.

use crate::agent::Agent;
use crate::error::AgentError;
use crate::events::AgentEvent;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<Agent>,
}

/// Chat request body
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// Health response body
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub environment: String,
    pub version: String,
    pub api_version: String,
    pub checks: BTreeMap<String, String>,
}

/// Build the router with CORS and tracing layers
pub fn router(agent: Arc<Agent>) -> Router {
    let cors = if agent.allowed_origins().is_empty() {
        CorsLayer::new().allow_origin(Any).allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = agent
            .allowed_origins()
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins).allow_headers(Any)
    };

    Router::new()
        .route("/chat", post(chat))
        .route("/health", get(health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { agent })
}

/// POST /chat: stream the turn's events as NDJSON
async fn chat(State(state): State<AppState>, Json(request): Json<ChatRequest>) -> Response {
    let handle = match state
        .agent
        .chat_stream(request.message, request.conversation_id)
    {
        Ok(handle) => handle,
        Err(err @ AgentError::Validation(_)) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": err.user_message() })),
            )
                .into_response();
        }
        Err(err) => {
            error!(error = %err, "failed to start turn");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": err.user_message() })),
            )
                .into_response();
        }
    };

    let conversation_id = handle.conversation_id.clone();
    let stream = handle.events.into_stream().map(|event: AgentEvent| {
        let line = serde_json::to_string(&event).unwrap_or_else(|_| {
            r#"{"type":"error","message":"event serialization failed"}"#.to_string()
        });
        Ok::<String, std::convert::Infallible>(format!("{}\n", line))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header("x-conversation-id", conversation_id)
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let report = state.agent.health().await;
    Json(HealthResponse {
        status: report.status,
        environment: state.agent.environment().to_string(),
        version: crate::VERSION.to_string(),
        api_version: "v1".to_string(),
        checks: report.checks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use tower::ServiceExt;

    async fn test_router() -> Router {
        let mut config = AgentConfig::default();
        config.stores.index_db = "sqlite::memory:".to_string();
        config.stores.relational_db = "sqlite::memory:".to_string();
        config.stores.checkpoint_db = "sqlite::memory:".to_string();
        config.stores.cache_db = "sqlite::memory:".to_string();
        config.stores.max_connections = 1;
        config.embedding.dimension = 32;
        router(Arc::new(Agent::new(config).await.unwrap()))
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = test_router().await;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["api_version"], "v1");
        assert!(parsed["checks"]["database"].is_string());
    }

    #[tokio::test]
    async fn test_chat_streams_ndjson_with_terminal() {
        let app = test_router().await;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message": "What was Apple's revenue?"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-conversation-id"));

        let body = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let events: Vec<AgentEvent> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert!(!events.is_empty());
        assert!(events.last().unwrap().is_terminal());
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_chat_rejects_bad_request() {
        let app = test_router().await;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"message": "hi", "conversation_id": "not-a-uuid"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
