//! Language model integration
//!
//! A single [`LlmClient`] trait fronts every model the system uses: the
//! planner, the verifier, the extraction model, and the embedding model.
//! The HTTP implementation talks to an OpenAI-compatible endpoint; the
//! mock implementation is deterministic and keeps the whole system
//! runnable without credentials.

use crate::config::{EmbeddingConfig, LlmConfig};
use crate::error::{LlmError, Result};
use crate::resilience::RetryPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Message role in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Response from text generation
#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub text: String,
    pub tokens_used: Option<u32>,
    pub model: String,
}

/// Page payload for the extraction model
#[derive(Debug, Clone)]
pub enum PagePayload {
    /// Extracted page text
    Text(String),
    /// Base64-encoded page image
    ImageBase64 { data: String, media_type: String },
}

impl PagePayload {
    /// Build an image payload from raw page bytes
    pub fn image(bytes: &[u8], media_type: impl Into<String>) -> Self {
        use base64::Engine;
        PagePayload::ImageBase64 {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            media_type: media_type.into(),
        }
    }
}

/// Trait for language model operations
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate text from a conversation using the given model
    async fn generate(&self, model: &str, messages: &[Message]) -> Result<GenerationResponse>;

    /// Generate text, delivering incremental deltas over `tx` before
    /// returning the complete response. Consumers must tolerate arbitrary
    /// delta boundaries.
    async fn generate_stream(
        &self,
        model: &str,
        messages: &[Message],
        tx: flume::Sender<String>,
    ) -> Result<GenerationResponse> {
        let response = self.generate(model, messages).await?;
        for piece in split_into_deltas(&response.text) {
            if tx.send(piece).is_err() {
                break;
            }
        }
        Ok(response)
    }

    /// Generate embeddings for a single text
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for a batch of texts
    async fn embed_batch(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(model, text).await?);
        }
        Ok(out)
    }

    /// Describe a document page with the extraction model
    async fn describe_page(
        &self,
        model: &str,
        prompt: &str,
        payload: &PagePayload,
    ) -> Result<String>;
}

/// Split response text into streaming deltas at whitespace runs
pub(crate) fn split_into_deltas(text: &str) -> Vec<String> {
    let mut deltas = Vec::new();
    let mut current = String::new();
    for word in text.split_inclusive(char::is_whitespace) {
        current.push_str(word);
        if current.len() >= 16 {
            deltas.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        deltas.push(current);
    }
    deltas
}

/// HTTP client against an OpenAI-compatible model endpoint
pub struct HttpLlmClient {
    client: reqwest::Client,
    config: LlmConfig,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    completion_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingsDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsDatum {
    embedding: Vec<f32>,
}

impl HttpLlmClient {
    /// Create a new HTTP model client
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            client,
            config,
            retry: RetryPolicy::default(),
        })
    }

    fn api_url(&self, endpoint: &str) -> String {
        let base = self
            .config
            .endpoint
            .as_deref()
            .unwrap_or("http://localhost:8000")
            .trim_end_matches('/');
        format!("{}/v1/{}", base, endpoint)
    }

    async fn post_json(&self, url: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let mut request = self.client.post(url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = timeout(Duration::from_secs(self.config.timeout_secs), request.send())
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(|e| LlmError::ConnectionFailed(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(LlmError::Throttled.into());
        }
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            error!(status = status.as_u16(), "model endpoint error: {}", error_text);
            return Err(LlmError::GenerationFailed(error_text).into());
        }

        response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()).into())
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate(&self, model: &str, messages: &[Message]) -> Result<GenerationResponse> {
        debug!(model, count = messages.len(), "generating completion");

        let body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
        });
        let url = self.api_url("chat/completions");

        let raw = self
            .retry
            .run("llm_generate", || self.post_json(&url, body.clone()))
            .await?;

        let parsed: ChatCompletionResponse =
            serde_json::from_value(raw).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("empty choices".to_string()))?;

        info!(
            model,
            tokens = parsed.usage.as_ref().and_then(|u| u.completion_tokens).unwrap_or(0),
            "generation complete"
        );

        Ok(GenerationResponse {
            text: choice.message.content,
            tokens_used: parsed.usage.and_then(|u| u.completion_tokens),
            model: parsed.model.unwrap_or_else(|| model.to_string()),
        })
    }

    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let mut batch = self.embed_batch(model, &[text.to_string()]).await?;
        batch
            .pop()
            .ok_or_else(|| LlmError::EmbeddingFailed("empty embedding batch".to_string()).into())
    }

    async fn embed_batch(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        debug!(model, count = texts.len(), "generating embeddings");

        let body = json!({ "model": model, "input": texts });
        let url = self.api_url("embeddings");

        let raw = self
            .retry
            .run("llm_embed", || self.post_json(&url, body.clone()))
            .await?;

        let parsed: EmbeddingsResponse =
            serde_json::from_value(raw).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        if parsed.data.len() != texts.len() {
            return Err(LlmError::EmbeddingFailed(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            ))
            .into());
        }

        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    async fn describe_page(
        &self,
        model: &str,
        prompt: &str,
        payload: &PagePayload,
    ) -> Result<String> {
        let content = match payload {
            PagePayload::Text(text) => json!(format!("{}\n\nPAGE CONTENT:\n{}", prompt, text)),
            PagePayload::ImageBase64 { data, media_type } => json!([
                { "type": "text", "text": prompt },
                { "type": "image_url",
                  "image_url": { "url": format!("data:{};base64,{}", media_type, data) } },
            ]),
        };

        let body = json!({
            "model": model,
            "messages": [{ "role": "user", "content": content }],
            "max_tokens": self.config.max_tokens,
            "temperature": 0.0,
        });
        let url = self.api_url("chat/completions");

        let raw = self
            .retry
            .run("llm_describe_page", || self.post_json(&url, body.clone()))
            .await?;

        let parsed: ChatCompletionResponse =
            serde_json::from_value(raw).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("empty choices".to_string()).into())
    }
}

/// Deterministic mock model client.
///
/// Generation pops scripted responses in order, falling back to a canned
/// answer; embeddings are hash-seeded so identical text always produces
/// the identical unit vector.
pub struct MockLlmClient {
    scripted: Mutex<VecDeque<String>>,
    dimension: usize,
}

impl MockLlmClient {
    pub fn new(embedding: &EmbeddingConfig) -> Self {
        warn!("LLM endpoint not configured; using deterministic mock model client");
        Self {
            scripted: Mutex::new(VecDeque::new()),
            dimension: embedding.dimension,
        }
    }

    /// Create a mock with a fixed dimension (tests)
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            dimension,
        }
    }

    /// Queue a scripted generation response
    pub fn push_response(&self, response: impl Into<String>) {
        self.scripted
            .lock()
            .expect("mock lock poisoned")
            .push_back(response.into());
    }

    /// Deterministic pseudo-embedding: FNV-1a seeded, unit-normalized
    pub fn pseudo_embedding(text: &str, dimension: usize) -> Vec<f32> {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in text.to_lowercase().bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x100000001b3);
        }

        let mut state = hash;
        let mut vector = Vec::with_capacity(dimension);
        for _ in 0..dimension {
            // xorshift64 keeps the sequence deterministic per seed
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            vector.push(((state % 2000) as f32 / 1000.0) - 1.0);
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(&self, model: &str, messages: &[Message]) -> Result<GenerationResponse> {
        let scripted = self
            .scripted
            .lock()
            .expect("mock lock poisoned")
            .pop_front();

        let text = scripted.unwrap_or_else(|| {
            let last_user = messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.as_str())
                .unwrap_or("");
            format!(
                "I do not have a configured model endpoint. Your question was: {}",
                last_user.chars().take(200).collect::<String>()
            )
        });

        Ok(GenerationResponse {
            text,
            tokens_used: None,
            model: model.to_string(),
        })
    }

    async fn embed(&self, _model: &str, text: &str) -> Result<Vec<f32>> {
        Ok(Self::pseudo_embedding(text, self.dimension))
    }

    async fn describe_page(
        &self,
        model: &str,
        prompt: &str,
        payload: &PagePayload,
    ) -> Result<String> {
        let scripted = self
            .scripted
            .lock()
            .expect("mock lock poisoned")
            .pop_front();
        if let Some(text) = scripted {
            return Ok(text);
        }

        let _ = (model, prompt);
        let text_len = match payload {
            PagePayload::Text(text) => text.len(),
            PagePayload::ImageBase64 { data, .. } => data.len(),
        };
        Ok(json!({
            "section": null,
            "content_type": "narrative",
            "text": format!("[mock extraction of {} source bytes]", text_len),
            "tables": [],
        })
        .to_string())
    }
}

/// Helper function to create a system message
pub fn system_message(content: impl Into<String>) -> Message {
    Message {
        role: Role::System,
        content: content.into(),
    }
}

/// Helper function to create a user message
pub fn user_message(content: impl Into<String>) -> Message {
    Message {
        role: Role::User,
        content: content.into(),
    }
}

/// Helper function to create an assistant message
pub fn assistant_message(content: impl Into<String>) -> Message {
    Message {
        role: Role::Assistant,
        content: content.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::automock;

    #[automock]
    #[async_trait]
    #[allow(dead_code)]
    pub trait ScriptableLlm: Send + Sync {
        async fn generate(&self, model: &str, prompt: &str) -> Result<String>;
    }

    #[tokio::test]
    async fn test_mockall_llm_seam() {
        let mut mock = MockScriptableLlm::new();
        mock.expect_generate()
            .withf(|model, _| model == "planner")
            .times(1)
            .returning(|_, _| Ok("Amazon had the highest revenue.".to_string()));

        let text = mock.generate("planner", "highest revenue?").await.unwrap();
        assert!(text.contains("Amazon"));
    }

    #[test]
    fn test_image_payload_encoding() {
        let payload = PagePayload::image(b"fake image bytes", "image/png");
        match payload {
            PagePayload::ImageBase64 { data, media_type } => {
                assert_eq!(media_type, "image/png");
                use base64::Engine;
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .unwrap();
                assert_eq!(decoded, b"fake image bytes");
            }
            PagePayload::Text(_) => panic!("expected image payload"),
        }
    }

    #[test]
    fn test_message_creation() {
        let msg = system_message("You answer questions about SEC filings.");
        assert_eq!(msg.role, Role::System);

        let msg = user_message("Which company had the highest revenue?");
        assert_eq!(msg.role, Role::User);
    }

    #[test]
    fn test_split_into_deltas_reassembles() {
        let text = "The quick brown fox jumps over the lazy dog, repeatedly and fast.";
        let deltas = split_into_deltas(text);
        assert!(deltas.len() > 1);
        assert_eq!(deltas.concat(), text);
    }

    #[test]
    fn test_pseudo_embedding_deterministic() {
        let a = MockLlmClient::pseudo_embedding("gross margin comparison", 64);
        let b = MockLlmClient::pseudo_embedding("gross margin comparison", 64);
        let c = MockLlmClient::pseudo_embedding("supply chain risks", 64);

        assert_eq!(a, b);
        assert_ne!(a, c);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_mock_scripted_responses() {
        let mock = MockLlmClient::with_dimension(8);
        mock.push_response("first");
        mock.push_response("second");

        let messages = vec![user_message("hi")];
        assert_eq!(mock.generate("m", &messages).await.unwrap().text, "first");
        assert_eq!(mock.generate("m", &messages).await.unwrap().text, "second");
        // Falls back to the canned answer once the script is drained.
        assert!(mock
            .generate("m", &messages)
            .await
            .unwrap()
            .text
            .contains("hi"));
    }

    #[tokio::test]
    async fn test_mock_embed_batch_default_impl() {
        let mock = MockLlmClient::with_dimension(16);
        let texts = vec!["one".to_string(), "two".to_string()];
        let vectors = mock.embed_batch("m", &texts).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), 16);
    }

    #[test]
    fn test_api_url() {
        let config = LlmConfig {
            endpoint: Some("http://localhost:9000/".to_string()),
            ..Default::default()
        };
        let client = HttpLlmClient::new(config).unwrap();
        assert_eq!(
            client.api_url("chat/completions"),
            "http://localhost:9000/v1/chat/completions"
        );
    }
}
