use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BackendError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// A message in an LLM conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Request to an LLM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmRequest {
    pub system_prompt: String,
    pub messages: Vec<LlmMessage>,
    pub max_tokens: u32,
}

/// Token counts reported by the backend for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// Response from an LLM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmResponse {
    pub content: String,
    /// Model that actually served the request.
    pub model: String,
    pub usage: TokenUsage,
}

/// Facade trait for generative backends.
///
/// Implementations can call Anthropic, an OpenAI-compatible server, or return
/// scripted responses for testing.
pub trait LlmClient: Send + Sync {
    fn chat<'a>(
        &'a self,
        request: &'a LlmRequest,
    ) -> Pin<Box<dyn Future<Output = Result<LlmResponse, BackendError>> + Send + 'a>>;
}

/// Client for the Anthropic Messages API.
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl AnthropicClient {
    pub fn new(base_url: String, model: String, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            model,
            api_key,
        }
    }
}

impl LlmClient for AnthropicClient {
    fn chat<'a>(
        &'a self,
        request: &'a LlmRequest,
    ) -> Pin<Box<dyn Future<Output = Result<LlmResponse, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let api_key = self.api_key.as_deref().ok_or_else(|| {
                BackendError(
                    "no Anthropic API key configured (set SPECGEN_LLM_API_KEY or ANTHROPIC_API_KEY)"
                        .into(),
                )
            })?;

            let body = serde_json::json!({
                "model": self.model,
                "max_tokens": request.max_tokens,
                "system": request.system_prompt,
                "messages": request.messages,
            });

            let url = format!("{}/messages", self.base_url.trim_end_matches('/'));
            let resp = self
                .http
                .post(&url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await
                .map_err(|e| BackendError(format!("HTTP request failed: {e}")))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(BackendError(format!("LLM API returned {status}: {body}")));
            }

            let json: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| BackendError(format!("Failed to parse response: {e}")))?;

            let content: String = json["content"]
                .as_array()
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter(|b| b["type"] == "text")
                        .filter_map(|b| b["text"].as_str())
                        .collect()
                })
                .unwrap_or_default();
            if content.is_empty() {
                return Err(BackendError(format!(
                    "No text content in response: {}",
                    serde_json::to_string_pretty(&json).unwrap_or_default()
                )));
            }

            Ok(LlmResponse {
                content,
                model: json["model"].as_str().unwrap_or(&self.model).to_string(),
                usage: TokenUsage {
                    input_tokens: json["usage"]["input_tokens"].as_u64().unwrap_or(0),
                    output_tokens: json["usage"]["output_tokens"].as_u64().unwrap_or(0),
                },
            })
        })
    }
}

/// Client for servers speaking the OpenAI `/chat/completions` protocol.
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleClient {
    pub fn new(base_url: String, model: String, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            model,
            api_key,
        }
    }
}

impl LlmClient for OpenAiCompatibleClient {
    fn chat<'a>(
        &'a self,
        request: &'a LlmRequest,
    ) -> Pin<Box<dyn Future<Output = Result<LlmResponse, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let mut messages = vec![serde_json::json!({
                "role": "system",
                "content": request.system_prompt,
            })];

            for msg in &request.messages {
                messages.push(serde_json::json!({
                    "role": msg.role,
                    "content": msg.content,
                }));
            }

            let body = serde_json::json!({
                "model": self.model,
                "messages": messages,
                "max_tokens": request.max_tokens,
            });

            let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
            let mut req = self.http.post(&url).json(&body);

            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| BackendError(format!("HTTP request failed: {e}")))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(BackendError(format!("LLM API returned {status}: {body}")));
            }

            let json: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| BackendError(format!("Failed to parse response: {e}")))?;

            let content = json["choices"][0]["message"]["content"]
                .as_str()
                .ok_or_else(|| {
                    BackendError(format!(
                        "No content in response: {}",
                        serde_json::to_string_pretty(&json).unwrap_or_default()
                    ))
                })?
                .to_string();

            Ok(LlmResponse {
                content,
                model: json["model"].as_str().unwrap_or(&self.model).to_string(),
                usage: TokenUsage {
                    input_tokens: json["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
                    output_tokens: json["usage"]["completion_tokens"].as_u64().unwrap_or(0),
                },
            })
        })
    }
}

/// One scripted reply of a [`StubLlmClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubReply {
    Text(String),
    Error(String),
}

type Responder = Box<dyn Fn(&LlmRequest) -> StubReply + Send + Sync>;
type Delay = Box<dyn Fn(&LlmRequest) -> Duration + Send + Sync>;

/// Stub LLM client that returns deterministic responses for testing.
///
/// Scripted replies are served in call order and cycle once exhausted. Every
/// request is recorded so tests can inspect the prompts that were sent.
pub struct StubLlmClient {
    replies: Vec<StubReply>,
    responder: Option<Responder>,
    delay: Option<Delay>,
    model: String,
    usage: TokenUsage,
    call_count: AtomicUsize,
    requests: Mutex<Vec<LlmRequest>>,
}

impl StubLlmClient {
    pub fn new(responses: Vec<String>) -> Self {
        Self::scripted(responses.into_iter().map(StubReply::Text).collect())
    }

    pub fn scripted(replies: Vec<StubReply>) -> Self {
        Self {
            replies,
            responder: None,
            delay: None,
            model: "stub".into(),
            usage: TokenUsage::default(),
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Create a stub that always returns the given response.
    pub fn constant(response: &str) -> Self {
        Self::new(vec![response.to_string()])
    }

    /// Create a stub whose every call fails with the given message.
    pub fn failing(message: &str) -> Self {
        Self::scripted(vec![StubReply::Error(message.to_string())])
    }

    /// Answer each request by inspecting it.
    pub fn from_fn(responder: impl Fn(&LlmRequest) -> StubReply + Send + Sync + 'static) -> Self {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::scripted(vec![])
        }
    }

    /// Report this model and usage on every successful reply.
    pub fn with_usage(mut self, model: &str, usage: TokenUsage) -> Self {
        self.model = model.into();
        self.usage = usage;
        self
    }

    /// Sleep before answering; the duration may depend on the request.
    pub fn with_delay(
        mut self,
        delay: impl Fn(&LlmRequest) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.delay = Some(Box::new(delay));
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl LlmClient for StubLlmClient {
    fn chat<'a>(
        &'a self,
        request: &'a LlmRequest,
    ) -> Pin<Box<dyn Future<Output = Result<LlmResponse, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
            self.requests
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(request.clone());

            if let Some(delay) = &self.delay {
                tokio::time::sleep(delay(request)).await;
            }

            let reply = match &self.responder {
                Some(responder) => responder(request),
                None if self.replies.is_empty() => StubReply::Text("stub response".into()),
                None => self.replies[idx % self.replies.len()].clone(),
            };

            match reply {
                StubReply::Text(content) => Ok(LlmResponse {
                    content,
                    model: self.model.clone(),
                    usage: self.usage,
                }),
                StubReply::Error(message) => Err(BackendError(message)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> LlmRequest {
        LlmRequest {
            system_prompt: "test".into(),
            messages: vec![LlmMessage::user("hello")],
            max_tokens: 100,
        }
    }

    #[tokio::test]
    async fn stub_returns_constant_response() {
        let client = StubLlmClient::constant("hello");
        let response = client.chat(&request()).await.unwrap();
        assert_eq!(response.content, "hello");
        assert_eq!(response.model, "stub");
        assert_eq!(response.usage.total(), 0);
    }

    #[tokio::test]
    async fn stub_cycles_through_responses() {
        let client = StubLlmClient::new(vec!["first".into(), "second".into()]);
        let req = request();

        assert_eq!(client.chat(&req).await.unwrap().content, "first");
        assert_eq!(client.chat(&req).await.unwrap().content, "second");
        assert_eq!(client.chat(&req).await.unwrap().content, "first"); // cycles back
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn stub_scripts_errors() {
        let client = StubLlmClient::scripted(vec![
            StubReply::Error("rate limited".into()),
            StubReply::Text("ok".into()),
        ]);
        let req = request();
        assert_eq!(
            client.chat(&req).await.unwrap_err(),
            BackendError("rate limited".into())
        );
        assert_eq!(client.chat(&req).await.unwrap().content, "ok");
    }

    #[tokio::test]
    async fn stub_reports_configured_usage_and_records_requests() {
        let client = StubLlmClient::constant("x").with_usage(
            "claude-haiku-4-5",
            TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
        );
        let response = client.chat(&request()).await.unwrap();
        assert_eq!(response.model, "claude-haiku-4-5");
        assert_eq!(response.usage.total(), 15);
        assert_eq!(client.requests()[0].messages[0].content, "hello");
    }

    #[tokio::test]
    async fn stub_from_fn_inspects_request() {
        let client =
            StubLlmClient::from_fn(|req| StubReply::Text(req.messages[0].content.to_uppercase()));
        assert_eq!(client.chat(&request()).await.unwrap().content, "HELLO");
    }

    #[tokio::test]
    async fn anthropic_client_without_key_fails_fast() {
        let client = AnthropicClient::new(
            "http://127.0.0.1:1".into(),
            "claude-sonnet-4-5".into(),
            None,
        );
        let err = client.chat(&request()).await.unwrap_err();
        assert!(err.0.contains("API key"));
    }

    #[tokio::test]
    async fn openai_client_handles_connection_error() {
        let client = OpenAiCompatibleClient::new(
            "http://127.0.0.1:1".into(),
            "test-model".into(),
            None,
        );
        assert!(client.chat(&request()).await.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires ANTHROPIC_API_KEY and network access
    async fn anthropic_client_calls_real_api() {
        let client = AnthropicClient::new(
            "https://api.anthropic.com/v1".into(),
            "claude-haiku-4-5".into(),
            std::env::var("ANTHROPIC_API_KEY").ok(),
        );
        let request = LlmRequest {
            system_prompt: "Reply with exactly: PONG".into(),
            messages: vec![LlmMessage::user("PING")],
            max_tokens: 10,
        };
        let response = client.chat(&request).await.unwrap();
        assert!(!response.content.is_empty());
        assert!(response.usage.input_tokens > 0);
    }
}
