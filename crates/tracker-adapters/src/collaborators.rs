//! Clients for the sandboxed code-execution service and the LLM completion API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracker_storage::HttpFetcher;

use crate::AdapterError;

pub const DEFAULT_CODE_EXEC_TIMEOUT: Duration = Duration::from_secs(35);
pub const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4.1-nano";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeExecutionRequest {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_data: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub execution_time_ms: f64,
}

#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(
        &self,
        request: CodeExecutionRequest,
    ) -> Result<CodeExecutionResult, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct HttpCodeExecutor {
    http: Arc<HttpFetcher>,
    url: String,
    timeout: Duration,
}

impl HttpCodeExecutor {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl CodeExecutor for HttpCodeExecutor {
    async fn execute(
        &self,
        request: CodeExecutionRequest,
    ) -> Result<CodeExecutionResult, AdapterError> {
        self.http
            .post_json(&self.url, &request, Some(self.timeout), None)
            .await
            .map_err(|err| AdapterError::Collaborator(format!("failed to execute code: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Message list in, free text out.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` client.
#[derive(Debug, Clone)]
pub struct OpenAiChatClient {
    http: Arc<HttpFetcher>,
    config: OpenAiConfig,
}

impl OpenAiChatClient {
    pub fn new(http: Arc<HttpFetcher>, config: OpenAiConfig) -> Self {
        Self { http, config }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LlmClient for OpenAiChatClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, AdapterError> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages,
        };
        let response: ChatCompletionResponse = self
            .http
            .post_json(
                &self.endpoint(),
                &request,
                Some(self.config.timeout),
                Some(&self.config.api_key),
            )
            .await
            .map_err(|err| AdapterError::Collaborator(err.to_string()))?;
        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}
