use crate::config::LlmConfig;
use crate::model::Turn;
use async_trait::async_trait;
use reqwest::{Client, Request, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Turn>,
    pub temperature: f32,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("llm config error: {0}")]
    Config(&'static str),
    #[error("llm url error: {0}")]
    Url(String),
    #[error("llm http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("llm json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("llm api error {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("llm response did not contain text")]
    Empty,
}

#[async_trait]
pub trait Completer: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;
}

#[derive(Clone, Debug)]
pub struct OpenAiCompleter {
    http: Client,
    endpoint: Url,
    api_key: String,
}

impl OpenAiCompleter {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = std::env::var(&config.api_key_env).unwrap_or_default();
        Self::new(
            &config.base_url,
            api_key,
            Duration::from_millis(config.timeout_ms),
        )
    }

    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(LlmError::Config("llm api key must not be empty"));
        }

        let mut base = Url::parse(base_url.trim()).map_err(|err| LlmError::Url(err.to_string()))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path().trim_end_matches('/'));
            base.set_path(&path);
        }
        let endpoint = base
            .join("chat/completions")
            .map_err(|err| LlmError::Url(err.to_string()))?;

        let http = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            endpoint,
            api_key,
        })
    }

    pub fn build_request(&self, request: &CompletionRequest) -> Result<Request, LlmError> {
        let request = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(request)
            .build()?;
        Ok(request)
    }
}

#[async_trait]
impl Completer for OpenAiCompleter {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let req = self.build_request(request)?;
        let resp = self.http.execute(req).await?;
        let status = resp.status();
        let body = resp.text().await?;
        parse_chat_response(status, &body)
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
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

pub fn parse_chat_response(status: StatusCode, body: &str) -> Result<String, LlmError> {
    if !status.is_success() {
        return Err(LlmError::Api {
            status,
            body: body.to_string(),
        });
    }

    let response: ChatCompletionsResponse = serde_json::from_str(body)?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or(LlmError::Empty)
}
