//! Language model client used for synthesis.
//!
//! The pipeline only ever needs a single-turn completion: a system prompt,
//! a user prompt and, for extraction-style calls, a request that the model
//! answer with a JSON object.

use crate::config::LlmConfig;
use crate::error::{RagError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// A single-turn completion request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmRequest {
    pub system: String,
    pub prompt: String,
    /// Ask the provider to constrain output to a JSON object.
    pub json_mode: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl LlmRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

/// Trait for completion providers.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Return the model's text reply.
    async fn complete(&self, request: &LlmRequest) -> Result<String>;

    fn model_name(&self) -> &str;
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiChatModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl OpenAiChatModel {
    /// Build a client from configuration, reading the key from
    /// `config.api_key_env`. Local endpoints do not need a key.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let is_local =
            config.base_url.contains("localhost") || config.base_url.contains("127.0.0.1");
        let api_key = match std::env::var(&config.api_key_env) {
            Ok(key) if !key.trim().is_empty() => key,
            _ if is_local => {
                debug!("No API key set for local model endpoint; using a placeholder token");
                "local".to_string()
            }
            _ => {
                return Err(RagError::validation(format!(
                    "language model provider '{}' requires {} to be set",
                    config.provider, config.api_key_env
                )));
            }
        };
        Self::new_with_key(config, api_key)
    }

    pub fn new_with_key(config: &LlmConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    fn request_body(&self, request: &LlmRequest) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
            "temperature": request.temperature.unwrap_or(self.temperature),
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
        });
        if request.json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    async fn complete(&self, request: &LlmRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(
            url = %url,
            model = %self.model,
            json_mode = request.json_mode,
            "Sending completion request"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(request))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RagError::upstream(
                "complete",
                &self.model,
                format!("HTTP {status}: {detail}"),
            ));
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| RagError::upstream("complete", &self.model, "no choices in response"))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Scripted model for tests and offline runs.
///
/// Queued responses are returned in order; once the queue is empty the
/// fallback reply is returned.
pub struct MockLanguageModel {
    responses: Mutex<Vec<String>>,
    fallback: String,
    requests: Mutex<Vec<LlmRequest>>,
}

impl MockLanguageModel {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            fallback: "{}".to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A model that answers every call with `text`.
    pub fn with_response(text: &str) -> Self {
        Self {
            fallback: text.to_string(),
            ..Self::new()
        }
    }

    /// Queue a reply for the next `complete` call.
    pub fn queue_response(&self, text: impl Into<String>) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text.into());
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Every request seen so far, oldest first.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for MockLanguageModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageModel for MockLanguageModel {
    async fn complete(&self, request: &LlmRequest) -> Result<String> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let mut responses = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
        if responses.is_empty() {
            Ok(self.fallback.clone())
        } else {
            Ok(responses.remove(0))
        }
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }
}

/// Factory function to create a language model from configuration.
pub fn create_language_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "openai" | "openai_compatible" | "ollama" => Ok(Arc::new(OpenAiChatModel::new(config)?)),
        "mock" => Ok(Arc::new(MockLanguageModel::new())),
        other => Err(RagError::validation(format!(
            "unknown language model provider '{other}' (expected openai, openai_compatible, ollama or mock)"
        ))),
    }
}
