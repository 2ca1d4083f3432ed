//! LLM completion provider abstraction and implementations.
//!
//! Defines the [`Completer`] trait and concrete implementations:
//! - **[`DisabledCompleter`]**: returns [`LlmError::Disabled`]; used when no
//!   provider or API key is configured.
//! - **[`OpenAiCompleter`]**: calls the OpenAI chat-completions API with
//!   retry and backoff.
//!
//! Every call carries an explicit deadline. Implementations must not keep
//! working past it; the answer service additionally wraps each call in
//! `tokio::time::timeout_at`.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, ... but never sleeping past the deadline

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::LlmConfig;
use crate::error::LlmError;

/// A single-turn chat completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
}

/// Produces a completion for a prompt.
#[async_trait]
pub trait Completer: Send + Sync {
    /// Model identifier, for logs and `/health`.
    fn model_name(&self) -> &str;

    /// Whether calls can succeed at all. `false` means answers are degraded.
    fn is_configured(&self) -> bool {
        true
    }

    /// Return the raw model output for `request`, giving up at `deadline`.
    async fn complete(
        &self,
        request: &CompletionRequest,
        deadline: Instant,
    ) -> Result<String, LlmError>;
}

// ============ Disabled ============

/// A completer that always fails with the reason it is disabled.
pub struct DisabledCompleter {
    reason: String,
}

impl DisabledCompleter {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Completer for DisabledCompleter {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn is_configured(&self) -> bool {
        false
    }

    async fn complete(
        &self,
        _request: &CompletionRequest,
        _deadline: Instant,
    ) -> Result<String, LlmError> {
        Err(LlmError::Disabled(self.reason.clone()))
    }
}

// ============ OpenAI ============

/// Completer using the OpenAI chat-completions API.
///
/// Asks for a JSON object response so the answer service can parse
/// `{ "answer": ..., "links": [...] }` directly.
pub struct OpenAiCompleter {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
}

impl OpenAiCompleter {
    pub fn new(config: &LlmConfig, api_key: impl Into<String>) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| LlmError::Provider(e.to_string()))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Completer for OpenAiCompleter {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        deadline: Instant,
    ) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "response_format": { "type": "json_object" },
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                if Instant::now() + delay >= deadline {
                    break;
                }
                tokio::time::sleep(delay).await;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LlmError::Timeout);
            }

            let resp = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .timeout(remaining)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
                        return parse_chat_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();

                    // Rate limited or server error: retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(%status, attempt, "OpenAI request failed, retrying");
                        last_err = Some(LlmError::Provider(format!(
                            "OpenAI API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    // Client error (not 429): don't retry
                    return Err(LlmError::Provider(format!(
                        "OpenAI API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) if e.is_timeout() => return Err(LlmError::Timeout),
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "OpenAI request failed, retrying");
                    last_err = Some(LlmError::Provider(e.to_string()));
                }
            }
        }

        Err(last_err.unwrap_or(LlmError::Timeout))
    }
}

/// Extract `choices[0].message.content` from a chat-completions response.
fn parse_chat_response(json: &serde_json::Value) -> Result<String, LlmError> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            LlmError::InvalidResponse("missing choices[0].message.content".to_string())
        })
}

/// Create the configured [`Completer`].
///
/// `api_key` is normally `OPENAI_API_KEY`. An OpenAI provider without a key
/// falls back to [`DisabledCompleter`] so the server still starts and
/// serves degraded answers.
pub fn create_completer(config: &LlmConfig, api_key: Option<String>) -> Arc<dyn Completer> {
    if !config.is_enabled() {
        return Arc::new(DisabledCompleter::new("llm.provider is disabled"));
    }

    match api_key.filter(|k| !k.trim().is_empty()) {
        Some(key) => match OpenAiCompleter::new(config, key) {
            Ok(completer) => Arc::new(completer),
            Err(e) => {
                tracing::error!(error = %e, "failed to build OpenAI client");
                Arc::new(DisabledCompleter::new(e.to_string()))
            }
        },
        None => {
            tracing::warn!("OPENAI_API_KEY is not set; answers will be degraded");
            Arc::new(DisabledCompleter::new("OPENAI_API_KEY is not set"))
        }
    }
}
