//! HTTP reasoner client for OpenAI-compatible chat-completions endpoints.
//!
//! Transient failures (network, 429, 5xx) are retried with exponential
//! backoff: 2s, 4s, 8s, up to the configured budget. Structural failures
//! (non-JSON reply) are surfaced as `Malformed` and never retried; the
//! same prompt would only reproduce the same shape.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::prompts::{render_input, system_prompt};
use super::{Reasoner, ReasonerError, ReasonerReply, ReasonerResult, TaskKind, TokenUsage};

/// Endpoint and accounting configuration.
#[derive(Debug, Clone)]
pub struct ReasonerConfig {
    /// Base URL of the chat-completions API, e.g. `https://host/v1`.
    pub url: String,
    pub model: String,
    pub api_key: String,
    pub timeout: Duration,
    pub max_retries: u32,
    /// USD per million input tokens, for the cost ledger.
    pub input_price_per_mtok: f64,
    /// USD per million output tokens.
    pub output_price_per_mtok: f64,
    /// Cap on the serialized user prompt.
    pub max_input_bytes: usize,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("REASONER_URL").unwrap_or_else(|_| "http://localhost:8317/v1".into()),
            model: std::env::var("REASONER_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            api_key: std::env::var("REASONER_API_KEY").unwrap_or_else(|_| "not-needed".into()),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            input_price_per_mtok: 0.15,
            output_price_per_mtok: 0.60,
            max_input_bytes: 48 * 1024,
        }
    }
}

impl ReasonerConfig {
    fn cost(&self, usage: TokenUsage) -> f64 {
        (usage.input_tokens as f64 / 1_000_000.0) * self.input_price_per_mtok
            + (usage.output_tokens as f64 / 1_000_000.0) * self.output_price_per_mtok
    }
}

/// Reasoner over an OpenAI-compatible endpoint.
pub struct HttpReasoner {
    client: reqwest::Client,
    config: ReasonerConfig,
}

impl HttpReasoner {
    pub fn new(config: ReasonerConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn call_once(&self, task: TaskKind, input: &Value) -> Result<ReasonerReply, CallFailure> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": system_prompt(task) },
                { "role": "user", "content": render_input(input, self.config.max_input_bytes) },
            ],
            "temperature": 0.2,
            "response_format": { "type": "json_object" },
        });

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.config.url))
            .timeout(self.config.timeout)
            .json(&body);
        if self.config.api_key != "not-needed" {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CallFailure::Transient(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(CallFailure::Transient(format!("status {status}")));
        }
        if !status.is_success() {
            // Auth and client errors will not improve on retry.
            return Err(CallFailure::Permanent(format!("status {status}")));
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| CallFailure::Transient(e.to_string()))?;

        let usage = TokenUsage {
            input_tokens: envelope["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: envelope["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        };

        let content = envelope["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| CallFailure::Malformed("reply has no message content".into()))?;

        let json = parse_json_content(content)
            .ok_or_else(|| CallFailure::Malformed("message content is not a JSON object".into()))?;

        Ok(ReasonerReply {
            json,
            usage,
            cost_usd: self.config.cost(usage),
        })
    }
}

enum CallFailure {
    Transient(String),
    Permanent(String),
    Malformed(String),
}

/// Providers wrap JSON in markdown fences often enough to handle it here.
fn parse_json_content(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    let candidate = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```").trim())
        .unwrap_or(trimmed);
    let value: Value = serde_json::from_str(candidate).ok()?;
    value.is_object().then_some(value)
}

#[async_trait]
impl Reasoner for HttpReasoner {
    async fn reason(&self, task: TaskKind, input: Value) -> ReasonerResult<ReasonerReply> {
        let mut last_error = String::new();
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(2u64 << (attempt - 1).min(5));
                debug!(task = %task, attempt, ?delay, "retrying reasoner call");
                tokio::time::sleep(delay).await;
            }
            match self.call_once(task, &input).await {
                Ok(reply) => return Ok(reply),
                Err(CallFailure::Malformed(detail)) => {
                    return Err(ReasonerError::Malformed(detail));
                }
                Err(CallFailure::Permanent(detail)) => {
                    return Err(ReasonerError::Unavailable(detail));
                }
                Err(CallFailure::Transient(detail)) => {
                    warn!(task = %task, attempt, error = %detail, "reasoner call failed");
                    last_error = detail;
                }
            }
        }
        Err(ReasonerError::Unavailable(last_error))
    }
}

/// Reasoner that is always unavailable. Used when no endpoint is
/// configured; every worker then takes its deterministic fallback path.
pub struct OfflineReasoner;

#[async_trait]
impl Reasoner for OfflineReasoner {
    async fn reason(&self, _task: TaskKind, _input: Value) -> ReasonerResult<ReasonerReply> {
        Err(ReasonerError::Unavailable("no reasoner configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_json() {
        let value = parse_json_content(r#"{ "a": 1 }"#).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn parse_fenced_json() {
        let value = parse_json_content("```json\n{ \"a\": 1 }\n```").unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn reject_non_object() {
        assert!(parse_json_content("[1, 2]").is_none());
        assert!(parse_json_content("plain prose").is_none());
    }

    #[test]
    fn cost_uses_configured_prices() {
        let config = ReasonerConfig {
            input_price_per_mtok: 1.0,
            output_price_per_mtok: 10.0,
            ..Default::default()
        };
        let cost = config.cost(TokenUsage {
            input_tokens: 500_000,
            output_tokens: 100_000,
        });
        assert!((cost - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn offline_reasoner_is_unavailable() {
        let reply = OfflineReasoner
            .reason(TaskKind::Plan, serde_json::json!({}))
            .await;
        assert!(matches!(reply, Err(ReasonerError::Unavailable(_))));
    }
}
