//! Anthropic (Claude) messages API.
//!
//! Probes send a one-token request on a cheap model and read the
//! `anthropic-ratelimit-*` response headers.

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value, json};

use super::TaskHandler;
use super::http::{
    api_key_from_env, build_client, classify_failure, header_str, header_value, network_error, retry_after,
};
use crate::config::AnthropicServiceConfig;
use crate::domain::{Task, TaskPayload};
use crate::error::{Result, TaskError};
use crate::id::now_ms;
use crate::registry::{ProbeError, ProbeReport, ServiceProvider};

/// Anthropic API version
const ANTHROPIC_VERSION: &str = "2023-06-01";

const RATELIMIT_PREFIX: &str = "anthropic-ratelimit-";

pub struct AnthropicProvider {
    client: Client,
    api_key: Option<String>,
    config: AnthropicServiceConfig,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .field("configured", &self.api_key.is_some())
            .finish()
    }
}

impl AnthropicProvider {
    /// Reads the API key from the environment variable named in config.
    pub fn from_config(config: &AnthropicServiceConfig) -> Result<Self> {
        Self::with_api_key(api_key_from_env(&config.api_key_env), config.clone())
    }

    pub fn with_api_key(api_key: Option<String>, config: AnthropicServiceConfig) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            api_key,
            config,
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }

    fn build_request(&self, prompt: &str, model: Option<&str>, max_tokens: Option<u32>) -> Value {
        json!({
            "model": model.unwrap_or(&self.config.model),
            "max_tokens": max_tokens.unwrap_or(self.config.max_tokens),
            "messages": [{ "role": "user", "content": prompt }]
        })
    }

    async fn send(&self, api_key: &str, body: &Value) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(self.messages_url())
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
    }
}

/// Collect `anthropic-ratelimit-*` headers, prefix stripped.
pub fn rate_limit_info(headers: &HeaderMap) -> Map<String, Value> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(RATELIMIT_PREFIX)?;
            let raw = value.to_str().ok()?;
            Some((key.to_string(), header_value(raw)))
        })
        .collect()
}

/// RFC 3339 reset header as epoch millis.
fn reset_from_header(headers: &HeaderMap, name: &str) -> Option<i64> {
    header_str(headers, name)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.timestamp_millis())
}

/// Classify a probe response.
pub fn classify_probe(status: StatusCode, headers: &HeaderMap, now: i64) -> std::result::Result<ProbeReport, ProbeError> {
    let info = rate_limit_info(headers);
    let requests_reset = reset_from_header(headers, "anthropic-ratelimit-requests-reset");

    if status == StatusCode::TOO_MANY_REQUESTS {
        let reset = retry_after(headers)
            .map(|d| now + d.as_millis() as i64)
            .or(requests_reset);
        return Ok(ProbeReport {
            available: false,
            rate_limit_info: info,
            reset_time: reset,
        });
    }

    if !status.is_success() {
        return Err(ProbeError::Http {
            status: status.as_u16(),
            message: status.canonical_reason().unwrap_or("request failed").to_string(),
        });
    }

    let exhausted = info.get("requests-remaining").and_then(Value::as_u64) == Some(0);
    Ok(ProbeReport {
        available: !exhausted,
        rate_limit_info: info,
        reset_time: requests_reset,
    })
}

/// Pull the text blocks out of a messages response.
fn completion_result(body: Value) -> Value {
    let text = body["content"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block["type"] == "text")
                .filter_map(|block| block["text"].as_str())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    json!({
        "text": text,
        "model": body["model"],
        "stop_reason": body["stop_reason"],
        "usage": body["usage"],
    })
}

#[async_trait]
impl ServiceProvider for AnthropicProvider {
    fn id(&self) -> &str {
        "anthropic"
    }

    fn display_name(&self) -> &str {
        "Claude API"
    }

    async fn probe(&self) -> std::result::Result<ProbeReport, ProbeError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProbeError::NotConfigured(format!("{} not set", self.config.api_key_env)))?;

        let body = self.build_request("ping", Some(&self.config.probe_model), Some(1));
        let response = self.send(api_key, &body).await?;
        classify_probe(response.status(), response.headers(), now_ms())
    }
}

#[async_trait]
impl TaskHandler for AnthropicProvider {
    async fn execute(&self, task: &Task) -> std::result::Result<Value, TaskError> {
        let TaskPayload::LlmCompletion {
            prompt,
            model,
            max_tokens,
        } = &task.payload
        else {
            return Err(TaskError::Fatal(format!("Anthropic cannot run {} tasks", task.kind())));
        };

        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| TaskError::Fatal(format!("{} not set", self.config.api_key_env)))?;

        let body = self.build_request(prompt, model.as_deref(), *max_tokens);
        let response = self.send(api_key, &body).await.map_err(network_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &headers, &text, now_ms()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| TaskError::Transient(format!("Failed to parse response: {}", e)))?;
        Ok(completion_result(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewTask;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_rate_limit_info_strips_prefix() {
        let map = headers(&[
            ("anthropic-ratelimit-requests-limit", "50"),
            ("anthropic-ratelimit-tokens-remaining", "39000"),
            ("content-type", "application/json"),
        ]);
        let info = rate_limit_info(&map);
        assert_eq!(info.len(), 2);
        assert_eq!(info["requests-limit"], 50);
        assert_eq!(info["tokens-remaining"], 39000);
    }

    #[test]
    fn test_probe_success_is_available() {
        let map = headers(&[("anthropic-ratelimit-requests-remaining", "49")]);
        let report = classify_probe(StatusCode::OK, &map, 0).unwrap();
        assert!(report.available);
        assert_eq!(report.rate_limit_info["requests-remaining"], 49);
    }

    #[test]
    fn test_probe_zero_remaining_is_limited() {
        let map = headers(&[
            ("anthropic-ratelimit-requests-remaining", "0"),
            ("anthropic-ratelimit-requests-reset", "2026-01-01T00:00:30Z"),
        ]);
        let report = classify_probe(StatusCode::OK, &map, 0).unwrap();
        assert!(!report.available);
        assert_eq!(report.reset_time, Some(1_767_225_630_000));
    }

    #[test]
    fn test_probe_429_uses_retry_after() {
        let map = headers(&[("retry-after", "20")]);
        let report = classify_probe(StatusCode::TOO_MANY_REQUESTS, &map, 5_000).unwrap();
        assert!(!report.available);
        assert_eq!(report.reset_time, Some(25_000));
    }

    #[test]
    fn test_probe_server_error_is_probe_error() {
        let result = classify_probe(StatusCode::INTERNAL_SERVER_ERROR, &HeaderMap::new(), 0);
        assert!(matches!(result, Err(ProbeError::Http { status: 500, .. })));
    }

    #[test]
    fn test_completion_result_joins_text() {
        let body = json!({
            "model": "claude",
            "stop_reason": "end_turn",
            "content": [
                {"type": "text", "text": "hello"},
                {"type": "tool_use", "id": "t"},
                {"type": "text", "text": "world"}
            ],
            "usage": {"input_tokens": 3, "output_tokens": 2}
        });
        let result = completion_result(body);
        assert_eq!(result["text"], "hello\nworld");
        assert_eq!(result["usage"]["output_tokens"], 2);
    }

    #[tokio::test]
    async fn test_missing_key() {
        let provider = AnthropicProvider::with_api_key(None, AnthropicServiceConfig::default()).unwrap();
        assert!(matches!(provider.probe().await, Err(ProbeError::NotConfigured(_))));

        let task = Task::new(NewTask::new(
            "anthropic",
            TaskPayload::LlmCompletion {
                prompt: "hi".to_string(),
                model: None,
                max_tokens: None,
            },
        ));
        assert!(matches!(provider.execute(&task).await, Err(TaskError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_wrong_payload_is_fatal() {
        let provider =
            AnthropicProvider::with_api_key(Some("key".to_string()), AnthropicServiceConfig::default()).unwrap();
        let task = Task::new(NewTask::new(
            "anthropic",
            TaskPayload::Realtime {
                path: "x".to_string(),
                method: "GET".to_string(),
                data: None,
            },
        ));
        assert!(matches!(provider.execute(&task).await, Err(TaskError::Fatal(_))));
    }
}
