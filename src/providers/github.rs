//! GitHub REST API.
//!
//! Probes read `GET /rate_limit`, which does not count against the quota.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};

use super::TaskHandler;
use super::http::{api_key_from_env, build_client, classify_failure, header_str, network_error, parse_body, parse_method};
use crate::config::GithubServiceConfig;
use crate::domain::{Task, TaskPayload};
use crate::error::{Result, TaskError};
use crate::id::now_ms;
use crate::registry::{ProbeError, ProbeReport, ServiceProvider};

const ACCEPT: &str = "application/vnd.github+json";
const API_VERSION: &str = "2022-11-28";

pub struct GithubProvider {
    client: Client,
    token: Option<String>,
    config: GithubServiceConfig,
}

impl std::fmt::Debug for GithubProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubProvider")
            .field("base_url", &self.config.base_url)
            .field("min_remaining", &self.config.min_remaining)
            .field("configured", &self.token.is_some())
            .finish()
    }
}

impl GithubProvider {
    pub fn from_config(config: &GithubServiceConfig) -> Result<Self> {
        Self::with_token(api_key_from_env(&config.api_key_env), config.clone())
    }

    pub fn with_token(token: Option<String>, config: GithubServiceConfig) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            token,
            config,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    fn request(&self, method: reqwest::Method, url: String, token: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(token)
            .header("accept", ACCEPT)
            .header("x-github-api-version", API_VERSION)
    }
}

/// Classify a `/rate_limit` response body.
///
/// Available while `core.remaining` is above `min_remaining`.
pub fn classify_probe(status: StatusCode, body: &Value, min_remaining: u64) -> std::result::Result<ProbeReport, ProbeError> {
    if !status.is_success() {
        return Err(ProbeError::Http {
            status: status.as_u16(),
            message: body["message"].as_str().unwrap_or("request failed").to_string(),
        });
    }

    let core = match &body["resources"]["core"] {
        Value::Null => &body["rate"],
        core => core,
    };
    let remaining = core["remaining"]
        .as_u64()
        .ok_or_else(|| ProbeError::InvalidResponse("missing core.remaining".to_string()))?;
    let reset_time = core["reset"].as_i64().map(|secs| secs * 1000);

    let mut report = ProbeReport {
        available: remaining > min_remaining,
        reset_time,
        ..Default::default()
    };
    for key in ["limit", "remaining", "reset", "used"] {
        if !core[key].is_null() {
            report.rate_limit_info.insert(key.to_string(), core[key].clone());
        }
    }
    Ok(report)
}

/// Classify a failed API call. GitHub signals primary rate limits with a
/// 403 or 429 carrying `x-ratelimit-remaining: 0`.
pub fn classify_response(status: StatusCode, headers: &HeaderMap, body: &str, now: i64) -> TaskError {
    let exhausted = header_str(headers, "x-ratelimit-remaining") == Some("0");
    if exhausted && (status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS) {
        let reset_time = header_str(headers, "x-ratelimit-reset")
            .and_then(|s| s.parse::<i64>().ok())
            .map(|secs| secs * 1000);
        return TaskError::RateLimited {
            reset_time,
            message: format!("HTTP {}: rate limit exhausted", status.as_u16()),
        };
    }
    classify_failure(status, headers, body, now)
}

#[async_trait]
impl ServiceProvider for GithubProvider {
    fn id(&self) -> &str {
        "github"
    }

    fn display_name(&self) -> &str {
        "GitHub API"
    }

    async fn probe(&self) -> std::result::Result<ProbeReport, ProbeError> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| ProbeError::NotConfigured(format!("{} not set", self.config.api_key_env)))?;

        let response = self
            .request(reqwest::Method::GET, self.url("rate_limit"), token)
            .send()
            .await?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ProbeError::InvalidResponse(e.to_string()))?;
        classify_probe(status, &body, self.config.min_remaining)
    }
}

#[async_trait]
impl TaskHandler for GithubProvider {
    async fn execute(&self, task: &Task) -> std::result::Result<Value, TaskError> {
        let TaskPayload::SourceControl { endpoint, method, body } = &task.payload else {
            return Err(TaskError::Fatal(format!("GitHub cannot run {} tasks", task.kind())));
        };

        let token = self
            .token
            .as_deref()
            .ok_or_else(|| TaskError::Fatal(format!("{} not set", self.config.api_key_env)))?;

        let mut request = self.request(parse_method(method)?, self.url(endpoint), token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(network_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await.map_err(network_error)?;

        if !status.is_success() {
            return Err(classify_response(status, &headers, &text, now_ms()));
        }

        Ok(json!({
            "status": status.as_u16(),
            "body": parse_body(&text),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn rate_limit_body(remaining: u64) -> Value {
        json!({
            "resources": {
                "core": {"limit": 5000, "remaining": remaining, "reset": 1_700_000_000, "used": 5000 - remaining}
            },
            "rate": {"limit": 5000, "remaining": remaining, "reset": 1_700_000_000}
        })
    }

    #[test]
    fn test_probe_above_threshold_is_available() {
        let report = classify_probe(StatusCode::OK, &rate_limit_body(4_000), 100).unwrap();
        assert!(report.available);
        assert_eq!(report.reset_time, Some(1_700_000_000_000));
        assert_eq!(report.rate_limit_info["remaining"], 4_000);
        assert_eq!(report.rate_limit_info["used"], 1_000);
    }

    #[test]
    fn test_probe_at_threshold_is_limited() {
        let report = classify_probe(StatusCode::OK, &rate_limit_body(100), 100).unwrap();
        assert!(!report.available);
        let report = classify_probe(StatusCode::OK, &rate_limit_body(101), 100).unwrap();
        assert!(report.available);
    }

    #[test]
    fn test_probe_falls_back_to_rate() {
        let body = json!({"rate": {"limit": 60, "remaining": 0, "reset": 10}});
        let report = classify_probe(StatusCode::OK, &body, 0).unwrap();
        assert!(!report.available);
        assert_eq!(report.reset_time, Some(10_000));
    }

    #[test]
    fn test_probe_errors() {
        let unauthorized = classify_probe(StatusCode::UNAUTHORIZED, &json!({"message": "Bad credentials"}), 100);
        assert_eq!(
            unauthorized,
            Err(ProbeError::Http {
                status: 401,
                message: "Bad credentials".to_string()
            })
        );
        let malformed = classify_probe(StatusCode::OK, &json!({}), 100);
        assert!(matches!(malformed, Err(ProbeError::InvalidResponse(_))));
    }

    #[test]
    fn test_forbidden_with_exhausted_quota_is_rate_limit() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1700000000"));
        let err = classify_response(StatusCode::FORBIDDEN, &headers, "", 0);
        assert!(matches!(
            err,
            TaskError::RateLimited {
                reset_time: Some(1_700_000_000_000),
                ..
            }
        ));
    }

    #[test]
    fn test_plain_forbidden_is_fatal() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("42"));
        let err = classify_response(StatusCode::FORBIDDEN, &headers, "no access", 0);
        assert!(matches!(err, TaskError::Fatal(_)));
        let err = classify_response(StatusCode::SERVICE_UNAVAILABLE, &headers, "", 0);
        assert!(matches!(err, TaskError::Transient(_)));
    }

    #[test]
    fn test_url_joining() {
        let provider = GithubProvider::with_token(None, GithubServiceConfig::default()).unwrap();
        assert_eq!(provider.url("/repos/o/r"), "https://api.github.com/repos/o/r");
        assert_eq!(provider.url("rate_limit"), "https://api.github.com/rate_limit");
    }
}
