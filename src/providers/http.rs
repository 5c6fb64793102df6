//! HTTP helpers shared by the concrete providers.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;

use crate::error::{ResumrError, Result, TaskError};

/// Upper bound for any single request; the scheduler applies tighter limits.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(300);

/// Longest error body echoed into a task error.
const MAX_ERROR_BODY: usize = 512;

pub(crate) const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

pub(crate) fn build_client() -> Result<Client> {
    Client::builder()
        .timeout(CLIENT_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| ResumrError::Config(format!("Failed to create HTTP client: {}", e)))
}

/// Read an API key from the environment, treating empty as unset.
pub(crate) fn api_key_from_env(env_var: &str) -> Option<String> {
    std::env::var(env_var).ok().filter(|key| !key.trim().is_empty())
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

/// `retry-after` in whole seconds.
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_str(headers, "retry-after")
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Classify a non-success response for task execution.
///
/// 429 is a rate limit, 408 and 5xx are transient, any other 4xx is fatal.
pub(crate) fn classify_failure(status: StatusCode, headers: &HeaderMap, body: &str, now: i64) -> TaskError {
    let message = format!("HTTP {}: {}", status.as_u16(), truncate(body));
    if status == StatusCode::TOO_MANY_REQUESTS {
        TaskError::rate_limited_for(retry_after(headers), now, message)
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        TaskError::Transient(message)
    } else {
        TaskError::Fatal(message)
    }
}

pub(crate) fn network_error(err: reqwest::Error) -> TaskError {
    TaskError::Transient(format!("Request failed: {}", err))
}

/// Body as JSON when it parses, as a string otherwise, null when empty.
pub(crate) fn parse_body(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

pub(crate) fn parse_method(method: &str) -> std::result::Result<Method, TaskError> {
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| TaskError::Fatal(format!("Invalid HTTP method: {}", method)))
}

/// Parse a header value as a JSON number when possible.
pub(crate) fn header_value(raw: &str) -> Value {
    raw.parse::<u64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_classify_429_with_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("30"));
        let err = classify_failure(StatusCode::TOO_MANY_REQUESTS, &headers, "slow down", 1_000);
        assert_eq!(
            err,
            TaskError::RateLimited {
                reset_time: Some(31_000),
                message: "HTTP 429: slow down".to_string()
            }
        );
    }

    #[test]
    fn test_classify_server_and_client_errors() {
        let headers = HeaderMap::new();
        assert!(matches!(
            classify_failure(StatusCode::BAD_GATEWAY, &headers, "", 0),
            TaskError::Transient(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::REQUEST_TIMEOUT, &headers, "", 0),
            TaskError::Transient(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, &headers, "bad", 0),
            TaskError::Fatal(_)
        ));
    }

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body(""), Value::Null);
        assert_eq!(parse_body("{\"a\":1}")["a"], 1);
        assert_eq!(parse_body("plain"), Value::String("plain".to_string()));
    }

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method("patch").unwrap(), Method::PATCH);
        assert!(parse_method("NOT A METHOD").is_err());
    }

    #[test]
    fn test_truncate_long_body() {
        let body = "x".repeat(2_000);
        let err = classify_failure(StatusCode::BAD_REQUEST, &HeaderMap::new(), &body, 0);
        assert!(err.to_string().len() < 600);
    }
}
