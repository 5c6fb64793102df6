//! Realtime database over its REST interface (`{base_url}/{path}.json`).

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};

use super::TaskHandler;
use super::http::{
    api_key_from_env, build_client, classify_failure, network_error, parse_body, parse_method, retry_after,
};
use crate::config::RealtimeServiceConfig;
use crate::domain::{Task, TaskPayload};
use crate::error::{Result, TaskError};
use crate::id::now_ms;
use crate::registry::{ProbeError, ProbeReport, ServiceProvider};

pub struct RealtimeProvider {
    client: Client,
    auth: Option<String>,
    config: RealtimeServiceConfig,
}

impl std::fmt::Debug for RealtimeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeProvider")
            .field("base_url", &self.config.base_url)
            .field("authenticated", &self.auth.is_some())
            .finish()
    }
}

impl RealtimeProvider {
    /// The auth token is optional; an empty `base_url` means unconfigured.
    pub fn from_config(config: &RealtimeServiceConfig) -> Result<Self> {
        Self::with_auth(api_key_from_env(&config.api_key_env), config.clone())
    }

    pub fn with_auth(auth: Option<String>, config: RealtimeServiceConfig) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            auth,
            config,
        })
    }

    fn base_url(&self) -> Option<&str> {
        let base = self.config.base_url.trim_end_matches('/');
        (!base.is_empty()).then_some(base)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let request = self.client.request(method, url);
        match &self.auth {
            Some(auth) => request.query(&[("auth", auth)]),
            None => request,
        }
    }
}

/// Resource URL for a database path.
pub fn resource_url(base_url: &str, path: &str) -> String {
    let path = path.trim_matches('/');
    let path = path.strip_suffix(".json").unwrap_or(path);
    format!("{}/{}.json", base_url.trim_end_matches('/'), path)
}

/// Classify a health-check response.
pub fn classify_probe(status: StatusCode, retry_after_ms: Option<i64>, now: i64) -> std::result::Result<ProbeReport, ProbeError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Ok(ProbeReport::limited(retry_after_ms.map(|ms| now + ms)));
    }
    if status.is_success() {
        return Ok(ProbeReport::available());
    }
    Err(ProbeError::Http {
        status: status.as_u16(),
        message: status.canonical_reason().unwrap_or("request failed").to_string(),
    })
}

#[async_trait]
impl ServiceProvider for RealtimeProvider {
    fn id(&self) -> &str {
        "realtime"
    }

    fn display_name(&self) -> &str {
        "Realtime Database"
    }

    async fn probe(&self) -> std::result::Result<ProbeReport, ProbeError> {
        let base = self
            .base_url()
            .ok_or_else(|| ProbeError::NotConfigured("realtime base_url not set".to_string()))?;

        let url = format!("{}/{}", base, self.config.health_path.trim_start_matches('/'));
        let response = self
            .request(reqwest::Method::GET, url)
            .query(&[("shallow", "true")])
            .send()
            .await?;
        let retry_after_ms = retry_after(response.headers()).map(|d| d.as_millis() as i64);
        classify_probe(response.status(), retry_after_ms, now_ms())
    }
}

#[async_trait]
impl TaskHandler for RealtimeProvider {
    async fn execute(&self, task: &Task) -> std::result::Result<Value, TaskError> {
        let TaskPayload::Realtime { path, method, data } = &task.payload else {
            return Err(TaskError::Fatal(format!("Realtime backend cannot run {} tasks", task.kind())));
        };

        let base = self
            .base_url()
            .ok_or_else(|| TaskError::Fatal("realtime base_url not set".to_string()))?;

        let mut request = self.request(parse_method(method)?, resource_url(base, path));
        if let Some(data) = data {
            request = request.json(data);
        }

        let response = request.send().await.map_err(network_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await.map_err(network_error)?;

        if !status.is_success() {
            return Err(classify_failure(status, &headers, &text, now_ms()));
        }

        Ok(json!({
            "path": path,
            "data": parse_body(&text),
        }))
    }
}
