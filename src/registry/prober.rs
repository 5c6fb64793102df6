//! Probing: asking each provider whether it has capacity right now.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::id::now_ms;

/// A throttled external dependency that can be probed for capacity.
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    /// Stable id tasks refer to (e.g. `anthropic`)
    fn id(&self) -> &str;

    fn display_name(&self) -> &str;

    /// Issue one cheap request and report the quota it reveals.
    async fn probe(&self) -> Result<ProbeReport, ProbeError>;
}

/// What a successful probe learned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReport {
    pub available: bool,
    pub rate_limit_info: Map<String, Value>,
    /// Epoch millis at which quota resets, when the provider says
    pub reset_time: Option<i64>,
}

impl ProbeReport {
    pub fn available() -> Self {
        Self {
            available: true,
            ..Default::default()
        }
    }

    pub fn limited(reset_time: Option<i64>) -> Self {
        Self {
            available: false,
            reset_time,
            ..Default::default()
        }
    }

    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.rate_limit_info.insert(key.into(), value.into());
        self
    }

    pub fn with_reset_time(mut self, reset_time: Option<i64>) -> Self {
        self.reset_time = reset_time;
        self
    }
}

/// A probe that could not produce a report.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProbeError {
    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ProbeError {
    fn from(err: reqwest::Error) -> Self {
        ProbeError::Network(err.to_string())
    }
}

/// Result of one probe, tagged with the service and when it ran.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub service_id: String,
    pub result: Result<ProbeReport, ProbeError>,
    /// Epoch millis when the request went out
    pub started_at: i64,
    /// Epoch millis when the answer came back
    pub checked_at: i64,
}

/// Holds the providers and runs their probes under a timeout.
#[derive(Clone)]
pub struct Prober {
    providers: BTreeMap<String, Arc<dyn ServiceProvider>>,
    timeout: Duration,
}

impl Prober {
    pub fn new(timeout: Duration) -> Self {
        Self {
            providers: BTreeMap::new(),
            timeout,
        }
    }

    pub fn register(&mut self, provider: Arc<dyn ServiceProvider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<dyn ServiceProvider>> {
        self.providers.values()
    }

    /// Probe one provider, mapping an elapsed timeout to [`ProbeError::Timeout`].
    pub async fn probe_one(provider: Arc<dyn ServiceProvider>, timeout: Duration) -> ProbeOutcome {
        let started_at = now_ms();
        let result = match tokio::time::timeout(timeout, provider.probe()).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(timeout)),
        };
        ProbeOutcome {
            service_id: provider.id().to_string(),
            result,
            started_at,
            checked_at: now_ms(),
        }
    }

    /// Probe every provider concurrently.
    pub async fn check_all(&self) -> Vec<ProbeOutcome> {
        let probes = self
            .providers
            .values()
            .map(|provider| Self::probe_one(Arc::clone(provider), self.timeout));
        join_all(probes).await
    }

    /// Probe one service in the background, handing the outcome to `on_done`.
    ///
    /// Returns false if no provider is registered under `service_id`.
    pub fn spawn_probe<F>(&self, service_id: &str, on_done: F) -> bool
    where
        F: FnOnce(ProbeOutcome) + Send + 'static,
    {
        let Some(provider) = self.providers.get(service_id) else {
            return false;
        };
        let provider = Arc::clone(provider);
        let timeout = self.timeout;
        tokio::spawn(async move {
            on_done(Self::probe_one(provider, timeout).await);
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockProvider;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_check_all_probes_every_provider() {
        let mut prober = Prober::new(Duration::from_secs(1));
        prober.register(Arc::new(MockProvider::new("a").with_probe(Ok(ProbeReport::available()))));
        prober.register(Arc::new(MockProvider::new("b").with_probe(Ok(ProbeReport::limited(Some(5))))));

        let outcomes = prober.check_all().await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].service_id, "a");
        assert_eq!(outcomes[0].result, Ok(ProbeReport::available()));
        assert_eq!(outcomes[1].result, Ok(ProbeReport::limited(Some(5))));
    }

    #[tokio::test]
    async fn test_slow_probe_times_out() {
        let provider = MockProvider::new("slow").with_delay(Duration::from_millis(200));
        let outcome = Prober::probe_one(Arc::new(provider), Duration::from_millis(20)).await;
        assert_eq!(outcome.result, Err(ProbeError::Timeout(Duration::from_millis(20))));
        assert!(outcome.checked_at >= outcome.started_at);
    }

    #[tokio::test]
    async fn test_spawn_probe_reports_back() {
        let mut prober = Prober::new(Duration::from_secs(1));
        prober.register(Arc::new(MockProvider::new("a")));

        let (tx, rx) = oneshot::channel();
        assert!(prober.spawn_probe("a", move |outcome| {
            let _ = tx.send(outcome);
        }));
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.service_id, "a");

        assert!(!prober.spawn_probe("missing", |_| {}));
    }
}
