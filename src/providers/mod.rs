//! Providers: probe and execution logic for each external service.
//!
//! Each concrete provider implements both [`ServiceProvider`] (capacity
//! probes) and [`TaskHandler`] (running tasks of its payload variant).
//! Response classification lives in pure functions so it can be tested
//! without a network.

pub mod anthropic;
pub mod github;
mod http;
pub mod mock;
pub mod realtime;

pub use anthropic::AnthropicProvider;
pub use github::GithubProvider;
pub use mock::MockProvider;
pub use realtime::RealtimeProvider;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ServicesConfig;
use crate::domain::{Task, TaskKind};
use crate::error::{Result, TaskError};
use crate::registry::ServiceProvider;

/// Executes tasks of one payload variant.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task once. Implementations must be safe to call again for
    /// the same task; `task.id` is stable across attempts.
    async fn execute(&self, task: &Task) -> std::result::Result<Value, TaskError>;
}

/// Handlers keyed by the payload variant they run.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: &TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &TaskKind) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// A provider wired up from configuration, ready to hand to the scheduler.
pub struct ConfiguredService {
    pub provider: Arc<dyn ServiceProvider>,
    pub kind: TaskKind,
    pub handler: Arc<dyn TaskHandler>,
}

/// Build the enabled providers from config.
pub fn from_config(config: &ServicesConfig) -> Result<Vec<ConfiguredService>> {
    let mut services = Vec::new();

    if config.anthropic.enabled {
        let provider = Arc::new(AnthropicProvider::from_config(&config.anthropic)?);
        services.push(ConfiguredService {
            provider: provider.clone(),
            kind: TaskKind::LlmCompletion,
            handler: provider,
        });
    }

    if config.github.enabled {
        let provider = Arc::new(GithubProvider::from_config(&config.github)?);
        services.push(ConfiguredService {
            provider: provider.clone(),
            kind: TaskKind::SourceControl,
            handler: provider,
        });
    }

    if config.realtime.enabled {
        let provider = Arc::new(RealtimeProvider::from_config(&config.realtime)?);
        services.push(ConfiguredService {
            provider: provider.clone(),
            kind: TaskKind::Realtime,
            handler: provider,
        });
    }

    Ok(services)
}
