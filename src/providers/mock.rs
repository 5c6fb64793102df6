//! Scriptable provider for tests and dry runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::TaskHandler;
use crate::domain::Task;
use crate::error::TaskError;
use crate::registry::{ProbeError, ProbeReport, ServiceProvider};

/// Mock service that replays scripted probe results and task outcomes.
///
/// Probe results are consumed in order and the last one repeats; with no
/// script the service reports available. Task outcomes are consumed in
/// order; once exhausted every task succeeds.
pub struct MockProvider {
    id: String,
    display_name: String,
    probes: Mutex<VecDeque<Result<ProbeReport, ProbeError>>>,
    outcomes: Mutex<VecDeque<Result<Value, TaskError>>>,
    probe_delay: Option<Duration>,
    execute_delay: Option<Duration>,
    probe_calls: AtomicUsize,
    executed: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockProvider {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: format!("Mock {}", id),
            id,
            probes: Mutex::new(VecDeque::new()),
            outcomes: Mutex::new(VecDeque::new()),
            probe_delay: None,
            execute_delay: None,
            probe_calls: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_probe(self, result: Result<ProbeReport, ProbeError>) -> Self {
        self.push_probe(result);
        self
    }

    pub fn with_outcome(self, outcome: Result<Value, TaskError>) -> Self {
        self.push_outcome(outcome);
        self
    }

    /// Delay both probes and executions.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = Some(delay);
        self.execute_delay = Some(delay);
        self
    }

    pub fn with_execute_delay(mut self, delay: Duration) -> Self {
        self.execute_delay = Some(delay);
        self
    }

    pub fn push_probe(&self, result: Result<ProbeReport, ProbeError>) {
        lock(&self.probes).push_back(result);
    }

    /// Replace the probe script with a single repeating result.
    pub fn set_probe(&self, result: Result<ProbeReport, ProbeError>) {
        let mut probes = lock(&self.probes);
        probes.clear();
        probes.push_back(result);
    }

    pub fn push_outcome(&self, outcome: Result<Value, TaskError>) {
        lock(&self.outcomes).push_back(outcome);
    }

    pub fn probe_count(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    /// Ids of tasks whose execution started, in order.
    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }

    fn next_probe(&self) -> Result<ProbeReport, ProbeError> {
        let mut probes = lock(&self.probes);
        if probes.len() > 1 {
            probes.pop_front().unwrap_or_else(|| Ok(ProbeReport::available()))
        } else {
            probes.front().cloned().unwrap_or_else(|| Ok(ProbeReport::available()))
        }
    }
}

#[async_trait]
impl ServiceProvider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn probe(&self) -> Result<ProbeReport, ProbeError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.probe_delay {
            tokio::time::sleep(delay).await;
        }
        self.next_probe()
    }
}

#[async_trait]
impl TaskHandler for MockProvider {
    async fn execute(&self, task: &Task) -> Result<Value, TaskError> {
        lock(&self.executed).push(task.id.clone());
        if let Some(delay) = self.execute_delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.outcomes)
            .pop_front()
            .unwrap_or_else(|| Ok(json!({ "task_id": task.id })))
    }
}
