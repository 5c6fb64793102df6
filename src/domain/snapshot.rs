//! Persisted state: restart snapshots and the task history archive.

use serde::{Deserialize, Serialize};

use crate::domain::service::Service;
use crate::domain::task::{Task, TaskStatus};

/// A task parked until its backoff delay has elapsed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeferredRetry {
    /// Epoch millis at which the task re-enters the queue
    pub due_at: i64,
    pub task: Task,
}

/// Point-in-time copy of scheduler state, written after every mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedSnapshot {
    pub queue: Vec<Task>,
    pub current_task: Option<Task>,
    pub services: Vec<Service>,
    #[serde(default)]
    pub retrying: Vec<DeferredRetry>,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

impl PersistedSnapshot {
    pub fn empty(timestamp: i64) -> Self {
        Self {
            queue: Vec::new(),
            current_task: None,
            services: Vec::new(),
            retrying: Vec::new(),
            timestamp,
        }
    }

    pub fn age_ms(&self, now: i64) -> i64 {
        now - self.timestamp
    }

    /// Count of tasks that still need to run.
    pub fn live_task_count(&self) -> usize {
        self.queue.len() + self.retrying.len() + usize::from(self.current_task.is_some())
    }
}

/// A terminal task moved out of the live queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub task: Task,
    pub archived_at: i64,
}

impl HistoryRecord {
    pub fn new(task: Task, archived_at: i64) -> Self {
        Self { task, archived_at }
    }

    pub fn status(&self) -> TaskStatus {
        self.task.status
    }
}

/// Query options for history lookups.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryQuery {
    pub status: Option<TaskStatus>,
    pub service_id: Option<String>,
    /// Only records archived at or after this epoch-ms time
    pub since: Option<i64>,
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_service(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }

    pub fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
