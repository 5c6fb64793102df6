//! Task records: the unit of work the scheduler queues and executes.
//!
//! A task targets exactly one service and carries a tagged payload. The
//! payload variant decides which registered handler runs it; the scheduler
//! itself never looks inside.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{generate_task_id, idempotency_key, now_ms};

/// Task priority. Ordering is `Low < Normal < High < Critical`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// All priorities, highest first.
    pub const ALL: [Priority; 4] = [Priority::Critical, Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// Task status state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in the live queue
    Pending,
    /// Handler currently executing (at most one task system-wide)
    Running,
    /// Waiting out a backoff delay before re-entering the queue
    Retrying,
    /// Handler succeeded
    Completed,
    /// Exhausted retries or hit a fatal error
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Terminal states migrate the task into history.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "retrying" => Ok(TaskStatus::Retrying),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}

/// Work description, one variant per task type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Single-turn completion against the LLM API
    LlmCompletion {
        prompt: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        max_tokens: Option<u32>,
    },
    /// REST call against the source-control API
    SourceControl {
        endpoint: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        body: Option<Value>,
    },
    /// Read or write against the realtime backend
    Realtime {
        path: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        data: Option<Value>,
    },
    /// Application-defined work with an externally registered handler
    Custom {
        name: String,
        #[serde(default)]
        data: Value,
    },
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::LlmCompletion { .. } => TaskKind::LlmCompletion,
            TaskPayload::SourceControl { .. } => TaskKind::SourceControl,
            TaskPayload::Realtime { .. } => TaskKind::Realtime,
            TaskPayload::Custom { name, .. } => TaskKind::Custom(name.clone()),
        }
    }
}

/// Handler lookup key derived from the payload variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKind {
    LlmCompletion,
    SourceControl,
    Realtime,
    Custom(String),
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::LlmCompletion => write!(f, "llm_completion"),
            TaskKind::SourceControl => write!(f, "source_control"),
            TaskKind::Realtime => write!(f, "realtime"),
            TaskKind::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

/// A request to enqueue work. Turned into a [`Task`] by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTask {
    pub service_id: String,
    #[serde(default)]
    pub priority: Priority,
    pub payload: TaskPayload,
    #[serde(default = "empty_object")]
    pub context: Value,
    /// Requests sharing a key coalesce onto one live task. Unkeyed requests never do.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl NewTask {
    pub fn new(service_id: impl Into<String>, payload: TaskPayload) -> Self {
        Self {
            service_id: service_id.into(),
            priority: Priority::Normal,
            payload,
            context: empty_object(),
            idempotency_key: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Key the request by a hash of its service and payload.
    pub fn keyed_by_payload(self) -> Self {
        let payload_json = serde_json::to_string(&self.payload).unwrap_or_default();
        let key = idempotency_key(&self.service_id, &payload_json);
        self.with_idempotency_key(key)
    }
}

/// A queued, running, or archived unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub service_id: String,
    pub priority: Priority,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    /// Non-rate-limit failures so far
    pub retry_count: u32,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
    pub last_attempt_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub error: Option<String>,
    pub result: Option<Value>,
    /// Free-form metadata carried through retries and reclaims
    pub context: Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl Task {
    /// Create a pending task from a request, stamped with the given time.
    pub fn from_request(request: NewTask, now: i64) -> Self {
        let context = if request.context.is_object() {
            request.context
        } else {
            serde_json::json!({ "value": request.context })
        };

        Self {
            id: generate_task_id(),
            service_id: request.service_id,
            priority: request.priority,
            payload: request.payload,
            status: TaskStatus::Pending,
            retry_count: 0,
            created_at: now,
            last_attempt_at: None,
            completed_at: None,
            failed_at: None,
            error: None,
            result: None,
            context,
            idempotency_key: request.idempotency_key,
        }
    }

    /// Convenience constructor stamped with the wall clock.
    pub fn new(request: NewTask) -> Self {
        Self::from_request(request, now_ms())
    }

    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }

    /// Pending, retrying, or running.
    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Shallow-merge `extra` (an object) into the task context.
    pub fn merge_context(&mut self, extra: &Value) {
        let Some(extra) = extra.as_object() else {
            return;
        };
        if !self.context.is_object() {
            self.context = empty_object();
        }
        if let Some(context) = self.context.as_object_mut() {
            for (key, value) in extra {
                context.insert(key.clone(), value.clone());
            }
        }
    }
}
