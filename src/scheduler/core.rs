//! Synchronous scheduler state machine.
//!
//! `SchedulerCore` owns the queue, the current task, the service registry
//! and the retry schedule. It performs no I/O and takes the current time as
//! an argument; the actor in `manager` drives it and carries out the
//! effects it reports.

use std::time::Duration;

use log::warn;
use serde_json::Value;

use crate::domain::{NewTask, PersistedSnapshot, Priority, Service, Task, TaskStatus};
use crate::error::{ResumrError, Result, TaskError};
use crate::registry::{ProbeOutcome, ServiceRegistry, StatusChange};
use crate::scheduler::delay::RetrySchedule;
use crate::scheduler::queue::TaskQueue;
use crate::scheduler::retry::{RetryDecision, RetryPolicy};

#[derive(Debug, Clone)]
struct RunningTask {
    task: Task,
    dispatch_seq: u64,
}

/// Result of an enqueue request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    /// A new task was queued
    New(String),
    /// A live task with the same explicit idempotency key already exists
    Attached(String),
}

impl Enqueued {
    pub fn task_id(&self) -> &str {
        match self {
            Enqueued::New(id) | Enqueued::Attached(id) => id,
        }
    }
}

/// A task handed out for execution.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub task: Task,
    pub dispatch_seq: u64,
}

/// What a finished dispatch turned into.
#[derive(Debug, Clone)]
pub enum Completion {
    Completed(Task),
    Failed { task: Task, error: TaskError },
    Retrying { task_id: String, retry_count: u32, delay: Duration },
    RateLimited { task_id: String, service_id: String, change: Option<StatusChange> },
}

/// A task removed by `cancel`.
#[derive(Debug, Clone)]
pub struct Cancelled {
    pub task: Task,
    pub was_running: bool,
}

/// Outcome of an explicit exhaustion signal.
#[derive(Debug, Clone)]
pub struct Exhaustion {
    /// The running task that was put back, if it belonged to the service
    pub reclaimed: Option<String>,
    pub change: Option<StatusChange>,
    pub reset_time: Option<i64>,
}

/// Everything removed by `clear`.
#[derive(Debug, Clone, Default)]
pub struct Cleared {
    pub tasks: Vec<Task>,
    pub was_running: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub queued: usize,
    pub retrying: usize,
    pub dropped: usize,
}

#[derive(Debug)]
pub struct SchedulerCore {
    queue: TaskQueue,
    current: Option<RunningTask>,
    registry: ServiceRegistry,
    retries: RetrySchedule,
    policy: RetryPolicy,
    next_seq: u64,
}

impl SchedulerCore {
    pub fn new(registry: ServiceRegistry, policy: RetryPolicy) -> Self {
        Self {
            queue: TaskQueue::new(),
            current: None,
            registry,
            retries: RetrySchedule::new(),
            policy,
            next_seq: 0,
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.current.as_ref().map(|running| &running.task)
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn retries(&self) -> &RetrySchedule {
        &self.retries
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn service(&self, service_id: &str) -> Option<&Service> {
        self.registry.get(service_id)
    }

    /// Live task with this idempotency key, wherever it is.
    fn find_live_by_key(&self, key: &str) -> Option<&Task> {
        self.current_task()
            .filter(|task| task.idempotency_key.as_deref() == Some(key))
            .or_else(|| self.queue.find_by_key(key))
            .or_else(|| self.retries.find_by_key(key))
    }

    pub fn enqueue(&mut self, request: NewTask, now: i64) -> Result<Enqueued> {
        if !self.registry.contains(&request.service_id) {
            return Err(ResumrError::UnknownService(request.service_id));
        }

        let task = Task::from_request(request, now);
        if let Some(key) = task.idempotency_key.as_deref() {
            if let Some(existing) = self.find_live_by_key(key).map(|live| live.id.clone()) {
                self.raise_priority(&existing, task.priority);
                return Ok(Enqueued::Attached(existing));
            }
        }

        let id = task.id.clone();
        self.queue.push_back(task);
        Ok(Enqueued::New(id))
    }

    /// Lift a live task to at least `priority`. A queued task moves to the
    /// tail of its new bucket.
    fn raise_priority(&mut self, task_id: &str, priority: Priority) {
        if let Some(running) = self.current.as_mut().filter(|running| running.task.id == task_id) {
            running.task.priority = running.task.priority.max(priority);
            return;
        }
        if self.queue.get(task_id).is_some_and(|task| task.priority < priority) {
            if let Some(mut task) = self.queue.remove(task_id) {
                task.priority = priority;
                self.queue.push_back(task);
            }
            return;
        }
        self.retries.raise_priority(task_id, priority);
    }

    /// Remove a pending, retrying, or running task.
    pub fn cancel(&mut self, task_id: &str) -> Option<Cancelled> {
        if let Some(task) = self.queue.remove(task_id) {
            return Some(Cancelled { task, was_running: false });
        }
        if let Some(task) = self.retries.cancel(task_id) {
            return Some(Cancelled { task, was_running: false });
        }
        if self.current_task().is_some_and(|task| task.id == task_id) {
            let running = self.current.take()?;
            return Some(Cancelled {
                task: running.task,
                was_running: true,
            });
        }
        None
    }

    /// Drop every pending, retrying, and running task.
    pub fn clear(&mut self) -> Cleared {
        let mut tasks: Vec<Task> = self.queue.drain().collect();
        tasks.extend(self.retries.drain());
        let running = self.current.take();
        let was_running = running.is_some();
        tasks.extend(running.map(|running| running.task));
        Cleared { tasks, was_running }
    }

    /// Start the next runnable task, unless one is already running.
    pub fn next_dispatch(&mut self, now: i64) -> Option<Dispatch> {
        if self.current.is_some() {
            return None;
        }

        let registry = &self.registry;
        let task_id = self
            .queue
            .peek_runnable(|service_id| registry.is_available(service_id))?
            .id
            .clone();
        let mut task = self.queue.remove(&task_id)?;

        task.status = TaskStatus::Running;
        task.last_attempt_at = Some(now);
        self.next_seq += 1;

        self.current = Some(RunningTask {
            task: task.clone(),
            dispatch_seq: self.next_seq,
        });
        Some(Dispatch {
            task,
            dispatch_seq: self.next_seq,
        })
    }

    /// Apply the outcome of dispatch `dispatch_seq`.
    ///
    /// Returns `None` when that dispatch is no longer current (it was
    /// cancelled, reclaimed, or superseded).
    pub fn complete(
        &mut self,
        dispatch_seq: u64,
        outcome: std::result::Result<Value, TaskError>,
        now: i64,
    ) -> Option<Completion> {
        if self.current.as_ref().map(|running| running.dispatch_seq) != Some(dispatch_seq) {
            return None;
        }
        let mut task = self.current.take()?.task;

        let error = match outcome {
            Ok(result) => {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(now);
                task.result = Some(result);
                task.error = None;
                return Some(Completion::Completed(task));
            }
            Err(error) => error,
        };

        match self.policy.decide(task.retry_count, &error) {
            RetryDecision::Reclaim { reset_time } => {
                let change = self.registry.mark_limited(&task.service_id, reset_time, now);
                task.status = TaskStatus::Pending;
                task.error = Some(error.to_string());
                let (task_id, service_id) = (task.id.clone(), task.service_id.clone());
                self.queue.push_front(task);
                Some(Completion::RateLimited {
                    task_id,
                    service_id,
                    change,
                })
            }
            RetryDecision::Retry { retry_count, delay } => {
                task.retry_count = retry_count;
                task.error = Some(error.to_string());
                let task_id = task.id.clone();
                self.retries.schedule(task, now + delay.as_millis() as i64);
                Some(Completion::Retrying {
                    task_id,
                    retry_count,
                    delay,
                })
            }
            RetryDecision::Fail { retry_count, reason } => {
                task.retry_count = retry_count;
                task.status = TaskStatus::Failed;
                task.failed_at = Some(now);
                task.error = Some(reason);
                Some(Completion::Failed { task, error })
            }
        }
    }

    /// Handle an external exhaustion signal for `service_id`.
    ///
    /// A `reset_time` (epoch millis) in `context` is used as the reset hint.
    pub fn exhaust(&mut self, service_id: &str, context: &Value, now: i64) -> Result<Exhaustion> {
        if !self.registry.contains(service_id) {
            return Err(ResumrError::UnknownService(service_id.to_string()));
        }

        let reclaimed = match self.current.take() {
            Some(running) if running.task.service_id == service_id => {
                let mut task = running.task;
                task.merge_context(context);
                task.status = TaskStatus::Pending;
                let id = task.id.clone();
                self.queue.push_front(task);
                Some(id)
            }
            other => {
                self.current = other;
                None
            }
        };

        let hint = context.get("reset_time").and_then(Value::as_i64);
        let change = self.registry.mark_limited(service_id, hint, now);
        let reset_time = self.registry.get(service_id).and_then(|service| service.reset_time);

        Ok(Exhaustion {
            reclaimed,
            change,
            reset_time,
        })
    }

    /// Move retries whose delay has elapsed back to the tail of their bucket.
    pub fn release_due_retries(&mut self, now: i64) -> usize {
        let due = self.retries.pop_due(now);
        let released = due.len();
        for mut task in due {
            task.status = TaskStatus::Pending;
            self.queue.push_back(task);
        }
        released
    }

    pub fn apply_probe(&mut self, outcome: &ProbeOutcome) -> Option<StatusChange> {
        self.registry.apply_probe(outcome)
    }

    /// Next instant (epoch millis) at which a timer-driven trigger is due.
    pub fn next_wakeup(&self, now: i64) -> Option<i64> {
        let reset = self.registry.next_reset(now);
        match (self.retries.next_due(), reset) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Put the running task back at the head of its bucket.
    pub fn requeue_current(&mut self) -> Option<String> {
        let mut task = self.current.take()?.task;
        task.status = TaskStatus::Pending;
        let id = task.id.clone();
        self.queue.push_front(task);
        Some(id)
    }

    /// Tasks still waiting to run, across the queue and the retry schedule.
    pub fn live_task_ids(&self) -> Vec<String> {
        self.current_task()
            .into_iter()
            .chain(self.queue.iter())
            .chain(self.retries.entries().iter().map(|entry| &entry.task))
            .map(|task| task.id.clone())
            .collect()
    }

    pub fn snapshot(&self, now: i64) -> PersistedSnapshot {
        PersistedSnapshot {
            queue: self.queue.as_slice().to_vec(),
            current_task: self.current_task().cloned(),
            services: self.registry.snapshot(),
            retrying: self.retries.entries().to_vec(),
            timestamp: now,
        }
    }

    /// Load a persisted snapshot into an empty core.
    ///
    /// The interrupted task goes back to the head of its bucket without
    /// touching its retry count. Tasks for unregistered services are dropped.
    pub fn restore(&mut self, snapshot: PersistedSnapshot, now: i64) -> RestoreReport {
        let mut report = RestoreReport::default();
        self.registry.restore(&snapshot.services, now);

        for mut task in snapshot.queue {
            if !self.registry.contains(&task.service_id) {
                warn!("Dropping restored task {} for unknown service {}", task.id, task.service_id);
                report.dropped += 1;
                continue;
            }
            task.status = TaskStatus::Pending;
            self.queue.push_back(task);
            report.queued += 1;
        }

        if let Some(mut task) = snapshot.current_task {
            if self.registry.contains(&task.service_id) {
                task.status = TaskStatus::Pending;
                self.queue.push_front(task);
                report.queued += 1;
            } else {
                warn!("Dropping interrupted task {} for unknown service {}", task.id, task.service_id);
                report.dropped += 1;
            }
        }

        let (known, unknown): (Vec<_>, Vec<_>) = snapshot
            .retrying
            .into_iter()
            .partition(|entry| self.registry.contains(&entry.task.service_id));
        for entry in &unknown {
            warn!(
                "Dropping deferred retry {} for unknown service {}",
                entry.task.id, entry.task.service_id
            );
        }
        report.dropped += unknown.len();
        report.retrying = known.len();
        self.retries.restore(known);

        report
    }
}
