//! Retry schedule: tasks parked until their backoff delay elapses.
//!
//! Entries are plain data ([`DeferredRetry`]) so they can be listed,
//! cancelled, persisted in a snapshot, and restored after a restart.

use crate::domain::{DeferredRetry, Priority, Task, TaskStatus};

#[derive(Debug, Clone, Default)]
pub struct RetrySchedule {
    /// Sorted by `due_at`, ties in insertion order
    entries: Vec<DeferredRetry>,
}

impl RetrySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `task` until `due_at` (epoch millis).
    pub fn schedule(&mut self, mut task: Task, due_at: i64) {
        task.status = TaskStatus::Retrying;
        let index = self
            .entries
            .iter()
            .position(|entry| entry.due_at > due_at)
            .unwrap_or(self.entries.len());
        self.entries.insert(index, DeferredRetry { due_at, task });
    }

    /// Remove and return every task due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: i64) -> Vec<Task> {
        let split = self
            .entries
            .iter()
            .position(|entry| entry.due_at > now)
            .unwrap_or(self.entries.len());
        self.entries.drain(..split).map(|entry| entry.task).collect()
    }

    pub fn cancel(&mut self, task_id: &str) -> Option<Task> {
        let index = self.entries.iter().position(|entry| entry.task.id == task_id)?;
        Some(self.entries.remove(index).task)
    }

    /// Earliest due time, if anything is scheduled.
    pub fn next_due(&self) -> Option<i64> {
        self.entries.first().map(|entry| entry.due_at)
    }

    pub fn find_by_key(&self, idempotency_key: &str) -> Option<&Task> {
        self.entries
            .iter()
            .map(|entry| &entry.task)
            .find(|task| task.idempotency_key.as_deref() == Some(idempotency_key))
    }

    /// Lift a parked task to at least `priority`. Returns whether it was found.
    pub fn raise_priority(&mut self, task_id: &str, priority: Priority) -> bool {
        match self.entries.iter_mut().find(|entry| entry.task.id == task_id) {
            Some(entry) => {
                entry.task.priority = entry.task.priority.max(priority);
                true
            }
            None => false,
        }
    }

    /// Remove every entry, earliest first.
    pub fn drain(&mut self) -> impl Iterator<Item = Task> + '_ {
        self.entries.drain(..).map(|entry| entry.task)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.entries.iter().any(|entry| entry.task.id == task_id)
    }

    pub fn entries(&self) -> &[DeferredRetry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-add persisted entries.
    pub fn restore(&mut self, entries: impl IntoIterator<Item = DeferredRetry>) {
        for entry in entries {
            self.schedule(entry.task, entry.due_at);
        }
    }
}
