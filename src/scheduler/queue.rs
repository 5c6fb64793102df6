//! Live task queue.
//!
//! Tasks are kept sorted by priority, highest first. Within a priority
//! bucket, [`TaskQueue::push_back`] appends and [`TaskQueue::push_front`]
//! jumps ahead of everything else in the bucket.

use crate::domain::Task;

#[derive(Debug, Clone, Default)]
pub struct TaskQueue {
    tasks: Vec<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the tail of the task's priority bucket. Returns the index.
    pub fn push_back(&mut self, task: Task) -> usize {
        let index = self
            .tasks
            .iter()
            .position(|queued| queued.priority < task.priority)
            .unwrap_or(self.tasks.len());
        self.tasks.insert(index, task);
        index
    }

    /// Insert at the head of the task's priority bucket. Returns the index.
    pub fn push_front(&mut self, task: Task) -> usize {
        let index = self
            .tasks
            .iter()
            .position(|queued| queued.priority <= task.priority)
            .unwrap_or(self.tasks.len());
        self.tasks.insert(index, task);
        index
    }

    /// Highest-priority task whose service passes `is_available`.
    pub fn peek_runnable<F>(&self, is_available: F) -> Option<&Task>
    where
        F: Fn(&str) -> bool,
    {
        self.tasks.iter().find(|task| is_available(&task.service_id))
    }

    pub fn remove(&mut self, task_id: &str) -> Option<Task> {
        let index = self.tasks.iter().position(|task| task.id == task_id)?;
        Some(self.tasks.remove(index))
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == task_id)
    }

    pub fn find_by_key(&self, idempotency_key: &str) -> Option<&Task> {
        self.tasks
            .iter()
            .find(|task| task.idempotency_key.as_deref() == Some(idempotency_key))
    }

    /// Remove every task, highest priority first.
    pub fn drain(&mut self) -> impl Iterator<Item = Task> + '_ {
        self.tasks.drain(..)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn as_slice(&self) -> &[Task] {
        &self.tasks
    }
}
