//! Domain types for Resumr
//!
//! - Task: a unit of work with priority, payload, and retry state
//! - Service: availability and quota state of one external dependency
//! - PersistedSnapshot / HistoryRecord: what survives a restart

pub mod service;
pub mod snapshot;
pub mod task;

pub use service::{Service, ServiceStatus};
pub use snapshot::{DeferredRetry, HistoryQuery, HistoryRecord, PersistedSnapshot};
pub use task::{NewTask, Priority, Task, TaskKind, TaskPayload, TaskStatus};
