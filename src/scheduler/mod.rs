//! Single-flight scheduler.
//!
//! This module provides:
//! - **Queue**: live tasks ordered by priority, then arrival
//! - **Retry policy**: classifies failures and computes backoff delays
//! - **Retry schedule**: tasks parked until their backoff elapses
//! - **Core**: the synchronous state machine tying those together
//! - **Scheduler**: the tokio actor that drives the core, runs probes and
//!   handlers, and persists state after every mutation
//!
//! # Example
//!
//! ```ignore
//! use resumr::scheduler::{Scheduler, SchedulerSettings};
//!
//! let scheduler = Scheduler::builder(SchedulerSettings::default())
//!     .service(provider.clone())
//!     .handler(TaskKind::LlmCompletion, provider)
//!     .store(persistence)
//!     .start()
//!     .await?;
//!
//! let task = scheduler.handle().enqueue(request).await?;
//! let result = task.wait().await;
//! scheduler.shutdown().await?;
//! ```

mod core;
mod delay;
mod manager;
mod queue;
mod retry;

pub use self::core::{Cancelled, Cleared, Completion, Dispatch, Enqueued, Exhaustion, RestoreReport, SchedulerCore};
pub use delay::RetrySchedule;
pub use manager::{Scheduler, SchedulerBuilder, SchedulerHandle, SchedulerSettings, SchedulerStatus, TaskHandle};
pub use queue::TaskQueue;
pub use retry::{RetryDecision, RetryPolicy};
