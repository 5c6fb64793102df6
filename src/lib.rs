//! Resumr - a rate-limit-aware task scheduler with persistent recovery
//!
//! Resumr mediates calls to throttled external services. It probes each
//! service for remaining quota, runs at most one task at a time against an
//! available service, retries transient failures with backoff, and persists
//! its queue so work survives a restart.

pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod id;
pub mod providers;
pub mod registry;
pub mod scheduler;
pub mod store;

pub use error::{ResumrError, Result, TaskError};
