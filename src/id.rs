//! ID generation utilities for Resumr
//!
//! Provides functions for generating unique identifiers for tasks and
//! snapshot records, plus the idempotency key used to coalesce duplicates.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Generate a unique task ID
///
/// Format: `task-{timestamp_ms}-{random_hex}`
/// Example: `task-1738300800123-a1b2c3d4`
pub fn generate_task_id() -> String {
    let timestamp = now_ms();
    let random: u32 = rand::rng().random();
    format!("task-{}-{:08x}", timestamp, random)
}

/// Generate an ID for a stored snapshot row
///
/// Format: `{prefix}-{timestamp_ms}-{random_hex}`
pub fn generate_record_id(prefix: &str, timestamp: i64) -> String {
    let random: u16 = rand::rng().random();
    format!("{}-{}-{:04x}", prefix, timestamp, random)
}

/// Compute the idempotency key for a unit of work.
///
/// Two requests targeting the same service with byte-identical payload JSON
/// share a key. First 16 hex chars of SHA-256.
pub fn idempotency_key(service_id: &str, payload_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(service_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload_json.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}
