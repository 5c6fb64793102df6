//! Service records: one per throttled external dependency.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Availability as last observed by the prober or an exhaustion signal.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Never probed
    #[default]
    Unknown,
    /// Reports capacity; tasks may be dispatched
    Available,
    /// Quota exhausted until `reset_time` (or until a probe says otherwise)
    Limited,
    /// Last probe failed at the network/protocol level
    Error,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Unknown => "unknown",
            ServiceStatus::Available => "available",
            ServiceStatus::Limited => "limited",
            ServiceStatus::Error => "error",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// In-memory state for one external service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub id: String,
    pub display_name: String,
    pub status: ServiceStatus,
    /// Provider-reported quota fields, passed through as-is
    pub rate_limit_info: Map<String, Value>,
    /// Epoch millis when the provider expects quota to reset
    pub reset_time: Option<i64>,
    pub last_checked_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_exhausted_at: Option<i64>,
}

impl Service {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            status: ServiceStatus::Unknown,
            rate_limit_info: Map::new(),
            reset_time: None,
            last_checked_at: None,
            last_error: None,
            last_exhausted_at: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == ServiceStatus::Available
    }

    /// Limited, and the advertised reset time has passed.
    pub fn reset_elapsed(&self, now: i64) -> bool {
        self.status == ServiceStatus::Limited && self.reset_time.is_some_and(|reset| reset <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_service_is_unknown() {
        let service = Service::new("github", "GitHub API");
        assert_eq!(service.status, ServiceStatus::Unknown);
        assert!(!service.is_available());
        assert!(service.rate_limit_info.is_empty());
    }

    #[test]
    fn test_reset_elapsed() {
        let mut service = Service::new("github", "GitHub API");
        service.status = ServiceStatus::Limited;
        assert!(!service.reset_elapsed(1_000));

        service.reset_time = Some(2_000);
        assert!(!service.reset_elapsed(1_000));
        assert!(service.reset_elapsed(2_000));

        service.status = ServiceStatus::Available;
        assert!(!service.reset_elapsed(3_000));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&ServiceStatus::Limited).unwrap();
        assert_eq!(json, "\"limited\"");
    }
}
