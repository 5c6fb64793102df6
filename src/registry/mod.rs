//! Service registry: the single in-memory record of each service's state.
//!
//! Only the scheduler actor mutates the registry. Probe results and
//! exhaustion signals are applied here and reported back as
//! [`StatusChange`]s so the caller can decide which events to publish.

mod prober;

pub use prober::{ProbeError, ProbeOutcome, ProbeReport, Prober, ServiceProvider};

use std::collections::BTreeMap;

use log::{debug, warn};

use crate::domain::{Service, ServiceStatus};

/// A service moved from one status to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub service_id: String,
    pub from: ServiceStatus,
    pub to: ServiceStatus,
}

impl StatusChange {
    pub fn became_limited(&self) -> bool {
        self.to == ServiceStatus::Limited && self.from != ServiceStatus::Limited
    }

    /// Back to available after being limited or erroring.
    pub fn recovered(&self) -> bool {
        self.to == ServiceStatus::Available && matches!(self.from, ServiceStatus::Limited | ServiceStatus::Error)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, Service>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: Service) {
        self.services.insert(service.id.clone(), service);
    }

    pub fn get(&self, service_id: &str) -> Option<&Service> {
        self.services.get(service_id)
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.services.contains_key(service_id)
    }

    pub fn is_available(&self, service_id: &str) -> bool {
        self.services.get(service_id).is_some_and(Service::is_available)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Copies of every service record, ordered by id.
    pub fn snapshot(&self) -> Vec<Service> {
        self.services.values().cloned().collect()
    }

    /// Apply a probe result. Returns the status change, if any.
    ///
    /// A failed probe marks the service `error`; it never marks it `limited`.
    /// An `available` report from a probe that started before the last
    /// exhaustion is dropped while that exhaustion's reset is still ahead.
    pub fn apply_probe(&mut self, outcome: &ProbeOutcome) -> Option<StatusChange> {
        let service = self.services.get_mut(&outcome.service_id)?;
        if Self::overtaken(service, outcome) {
            debug!(
                "Ignoring stale probe for {} started at {} before exhaustion",
                outcome.service_id, outcome.started_at
            );
            return None;
        }
        let from = service.status;
        service.last_checked_at = Some(outcome.checked_at);

        match &outcome.result {
            Ok(report) => {
                service.status = if report.available {
                    ServiceStatus::Available
                } else {
                    ServiceStatus::Limited
                };
                service.rate_limit_info = report.rate_limit_info.clone();
                service.reset_time = report.reset_time;
                service.last_error = None;
            }
            Err(e) => {
                service.status = ServiceStatus::Error;
                service.last_error = Some(e.to_string());
            }
        }

        Self::change(service, from)
    }

    fn overtaken(service: &Service, outcome: &ProbeOutcome) -> bool {
        let reports_available = matches!(&outcome.result, Ok(report) if report.available);
        reports_available
            && service.last_exhausted_at.is_some_and(|at| at > outcome.started_at)
            && service.reset_time.is_some_and(|reset| reset > outcome.checked_at)
    }

    /// Mark a service exhausted, keeping any earlier reset hint when none is given.
    pub fn mark_limited(&mut self, service_id: &str, reset_time: Option<i64>, now: i64) -> Option<StatusChange> {
        let service = self.services.get_mut(service_id)?;
        let from = service.status;
        service.status = ServiceStatus::Limited;
        if reset_time.is_some() {
            service.reset_time = reset_time;
        }
        service.last_exhausted_at = Some(now);
        Self::change(service, from)
    }

    /// Limited services whose reset time has passed and that have not
    /// been checked since.
    pub fn due_for_reprobe(&self, now: i64) -> Vec<String> {
        self.services
            .values()
            .filter(|service| service.reset_elapsed(now))
            .filter(|service| match (service.last_checked_at, service.reset_time) {
                (Some(checked), Some(reset)) => checked < reset,
                _ => true,
            })
            .map(|service| service.id.clone())
            .collect()
    }

    /// Earliest future reset time among limited services.
    pub fn next_reset(&self, now: i64) -> Option<i64> {
        self.services
            .values()
            .filter(|service| service.status == ServiceStatus::Limited)
            .filter_map(|service| service.reset_time)
            .filter(|reset| *reset > now)
            .min()
    }

    /// Restore persisted service state.
    ///
    /// `limited` survives only while its reset time is still in the
    /// future; everything else comes back `unknown` until the next probe.
    pub fn restore(&mut self, saved: &[Service], now: i64) {
        for saved in saved {
            let Some(service) = self.services.get_mut(&saved.id) else {
                warn!("Ignoring persisted state for unknown service {}", saved.id);
                continue;
            };
            service.rate_limit_info = saved.rate_limit_info.clone();
            service.reset_time = saved.reset_time;
            service.last_checked_at = saved.last_checked_at;
            service.last_error = saved.last_error.clone();
            service.last_exhausted_at = saved.last_exhausted_at;
            service.status = match (saved.status, saved.reset_time) {
                (ServiceStatus::Limited, Some(reset)) if reset > now => ServiceStatus::Limited,
                _ => ServiceStatus::Unknown,
            };
        }
    }

    fn change(service: &Service, from: ServiceStatus) -> Option<StatusChange> {
        (service.status != from).then(|| StatusChange {
            service_id: service.id.clone(),
            from,
            to: service.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ServiceRegistry {
        let mut registry = ServiceRegistry::new();
        registry.register(Service::new("github", "GitHub API"));
        registry.register(Service::new("anthropic", "Claude API"));
        registry
    }

    fn outcome(service_id: &str, result: Result<ProbeReport, ProbeError>) -> ProbeOutcome {
        ProbeOutcome {
            service_id: service_id.to_string(),
            result,
            started_at: 90,
            checked_at: 100,
        }
    }

    #[test]
    fn test_apply_available_probe() {
        let mut registry = registry();
        let report = ProbeReport::available().with_info("remaining", 4000);
        let change = registry.apply_probe(&outcome("github", Ok(report))).unwrap();

        assert_eq!(change.from, ServiceStatus::Unknown);
        assert_eq!(change.to, ServiceStatus::Available);
        assert!(!change.recovered());
        let service = registry.get("github").unwrap();
        assert_eq!(service.rate_limit_info["remaining"], 4000);
        assert_eq!(service.last_checked_at, Some(100));
        assert!(registry.is_available("github"));
    }

    #[test]
    fn test_apply_limited_probe() {
        let mut registry = registry();
        let change = registry
            .apply_probe(&outcome("github", Ok(ProbeReport::limited(Some(5_000)))))
            .unwrap();
        assert!(change.became_limited());
        assert_eq!(registry.get("github").unwrap().reset_time, Some(5_000));
    }

    #[test]
    fn test_probe_error_is_never_limited() {
        let mut registry = registry();
        let change = registry
            .apply_probe(&outcome("github", Err(ProbeError::Network("refused".to_string()))))
            .unwrap();
        assert_eq!(change.to, ServiceStatus::Error);
        assert!(!change.became_limited());
        let service = registry.get("github").unwrap();
        assert_eq!(service.last_error.as_deref(), Some("Network error: refused"));
    }

    #[test]
    fn test_recovery_after_limit() {
        let mut registry = registry();
        registry.mark_limited("anthropic", Some(500), 50);
        let change = registry
            .apply_probe(&outcome("anthropic", Ok(ProbeReport::available())))
            .unwrap();
        assert!(change.recovered());
    }

    #[test]
    fn test_available_report_overtaken_by_exhaustion_is_ignored() {
        let mut registry = registry();
        registry.apply_probe(&outcome("anthropic", Ok(ProbeReport::available())));
        // Exhausted at 95, after the next check went out at 90
        registry.mark_limited("anthropic", Some(60_000), 95);

        assert!(registry
            .apply_probe(&outcome("anthropic", Ok(ProbeReport::available())))
            .is_none());
        let service = registry.get("anthropic").unwrap();
        assert_eq!(service.status, ServiceStatus::Limited);
        assert_eq!(service.reset_time, Some(60_000));
        assert!(!registry.is_available("anthropic"));

        // A limited report from the same window still applies
        registry.apply_probe(&outcome("anthropic", Ok(ProbeReport::limited(Some(70_000)))));
        assert_eq!(registry.get("anthropic").unwrap().reset_time, Some(70_000));
    }

    #[test]
    fn test_overtaken_report_applies_once_reset_passed() {
        let mut registry = registry();
        registry.mark_limited("anthropic", Some(99), 95);
        let change = registry
            .apply_probe(&outcome("anthropic", Ok(ProbeReport::available())))
            .unwrap();
        assert!(change.recovered());
    }

    #[test]
    fn test_same_status_is_no_change() {
        let mut registry = registry();
        registry.apply_probe(&outcome("github", Ok(ProbeReport::available())));
        assert!(registry.apply_probe(&outcome("github", Ok(ProbeReport::available()))).is_none());
        assert!(registry.apply_probe(&outcome("gitlab", Ok(ProbeReport::available()))).is_none());
    }

    #[test]
    fn test_mark_limited_keeps_previous_reset() {
        let mut registry = registry();
        registry.mark_limited("github", Some(9_000), 10);
        let again = registry.mark_limited("github", None, 20);
        assert!(again.is_none());
        let service = registry.get("github").unwrap();
        assert_eq!(service.reset_time, Some(9_000));
        assert_eq!(service.last_exhausted_at, Some(20));
    }

    #[test]
    fn test_due_for_reprobe() {
        let mut registry = registry();
        registry.mark_limited("github", Some(1_000), 0);
        registry.mark_limited("anthropic", None, 0);
        assert!(registry.due_for_reprobe(999).is_empty());
        assert_eq!(registry.due_for_reprobe(1_000), vec!["github".to_string()]);
        assert_eq!(registry.next_reset(999), Some(1_000));
        assert_eq!(registry.next_reset(1_000), None);
    }

    #[test]
    fn test_no_reprobe_after_check_past_reset() {
        let mut registry = registry();
        let stale = ProbeOutcome {
            service_id: "github".to_string(),
            result: Ok(ProbeReport::limited(Some(1_000))),
            started_at: 1_400,
            checked_at: 1_500,
        };
        registry.apply_probe(&stale);
        assert!(registry.due_for_reprobe(2_000).is_empty());
    }

    #[test]
    fn test_restore_service_status() {
        let mut registry = registry();
        let mut github = Service::new("github", "GitHub API");
        github.status = ServiceStatus::Limited;
        github.reset_time = Some(2_000);
        let mut anthropic = Service::new("anthropic", "Claude API");
        anthropic.status = ServiceStatus::Limited;
        anthropic.reset_time = Some(500);
        let unknown = Service::new("gitlab", "GitLab");

        registry.restore(&[github, anthropic, unknown], 1_000);

        assert_eq!(registry.get("github").unwrap().status, ServiceStatus::Limited);
        let anthropic = registry.get("anthropic").unwrap();
        assert_eq!(anthropic.status, ServiceStatus::Unknown);
        assert_eq!(anthropic.reset_time, Some(500));
        assert!(!registry.contains("gitlab"));
    }
}
