//! Responder health monitor: a per-tenant circuit breaker.
//!
//! Failures are counted inside a sliding window. Status is always derived
//! from the window at check time, so recovery needs no reset task.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::HealthConfig;

/// Derived responder status for a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Failing intermittently; requests are still attempted.
    Degraded,
    /// Customer traffic is short-circuited to a fallback message.
    Disabled,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Disabled => "disabled",
        };
        write!(f, "{s}")
    }
}

/// Answer to "may the responder be called for this tenant?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub can_process: bool,
    pub status: HealthStatus,
    pub reason: Option<String>,
}

#[derive(Default)]
struct TenantHealth {
    failures: VecDeque<(Instant, String)>,
    admin_disabled: bool,
}

/// Per-tenant failure tracker for the AI responder.
pub struct HealthMonitor {
    config: HealthConfig,
    tenants: Mutex<HashMap<String, TenantHealth>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            tenants: Mutex::new(HashMap::new()),
        }
    }

    pub async fn can_process(&self, tenant_id: &str) -> HealthCheck {
        self.can_process_at(tenant_id, Instant::now()).await
    }

    pub async fn can_process_at(&self, tenant_id: &str, now: Instant) -> HealthCheck {
        let mut tenants = self.tenants.lock().await;
        let Some(health) = tenants.get_mut(tenant_id) else {
            return HealthCheck {
                can_process: true,
                status: HealthStatus::Healthy,
                reason: None,
            };
        };

        if health.admin_disabled {
            return HealthCheck {
                can_process: false,
                status: HealthStatus::Disabled,
                reason: Some("disabled by administrator".to_string()),
            };
        }

        self.prune(health, now);
        let status = self.status_for(health.failures.len());
        let reason = health
            .failures
            .back()
            .filter(|_| status != HealthStatus::Healthy)
            .map(|(_, reason)| {
                format!("{} recent failures, last: {reason}", health.failures.len())
            });
        HealthCheck {
            can_process: status != HealthStatus::Disabled,
            status,
            reason,
        }
    }

    /// A successful call clears the failure history.
    pub async fn track_success(&self, tenant_id: &str) {
        let mut tenants = self.tenants.lock().await;
        if let Some(health) = tenants.get_mut(tenant_id)
            && !health.failures.is_empty()
        {
            info!(tenant = %tenant_id, "Responder recovered");
            health.failures.clear();
        }
    }

    pub async fn track_error(&self, tenant_id: &str, reason: &str) -> HealthStatus {
        self.track_error_at(tenant_id, reason, Instant::now()).await
    }

    /// Record a failure. Returns the status after recording it.
    pub async fn track_error_at(&self, tenant_id: &str, reason: &str, now: Instant) -> HealthStatus {
        let mut tenants = self.tenants.lock().await;
        let health = tenants.entry(tenant_id.to_string()).or_default();
        self.prune(health, now);
        let before = self.status_for(health.failures.len());
        health.failures.push_back((now, reason.to_string()));
        let after = self.status_for(health.failures.len());

        if after != before {
            warn!(
                tenant = %tenant_id,
                from = %before,
                to = %after,
                failures = health.failures.len(),
                reason = %reason,
                "Responder health changed"
            );
        }
        after
    }

    /// Administrative override: disable or re-enable the responder.
    pub async fn set_disabled(&self, tenant_id: &str, disabled: bool) {
        let mut tenants = self.tenants.lock().await;
        tenants.entry(tenant_id.to_string()).or_default().admin_disabled = disabled;
        info!(tenant = %tenant_id, disabled, "Responder administrative flag set");
    }

    fn status_for(&self, failures: usize) -> HealthStatus {
        if failures >= self.config.disabled_threshold {
            HealthStatus::Disabled
        } else if failures >= self.config.degraded_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    fn prune(&self, health: &mut TenantHealth, now: Instant) {
        while let Some((at, _)) = health.failures.front() {
            if now.saturating_duration_since(*at) >= self.config.window {
                health.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthConfig {
            window: Duration::from_secs(300),
            degraded_threshold: 3,
            disabled_threshold: 5,
        })
    }

    #[tokio::test]
    async fn healthy_by_default() {
        let check = monitor().can_process("t1").await;
        assert!(check.can_process);
        assert_eq!(check.status, HealthStatus::Healthy);
        assert!(check.reason.is_none());
    }

    #[tokio::test]
    async fn degrades_then_disables() {
        let monitor = monitor();
        let now = Instant::now();
        for _ in 0..2 {
            monitor.track_error_at("t1", "timeout", now).await;
        }
        assert_eq!(monitor.can_process_at("t1", now).await.status, HealthStatus::Healthy);

        assert_eq!(monitor.track_error_at("t1", "timeout", now).await, HealthStatus::Degraded);
        let check = monitor.can_process_at("t1", now).await;
        assert!(check.can_process);
        assert!(check.reason.unwrap().contains("timeout"));

        monitor.track_error_at("t1", "500", now).await;
        assert_eq!(monitor.track_error_at("t1", "500", now).await, HealthStatus::Disabled);
        assert!(!monitor.can_process_at("t1", now).await.can_process);

        // Other tenants are unaffected.
        assert!(monitor.can_process_at("t2", now).await.can_process);
    }

    #[tokio::test]
    async fn failures_age_out_of_window() {
        let monitor = monitor();
        let start = Instant::now();
        for _ in 0..5 {
            monitor.track_error_at("t1", "timeout", start).await;
        }
        let later = start + Duration::from_secs(301);
        let check = monitor.can_process_at("t1", later).await;
        assert_eq!(check.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn success_resets() {
        let monitor = monitor();
        for _ in 0..5 {
            monitor.track_error("t1", "timeout").await;
        }
        monitor.track_success("t1").await;
        assert_eq!(monitor.can_process("t1").await.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn admin_flag_disables_until_cleared() {
        let monitor = monitor();
        monitor.set_disabled("t1", true).await;
        let check = monitor.can_process("t1").await;
        assert!(!check.can_process);
        assert_eq!(check.status, HealthStatus::Disabled);

        // A success does not lift an administrative disable.
        monitor.track_success("t1").await;
        assert!(!monitor.can_process("t1").await.can_process);

        monitor.set_disabled("t1", false).await;
        assert!(monitor.can_process("t1").await.can_process);
    }
}
