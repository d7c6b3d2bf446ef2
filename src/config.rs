//! Configuration types.
//!
//! Every knob has a default; `from_env()` overrides individual values from
//! `CHAT_ORCH_*` environment variables. The dedup map and the staff-role
//! cache are process-local: a deployment running several orchestrator
//! instances must keep `dedup.window` and `identity.cache_ttl` small or back
//! them with a shared store.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Top-level orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Name the assistant introduces itself with.
    pub assistant_name: String,
    /// Business the assistant speaks for (used in templates and prompts).
    pub business_name: String,
    /// Tenant-local UTC offset, for time-of-day greetings.
    pub utc_offset_hours: i32,
    /// Hard limit raced against every AI responder call.
    pub responder_timeout: Duration,
    /// Number of prior messages included in the responder prompt.
    pub history_limit: usize,
    pub identity: IdentityConfig,
    pub dedup: DedupConfig,
    pub health: HealthConfig,
    pub delivery: DeliveryConfig,
    pub flow: FlowConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            assistant_name: "Asisten".to_string(),
            business_name: "Showroom".to_string(),
            utc_offset_hours: 7, // WIB
            responder_timeout: Duration::from_secs(30),
            history_limit: 10,
            identity: IdentityConfig::default(),
            dedup: DedupConfig::default(),
            health: HealthConfig::default(),
            delivery: DeliveryConfig::default(),
            flow: FlowConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            assistant_name: env_string("CHAT_ORCH_ASSISTANT_NAME", defaults.assistant_name),
            business_name: env_string("CHAT_ORCH_BUSINESS_NAME", defaults.business_name),
            utc_offset_hours: env_parse("CHAT_ORCH_UTC_OFFSET_HOURS", defaults.utc_offset_hours)?,
            responder_timeout: env_secs("CHAT_ORCH_RESPONDER_TIMEOUT_SECS", defaults.responder_timeout)?,
            history_limit: env_parse("CHAT_ORCH_HISTORY_LIMIT", defaults.history_limit)?,
            identity: IdentityConfig {
                country_code: env_string("CHAT_ORCH_COUNTRY_CODE", defaults.identity.country_code),
                trunk_prefix: env_string("CHAT_ORCH_TRUNK_PREFIX", defaults.identity.trunk_prefix),
                cache_ttl: env_secs("CHAT_ORCH_STAFF_CACHE_TTL_SECS", defaults.identity.cache_ttl)?,
                recency_windows: defaults.identity.recency_windows,
            },
            dedup: DedupConfig {
                window: env_secs("CHAT_ORCH_DEDUP_WINDOW_SECS", defaults.dedup.window)?,
                eviction_multiple: defaults.dedup.eviction_multiple,
            },
            health: HealthConfig {
                window: env_secs("CHAT_ORCH_HEALTH_WINDOW_SECS", defaults.health.window)?,
                degraded_threshold: env_parse(
                    "CHAT_ORCH_HEALTH_DEGRADED_AFTER",
                    defaults.health.degraded_threshold,
                )?,
                disabled_threshold: env_parse(
                    "CHAT_ORCH_HEALTH_DISABLED_AFTER",
                    defaults.health.disabled_threshold,
                )?,
            },
            delivery: DeliveryConfig {
                max_attempts: env_parse("CHAT_ORCH_DELIVERY_ATTEMPTS", defaults.delivery.max_attempts)?,
                backoff_step: defaults.delivery.backoff_step,
                inter_attachment_delay: defaults.delivery.inter_attachment_delay,
            },
            flow: FlowConfig {
                idle_timeout: env_secs("CHAT_ORCH_FLOW_IDLE_SECS", defaults.flow.idle_timeout)?,
            },
        })
    }
}

/// Address normalization and staff-role cache settings.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// International prefix a leading trunk prefix is rewritten to.
    pub country_code: String,
    /// Local trunk prefix (e.g. `0` in `0812…`).
    pub trunk_prefix: String,
    /// How long a tenant's staff registry snapshot is reused.
    pub cache_ttl: Duration,
    /// Alias recency-linking windows, tightest first.
    pub recency_windows: Vec<Duration>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            country_code: "62".to_string(),
            trunk_prefix: "0".to_string(),
            cache_ttl: Duration::from_secs(300),
            recency_windows: vec![
                Duration::from_secs(120),
                Duration::from_secs(600),
                Duration::from_secs(1800),
            ],
        }
    }
}

/// Duplicate-greeting suppression settings.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub window: Duration,
    /// Entries older than `window * eviction_multiple` are dropped.
    pub eviction_multiple: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            eviction_multiple: 6,
        }
    }
}

/// Responder circuit-breaker settings.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Sliding window failures are counted in.
    pub window: Duration,
    pub degraded_threshold: usize,
    pub disabled_threshold: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            degraded_threshold: 3,
            disabled_threshold: 5,
        }
    }
}

/// Outbound delivery retry settings.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Attempts per payload, including the first.
    pub max_attempts: u32,
    /// Delay after failed attempt `n` is `backoff_step * n`.
    pub backoff_step: Duration,
    /// Pause between consecutive attachments.
    pub inter_attachment_delay: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_millis(1000),
            inter_attachment_delay: Duration::from_millis(500),
        }
    }
}

/// Multi-step flow settings.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// A flow with no activity for this long is dropped on the next message.
    pub idle_timeout: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(1800),
        }
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(default)
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.identity.country_code, "62");
        assert!(config.health.degraded_threshold < config.health.disabled_threshold);
        assert!(config.delivery.max_attempts >= 1);
        // Recency windows must be tightest first.
        let windows = &config.identity.recency_windows;
        assert!(windows.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn env_parse_rejects_garbage() {
        // SAFETY: test-local variable name, not read by other tests.
        unsafe { std::env::set_var("CHAT_ORCH_TEST_GARBAGE", "not-a-number") };
        let result: Result<u32, _> = env_parse("CHAT_ORCH_TEST_GARBAGE", 3);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
        unsafe { std::env::remove_var("CHAT_ORCH_TEST_GARBAGE") };
    }

    #[test]
    fn env_parse_missing_uses_default() {
        let result: u32 = env_parse("CHAT_ORCH_TEST_DEFINITELY_UNSET", 7).unwrap();
        assert_eq!(result, 7);
    }
}
