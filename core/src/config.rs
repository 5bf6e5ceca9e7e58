//! Configuration types for the platform.
//!
//! Plain serde structs with defaults matching the operator documentation;
//! binaries deserialize them from their config source and hand them to the
//! components. Durations are stored in integral units with accessor methods
//! so config files stay flat.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Token-bucket parameters for one identity class or route.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBucketConfig {
    /// Steady-state tokens added per second.
    pub replenish_rate: u32,
    /// Bucket capacity (maximum burst).
    pub burst_capacity: u32,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            replenish_rate: 100,
            burst_capacity: 200,
        }
    }
}

/// Rate limiting configuration: a default bucket plus per-route overrides.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Bucket applied when no route override matches.
    pub default: TokenBucketConfig,
    /// Per-route overrides keyed by route id.
    #[serde(default)]
    pub routes: HashMap<String, TokenBucketConfig>,
}

impl RateLimitConfig {
    /// Bucket parameters for a route.
    #[must_use]
    pub fn for_route(&self, route_id: &str) -> TokenBucketConfig {
        self.routes.get(route_id).copied().unwrap_or(self.default)
    }
}

/// Circuit breaker tuning for one upstream service.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerConfig {
    /// Sliding window size in calls.
    pub window: usize,
    /// Minimum calls in the window before the failure ratio is evaluated.
    pub min_calls: usize,
    /// Failure percentage (0–100) at which the circuit opens.
    pub failure_pct: f64,
    /// How long the circuit stays open before probing, in milliseconds.
    pub open_ms: u64,
    /// Number of probe calls permitted while half-open.
    pub half_open_probes: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: 10,
            min_calls: 5,
            failure_pct: 50.0,
            open_ms: 30_000,
            half_open_probes: 3,
        }
    }
}

impl BreakerConfig {
    /// Open duration as a [`Duration`].
    #[must_use]
    pub const fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_ms)
    }
}

/// Retry policy for calls to one upstream service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum attempts (including the first).
    pub attempts: u32,
    /// First backoff delay in milliseconds.
    pub first_backoff_ms: u64,
    /// Backoff cap in milliseconds.
    pub max_backoff_ms: u64,
    /// Backoff multiplier.
    pub factor: u32,
    /// Upstream statuses that trigger a retry.
    pub on_statuses: Vec<u16>,
    /// Methods allowed to retry (idempotent only).
    pub on_methods: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            first_backoff_ms: 50,
            max_backoff_ms: 500,
            factor: 2,
            on_statuses: vec![502, 503],
            on_methods: vec!["GET".into(), "HEAD".into(), "PUT".into(), "DELETE".into()],
        }
    }
}

impl RetryConfig {
    /// Whether a method/status pair is retriable under this policy.
    #[must_use]
    pub fn allows(&self, method: &str, status: u16) -> bool {
        self.on_methods.iter().any(|m| m.eq_ignore_ascii_case(method))
            && self.on_statuses.contains(&status)
    }
}

/// Distributed lock behavior.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockConfig {
    /// Acquisition wait budget in milliseconds.
    pub wait_ms: u64,
    /// Lease duration in milliseconds.
    pub lease_ms: u64,
    /// Whether the lease watchdog renews automatically.
    pub watchdog_enabled: bool,
    /// FIFO ticket fairness instead of free contention.
    pub fair: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_ms: 3_000,
            lease_ms: 10_000,
            watchdog_enabled: true,
            fair: false,
        }
    }
}

impl LockConfig {
    /// Wait budget as a [`Duration`].
    #[must_use]
    pub const fn wait_budget(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    /// Lease as a [`Duration`].
    #[must_use]
    pub const fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

/// Reservation TTL policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationConfig {
    /// TTL applied when the caller does not specify one, in minutes.
    pub default_ttl_minutes: u64,
    /// Operator-configured upper bound on caller-supplied TTLs, in minutes.
    pub max_ttl_minutes: u64,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            default_ttl_minutes: 30,
            max_ttl_minutes: 120,
        }
    }
}

impl ReservationConfig {
    /// Default TTL as a [`Duration`].
    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_minutes * 60)
    }

    /// Clamp a requested TTL to the operator maximum.
    #[must_use]
    pub fn clamp_ttl(&self, requested: Duration) -> Duration {
        requested.min(Duration::from_secs(self.max_ttl_minutes * 60))
    }
}

/// Order saga policy windows.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaConfig {
    /// Duplicate-order detection window in minutes.
    pub duplicate_window_minutes: u64,
    /// Customer cancellation window in hours.
    pub cancellation_hours: u64,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            duplicate_window_minutes: 5,
            cancellation_hours: 24,
        }
    }
}

impl SagaConfig {
    /// Duplicate window as a [`chrono::Duration`].
    #[must_use]
    pub fn duplicate_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::try_from(self.duplicate_window_minutes).unwrap_or(i64::MAX))
    }

    /// Cancellation window as a [`chrono::Duration`].
    #[must_use]
    pub fn cancellation_window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::try_from(self.cancellation_hours).unwrap_or(i64::MAX))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn rate_limit_route_override_falls_back_to_default() {
        let mut config = RateLimitConfig::default();
        config.routes.insert(
            "orders".to_string(),
            TokenBucketConfig {
                replenish_rate: 10,
                burst_capacity: 20,
            },
        );

        assert_eq!(config.for_route("orders").replenish_rate, 10);
        assert_eq!(config.for_route("inventory"), config.default);
    }

    #[test]
    fn breaker_defaults_match_pipeline_contract() {
        let config = BreakerConfig::default();
        assert_eq!(config.window, 10);
        assert_eq!(config.min_calls, 5);
        assert!((config.failure_pct - 50.0).abs() < f64::EPSILON);
        assert_eq!(config.open_duration(), Duration::from_secs(30));
        assert_eq!(config.half_open_probes, 3);
    }

    #[test]
    fn retry_policy_rejects_non_idempotent_methods() {
        let config = RetryConfig::default();
        assert!(config.allows("GET", 503));
        assert!(config.allows("get", 502));
        assert!(!config.allows("POST", 503));
        assert!(!config.allows("GET", 500));
    }

    #[test]
    fn reservation_ttl_is_clamped() {
        let config = ReservationConfig {
            default_ttl_minutes: 30,
            max_ttl_minutes: 60,
        };
        assert_eq!(
            config.clamp_ttl(Duration::from_secs(10 * 3600)),
            Duration::from_secs(3600)
        );
        assert_eq!(
            config.clamp_ttl(Duration::from_secs(60)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn config_structs_deserialize_from_json() {
        let json = r#"{"waitMs": 1000, "leaseMs": 5000, "watchdogEnabled": false, "fair": true}"#;
        let config: LockConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.wait_budget(), Duration::from_secs(1));
        assert!(config.fair);
        assert!(!config.watchdog_enabled);
    }
}
