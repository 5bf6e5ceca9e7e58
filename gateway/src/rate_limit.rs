//! Token-bucket rate limiting keyed by caller identity.
//!
//! Steady state adds `replenish_rate` tokens per second up to
//! `burst_capacity`; one request costs one token. Per-route overrides come
//! from configuration. The settable replenish multiplier is the
//! backpressure hook: a control loop can tighten write endpoints by
//! lowering it below 1.0.

use merx_core::config::{RateLimitConfig, TokenBucketConfig};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;

/// Errors from rate limit stores.
#[derive(Error, Debug, Clone)]
pub enum RateLimitError {
    /// The backing store failed; callers fail open or closed per policy.
    #[error("Rate limit store unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of a rate limit check.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RateDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Whole tokens left in the bucket after the decision.
    pub remaining: u32,
}

/// Bucket storage seam: identity-keyed token buckets.
///
/// The in-memory store below serves a single gateway node; a clustered
/// deployment plugs a shared store in behind the same trait.
pub trait RateLimitStore: Send + Sync {
    /// Take one token from `key`'s bucket with the given parameters.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError`] if the backend fails.
    fn try_acquire(
        &self,
        key: &str,
        replenish_rate: f64,
        burst_capacity: u32,
    ) -> Pin<Box<dyn Future<Output = Result<RateDecision, RateLimitError>> + Send + '_>>;
}

struct Bucket {
    tokens: f64,
    updated: Instant,
}

/// In-memory token buckets.
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl InMemoryRateLimitStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimitStore for InMemoryRateLimitStore {
    fn try_acquire(
        &self,
        key: &str,
        replenish_rate: f64,
        burst_capacity: u32,
    ) -> Pin<Box<dyn Future<Output = Result<RateDecision, RateLimitError>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut buckets = self
                .buckets
                .lock()
                .map_err(|e| RateLimitError::Unavailable(e.to_string()))?;

            let now = Instant::now();
            let bucket = buckets.entry(key).or_insert(Bucket {
                tokens: f64::from(burst_capacity),
                updated: now,
            });

            // Refill for the elapsed time, capped at the burst capacity.
            let elapsed = now.duration_since(bucket.updated).as_secs_f64();
            bucket.tokens =
                (bucket.tokens + elapsed * replenish_rate).min(f64::from(burst_capacity));
            bucket.updated = now;

            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                Ok(RateDecision {
                    allowed: true,
                    remaining: bucket.tokens as u32,
                })
            } else {
                Ok(RateDecision {
                    allowed: false,
                    remaining: 0,
                })
            }
        })
    }
}

/// The gateway's rate limiting stage.
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Box<dyn RateLimitStore>,
    /// Replenish multiplier in parts per thousand (1000 = ×1.0).
    multiplier_millis: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter over the given configuration and store.
    #[must_use]
    pub fn new(config: RateLimitConfig, store: Box<dyn RateLimitStore>) -> Self {
        Self {
            config,
            store,
            multiplier_millis: AtomicU64::new(1000),
        }
    }

    /// Bucket parameters for a route, multiplier applied.
    #[must_use]
    pub fn params_for(&self, route_id: &str) -> (f64, TokenBucketConfig) {
        let bucket = self.config.for_route(route_id);
        #[allow(clippy::cast_precision_loss)]
        let multiplier = self.multiplier_millis.load(Ordering::Relaxed) as f64 / 1000.0;
        (f64::from(bucket.replenish_rate) * multiplier, bucket)
    }

    /// Backpressure hook: scale the effective replenish rate.
    ///
    /// Values below 1.0 tighten every bucket; the burst capacity is left
    /// untouched.
    pub fn set_replenish_multiplier(&self, multiplier: f64) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = (multiplier.max(0.0) * 1000.0) as u64;
        self.multiplier_millis.store(millis, Ordering::Relaxed);
        tracing::info!(multiplier, "Rate limiter replenish multiplier updated");
    }

    /// Check one request for `identity` on `route_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError`] if the store fails.
    pub async fn check(
        &self,
        route_id: &str,
        identity: &str,
    ) -> Result<RateDecision, RateLimitError> {
        let (rate, bucket) = self.params_for(route_id);
        let key = format!("{route_id}:{identity}");
        let decision = self
            .store
            .try_acquire(&key, rate, bucket.burst_capacity)
            .await?;

        if !decision.allowed {
            metrics::counter!("gateway_rate_limited_total", "route" => route_id.to_string())
                .increment(1);
            tracing::debug!(route_id, identity, "Rate limit exceeded");
        }
        Ok(decision)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    fn limiter(replenish_rate: u32, burst_capacity: u32) -> RateLimiter {
        let config = RateLimitConfig {
            default: TokenBucketConfig {
                replenish_rate,
                burst_capacity,
            },
            routes: HashMap::new(),
        };
        RateLimiter::new(config, Box::new(InMemoryRateLimitStore::new()))
    }

    #[tokio::test]
    async fn burst_capacity_bounds_immediate_admissions() {
        let limiter = limiter(100, 200);

        let mut allowed = 0;
        for _ in 0..500 {
            if limiter.check("orders", "user:1").await.unwrap().allowed {
                allowed += 1;
            }
        }
        // The bucket starts full at burst capacity; refill during the loop
        // is negligible but may admit a few extra.
        assert!((200..=205).contains(&allowed), "allowed = {allowed}");
    }

    #[tokio::test]
    async fn bucket_refills_at_replenish_rate() {
        let limiter = limiter(100, 200);

        // Drain the bucket.
        for _ in 0..200 {
            let _ = limiter.check("orders", "user:1").await.unwrap();
        }
        assert!(!limiter.check("orders", "user:1").await.unwrap().allowed);

        // After one idle second roughly `replenish_rate` tokens are back.
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        let mut allowed = 0;
        for _ in 0..150 {
            if limiter.check("orders", "user:1").await.unwrap().allowed {
                allowed += 1;
            }
        }
        assert!((95..=110).contains(&allowed), "allowed = {allowed}");
    }

    #[tokio::test]
    async fn identities_have_separate_buckets() {
        let limiter = limiter(10, 5);

        for _ in 0..5 {
            assert!(limiter.check("orders", "user:1").await.unwrap().allowed);
        }
        assert!(!limiter.check("orders", "user:1").await.unwrap().allowed);
        assert!(limiter.check("orders", "user:2").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn route_override_beats_default() {
        let mut routes = HashMap::new();
        routes.insert(
            "orders".to_string(),
            TokenBucketConfig {
                replenish_rate: 1,
                burst_capacity: 2,
            },
        );
        let config = RateLimitConfig {
            default: TokenBucketConfig {
                replenish_rate: 100,
                burst_capacity: 200,
            },
            routes,
        };
        let limiter = RateLimiter::new(config, Box::new(InMemoryRateLimitStore::new()));

        assert!(limiter.check("orders", "user:1").await.unwrap().allowed);
        assert!(limiter.check("orders", "user:1").await.unwrap().allowed);
        assert!(!limiter.check("orders", "user:1").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn multiplier_tightens_refill() {
        let limiter = limiter(100, 10);
        limiter.set_replenish_multiplier(0.1);

        let (rate, bucket) = limiter.params_for("orders");
        assert!((rate - 10.0).abs() < f64::EPSILON);
        assert_eq!(bucket.burst_capacity, 10);
    }
}
