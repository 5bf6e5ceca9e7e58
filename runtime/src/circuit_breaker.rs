//! Circuit breaker pattern for preventing cascading failures.
//!
//! A circuit breaker monitors operations and "opens" (stops allowing
//! requests) when the failure ratio over a sliding window of recent calls
//! exceeds a threshold, preventing cascading failures in distributed systems.
//!
//! # States
//!
//! - **Closed**: Normal operation. Outcomes are recorded in a sliding window
//!   of the last `window` calls; the circuit opens once the window holds at
//!   least `min_calls` calls and the failure ratio reaches `failure_pct`.
//! - **Open**: Requests fail immediately for `open_ms`, then the circuit
//!   moves to half-open.
//! - **HalfOpen**: Up to `half_open_probes` probe calls are allowed. All
//!   probes succeeding closes the circuit; any probe failing reopens it.
//!
//! # Example
//!
//! ```rust
//! use merx_core::config::BreakerConfig;
//! use merx_runtime::circuit_breaker::CircuitBreaker;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = CircuitBreaker::new(BreakerConfig::default());
//!
//! match breaker.call(|| async {
//!     // Your fallible operation
//!     Ok::<_, String>(42)
//! }).await {
//!     Ok(result) => println!("Success: {result}"),
//!     Err(e) => println!("Failed: {e}"),
//! }
//! # Ok(())
//! # }
//! ```

use merx_core::config::BreakerConfig;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::RwLock;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Circuit is closed, requests pass through normally.
    Closed,
    /// Circuit is open, requests fail immediately.
    Open,
    /// Circuit is half-open, probing whether the service recovered.
    HalfOpen,
}

/// Errors from circuit breaker operations.
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, request rejected without dispatch.
    #[error("Circuit breaker is open")]
    Open,
    /// Operation failed.
    #[error("Operation failed: {0}")]
    Inner(E),
}

/// Internal state of the circuit breaker.
#[derive(Debug)]
struct BreakerState {
    state: State,
    /// Outcomes of the most recent calls, `true` = failure.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    probes_started: usize,
    probe_successes: usize,
}

impl BreakerState {
    fn record_outcome(&mut self, failed: bool, window_size: usize) {
        if self.window.len() == window_size {
            self.window.pop_front();
        }
        self.window.push_back(failed);
    }

    fn failure_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)] // Window sizes are tiny
        {
            self.window.iter().filter(|f| **f).count() as f64 / self.window.len() as f64
        }
    }
}

/// Circuit breaker driven by a sliding window of call outcomes.
///
/// Wraps operations and monitors their success/failure. When the failure
/// ratio over the window exceeds the configured threshold, the circuit
/// "opens" and rejects requests for the open duration.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: Arc<BreakerConfig>,
    state: Arc<RwLock<BreakerState>>,
    // Metrics
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(RwLock::new(BreakerState {
                state: State::Closed,
                window: VecDeque::with_capacity(config.window),
                opened_at: None,
                probes_started: 0,
                probe_successes: 0,
            })),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get the current state of the circuit breaker.
    pub async fn state(&self) -> State {
        let state = self.state.read().await;
        state.state
    }

    /// Call an operation through the circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the circuit is open (or the
    /// half-open probe budget is exhausted).
    /// Returns `CircuitBreakerError::Inner` if the operation fails.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        if !self.can_attempt().await {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("circuit_breaker_rejections_total").increment(1);
            tracing::warn!("Circuit breaker is OPEN, rejecting request");
            return Err(CircuitBreakerError::Open);
        }

        match operation().await {
            Ok(result) => {
                self.on_success().await;
                self.total_successes.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Err(err) => {
                self.on_failure().await;
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    /// Check whether an attempt is allowed, updating state as needed.
    async fn can_attempt(&self) -> bool {
        let mut state = self.state.write().await;

        match state.state {
            State::Closed => true,
            State::HalfOpen => {
                if state.probes_started < self.config.half_open_probes {
                    state.probes_started += 1;
                    true
                } else {
                    false
                }
            }
            State::Open => {
                let expired = state
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.open_duration());
                if expired {
                    tracing::info!("Circuit breaker transitioning OPEN -> HALF_OPEN");
                    state.state = State::HalfOpen;
                    state.probes_started = 1;
                    state.probe_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Handle successful operation.
    async fn on_success(&self) {
        let mut state = self.state.write().await;
        let window_size = self.config.window;

        match state.state {
            State::Closed => state.record_outcome(false, window_size),
            State::HalfOpen => {
                state.probe_successes += 1;
                if state.probe_successes >= self.config.half_open_probes {
                    tracing::info!(
                        probes = state.probe_successes,
                        "Circuit breaker transitioning HALF_OPEN -> CLOSED"
                    );
                    state.state = State::Closed;
                    state.window.clear();
                    state.opened_at = None;
                    state.probes_started = 0;
                    state.probe_successes = 0;
                }
            }
            State::Open => {}
        }
    }

    /// Handle failed operation.
    async fn on_failure(&self) {
        let mut state = self.state.write().await;
        let window_size = self.config.window;

        match state.state {
            State::Closed => {
                state.record_outcome(true, window_size);
                let ratio = state.failure_ratio();
                if state.window.len() >= self.config.min_calls
                    && ratio * 100.0 >= self.config.failure_pct
                {
                    tracing::warn!(
                        failure_ratio = ratio,
                        calls = state.window.len(),
                        "Circuit breaker transitioning CLOSED -> OPEN"
                    );
                    state.state = State::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            State::HalfOpen => {
                tracing::warn!("Circuit breaker transitioning HALF_OPEN -> OPEN (probe failed)");
                state.state = State::Open;
                state.opened_at = Some(Instant::now());
                state.probes_started = 0;
                state.probe_successes = 0;
            }
            State::Open => {}
        }
    }

    /// Get circuit breaker metrics.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Reset the circuit breaker to closed state.
    ///
    /// Useful for testing or manual intervention.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        tracing::info!("Circuit breaker manually reset to CLOSED");
        state.state = State::Closed;
        state.window.clear();
        state.opened_at = None;
        state.probes_started = 0;
        state.probe_successes = 0;
    }
}

/// Metrics for circuit breaker monitoring.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerMetrics {
    /// Total number of calls attempted.
    pub total_calls: u64,
    /// Total number of successful calls.
    pub total_successes: u64,
    /// Total number of failed calls.
    pub total_failures: u64,
    /// Total number of rejected calls (circuit open).
    pub total_rejections: u64,
}

impl CircuitBreakerMetrics {
    /// Calculate success rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 1.0;
        }
        self.total_successes as f64 / self.total_calls as f64
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            window: 10,
            min_calls: 5,
            failure_pct: 50.0,
            open_ms: 100,
            half_open_probes: 3,
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.call(|| async { Err::<i32, _>("error") }).await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        let _ = breaker.call(|| async { Ok::<_, String>(42) }).await;
    }

    #[tokio::test]
    async fn stays_closed_on_success() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..20 {
            succeed(&breaker).await;
        }
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn opens_at_failure_ratio_with_min_calls() {
        let breaker = CircuitBreaker::new(fast_config());

        // 4 failures in a row: below min_calls, stays closed.
        for _ in 0..4 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, State::Closed);

        // 5th call reaches min_calls at 100% failure ratio.
        fail(&breaker).await;
        assert_eq!(breaker.state().await, State::Open);
    }

    #[tokio::test]
    async fn mixed_outcomes_open_at_half_window_failed() {
        let breaker = CircuitBreaker::new(fast_config());

        // 6 failures of 10 calls >= 50%.
        for _ in 0..4 {
            succeed(&breaker).await;
        }
        for _ in 0..6 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, State::Open);
    }

    #[tokio::test]
    async fn below_threshold_stays_closed() {
        let breaker = CircuitBreaker::new(fast_config());

        // 4 failures of 10 calls < 50%.
        for _ in 0..6 {
            succeed(&breaker).await;
        }
        for _ in 0..4 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn rejects_without_dispatch_when_open() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..5 {
            fail(&breaker).await;
        }

        let dispatched = std::sync::atomic::AtomicBool::new(false);
        let result = breaker
            .call(|| async {
                dispatched.store(true, Ordering::SeqCst);
                Ok::<_, String>(42)
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Open)));
        assert!(!dispatched.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn closes_after_all_probes_succeed() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..5 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, State::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;

        for _ in 0..3 {
            succeed(&breaker).await;
        }
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn reopens_on_probe_failure() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..5 {
            fail(&breaker).await;
        }

        tokio::time::sleep(Duration::from_millis(150)).await;

        succeed(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state().await, State::Open);
    }

    #[tokio::test]
    async fn half_open_probe_budget_is_enforced() {
        let config = BreakerConfig {
            half_open_probes: 1,
            ..fast_config()
        };
        let breaker = CircuitBreaker::new(config);
        for _ in 0..5 {
            fail(&breaker).await;
        }

        tokio::time::sleep(Duration::from_millis(150)).await;

        // First probe allowed and succeeds with budget 1, closing the circuit.
        succeed(&breaker).await;
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn metrics_track_outcomes() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            succeed(&breaker).await;
        }
        fail(&breaker).await;

        let metrics = breaker.metrics();
        assert_eq!(metrics.total_calls, 4);
        assert_eq!(metrics.total_successes, 3);
        assert_eq!(metrics.total_failures, 1);
    }

    #[tokio::test]
    async fn reset_closes_the_circuit() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..5 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, State::Open);

        breaker.reset().await;
        assert_eq!(breaker.state().await, State::Closed);
    }
}
