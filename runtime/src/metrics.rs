//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for all platform components:
//! - Stock engine mutations and conflicts
//! - Distributed lock acquisitions
//! - Event bus publish/consume and the outbox relay
//! - Gateway requests, rate limiting, circuit breaker, retries
//!
//! # Example
//!
//! ```rust,no_run
//! use merx_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter.
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter.
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping; services
/// also render the handle through their `/actuator/metrics` endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Initialize metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the metrics exporter cannot be installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), the
    /// re-initialization is skipped with a warning. In production, ensure
    /// this is only called once.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            // Latency histogram buckets
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics recorder installed - exposition at /actuator/metrics"
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus exposition format.
    ///
    /// Returns `None` if the recorder hasn't been installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Stock engine
    describe_counter!(
        "stock_mutations_total",
        "Total stock mutations by operation (reserve/release/deduct/adjust/expire)"
    );
    describe_counter!(
        "stock_version_conflicts_total",
        "Optimistic version conflicts detected during stock commits"
    );
    describe_counter!(
        "stock_insufficient_total",
        "Reservation attempts rejected for insufficient stock"
    );
    describe_histogram!(
        "stock_mutation_duration_seconds",
        "Time spent inside the per-product critical section"
    );

    // Distributed lock
    describe_counter!(
        "lock_acquisitions_total",
        "Successful distributed lock acquisitions"
    );
    describe_counter!(
        "lock_timeouts_total",
        "Lock acquisitions abandoned after the wait budget"
    );
    describe_counter!(
        "lock_lost_total",
        "Leases lost while the guarded section was running"
    );
    describe_histogram!(
        "lock_wait_duration_seconds",
        "Time spent waiting to acquire a lock"
    );

    // Event bus / outbox / inbox
    describe_counter!(
        "event_bus_messages_published_total",
        "Total envelopes published to the event bus"
    );
    describe_counter!(
        "event_bus_messages_consumed_total",
        "Total envelopes consumed from the event bus"
    );
    describe_counter!(
        "event_bus_publish_errors_total",
        "Total publish errors"
    );
    describe_counter!(
        "outbox_relayed_total",
        "Outbox rows relayed to the bus"
    );
    describe_counter!(
        "inbox_duplicates_total",
        "Envelopes acknowledged as duplicates by the inbox"
    );
    describe_counter!(
        "dlq_messages_total",
        "Messages dead-lettered after exhausting the retry budget"
    );

    // Gateway
    describe_counter!(
        "gateway_requests_total",
        "Gateway requests by method, route and status"
    );
    describe_histogram!(
        "gateway_request_duration_seconds",
        "Gateway request duration"
    );
    describe_counter!(
        "gateway_slow_requests_total",
        "Gateway requests slower than one second"
    );
    describe_counter!(
        "gateway_rate_limited_total",
        "Requests rejected by the rate limiter"
    );

    // Circuit breaker
    describe_gauge!(
        "circuit_breaker_state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "circuit_breaker_rejections_total",
        "Calls rejected while the circuit was open"
    );

    // Retry
    describe_counter!("retry_attempts_total", "Total retry attempts");
    describe_counter!("retry_successes_total", "Operations that succeeded after retrying");
    describe_counter!("retry_exhausted_total", "Operations that exhausted their retry budget");
}

/// Gateway request metrics recorder.
pub struct GatewayMetrics;

impl GatewayMetrics {
    /// Record a proxied request.
    pub fn record_request(method: &str, route: &str, status: u16, duration: Duration) {
        counter!(
            "gateway_requests_total",
            "method" => method.to_string(),
            "route" => route.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        histogram!("gateway_request_duration_seconds").record(duration.as_secs_f64());
        if duration > Duration::from_secs(1) {
            counter!("gateway_slow_requests_total", "route" => route.to_string()).increment(1);
        }
    }

    /// Record a rate-limited rejection.
    pub fn record_rate_limited(route: &str) {
        counter!("gateway_rate_limited_total", "route" => route.to_string()).increment(1);
    }
}

/// Stock engine metrics recorder.
pub struct StockMetrics;

impl StockMetrics {
    /// Record a stock mutation.
    pub fn record_mutation(operation: &'static str, duration: Duration) {
        counter!("stock_mutations_total", "operation" => operation).increment(1);
        histogram!("stock_mutation_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a version conflict.
    pub fn record_conflict() {
        counter!("stock_version_conflicts_total").increment(1);
    }

    /// Record an insufficient-stock rejection.
    pub fn record_insufficient() {
        counter!("stock_insufficient_total").increment(1);
    }
}

/// Distributed lock metrics recorder.
pub struct LockMetrics;

impl LockMetrics {
    /// Record a successful acquisition and how long it waited.
    pub fn record_acquired(wait: Duration) {
        counter!("lock_acquisitions_total").increment(1);
        histogram!("lock_wait_duration_seconds").record(wait.as_secs_f64());
    }

    /// Record an acquisition timeout.
    pub fn record_timeout() {
        counter!("lock_timeouts_total").increment(1);
    }

    /// Record a lost lease.
    pub fn record_lost() {
        counter!("lock_lost_total").increment(1);
    }
}
