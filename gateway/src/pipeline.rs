//! The ordered gateway pipeline.
//!
//! Stage order for every request: correlation (tower layer) → auth extract
//! → rate limit → route match → discovery resolve → circuit breaker →
//! retry → timeout → metrics. Route matching and rewrites are pure; side
//! effects live in rate limiting, discovery and breaking.

use crate::auth::Authenticator;
use crate::discovery::{Instance, RoundRobin, ServiceRegistry};
use crate::rate_limit::RateLimiter;
use crate::routes::{Route, RouteTable};
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use merx_core::config::{BreakerConfig, RetryConfig};
use merx_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use merx_runtime::metrics::GatewayMetrics;
use merx_runtime::retry::RetryPolicy;
use merx_web::ApiError;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;

/// A request on its way upstream.
#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    /// HTTP method.
    pub method: String,
    /// Full URL including the instance base.
    pub url: String,
    /// Headers to forward (correlation id included).
    pub headers: HeaderMap,
    /// Request body.
    pub body: Bytes,
}

/// A response from upstream.
#[derive(Clone, Debug)]
pub struct UpstreamResponse {
    /// HTTP status.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
}

/// Failures of a single upstream attempt.
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// The per-route deadline elapsed.
    #[error("Upstream deadline elapsed")]
    Timeout,

    /// Transport-level failure (connect, TLS, reset).
    #[error("Upstream transport error: {0}")]
    Transport(String),

    /// The upstream answered with a status the gateway treats as a failed
    /// call (502/503).
    #[error("Upstream returned {}", .0.status)]
    FailedStatus(UpstreamResponse),
}

/// One-attempt dispatch seam; `ReqwestUpstream` in production, scripted
/// mocks in tests.
pub trait Upstream: Send + Sync {
    /// Perform one HTTP exchange. Statuses are not interpreted here; the
    /// pipeline classifies them.
    fn send(
        &self,
        request: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamError>> + Send + '_>>;
}

/// reqwest-backed upstream client.
pub struct ReqwestUpstream {
    client: reqwest::Client,
}

impl Default for ReqwestUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestUpstream {
    /// Create a client with connection pooling.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Upstream for ReqwestUpstream {
    fn send(
        &self,
        request: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamError>> + Send + '_>> {
        Box::pin(async move {
            let method = reqwest::Method::from_bytes(request.method.as_bytes())
                .map_err(|e| UpstreamError::Transport(e.to_string()))?;

            let mut builder = self.client.request(method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            let response = builder
                .body(request.body.to_vec())
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        UpstreamError::Timeout
                    } else {
                        UpstreamError::Transport(e.to_string())
                    }
                })?;

            let status = response.status().as_u16();
            let mut headers = HeaderMap::new();
            for (name, value) in response.headers() {
                headers.insert(name.clone(), value.clone());
            }
            let body = response
                .bytes()
                .await
                .map_err(|e| UpstreamError::Transport(e.to_string()))?;

            Ok(UpstreamResponse {
                status,
                headers,
                body,
            })
        })
    }
}

/// Per-service breaker and retry tuning with defaults.
#[derive(Default)]
pub struct ResiliencePolicies {
    /// Breaker override per service name.
    pub breakers: HashMap<String, BreakerConfig>,
    /// Retry override per service name.
    pub retries: HashMap<String, RetryConfig>,
    /// Fallback breaker tuning.
    pub default_breaker: BreakerConfig,
    /// Fallback retry policy.
    pub default_retry: RetryConfig,
}

impl ResiliencePolicies {
    fn breaker_for(&self, service: &str) -> BreakerConfig {
        self.breakers.get(service).copied().unwrap_or(self.default_breaker)
    }

    fn retry_for(&self, service: &str) -> &RetryConfig {
        self.retries.get(service).unwrap_or(&self.default_retry)
    }
}

/// The assembled gateway pipeline.
pub struct Gateway {
    table: RouteTable,
    auth: Authenticator,
    limiter: RateLimiter,
    registry: Arc<dyn ServiceRegistry>,
    picker: RoundRobin,
    upstream: Arc<dyn Upstream>,
    policies: ResiliencePolicies,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl Gateway {
    /// Assemble the pipeline.
    #[must_use]
    pub fn new(
        table: RouteTable,
        auth: Authenticator,
        limiter: RateLimiter,
        registry: Arc<dyn ServiceRegistry>,
        upstream: Arc<dyn Upstream>,
        policies: ResiliencePolicies,
    ) -> Self {
        Self {
            table,
            auth,
            limiter,
            registry,
            picker: RoundRobin::new(),
            upstream,
            policies,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// The rate limiter (backpressure hook access).
    #[must_use]
    pub const fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run one request through the pipeline.
    pub async fn proxy(
        &self,
        method: &str,
        path: &str,
        host: Option<&str>,
        headers: HeaderMap,
        body: Bytes,
        client_ip: &str,
    ) -> Response {
        let started = Instant::now();

        // Auth extract.
        let principal = match self.auth.authenticate(&headers) {
            Ok(principal) => principal,
            Err(err) => {
                let response = ApiError::from_classified(&err).with_path(path).into_response();
                GatewayMetrics::record_request(method, "unmatched", response.status().as_u16(), started.elapsed());
                return response;
            }
        };

        // Route match (pure, first predicate wins).
        let Some(route) = self.table.match_route(method, path, host) else {
            let response = ApiError::new(
                StatusCode::NOT_FOUND,
                format!("No route matches {method} {path}"),
                "NO_ROUTE",
            )
            .with_path(path)
            .into_response();
            GatewayMetrics::record_request(method, "unmatched", 404, started.elapsed());
            return response;
        };

        // Rate limit.
        let identity = principal.identity_key(client_ip);
        let decision = match self.limiter.check(&route.id, &identity).await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::error!(error = %err, "Rate limit store failure, failing closed");
                let response = ApiError::unavailable("Rate limiter unavailable")
                    .with_path(path)
                    .into_response();
                GatewayMetrics::record_request(method, &route.id, 503, started.elapsed());
                return response;
            }
        };
        if !decision.allowed {
            GatewayMetrics::record_rate_limited(&route.id);
            let response = ApiError::too_many_requests(1).with_path(path).into_response();
            GatewayMetrics::record_request(method, &route.id, 429, started.elapsed());
            return response;
        }

        // Discovery resolve.
        let Some(service) = route.service_name() else {
            let response = ApiError::internal(format!("Route {} has a non-lb target", route.id))
                .with_path(path)
                .into_response();
            GatewayMetrics::record_request(method, &route.id, 500, started.elapsed());
            return response;
        };
        let instances = self.registry.instances(service).await;
        if instances.iter().all(|i| i.weight == 0) {
            let response = fallback_response(service);
            GatewayMetrics::record_request(method, &route.id, 503, started.elapsed());
            return response;
        }

        // Breaker → retry → timeout.
        let mut response =
            match self.dispatch(route, service, &instances, method, path, &headers, body).await {
                DispatchOutcome::Response(upstream) => upstream_to_response(upstream),
                DispatchOutcome::CircuitOpen => fallback_response(service),
                DispatchOutcome::Timeout => ApiError::gateway_timeout(format!(
                    "Upstream {service} did not answer within {}ms",
                    route.timeout().as_millis()
                ))
                .with_path(path)
                .into_response(),
                DispatchOutcome::Transport(reason) => ApiError::new(
                    StatusCode::BAD_GATEWAY,
                    format!("Upstream {service} unreachable: {reason}"),
                    "BAD_GATEWAY",
                )
                .with_path(path)
                .into_response(),
            };

        // Rate-limit headers on pass-through.
        let (rate, bucket) = self.limiter.params_for(&route.id);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let replenish_rate = rate as u64;
        if let Ok(value) = HeaderValue::from_str(&replenish_rate.to_string()) {
            response.headers_mut().insert("X-Rate-Limit-Replenish-Rate", value);
        }
        if let Ok(value) = HeaderValue::from_str(&bucket.burst_capacity.to_string()) {
            response.headers_mut().insert("X-Rate-Limit-Burst-Capacity", value);
        }

        GatewayMetrics::record_request(method, &route.id, response.status().as_u16(), started.elapsed());
        response
    }

    /// Breaker-guarded, retry-wrapped, deadline-bounded dispatch.
    ///
    /// Each attempt is one breaker sample, so timeouts and 502/503 answers
    /// trip the window exactly as they occur; an open circuit short-cuts
    /// to the fallback without dispatch.
    async fn dispatch(
        &self,
        route: &Route,
        service: &str,
        instances: &[Instance],
        method: &str,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> DispatchOutcome {
        let breaker = self.breaker_for(route, service);
        let retry = self.policies.retry_for(service);
        let policy = RetryPolicy::from_config(retry);
        let max_attempts = retry.attempts.max(1);

        let mut attempt = 0u32;
        loop {
            attempt += 1;

            let request = match self.build_request(route, instances, method, path, headers, &body) {
                Some(request) => request,
                None => return DispatchOutcome::CircuitOpen,
            };
            let deadline = route.timeout();

            let result = breaker
                .call(|| async {
                    match tokio::time::timeout(deadline, self.upstream.send(request)).await {
                        Ok(Ok(response)) if matches!(response.status, 502 | 503) => {
                            Err(UpstreamError::FailedStatus(response))
                        }
                        Ok(Ok(response)) => Ok(response),
                        Ok(Err(err)) => Err(err),
                        Err(_) => Err(UpstreamError::Timeout),
                    }
                })
                .await;

            match result {
                Ok(response) => return DispatchOutcome::Response(response),
                Err(CircuitBreakerError::Open) => return DispatchOutcome::CircuitOpen,
                Err(CircuitBreakerError::Inner(UpstreamError::FailedStatus(response))) => {
                    if attempt < max_attempts && retry.allows(method, response.status) {
                        let delay = policy.delay_for_attempt(usize::try_from(attempt - 1).unwrap_or(0));
                        tracing::debug!(
                            route = %route.id,
                            attempt,
                            status = response.status,
                            delay_ms = delay.as_millis(),
                            "Retrying idempotent request"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return DispatchOutcome::Response(response);
                }
                Err(CircuitBreakerError::Inner(UpstreamError::Timeout)) => {
                    return DispatchOutcome::Timeout;
                }
                Err(CircuitBreakerError::Inner(UpstreamError::Transport(reason))) => {
                    return DispatchOutcome::Transport(reason);
                }
            }
        }
    }

    fn build_request(
        &self,
        route: &Route,
        instances: &[Instance],
        method: &str,
        path: &str,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Option<UpstreamRequest> {
        let instance = self.picker.pick(instances)?;
        let rewritten = route.rewritten_path(path);
        Some(UpstreamRequest {
            method: method.to_string(),
            url: format!("{}{rewritten}", instance.base_url),
            headers: headers.clone(),
            body: body.clone(),
        })
    }

    /// Per-route breaker, created lazily from the service's tuning.
    fn breaker_for(&self, route: &Route, service: &str) -> CircuitBreaker {
        let mut breakers = match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        breakers
            .entry(route.id.clone())
            .or_insert_with(|| CircuitBreaker::new(self.policies.breaker_for(service)))
            .clone()
    }
}

enum DispatchOutcome {
    Response(UpstreamResponse),
    CircuitOpen,
    Timeout,
    Transport(String),
}

/// The `/fallback/<service>` response.
#[must_use]
pub fn fallback_response(service: &str) -> Response {
    ApiError::unavailable(format!("Service {service} is unavailable"))
        .with_path(format!("/fallback/{service}"))
        .into_response()
}

fn upstream_to_response(upstream: UpstreamResponse) -> Response {
    let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(axum::body::Body::from(upstream.body));
    *response.status_mut() = status;
    *response.headers_mut() = upstream.headers;
    response
}
