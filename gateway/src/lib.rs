//! # Merx Gateway
//!
//! The front gateway: multiplexes client traffic across the platform's
//! services with an ordered filter pipeline.
//!
//! ## Pipeline
//!
//! 1. **Correlation**: ensure `X-Correlation-ID` (shared tower layer)
//! 2. **Auth extract**: API key table or bearer-token verification
//! 3. **Rate limit**: token bucket per caller identity, per-route tuning,
//!    429 + `X-Rate-Limit-Retry-After` when empty
//! 4. **Route match**: first predicate wins over the static table
//! 5. **Discovery resolve**: `lb://<service>` to an instance via
//!    health-weighted round-robin; no instances → `/fallback/<service>`
//! 6. **Circuit breaker**: per route, sliding window; open → fallback
//!    without dispatch
//! 7. **Retry**: idempotent methods on 502/503 only, bounded backoff
//! 8. **Timeout**: per-route deadline mapping to 504, counted as a
//!    breaker failure
//! 9. **Metrics**: `{method, route, status}` counter, duration histogram,
//!    slow-call counter

pub mod auth;
pub mod discovery;
pub mod handlers;
pub mod pipeline;
pub mod rate_limit;
pub mod routes;

pub use auth::{Authenticator, Principal};
pub use pipeline::{Gateway, ResiliencePolicies, Upstream};
pub use rate_limit::RateLimiter;
pub use routes::{Route, RoutePredicate, RouteTable};
