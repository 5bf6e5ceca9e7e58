//! Error taxonomy shared across services.
//!
//! Domain code signals typed rejections; the web layer maps them to wire
//! errors through one translator keyed on [`ErrorKind`]. Handlers recover
//! only [`ErrorKind::TransientInfra`] locally; everything else bubbles up.

use serde::{Deserialize, Serialize};

/// Classification of every error the platform can surface.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An invariant or precondition rejection (insufficient stock, illegal
    /// transition). Surfaced as 4xx, never retried.
    DomainRejection,
    /// Transient infrastructure fault (version conflict, bus unavailable,
    /// upstream 502/503). Retried with backoff.
    TransientInfra,
    /// A deadline elapsed. Retried only for idempotent work, else 504/408.
    Timeout,
    /// Authentication or authorization failure. 401/403, never retried.
    AuthFailure,
    /// Caller exceeded a rate limit. 429 with retry-after.
    RateLimited,
    /// An invariant broken at the storage layer or other unrecoverable
    /// condition. Surfaced as 500 and logged for the operator.
    Fatal,
}

impl ErrorKind {
    /// Whether errors of this kind may be retried locally.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::TransientInfra)
    }
}

/// Implemented by every error type that crosses a service boundary.
///
/// The translator in the web layer consumes the kind plus a stable error
/// code; services never map their own errors to HTTP statuses.
pub trait Classify {
    /// The taxonomy bucket this error falls into.
    fn kind(&self) -> ErrorKind;

    /// Stable machine-readable code (e.g. `INSUFFICIENT_STOCK`).
    fn code(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retriable() {
        assert!(ErrorKind::TransientInfra.is_retriable());
        assert!(!ErrorKind::DomainRejection.is_retriable());
        assert!(!ErrorKind::Timeout.is_retriable());
        assert!(!ErrorKind::AuthFailure.is_retriable());
        assert!(!ErrorKind::RateLimited.is_retriable());
        assert!(!ErrorKind::Fatal.is_retriable());
    }
}
