//! The static route table.
//!
//! Predicates and rewrites are pure functions of the request line and host;
//! all side effects (rate limiting, discovery, breaking) happen in later
//! pipeline stages. First matching route wins.

use serde::Deserialize;

/// Matching condition of a route. Unset fields match anything.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePredicate {
    /// Path prefix, e.g. `/api/v1/orders`.
    #[serde(default)]
    pub path_prefix: Option<String>,
    /// HTTP method, e.g. `POST`.
    #[serde(default)]
    pub method: Option<String>,
    /// Host header, exact match.
    #[serde(default)]
    pub host: Option<String>,
}

impl RoutePredicate {
    /// Whether the request line and host satisfy this predicate.
    #[must_use]
    pub fn matches(&self, method: &str, path: &str, host: Option<&str>) -> bool {
        if let Some(prefix) = &self.path_prefix {
            if !path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(expected) = &self.method {
            if !expected.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if let Some(expected) = &self.host {
            if host != Some(expected.as_str()) {
                return false;
            }
        }
        true
    }
}

/// One route of the table.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Route id (rate-limit overrides, breaker and metrics key).
    pub id: String,
    /// Matching condition.
    pub predicate: RoutePredicate,
    /// Target in `lb://<service>` form.
    pub uri: String,
    /// Strip this prefix off the path before forwarding.
    #[serde(default)]
    pub strip_prefix: Option<String>,
    /// Rewrite `(from, to)` applied after stripping.
    #[serde(default)]
    pub rewrite: Option<(String, String)>,
    /// Per-route upstream deadline in milliseconds (default 3000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

const fn default_timeout_ms() -> u64 {
    3_000
}

impl Route {
    /// The `lb://` service name this route targets.
    #[must_use]
    pub fn service_name(&self) -> Option<&str> {
        self.uri.strip_prefix("lb://")
    }

    /// Apply the strip/rewrite filters. Pure function of the path.
    #[must_use]
    pub fn rewritten_path(&self, path: &str) -> String {
        let stripped = match &self.strip_prefix {
            Some(prefix) => path.strip_prefix(prefix.as_str()).unwrap_or(path),
            None => path,
        };
        let rewritten = match &self.rewrite {
            Some((from, to)) => stripped.replacen(from.as_str(), to, 1),
            None => stripped.to_string(),
        };
        if rewritten.starts_with('/') {
            rewritten
        } else {
            format!("/{rewritten}")
        }
    }

    /// Upstream deadline for this route.
    #[must_use]
    pub const fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

/// Ordered route table; first predicate wins.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Create a table from ordered routes.
    #[must_use]
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// First route matching the request, if any.
    #[must_use]
    pub fn match_route(&self, method: &str, path: &str, host: Option<&str>) -> Option<&Route> {
        self.routes
            .iter()
            .find(|route| route.predicate.matches(method, path, host))
    }
}
