//! Axum glue: the catch-all proxy handler and the fallback endpoint.

use crate::pipeline::{Gateway, fallback_response};
use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use merx_web::health;
use std::net::SocketAddr;
use std::sync::Arc;

/// Largest request body the gateway will buffer for forwarding.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Build the gateway router: fallback, actuator endpoints and the
/// catch-all proxy.
#[must_use]
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/fallback/:service", any(fallback))
        .route("/actuator/health", get(health::health))
        .fallback(proxy)
        .with_state(gateway)
}

async fn fallback(Path(service): Path<String>) -> Response {
    fallback_response(&service)
}

/// The proxy handler feeding the pipeline.
async fn proxy(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();

    let method = parts.method.as_str().to_string();
    let path = parts.uri.path().to_string();
    let host = parts
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return merx_web::ApiError::bad_request("Request body too large")
                .with_path(path)
                .into_response();
        }
    };

    gateway
        .proxy(
            &method,
            &path,
            host.as_deref(),
            parts.headers,
            body,
            &addr.ip().to_string(),
        )
        .await
}
