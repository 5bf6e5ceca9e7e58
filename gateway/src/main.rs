//! Gateway binary.
//!
//! Static routes to the order and inventory services, config-driven API
//! keys and bearer verification, Prometheus metrics and the correlation
//! layer.

use anyhow::Context;
use merx_core::config::RateLimitConfig;
use merx_gateway::auth::{ApiKeyTable, Authenticator, JwtVerifier};
use merx_gateway::discovery::{Instance, StaticRegistry};
use merx_gateway::pipeline::{Gateway, ReqwestUpstream, ResiliencePolicies};
use merx_gateway::rate_limit::{InMemoryRateLimitStore, RateLimiter};
use merx_gateway::routes::{Route, RoutePredicate, RouteTable};
use merx_runtime::metrics::MetricsServer;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn route(id: &str, prefix: &str, service: &str) -> Route {
    Route {
        id: id.to_string(),
        predicate: RoutePredicate {
            path_prefix: Some(prefix.to_string()),
            method: None,
            host: None,
        },
        uri: format!("lb://{service}"),
        strip_prefix: None,
        rewrite: None,
        timeout_ms: 3_000,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let listen_addr = env_or("LISTEN_ADDR", "0.0.0.0:8080");
    let metrics_addr = env_or("METRICS_ADDR", "0.0.0.0:9090");
    let orders_upstream = env_or("ORDERS_UPSTREAM", "http://localhost:8082");
    let inventory_upstream = env_or("INVENTORY_UPSTREAM", "http://localhost:8081");

    let table = RouteTable::new(vec![
        route("orders", "/api/v1/orders", "orders"),
        route("inventory", "/api/v1/inventory", "inventory"),
    ]);

    let registry = Arc::new(StaticRegistry::new([
        ("orders".to_string(), vec![Instance::new(orders_upstream)]),
        (
            "inventory".to_string(),
            vec![Instance::new(inventory_upstream)],
        ),
    ]));

    // API keys arrive as NAME=KEY pairs, comma separated.
    let api_keys = std::env::var("API_KEYS").ok().map_or_else(ApiKeyTable::default, |raw| {
        ApiKeyTable::new(raw.split(',').filter_map(|pair| {
            pair.split_once('=')
                .map(|(name, key)| (name.to_string(), key.to_string()))
        }))
    });
    let jwt = std::env::var("JWT_HS256_SECRET").ok().map(|secret| {
        JwtVerifier::new_hmac(
            [(String::new(), secret.into_bytes())],
            &env_or("JWT_ISSUER", "merx"),
        )
    });

    let gateway = Arc::new(Gateway::new(
        table,
        Authenticator::new(api_keys, jwt),
        RateLimiter::new(
            RateLimitConfig::default(),
            Box::new(InMemoryRateLimitStore::new()),
        ),
        registry,
        Arc::new(ReqwestUpstream::new()),
        ResiliencePolicies::default(),
    ));

    let mut metrics_server = MetricsServer::new(metrics_addr.parse().context("metrics address")?);
    metrics_server.start().context("starting metrics recorder")?;
    let metrics_server = Arc::new(metrics_server);

    let app = merx_gateway::handlers::router(gateway)
        .route(
            "/actuator/metrics",
            axum::routing::get({
                let metrics_server = Arc::clone(&metrics_server);
                move || {
                    let metrics_server = Arc::clone(&metrics_server);
                    async move { metrics_server.render().unwrap_or_default() }
                }
            }),
        )
        .layer(merx_web::correlation_id_layer());

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .context("binding listen address")?;
    tracing::info!(addr = %listen_addr, "Gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("serving HTTP")?;

    Ok(())
}
