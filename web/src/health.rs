//! Actuator-style health endpoint shared by every service.

use axum::Json;
use serde::Serialize;

/// Health response body.
#[derive(Debug, Serialize)]
pub struct Health {
    /// `UP` when the service is serving.
    pub status: &'static str,
}

/// `GET /actuator/health` handler.
pub async fn health() -> Json<Health> {
    Json(Health { status: "UP" })
}
