//! HTTP surface of the inventory service.
//!
//! Read endpoints serve possibly-stale snapshots without taking the product
//! lock; the authoritative store is only consulted under the lock for
//! mutations. The `/admin/dlq` endpoints are the operator workflow over the
//! dead-letter table: list, resolve, discard, status transitions.

use crate::engine::{EngineError, StockEngine};
use crate::product::Product;
use crate::store::ProductStore;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use merx_core::types::{ProductId, Quantity};
use merx_postgres::dead_letter_queue::{DeadLetterQueue, DlqError, DlqStatus, FailedEvent};
use merx_web::error::ValidationError;
use merx_web::{ApiError, health};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared state of the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    /// The stock engine.
    pub engine: Arc<StockEngine>,
    /// The product store (admin creation, snapshots).
    pub store: Arc<dyn ProductStore>,
    /// The dead-letter table, when the service runs over Postgres.
    pub dlq: Option<Arc<DeadLetterQueue>>,
}

/// Build the inventory router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/inventory/products", post(create_product))
        .route("/api/v1/inventory/products/:id/stock", get(get_stock))
        .route(
            "/api/v1/inventory/products/:id/stock/adjust",
            post(adjust_stock),
        )
        .route("/admin/dlq", get(list_dead_letters))
        .route("/admin/dlq/:id/resolve", post(resolve_dead_letter))
        .route("/admin/dlq/:id/discard", post(discard_dead_letter))
        .route("/admin/dlq/:id/status", post(set_dead_letter_status))
        .route("/actuator/health", get(health::health))
        .with_state(state)
}

/// Request to create a product administratively.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProductRequest {
    /// Display name.
    pub name: String,
    /// Initial available quantity.
    pub initial_quantity: u32,
    /// Low-stock alert threshold.
    #[serde(default)]
    pub low_stock_threshold: u32,
}

/// Response after creating a product.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProductResponse {
    /// The new product id.
    pub product_id: ProductId,
}

/// Stock snapshot response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockResponse {
    /// Units free to reserve.
    pub available_quantity: u32,
    /// Units held by active reservations.
    pub reserved_quantity: u32,
    /// Total on the ledger.
    pub total_quantity: u32,
}

impl From<&Product> for StockResponse {
    fn from(product: &Product) -> Self {
        Self {
            available_quantity: product.stock.available.get(),
            reserved_quantity: product.stock.reserved.get(),
            total_quantity: product.stock.total().get(),
        }
    }
}

/// Request to adjust the total stock level.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustStockRequest {
    /// New total quantity.
    pub new_total_quantity: u32,
    /// Operator-provided reason for the audit ledger.
    pub reason: String,
}

async fn create_product(
    State(state): State<AppState>,
    Json(request): Json<CreateProductRequest>,
) -> Result<(StatusCode, Json<CreateProductResponse>), ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::validation(vec![ValidationError {
            field: "name".to_string(),
            message: "must not be blank".to_string(),
        }])
        .with_path("/api/v1/inventory/products"));
    }

    let product = Product::new(
        ProductId::new(),
        request.name,
        Quantity::new(request.initial_quantity),
        Quantity::new(request.low_stock_threshold),
    );
    let product_id = product.id;

    state
        .store
        .insert(product)
        .await
        .map_err(|e| engine_error(EngineError::Store(e), "/api/v1/inventory/products"))?;

    Ok((
        StatusCode::CREATED,
        Json(CreateProductResponse { product_id }),
    ))
}

async fn get_stock(
    State(state): State<AppState>,
    Path(id): Path<ProductId>,
) -> Result<Json<StockResponse>, ApiError> {
    let path = format!("/api/v1/inventory/products/{id}/stock");
    let product = state
        .engine
        .snapshot(id)
        .await
        .map_err(|e| engine_error(e, &path))?;
    Ok(Json(StockResponse::from(&product)))
}

async fn adjust_stock(
    State(state): State<AppState>,
    Path(id): Path<ProductId>,
    Json(request): Json<AdjustStockRequest>,
) -> Result<Json<StockResponse>, ApiError> {
    let path = format!("/api/v1/inventory/products/{id}/stock/adjust");
    if request.reason.trim().is_empty() {
        return Err(ApiError::validation(vec![ValidationError {
            field: "reason".to_string(),
            message: "must not be blank".to_string(),
        }])
        .with_path(path));
    }

    state
        .engine
        .adjust(id, Quantity::new(request.new_total_quantity), request.reason)
        .await
        .map_err(|e| engine_error(e, &path))?;

    let product = state
        .engine
        .snapshot(id)
        .await
        .map_err(|e| engine_error(e, &path))?;
    Ok(Json(StockResponse::from(&product)))
}

/// One dead-letter entry as the admin API shows it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterView {
    /// DLQ entry id.
    pub id: i64,
    /// Topic the envelope originally arrived on.
    pub topic: String,
    /// The failed envelope's event id.
    pub event_id: uuid::Uuid,
    /// The failed envelope's event type.
    pub event_type: String,
    /// Stable error class.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    /// Human-readable error message.
    pub error_message: String,
    /// Retries attempted before giving up.
    pub retry_count: i32,
    /// When the message first failed (ISO 8601).
    pub first_failed_at: String,
    /// Current status.
    pub status: String,
}

impl From<&FailedEvent> for DeadLetterView {
    fn from(entry: &FailedEvent) -> Self {
        Self {
            id: entry.id,
            topic: entry.topic.clone(),
            event_id: entry.envelope.event_id,
            event_type: entry.envelope.event_type.clone(),
            error_class: entry.error_details.clone(),
            error_message: entry.error_message.clone(),
            retry_count: entry.retry_count,
            first_failed_at: entry.first_failed_at.to_rfc3339(),
            status: entry.status.as_str().to_string(),
        }
    }
}

/// Response of the dead-letter listing.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterListResponse {
    /// Total pending entries.
    pub pending: i64,
    /// Oldest pending entries, FIFO.
    pub entries: Vec<DeadLetterView>,
}

/// Request to resolve a dead-letter entry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveDeadLetterRequest {
    /// Who resolved it.
    pub resolved_by: String,
    /// Resolution notes.
    #[serde(default)]
    pub notes: Option<String>,
}

/// Request to discard a dead-letter entry.
#[derive(Debug, Deserialize)]
pub struct DiscardDeadLetterRequest {
    /// Why the entry cannot be fixed.
    pub reason: String,
}

/// Request to move a dead-letter entry to a new status.
#[derive(Debug, Deserialize)]
pub struct DeadLetterStatusRequest {
    /// Target status (`pending`, `processing`, `resolved`, `discarded`).
    pub status: String,
}

fn dlq_of(state: &AppState, path: &str) -> Result<Arc<DeadLetterQueue>, ApiError> {
    state.dlq.clone().ok_or_else(|| {
        ApiError::unavailable("Dead letter queue is not configured").with_path(path)
    })
}

fn dlq_error(err: &DlqError, path: &str) -> ApiError {
    match err {
        DlqError::InvalidStatus(status) => {
            ApiError::bad_request(format!("Invalid DLQ status: {status}")).with_path(path)
        }
        DlqError::Database(_) => ApiError::internal("Dead letter queue query failed")
            .with_source(anyhow::anyhow!(err.to_string()))
            .with_path(path),
    }
}

async fn list_dead_letters(
    State(state): State<AppState>,
) -> Result<Json<DeadLetterListResponse>, ApiError> {
    let path = "/admin/dlq";
    let dlq = dlq_of(&state, path)?;

    let pending = dlq.count_pending().await.map_err(|e| dlq_error(&e, path))?;
    let entries = dlq
        .list_pending(100)
        .await
        .map_err(|e| dlq_error(&e, path))?;

    Ok(Json(DeadLetterListResponse {
        pending,
        entries: entries.iter().map(DeadLetterView::from).collect(),
    }))
}

async fn resolve_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<ResolveDeadLetterRequest>,
) -> Result<StatusCode, ApiError> {
    let path = format!("/admin/dlq/{id}/resolve");
    let dlq = dlq_of(&state, &path)?;

    dlq.mark_resolved(id, &request.resolved_by, request.notes.as_deref())
        .await
        .map_err(|e| dlq_error(&e, &path))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn discard_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<DiscardDeadLetterRequest>,
) -> Result<StatusCode, ApiError> {
    let path = format!("/admin/dlq/{id}/discard");
    let dlq = dlq_of(&state, &path)?;

    dlq.mark_discarded(id, &request.reason)
        .await
        .map_err(|e| dlq_error(&e, &path))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_dead_letter_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<DeadLetterStatusRequest>,
) -> Result<StatusCode, ApiError> {
    let path = format!("/admin/dlq/{id}/status");
    let dlq = dlq_of(&state, &path)?;

    let status = DlqStatus::parse(&request.status).map_err(|e| dlq_error(&e, &path))?;
    dlq.update_status(id, status)
        .await
        .map_err(|e| dlq_error(&e, &path))?;
    Ok(StatusCode::NO_CONTENT)
}

fn engine_error(err: EngineError, path: &str) -> ApiError {
    ApiError::from_classified(&err).with_path(path)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use crate::store::InMemoryProductStore;
    use axum::body::Body;
    use axum::http::Request;
    use merx_core::clock::SystemClock;
    use merx_core::config::{LockConfig, ReservationConfig};
    use merx_lock::LockManager;
    use merx_lock::store::InMemoryLockStore;
    use tower::ServiceExt;

    fn state() -> AppState {
        let store = Arc::new(InMemoryProductStore::new());
        let locks = Arc::new(LockManager::new(
            LockConfig::default(),
            Arc::new(InMemoryLockStore::new()),
        ));
        let engine = Arc::new(StockEngine::new(
            Arc::clone(&store) as Arc<dyn ProductStore>,
            locks,
            Arc::new(SystemClock),
            ReservationConfig::default(),
        ));
        AppState {
            engine,
            store: store as Arc<dyn ProductStore>,
            dlq: None,
        }
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn create_then_read_stock() {
        let app = router(state());

        let create = Request::builder()
            .method("POST")
            .uri("/api/v1/inventory/products")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"name":"Widget","initialQuantity":25,"lowStockThreshold":5}"#,
            ))
            .unwrap();
        let response = app.clone().oneshot(create).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        let product_id = body["productId"].as_str().unwrap().to_string();

        let read = Request::builder()
            .uri(format!("/api/v1/inventory/products/{product_id}/stock"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(read).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["availableQuantity"], 25);
        assert_eq!(body["reservedQuantity"], 0);
        assert_eq!(body["totalQuantity"], 25);
    }

    #[tokio::test]
    async fn unknown_product_is_404_with_uniform_body() {
        let app = router(state());
        let id = ProductId::new();

        let read = Request::builder()
            .uri(format!("/api/v1/inventory/products/{id}/stock"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(read).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["errorCode"], "PRODUCT_NOT_FOUND");
        assert!(body.get("timestamp").is_some());
    }

    #[tokio::test]
    async fn dlq_admin_is_unavailable_without_postgres() {
        let app = router(state());
        let request = Request::builder()
            .uri("/admin/dlq")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["errorCode"], "SERVICE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn adjust_requires_reason() {
        let app = router(state());
        let id = ProductId::new();

        let adjust = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/inventory/products/{id}/stock/adjust"))
            .header("content-type", "application/json")
            .body(Body::from(r#"{"newTotalQuantity":10,"reason":"  "}"#))
            .unwrap();
        let response = app.oneshot(adjust).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["validationErrors"][0]["field"], "reason");
    }
}
