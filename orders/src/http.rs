//! HTTP surface of the order service.

use crate::order::{Order, OrderStatus};
use crate::service::{OrderService, OrderServiceError};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use merx_core::event::CancelInitiator;
use merx_core::types::{CustomerId, Money, OrderId, OrderItem, ProductId, Quantity};
use merx_web::error::ValidationError;
use merx_web::{ApiError, health};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Build the order router.
#[must_use]
pub fn router(service: Arc<OrderService>) -> Router {
    Router::new()
        .route("/api/v1/orders", post(create_order))
        .route("/api/v1/orders/:id", get(get_order))
        .route("/api/v1/orders/:id/cancel", post(cancel_order))
        .route("/api/v1/orders/:id/advance", post(advance_order))
        .route("/actuator/health", get(health::health))
        .with_state(service)
}

/// A line item in the create request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemDto {
    /// Product to order.
    pub product_id: ProductId,
    /// Product display name.
    #[serde(default)]
    pub name: String,
    /// Units to order.
    pub quantity: u32,
    /// Price per unit.
    pub unit_price: Money,
}

/// Request to create an order.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    /// Ordering customer.
    pub customer_id: CustomerId,
    /// Items to order.
    pub items: Vec<OrderItemDto>,
    /// Optional shipping address, stored verbatim.
    #[serde(default)]
    pub shipping_address: Option<String>,
}

/// Response after creating an order.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    /// The new order id.
    pub order_id: OrderId,
    /// Initial status (`PENDING`).
    pub status: String,
}

/// Request to cancel an order.
#[derive(Debug, Deserialize)]
pub struct CancelOrderRequest {
    /// Reason for cancellation.
    pub reason: String,
}

/// Request to advance an order (operator endpoint).
#[derive(Debug, Deserialize)]
pub struct AdvanceOrderRequest {
    /// Target status.
    pub status: OrderStatus,
}

/// Full order representation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    /// Order id.
    pub order_id: OrderId,
    /// Ordering customer.
    pub customer_id: CustomerId,
    /// Current status.
    pub status: String,
    /// Ordered items.
    pub items: Vec<OrderItemView>,
    /// Order total.
    pub total_amount: Money,
    /// Cancellation reason, when cancelled or failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_reason: Option<String>,
    /// Creation time (ISO 8601).
    pub created_at: String,
}

/// A line item in responses.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemView {
    /// Product id.
    pub product_id: ProductId,
    /// Product display name.
    pub name: String,
    /// Units ordered.
    pub quantity: u32,
    /// Price per unit.
    pub unit_price: Money,
}

impl From<&Order> for OrderResponse {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id,
            customer_id: order.customer_id,
            status: order.status.to_string(),
            items: order
                .items
                .iter()
                .map(|item| OrderItemView {
                    product_id: item.product_id,
                    name: item.name.clone(),
                    quantity: item.quantity.get(),
                    unit_price: item.unit_price,
                })
                .collect(),
            total_amount: order.total_amount,
            cancelled_reason: order.cancelled_reason.clone(),
            created_at: order.created_at.to_rfc3339(),
        }
    }
}

fn validate_items(items: &[OrderItemDto]) -> Result<(), ApiError> {
    let mut errors = Vec::new();
    if items.is_empty() {
        errors.push(ValidationError {
            field: "items".to_string(),
            message: "must contain at least one item".to_string(),
        });
    }
    for (index, item) in items.iter().enumerate() {
        if item.quantity == 0 {
            errors.push(ValidationError {
                field: format!("items[{index}].quantity"),
                message: "must be positive".to_string(),
            });
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ApiError::validation(errors).with_path("/api/v1/orders"))
    }
}

async fn create_order(
    State(service): State<Arc<OrderService>>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), ApiError> {
    validate_items(&request.items)?;

    let items: Vec<OrderItem> = request
        .items
        .into_iter()
        .map(|item| {
            OrderItem::new(
                item.product_id,
                item.name,
                Quantity::new(item.quantity),
                item.unit_price,
            )
        })
        .collect();

    let order = service
        .create_order(request.customer_id, items)
        .await
        .map_err(|e| service_error(&e, "/api/v1/orders"))?;

    Ok((
        StatusCode::CREATED,
        Json(CreateOrderResponse {
            order_id: order.id,
            status: order.status.to_string(),
        }),
    ))
}

async fn get_order(
    State(service): State<Arc<OrderService>>,
    Path(id): Path<OrderId>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order = service
        .get_order(id)
        .await
        .map_err(|e| service_error(&e, &format!("/api/v1/orders/{id}")))?;
    Ok(Json(OrderResponse::from(&order)))
}

async fn cancel_order(
    State(service): State<Arc<OrderService>>,
    Path(id): Path<OrderId>,
    Json(request): Json<CancelOrderRequest>,
) -> Result<Json<OrderResponse>, ApiError> {
    let path = format!("/api/v1/orders/{id}/cancel");
    if request.reason.trim().is_empty() {
        return Err(ApiError::validation(vec![ValidationError {
            field: "reason".to_string(),
            message: "must not be blank".to_string(),
        }])
        .with_path(path));
    }

    let order = service
        .cancel_order(id, request.reason, CancelInitiator::Customer)
        .await
        .map_err(|e| service_error(&e, &path))?;
    Ok(Json(OrderResponse::from(&order)))
}

async fn advance_order(
    State(service): State<Arc<OrderService>>,
    Path(id): Path<OrderId>,
    Json(request): Json<AdvanceOrderRequest>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order = service
        .advance(id, request.status)
        .await
        .map_err(|e| service_error(&e, &format!("/api/v1/orders/{id}/advance")))?;
    Ok(Json(OrderResponse::from(&order)))
}

fn service_error(err: &OrderServiceError, path: &str) -> ApiError {
    ApiError::from_classified(err).with_path(path)
}
