//! The domain event contract shared by every Merx service.
//!
//! Events cross service boundaries as JSON envelopes. The envelope carries
//! identity and routing metadata; the payload is a tagged union discriminated
//! by the `@type` field, which is the single source of truth for polymorphic
//! dispatch. Deserializers reject unknown tags rather than guessing.
//!
//! # Wire format
//!
//! ```json
//! {
//!   "eventId": "5c3a…",
//!   "eventType": "StockReservedEvent",
//!   "timestamp": "2025-01-01T00:00:00Z",
//!   "version": 1,
//!   "aggregateId": "…",
//!   "payload": { "@type": "StockReservedEvent", "orderId": "…", … }
//! }
//! ```
//!
//! # Delivery semantics
//!
//! Events are persisted to the emitting service's outbox in the same
//! transaction as the state change, then relayed to the bus. Delivery is
//! at-least-once; consumers dedup on `event_id` via their inbox.

use crate::types::{CustomerId, Money, OrderId, OrderItem, ProductId, Quantity, ReservationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Contractual topic names.
pub mod topics {
    /// Stock reserved for an order.
    pub const STOCK_RESERVED: &str = "inventory.stock.reserved";
    /// Reservation released back to available stock.
    pub const STOCK_RELEASED: &str = "inventory.stock.released";
    /// Reservation confirmed and deducted.
    pub const STOCK_DEDUCTED: &str = "inventory.stock.deducted";
    /// Administrative total adjustment.
    pub const STOCK_ADJUSTED: &str = "inventory.stock.adjusted";
    /// Available stock at or below the configured threshold.
    pub const LOW_STOCK: &str = "inventory.alerts.low-stock";
    /// A batch reservation could not be fully satisfied.
    pub const INSUFFICIENT_STOCK: &str = "inventory.alerts.insufficient-stock";
    /// Order created, awaiting reservation.
    pub const ORDER_CREATED: &str = "order.created";
    /// Order confirmed after successful reservation.
    pub const ORDER_CONFIRMED: &str = "order.confirmed";
    /// Order paid.
    pub const ORDER_PAID: &str = "order.paid";
    /// Order cancelled (carries compensations).
    pub const ORDER_CANCELLED: &str = "order.cancelled";
    /// Order completed.
    pub const ORDER_COMPLETED: &str = "order.completed";
    /// Payment settled by the payment service.
    pub const PAYMENT_COMPLETED: &str = "payment.completed";
    /// Payment declined by the payment service.
    pub const PAYMENT_FAILED: &str = "payment.failed";

    /// Dead-letter topic for a given topic.
    #[must_use]
    pub fn dlq(topic: &str) -> String {
        format!("{topic}-dlq")
    }
}

/// Errors from envelope encoding and decoding.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize an envelope to JSON.
    #[error("Failed to serialize event: {0}")]
    Serialization(String),

    /// Failed to deserialize an envelope, including unknown `@type` tags.
    #[error("Failed to deserialize event: {0}")]
    Deserialization(String),
}

/// Why a reservation was released.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// The owning order was cancelled.
    Cancelled,
    /// The reservation TTL elapsed before confirmation.
    Expired,
    /// Compensation after a downstream failure (e.g. payment).
    Compensation,
    /// Rollback of a partially reserved batch.
    BatchRollback,
}

/// A reservation reference carried inside batch events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationRef {
    /// Product the reservation belongs to.
    pub product_id: ProductId,
    /// The reservation id.
    pub reservation_id: ReservationId,
    /// Reserved units.
    pub quantity: Quantity,
}

/// Per-item detail of a failed batch reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedItem {
    /// Product that could not be reserved.
    pub product_id: ProductId,
    /// Units requested.
    pub requested: Quantity,
    /// Units available at the time of the attempt, when known.
    pub available: Option<Quantity>,
}

/// Who initiated an order cancellation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelInitiator {
    /// The customer asked for the cancellation (window-checked).
    Customer,
    /// The platform cancelled the order (compensation path).
    System,
}

/// A compensating action attached to a cancellation event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Compensation {
    /// The compensating action to perform.
    pub action: CompensationAction,
    /// The service expected to perform it.
    pub target: String,
    /// Reservations to act on, keyed by product.
    pub data: BTreeMap<ProductId, ReservationId>,
}

/// Kinds of compensating actions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationAction {
    /// Release previously reserved stock.
    StockRelease,
}

/// All domain events exchanged over the bus, discriminated by `@type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@type")]
pub enum DomainEvent {
    /// All items of an order were reserved.
    #[serde(rename = "StockReservedEvent", rename_all = "camelCase")]
    StockReserved {
        /// Order the batch belongs to.
        order_id: OrderId,
        /// One entry per reserved item.
        reservations: Vec<ReservationRef>,
        /// When the reservations expire unless confirmed.
        expires_at: DateTime<Utc>,
    },

    /// A reservation was released back to available stock.
    #[serde(rename = "StockReleasedEvent", rename_all = "camelCase")]
    StockReleased {
        /// Product the reservation belonged to.
        product_id: ProductId,
        /// The released reservation.
        reservation_id: ReservationId,
        /// Released units.
        quantity: Quantity,
        /// Why it was released.
        reason: ReleaseReason,
    },

    /// A reservation was confirmed and its units left the ledger.
    #[serde(rename = "StockDeductedEvent", rename_all = "camelCase")]
    StockDeducted {
        /// Product the reservation belonged to.
        product_id: ProductId,
        /// The confirmed reservation.
        reservation_id: ReservationId,
        /// Deducted units.
        quantity: Quantity,
    },

    /// Administrative adjustment of the total stock level.
    #[serde(rename = "StockAdjustedEvent", rename_all = "camelCase")]
    StockAdjusted {
        /// Product that was adjusted.
        product_id: ProductId,
        /// New total (available + reserved).
        new_total: Quantity,
        /// Operator-provided reason.
        reason: String,
    },

    /// Available stock crossed the low-stock threshold.
    #[serde(rename = "LowStockAlertEvent", rename_all = "camelCase")]
    LowStockAlert {
        /// Product below threshold.
        product_id: ProductId,
        /// Available units at alert time.
        available: Quantity,
        /// Configured threshold.
        threshold: Quantity,
    },

    /// A batch reservation failed; nothing stays reserved.
    #[serde(rename = "InsufficientStockEvent", rename_all = "camelCase")]
    InsufficientStock {
        /// Order whose batch failed.
        order_id: OrderId,
        /// Per-item failure detail.
        failed_items: Vec<FailedItem>,
    },

    /// A new order was created and awaits reservation.
    #[serde(rename = "OrderCreatedEvent", rename_all = "camelCase")]
    OrderCreated {
        /// The new order.
        order_id: OrderId,
        /// Ordering customer.
        customer_id: CustomerId,
        /// Ordered items.
        items: Vec<OrderItem>,
    },

    /// An order was confirmed after its stock was reserved.
    #[serde(rename = "OrderConfirmedEvent", rename_all = "camelCase")]
    OrderConfirmed {
        /// The confirmed order.
        order_id: OrderId,
    },

    /// An order was paid.
    #[serde(rename = "OrderPaidEvent", rename_all = "camelCase")]
    OrderPaid {
        /// The paid order.
        order_id: OrderId,
        /// Payment processor transaction id.
        transaction_id: String,
    },

    /// An order was cancelled; compensations describe the rollback.
    #[serde(rename = "OrderCancelledEvent", rename_all = "camelCase")]
    OrderCancelled {
        /// The cancelled order.
        order_id: OrderId,
        /// Cancellation reason.
        reason: String,
        /// Who initiated the cancellation.
        initiator: CancelInitiator,
        /// Compensating actions for downstream services.
        compensations: Vec<Compensation>,
    },

    /// An order reached its terminal successful state.
    #[serde(rename = "OrderCompletedEvent", rename_all = "camelCase")]
    OrderCompleted {
        /// The completed order.
        order_id: OrderId,
    },

    /// The payment service settled a payment.
    #[serde(rename = "PaymentCompletedEvent", rename_all = "camelCase")]
    PaymentCompleted {
        /// Order the payment belongs to.
        order_id: OrderId,
        /// Payment processor transaction id.
        transaction_id: String,
        /// Settled amount.
        amount: Money,
    },

    /// The payment service declined a payment.
    #[serde(rename = "PaymentFailedEvent", rename_all = "camelCase")]
    PaymentFailed {
        /// Order the payment belongs to.
        order_id: OrderId,
        /// Decline reason.
        reason: String,
    },
}

impl DomainEvent {
    /// Stable `@type` discriminator for this event.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::StockReserved { .. } => "StockReservedEvent",
            Self::StockReleased { .. } => "StockReleasedEvent",
            Self::StockDeducted { .. } => "StockDeductedEvent",
            Self::StockAdjusted { .. } => "StockAdjustedEvent",
            Self::LowStockAlert { .. } => "LowStockAlertEvent",
            Self::InsufficientStock { .. } => "InsufficientStockEvent",
            Self::OrderCreated { .. } => "OrderCreatedEvent",
            Self::OrderConfirmed { .. } => "OrderConfirmedEvent",
            Self::OrderPaid { .. } => "OrderPaidEvent",
            Self::OrderCancelled { .. } => "OrderCancelledEvent",
            Self::OrderCompleted { .. } => "OrderCompletedEvent",
            Self::PaymentCompleted { .. } => "PaymentCompletedEvent",
            Self::PaymentFailed { .. } => "PaymentFailedEvent",
        }
    }

    /// Contractual topic this event is published to.
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::StockReserved { .. } => topics::STOCK_RESERVED,
            Self::StockReleased { .. } => topics::STOCK_RELEASED,
            Self::StockDeducted { .. } => topics::STOCK_DEDUCTED,
            Self::StockAdjusted { .. } => topics::STOCK_ADJUSTED,
            Self::LowStockAlert { .. } => topics::LOW_STOCK,
            Self::InsufficientStock { .. } => topics::INSUFFICIENT_STOCK,
            Self::OrderCreated { .. } => topics::ORDER_CREATED,
            Self::OrderConfirmed { .. } => topics::ORDER_CONFIRMED,
            Self::OrderPaid { .. } => topics::ORDER_PAID,
            Self::OrderCancelled { .. } => topics::ORDER_CANCELLED,
            Self::OrderCompleted { .. } => topics::ORDER_COMPLETED,
            Self::PaymentCompleted { .. } => topics::PAYMENT_COMPLETED,
            Self::PaymentFailed { .. } => topics::PAYMENT_FAILED,
        }
    }
}

/// Envelope wrapping a [`DomainEvent`] on the wire.
///
/// `event_id` is globally unique and is the consumer-side idempotency key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Globally unique event id (idempotency key).
    pub event_id: Uuid,
    /// Duplicate of the payload's `@type` discriminator, for routing without
    /// parsing the payload.
    pub event_type: String,
    /// Id of the aggregate that emitted the event.
    pub aggregate_id: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Envelope schema version.
    pub version: u32,
    /// The event itself.
    pub payload: DomainEvent,
}

impl EventEnvelope {
    /// Current envelope schema version.
    pub const SCHEMA_VERSION: u32 = 1;

    /// Wrap an event emitted by the given aggregate at the given time.
    #[must_use]
    pub fn new(aggregate_id: impl Into<String>, payload: DomainEvent, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: payload.event_type().to_string(),
            aggregate_id: aggregate_id.into(),
            timestamp,
            version: Self::SCHEMA_VERSION,
            payload,
        }
    }

    /// Topic this envelope is published to.
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        self.payload.topic()
    }

    /// Encode to the JSON wire format.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if encoding fails.
    pub fn to_json(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::Serialization(e.to_string()))
    }

    /// Decode from the JSON wire format.
    ///
    /// Unknown `@type` discriminators are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Deserialization`] if decoding fails.
    pub fn from_json(bytes: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(bytes).map_err(|e| EventError::Deserialization(e.to_string()))
    }
}
