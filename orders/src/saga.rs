//! The order saga: advancing one order through external events.
//!
//! [`OrderSaga::step`] is a pure function over `(order, action)` in the
//! spirit of a reducer: it mutates the aggregate and returns the events to
//! append to the outbox, including compensations. The imperative shell
//! (loading, committing, publishing, retrying) lives in the service.

use crate::order::{Order, OrderError, OrderStatus};
use chrono::{DateTime, Utc};
use merx_core::event::{
    CancelInitiator, Compensation, CompensationAction, DomainEvent, FailedItem, ReservationRef,
};
use std::collections::BTreeMap;

/// External inputs that advance a saga.
#[derive(Clone, Debug)]
pub enum SagaAction {
    /// Inventory reserved stock for the order.
    StockReserved {
        /// Reserved items; must cover the whole order to confirm it.
        reservations: Vec<ReservationRef>,
        /// When the reservations lapse.
        expires_at: DateTime<Utc>,
    },
    /// Inventory could not satisfy the order.
    InsufficientStock {
        /// Per-item failure detail.
        failed_items: Vec<FailedItem>,
    },
    /// The payment service settled the payment.
    PaymentCompleted {
        /// Processor transaction id.
        transaction_id: String,
    },
    /// The payment service declined the payment.
    PaymentFailed {
        /// Decline reason.
        reason: String,
    },
}

/// What a saga step produced.
#[derive(Debug)]
pub enum StepOutcome {
    /// The order advanced; append these events to the outbox.
    Advanced(Vec<DomainEvent>),
    /// The event did not apply in the current state and was dropped
    /// (logged, never retried).
    Dropped,
}

/// The saga step function.
#[derive(Clone, Copy, Debug, Default)]
pub struct OrderSaga;

impl OrderSaga {
    /// Apply one action to an order.
    ///
    /// Follows the status graph strictly; actions that arrive in the wrong
    /// state are either dropped (late/duplicate notifications) or rejected
    /// (true invariant violations, terminal for the event).
    ///
    /// # Errors
    ///
    /// [`OrderError`] for moves the status graph forbids.
    pub fn step(
        self,
        order: &mut Order,
        action: SagaAction,
        _now: DateTime<Utc>,
    ) -> Result<StepOutcome, OrderError> {
        match (order.status, action) {
            // Stock reserved: confirm once the whole order is covered.
            (OrderStatus::Pending, SagaAction::StockReserved { reservations, .. }) => {
                if !covers_all_items(order, &reservations) {
                    // A per-product notification for a multi-item order;
                    // the order-scoped batch event is still to come.
                    tracing::debug!(
                        order_id = %order.id,
                        covered = reservations.len(),
                        items = order.items.len(),
                        "Partial reservation notification, waiting for the batch"
                    );
                    return Ok(StepOutcome::Dropped);
                }
                let map: BTreeMap<_, _> = reservations
                    .iter()
                    .map(|r| (r.product_id, r.reservation_id))
                    .collect();
                order.confirm(map)?;
                Ok(StepOutcome::Advanced(vec![DomainEvent::OrderConfirmed {
                    order_id: order.id,
                }]))
            }

            // A duplicate reservation notification after confirmation.
            (_, SagaAction::StockReserved { .. }) => {
                tracing::debug!(order_id = %order.id, status = %order.status, "Duplicate StockReserved dropped");
                Ok(StepOutcome::Dropped)
            }

            // Reservation failed: system cancellation, nothing to compensate
            // (inventory rolled its partial work back already).
            (OrderStatus::Pending, SagaAction::InsufficientStock { failed_items }) => {
                order.cancel(
                    format!("insufficient stock for {} item(s)", failed_items.len()),
                    CancelInitiator::System,
                    _now,
                    chrono::Duration::zero(),
                )?;
                Ok(StepOutcome::Advanced(vec![DomainEvent::OrderCancelled {
                    order_id: order.id,
                    reason: order
                        .cancelled_reason
                        .clone()
                        .unwrap_or_else(|| "insufficient stock".to_string()),
                    initiator: CancelInitiator::System,
                    compensations: vec![],
                }]))
            }

            (_, SagaAction::InsufficientStock { .. }) => {
                tracing::debug!(order_id = %order.id, status = %order.status, "Late InsufficientStock dropped");
                Ok(StepOutcome::Dropped)
            }

            // Payment settled while a payment was expected.
            (
                OrderStatus::PaymentPending | OrderStatus::PaymentProcessing,
                SagaAction::PaymentCompleted { transaction_id },
            ) => {
                order.mark_paid()?;
                Ok(StepOutcome::Advanced(vec![DomainEvent::OrderPaid {
                    order_id: order.id,
                    transaction_id,
                }]))
            }

            // Payment settled in any other state: drop and log, no retry.
            (_, SagaAction::PaymentCompleted { transaction_id }) => {
                tracing::warn!(
                    order_id = %order.id,
                    status = %order.status,
                    transaction_id = %transaction_id,
                    "PaymentCompleted outside payment states, dropping"
                );
                Ok(StepOutcome::Dropped)
            }

            // Payment failed: terminal failure. The inventory service
            // consumes the original `payment.failed` envelope and releases
            // the order's holds, so no further event is emitted here.
            (OrderStatus::PaymentProcessing, SagaAction::PaymentFailed { reason }) => {
                order.transition(OrderStatus::Failed)?;
                order.cancelled_reason = Some(reason);
                Ok(StepOutcome::Advanced(vec![]))
            }

            (_, SagaAction::PaymentFailed { reason }) => {
                tracing::warn!(
                    order_id = %order.id,
                    status = %order.status,
                    reason = %reason,
                    "PaymentFailed outside PAYMENT_PROCESSING, dropping"
                );
                Ok(StepOutcome::Dropped)
            }
        }
    }
}

/// Build the compensation list for a cancellation: release every held
/// reservation at the inventory service.
#[must_use]
pub fn stock_release_compensations(order: &Order) -> Vec<Compensation> {
    if order.reservations.is_empty() {
        return vec![];
    }
    vec![Compensation {
        action: CompensationAction::StockRelease,
        target: "inventory".to_string(),
        data: order.reservations.clone(),
    }]
}

fn covers_all_items(order: &Order, reservations: &[ReservationRef]) -> bool {
    order.items.iter().all(|item| {
        reservations
            .iter()
            .any(|r| r.product_id == item.product_id && r.quantity == item.quantity)
    })
}
