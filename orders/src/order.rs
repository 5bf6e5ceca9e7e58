//! The Order aggregate and its status graph.
//!
//! The transition graph is the only source of legal moves; every operation
//! funnels through [`Order::transition`], so an illegal move is rejected the
//! same way everywhere. Items are immutable once the status leaves
//! `Pending`; the reservation map holds ids only (the inventory service
//! owns the reservations themselves).

use chrono::{DateTime, Utc};
use merx_core::error::{Classify, ErrorKind};
use merx_core::event::CancelInitiator;
use merx_core::types::{CustomerId, Money, MoneyError, OrderId, OrderItem, ProductId, ReservationId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Order lifecycle status.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Created, awaiting stock reservation.
    Pending,
    /// Stock reserved.
    Confirmed,
    /// Awaiting payment initiation.
    PaymentPending,
    /// Payment in flight at the processor.
    PaymentProcessing,
    /// Payment settled.
    Paid,
    /// Being prepared for shipment.
    Preparing,
    /// Handed to the carrier.
    Shipped,
    /// Delivered to the customer.
    Delivered,
    /// Terminal happy path.
    Completed,
    /// Terminal: cancelled before completion.
    Cancelled,
    /// Refund in flight.
    Refunding,
    /// Terminal: refunded.
    Refunded,
    /// Terminal: payment failed, stock compensated.
    Failed,
}

impl OrderStatus {
    /// Legal successor states.
    #[must_use]
    pub const fn successors(&self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Confirmed, Self::Cancelled],
            Self::Confirmed => &[Self::PaymentPending, Self::Cancelled],
            Self::PaymentPending => &[Self::PaymentProcessing, Self::Paid],
            Self::PaymentProcessing => &[Self::Paid, Self::Failed, Self::Cancelled],
            Self::Paid => &[Self::Preparing, Self::Refunding, Self::Cancelled],
            Self::Preparing => &[Self::Shipped, Self::Cancelled, Self::Refunding],
            Self::Shipped => &[Self::Delivered, Self::Refunding],
            Self::Delivered => &[Self::Completed, Self::Refunding],
            Self::Completed => &[Self::Refunding],
            Self::Refunding => &[Self::Refunded],
            Self::Cancelled | Self::Refunded | Self::Failed => &[],
        }
    }

    /// Whether a move to `target` is legal.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        self.successors().contains(&target)
    }

    /// States from which a cancellation may be requested.
    #[must_use]
    pub const fn is_cancellable(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Confirmed | Self::PaymentProcessing | Self::Paid | Self::Preparing
        )
    }

    /// Terminal states are never left.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Refunded | Self::Failed)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::PaymentPending => "PAYMENT_PENDING",
            Self::PaymentProcessing => "PAYMENT_PROCESSING",
            Self::Paid => "PAID",
            Self::Preparing => "PREPARING",
            Self::Shipped => "SHIPPED",
            Self::Delivered => "DELIVERED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Refunding => "REFUNDING",
            Self::Refunded => "REFUNDED",
            Self::Failed => "FAILED",
        };
        write!(f, "{name}")
    }
}

/// Rejections from order operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderError {
    /// The status graph does not allow this move.
    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition {
        /// Current status.
        from: OrderStatus,
        /// Requested status.
        to: OrderStatus,
    },

    /// The order is not in a cancellable state, or the customer window has
    /// passed.
    #[error("Order not cancellable: {reason}")]
    NotCancellable {
        /// Why the cancellation was refused.
        reason: String,
    },

    /// An order must contain at least one item with positive quantity.
    #[error("Order validation failed: {0}")]
    Invalid(String),

    /// Items mix currencies or overflow.
    #[error(transparent)]
    Money(#[from] MoneyError),
}

impl Classify for OrderError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::DomainRejection
    }

    fn code(&self) -> &'static str {
        match self {
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::NotCancellable { .. } => "ORDER_NOT_CANCELLABLE",
            Self::Invalid(_) => "VALIDATION_ERROR",
            Self::Money(_) => "CURRENCY_MISMATCH",
        }
    }
}

/// The Order aggregate root.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Aggregate id.
    pub id: OrderId,
    /// Ordering customer.
    pub customer_id: CustomerId,
    /// Ordered items; frozen once the status leaves `Pending`.
    pub items: Vec<OrderItem>,
    /// Current lifecycle status.
    pub status: OrderStatus,
    /// Total amount, always the sum of line totals.
    pub total_amount: Money,
    /// Reservation ids by product, filled in on confirmation.
    pub reservations: BTreeMap<ProductId, ReservationId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Why the order was cancelled, if it was.
    pub cancelled_reason: Option<String>,
    /// Optimistic concurrency version; bumped by the store on commit.
    pub version: u64,
}

impl Order {
    /// Create a pending order, computing the total from the items.
    ///
    /// # Errors
    ///
    /// [`OrderError::Invalid`] for an empty order or zero quantities;
    /// [`OrderError::Money`] when items mix currencies.
    pub fn new(
        customer_id: CustomerId,
        items: Vec<OrderItem>,
        now: DateTime<Utc>,
    ) -> Result<Self, OrderError> {
        if items.is_empty() {
            return Err(OrderError::Invalid("order has no items".to_string()));
        }
        if items.iter().any(|item| item.quantity.is_zero()) {
            return Err(OrderError::Invalid(
                "item quantity must be positive".to_string(),
            ));
        }

        let mut total = Money::zero(items[0].unit_price.currency());
        for item in &items {
            total = total.checked_add(item.line_total()?)?;
        }

        Ok(Self {
            id: OrderId::new(),
            customer_id,
            items,
            status: OrderStatus::Pending,
            total_amount: total,
            reservations: BTreeMap::new(),
            created_at: now,
            cancelled_reason: None,
            version: 0,
        })
    }

    /// Move to `target`, enforcing the status graph.
    ///
    /// # Errors
    ///
    /// [`OrderError::IllegalTransition`] when the graph disallows the move.
    pub fn transition(&mut self, target: OrderStatus) -> Result<(), OrderError> {
        if !self.status.can_transition_to(target) {
            return Err(OrderError::IllegalTransition {
                from: self.status,
                to: target,
            });
        }
        tracing::debug!(order_id = %self.id, from = %self.status, to = %target, "Order transition");
        self.status = target;
        Ok(())
    }

    /// Confirm after a successful reservation, storing the reservation map.
    ///
    /// # Errors
    ///
    /// [`OrderError::IllegalTransition`] unless the order is `Pending`.
    pub fn confirm(
        &mut self,
        reservations: BTreeMap<ProductId, ReservationId>,
    ) -> Result<(), OrderError> {
        self.transition(OrderStatus::Confirmed)?;
        self.reservations = reservations;
        Ok(())
    }

    /// Mark the order paid.
    ///
    /// # Errors
    ///
    /// [`OrderError::IllegalTransition`] unless the order is in a payment
    /// state.
    pub fn mark_paid(&mut self) -> Result<(), OrderError> {
        if !matches!(
            self.status,
            OrderStatus::PaymentPending | OrderStatus::PaymentProcessing
        ) {
            return Err(OrderError::IllegalTransition {
                from: self.status,
                to: OrderStatus::Paid,
            });
        }
        self.status = OrderStatus::Paid;
        Ok(())
    }

    /// Cancel the order.
    ///
    /// Customer-initiated cancellation must fall inside the cancellation
    /// window; system-initiated cancellation ignores it.
    ///
    /// # Errors
    ///
    /// [`OrderError::NotCancellable`] when the state or the window forbids
    /// it.
    pub fn cancel(
        &mut self,
        reason: String,
        initiator: CancelInitiator,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Result<(), OrderError> {
        if !self.status.is_cancellable() {
            return Err(OrderError::NotCancellable {
                reason: format!("status {} does not permit cancellation", self.status),
            });
        }
        if initiator == CancelInitiator::Customer && now - self.created_at > window {
            return Err(OrderError::NotCancellable {
                reason: "cancellation window has passed".to_string(),
            });
        }
        self.status = OrderStatus::Cancelled;
        self.cancelled_reason = Some(reason);
        Ok(())
    }

    /// Fingerprint of (customer, item multiset) for duplicate detection.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        fingerprint(self.customer_id, &self.items)
    }
}

/// Duplicate-detection fingerprint: customer plus the sorted item multiset.
#[must_use]
pub fn fingerprint(customer_id: CustomerId, items: &[OrderItem]) -> String {
    let mut parts: Vec<String> = items
        .iter()
        .map(|item| format!("{}x{}", item.product_id, item.quantity))
        .collect();
    parts.sort();
    format!("{customer_id}:{}", parts.join(","))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use merx_core::types::{Currency, Quantity};
    use rust_decimal::Decimal;

    fn item(quantity: u32, cents: i64) -> OrderItem {
        OrderItem::new(
            ProductId::new(),
            "Widget".to_string(),
            Quantity::new(quantity),
            Money::new(Decimal::new(cents, 2), Currency::USD),
        )
    }

    fn order() -> Order {
        Order::new(CustomerId::new(), vec![item(2, 1000), item(1, 500)], Utc::now()).unwrap()
    }

    #[test]
    fn total_is_sum_of_line_totals() {
        let order = order();
        assert_eq!(order.total_amount.amount(), Decimal::new(2500, 2));
        assert_eq!(order.status, OrderStatus::Pending);
    }

    #[test]
    fn empty_or_zero_quantity_orders_are_rejected() {
        assert!(matches!(
            Order::new(CustomerId::new(), vec![], Utc::now()),
            Err(OrderError::Invalid(_))
        ));
        assert!(matches!(
            Order::new(CustomerId::new(), vec![item(0, 1000)], Utc::now()),
            Err(OrderError::Invalid(_))
        ));
    }

    #[test]
    fn mixed_currency_items_are_rejected() {
        let usd = item(1, 1000);
        let eur = OrderItem::new(
            ProductId::new(),
            "Widget".to_string(),
            Quantity::new(1),
            Money::new(Decimal::ONE, Currency::EUR),
        );
        assert!(matches!(
            Order::new(CustomerId::new(), vec![usd, eur], Utc::now()),
            Err(OrderError::Money(MoneyError::CurrencyMismatch { .. }))
        ));
    }

    #[test]
    fn happy_path_walks_the_full_graph() {
        let mut order = order();
        order.confirm(BTreeMap::new()).unwrap();
        order.transition(OrderStatus::PaymentPending).unwrap();
        order.transition(OrderStatus::PaymentProcessing).unwrap();
        order.mark_paid().unwrap();
        order.transition(OrderStatus::Preparing).unwrap();
        order.transition(OrderStatus::Shipped).unwrap();
        order.transition(OrderStatus::Delivered).unwrap();
        order.transition(OrderStatus::Completed).unwrap();
        assert!(order.status.is_terminal());
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut order = order();
        let err = order.transition(OrderStatus::Shipped).unwrap_err();
        assert!(matches!(err, OrderError::IllegalTransition { .. }));
        // The order is unchanged.
        assert_eq!(order.status, OrderStatus::Pending);

        let mut order = order_in(OrderStatus::Completed);
        assert!(order.transition(OrderStatus::Cancelled).is_err());
    }

    fn order_in(status: OrderStatus) -> Order {
        let mut order = order();
        order.status = status;
        order
    }

    #[test]
    fn refund_path_from_paid_or_later() {
        for status in [
            OrderStatus::Paid,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
            OrderStatus::Completed,
        ] {
            let mut order = order_in(status);
            order.transition(OrderStatus::Refunding).unwrap();
            order.transition(OrderStatus::Refunded).unwrap();
            assert!(order.status.is_terminal());
        }
    }

    #[test]
    fn customer_cancel_respects_window() {
        let window = chrono::Duration::hours(24);
        let created = Utc::now();

        // One hour in: allowed.
        let mut order = order();
        order.created_at = created;
        order
            .cancel(
                "changed my mind".to_string(),
                CancelInitiator::Customer,
                created + chrono::Duration::hours(1),
                window,
            )
            .unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);

        // 25 hours in: refused, order unchanged.
        let mut order = self::order();
        order.created_at = created;
        let err = order
            .cancel(
                "too late".to_string(),
                CancelInitiator::Customer,
                created + chrono::Duration::hours(25),
                window,
            )
            .unwrap_err();
        assert!(matches!(err, OrderError::NotCancellable { .. }));
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(order.cancelled_reason.is_none());
    }

    #[test]
    fn system_cancel_ignores_window() {
        let mut order = order();
        order.created_at = Utc::now() - chrono::Duration::days(30);
        order
            .cancel(
                "stock unavailable".to_string(),
                CancelInitiator::System,
                Utc::now(),
                chrono::Duration::hours(24),
            )
            .unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
    }

    #[test]
    fn cancellable_set_matches_contract() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Confirmed,
            OrderStatus::PaymentProcessing,
            OrderStatus::Paid,
            OrderStatus::Preparing,
        ] {
            assert!(status.is_cancellable(), "{status} should be cancellable");
        }
        for status in [
            OrderStatus::Shipped,
            OrderStatus::Delivered,
            OrderStatus::Completed,
            OrderStatus::Cancelled,
            OrderStatus::Refunded,
            OrderStatus::Failed,
        ] {
            assert!(!status.is_cancellable(), "{status} should not be cancellable");
        }
    }

    #[test]
    fn fingerprint_is_order_insensitive() {
        let a = item(2, 1000);
        let b = item(1, 500);
        let customer = CustomerId::new();

        let first = fingerprint(customer, &[a.clone(), b.clone()]);
        let second = fingerprint(customer, &[b, a]);
        assert_eq!(first, second);
    }
}
