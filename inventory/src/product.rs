//! The Product aggregate: stock levels and the reservation lifecycle.
//!
//! All mutations go through the aggregate root. Every method upholds the
//! ledger invariant `total == available + reserved`, appends the
//! corresponding domain events to the aggregate's pending outbox and records
//! a movement row for the audit ledger. The engine commits state, outbox and
//! movements in one transaction.

use chrono::{DateTime, Utc};
use merx_core::error::{Classify, ErrorKind};
use merx_core::event::{DomainEvent, ReleaseReason, ReservationRef};
use merx_core::types::{OrderId, ProductId, Quantity, ReservationId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Rejections from stock mutations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InventoryError {
    /// Not enough available stock to satisfy a reservation.
    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        /// Product that was short.
        product_id: ProductId,
        /// Units requested.
        requested: Quantity,
        /// Units available at rejection time.
        available: Quantity,
    },

    /// The product is not active.
    #[error("Product {product_id} is inactive")]
    ProductInactive {
        /// The inactive product.
        product_id: ProductId,
    },

    /// The reservation id is unknown to this product.
    #[error("Reservation {reservation_id} not found")]
    ReservationNotFound {
        /// The unknown reservation.
        reservation_id: ReservationId,
    },

    /// The reservation is already in a terminal state.
    #[error("Reservation {reservation_id} is already {state:?}")]
    AlreadyTerminal {
        /// The terminal reservation.
        reservation_id: ReservationId,
        /// Its terminal state.
        state: ReservationState,
    },

    /// An adjustment would push the total below the reserved amount.
    #[error("Cannot adjust product {product_id} total to {requested_total}: {reserved} units reserved")]
    BelowReserved {
        /// Product being adjusted.
        product_id: ProductId,
        /// Requested new total.
        requested_total: Quantity,
        /// Currently reserved units.
        reserved: Quantity,
    },
}

impl Classify for InventoryError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::DomainRejection
    }

    fn code(&self) -> &'static str {
        match self {
            Self::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            Self::ProductInactive { .. } => "PRODUCT_INACTIVE",
            Self::ReservationNotFound { .. } => "RESERVATION_NOT_FOUND",
            Self::AlreadyTerminal { .. } => "RESERVATION_TERMINAL",
            Self::BelowReserved { .. } => "ADJUST_BELOW_RESERVED",
        }
    }
}

/// Lifecycle state of a reservation. Terminal states are never revived.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationState {
    /// Holding stock, waiting for confirm/release/expiry.
    Active,
    /// Confirmed; units were deducted.
    Confirmed,
    /// Released back to available stock.
    Released,
    /// Released by the expiry sweeper.
    Expired,
}

impl ReservationState {
    /// Whether the state is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// A hold of stock units for one order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Unique reservation id.
    pub id: ReservationId,
    /// Order the hold belongs to.
    pub order_id: OrderId,
    /// Held units.
    pub quantity: Quantity,
    /// When the hold lapses unless confirmed.
    pub expires_at: DateTime<Utc>,
    /// Lifecycle state.
    pub state: ReservationState,
}

/// Stock levels owned by a [`Product`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stock {
    /// Units free to reserve.
    pub available: Quantity,
    /// Units held by active reservations.
    pub reserved: Quantity,
    /// All reservations, active and terminal.
    pub reservations: HashMap<ReservationId, Reservation>,
}

impl Stock {
    /// Total units on the ledger (`available + reserved`).
    #[must_use]
    pub const fn total(&self) -> Quantity {
        Quantity::new(self.available.get() + self.reserved.get())
    }
}

/// Direction and kind of a ledger movement.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    /// Available decreased into a reservation.
    Reserve,
    /// Reservation returned to available.
    Release,
    /// Reserved units confirmed and removed.
    Deduct,
    /// Administrative increase of the total.
    AdjustIncrease,
    /// Administrative decrease of the total.
    AdjustDecrease,
    /// Reservation expired and returned to available.
    Expire,
}

impl MovementType {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reserve => "RESERVE",
            Self::Release => "RELEASE",
            Self::Deduct => "DEDUCT",
            Self::AdjustIncrease => "ADJUST_INCREASE",
            Self::AdjustDecrease => "ADJUST_DECREASE",
            Self::Expire => "EXPIRE",
        }
    }
}

/// One row of the stock movements audit ledger.
///
/// `balance_before`/`balance_after` track the available balance around the
/// movement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockMovement {
    /// Product the movement belongs to.
    pub product_id: ProductId,
    /// Kind of movement.
    pub movement_type: MovementType,
    /// Moved units.
    pub quantity: Quantity,
    /// Available balance before the movement.
    pub balance_before: Quantity,
    /// Available balance after the movement.
    pub balance_after: Quantity,
    /// Reservation or order id the movement refers to.
    pub reference_id: String,
    /// When the movement happened.
    pub occurred_at: DateTime<Utc>,
}

/// Outcome of a release request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The reservation was active and has been released.
    Released,
    /// The reservation was already terminal; the release was a no-op.
    AlreadyTerminal,
}

/// The Product aggregate root.
///
/// Holds its stock child, the optimistic version counter and the pending
/// outbox drained by the engine at commit time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Product {
    /// Aggregate id.
    pub id: ProductId,
    /// Display name.
    pub name: String,
    /// Inactive products reject reservations.
    pub active: bool,
    /// Low-stock alert threshold.
    pub low_stock_threshold: Quantity,
    /// Stock child entity.
    pub stock: Stock,
    /// Optimistic concurrency version; bumped by the store on commit.
    pub version: u64,
    /// Monotonic count of threshold crossings (alert dedup).
    pub low_stock_crossings: u64,
    /// Whether the last mutation left us at or below the threshold.
    below_threshold: bool,
    /// Events emitted by mutations, drained at commit.
    #[serde(skip)]
    pending_events: Vec<DomainEvent>,
    /// Ledger rows recorded by mutations, drained at commit.
    #[serde(skip)]
    pending_movements: Vec<StockMovement>,
}

impl Product {
    /// Create an active product with an initial available quantity.
    #[must_use]
    pub fn new(id: ProductId, name: String, initial: Quantity, low_stock_threshold: Quantity) -> Self {
        Self {
            id,
            name,
            active: true,
            low_stock_threshold,
            stock: Stock {
                available: initial,
                reserved: Quantity::ZERO,
                reservations: HashMap::new(),
            },
            version: 0,
            low_stock_crossings: 0,
            below_threshold: initial <= low_stock_threshold,
            pending_events: Vec::new(),
            pending_movements: Vec::new(),
        }
    }

    /// Rebuild an aggregate from its persisted parts.
    #[must_use]
    #[allow(clippy::too_many_arguments)] // Mirrors the persisted columns
    pub fn restore(
        id: ProductId,
        name: String,
        active: bool,
        low_stock_threshold: Quantity,
        stock: Stock,
        version: u64,
        low_stock_crossings: u64,
        below_threshold: bool,
    ) -> Self {
        Self {
            id,
            name,
            active,
            low_stock_threshold,
            stock,
            version,
            low_stock_crossings,
            below_threshold,
            pending_events: Vec::new(),
            pending_movements: Vec::new(),
        }
    }

    /// Whether the last committed mutation left availability at or below
    /// the threshold.
    #[must_use]
    pub const fn below_threshold(&self) -> bool {
        self.below_threshold
    }

    /// Reserve `quantity` units for `order_id` until `expires_at`.
    ///
    /// Appends a `StockReserved` event scoped to this product.
    ///
    /// # Errors
    ///
    /// [`InventoryError::ProductInactive`] or
    /// [`InventoryError::InsufficientStock`] when preconditions fail.
    pub fn reserve(
        &mut self,
        order_id: OrderId,
        quantity: Quantity,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ReservationId, InventoryError> {
        if !self.active {
            return Err(InventoryError::ProductInactive { product_id: self.id });
        }
        let available = self.stock.available;
        let Some(remaining) = available.checked_sub(quantity) else {
            return Err(InventoryError::InsufficientStock {
                product_id: self.id,
                requested: quantity,
                available,
            });
        };

        let reservation_id = ReservationId::new();
        self.stock.available = remaining;
        self.stock.reserved = self.stock.reserved.saturating_add(quantity);
        self.stock.reservations.insert(
            reservation_id,
            Reservation {
                id: reservation_id,
                order_id,
                quantity,
                expires_at,
                state: ReservationState::Active,
            },
        );

        self.record_movement(
            MovementType::Reserve,
            quantity,
            available,
            remaining,
            reservation_id.to_string(),
            now,
        );
        self.pending_events.push(DomainEvent::StockReserved {
            order_id,
            reservations: vec![ReservationRef {
                product_id: self.id,
                reservation_id,
                quantity,
            }],
            expires_at,
        });
        self.check_low_stock();
        Ok(reservation_id)
    }

    /// Release a reservation back to available stock.
    ///
    /// Idempotent: releasing a terminal reservation is a no-op success.
    ///
    /// # Errors
    ///
    /// [`InventoryError::ReservationNotFound`] for unknown ids.
    pub fn release(
        &mut self,
        reservation_id: ReservationId,
        reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, InventoryError> {
        let reservation = self
            .stock
            .reservations
            .get_mut(&reservation_id)
            .ok_or(InventoryError::ReservationNotFound { reservation_id })?;

        if reservation.state.is_terminal() {
            return Ok(ReleaseOutcome::AlreadyTerminal);
        }

        let quantity = reservation.quantity;
        reservation.state = if reason == ReleaseReason::Expired {
            ReservationState::Expired
        } else {
            ReservationState::Released
        };

        let before = self.stock.available;
        self.stock.available = before.saturating_add(quantity);
        self.stock.reserved = self
            .stock
            .reserved
            .checked_sub(quantity)
            .unwrap_or(Quantity::ZERO);

        self.record_movement(
            if reason == ReleaseReason::Expired {
                MovementType::Expire
            } else {
                MovementType::Release
            },
            quantity,
            before,
            self.stock.available,
            reservation_id.to_string(),
            now,
        );
        self.pending_events.push(DomainEvent::StockReleased {
            product_id: self.id,
            reservation_id,
            quantity,
            reason,
        });
        self.check_low_stock();
        Ok(ReleaseOutcome::Released)
    }

    /// Confirm a reservation, removing its units from the ledger.
    ///
    /// `available` is untouched; `reserved` (and therefore the total)
    /// decreases.
    ///
    /// # Errors
    ///
    /// [`InventoryError::ReservationNotFound`] or
    /// [`InventoryError::AlreadyTerminal`].
    pub fn deduct(
        &mut self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<(), InventoryError> {
        let reservation = self
            .stock
            .reservations
            .get_mut(&reservation_id)
            .ok_or(InventoryError::ReservationNotFound { reservation_id })?;

        if reservation.state.is_terminal() {
            return Err(InventoryError::AlreadyTerminal {
                reservation_id,
                state: reservation.state,
            });
        }

        let quantity = reservation.quantity;
        reservation.state = ReservationState::Confirmed;
        self.stock.reserved = self
            .stock
            .reserved
            .checked_sub(quantity)
            .unwrap_or(Quantity::ZERO);

        let available = self.stock.available;
        self.record_movement(
            MovementType::Deduct,
            quantity,
            available,
            available,
            reservation_id.to_string(),
            now,
        );
        self.pending_events.push(DomainEvent::StockDeducted {
            product_id: self.id,
            reservation_id,
            quantity,
        });
        self.check_low_stock();
        Ok(())
    }

    /// Administratively set the total stock level.
    ///
    /// # Errors
    ///
    /// [`InventoryError::BelowReserved`] if `new_total` is less than the
    /// reserved amount.
    pub fn adjust(
        &mut self,
        new_total: Quantity,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), InventoryError> {
        let reserved = self.stock.reserved;
        let Some(new_available) = new_total.checked_sub(reserved) else {
            return Err(InventoryError::BelowReserved {
                product_id: self.id,
                requested_total: new_total,
                reserved,
            });
        };

        let before = self.stock.available;
        let (movement_type, delta) = if new_available >= before {
            (
                MovementType::AdjustIncrease,
                Quantity::new(new_available.get() - before.get()),
            )
        } else {
            (
                MovementType::AdjustDecrease,
                Quantity::new(before.get() - new_available.get()),
            )
        };
        self.stock.available = new_available;

        self.record_movement(movement_type, delta, before, new_available, reason.to_string(), now);
        self.pending_events.push(DomainEvent::StockAdjusted {
            product_id: self.id,
            new_total,
            reason: reason.to_string(),
        });
        self.check_low_stock();
        Ok(())
    }

    /// Release every active reservation whose TTL has lapsed.
    ///
    /// Each expiry has the same effect as a release and appends one
    /// `StockReleased` with `reason = expired`.
    pub fn expire_due(&mut self, now: DateTime<Utc>) -> Vec<ReservationId> {
        let due: Vec<ReservationId> = self
            .stock
            .reservations
            .values()
            .filter(|r| r.state == ReservationState::Active && r.expires_at <= now)
            .map(|r| r.id)
            .collect();

        let mut expired = Vec::with_capacity(due.len());
        for reservation_id in due {
            if self
                .release(reservation_id, ReleaseReason::Expired, now)
                .is_ok()
            {
                expired.push(reservation_id);
            }
        }
        expired
    }

    /// Active reservations held for `order_id`.
    #[must_use]
    pub fn reservations_for_order(&self, order_id: OrderId) -> Vec<&Reservation> {
        self.stock
            .reservations
            .values()
            .filter(|r| r.order_id == order_id && r.state == ReservationState::Active)
            .collect()
    }

    /// Drain events emitted since the last commit, in emission order.
    pub fn take_pending_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.pending_events)
    }

    /// Drain ledger rows recorded since the last commit.
    pub fn take_pending_movements(&mut self) -> Vec<StockMovement> {
        std::mem::take(&mut self.pending_movements)
    }

    /// Ledger invariant: `total == available + reserved` and the sum of
    /// active reservation quantities equals `reserved`.
    #[must_use]
    pub fn invariant_holds(&self) -> bool {
        let active_sum: u32 = self
            .stock
            .reservations
            .values()
            .filter(|r| r.state == ReservationState::Active)
            .map(|r| r.quantity.get())
            .sum();
        active_sum == self.stock.reserved.get()
            && self.stock.total().get() == self.stock.available.get() + self.stock.reserved.get()
    }

    fn record_movement(
        &mut self,
        movement_type: MovementType,
        quantity: Quantity,
        before: Quantity,
        after: Quantity,
        reference_id: String,
        now: DateTime<Utc>,
    ) {
        self.pending_movements.push(StockMovement {
            product_id: self.id,
            movement_type,
            quantity,
            balance_before: before,
            balance_after: after,
            reference_id,
            occurred_at: now,
        });
    }

    /// Alert once per downward threshold crossing, not per mutation.
    fn check_low_stock(&mut self) {
        let below = self.stock.available <= self.low_stock_threshold;
        if below && !self.below_threshold {
            self.low_stock_crossings += 1;
            self.pending_events.push(DomainEvent::LowStockAlert {
                product_id: self.id,
                available: self.stock.available,
                threshold: self.low_stock_threshold,
            });
        }
        self.below_threshold = below;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    fn product(initial: u32) -> Product {
        Product::new(
            ProductId::new(),
            "Widget".to_string(),
            Quantity::new(initial),
            Quantity::new(5),
        )
    }

    fn far_future() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::hours(1)
    }

    #[test]
    fn reserve_moves_units_and_keeps_invariant() {
        let mut p = product(100);
        let id = p
            .reserve(OrderId::new(), Quantity::new(10), far_future(), Utc::now())
            .unwrap();

        assert_eq!(p.stock.available, Quantity::new(90));
        assert_eq!(p.stock.reserved, Quantity::new(10));
        assert_eq!(p.stock.total(), Quantity::new(100));
        assert!(p.invariant_holds());
        assert_eq!(
            p.stock.reservations.get(&id).unwrap().state,
            ReservationState::Active
        );
    }

    #[test]
    fn reserve_rejects_insufficient_stock() {
        let mut p = product(3);
        let err = p
            .reserve(OrderId::new(), Quantity::new(4), far_future(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, InventoryError::InsufficientStock { available, .. }
            if available == Quantity::new(3)));
        assert!(p.invariant_holds());
    }

    #[test]
    fn reserve_rejects_inactive_product() {
        let mut p = product(10);
        p.active = false;
        let err = p
            .reserve(OrderId::new(), Quantity::new(1), far_future(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, InventoryError::ProductInactive { .. }));
    }

    #[test]
    fn release_restores_available_and_is_idempotent() {
        let mut p = product(10);
        let id = p
            .reserve(OrderId::new(), Quantity::new(4), far_future(), Utc::now())
            .unwrap();

        let first = p.release(id, ReleaseReason::Cancelled, Utc::now()).unwrap();
        assert_eq!(first, ReleaseOutcome::Released);
        assert_eq!(p.stock.available, Quantity::new(10));
        assert_eq!(p.stock.reserved, Quantity::ZERO);

        // Second release is a no-op success with no further events.
        p.take_pending_events();
        let second = p.release(id, ReleaseReason::Cancelled, Utc::now()).unwrap();
        assert_eq!(second, ReleaseOutcome::AlreadyTerminal);
        assert!(p.take_pending_events().is_empty());
        assert!(p.invariant_holds());
    }

    #[test]
    fn deduct_confirms_without_touching_available() {
        let mut p = product(10);
        let id = p
            .reserve(OrderId::new(), Quantity::new(4), far_future(), Utc::now())
            .unwrap();

        p.deduct(id, Utc::now()).unwrap();
        assert_eq!(p.stock.available, Quantity::new(6));
        assert_eq!(p.stock.reserved, Quantity::ZERO);
        assert_eq!(p.stock.total(), Quantity::new(6));
        assert!(p.invariant_holds());

        // Terminal states are never revived.
        assert!(matches!(
            p.deduct(id, Utc::now()),
            Err(InventoryError::AlreadyTerminal { .. })
        ));
        assert!(matches!(
            p.release(id, ReleaseReason::Cancelled, Utc::now()),
            Ok(ReleaseOutcome::AlreadyTerminal)
        ));
    }

    #[test]
    fn adjust_below_reserved_is_rejected() {
        let mut p = product(10);
        p.reserve(OrderId::new(), Quantity::new(6), far_future(), Utc::now())
            .unwrap();

        let err = p.adjust(Quantity::new(5), "shrink", Utc::now()).unwrap_err();
        assert!(matches!(err, InventoryError::BelowReserved { .. }));

        p.adjust(Quantity::new(6), "shrink to reserved", Utc::now())
            .unwrap();
        assert_eq!(p.stock.available, Quantity::ZERO);
        assert!(p.invariant_holds());
    }

    #[test]
    fn expire_due_releases_only_lapsed_active_reservations() {
        let mut p = product(10);
        let now = Utc::now();
        let due = p
            .reserve(OrderId::new(), Quantity::new(2), now - chrono::Duration::seconds(1), now)
            .unwrap();
        let live = p
            .reserve(OrderId::new(), Quantity::new(3), now + chrono::Duration::hours(1), now)
            .unwrap();

        let expired = p.expire_due(now);
        assert_eq!(expired, vec![due]);
        assert_eq!(
            p.stock.reservations.get(&due).unwrap().state,
            ReservationState::Expired
        );
        assert_eq!(
            p.stock.reservations.get(&live).unwrap().state,
            ReservationState::Active
        );
        assert_eq!(p.stock.available, Quantity::new(7));
        assert!(p.invariant_holds());

        let released_events: Vec<_> = p
            .take_pending_events()
            .into_iter()
            .filter(|e| matches!(e, DomainEvent::StockReleased { reason: ReleaseReason::Expired, .. }))
            .collect();
        assert_eq!(released_events.len(), 1);
    }

    #[test]
    fn low_stock_alert_fires_once_per_crossing() {
        let mut p = product(10); // threshold 5
        let now = Utc::now();

        p.reserve(OrderId::new(), Quantity::new(6), far_future(), now)
            .unwrap();
        let alerts = |events: &[DomainEvent]| {
            events
                .iter()
                .filter(|e| matches!(e, DomainEvent::LowStockAlert { .. }))
                .count()
        };
        assert_eq!(alerts(&p.take_pending_events()), 1);

        // Still below threshold: mutation emits no second alert.
        p.reserve(OrderId::new(), Quantity::new(1), far_future(), now)
            .unwrap();
        assert_eq!(alerts(&p.take_pending_events()), 0);
        assert_eq!(p.low_stock_crossings, 1);

        // Recover above threshold, then cross again.
        p.adjust(Quantity::new(20), "restock", now).unwrap();
        p.take_pending_events();
        p.reserve(OrderId::new(), Quantity::new(9), far_future(), now)
            .unwrap();
        assert_eq!(alerts(&p.take_pending_events()), 1);
        assert_eq!(p.low_stock_crossings, 2);
    }

    #[test]
    fn events_are_emitted_in_mutation_order() {
        let mut p = product(10);
        let now = Utc::now();
        let id = p
            .reserve(OrderId::new(), Quantity::new(2), far_future(), now)
            .unwrap();
        p.release(id, ReleaseReason::Cancelled, now).unwrap();

        let events = p.take_pending_events();
        assert!(matches!(events[0], DomainEvent::StockReserved { .. }));
        assert!(matches!(events[1], DomainEvent::StockReleased { .. }));
    }

    #[test]
    fn movements_record_running_balance() {
        let mut p = product(10);
        let now = Utc::now();
        let id = p
            .reserve(OrderId::new(), Quantity::new(4), far_future(), now)
            .unwrap();
        p.release(id, ReleaseReason::Cancelled, now).unwrap();

        let movements = p.take_pending_movements();
        assert_eq!(movements.len(), 2);
        assert_eq!(movements[0].movement_type, MovementType::Reserve);
        assert_eq!(movements[0].balance_before, Quantity::new(10));
        assert_eq!(movements[0].balance_after, Quantity::new(6));
        assert_eq!(movements[1].movement_type, MovementType::Release);
        assert_eq!(movements[1].balance_after, Quantity::new(10));
    }
}
