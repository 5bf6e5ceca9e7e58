//! The stock engine: per-product serialized mutations.
//!
//! Every mutation runs inside the distributed lock keyed by the product id.
//! Within the critical section the engine loads the persisted product,
//! applies the mutation, wraps the emitted events into envelopes and commits
//! state + outbox + ledger rows in one transactional store call guarded by
//! the row version. A version conflict is retried with bounded exponential
//! backoff; domain rejections are reported, never retried.

use crate::product::{InventoryError, Product, ReleaseOutcome};
use crate::store::{ProductStore, StoreError};
use chrono::{DateTime, Utc};
use merx_core::clock::Clock;
use merx_core::config::ReservationConfig;
use merx_core::error::{Classify, ErrorKind};
use merx_core::event::{EventEnvelope, ReleaseReason};
use merx_core::types::{OrderId, ProductId, Quantity, ReservationId};
use merx_lock::{LockError, LockManager};
use merx_runtime::retry::{RetryPolicy, retry_with_predicate};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A domain precondition failed (reported, not retried).
    #[error(transparent)]
    Domain(#[from] InventoryError),

    /// Persistence failed (version conflicts are retried internally first).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The product lock could not be acquired or held.
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl Classify for EngineError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Domain(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Lock(e) => e.kind(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Domain(e) => e.code(),
            Self::Store(e) => e.code(),
            Self::Lock(e) => e.code(),
        }
    }
}

/// A successful reservation: the id plus its expiry, which batch events
/// carry downstream.
#[derive(Copy, Clone, Debug)]
pub struct Reserved {
    /// The new reservation.
    pub reservation_id: ReservationId,
    /// When it lapses unless confirmed.
    pub expires_at: DateTime<Utc>,
}

/// Per-product concurrency-safe stock mutations.
pub struct StockEngine {
    store: Arc<dyn ProductStore>,
    locks: Arc<LockManager>,
    clock: Arc<dyn Clock>,
    reservations: ReservationConfig,
}

impl StockEngine {
    /// Assemble the engine over its store, lock manager and clock.
    #[must_use]
    pub fn new(
        store: Arc<dyn ProductStore>,
        locks: Arc<LockManager>,
        clock: Arc<dyn Clock>,
        reservations: ReservationConfig,
    ) -> Self {
        Self {
            store,
            locks,
            clock,
            reservations,
        }
    }

    /// Lock key for a product.
    #[must_use]
    pub fn lock_key(product_id: ProductId) -> String {
        format!("product:{product_id}")
    }

    /// Reserve `quantity` units of `product_id` for `order_id`.
    ///
    /// The TTL defaults to the configured reservation TTL and is clamped to
    /// the operator maximum. Appends a product-scoped `StockReserved` to the
    /// outbox.
    ///
    /// # Errors
    ///
    /// [`EngineError::Domain`] for insufficient stock or an inactive
    /// product; [`EngineError::Lock`] / [`EngineError::Store`] for
    /// infrastructure failures.
    pub async fn reserve(
        &self,
        product_id: ProductId,
        order_id: OrderId,
        quantity: Quantity,
        ttl: Option<Duration>,
    ) -> Result<Reserved, EngineError> {
        let ttl = self
            .reservations
            .clamp_ttl(ttl.unwrap_or_else(|| self.reservations.default_ttl()));

        self.mutate(product_id, "reserve", move |product, now| {
            let expires_at = now
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(30));
            let reservation_id = product.reserve(order_id, quantity, expires_at, now)?;
            Ok(Reserved {
                reservation_id,
                expires_at,
            })
        })
        .await
        .inspect_err(|e| {
            if matches!(e, EngineError::Domain(InventoryError::InsufficientStock { .. })) {
                metrics::counter!("stock_insufficient_total").increment(1);
            }
        })
    }

    /// Release a reservation; idempotent against terminal reservations.
    ///
    /// # Errors
    ///
    /// [`EngineError::Domain`] with `ReservationNotFound` for unknown ids.
    pub async fn release(
        &self,
        reservation_id: ReservationId,
        reason: ReleaseReason,
    ) -> Result<ReleaseOutcome, EngineError> {
        let product_id = self.owner_of(reservation_id).await?;
        self.mutate(product_id, "release", move |product, now| {
            product.release(reservation_id, reason, now)
        })
        .await
    }

    /// Confirm a reservation, deducting its units from the ledger.
    ///
    /// # Errors
    ///
    /// [`EngineError::Domain`] with `AlreadyTerminal` or
    /// `ReservationNotFound`.
    pub async fn deduct(&self, reservation_id: ReservationId) -> Result<(), EngineError> {
        let product_id = self.owner_of(reservation_id).await?;
        self.mutate(product_id, "deduct", move |product, now| {
            product.deduct(reservation_id, now)
        })
        .await
    }

    /// Administratively set a product's total stock.
    ///
    /// # Errors
    ///
    /// [`EngineError::Domain`] with `BelowReserved` when the new total does
    /// not cover reserved units.
    pub async fn adjust(
        &self,
        product_id: ProductId,
        new_total: Quantity,
        reason: String,
    ) -> Result<(), EngineError> {
        self.mutate(product_id, "adjust", move |product, now| {
            product.adjust(new_total, &reason, now)
        })
        .await
    }

    /// Release every lapsed reservation of one product.
    ///
    /// # Errors
    ///
    /// Infrastructure errors only; an empty sweep is `Ok(vec![])`.
    pub async fn expire_due(
        &self,
        product_id: ProductId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservationId>, EngineError> {
        self.mutate(product_id, "expire", move |product, _| {
            Ok(product.expire_due(now))
        })
        .await
    }

    /// Current stock snapshot (no lock; readers may observe stale state).
    ///
    /// # Errors
    ///
    /// [`EngineError::Store`] with `NotFound` for unknown products.
    pub async fn snapshot(&self, product_id: ProductId) -> Result<Product, EngineError> {
        self.store
            .load(product_id)
            .await?
            .ok_or(EngineError::Store(StoreError::NotFound { product_id }))
    }

    async fn owner_of(&self, reservation_id: ReservationId) -> Result<ProductId, EngineError> {
        self.store
            .find_by_reservation(reservation_id)
            .await?
            .ok_or(EngineError::Domain(InventoryError::ReservationNotFound {
                reservation_id,
            }))
    }

    /// Run one mutation inside the product lock with version-conflict
    /// retries (≤ 3 attempts, exponential backoff from 50 ms).
    async fn mutate<R, F>(
        &self,
        product_id: ProductId,
        operation: &'static str,
        f: F,
    ) -> Result<R, EngineError>
    where
        F: Fn(&mut Product, DateTime<Utc>) -> Result<R, InventoryError> + Send + Sync,
        R: Send,
    {
        let key = Self::lock_key(product_id);
        let started = std::time::Instant::now();

        let result = self
            .locks
            .with_lock(&key, |_token| async {
                let policy = RetryPolicy::builder()
                    .max_retries(3)
                    .initial_delay(Duration::from_millis(50))
                    .multiplier(2.0)
                    .build();

                retry_with_predicate(
                    policy,
                    || async {
                        let mut product = self
                            .store
                            .load(product_id)
                            .await?
                            .ok_or(EngineError::Store(StoreError::NotFound { product_id }))?;
                        let expected_version = product.version;
                        let now = self.clock.now();

                        let value = f(&mut product, now).map_err(EngineError::Domain)?;

                        let outbox: Vec<EventEnvelope> = product
                            .take_pending_events()
                            .into_iter()
                            .map(|event| EventEnvelope::new(product_id.to_string(), event, now))
                            .collect();
                        let movements = product.take_pending_movements();

                        self.store
                            .commit(product, expected_version, outbox, movements)
                            .await?;
                        Ok(value)
                    },
                    |err: &EngineError| err.kind().is_retriable(),
                )
                .await
            })
            .await??;

        metrics::counter!("stock_mutations_total", "operation" => operation).increment(1);
        metrics::histogram!("stock_mutation_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        tracing::debug!(product_id = %product_id, operation, "Stock mutation committed");
        Ok(result)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use crate::store::InMemoryProductStore;
    use merx_core::clock::SystemClock;
    use merx_core::config::LockConfig;
    use merx_lock::store::InMemoryLockStore;

    async fn engine_with(initial: u32) -> (StockEngine, ProductId, Arc<InMemoryProductStore>) {
        let store = Arc::new(InMemoryProductStore::new());
        let product = Product::new(
            ProductId::new(),
            "Widget".to_string(),
            Quantity::new(initial),
            Quantity::new(2),
        );
        let product_id = product.id;
        store.insert(product).await.unwrap();
        let locks = Arc::new(LockManager::new(
            LockConfig::default(),
            Arc::new(InMemoryLockStore::new()),
        ));
        let engine = StockEngine::new(
            Arc::clone(&store) as Arc<dyn ProductStore>,
            locks,
            Arc::new(SystemClock),
            ReservationConfig::default(),
        );
        (engine, product_id, store)
    }

    #[tokio::test]
    async fn reserve_then_deduct_reduces_total() {
        let (engine, product_id, _) = engine_with(10).await;
        let order_id = OrderId::new();

        let reserved = engine
            .reserve(product_id, order_id, Quantity::new(4), None)
            .await
            .unwrap();

        let snapshot = engine.snapshot(product_id).await.unwrap();
        assert_eq!(snapshot.stock.available, Quantity::new(6));
        assert_eq!(snapshot.stock.reserved, Quantity::new(4));

        engine.deduct(reserved.reservation_id).await.unwrap();
        let snapshot = engine.snapshot(product_id).await.unwrap();
        assert_eq!(snapshot.stock.total(), Quantity::new(6));
        assert!(snapshot.invariant_holds());
    }

    #[tokio::test]
    async fn insufficient_stock_is_reported_not_retried() {
        let (engine, product_id, _) = engine_with(1).await;

        let started = std::time::Instant::now();
        let err = engine
            .reserve(product_id, OrderId::new(), Quantity::new(5), None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::Domain(InventoryError::InsufficientStock { .. })
        ));
        // No retry backoff was spent on the rejection.
        assert!(started.elapsed() < Duration::from_millis(40));
    }

    #[tokio::test]
    async fn release_by_reservation_id_finds_owner() {
        let (engine, product_id, _) = engine_with(10).await;

        let reserved = engine
            .reserve(product_id, OrderId::new(), Quantity::new(3), None)
            .await
            .unwrap();
        let outcome = engine
            .release(reserved.reservation_id, ReleaseReason::Cancelled)
            .await
            .unwrap();
        assert_eq!(outcome, ReleaseOutcome::Released);

        let snapshot = engine.snapshot(product_id).await.unwrap();
        assert_eq!(snapshot.stock.available, Quantity::new(10));
    }

    #[tokio::test]
    async fn ttl_is_clamped_to_operator_maximum() {
        let (engine, product_id, _) = engine_with(10).await;

        let reserved = engine
            .reserve(
                product_id,
                OrderId::new(),
                Quantity::new(1),
                Some(Duration::from_secs(100 * 3600)),
            )
            .await
            .unwrap();

        let max = chrono::Duration::minutes(
            i64::try_from(ReservationConfig::default().max_ttl_minutes).unwrap(),
        );
        let snapshot = engine.snapshot(product_id).await.unwrap();
        let reservation = snapshot
            .stock
            .reservations
            .get(&reserved.reservation_id)
            .unwrap();
        assert!(reservation.expires_at - Utc::now() <= max + chrono::Duration::seconds(5));
    }
}
