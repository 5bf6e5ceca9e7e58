//! Product persistence seam.
//!
//! The store owns the authoritative product rows and enforces the optimistic
//! version check: a commit carries the version the product was loaded at and
//! fails with [`StoreError::VersionConflict`] if another writer got there
//! first. State, outbox envelopes and ledger rows commit together.
//!
//! The in-memory implementation here backs tests and single-node
//! deployments; `merx-postgres` provides the production store.

use crate::product::{Product, StockMovement};
use merx_core::error::{Classify, ErrorKind};
use merx_core::event::EventEnvelope;
use merx_core::event_bus::EventBus;
use merx_core::types::{OrderId, ProductId, ReservationId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from product persistence.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Another writer committed the product since it was loaded.
    #[error("Version conflict committing product {product_id}")]
    VersionConflict {
        /// The contended product.
        product_id: ProductId,
    },

    /// The product does not exist.
    #[error("Product {product_id} not found")]
    NotFound {
        /// The missing product.
        product_id: ProductId,
    },

    /// The backend failed.
    #[error("Product store failure: {0}")]
    Backend(String),
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::VersionConflict { .. } => ErrorKind::TransientInfra,
            Self::NotFound { .. } => ErrorKind::DomainRejection,
            Self::Backend(_) => ErrorKind::Fatal,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::VersionConflict { .. } => "VERSION_CONFLICT",
            Self::NotFound { .. } => "PRODUCT_NOT_FOUND",
            Self::Backend(_) => "STORE_FAILURE",
        }
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Authoritative product storage.
///
/// Boxed futures keep the trait dyn-compatible; the engine holds an
/// `Arc<dyn ProductStore>`.
pub trait ProductStore: Send + Sync {
    /// Load a product snapshot by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on backend failure.
    fn load(&self, id: ProductId) -> BoxFuture<'_, Result<Option<Product>, StoreError>>;

    /// Insert a newly created product.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on backend failure.
    fn insert(&self, product: Product) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Commit a mutated product together with its outbox envelopes and
    /// ledger rows, guarded by `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VersionConflict`] if the stored version moved,
    /// [`StoreError::Backend`] on backend failure.
    fn commit(
        &self,
        product: Product,
        expected_version: u64,
        outbox: Vec<EventEnvelope>,
        movements: Vec<StockMovement>,
    ) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Ids of every product, for the expiry sweeper's partition walk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on backend failure.
    fn list_ids(&self) -> BoxFuture<'_, Result<Vec<ProductId>, StoreError>>;

    /// Resolve the product owning a reservation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on backend failure.
    fn find_by_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> BoxFuture<'_, Result<Option<ProductId>, StoreError>>;

    /// All (product, reservation) pairs currently held for an order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on backend failure.
    fn find_by_order(
        &self,
        order_id: OrderId,
    ) -> BoxFuture<'_, Result<Vec<(ProductId, ReservationId)>, StoreError>>;
}

/// In-memory product store.
///
/// Commits are atomic under one mutex, so per-product event order on the
/// attached bus matches mutation order exactly, the same guarantee the
/// Postgres outbox relay provides in production. Ledger rows accumulate for
/// test assertions.
pub struct InMemoryProductStore {
    state: Mutex<Inner>,
    bus: Option<Arc<dyn EventBus>>,
}

#[derive(Default)]
struct Inner {
    products: HashMap<ProductId, Product>,
    movements: Vec<StockMovement>,
}

impl Default for InMemoryProductStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProductStore {
    /// Create an empty store with no relay.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Inner::default()),
            bus: None,
        }
    }

    /// Create a store that relays committed envelopes straight to `bus`.
    #[must_use]
    pub fn with_bus(bus: Arc<dyn EventBus>) -> Self {
        Self {
            state: Mutex::new(Inner::default()),
            bus: Some(bus),
        }
    }

    /// All ledger rows committed so far, in commit order.
    pub async fn movements(&self) -> Vec<StockMovement> {
        self.state.lock().await.movements.clone()
    }
}

impl ProductStore for InMemoryProductStore {
    fn load(&self, id: ProductId) -> BoxFuture<'_, Result<Option<Product>, StoreError>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.products.get(&id).cloned())
        })
    }

    fn insert(&self, product: Product) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.products.insert(product.id, product);
            Ok(())
        })
    }

    fn commit(
        &self,
        mut product: Product,
        expected_version: u64,
        outbox: Vec<EventEnvelope>,
        movements: Vec<StockMovement>,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;

            let stored_version = state
                .products
                .get(&product.id)
                .map(|p| p.version)
                .ok_or(StoreError::NotFound {
                    product_id: product.id,
                })?;
            if stored_version != expected_version {
                metrics::counter!("stock_version_conflicts_total").increment(1);
                return Err(StoreError::VersionConflict {
                    product_id: product.id,
                });
            }

            product.version = expected_version + 1;
            state.products.insert(product.id, product);
            state.movements.extend(movements);

            // Relay inside the commit lock so per-product publish order
            // matches commit order.
            if let Some(bus) = &self.bus {
                for envelope in &outbox {
                    bus.publish(envelope.topic(), envelope)
                        .await
                        .map_err(|e| StoreError::Backend(e.to_string()))?;
                    metrics::counter!("outbox_relayed_total").increment(1);
                }
            }
            Ok(())
        })
    }

    fn list_ids(&self) -> BoxFuture<'_, Result<Vec<ProductId>, StoreError>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.products.keys().copied().collect())
        })
    }

    fn find_by_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> BoxFuture<'_, Result<Option<ProductId>, StoreError>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .products
                .values()
                .find(|p| p.stock.reservations.contains_key(&reservation_id))
                .map(|p| p.id))
        })
    }

    fn find_by_order(
        &self,
        order_id: OrderId,
    ) -> BoxFuture<'_, Result<Vec<(ProductId, ReservationId)>, StoreError>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let mut pairs: Vec<(ProductId, ReservationId)> = state
                .products
                .values()
                .flat_map(|p| {
                    p.reservations_for_order(order_id)
                        .into_iter()
                        .map(|r| (p.id, r.id))
                        .collect::<Vec<_>>()
                })
                .collect();
            pairs.sort();
            Ok(pairs)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use merx_core::types::Quantity;

    fn product() -> Product {
        Product::new(
            ProductId::new(),
            "Widget".to_string(),
            Quantity::new(10),
            Quantity::new(2),
        )
    }

    #[tokio::test]
    async fn commit_bumps_version() {
        let store = InMemoryProductStore::new();
        let p = product();
        let id = p.id;
        store.insert(p).await.unwrap();

        let loaded = store.load(id).await.unwrap().unwrap();
        store
            .commit(loaded.clone(), loaded.version, vec![], vec![])
            .await
            .unwrap();

        assert_eq!(store.load(id).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn stale_commit_conflicts() {
        let store = InMemoryProductStore::new();
        let p = product();
        let id = p.id;
        store.insert(p).await.unwrap();

        let first = store.load(id).await.unwrap().unwrap();
        let second = first.clone();

        store.commit(first, 0, vec![], vec![]).await.unwrap();
        let err = store.commit(second, 0, vec![], vec![]).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn reservation_and_order_lookups() {
        let store = InMemoryProductStore::new();
        let mut p = product();
        let order_id = OrderId::new();
        let reservation_id = p
            .reserve(
                order_id,
                Quantity::new(2),
                chrono::Utc::now() + chrono::Duration::hours(1),
                chrono::Utc::now(),
            )
            .unwrap();
        let product_id = p.id;
        p.take_pending_events();
        p.take_pending_movements();
        store.insert(p).await.unwrap();

        assert_eq!(
            store.find_by_reservation(reservation_id).await.unwrap(),
            Some(product_id)
        );
        assert_eq!(
            store.find_by_order(order_id).await.unwrap(),
            vec![(product_id, reservation_id)]
        );
    }
}
