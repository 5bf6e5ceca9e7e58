//! Order persistence seam.
//!
//! Same shape as the inventory store: optimistic version guard, state and
//! outbox committed together, an in-memory implementation for tests and
//! single-node runs, Postgres in `postgres.rs`.

use crate::order::Order;
use chrono::{DateTime, Utc};
use merx_core::error::{Classify, ErrorKind};
use merx_core::event::EventEnvelope;
use merx_core::event_bus::EventBus;
use merx_core::types::{CustomerId, OrderId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from order persistence.
#[derive(Error, Debug, Clone)]
pub enum OrderStoreError {
    /// Another writer committed the order since it was loaded.
    #[error("Version conflict committing order {order_id}")]
    VersionConflict {
        /// The contended order.
        order_id: OrderId,
    },

    /// The order does not exist.
    #[error("Order {order_id} not found")]
    NotFound {
        /// The missing order.
        order_id: OrderId,
    },

    /// The backend failed.
    #[error("Order store failure: {0}")]
    Backend(String),
}

impl Classify for OrderStoreError {
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
            Self::NotFound { .. } => "ORDER_NOT_FOUND",
            Self::Backend(_) => "STORE_FAILURE",
        }
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Authoritative order storage.
pub trait OrderStore: Send + Sync {
    /// Load an order snapshot by id.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::Backend`] on backend failure.
    fn load(&self, id: OrderId) -> BoxFuture<'_, Result<Option<Order>, OrderStoreError>>;

    /// Insert a new order together with its creation envelope(s).
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::Backend`] on backend failure.
    fn insert(
        &self,
        order: Order,
        outbox: Vec<EventEnvelope>,
    ) -> BoxFuture<'_, Result<(), OrderStoreError>>;

    /// Commit a mutated order with its outbox, guarded by
    /// `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::VersionConflict`] if the stored version
    /// moved, [`OrderStoreError::Backend`] on backend failure.
    fn commit(
        &self,
        order: Order,
        expected_version: u64,
        outbox: Vec<EventEnvelope>,
    ) -> BoxFuture<'_, Result<(), OrderStoreError>>;

    /// Find an order by the (customer, item-multiset) fingerprint created
    /// at or after `since` (the duplicate-order guard).
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::Backend`] on backend failure.
    fn find_duplicate(
        &self,
        customer_id: CustomerId,
        fingerprint: &str,
        since: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<OrderId>, OrderStoreError>>;
}

/// In-memory order store with optional direct bus relay.
pub struct InMemoryOrderStore {
    state: Mutex<HashMap<OrderId, Order>>,
    bus: Option<Arc<dyn EventBus>>,
}

impl Default for InMemoryOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOrderStore {
    /// Create an empty store with no relay.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            bus: None,
        }
    }

    /// Create a store that relays committed envelopes straight to `bus`.
    #[must_use]
    pub fn with_bus(bus: Arc<dyn EventBus>) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            bus: Some(bus),
        }
    }

    async fn relay(&self, outbox: &[EventEnvelope]) -> Result<(), OrderStoreError> {
        if let Some(bus) = &self.bus {
            for envelope in outbox {
                bus.publish(envelope.topic(), envelope)
                    .await
                    .map_err(|e| OrderStoreError::Backend(e.to_string()))?;
            }
        }
        Ok(())
    }
}

impl OrderStore for InMemoryOrderStore {
    fn load(&self, id: OrderId) -> BoxFuture<'_, Result<Option<Order>, OrderStoreError>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.get(&id).cloned())
        })
    }

    fn insert(
        &self,
        order: Order,
        outbox: Vec<EventEnvelope>,
    ) -> BoxFuture<'_, Result<(), OrderStoreError>> {
        Box::pin(async move {
            {
                let mut state = self.state.lock().await;
                state.insert(order.id, order);
            }
            self.relay(&outbox).await
        })
    }

    fn commit(
        &self,
        mut order: Order,
        expected_version: u64,
        outbox: Vec<EventEnvelope>,
    ) -> BoxFuture<'_, Result<(), OrderStoreError>> {
        Box::pin(async move {
            {
                let mut state = self.state.lock().await;
                let stored_version = state
                    .get(&order.id)
                    .map(|o| o.version)
                    .ok_or(OrderStoreError::NotFound { order_id: order.id })?;
                if stored_version != expected_version {
                    return Err(OrderStoreError::VersionConflict { order_id: order.id });
                }
                order.version = expected_version + 1;
                state.insert(order.id, order);
            }
            self.relay(&outbox).await
        })
    }

    fn find_duplicate(
        &self,
        customer_id: CustomerId,
        fingerprint: &str,
        since: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<OrderId>, OrderStoreError>> {
        let fingerprint = fingerprint.to_string();
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .values()
                .find(|order| {
                    order.customer_id == customer_id
                        && order.created_at >= since
                        && order.fingerprint() == fingerprint
                })
                .map(|order| order.id))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use merx_core::types::{Currency, Money, OrderItem, ProductId, Quantity};
    use rust_decimal::Decimal;

    fn order() -> Order {
        Order::new(
            CustomerId::new(),
            vec![OrderItem::new(
                ProductId::new(),
                "Widget".to_string(),
                Quantity::new(1),
                Money::new(Decimal::new(1000, 2), Currency::USD),
            )],
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn commit_bumps_version_and_conflicts_on_stale() {
        let store = InMemoryOrderStore::new();
        let order = order();
        let id = order.id;
        store.insert(order, vec![]).await.unwrap();

        let first = store.load(id).await.unwrap().unwrap();
        let stale = first.clone();

        store.commit(first, 0, vec![]).await.unwrap();
        assert_eq!(store.load(id).await.unwrap().unwrap().version, 1);

        let err = store.commit(stale, 0, vec![]).await.unwrap_err();
        assert!(matches!(err, OrderStoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn duplicate_lookup_honors_window() {
        let store = InMemoryOrderStore::new();
        let order = order();
        let customer = order.customer_id;
        let fingerprint = order.fingerprint();
        let created = order.created_at;
        store.insert(order, vec![]).await.unwrap();

        let hit = store
            .find_duplicate(customer, &fingerprint, created - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert!(hit.is_some());

        let miss = store
            .find_duplicate(customer, &fingerprint, created + chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert!(miss.is_none());
    }
}
