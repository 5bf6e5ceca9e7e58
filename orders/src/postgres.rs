//! Postgres order store.
//!
//! Orders and their items persist across `orders` + `order_items`;
//! the reservation map rides along as JSONB. Commits are guarded by the
//! version column and write the outbox in the same transaction.

use crate::order::{Order, OrderStatus};
use crate::store::{OrderStore, OrderStoreError};
use chrono::{DateTime, Utc};
use merx_core::event::EventEnvelope;
use merx_core::types::{
    Currency, CustomerId, Money, OrderId, OrderItem, ProductId, Quantity, ReservationId,
};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Order store over the `orders` and `order_items` tables.
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Create a store over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> OrderStoreError {
    OrderStoreError::Backend(e.to_string())
}

fn status_to_str(status: OrderStatus) -> String {
    status.to_string()
}

fn status_from_str(s: &str) -> Result<OrderStatus, OrderStoreError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| OrderStoreError::Backend(format!("Invalid order status: {s}")))
}

fn currency_from_str(code: &str) -> Result<Currency, OrderStoreError> {
    Currency::new(code.trim())
        .map_err(|e| OrderStoreError::Backend(format!("Invalid currency read back: {e}")))
}

impl OrderStore for PostgresOrderStore {
    fn load(&self, id: OrderId) -> BoxFuture<'_, Result<Option<Order>, OrderStoreError>> {
        Box::pin(async move {
            let Some(row) = sqlx::query(
                r"
                SELECT customer_id, status, total_amount, currency, reservations,
                       cancelled_reason, version, created_at
                FROM orders
                WHERE id = $1
                ",
            )
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            else {
                return Ok(None);
            };

            let item_rows = sqlx::query(
                r"
                SELECT product_id, name, quantity, unit_price, currency
                FROM order_items
                WHERE order_id = $1
                ORDER BY position
                ",
            )
            .bind(id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

            let mut items = Vec::with_capacity(item_rows.len());
            for r in &item_rows {
                let quantity: i32 = r.get("quantity");
                let currency: String = r.get("currency");
                items.push(OrderItem::new(
                    ProductId::from_uuid(r.get("product_id")),
                    r.get("name"),
                    Quantity::new(u32::try_from(quantity).unwrap_or(0)),
                    Money::new(r.get::<Decimal, _>("unit_price"), currency_from_str(&currency)?),
                ));
            }

            let status: String = row.get("status");
            let currency: String = row.get("currency");
            let reservations_json: serde_json::Value = row.get("reservations");
            let reservations: BTreeMap<ProductId, ReservationId> =
                serde_json::from_value(reservations_json)
                    .map_err(|e| OrderStoreError::Backend(e.to_string()))?;
            let version: i64 = row.get("version");

            Ok(Some(Order {
                id,
                customer_id: CustomerId::from_uuid(row.get("customer_id")),
                items,
                status: status_from_str(&status)?,
                total_amount: Money::new(
                    row.get::<Decimal, _>("total_amount"),
                    currency_from_str(&currency)?,
                ),
                reservations,
                created_at: row.get::<DateTime<Utc>, _>("created_at"),
                cancelled_reason: row.get("cancelled_reason"),
                version: u64::try_from(version).unwrap_or(0),
            }))
        })
    }

    fn insert(
        &self,
        order: Order,
        outbox: Vec<EventEnvelope>,
    ) -> BoxFuture<'_, Result<(), OrderStoreError>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db_err)?;

            let reservations = serde_json::to_value(&order.reservations)
                .map_err(|e| OrderStoreError::Backend(e.to_string()))?;
            sqlx::query(
                r"
                INSERT INTO orders
                    (id, customer_id, status, total_amount, currency, reservations,
                     cancelled_reason, version, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ",
            )
            .bind(order.id.as_uuid())
            .bind(order.customer_id.as_uuid())
            .bind(status_to_str(order.status))
            .bind(order.total_amount.amount())
            .bind(order.total_amount.currency().as_str())
            .bind(reservations)
            .bind(&order.cancelled_reason)
            .bind(i64::try_from(order.version).unwrap_or(0))
            .bind(order.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            for (position, item) in order.items.iter().enumerate() {
                sqlx::query(
                    r"
                    INSERT INTO order_items
                        (order_id, product_id, name, quantity, unit_price, currency, position)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ",
                )
                .bind(order.id.as_uuid())
                .bind(item.product_id.as_uuid())
                .bind(&item.name)
                .bind(i32::try_from(item.quantity.get()).unwrap_or(i32::MAX))
                .bind(item.unit_price.amount())
                .bind(item.unit_price.currency().as_str())
                .bind(i32::try_from(position).unwrap_or(i32::MAX))
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }

            for envelope in &outbox {
                merx_postgres::outbox::enqueue(&mut tx, envelope)
                    .await
                    .map_err(|e| OrderStoreError::Backend(e.to_string()))?;
            }

            tx.commit().await.map_err(db_err)?;
            Ok(())
        })
    }

    fn commit(
        &self,
        order: Order,
        expected_version: u64,
        outbox: Vec<EventEnvelope>,
    ) -> BoxFuture<'_, Result<(), OrderStoreError>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db_err)?;

            let reservations = serde_json::to_value(&order.reservations)
                .map_err(|e| OrderStoreError::Backend(e.to_string()))?;
            let updated = sqlx::query(
                r"
                UPDATE orders
                SET status = $2,
                    reservations = $3,
                    cancelled_reason = $4,
                    version = version + 1,
                    updated_at = NOW()
                WHERE id = $1 AND version = $5
                ",
            )
            .bind(order.id.as_uuid())
            .bind(status_to_str(order.status))
            .bind(reservations)
            .bind(&order.cancelled_reason)
            .bind(i64::try_from(expected_version).unwrap_or(0))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            if updated.rows_affected() == 0 {
                tx.rollback().await.map_err(db_err)?;
                return Err(OrderStoreError::VersionConflict { order_id: order.id });
            }

            for envelope in &outbox {
                merx_postgres::outbox::enqueue(&mut tx, envelope)
                    .await
                    .map_err(|e| OrderStoreError::Backend(e.to_string()))?;
            }

            tx.commit().await.map_err(db_err)?;
            Ok(())
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
            // Candidate set is small (one customer, minutes of history), so
            // fingerprints are recomputed in process rather than stored.
            let rows = sqlx::query(
                r"
                SELECT id
                FROM orders
                WHERE customer_id = $1 AND created_at >= $2
                ORDER BY created_at DESC
                LIMIT 50
                ",
            )
            .bind(customer_id.as_uuid())
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

            for row in rows {
                let id = OrderId::from_uuid(row.get("id"));
                if let Some(order) = self.load(id).await? {
                    if order.fingerprint() == fingerprint {
                        return Ok(Some(id));
                    }
                }
            }
            Ok(None)
        })
    }
}
