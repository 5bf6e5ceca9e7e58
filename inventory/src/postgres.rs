//! Postgres product store.
//!
//! Aggregate state, outbox envelopes and ledger rows commit in one
//! transaction; the `UPDATE … WHERE version = $expected` guard turns
//! concurrent writers into retriable version conflicts. The database keeps
//! its own `CHECK` constraints on the quantity columns as the last line of
//! defense under the engine's invariant.

use crate::product::{Product, Reservation, ReservationState, Stock, StockMovement};
use crate::store::{ProductStore, StoreError};
use merx_core::event::EventEnvelope;
use merx_core::types::{OrderId, ProductId, Quantity, ReservationId};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Product store over the `products`, `stock_reservations`,
/// `stock_movements` and `outbox` tables.
pub struct PostgresProductStore {
    pool: PgPool,
}

impl PostgresProductStore {
    /// Create a store over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn state_to_str(state: ReservationState) -> &'static str {
    match state {
        ReservationState::Active => "ACTIVE",
        ReservationState::Confirmed => "CONFIRMED",
        ReservationState::Released => "RELEASED",
        ReservationState::Expired => "EXPIRED",
    }
}

fn state_from_str(s: &str) -> Result<ReservationState, StoreError> {
    match s {
        "ACTIVE" => Ok(ReservationState::Active),
        "CONFIRMED" => Ok(ReservationState::Confirmed),
        "RELEASED" => Ok(ReservationState::Released),
        "EXPIRED" => Ok(ReservationState::Expired),
        other => Err(StoreError::Backend(format!(
            "Invalid reservation state: {other}"
        ))),
    }
}

fn quantity_from_i32(value: i32, column: &str) -> Result<Quantity, StoreError> {
    u32::try_from(value)
        .map(Quantity::new)
        .map_err(|_| StoreError::Backend(format!("Negative {column} read back")))
}

impl ProductStore for PostgresProductStore {
    fn load(&self, id: ProductId) -> BoxFuture<'_, Result<Option<Product>, StoreError>> {
        Box::pin(async move {
            let Some(row) = sqlx::query(
                r"
                SELECT name, active, low_stock_threshold, available, reserved,
                       low_stock_crossings, below_threshold, version
                FROM products
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

            let reservation_rows = sqlx::query(
                r"
                SELECT id, order_id, quantity, expires_at, state
                FROM stock_reservations
                WHERE product_id = $1
                ",
            )
            .bind(id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

            let mut reservations = HashMap::with_capacity(reservation_rows.len());
            for r in &reservation_rows {
                let reservation_id = ReservationId::from_uuid(r.get("id"));
                let state: String = r.get("state");
                reservations.insert(
                    reservation_id,
                    Reservation {
                        id: reservation_id,
                        order_id: OrderId::from_uuid(r.get("order_id")),
                        quantity: quantity_from_i32(r.get("quantity"), "quantity")?,
                        expires_at: r.get("expires_at"),
                        state: state_from_str(&state)?,
                    },
                );
            }

            let version: i64 = row.get("version");
            let crossings: i64 = row.get("low_stock_crossings");
            Ok(Some(Product::restore(
                id,
                row.get("name"),
                row.get("active"),
                quantity_from_i32(row.get("low_stock_threshold"), "low_stock_threshold")?,
                Stock {
                    available: quantity_from_i32(row.get("available"), "available")?,
                    reserved: quantity_from_i32(row.get("reserved"), "reserved")?,
                    reservations,
                },
                u64::try_from(version).unwrap_or(0),
                u64::try_from(crossings).unwrap_or(0),
                row.get("below_threshold"),
            )))
        })
    }

    fn insert(&self, product: Product) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO products
                    (id, name, active, low_stock_threshold, available, reserved,
                     low_stock_crossings, below_threshold, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ",
            )
            .bind(product.id.as_uuid())
            .bind(&product.name)
            .bind(product.active)
            .bind(i32::try_from(product.low_stock_threshold.get()).unwrap_or(i32::MAX))
            .bind(i32::try_from(product.stock.available.get()).unwrap_or(i32::MAX))
            .bind(i32::try_from(product.stock.reserved.get()).unwrap_or(i32::MAX))
            .bind(i64::try_from(product.low_stock_crossings).unwrap_or(i64::MAX))
            .bind(product.below_threshold())
            .bind(i64::try_from(product.version).unwrap_or(0))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn commit(
        &self,
        product: Product,
        expected_version: u64,
        outbox: Vec<EventEnvelope>,
        movements: Vec<StockMovement>,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db_err)?;

            let expected = i64::try_from(expected_version).unwrap_or(0);
            let updated = sqlx::query(
                r"
                UPDATE products
                SET name = $2,
                    active = $3,
                    low_stock_threshold = $4,
                    available = $5,
                    reserved = $6,
                    low_stock_crossings = $7,
                    below_threshold = $8,
                    version = version + 1,
                    updated_at = NOW()
                WHERE id = $1 AND version = $9
                ",
            )
            .bind(product.id.as_uuid())
            .bind(&product.name)
            .bind(product.active)
            .bind(i32::try_from(product.low_stock_threshold.get()).unwrap_or(i32::MAX))
            .bind(i32::try_from(product.stock.available.get()).unwrap_or(i32::MAX))
            .bind(i32::try_from(product.stock.reserved.get()).unwrap_or(i32::MAX))
            .bind(i64::try_from(product.low_stock_crossings).unwrap_or(i64::MAX))
            .bind(product.below_threshold())
            .bind(expected)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            if updated.rows_affected() == 0 {
                tx.rollback().await.map_err(db_err)?;
                metrics::counter!("stock_version_conflicts_total").increment(1);
                return Err(StoreError::VersionConflict {
                    product_id: product.id,
                });
            }

            for reservation in product.stock.reservations.values() {
                sqlx::query(
                    r"
                    INSERT INTO stock_reservations
                        (id, product_id, order_id, quantity, expires_at, state)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (id) DO UPDATE
                    SET state = EXCLUDED.state,
                        expires_at = EXCLUDED.expires_at,
                        updated_at = NOW()
                    ",
                )
                .bind(reservation.id.as_uuid())
                .bind(product.id.as_uuid())
                .bind(reservation.order_id.as_uuid())
                .bind(i32::try_from(reservation.quantity.get()).unwrap_or(i32::MAX))
                .bind(reservation.expires_at)
                .bind(state_to_str(reservation.state))
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }

            for movement in &movements {
                sqlx::query(
                    r"
                    INSERT INTO stock_movements
                        (product_id, movement_type, quantity, balance_before,
                         balance_after, reference_id, occurred_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ",
                )
                .bind(movement.product_id.as_uuid())
                .bind(movement.movement_type.as_str())
                .bind(i32::try_from(movement.quantity.get()).unwrap_or(i32::MAX))
                .bind(i32::try_from(movement.balance_before.get()).unwrap_or(i32::MAX))
                .bind(i32::try_from(movement.balance_after.get()).unwrap_or(i32::MAX))
                .bind(&movement.reference_id)
                .bind(movement.occurred_at)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }

            for envelope in &outbox {
                merx_postgres::outbox::enqueue(&mut tx, envelope)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
            }

            tx.commit().await.map_err(db_err)?;
            Ok(())
        })
    }

    fn list_ids(&self) -> BoxFuture<'_, Result<Vec<ProductId>, StoreError>> {
        Box::pin(async move {
            let rows = sqlx::query("SELECT id FROM products")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
            Ok(rows
                .iter()
                .map(|r| ProductId::from_uuid(r.get("id")))
                .collect())
        })
    }

    fn find_by_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> BoxFuture<'_, Result<Option<ProductId>, StoreError>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT product_id FROM stock_reservations WHERE id = $1")
                .bind(reservation_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
            Ok(row.map(|r| ProductId::from_uuid(r.get("product_id"))))
        })
    }

    fn find_by_order(
        &self,
        order_id: OrderId,
    ) -> BoxFuture<'_, Result<Vec<(ProductId, ReservationId)>, StoreError>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT product_id, id
                FROM stock_reservations
                WHERE order_id = $1 AND state = 'ACTIVE'
                ORDER BY product_id
                ",
            )
            .bind(order_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
            Ok(rows
                .iter()
                .map(|r| {
                    (
                        ProductId::from_uuid(r.get("product_id")),
                        ReservationId::from_uuid(r.get("id")),
                    )
                })
                .collect())
        })
    }
}
