//! Postgres-backed cluster lock store.
//!
//! One row per key with holder, fence counter and lease deadline. All
//! operations are single conditional statements, so correctness does not
//! depend on transaction isolation tricks: the row either matched and was
//! updated, or it wasn't.

use merx_lock::store::{FencingToken, LockStore, LockStoreError};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Lock store over the `locks` table.
pub struct PostgresLockStore {
    pool: PgPool,
}

impl PostgresLockStore {
    /// Create a store over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[allow(clippy::cast_possible_truncation)] // Lease millis fit i64
fn lease_millis(lease: Duration) -> i64 {
    i64::try_from(lease.as_millis()).unwrap_or(i64::MAX)
}

impl LockStore for PostgresLockStore {
    fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<FencingToken>, LockStoreError>> + Send + '_>>
    {
        let key = key.to_string();
        let holder = holder.to_string();
        Box::pin(async move {
            // Insert a fresh row, or take over when the row is ours or its
            // lease expired; the fence bumps on every ownership change.
            let row = sqlx::query(
                r"
                INSERT INTO locks (key, holder, fence, expires_at)
                VALUES ($1, $2, 1, NOW() + make_interval(secs => $3 / 1000.0))
                ON CONFLICT (key) DO UPDATE
                SET holder = EXCLUDED.holder,
                    fence = CASE
                        WHEN locks.holder = EXCLUDED.holder AND locks.expires_at > NOW()
                            THEN locks.fence
                        ELSE locks.fence + 1
                    END,
                    expires_at = EXCLUDED.expires_at
                WHERE locks.holder = EXCLUDED.holder OR locks.expires_at <= NOW()
                RETURNING fence
                ",
            )
            .bind(&key)
            .bind(&holder)
            .bind(lease_millis(lease))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LockStoreError::Unavailable(e.to_string()))?;

            Ok(row.map(|r| {
                let fence: i64 = r.get("fence");
                FencingToken::new(u64::try_from(fence).unwrap_or(0))
            }))
        })
    }

    fn renew(
        &self,
        key: &str,
        holder: &str,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LockStoreError>> + Send + '_>> {
        let key = key.to_string();
        let holder = holder.to_string();
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE locks
                SET expires_at = NOW() + make_interval(secs => $3 / 1000.0)
                WHERE key = $1 AND holder = $2 AND expires_at > NOW()
                ",
            )
            .bind(&key)
            .bind(&holder)
            .bind(lease_millis(lease))
            .execute(&self.pool)
            .await
            .map_err(|e| LockStoreError::Unavailable(e.to_string()))?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn release(
        &self,
        key: &str,
        holder: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), LockStoreError>> + Send + '_>> {
        let key = key.to_string();
        let holder = holder.to_string();
        Box::pin(async move {
            // Expire the row instead of deleting it: the fence column must
            // survive so tokens stay monotonic per key.
            sqlx::query(
                "UPDATE locks SET expires_at = NOW() WHERE key = $1 AND holder = $2",
            )
            .bind(&key)
            .bind(&holder)
            .execute(&self.pool)
            .await
            .map_err(|e| LockStoreError::Unavailable(e.to_string()))?;
            Ok(())
        })
    }
}
