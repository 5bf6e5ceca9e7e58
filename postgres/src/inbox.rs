//! Postgres-backed consumer inbox.
//!
//! `INSERT … ON CONFLICT DO NOTHING` gives the insert-if-absent semantics;
//! rows older than the retention window are pruned opportunistically.

use chrono::{DateTime, Utc};
use merx_core::inbox::{Inbox, InboxError};
use sqlx::PgPool;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Prune roughly every this many inserts.
const PRUNE_EVERY: u64 = 1024;

/// Postgres inbox with time-window retention.
pub struct PostgresInbox {
    pool: PgPool,
    retention: chrono::Duration,
    inserts: AtomicU64,
}

impl PostgresInbox {
    /// Create an inbox retaining ids for `retention`.
    #[must_use]
    pub fn new(pool: PgPool, retention: chrono::Duration) -> Self {
        Self {
            pool,
            retention,
            inserts: AtomicU64::new(0),
        }
    }

    async fn prune(&self, now: DateTime<Utc>) -> Result<(), InboxError> {
        let horizon = now - self.retention;
        sqlx::query("DELETE FROM processed_events WHERE processed_at < $1")
            .bind(horizon)
            .execute(&self.pool)
            .await
            .map_err(|e| InboxError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

impl Inbox for PostgresInbox {
    fn mark_processed(
        &self,
        event_id: Uuid,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, InboxError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                INSERT INTO processed_events (event_id, processed_at)
                VALUES ($1, $2)
                ON CONFLICT (event_id) DO NOTHING
                ",
            )
            .bind(event_id)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| InboxError::Unavailable(e.to_string()))?;

            if self.inserts.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == 0 {
                self.prune(now).await?;
            }

            Ok(result.rows_affected() == 1)
        })
    }
}
