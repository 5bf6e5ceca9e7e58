//! Outbox relay: from committed rows to the bus.
//!
//! Services write envelopes into the `outbox` table inside the same
//! transaction as the state change. This relay polls unsent rows in insert
//! order (which is per-aggregate commit order, since commits serialize under
//! the aggregate lock), publishes them and marks them sent. Publishing is
//! at-least-once: a crash between publish and mark redelivers, and
//! consumers dedup on `event_id`.

use merx_core::event::EventEnvelope;
use merx_core::event_bus::EventBus;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors from the relay.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database failure.
    #[error("Outbox query failed: {0}")]
    Database(String),

    /// A stored payload could not be decoded.
    #[error("Outbox row {id} is corrupt: {reason}")]
    Corrupt {
        /// The offending row.
        id: i64,
        /// Decode failure detail.
        reason: String,
    },
}

/// Write one envelope into the outbox within an open transaction.
///
/// Service stores call this while committing aggregate state so the event
/// and the state change are atomic.
///
/// # Errors
///
/// Returns [`OutboxError::Database`] if the insert fails.
pub async fn enqueue(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    envelope: &EventEnvelope,
) -> Result<(), OutboxError> {
    let payload =
        serde_json::to_value(envelope).map_err(|e| OutboxError::Database(e.to_string()))?;

    sqlx::query(
        r"
        INSERT INTO outbox (event_id, aggregate_id, topic, payload)
        VALUES ($1, $2, $3, $4)
        ",
    )
    .bind(envelope.event_id)
    .bind(&envelope.aggregate_id)
    .bind(envelope.topic())
    .bind(payload)
    .execute(&mut **tx)
    .await
    .map_err(|e| OutboxError::Database(e.to_string()))?;

    Ok(())
}

/// Polls the outbox and publishes unsent envelopes.
pub struct OutboxRelay {
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    poll_interval: Duration,
    batch_size: i64,
}

impl OutboxRelay {
    /// Create a relay polling every 100 ms in batches of 100.
    #[must_use]
    pub fn new(pool: PgPool, bus: Arc<dyn EventBus>) -> Self {
        Self {
            pool,
            bus,
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
        }
    }

    /// Override the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run forever. Spawn as a background task.
    pub async fn run(self) {
        tracing::info!(
            interval_ms = self.poll_interval.as_millis(),
            "Outbox relay started"
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(err) = self.relay_batch().await {
                tracing::error!(error = %err, "Outbox relay batch failed");
            }
        }
    }

    /// Relay one batch of unsent rows; returns how many were published.
    ///
    /// Rows are taken in id order and marked sent one by one so a publish
    /// failure stops the aggregate's tail from overtaking its head.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] on database failure; publish failures stop
    /// the batch without error (the next tick retries).
    pub async fn relay_batch(&self) -> Result<usize, OutboxError> {
        let rows = sqlx::query(
            r"
            SELECT id, topic, payload
            FROM outbox
            WHERE sent_at IS NULL
            ORDER BY id ASC
            LIMIT $1
            ",
        )
        .bind(self.batch_size)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OutboxError::Database(e.to_string()))?;

        let mut relayed = 0usize;
        for row in rows {
            let id: i64 = row.get("id");
            let topic: String = row.get("topic");
            let payload: serde_json::Value = row.get("payload");

            let envelope: EventEnvelope =
                serde_json::from_value(payload).map_err(|e| OutboxError::Corrupt {
                    id,
                    reason: e.to_string(),
                })?;

            if let Err(err) = self.bus.publish(&topic, &envelope).await {
                tracing::warn!(outbox_id = id, topic = %topic, error = %err, "Publish failed, stopping batch");
                metrics::counter!("event_bus_publish_errors_total").increment(1);
                break;
            }

            sqlx::query("UPDATE outbox SET sent_at = NOW() WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| OutboxError::Database(e.to_string()))?;

            metrics::counter!("outbox_relayed_total").increment(1);
            relayed += 1;
        }

        Ok(relayed)
    }
}
