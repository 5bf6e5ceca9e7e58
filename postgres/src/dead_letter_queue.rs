//! Dead Letter Queue (DLQ) for failed events.
//!
//! Provides persistent storage and management of envelopes that failed
//! processing after exhausting retries. Enables observability, incident
//! response, and manual reprocessing workflows. Bus-side, dead-lettered
//! messages also go to the `<topic>-dlq` topic; this table is the durable,
//! queryable record.

use chrono::{DateTime, Utc};
use merx_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use merx_core::event::EventEnvelope;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from DLQ operations.
#[derive(Error, Debug)]
pub enum DlqError {
    /// Database failure.
    #[error("DLQ query failed: {0}")]
    Database(String),

    /// An unknown status string was read back.
    #[error("Invalid DLQ status: {0}")]
    InvalidStatus(String),
}

/// Status of a failed event in the Dead Letter Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlqStatus {
    /// Event is pending investigation/reprocessing.
    Pending,
    /// Event is currently being reprocessed.
    Processing,
    /// Event was successfully reprocessed.
    Resolved,
    /// Event was permanently discarded (cannot be fixed).
    Discarded,
}

impl DlqStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::InvalidStatus`] for unknown strings.
    pub fn parse(s: &str) -> Result<Self, DlqError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(DlqError::InvalidStatus(s.to_string())),
        }
    }
}

/// An entry in the Dead Letter Queue.
///
/// Contains the failed envelope plus failure metadata for troubleshooting.
#[derive(Debug, Clone)]
pub struct FailedEvent {
    /// Unique identifier for this DLQ entry.
    pub id: i64,

    /// Topic the envelope originally arrived on.
    pub topic: String,

    /// The envelope that failed.
    pub envelope: EventEnvelope,

    /// Error message from the failure.
    pub error_message: String,

    /// Full error details (debug output), if captured.
    pub error_details: Option<String>,

    /// Number of times processing was retried.
    pub retry_count: i32,

    /// When this event first failed.
    pub first_failed_at: DateTime<Utc>,

    /// When this event most recently failed.
    pub last_failed_at: DateTime<Utc>,

    /// Current processing status.
    pub status: DlqStatus,

    /// When the failure was resolved (if applicable).
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who/what resolved the failure.
    pub resolved_by: Option<String>,

    /// Notes about the resolution.
    pub resolution_notes: Option<String>,
}

/// Postgres-based Dead Letter Queue for failed envelopes.
///
/// # Example
///
/// ```no_run
/// use merx_postgres::{DeadLetterQueue, DlqStatus};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// let pending = dlq.list_pending(100).await?;
/// if let Some(first) = pending.first() {
///     dlq.update_status(first.id, DlqStatus::Processing).await?;
/// }
/// # Ok(())
/// # }
/// ```
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add a failed envelope to the DLQ.
    ///
    /// Returns the unique ID of the created entry.
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::Database`] if the insert fails.
    pub async fn add_entry(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
        error_message: &str,
        error_details: Option<&str>,
        retry_count: i32,
    ) -> Result<i64, DlqError> {
        let payload =
            serde_json::to_value(envelope).map_err(|e| DlqError::Database(e.to_string()))?;

        let id: (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_events (
                topic, event_id, event_type, aggregate_id, payload,
                original_timestamp, error_message, error_details, retry_count
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            ",
        )
        .bind(topic)
        .bind(envelope.event_id)
        .bind(&envelope.event_type)
        .bind(&envelope.aggregate_id)
        .bind(payload)
        .bind(envelope.timestamp)
        .bind(error_message)
        .bind(error_details)
        .bind(retry_count)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DlqError::Database(e.to_string()))?;

        tracing::warn!(
            dlq_id = id.0,
            topic = topic,
            event_type = %envelope.event_type,
            error = error_message,
            retry_count = retry_count,
            "Event added to Dead Letter Queue"
        );

        metrics::counter!("dlq_messages_total", "event_type" => envelope.event_type.clone())
            .increment(1);

        Ok(id.0)
    }

    /// List pending failed events, oldest first (FIFO processing).
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::Database`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedEvent>, DlqError> {
        self.list_by_status(DlqStatus::Pending, limit).await
    }

    /// List failed events by status.
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::Database`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DlqStatus,
        limit: usize,
    ) -> Result<Vec<FailedEvent>, DlqError> {
        #[allow(clippy::cast_possible_wrap)] // Limit is reasonable size, i64 is safe
        let rows = sqlx::query(
            r"
            SELECT
                id, topic, payload, error_message, error_details, retry_count,
                first_failed_at, last_failed_at, status,
                resolved_at, resolved_by, resolution_notes
            FROM failed_events
            WHERE status = $1
            ORDER BY first_failed_at ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DlqError::Database(e.to_string()))?;

        rows.iter().map(Self::row_to_failed_event).collect()
    }

    /// Update the status of a failed event.
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::Database`] if the update fails.
    pub async fn update_status(&self, id: i64, status: DlqStatus) -> Result<(), DlqError> {
        sqlx::query(
            r"
            UPDATE failed_events
            SET status = $1, last_failed_at = NOW()
            WHERE id = $2
            ",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DlqError::Database(e.to_string()))?;

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");

        Ok(())
    }

    /// Mark a failed event as resolved.
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::Database`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), DlqError> {
        sqlx::query(
            r"
            UPDATE failed_events
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DlqError::Database(e.to_string()))?;

        tracing::info!(dlq_id = id, resolved_by = resolved_by, "DLQ entry marked as resolved");

        Ok(())
    }

    /// Mark a failed event as discarded (permanently failed).
    ///
    /// Use when a failure cannot be fixed (data corruption, schema
    /// mismatch).
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::Database`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), DlqError> {
        sqlx::query(
            r"
            UPDATE failed_events
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DlqError::Database(e.to_string()))?;

        tracing::warn!(dlq_id = id, reason = reason, "DLQ entry marked as discarded");

        Ok(())
    }

    /// Get count of pending failures (for monitoring and health checks).
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::Database`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, DlqError> {
        let (count,): (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*)
            FROM failed_events
            WHERE status = 'pending'
            ",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DlqError::Database(e.to_string()))?;

        Ok(count)
    }

    /// Convert a database row to a [`FailedEvent`].
    fn row_to_failed_event(row: &sqlx::postgres::PgRow) -> Result<FailedEvent, DlqError> {
        let payload: serde_json::Value = row.get("payload");
        let envelope: EventEnvelope =
            serde_json::from_value(payload).map_err(|e| DlqError::Database(e.to_string()))?;

        let status_str: String = row.get("status");
        let status = DlqStatus::parse(&status_str)?;

        Ok(FailedEvent {
            id: row.get("id"),
            topic: row.get("topic"),
            envelope,
            error_message: row.get("error_message"),
            error_details: row.get("error_details"),
            retry_count: row.get("retry_count"),
            first_failed_at: row.get("first_failed_at"),
            last_failed_at: row.get("last_failed_at"),
            status,
            resolved_at: row.get("resolved_at"),
            resolved_by: row.get("resolved_by"),
            resolution_notes: row.get("resolution_notes"),
        })
    }
}

/// The consumer-facing sink: every message that exhausts its retry budget
/// lands in `failed_events` through here.
impl DeadLetterSink for DeadLetterQueue {
    fn record(
        &self,
        dead_letter: &DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        let dead_letter = dead_letter.clone();
        Box::pin(async move {
            self.add_entry(
                &dead_letter.original_topic,
                &dead_letter.envelope,
                &dead_letter.error_message,
                Some(&dead_letter.error_class),
                dead_letter.retry_count,
            )
            .await
            .map_err(|e| DeadLetterError::Unavailable(e.to_string()))?;
            Ok(())
        })
    }
}
