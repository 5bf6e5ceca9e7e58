//! Dead-letter recording seam.
//!
//! When a consumer exhausts its retry budget for a message, two things
//! happen: the envelope is republished to `<topic>-dlq` with headers
//! carrying the failure context, and the failure is recorded durably
//! through a [`DeadLetterSink`] so operators can list, resolve or discard
//! it later. The Postgres-backed sink lives in `merx-postgres`; tests use
//! the in-memory sink from the testing crate.

use crate::event::EventEnvelope;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from dead-letter sinks.
#[derive(Error, Debug, Clone)]
pub enum DeadLetterError {
    /// The backend is unreachable or failed the operation.
    #[error("Dead letter sink unavailable: {0}")]
    Unavailable(String),
}

/// The failure context of a message that exhausted its retry budget.
#[derive(Clone, Debug)]
pub struct DeadLetter {
    /// Topic the envelope originally arrived on.
    pub original_topic: String,
    /// The envelope that failed.
    pub envelope: EventEnvelope,
    /// Stable error class (the failure's error code).
    pub error_class: String,
    /// Human-readable error message.
    pub error_message: String,
    /// How many retries were attempted before giving up.
    pub retry_count: i32,
    /// When processing was abandoned.
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Capture the failure context for an envelope.
    #[must_use]
    pub fn new(
        envelope: EventEnvelope,
        error_class: impl Into<String>,
        error_message: impl Into<String>,
        retry_count: i32,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            original_topic: envelope.topic().to_string(),
            envelope,
            error_class: error_class.into(),
            error_message: error_message.into(),
            retry_count,
            failed_at,
        }
    }

    /// Headers attached to the `<topic>-dlq` republish.
    ///
    /// The broker offset is not observable above the [`crate::event_bus::EventBus`]
    /// abstraction; the globally unique `eventId` (already inside the
    /// envelope) is the replay key instead.
    #[must_use]
    pub fn headers(&self) -> Vec<(String, String)> {
        vec![
            (
                "x-dlq-original-topic".to_string(),
                self.original_topic.clone(),
            ),
            (
                "x-dlq-original-timestamp".to_string(),
                self.envelope.timestamp.to_rfc3339(),
            ),
            (
                "x-dlq-failed-at".to_string(),
                self.failed_at.to_rfc3339(),
            ),
            ("x-dlq-error-class".to_string(), self.error_class.clone()),
            (
                "x-dlq-error-message".to_string(),
                self.error_message.clone(),
            ),
            (
                "x-dlq-retry-count".to_string(),
                self.retry_count.to_string(),
            ),
        ]
    }
}

/// Durable store for dead-lettered messages.
///
/// Boxed futures keep the trait dyn-compatible; consumers hold an
/// `Arc<dyn DeadLetterSink>`.
pub trait DeadLetterSink: Send + Sync {
    /// Record a failure for later investigation.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError`] if the backend fails; callers log and
    /// continue (the `<topic>-dlq` republish still happens).
    fn record(
        &self,
        dead_letter: &DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>>;
}
