//! Consumer-side idempotency inbox.
//!
//! The bus is at-least-once, so every consumer records processed
//! `event_id`s for a sliding window (at least the reservation TTL plus the
//! retry window) and acknowledges duplicates without side effects.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

/// Errors from inbox backends.
#[derive(Error, Debug, Clone)]
pub enum InboxError {
    /// The backend is unreachable or failed the operation.
    #[error("Inbox unavailable: {0}")]
    Unavailable(String),
}

/// Processed-event registry with insert-if-absent semantics.
///
/// `mark_processed` returns `true` exactly once per event id within the
/// retention window; a second call is the duplicate signal.
pub trait Inbox: Send + Sync {
    /// Record `event_id` as processed at `now`.
    ///
    /// Returns `true` if this is the first time the id is seen, `false` if
    /// it is a duplicate.
    ///
    /// # Errors
    ///
    /// Returns [`InboxError`] if the backend fails.
    fn mark_processed(
        &self,
        event_id: Uuid,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, InboxError>> + Send + '_>>;
}

/// In-memory inbox with time-window pruning.
///
/// Suits tests and single-node deployments; clustered services use the
/// Postgres inbox so dedup survives restarts.
pub struct InMemoryInbox {
    retention: chrono::Duration,
    state: Mutex<InboxState>,
}

#[derive(Default)]
struct InboxState {
    seen: HashMap<Uuid, DateTime<Utc>>,
    order: VecDeque<(DateTime<Utc>, Uuid)>,
}

impl InMemoryInbox {
    /// Create an inbox that remembers ids for `retention`.
    #[must_use]
    pub fn new(retention: chrono::Duration) -> Self {
        Self {
            retention,
            state: Mutex::new(InboxState::default()),
        }
    }

    /// Number of ids currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.seen.len()).unwrap_or(0)
    }

    /// Whether the inbox is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inbox for InMemoryInbox {
    fn mark_processed(
        &self,
        event_id: Uuid,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, InboxError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self
                .state
                .lock()
                .map_err(|e| InboxError::Unavailable(e.to_string()))?;

            // Prune ids older than the retention window.
            let horizon = now - self.retention;
            while let Some((seen_at, id)) = state.order.front().copied() {
                if seen_at >= horizon {
                    break;
                }
                state.order.pop_front();
                state.seen.remove(&id);
            }

            if state.seen.contains_key(&event_id) {
                return Ok(false);
            }
            state.seen.insert(event_id, now);
            state.order.push_back((now, event_id));
            Ok(true)
        })
    }
}
