//! # Merx Postgres
//!
//! Postgres-backed infrastructure shared by the Merx services:
//!
//! - [`outbox`]: transactional event enqueue + the relay that publishes
//!   committed rows to the bus in per-aggregate order
//! - [`inbox`]: the consumer idempotency registry
//! - [`dead_letter_queue`]: durable record of messages that exhausted their
//!   retry budget
//! - [`lock_store`]: the cluster half of the distributed lock
//!
//! Aggregate-specific stores (products, orders) live in their owning
//! service crates; this crate carries only cross-service infrastructure and
//! the SQL migrations under `migrations/`.

pub mod dead_letter_queue;
pub mod inbox;
pub mod lock_store;
pub mod outbox;

pub use dead_letter_queue::{DeadLetterQueue, DlqStatus, FailedEvent};
pub use inbox::PostgresInbox;
pub use lock_store::PostgresLockStore;
pub use outbox::{OutboxRelay, enqueue};
