//! Event bus abstraction for cross-service communication.
//!
//! Services publish [`EventEnvelope`]s to contractual topics and subscribe to
//! the topics they react to. The bus is at-least-once: envelopes may be
//! delivered more than once and consumers dedup on `event_id` via their
//! inbox.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  1. Commit      │
//! │  state + outbox │◄─── Source of truth (one transaction)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  2. Outbox      │
//! │     relay       │◄─── At-least-once publish, per-aggregate order
//! └────────┬────────┘
//!          │
//!     ┌────┴────┐
//!     ▼         ▼
//! ┌───────┐ ┌───────┐
//! │ Order │ │ Inv.  │
//! │ saga  │ │ svc   │
//! └───────┘ └───────┘
//! ```
//!
//! # Key principles
//!
//! - **Outbox first**: envelopes are committed with the state change, then
//!   relayed; the bus is never written inside a domain transaction.
//! - **At-least-once delivery**: subscribers must be idempotent.
//! - **Ordered within aggregate**: envelopes from one aggregate keep their
//!   commit order; no order is promised across aggregates.

use crate::event::EventEnvelope;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an envelope to a topic.
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed.
        topic: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to subscribe to topics.
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe.
        topics: Vec<String>,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to decode an envelope from the wire.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Network or transport error.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Generic error for other failures.
    #[error("Event bus error: {0}")]
    Other(String),
}

/// Stream of envelopes from subscriptions.
///
/// Each item is a `Result` so transport errors surface in-band without
/// tearing down the whole subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope, EventBusError>> + Send>>;

/// Trait for event bus implementations.
///
/// Uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn` so the
/// trait stays dyn-compatible (`Arc<dyn EventBus>` is held by every service
/// and by the outbox relay).
///
/// # Implementations
///
/// - `merx_testing::InMemoryEventBus`: synchronous, records envelopes
/// - `merx_kafka::KafkaEventBus`: Kafka/Redpanda, consumer groups
pub trait EventBus: Send + Sync {
    /// Publish an envelope to a topic.
    ///
    /// Delivery is at-least-once; consumers must be idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the publish fails.
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Publish an envelope with transport headers attached.
    ///
    /// Used by the dead-letter path, whose `<topic>-dlq` republish carries
    /// the original topic, timestamps and error class/message as headers.
    /// The default implementation drops the headers for transports that
    /// have no header concept; header-capable implementations override it.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the publish fails.
    fn publish_with_headers(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
        headers: &[(String, String)],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let _ = headers;
        self.publish(topic, envelope)
    }

    /// Subscribe to one or more topics and receive a stream of envelopes.
    ///
    /// Implementations typically use consumer groups so multiple instances
    /// of the same service share the workload.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>>;
}
