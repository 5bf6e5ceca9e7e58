//! # Merx Testing
//!
//! Testing utilities and mocks for the Merx platform.
//!
//! This crate provides:
//! - A deterministic [`mocks::FixedClock`]
//! - An [`mocks::InMemoryEventBus`] that records publishes (headers
//!   included) and fans out to subscribers
//! - An [`mocks::InMemoryDeadLetters`] sink recording exhausted messages
//!
//! ## Example
//!
//! ```rust
//! use merx_testing::{mocks::InMemoryEventBus, test_clock};
//! use merx_core::Clock;
//!
//! let clock = test_clock();
//! assert_eq!(clock.now(), clock.now());
//!
//! let bus = InMemoryEventBus::new();
//! assert!(bus.published().is_empty());
//! ```

use chrono::{DateTime, Utc};

/// Mock implementations of platform traits.
pub mod mocks {
    use super::{DateTime, Utc};
    use futures::Stream;
    use merx_core::clock::Clock;
    use merx_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
    use merx_core::event::EventEnvelope;
    use merx_core::event_bus::{EventBus, EventBusError, EventStream};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use tokio::sync::broadcast;
    use uuid::Uuid;

    /// Fixed clock for deterministic tests.
    ///
    /// Always returns the same time unless advanced explicitly.
    ///
    /// # Example
    ///
    /// ```
    /// use merx_testing::mocks::FixedClock;
    /// use merx_core::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug)]
    pub struct FixedClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl FixedClock {
        /// Create a new fixed clock at the given time.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward, for expiry and window tests.
        pub fn advance(&self, by: chrono::Duration) {
            if let Ok(mut time) = self.time.lock() {
                *time += by;
            }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time.lock().map(|t| *t).unwrap_or_else(|_| Utc::now())
        }
    }

    /// In-memory event bus for tests.
    ///
    /// Records every published envelope in publish order (per topic and
    /// globally), together with any transport headers, and fans envelopes
    /// out to live subscribers through a broadcast channel.
    pub struct InMemoryEventBus {
        published: Mutex<Vec<(String, EventEnvelope, Vec<(String, String)>)>>,
        sender: broadcast::Sender<(String, EventEnvelope)>,
    }

    impl Default for InMemoryEventBus {
        fn default() -> Self {
            Self::new()
        }
    }

    impl InMemoryEventBus {
        /// Create an empty bus.
        #[must_use]
        pub fn new() -> Self {
            let (sender, _) = broadcast::channel(1024);
            Self {
                published: Mutex::new(Vec::new()),
                sender,
            }
        }

        /// All envelopes published so far, in publish order.
        #[must_use]
        pub fn published(&self) -> Vec<EventEnvelope> {
            self.published
                .lock()
                .map(|p| p.iter().map(|(_, e, _)| e.clone()).collect())
                .unwrap_or_default()
        }

        /// Envelopes published to one topic, in publish order.
        #[must_use]
        pub fn published_on(&self, topic: &str) -> Vec<EventEnvelope> {
            self.published
                .lock()
                .map(|p| {
                    p.iter()
                        .filter(|(t, _, _)| t == topic)
                        .map(|(_, e, _)| e.clone())
                        .collect()
                })
                .unwrap_or_default()
        }

        /// Transport headers attached to the first publish of `event_id`.
        #[must_use]
        pub fn headers_of(&self, event_id: Uuid) -> Vec<(String, String)> {
            self.published
                .lock()
                .map(|p| {
                    p.iter()
                        .find(|(_, e, _)| e.event_id == event_id)
                        .map(|(_, _, headers)| headers.clone())
                        .unwrap_or_default()
                })
                .unwrap_or_default()
        }

        /// Forget everything published so far.
        pub fn clear(&self) {
            if let Ok(mut published) = self.published.lock() {
                published.clear();
            }
        }
    }

    impl EventBus for InMemoryEventBus {
        fn publish(
            &self,
            topic: &str,
            envelope: &EventEnvelope,
        ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
            self.publish_with_headers(topic, envelope, &[])
        }

        fn publish_with_headers(
            &self,
            topic: &str,
            envelope: &EventEnvelope,
            headers: &[(String, String)],
        ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
            let topic = topic.to_string();
            let envelope = envelope.clone();
            let headers = headers.to_vec();
            Box::pin(async move {
                if let Ok(mut published) = self.published.lock() {
                    published.push((topic.clone(), envelope.clone(), headers));
                }
                // No live subscriber is fine in tests.
                let _ = self.sender.send((topic, envelope));
                Ok(())
            })
        }

        fn subscribe(
            &self,
            topics: &[&str],
        ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
            let topics: Vec<String> = topics.iter().map(ToString::to_string).collect();
            let receiver = self.sender.subscribe();
            Box::pin(async move {
                let stream = subscription_stream(receiver, topics);
                Ok(Box::pin(stream) as EventStream)
            })
        }
    }

    fn subscription_stream(
        mut receiver: broadcast::Receiver<(String, EventEnvelope)>,
        topics: Vec<String>,
    ) -> impl Stream<Item = Result<EventEnvelope, EventBusError>> + Send {
        async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok((topic, envelope)) => {
                        if topics.iter().any(|t| *t == topic) {
                            yield Ok(envelope);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        yield Err(EventBusError::Other(format!("subscriber lagged by {missed}")));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// In-memory dead-letter sink for tests.
    #[derive(Default)]
    pub struct InMemoryDeadLetters {
        entries: Mutex<Vec<DeadLetter>>,
    }

    impl InMemoryDeadLetters {
        /// Create an empty sink.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// All recorded dead letters, in record order.
        #[must_use]
        pub fn entries(&self) -> Vec<DeadLetter> {
            self.entries
                .lock()
                .map(|entries| entries.clone())
                .unwrap_or_default()
        }
    }

    impl DeadLetterSink for InMemoryDeadLetters {
        fn record(
            &self,
            dead_letter: &DeadLetter,
        ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
            let dead_letter = dead_letter.clone();
            Box::pin(async move {
                self.entries
                    .lock()
                    .map_err(|e| DeadLetterError::Unavailable(e.to_string()))?
                    .push(dead_letter);
                Ok(())
            })
        }
    }
}

/// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC).
///
/// # Panics
///
/// This function will panic if the hardcoded timestamp fails to parse,
/// which should never happen in practice.
#[must_use]
#[allow(clippy::expect_used)]
pub fn test_clock() -> mocks::FixedClock {
    mocks::FixedClock::new(
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc),
    )
}

// Re-export commonly used items
pub use mocks::{FixedClock, InMemoryDeadLetters, InMemoryEventBus};

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use futures::StreamExt;
    use merx_core::event::{DomainEvent, EventEnvelope};
    use merx_core::event_bus::EventBus;
    use merx_core::types::OrderId;

    #[test]
    fn fixed_clock_is_deterministic_and_advanceable() {
        let clock = test_clock();
        use merx_core::Clock;
        let t0 = clock.now();
        clock.advance(chrono::Duration::hours(1));
        assert_eq!(clock.now() - t0, chrono::Duration::hours(1));
    }

    #[tokio::test]
    async fn bus_records_and_delivers_by_topic() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe(&["order.confirmed"]).await.unwrap();

        let order_id = OrderId::new();
        let confirmed = EventEnvelope::new(
            order_id.to_string(),
            DomainEvent::OrderConfirmed { order_id },
            chrono::Utc::now(),
        );
        let completed = EventEnvelope::new(
            order_id.to_string(),
            DomainEvent::OrderCompleted { order_id },
            chrono::Utc::now(),
        );

        bus.publish(confirmed.topic(), &confirmed).await.unwrap();
        bus.publish(completed.topic(), &completed).await.unwrap();

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received.event_id, confirmed.event_id);

        assert_eq!(bus.published().len(), 2);
        assert_eq!(bus.published_on("order.completed").len(), 1);
    }
}
