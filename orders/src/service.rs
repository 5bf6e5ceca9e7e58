//! The order service: commands, queries and the saga consumer.
//!
//! Commands (`create_order`, `cancel_order`, operator `advance`) and the
//! bus-driven saga all converge on the same pattern: load the aggregate,
//! apply a guarded mutation, commit state + outbox under the version guard,
//! retry only on version conflicts. Illegal transitions are terminal for
//! the triggering event and recorded, never retried. Messages that exhaust
//! the retry budget are recorded through the dead-letter sink and
//! republished to `<topic>-dlq` with the failure context as headers.

use crate::order::{Order, OrderError, OrderStatus, fingerprint};
use crate::saga::{OrderSaga, SagaAction, StepOutcome, stock_release_compensations};
use crate::store::{OrderStore, OrderStoreError};
use futures::StreamExt;
use merx_core::clock::Clock;
use merx_core::config::SagaConfig;
use merx_core::dead_letter::{DeadLetter, DeadLetterSink};
use merx_core::error::{Classify, ErrorKind};
use merx_core::event::{CancelInitiator, DomainEvent, EventEnvelope, topics};
use merx_core::event_bus::EventBus;
use merx_core::inbox::Inbox;
use merx_core::types::{CustomerId, OrderId, OrderItem};
use merx_runtime::retry::{RetryPolicy, retry_with_predicate};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Topics the order service consumes.
pub const CONSUMED_TOPICS: [&str; 4] = [
    topics::STOCK_RESERVED,
    topics::INSUFFICIENT_STOCK,
    topics::PAYMENT_COMPLETED,
    topics::PAYMENT_FAILED,
];

/// Per-message processing budget before the message is dead-lettered.
const PROCESSING_BUDGET: Duration = Duration::from_secs(30);

/// Transient-error retries per message before dead-lettering.
const RETRY_BUDGET: usize = 3;

/// Errors from order service operations.
#[derive(Error, Debug)]
pub enum OrderServiceError {
    /// A domain rejection from the aggregate or the saga.
    #[error(transparent)]
    Domain(#[from] OrderError),

    /// An equivalent order was created within the duplicate window.
    #[error("Duplicate order: matches order {existing} created within the window")]
    DuplicateOrder {
        /// The previously accepted order.
        existing: OrderId,
    },

    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] OrderStoreError),

    /// The inbox backend failed.
    #[error(transparent)]
    Inbox(#[from] merx_core::inbox::InboxError),

    /// Publishing to the bus failed.
    #[error("Publish failed: {0}")]
    Publish(#[from] merx_core::event_bus::EventBusError),

    /// The per-message processing budget elapsed.
    #[error("Processing budget exhausted")]
    BudgetExhausted,
}

impl Classify for OrderServiceError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Domain(e) => e.kind(),
            Self::DuplicateOrder { .. } => ErrorKind::DomainRejection,
            Self::Store(e) => e.kind(),
            Self::Inbox(_) | Self::Publish(_) => ErrorKind::TransientInfra,
            Self::BudgetExhausted => ErrorKind::Timeout,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Domain(e) => e.code(),
            Self::DuplicateOrder { .. } => "DUPLICATE_ORDER",
            Self::Store(e) => e.code(),
            Self::Inbox(_) => "INBOX_FAILURE",
            Self::Publish(_) => "PUBLISH_FAILURE",
            Self::BudgetExhausted => "PROCESSING_TIMEOUT",
        }
    }
}

/// The order saga driver service.
pub struct OrderService {
    store: Arc<dyn OrderStore>,
    bus: Arc<dyn EventBus>,
    inbox: Arc<dyn Inbox>,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    config: SagaConfig,
}

impl OrderService {
    /// Assemble the service.
    #[must_use]
    pub fn new(
        store: Arc<dyn OrderStore>,
        bus: Arc<dyn EventBus>,
        inbox: Arc<dyn Inbox>,
        dead_letters: Arc<dyn DeadLetterSink>,
        clock: Arc<dyn Clock>,
        config: SagaConfig,
    ) -> Self {
        Self {
            store,
            bus,
            inbox,
            dead_letters,
            clock,
            config,
        }
    }

    /// Create a new order and emit `OrderCreated`.
    ///
    /// An order whose (customer, item multiset) matches one created within
    /// the duplicate window is refused.
    ///
    /// # Errors
    ///
    /// [`OrderServiceError::DuplicateOrder`] for duplicates,
    /// [`OrderServiceError::Domain`] for validation failures.
    pub async fn create_order(
        &self,
        customer_id: CustomerId,
        items: Vec<OrderItem>,
    ) -> Result<Order, OrderServiceError> {
        let now = self.clock.now();
        let print = fingerprint(customer_id, &items);
        let since = now - self.config.duplicate_window();

        if let Some(existing) = self.store.find_duplicate(customer_id, &print, since).await? {
            tracing::info!(customer_id = %customer_id, existing = %existing, "Duplicate order refused");
            return Err(OrderServiceError::DuplicateOrder { existing });
        }

        let order = Order::new(customer_id, items, now)?;
        let envelope = EventEnvelope::new(
            order.id.to_string(),
            DomainEvent::OrderCreated {
                order_id: order.id,
                customer_id,
                items: order.items.clone(),
            },
            now,
        );

        self.store.insert(order.clone(), vec![envelope]).await?;
        metrics::counter!("orders_created_total").increment(1);
        tracing::info!(order_id = %order.id, customer_id = %customer_id, "Order created");
        Ok(order)
    }

    /// Cancel an order, emitting `OrderCancelled` with the compensation
    /// list.
    ///
    /// # Errors
    ///
    /// [`OrderServiceError::Domain`] when the state or window forbids it;
    /// [`OrderServiceError::Store`] with `ORDER_NOT_FOUND` for unknown ids.
    pub async fn cancel_order(
        &self,
        order_id: OrderId,
        reason: String,
        initiator: CancelInitiator,
    ) -> Result<Order, OrderServiceError> {
        let window = self.config.cancellation_window();
        self.mutate(order_id, move |order, now| {
            order.cancel(reason.clone(), initiator, now, window)?;
            Ok(vec![DomainEvent::OrderCancelled {
                order_id: order.id,
                reason: order.cancelled_reason.clone().unwrap_or_default(),
                initiator,
                compensations: stock_release_compensations(order),
            }])
        })
        .await
    }

    /// Operator-driven advancement (payment kickoff, fulfilment steps).
    ///
    /// `COMPLETED` additionally emits `OrderCompleted`.
    ///
    /// # Errors
    ///
    /// [`OrderServiceError::Domain`] with `ILLEGAL_TRANSITION` when the
    /// graph disallows the move.
    pub async fn advance(
        &self,
        order_id: OrderId,
        target: OrderStatus,
    ) -> Result<Order, OrderServiceError> {
        self.mutate(order_id, move |order, _| {
            order.transition(target)?;
            Ok(if target == OrderStatus::Completed {
                vec![DomainEvent::OrderCompleted { order_id: order.id }]
            } else {
                vec![]
            })
        })
        .await
    }

    /// Fetch an order snapshot.
    ///
    /// # Errors
    ///
    /// [`OrderServiceError::Store`] with `ORDER_NOT_FOUND` for unknown ids.
    pub async fn get_order(&self, order_id: OrderId) -> Result<Order, OrderServiceError> {
        self.store
            .load(order_id)
            .await?
            .ok_or(OrderServiceError::Store(OrderStoreError::NotFound {
                order_id,
            }))
    }

    /// Subscribe to the consumed topics and drive sagas until the stream
    /// ends.
    ///
    /// # Errors
    ///
    /// Returns an error only if the subscription itself fails.
    pub async fn run(&self) -> Result<(), merx_core::event_bus::EventBusError> {
        let mut stream = self.bus.subscribe(&CONSUMED_TOPICS).await?;
        tracing::info!(topics = ?CONSUMED_TOPICS, "Order saga consumer started");

        while let Some(result) = stream.next().await {
            match result {
                Ok(envelope) => self.process(envelope).await,
                Err(err) => {
                    tracing::error!(error = %err, "Event stream error");
                    metrics::counter!("event_bus_consume_errors_total").increment(1);
                }
            }
        }
        tracing::info!("Order saga consumer stream ended");
        Ok(())
    }

    /// One consumer iteration: dedup, budgeted transient retry, dead-letter
    /// on exhaustion.
    pub async fn process(&self, envelope: EventEnvelope) {
        metrics::counter!("event_bus_messages_consumed_total").increment(1);

        match self
            .inbox
            .mark_processed(envelope.event_id, self.clock.now())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                metrics::counter!("inbox_duplicates_total").increment(1);
                tracing::debug!(event_id = %envelope.event_id, "Duplicate event acknowledged");
                return;
            }
            Err(err) => {
                tracing::error!(error = %err, "Inbox unavailable, leaving event for redelivery");
                return;
            }
        }

        let policy = RetryPolicy::builder()
            .max_retries(RETRY_BUDGET)
            .initial_delay(Duration::from_millis(50))
            .build();

        let outcome = tokio::time::timeout(
            PROCESSING_BUDGET,
            retry_with_predicate(
                policy,
                || self.dispatch(envelope.clone()),
                |err: &OrderServiceError| err.kind().is_retriable(),
            ),
        )
        .await
        .unwrap_or(Err(OrderServiceError::BudgetExhausted));

        match outcome {
            Ok(()) => {}
            Err(OrderServiceError::Domain(err)) => {
                // Invariant violation: terminal for this event, recorded.
                tracing::error!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    error = %err,
                    "Illegal transition, event discarded"
                );
                metrics::counter!("saga_illegal_transitions_total").increment(1);
            }
            Err(err) => self.dead_letter(envelope, &err).await,
        }
    }

    /// Record an exhausted message durably, then republish it to the
    /// topic's dead-letter queue with the failure context as headers.
    async fn dead_letter(&self, envelope: EventEnvelope, err: &OrderServiceError) {
        tracing::error!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            error = %err,
            "Dead-lettering event after exhausting retry budget"
        );
        metrics::counter!("dlq_messages_total").increment(1);

        let dead_letter = DeadLetter::new(
            envelope,
            err.code(),
            err.to_string(),
            i32::try_from(RETRY_BUDGET).unwrap_or(i32::MAX),
            self.clock.now(),
        );

        if let Err(sink_err) = self.dead_letters.record(&dead_letter).await {
            // The republish below still carries the context; operators lose
            // only the queryable table row.
            tracing::error!(error = %sink_err, "Failed to record dead letter");
        }

        let dlq_topic = topics::dlq(&dead_letter.original_topic);
        if let Err(publish_err) = self
            .bus
            .publish_with_headers(&dlq_topic, &dead_letter.envelope, &dead_letter.headers())
            .await
        {
            tracing::error!(error = %publish_err, "Failed to publish to DLQ");
        }
    }

    /// Dedup one envelope via the inbox, then dispatch it. Entry point for
    /// tests and direct callers.
    ///
    /// # Errors
    ///
    /// Propagates saga, store and inbox failures.
    pub async fn handle_envelope(&self, envelope: EventEnvelope) -> Result<(), OrderServiceError> {
        if !self
            .inbox
            .mark_processed(envelope.event_id, self.clock.now())
            .await?
        {
            metrics::counter!("inbox_duplicates_total").increment(1);
            tracing::debug!(event_id = %envelope.event_id, "Duplicate event acknowledged");
            return Ok(());
        }
        self.dispatch(envelope).await
    }

    /// Route an already-deduplicated envelope into the saga.
    async fn dispatch(&self, envelope: EventEnvelope) -> Result<(), OrderServiceError> {
        let (order_id, action) = match envelope.payload {
            DomainEvent::StockReserved {
                order_id,
                reservations,
                expires_at,
            } => (
                order_id,
                SagaAction::StockReserved {
                    reservations,
                    expires_at,
                },
            ),
            DomainEvent::InsufficientStock {
                order_id,
                failed_items,
            } => (order_id, SagaAction::InsufficientStock { failed_items }),
            DomainEvent::PaymentCompleted {
                order_id,
                transaction_id,
                ..
            } => (order_id, SagaAction::PaymentCompleted { transaction_id }),
            DomainEvent::PaymentFailed { order_id, reason } => {
                (order_id, SagaAction::PaymentFailed { reason })
            }
            other => {
                tracing::debug!(event_type = other.event_type(), "Ignoring event");
                return Ok(());
            }
        };

        if self.store.load(order_id).await?.is_none() {
            tracing::warn!(order_id = %order_id, "Event for unknown order, dropping");
            return Ok(());
        }

        self.mutate(order_id, move |order, now| {
            match OrderSaga.step(order, action.clone(), now)? {
                StepOutcome::Advanced(events) => Ok(events),
                StepOutcome::Dropped => Ok(vec![]),
            }
        })
        .await
        .map(|_| ())
    }

    /// Load-mutate-commit with version-conflict retries.
    ///
    /// `f` mutates the order and returns the events to append to the
    /// outbox. A saga step that drops the event commits nothing.
    async fn mutate<F>(&self, order_id: OrderId, f: F) -> Result<Order, OrderServiceError>
    where
        F: Fn(&mut Order, chrono::DateTime<chrono::Utc>) -> Result<Vec<DomainEvent>, OrderError>
            + Send
            + Sync,
    {
        let policy = RetryPolicy::builder()
            .max_retries(3)
            .initial_delay(Duration::from_millis(50))
            .build();

        retry_with_predicate(
            policy,
            || async {
                let mut order = self.store.load(order_id).await?.ok_or(
                    OrderServiceError::Store(OrderStoreError::NotFound { order_id }),
                )?;
                let expected_version = order.version;
                let before = order.clone();
                let now = self.clock.now();

                let events = f(&mut order, now)?;
                if order == before && events.is_empty() {
                    // Nothing changed; skip the commit (dropped saga event).
                    return Ok(order);
                }

                let outbox: Vec<EventEnvelope> = events
                    .into_iter()
                    .map(|event| EventEnvelope::new(order_id.to_string(), event, now))
                    .collect();

                self.store.commit(order.clone(), expected_version, outbox).await?;
                order.version = expected_version + 1;
                Ok(order)
            },
            |err: &OrderServiceError| err.kind().is_retriable(),
        )
        .await
    }
}
