//! Event-driven bridge between the bus and the stock engine.
//!
//! Consumes `order.created`, `order.cancelled` and `order.paid`, dedups on
//! the inbox, and drives the engine. Batch reservation is all-or-nothing:
//! products are taken in sorted id order, and on the first failure every
//! prior reservation is rolled back before a single `InsufficientStock`
//! event is emitted for the order. Messages that exhaust the retry budget
//! are recorded through the dead-letter sink and republished to
//! `<topic>-dlq` with the failure context as headers.

use crate::engine::{EngineError, Reserved, StockEngine};
use crate::product::InventoryError;
use crate::store::ProductStore;
use futures::StreamExt;
use merx_core::clock::Clock;
use merx_core::dead_letter::{DeadLetter, DeadLetterSink};
use merx_core::error::{Classify, ErrorKind};
use merx_core::event::{
    Compensation, DomainEvent, EventEnvelope, FailedItem, ReleaseReason, ReservationRef, topics,
};
use merx_core::event_bus::EventBus;
use merx_core::inbox::Inbox;
use merx_core::types::{OrderId, OrderItem, ProductId, Quantity};
use merx_runtime::retry::{RetryPolicy, retry_with_predicate};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Topics the inventory service consumes.
pub const CONSUMED_TOPICS: [&str; 4] = [
    topics::ORDER_CREATED,
    topics::ORDER_CANCELLED,
    topics::ORDER_PAID,
    topics::PAYMENT_FAILED,
];

/// Per-message processing budget before the message is dead-lettered.
const PROCESSING_BUDGET: Duration = Duration::from_secs(30);

/// Transient-error retries per message before dead-lettering.
const RETRY_BUDGET: usize = 3;

/// Errors from event handling.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The engine rejected or failed an operation.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Publishing an outbound event failed.
    #[error("Publish failed: {0}")]
    Publish(#[from] merx_core::event_bus::EventBusError),

    /// The inbox backend failed.
    #[error(transparent)]
    Inbox(#[from] merx_core::inbox::InboxError),

    /// The per-message processing budget elapsed.
    #[error("Processing budget exhausted")]
    BudgetExhausted,
}

impl Classify for ServiceError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Engine(e) => e.kind(),
            Self::Publish(_) | Self::Inbox(_) => ErrorKind::TransientInfra,
            Self::BudgetExhausted => ErrorKind::Timeout,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Engine(e) => e.code(),
            Self::Publish(_) => "PUBLISH_FAILURE",
            Self::Inbox(_) => "INBOX_FAILURE",
            Self::BudgetExhausted => "PROCESSING_TIMEOUT",
        }
    }
}

/// The inventory service: engine + bus + inbox + dead-letter sink.
pub struct InventoryService {
    engine: Arc<StockEngine>,
    store: Arc<dyn ProductStore>,
    bus: Arc<dyn EventBus>,
    inbox: Arc<dyn Inbox>,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
}

impl InventoryService {
    /// Assemble the service.
    #[must_use]
    pub fn new(
        engine: Arc<StockEngine>,
        store: Arc<dyn ProductStore>,
        bus: Arc<dyn EventBus>,
        inbox: Arc<dyn Inbox>,
        dead_letters: Arc<dyn DeadLetterSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine,
            store,
            bus,
            inbox,
            dead_letters,
            clock,
        }
    }

    /// Subscribe to the consumed topics and process events until the stream
    /// ends.
    ///
    /// Each message gets a processing budget and a bounded transient-error
    /// retry; messages that exhaust the budget go to the topic's dead-letter
    /// queue.
    ///
    /// # Errors
    ///
    /// Returns an error only if the subscription itself fails.
    pub async fn run(&self) -> Result<(), merx_core::event_bus::EventBusError> {
        let mut stream = self.bus.subscribe(&CONSUMED_TOPICS).await?;
        tracing::info!(topics = ?CONSUMED_TOPICS, "Inventory consumer started");

        while let Some(result) = stream.next().await {
            match result {
                Ok(envelope) => self.process(envelope).await,
                Err(err) => {
                    tracing::error!(error = %err, "Event stream error");
                    metrics::counter!("event_bus_consume_errors_total").increment(1);
                }
            }
        }
        tracing::info!("Inventory consumer stream ended");
        Ok(())
    }

    /// One consumer iteration: dedup, budgeted transient retry, dead-letter
    /// on exhaustion.
    ///
    /// The inbox gate runs once, before the retry loop, so internal retries
    /// of the same delivery are not mistaken for duplicates.
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
                |err: &ServiceError| err.kind().is_retriable(),
            ),
        )
        .await
        .unwrap_or(Err(ServiceError::BudgetExhausted));

        match outcome {
            Ok(()) => {}
            Err(err) if matches!(err, ServiceError::Engine(EngineError::Domain(_))) => {
                // Domain rejections are terminal for the event and already
                // reported through outbound events where applicable.
                tracing::warn!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    error = %err,
                    "Domain rejection while handling event"
                );
            }
            Err(err) => self.dead_letter(envelope, &err).await,
        }
    }

    /// Record an exhausted message durably, then republish it to the
    /// topic's dead-letter queue with the failure context as headers.
    async fn dead_letter(&self, envelope: EventEnvelope, err: &ServiceError) {
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

    /// Dedup one envelope via the inbox, then dispatch it.
    ///
    /// This is the entry point tests and direct (non-stream) callers use;
    /// duplicates are acknowledged without side effects.
    ///
    /// # Errors
    ///
    /// Propagates engine, bus and inbox failures.
    pub async fn handle_envelope(&self, envelope: EventEnvelope) -> Result<(), ServiceError> {
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

    /// Route an already-deduplicated envelope to its handler.
    async fn dispatch(&self, envelope: EventEnvelope) -> Result<(), ServiceError> {
        match envelope.payload {
            DomainEvent::OrderCreated {
                order_id, items, ..
            } => self.reserve_batch(order_id, items).await,
            DomainEvent::OrderCancelled {
                order_id,
                compensations,
                ..
            } => self.release_batch(order_id, &compensations).await,
            DomainEvent::OrderPaid { order_id, .. } => self.deduct_for_order(order_id).await,
            DomainEvent::PaymentFailed { order_id, .. } => {
                self.release_for_order(order_id).await
            }
            other => {
                tracing::debug!(event_type = other.event_type(), "Ignoring event");
                Ok(())
            }
        }
    }

    /// All-or-nothing batch reservation for a new order.
    ///
    /// Items are reserved in product-id sorted order (the platform's lock
    /// ordering rule). On the first failure all prior reservations are
    /// released with `BatchRollback` and one `InsufficientStock` is emitted.
    async fn reserve_batch(
        &self,
        order_id: OrderId,
        mut items: Vec<OrderItem>,
    ) -> Result<(), ServiceError> {
        items.sort_by_key(|item| item.product_id);

        let mut reserved: Vec<(ProductId, Quantity, Reserved)> = Vec::with_capacity(items.len());
        let mut failure: Option<FailedItem> = None;

        for item in &items {
            match self
                .engine
                .reserve(item.product_id, order_id, item.quantity, None)
                .await
            {
                Ok(r) => reserved.push((item.product_id, item.quantity, r)),
                Err(EngineError::Domain(rejection)) => {
                    failure = Some(match rejection {
                        InventoryError::InsufficientStock {
                            product_id,
                            requested,
                            available,
                        } => FailedItem {
                            product_id,
                            requested,
                            available: Some(available),
                        },
                        _ => FailedItem {
                            product_id: item.product_id,
                            requested: item.quantity,
                            available: None,
                        },
                    });
                    break;
                }
                Err(infra) => {
                    // Roll back what we hold, then surface for retry.
                    self.rollback(&reserved).await;
                    return Err(infra.into());
                }
            }
        }

        if let Some(failed_item) = failure {
            self.rollback(&reserved).await;
            let event = DomainEvent::InsufficientStock {
                order_id,
                failed_items: vec![failed_item],
            };
            self.publish_for_order(order_id, event).await?;
            tracing::info!(order_id = %order_id, "Batch reservation failed, rolled back");
            return Ok(());
        }

        let expires_at = reserved
            .iter()
            .map(|(_, _, r)| r.expires_at)
            .min()
            .unwrap_or_else(|| self.clock.now());
        let event = DomainEvent::StockReserved {
            order_id,
            reservations: reserved
                .iter()
                .map(|(product_id, quantity, r)| ReservationRef {
                    product_id: *product_id,
                    reservation_id: r.reservation_id,
                    quantity: *quantity,
                })
                .collect(),
            expires_at,
        };
        self.publish_for_order(order_id, event).await?;
        tracing::info!(order_id = %order_id, items = items.len(), "Batch reservation succeeded");
        Ok(())
    }

    /// Release every compensation-listed reservation; idempotent.
    async fn release_batch(
        &self,
        order_id: OrderId,
        compensations: &[Compensation],
    ) -> Result<(), ServiceError> {
        for compensation in compensations {
            // BTreeMap iterates in product-id order, matching lock order.
            for (product_id, reservation_id) in &compensation.data {
                match self
                    .engine
                    .release(*reservation_id, ReleaseReason::Cancelled)
                    .await
                {
                    Ok(_) => {}
                    Err(EngineError::Domain(InventoryError::ReservationNotFound { .. })) => {
                        tracing::warn!(
                            order_id = %order_id,
                            product_id = %product_id,
                            reservation_id = %reservation_id,
                            "Reservation already gone during cancellation"
                        );
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    }

    /// Confirm (deduct) every reservation held for a paid order.
    async fn deduct_for_order(&self, order_id: OrderId) -> Result<(), ServiceError> {
        let pairs = self
            .store
            .find_by_order(order_id)
            .await
            .map_err(EngineError::from)?;
        for (_, reservation_id) in pairs {
            match self.engine.deduct(reservation_id).await {
                Ok(()) => {}
                Err(EngineError::Domain(InventoryError::AlreadyTerminal { .. })) => {
                    // Redelivery after a partial deduct; already done.
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Compensation for a failed payment: release every hold of the order.
    async fn release_for_order(&self, order_id: OrderId) -> Result<(), ServiceError> {
        let pairs = self
            .store
            .find_by_order(order_id)
            .await
            .map_err(EngineError::from)?;
        for (_, reservation_id) in pairs {
            match self
                .engine
                .release(reservation_id, ReleaseReason::Compensation)
                .await
            {
                Ok(_) => {}
                Err(EngineError::Domain(_)) => {
                    // Terminal or already gone; compensation is idempotent.
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn rollback(&self, reserved: &[(ProductId, Quantity, Reserved)]) {
        for (product_id, _, r) in reserved {
            if let Err(err) = self
                .engine
                .release(r.reservation_id, ReleaseReason::BatchRollback)
                .await
            {
                // The expiry sweeper will reclaim anything we fail to roll
                // back here.
                tracing::error!(
                    product_id = %product_id,
                    reservation_id = %r.reservation_id,
                    error = %err,
                    "Rollback release failed"
                );
            }
        }
    }

    async fn publish_for_order(
        &self,
        order_id: OrderId,
        event: DomainEvent,
    ) -> Result<(), ServiceError> {
        let envelope = EventEnvelope::new(order_id.to_string(), event, self.clock.now());
        self.bus.publish(envelope.topic(), &envelope).await?;
        metrics::counter!("event_bus_messages_published_total").increment(1);
        Ok(())
    }
}

