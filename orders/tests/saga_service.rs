//! Order service behavior: duplicate guard, cancellation windows, payment
//! outcomes, idempotent event handling, dead-lettering.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code

use chrono::Utc;
use merx_core::clock::Clock;
use merx_core::config::SagaConfig;
use merx_core::event::{CancelInitiator, DomainEvent, EventEnvelope, ReservationRef, topics};
use merx_core::inbox::InMemoryInbox;
use merx_core::types::{
    Currency, CustomerId, Money, OrderItem, ProductId, Quantity, ReservationId,
};
use merx_orders::order::OrderStatus;
use merx_orders::service::{OrderService, OrderServiceError};
use merx_orders::store::{InMemoryOrderStore, OrderStore};
use merx_testing::mocks::{FixedClock, InMemoryDeadLetters, InMemoryEventBus};
use merx_testing::test_clock;
use rust_decimal::Decimal;
use std::sync::Arc;

struct Harness {
    service: OrderService,
    bus: Arc<InMemoryEventBus>,
    clock: Arc<FixedClock>,
}

fn harness() -> Harness {
    let bus = Arc::new(InMemoryEventBus::new());
    let store = Arc::new(InMemoryOrderStore::with_bus(bus.clone()));
    let clock = Arc::new(test_clock());
    let service = OrderService::new(
        store as Arc<dyn OrderStore>,
        bus.clone(),
        Arc::new(InMemoryInbox::new(chrono::Duration::hours(48))),
        Arc::new(InMemoryDeadLetters::new()),
        clock.clone(),
        SagaConfig::default(),
    );
    Harness {
        service,
        bus,
        clock,
    }
}

fn items(quantities: &[u32]) -> Vec<OrderItem> {
    quantities
        .iter()
        .map(|q| {
            OrderItem::new(
                ProductId::new(),
                "Widget".to_string(),
                Quantity::new(*q),
                Money::new(Decimal::new(1999, 2), Currency::USD),
            )
        })
        .collect()
}

fn reserved_envelope(order: &merx_orders::Order) -> EventEnvelope {
    EventEnvelope::new(
        order.id.to_string(),
        DomainEvent::StockReserved {
            order_id: order.id,
            reservations: order
                .items
                .iter()
                .map(|item| ReservationRef {
                    product_id: item.product_id,
                    reservation_id: ReservationId::new(),
                    quantity: item.quantity,
                })
                .collect(),
            expires_at: Utc::now() + chrono::Duration::minutes(30),
        },
        Utc::now(),
    )
}

#[tokio::test]
async fn duplicate_order_within_window_is_refused() {
    let h = harness();
    let customer = CustomerId::new();
    let order_items = items(&[2, 1]);

    h.service
        .create_order(customer, order_items.clone())
        .await
        .expect("first order");

    // Same customer, same item multiset, one minute later.
    h.clock.advance(chrono::Duration::minutes(1));
    let err = h
        .service
        .create_order(customer, order_items.clone())
        .await
        .expect_err("duplicate must be refused");
    assert!(matches!(err, OrderServiceError::DuplicateOrder { .. }));

    // Past the window the same order is accepted again.
    h.clock.advance(chrono::Duration::minutes(10));
    h.service
        .create_order(customer, order_items)
        .await
        .expect("order outside the window");
}

#[tokio::test]
async fn create_emits_order_created() {
    let h = harness();
    let order = h
        .service
        .create_order(CustomerId::new(), items(&[1]))
        .await
        .expect("create");

    let created = h.bus.published_on(topics::ORDER_CREATED);
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].aggregate_id, order.id.to_string());
}

#[tokio::test]
async fn customer_cancel_honors_window_both_sides() {
    let h = harness();

    // Inside the window (T + 1h): cancelled, compensations emitted.
    let order = h
        .service
        .create_order(CustomerId::new(), items(&[1]))
        .await
        .expect("create");
    h.service
        .handle_envelope(reserved_envelope(&order))
        .await
        .expect("confirm");
    h.clock.advance(chrono::Duration::hours(1));

    let cancelled = h
        .service
        .cancel_order(order.id, "changed my mind".to_string(), CancelInitiator::Customer)
        .await
        .expect("cancel inside window");
    assert_eq!(cancelled.status, OrderStatus::Cancelled);

    let events = h.bus.published_on(topics::ORDER_CANCELLED);
    let DomainEvent::OrderCancelled { compensations, .. } = &events
        .last()
        .expect("cancellation event")
        .payload
    else {
        panic!("expected OrderCancelled payload");
    };
    assert_eq!(compensations.len(), 1);
    assert_eq!(compensations[0].data.len(), 1);

    // Outside the window (T + 25h): refused, order unchanged.
    let order = h
        .service
        .create_order(CustomerId::new(), items(&[3]))
        .await
        .expect("create");
    h.service
        .handle_envelope(reserved_envelope(&order))
        .await
        .expect("confirm");
    h.clock.advance(chrono::Duration::hours(25));

    let err = h
        .service
        .cancel_order(order.id, "too late".to_string(), CancelInitiator::Customer)
        .await
        .expect_err("cancel outside window");
    assert!(matches!(
        err,
        OrderServiceError::Domain(merx_orders::OrderError::NotCancellable { .. })
    ));
    let unchanged = h.service.get_order(order.id).await.expect("get");
    assert_eq!(unchanged.status, OrderStatus::Confirmed);
}

#[tokio::test]
async fn system_cancel_ignores_window() {
    let h = harness();
    let order = h
        .service
        .create_order(CustomerId::new(), items(&[1]))
        .await
        .expect("create");
    h.service
        .handle_envelope(reserved_envelope(&order))
        .await
        .expect("confirm");

    h.clock.advance(chrono::Duration::days(10));
    let cancelled = h
        .service
        .cancel_order(order.id, "fraud review".to_string(), CancelInitiator::System)
        .await
        .expect("system cancel");
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn stock_reserved_confirms_and_stores_reservation_map() {
    let h = harness();
    let order = h
        .service
        .create_order(CustomerId::new(), items(&[2, 1]))
        .await
        .expect("create");

    h.service
        .handle_envelope(reserved_envelope(&order))
        .await
        .expect("confirm");

    let confirmed = h.service.get_order(order.id).await.expect("get");
    assert_eq!(confirmed.status, OrderStatus::Confirmed);
    assert_eq!(confirmed.reservations.len(), 2);
    assert_eq!(h.bus.published_on(topics::ORDER_CONFIRMED).len(), 1);
}

#[tokio::test]
async fn insufficient_stock_cancels_order() {
    let h = harness();
    let order = h
        .service
        .create_order(CustomerId::new(), items(&[5]))
        .await
        .expect("create");

    let envelope = EventEnvelope::new(
        order.id.to_string(),
        DomainEvent::InsufficientStock {
            order_id: order.id,
            failed_items: vec![],
        },
        h.clock.now(),
    );
    h.service.handle_envelope(envelope).await.expect("handle");

    let cancelled = h.service.get_order(order.id).await.expect("get");
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn payment_lifecycle_marks_paid_and_emits_order_paid() {
    let h = harness();
    let order = h
        .service
        .create_order(CustomerId::new(), items(&[1]))
        .await
        .expect("create");
    h.service
        .handle_envelope(reserved_envelope(&order))
        .await
        .expect("confirm");

    h.service
        .advance(order.id, OrderStatus::PaymentPending)
        .await
        .expect("payment pending");
    h.service
        .advance(order.id, OrderStatus::PaymentProcessing)
        .await
        .expect("payment processing");

    let payment = EventEnvelope::new(
        order.id.to_string(),
        DomainEvent::PaymentCompleted {
            order_id: order.id,
            transaction_id: "txn-1".to_string(),
            amount: Money::new(Decimal::new(1999, 2), Currency::USD),
        },
        h.clock.now(),
    );
    h.service.handle_envelope(payment).await.expect("paid");

    let paid = h.service.get_order(order.id).await.expect("get");
    assert_eq!(paid.status, OrderStatus::Paid);
    assert_eq!(h.bus.published_on(topics::ORDER_PAID).len(), 1);
}

#[tokio::test]
async fn late_payment_completed_is_dropped_without_state_change() {
    let h = harness();
    let order = h
        .service
        .create_order(CustomerId::new(), items(&[1]))
        .await
        .expect("create");

    // Payment settles while the order is still PENDING.
    let payment = EventEnvelope::new(
        order.id.to_string(),
        DomainEvent::PaymentCompleted {
            order_id: order.id,
            transaction_id: "txn-early".to_string(),
            amount: Money::new(Decimal::ONE, Currency::USD),
        },
        h.clock.now(),
    );
    h.service.handle_envelope(payment).await.expect("dropped, not error");

    let unchanged = h.service.get_order(order.id).await.expect("get");
    assert_eq!(unchanged.status, OrderStatus::Pending);
    assert!(h.bus.published_on(topics::ORDER_PAID).is_empty());
}

#[tokio::test]
async fn payment_failure_fails_order_after_processing() {
    let h = harness();
    let order = h
        .service
        .create_order(CustomerId::new(), items(&[1]))
        .await
        .expect("create");
    h.service
        .handle_envelope(reserved_envelope(&order))
        .await
        .expect("confirm");
    h.service
        .advance(order.id, OrderStatus::PaymentPending)
        .await
        .expect("advance");
    h.service
        .advance(order.id, OrderStatus::PaymentProcessing)
        .await
        .expect("advance");

    let failure = EventEnvelope::new(
        order.id.to_string(),
        DomainEvent::PaymentFailed {
            order_id: order.id,
            reason: "card declined".to_string(),
        },
        h.clock.now(),
    );
    h.service.handle_envelope(failure).await.expect("handle");

    let failed = h.service.get_order(order.id).await.expect("get");
    assert_eq!(failed.status, OrderStatus::Failed);
    assert_eq!(failed.cancelled_reason.as_deref(), Some("card declined"));
}

#[tokio::test]
async fn redelivered_event_is_processed_once() {
    let h = harness();
    let order = h
        .service
        .create_order(CustomerId::new(), items(&[1]))
        .await
        .expect("create");

    let envelope = reserved_envelope(&order);
    h.service
        .handle_envelope(envelope.clone())
        .await
        .expect("first");
    h.service.handle_envelope(envelope).await.expect("second");

    // One confirmation, version advanced exactly once by the event.
    assert_eq!(h.bus.published_on(topics::ORDER_CONFIRMED).len(), 1);
}

#[tokio::test]
async fn operator_advance_walks_fulfilment_and_emits_completed() {
    let h = harness();
    let order = h
        .service
        .create_order(CustomerId::new(), items(&[1]))
        .await
        .expect("create");
    h.service
        .handle_envelope(reserved_envelope(&order))
        .await
        .expect("confirm");

    for status in [
        OrderStatus::PaymentPending,
        OrderStatus::Paid,
        OrderStatus::Preparing,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
        OrderStatus::Completed,
    ] {
        h.service.advance(order.id, status).await.expect("advance");
    }

    assert_eq!(h.bus.published_on(topics::ORDER_COMPLETED).len(), 1);

    // Any further move is an illegal transition.
    let err = h
        .service
        .advance(order.id, OrderStatus::Preparing)
        .await
        .expect_err("terminal state");
    assert!(matches!(
        err,
        OrderServiceError::Domain(merx_orders::OrderError::IllegalTransition { .. })
    ));
}

/// A store whose reads always fail, driving the consumer into the
/// dead-letter path.
struct FailingOrderStore;

impl OrderStore for FailingOrderStore {
    fn load(
        &self,
        _id: merx_core::types::OrderId,
    ) -> std::pin::Pin<
        Box<
            dyn std::future::Future<
                    Output = Result<Option<merx_orders::Order>, merx_orders::store::OrderStoreError>,
                > + Send
                + '_,
        >,
    > {
        Box::pin(async {
            Err(merx_orders::store::OrderStoreError::Backend(
                "connection reset".to_string(),
            ))
        })
    }

    fn insert(
        &self,
        _order: merx_orders::Order,
        _outbox: Vec<EventEnvelope>,
    ) -> std::pin::Pin<
        Box<
            dyn std::future::Future<Output = Result<(), merx_orders::store::OrderStoreError>>
                + Send
                + '_,
        >,
    > {
        Box::pin(async {
            Err(merx_orders::store::OrderStoreError::Backend(
                "connection reset".to_string(),
            ))
        })
    }

    fn commit(
        &self,
        _order: merx_orders::Order,
        _expected_version: u64,
        _outbox: Vec<EventEnvelope>,
    ) -> std::pin::Pin<
        Box<
            dyn std::future::Future<Output = Result<(), merx_orders::store::OrderStoreError>>
                + Send
                + '_,
        >,
    > {
        Box::pin(async {
            Err(merx_orders::store::OrderStoreError::Backend(
                "connection reset".to_string(),
            ))
        })
    }

    fn find_duplicate(
        &self,
        _customer_id: CustomerId,
        _fingerprint: &str,
        _since: chrono::DateTime<Utc>,
    ) -> std::pin::Pin<
        Box<
            dyn std::future::Future<
                    Output = Result<
                        Option<merx_core::types::OrderId>,
                        merx_orders::store::OrderStoreError,
                    >,
                > + Send
                + '_,
        >,
    > {
        Box::pin(async { Ok(None) })
    }
}

#[tokio::test]
async fn exhausted_event_is_recorded_and_republished_with_headers() {
    let bus = Arc::new(InMemoryEventBus::new());
    let dead_letters = Arc::new(InMemoryDeadLetters::new());
    let service = OrderService::new(
        Arc::new(FailingOrderStore),
        bus.clone(),
        Arc::new(InMemoryInbox::new(chrono::Duration::hours(48))),
        Arc::clone(&dead_letters) as Arc<dyn merx_core::dead_letter::DeadLetterSink>,
        Arc::new(test_clock()),
        SagaConfig::default(),
    );

    let order_id = merx_core::types::OrderId::new();
    let envelope = EventEnvelope::new(
        order_id.to_string(),
        DomainEvent::StockReserved {
            order_id,
            reservations: vec![],
            expires_at: Utc::now() + chrono::Duration::minutes(30),
        },
        Utc::now(),
    );
    service.process(envelope.clone()).await;

    // The failure is recorded durably with its context.
    let entries = dead_letters.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].original_topic, topics::STOCK_RESERVED);
    assert_eq!(entries[0].error_class, "STORE_FAILURE");

    // The envelope lands on the dead-letter topic with failure headers.
    let republished = bus.published_on(&topics::dlq(topics::STOCK_RESERVED));
    assert_eq!(republished.len(), 1);
    assert_eq!(republished[0].event_id, envelope.event_id);

    let headers = bus.headers_of(envelope.event_id);
    assert!(headers.iter().any(|(key, value)| {
        key == "x-dlq-original-topic" && value == topics::STOCK_RESERVED
    }));
    assert!(headers.iter().any(|(key, _)| key == "x-dlq-error-message"));
}
