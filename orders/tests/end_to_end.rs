//! End-to-end flows across both services over the in-memory bus:
//! create → reserve → confirm → pay → deduct, plus the compensation paths.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code

use merx_core::clock::SystemClock;
use merx_core::config::{LockConfig, ReservationConfig, SagaConfig};
use merx_core::event::{CancelInitiator, DomainEvent, EventEnvelope, topics};
use merx_core::event_bus::EventBus;
use merx_core::inbox::InMemoryInbox;
use merx_core::types::{Currency, CustomerId, Money, OrderItem, ProductId, Quantity};
use merx_inventory::engine::StockEngine;
use merx_inventory::product::Product;
use merx_inventory::service::InventoryService;
use merx_inventory::store::{InMemoryProductStore, ProductStore};
use merx_lock::LockManager;
use merx_lock::store::InMemoryLockStore;
use merx_orders::order::OrderStatus;
use merx_orders::service::OrderService;
use merx_orders::store::{InMemoryOrderStore, OrderStore};
use merx_testing::mocks::{InMemoryDeadLetters, InMemoryEventBus};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

struct Platform {
    bus: Arc<InMemoryEventBus>,
    engine: Arc<StockEngine>,
    product_store: Arc<InMemoryProductStore>,
    orders: Arc<OrderService>,
}

async fn platform() -> Platform {
    let bus = Arc::new(InMemoryEventBus::new());
    let clock = Arc::new(SystemClock);

    let product_store = Arc::new(InMemoryProductStore::with_bus(bus.clone()));
    let locks = Arc::new(LockManager::new(
        LockConfig::default(),
        Arc::new(InMemoryLockStore::new()),
    ));
    let engine = Arc::new(StockEngine::new(
        Arc::clone(&product_store) as Arc<dyn ProductStore>,
        locks,
        clock.clone(),
        ReservationConfig::default(),
    ));
    let inventory = Arc::new(InventoryService::new(
        Arc::clone(&engine),
        Arc::clone(&product_store) as Arc<dyn ProductStore>,
        bus.clone(),
        Arc::new(InMemoryInbox::new(chrono::Duration::hours(4))),
        Arc::new(InMemoryDeadLetters::new()),
        clock.clone(),
    ));

    let order_store = Arc::new(InMemoryOrderStore::with_bus(bus.clone()));
    let orders = Arc::new(OrderService::new(
        order_store as Arc<dyn OrderStore>,
        bus.clone(),
        Arc::new(InMemoryInbox::new(chrono::Duration::hours(4))),
        Arc::new(InMemoryDeadLetters::new()),
        clock,
        SagaConfig::default(),
    ));

    tokio::spawn({
        let inventory = Arc::clone(&inventory);
        async move {
            let _ = inventory.run().await;
        }
    });
    tokio::spawn({
        let orders = Arc::clone(&orders);
        async move {
            let _ = orders.run().await;
        }
    });
    // Let both consumers finish subscribing before anything publishes.
    tokio::time::sleep(Duration::from_millis(100)).await;

    Platform {
        bus,
        engine,
        product_store,
        orders,
    }
}

async fn seed_product(platform: &Platform, units: u32) -> ProductId {
    let product = Product::new(
        ProductId::new(),
        "Widget".to_string(),
        Quantity::new(units),
        Quantity::new(0),
    );
    let id = product.id;
    platform
        .product_store
        .insert(product)
        .await
        .expect("insert product");
    id
}

fn item(product_id: ProductId, quantity: u32) -> OrderItem {
    OrderItem::new(
        product_id,
        "Widget".to_string(),
        Quantity::new(quantity),
        Money::new(Decimal::new(2500, 2), Currency::USD),
    )
}

/// Poll until the order reaches `status` or the deadline passes.
async fn wait_for_status(platform: &Platform, order_id: merx_core::types::OrderId, status: OrderStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let order = platform.orders.get_order(order_id).await.expect("get order");
        if order.status == status {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "order {order_id} stuck in {} waiting for {status}",
            order.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn order_is_confirmed_after_inventory_reserves() {
    let p = platform().await;
    let product_id = seed_product(&p, 10).await;

    let order = p
        .orders
        .create_order(CustomerId::new(), vec![item(product_id, 3)])
        .await
        .expect("create");

    wait_for_status(&p, order.id, OrderStatus::Confirmed).await;

    let snapshot = p.engine.snapshot(product_id).await.expect("snapshot");
    assert_eq!(snapshot.stock.reserved, Quantity::new(3));
    assert_eq!(snapshot.stock.available, Quantity::new(7));

    let confirmed = p.orders.get_order(order.id).await.expect("get");
    assert_eq!(confirmed.reservations.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn insufficient_stock_cancels_order_without_holding_anything() {
    let p = platform().await;
    let scarce = seed_product(&p, 1).await;
    let plentiful = seed_product(&p, 10).await;

    let order = p
        .orders
        .create_order(
            CustomerId::new(),
            vec![item(plentiful, 2), item(scarce, 5)],
        )
        .await
        .expect("create");

    wait_for_status(&p, order.id, OrderStatus::Cancelled).await;

    let s1 = p.engine.snapshot(plentiful).await.expect("snapshot");
    let s2 = p.engine.snapshot(scarce).await.expect("snapshot");
    assert_eq!(s1.stock.reserved, Quantity::new(0));
    assert_eq!(s1.stock.available, Quantity::new(10));
    assert_eq!(s2.stock.reserved, Quantity::new(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn paid_order_deducts_stock() {
    let p = platform().await;
    let product_id = seed_product(&p, 10).await;

    let order = p
        .orders
        .create_order(CustomerId::new(), vec![item(product_id, 4)])
        .await
        .expect("create");
    wait_for_status(&p, order.id, OrderStatus::Confirmed).await;

    p.orders
        .advance(order.id, OrderStatus::PaymentPending)
        .await
        .expect("advance");
    p.orders
        .advance(order.id, OrderStatus::PaymentProcessing)
        .await
        .expect("advance");

    // The payment service settles the payment.
    let payment = EventEnvelope::new(
        order.id.to_string(),
        DomainEvent::PaymentCompleted {
            order_id: order.id,
            transaction_id: "txn-77".to_string(),
            amount: order.total_amount,
        },
        chrono::Utc::now(),
    );
    p.bus
        .publish(payment.topic(), &payment)
        .await
        .expect("publish payment");

    wait_for_status(&p, order.id, OrderStatus::Paid).await;

    // OrderPaid reaches inventory, which confirms the reservation.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = p.engine.snapshot(product_id).await.expect("snapshot");
        if snapshot.stock.total() == Quantity::new(6) {
            assert_eq!(snapshot.stock.reserved, Quantity::new(0));
            assert!(snapshot.invariant_holds());
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "stock never deducted");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn payment_failure_compensates_by_releasing_stock() {
    let p = platform().await;
    let product_id = seed_product(&p, 10).await;

    let order = p
        .orders
        .create_order(CustomerId::new(), vec![item(product_id, 4)])
        .await
        .expect("create");
    wait_for_status(&p, order.id, OrderStatus::Confirmed).await;
    p.orders
        .advance(order.id, OrderStatus::PaymentPending)
        .await
        .expect("advance");
    p.orders
        .advance(order.id, OrderStatus::PaymentProcessing)
        .await
        .expect("advance");

    let failure = EventEnvelope::new(
        order.id.to_string(),
        DomainEvent::PaymentFailed {
            order_id: order.id,
            reason: "card declined".to_string(),
        },
        chrono::Utc::now(),
    );
    p.bus
        .publish(failure.topic(), &failure)
        .await
        .expect("publish failure");

    wait_for_status(&p, order.id, OrderStatus::Failed).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = p.engine.snapshot(product_id).await.expect("snapshot");
        if snapshot.stock.available == Quantity::new(10) {
            assert_eq!(snapshot.stock.reserved, Quantity::new(0));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "stock never released");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn customer_cancel_releases_each_reservation_exactly_once() {
    let p = platform().await;
    let product_id = seed_product(&p, 10).await;

    let order = p
        .orders
        .create_order(CustomerId::new(), vec![item(product_id, 4)])
        .await
        .expect("create");
    wait_for_status(&p, order.id, OrderStatus::Confirmed).await;

    let confirmed = p.orders.get_order(order.id).await.expect("get");
    let reservation_id = *confirmed
        .reservations
        .get(&product_id)
        .expect("reservation id stored");

    p.orders
        .cancel_order(order.id, "changed my mind".to_string(), CancelInitiator::Customer)
        .await
        .expect("cancel");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = p.engine.snapshot(product_id).await.expect("snapshot");
        if snapshot.stock.available == Quantity::new(10) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "stock never released");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Exactly one release event for the reservation.
    let releases: Vec<_> = p
        .bus
        .published_on(topics::STOCK_RELEASED)
        .into_iter()
        .filter(|e| {
            matches!(
                &e.payload,
                DomainEvent::StockReleased { reservation_id: id, .. } if *id == reservation_id
            )
        })
        .collect();
    assert_eq!(releases.len(), 1);
}
