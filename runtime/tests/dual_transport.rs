//! Integration tests for events travelling both transports into one guarded handler.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use shopwire_core::event::{DomainEvent, EventKind, Order, OrderPlaced};
use shopwire_core::transport::BrokerChannel;
use shopwire_runtime::{
    DedupKey, DualSinkPublisher, EventRouter, FailurePolicy, GuardOutcome, HandlerError, IdempotencyGuard,
    PullConsumer, PushConsumer, handler_fn,
};
use shopwire_testing::{InMemoryBroker, InMemoryCloudBus, InMemoryCloudQueue, InMemoryMarkerStore, init_test_tracing};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

// ============================================================================
// Test Fixtures
// ============================================================================

type Stock = Arc<Mutex<HashMap<String, i64>>>;

fn order(id: &str, product: &str, unit: i64) -> DomainEvent {
    let order: Order = serde_json::from_value(serde_json::json!({
        "_id": id,
        "items": [{ "product": { "_id": product }, "unit": unit }]
    }))
    .unwrap();
    DomainEvent::OrderCreated(OrderPlaced {
        user_id: "u1".to_string(),
        order,
    })
}

fn inventory_router(stock: &Stock, guard: &IdempotencyGuard) -> Arc<EventRouter> {
    let stock = Arc::clone(stock);
    let guard = guard.clone();
    Arc::new(EventRouter::new("catalog").route(
        EventKind::OrderCreated,
        FailurePolicy::Redeliver,
        handler_fn(move |event: DomainEvent| {
            let stock = Arc::clone(&stock);
            let guard = guard.clone();
            async move {
                let DomainEvent::OrderCreated(placed) = event else {
                    return Err(HandlerError::new("unexpected event"));
                };
                let key = DedupKey::processed_order(&placed.order.id);
                let outcome = guard
                    .run_once(&key, || async {
                        let mut stock = stock.lock().unwrap();
                        for item in &placed.order.items {
                            *stock.entry(item.product.id.clone()).or_insert(10) -= item.unit;
                        }
                        Ok(())
                    })
                    .await?;
                if outcome == GuardOutcome::Duplicate {
                    tracing::info!(order_id = %placed.order.id, "duplicate order skipped");
                }
                Ok(())
            }
        }),
    ))
}

struct Harness {
    broker: InMemoryBroker,
    queue: InMemoryCloudQueue,
    publisher: DualSinkPublisher,
    stock: Stock,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Harness {
    async fn start() -> Self {
        init_test_tracing();
        let broker = InMemoryBroker::new("shopping");
        let bus = InMemoryCloudBus::new();
        let queue = InMemoryCloudQueue::new("https://queue.local/000/products").with_visibility_timeout(Duration::from_secs(1));
        bus.route_to(&queue);

        let channel: Arc<dyn BrokerChannel> = Arc::new(broker.clone());
        let publisher = DualSinkPublisher::new(Arc::clone(&channel), "shopping").with_cloud_bus(Arc::new(bus), "bus");
        let stock: Stock = Arc::default();
        let guard = IdempotencyGuard::new(Arc::new(InMemoryMarkerStore::new()));
        let router = inventory_router(&stock, &guard);

        let (shutdown, _) = broadcast::channel(1);
        let tasks = vec![
            PushConsumer::new(channel, "products_service", Arc::clone(&router), shutdown.subscribe()).spawn(),
            PullConsumer::new(Arc::new(queue.clone()), router, shutdown.subscribe()).spawn(),
        ];
        tokio::time::sleep(Duration::from_millis(10)).await;

        Self {
            broker,
            queue,
            publisher,
            stock,
            shutdown,
            tasks,
        }
    }

    fn stock_of(&self, product: &str) -> i64 {
        self.stock.lock().unwrap().get(product).copied().unwrap_or(10)
    }

    async fn stop(self) {
        self.shutdown.send(()).unwrap();
        for task in self.tasks {
            task.await.unwrap();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn order_on_both_transports_decrements_once() {
    let harness = Harness::start().await;

    harness.publisher.publish_event(&order("o1", "p1", 3)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(harness.stock_of("p1"), 7);
    assert_eq!(harness.broker.acked("products_service").len(), 1);
    assert!(harness.queue.is_empty());
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn republished_order_is_skipped() {
    let harness = Harness::start().await;

    let event = order("o1", "p1", 2);
    harness.publisher.publish_event(&event).await.unwrap();
    harness.publisher.publish_event(&event).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(harness.stock_of("p1"), 8);
    assert_eq!(harness.broker.acked("products_service").len(), 2);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn distinct_orders_each_apply() {
    let harness = Harness::start().await;

    harness.publisher.publish_event(&order("o1", "p1", 1)).await.unwrap();
    harness.publisher.publish_event(&order("o2", "p1", 4)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(harness.stock_of("p1"), 5);
    harness.stop().await;
}
