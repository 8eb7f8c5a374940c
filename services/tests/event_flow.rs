//! Integration tests running the three services against shared in-memory transports.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use serde_json::Value;
use shopwire_core::event::{EventKind, Product};
use shopwire_core::transport::{BrokerChannel, CloudBus};
use shopwire_services::catalog::Catalog;
use shopwire_services::customer::{Customers, NewCustomer};
use shopwire_services::repository::{STOCK_ATTRIBUTE, stock_of};
use shopwire_services::shopping::Shopping;
use shopwire_services::{Domain, Resources, Service, ServiceConfig, ServiceError};
use shopwire_testing::{InMemoryBroker, InMemoryCloudBus, InMemoryCloudQueue, InMemoryMarkerStore, init_test_tracing};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

fn config(service: &str) -> ServiceConfig {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("SERVICE_NAME", service),
        ("MSG_QUEUE_URL", "memory://broker"),
        ("EXCHANGE_NAME", "shopping"),
        ("POLL_WAIT_SECS", "1"),
        ("HANDLER_TIMEOUT_SECS", "5"),
    ]);
    ServiceConfig::from_lookup(|var| vars.get(var).map(|v| (*v).to_string())).unwrap()
}

struct Shop {
    broker: InMemoryBroker,
    bus: InMemoryCloudBus,
    services: Vec<Service>,
}

impl Shop {
    async fn open() -> Self {
        init_test_tracing();
        let broker = InMemoryBroker::new("shopping");
        let bus = InMemoryCloudBus::new();
        let channel: Arc<dyn BrokerChannel> = Arc::new(broker.clone());

        let mut services = Vec::new();
        for name in ["catalog", "customer", "shopping"] {
            let queue =
                InMemoryCloudQueue::new(format!("https://queue.local/000/{name}")).with_visibility_timeout(Duration::from_secs(1));
            bus.route_to(&queue);

            let cloud_bus: Arc<dyn CloudBus> = Arc::new(bus.clone());
            let resources = Resources {
                channel: Arc::clone(&channel),
                cloud_bus: Some((cloud_bus, "shopwire-bus".to_string())),
                cloud_queue: Some(Arc::new(queue)),
                markers: Some(Arc::new(InMemoryMarkerStore::new())),
            };
            services.push(Service::from_parts(&config(name), resources).unwrap());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        Self { broker, bus, services }
    }

    fn catalog(&self) -> Arc<Catalog> {
        let Domain::Catalog(catalog) = self.services[0].domain().clone() else { panic!("not the catalog") };
        catalog
    }

    fn customers(&self) -> Arc<Customers> {
        let Domain::Customer(customers) = self.services[1].domain().clone() else { panic!("not the customer service") };
        customers
    }

    fn shopping(&self) -> Arc<Shopping> {
        let Domain::Shopping(shopping) = self.services[2].domain().clone() else { panic!("not the shopping service") };
        shopping
    }

    fn published(&self, routing_key: &str) -> Vec<Value> {
        self.broker
            .published()
            .into_iter()
            .filter(|(key, _)| key == routing_key)
            .map(|(_, body)| serde_json::from_slice(&body).unwrap())
            .collect()
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    async fn close(self) {
        for service in self.services {
            service.shutdown(Duration::from_secs(1)).await;
        }
    }
}

fn product(id: &str, stock: i64, price: i64) -> Product {
    let mut product = Product::new(id);
    product.attributes.insert(STOCK_ATTRIBUTE.to_string(), Value::from(stock));
    product.attributes.insert("price".to_string(), Value::from(price));
    product.attributes.insert("name".to_string(), Value::from("Alphonso"));
    product
}

async fn sign_up(shop: &Shop, id: &str) {
    shop.customers()
        .sign_up(NewCustomer {
            id: id.to_string(),
            email: format!("{id}@shop.test"),
            phone: "555".to_string(),
        })
        .await
        .unwrap();
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn placed_order_reduces_stock_once_and_links_once() {
    let shop = Shop::open().await;
    sign_up(&shop, "u1").await;
    shop.catalog().create_product(product("p1", 10, 100)).await.unwrap();
    shop.settle().await;

    shop.catalog().publish_selection(EventKind::AddToCart, "u1", "p1", 3).await.unwrap();
    shop.settle().await;

    let order = shop.shopping().place_order("u1", "txn-1").await.unwrap().expect("cart has items");
    assert_eq!(order.attributes["amount"], Value::from(300));
    shop.settle().await;

    // Delivered on both transports, applied once
    assert_eq!(stock_of(&shop.catalog().product("p1").await.unwrap()), 7);

    let profile = shop.customers().profile("u1").await.unwrap();
    assert_eq!(profile.orders.len(), 1);
    assert_eq!(profile.orders[0].id, order.id);
    assert_eq!(profile.cart.len(), 1);

    let linked = shop.published("CustomerOrderLinked");
    assert_eq!(linked.len(), 1);
    assert_eq!(linked[0]["data"]["order"]["_id"], Value::from(order.id.clone()));
    shop.close().await;
}

#[tokio::test(start_paused = true)]
async fn sign_up_creates_a_cart_that_orders_from_selections() {
    let shop = Shop::open().await;
    sign_up(&shop, "u2").await;
    shop.catalog().create_product(product("p1", 10, 40)).await.unwrap();
    shop.catalog().create_product(product("p2", 10, 5)).await.unwrap();
    shop.settle().await;

    for (id, qty) in [("p1", 1), ("p2", 2), ("p2", 4)] {
        shop.catalog().publish_selection(EventKind::AddToCart, "u2", id, qty).await.unwrap();
    }
    shop.catalog().publish_selection(EventKind::RemoveFromCart, "u2", "p1", 0).await.unwrap();
    shop.settle().await;

    let order = shop.shopping().place_order("u2", "txn-2").await.unwrap().unwrap();
    assert_eq!(order.items.len(), 1);
    assert_eq!(order.items[0].unit, 4);
    assert_eq!(order.attributes["amount"], Value::from(20));
    assert_eq!(shop.shopping().place_order("u2", "txn-3").await.unwrap(), None);
    shop.close().await;
}

#[tokio::test(start_paused = true)]
async fn every_event_reaches_the_cloud_bus_with_its_source() {
    let shop = Shop::open().await;
    sign_up(&shop, "u3").await;

    let entries = shop.bus.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].source, "customer.service");
    assert_eq!(entries[0].detail_type, "CustomerCreated");
    assert_eq!(entries[0].event_bus_name, "shopwire-bus");
    shop.close().await;
}

#[tokio::test(start_paused = true)]
async fn cloud_bus_outage_does_not_fail_producers() {
    let shop = Shop::open().await;
    shop.bus.fail_puts("throttled");

    sign_up(&shop, "u4").await;

    assert_eq!(shop.published("CustomerCreated").len(), 1);
    assert!(shop.bus.entries().is_empty());
    shop.close().await;
}

#[tokio::test(start_paused = true)]
async fn broker_outage_fails_producers() {
    let shop = Shop::open().await;
    shop.broker.fail_publishes("connection reset");

    let result = shop
        .customers()
        .sign_up(NewCustomer {
            id: "u5".to_string(),
            email: "u5@shop.test".to_string(),
            phone: String::new(),
        })
        .await;

    assert!(matches!(result, Err(ServiceError::Publish(_))));
    shop.close().await;
}

#[tokio::test]
async fn catalog_requires_a_marker_store() {
    let channel: Arc<dyn BrokerChannel> = Arc::new(InMemoryBroker::new("shopping"));
    let result = Service::from_parts(&config("catalog"), Resources::broker_only(channel));
    assert!(result.is_err());
}

#[tokio::test]
async fn customer_service_runs_broker_only() {
    let broker = InMemoryBroker::new("shopping");
    let channel: Arc<dyn BrokerChannel> = Arc::new(broker.clone());
    let service = Service::from_parts(&config("customer"), Resources::broker_only(channel)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(broker.bound_queues("OrderCreated"), vec!["customer_service".to_string()]);
    assert_eq!(service.publisher().source(), "customer.service");
    service.shutdown(Duration::from_secs(1)).await;
}
