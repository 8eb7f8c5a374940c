//! Integration tests for the Redpanda adapter against a real Kafka broker.
//!
//! These tests are marked `#[ignore]` because they need Docker (testcontainers) and take
//! tens of seconds to start a broker.
//!
//! ```bash
//! cargo test -p shopwire-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use futures::StreamExt;
use shopwire_core::transport::{BrokerChannel, DeliveryStream};
use shopwire_redpanda::RedpandaConnector;
use shopwire_runtime::{ConnectionManager, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default().start().await.expect("Failed to start Kafka container");
    address_of(kafka).await
}

/// A broker that rejects writes to topics nobody created, as production clusters do.
async fn start_strict_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "false")
        .start()
        .await
        .expect("Failed to start Kafka container");
    address_of(kafka).await
}

async fn address_of(kafka: ContainerAsync<Kafka>) -> (ContainerAsync<Kafka>, String) {
    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka.get_host_port_ipv4(KAFKA_PORT).await.expect("Failed to get port");
    (kafka, format!("kafka://{host}:{port}"))
}

/// Connect through the manager so a broker that is still booting is retried.
async fn connect(url: &str) -> Arc<dyn BrokerChannel> {
    let connector = RedpandaConnector::new().with_auto_offset_reset("earliest");
    ConnectionManager::new(Arc::new(connector))
        .with_policy(RetryPolicy::fixed(30, Duration::from_secs(1)))
        .connect(url, "shopping")
        .await
        .expect("Failed to connect to Kafka")
}

async fn next_payload(stream: &mut DeliveryStream) -> (String, Vec<u8>, shopwire_core::Delivery) {
    let delivery = tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .expect("Timeout waiting for delivery")
        .expect("Stream ended")
        .expect("Delivery error");
    (delivery.routing_key().to_string(), delivery.payload().to_vec(), delivery)
}

#[tokio::test]
#[ignore]
async fn published_event_reaches_bound_queue() {
    let (_kafka, url) = start_kafka().await;
    let channel = connect(&url).await;

    let mut stream = channel
        .bind("products_service", &["ORDER_CREATED".to_string()])
        .await
        .expect("Failed to bind");
    tokio::time::sleep(Duration::from_secs(3)).await;

    channel
        .publish("ORDER_CREATED", br#"{"userId":"u1"}"#)
        .await
        .expect("Failed to publish");

    let (key, payload, delivery) = next_payload(&mut stream).await;
    assert_eq!(key, "ORDER_CREATED");
    assert_eq!(payload, br#"{"userId":"u1"}"#);
    delivery.ack().await.expect("Failed to ack");
}

#[tokio::test]
#[ignore]
async fn unacked_delivery_is_redelivered_after_rebind() {
    let (_kafka, url) = start_kafka().await;
    let channel = connect(&url).await;
    let keys = ["PRODUCT_ADDED_TO_CART".to_string()];

    let mut first = channel.bind("shopping_service", &keys).await.expect("Failed to bind");
    tokio::time::sleep(Duration::from_secs(3)).await;
    channel
        .publish("PRODUCT_ADDED_TO_CART", b"cart-1")
        .await
        .expect("Failed to publish");

    let (_, payload, unacked) = next_payload(&mut first).await;
    assert_eq!(payload, b"cart-1");
    drop(unacked);
    drop(first);
    tokio::time::sleep(Duration::from_secs(8)).await;

    let mut second = channel.bind("shopping_service", &keys).await.expect("Failed to rebind");
    let (_, payload, delivery) = next_payload(&mut second).await;
    assert_eq!(payload, b"cart-1");
    delivery.ack().await.expect("Failed to ack");
}

#[tokio::test]
#[ignore]
async fn binding_twice_is_idempotent() {
    let (_kafka, url) = start_kafka().await;
    let channel = connect(&url).await;
    let keys = ["USER_CREATED".to_string()];

    let first = channel.bind("customer_service", &keys).await.expect("First bind failed");
    drop(first);
    channel.bind("customer_service", &keys).await.expect("Second bind failed");
}

#[tokio::test]
#[ignore]
async fn publishing_to_an_unbound_key_creates_its_topic() {
    let (_kafka, url) = start_strict_kafka().await;
    let channel = connect(&url).await;

    channel
        .publish("dead_letter.products_service", br#"{"queue":"products_service"}"#)
        .await
        .expect("Failed to publish before any bind");
    channel
        .publish("dead_letter.products_service", br#"{"queue":"products_service","n":2}"#)
        .await
        .expect("Failed to publish to a cached topic");

    let mut stream = channel
        .bind("dead_letter_audit", &["dead_letter.products_service".to_string()])
        .await
        .expect("Failed to bind");

    let (key, payload, delivery) = next_payload(&mut stream).await;
    assert_eq!(key, "dead_letter.products_service");
    assert_eq!(payload, br#"{"queue":"products_service"}"#);
    delivery.ack().await.expect("Failed to ack");
}
