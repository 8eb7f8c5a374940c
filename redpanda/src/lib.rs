//! Redpanda broker adapter for Shopwire.
//!
//! Implements [`BrokerConnector`] and [`BrokerChannel`] from `shopwire-core` on top of
//! rdkafka, so any Kafka-compatible cluster (Redpanda, Apache Kafka, MSK) can carry the
//! push path.
//!
//! # Topology mapping
//!
//! Kafka has no exchanges or bindings, so the exchange/routing-key model is mapped onto
//! topics and consumer groups:
//!
//! ```text
//!   exchange "shopping" + routing key "ORDER_CREATED"  ──▶  topic "shopping.ORDER_CREATED"
//!   queue "products_service"                           ──▶  consumer group "products_service"
//!   publish(key) / bind(queue, keys)                   ──▶  create missing topics
//!   bind(queue, keys)                                  ──▶  subscribe group
//!   Delivery::ack                                      ──▶  commit offset + 1
//! ```
//!
//! Every replica of a service joins the same group, so each event is handled by one
//! replica per service, and every service with its own queue sees every event.
//!
//! # Delivery semantics
//!
//! **At-least-once** with manual commits: offsets are committed only when the consumer
//! acknowledges a delivery. A message that is never acknowledged is redelivered after the
//! consumer rejoins the group. Committing a later offset on the same partition also
//! covers the earlier ones.
//!
//! # Example
//!
//! ```no_run
//! use shopwire_core::transport::BrokerConnector;
//! use shopwire_redpanda::RedpandaConnector;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = RedpandaConnector::new().with_auto_offset_reset("earliest");
//! let channel = connector.connect("kafka://localhost:9092", "shopping").await?;
//! channel.publish("ORDER_CREATED", br#"{"userId":"u1"}"#).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use futures::StreamExt;
use futures::future::BoxFuture;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use shopwire_core::transport::{
    Acknowledger, BrokerChannel, BrokerConnector, Delivery, DeliveryStream, TransportError,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Opens [`RedpandaChannel`]s.
///
/// Holds producer and consumer settings shared by every channel it opens.
#[derive(Debug, Clone)]
pub struct RedpandaConnector {
    producer_acks: String,
    compression: String,
    timeout: Duration,
    auto_offset_reset: String,
    buffer_size: usize,
    partitions: i32,
    replication: i32,
}

impl Default for RedpandaConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RedpandaConnector {
    /// Create a connector with leader acks, no compression, a 5 second timeout and
    /// consumers starting at the latest offset.
    #[must_use]
    pub fn new() -> Self {
        Self {
            producer_acks: "1".to_string(),
            compression: "none".to_string(),
            timeout: Duration::from_secs(5),
            auto_offset_reset: "latest".to_string(),
            buffer_size: 1000,
            partitions: 1,
            replication: 1,
        }
    }

    /// Set the producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    #[must_use]
    pub fn with_producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = acks.into();
        self
    }

    /// Set the compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"` or `"zstd"`.
    #[must_use]
    pub fn with_compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = compression.into();
        self
    }

    /// Set the producer send and metadata timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Where a new consumer group starts reading: `"earliest"` or `"latest"`.
    #[must_use]
    pub fn with_auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = policy.into();
        self
    }

    /// Deliveries buffered between the Kafka consumer and the push consumer.
    ///
    /// A value of zero is treated as one.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Partition count and replication factor for topics created on bind.
    #[must_use]
    pub const fn with_topic_layout(mut self, partitions: i32, replication: i32) -> Self {
        self.partitions = partitions;
        self.replication = replication;
        self
    }

    fn producer(&self, brokers: &str) -> Result<FutureProducer, TransportError> {
        ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", self.timeout.as_millis().to_string())
            .set("acks", &self.producer_acks)
            .set("compression.type", &self.compression)
            .create()
            .map_err(|e| TransportError::ConnectionFailed(format!("Failed to create producer: {e}")))
    }
}

impl BrokerConnector for RedpandaConnector {
    fn connect(
        &self,
        url: &str,
        exchange: &str,
    ) -> BoxFuture<'_, Result<Arc<dyn BrokerChannel>, TransportError>> {
        let brokers = bootstrap_servers(url);
        let exchange = exchange.to_string();

        Box::pin(async move {
            let producer = self.producer(&brokers)?;

            // Producer creation is lazy; fetching metadata proves a broker answers
            let probe = producer.clone();
            let timeout = self.timeout;
            let cluster_size = tokio::task::spawn_blocking(move || {
                probe.client().fetch_metadata(None, Timeout::After(timeout)).map(|metadata| metadata.brokers().len())
            })
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("Metadata probe aborted: {e}")))?
            .map_err(|e| TransportError::ConnectionFailed(format!("Broker unreachable: {e}")))?;

            tracing::info!(
                brokers = %brokers,
                cluster_size,
                exchange = %exchange,
                acks = %self.producer_acks,
                compression = %self.compression,
                "Connected to Redpanda"
            );

            Ok(Arc::new(RedpandaChannel {
                exchange,
                brokers,
                producer,
                settings: self.clone(),
                known_topics: Mutex::new(HashSet::new()),
            }) as Arc<dyn BrokerChannel>)
        })
    }
}

/// A connected Redpanda channel publishing under one exchange prefix.
///
/// Topics are created on first use, by either `publish` or `bind`, so clusters with
/// topic auto-creation disabled still accept events nobody has bound yet, such as
/// dead letters.
pub struct RedpandaChannel {
    exchange: String,
    brokers: String,
    producer: FutureProducer,
    settings: RedpandaConnector,
    // Topics this channel created or found existing
    known_topics: Mutex<HashSet<String>>,
}

impl RedpandaChannel {
    /// Bootstrap servers this channel talks to.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    async fn ensure_topics(&self, topics: &[String]) -> Result<(), String> {
        let missing: Vec<String> = {
            let known = self.known_topics.lock().map_err(|_| "Topic cache poisoned".to_string())?;
            topics.iter().filter(|t| !known.contains(*t)).cloned().collect()
        };
        if missing.is_empty() {
            return Ok(());
        }

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .create()
            .map_err(|e| format!("Failed to create admin client: {e}"))?;

        let new_topics: Vec<NewTopic<'_>> = missing
            .iter()
            .map(|t| {
                NewTopic::new(t, self.settings.partitions, TopicReplication::Fixed(self.settings.replication))
            })
            .collect();

        let results = admin
            .create_topics(&new_topics, &AdminOptions::new())
            .await
            .map_err(|e| format!("Failed to create topics: {e}"))?;

        for result in results {
            match result {
                Ok(topic) => tracing::debug!(topic = %topic, "Created topic"),
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((topic, code)) => return Err(format!("Topic '{topic}': {code}")),
            }
        }

        self.known_topics
            .lock()
            .map_err(|_| "Topic cache poisoned".to_string())?
            .extend(missing);
        Ok(())
    }
}

impl BrokerChannel for RedpandaChannel {
    fn exchange(&self) -> &str {
        &self.exchange
    }

    fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        let topic = topic_for(&self.exchange, routing_key);
        let routing_key = routing_key.to_string();
        let payload = payload.to_vec();

        Box::pin(async move {
            self.ensure_topics(std::slice::from_ref(&topic))
                .await
                .map_err(|reason| {
                    tracing::error!(topic = %topic, error = %reason, "Failed to create topic for publish");
                    TransportError::PublishFailed {
                        destination: routing_key.clone(),
                        reason,
                    }
                })?;

            let record = FutureRecord::to(&topic).payload(&payload).key(routing_key.as_bytes());

            match self.producer.send(record, Timeout::After(self.settings.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(topic = %topic, partition, offset, "Published to Redpanda");
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(topic = %topic, error = %kafka_error, "Failed to publish to Redpanda");
                    Err(TransportError::PublishFailed {
                        destination: routing_key,
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    fn bind(
        &self,
        queue: &str,
        routing_keys: &[String],
    ) -> BoxFuture<'_, Result<DeliveryStream, TransportError>> {
        let queue = queue.to_string();
        let topics: Vec<String> = routing_keys.iter().map(|k| topic_for(&self.exchange, k)).collect();

        Box::pin(async move {
            self.ensure_topics(&topics).await.map_err(|reason| TransportError::BindFailed {
                queue: queue.clone(),
                reason,
            })?;

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &queue)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.settings.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| TransportError::BindFailed {
                    queue: queue.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer.subscribe(&topic_refs).map_err(|e| TransportError::BindFailed {
                queue: queue.clone(),
                reason: format!("Failed to subscribe: {e}"),
            })?;

            tracing::info!(queue = %queue, topics = ?topics, "Bound consumer group");

            let (tx, rx) = tokio::sync::mpsc::channel(self.settings.buffer_size);
            let consumer = Arc::new(consumer);
            let exchange = self.exchange.clone();

            // The task owns the consumer; dropping the stream ends it and leaves the group
            tokio::spawn(async move {
                let reader = Arc::clone(&consumer);
                let mut messages = reader.stream();

                while let Some(next) = messages.next().await {
                    let item = match next {
                        Ok(message) => {
                            let acker = OffsetAcker {
                                consumer: Arc::clone(&consumer),
                                topic: message.topic().to_string(),
                                partition: message.partition(),
                                offset: message.offset(),
                            };
                            tracing::trace!(
                                topic = message.topic(),
                                partition = message.partition(),
                                offset = message.offset(),
                                "Received message"
                            );
                            Ok(Delivery::new(
                                routing_key_of(&exchange, message.topic()),
                                message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                                Box::new(acker),
                            ))
                        }
                        Err(e) => Err(TransportError::ReceiveFailed(e.to_string())),
                    };

                    if tx.send(item).await.is_err() {
                        tracing::debug!(queue = %queue, "Delivery stream dropped, leaving group");
                        break;
                    }
                }
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

/// Commits the offset after one message.
struct OffsetAcker {
    consumer: Arc<StreamConsumer>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl Acknowledger for OffsetAcker {
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>> {
        Box::pin(async move {
            let mut offsets = TopicPartitionList::new();
            offsets
                .add_partition_offset(&self.topic, self.partition, Offset::Offset(self.offset + 1))
                .map_err(|e| TransportError::AckFailed(e.to_string()))?;
            self.consumer
                .commit(&offsets, CommitMode::Async)
                .map_err(|e| TransportError::AckFailed(format!("{}[{}]@{}: {e}", self.topic, self.partition, self.offset)))
        })
    }
}

/// Topic carrying `routing_key` on `exchange`.
#[must_use]
pub fn topic_for(exchange: &str, routing_key: &str) -> String {
    format!("{exchange}.{routing_key}")
}

/// Routing key recovered from a topic name; topics outside the exchange pass through.
#[must_use]
pub fn routing_key_of(exchange: &str, topic: &str) -> String {
    topic
        .strip_prefix(exchange)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(topic)
        .to_string()
}

/// Bootstrap servers from a broker URL.
///
/// Accepts `kafka://[user:pass@]host:port[,host:port]` or a bare server list; user info
/// is dropped since SASL settings are not carried in the URL.
#[must_use]
pub fn bootstrap_servers(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let rest = rest.rsplit_once('@').map_or(rest, |(_, hosts)| hosts);
    rest.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_and_connector_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RedpandaChannel>();
        assert_send_sync::<RedpandaConnector>();
    }

    #[test]
    fn routing_keys_map_to_exchange_topics() {
        assert_eq!(topic_for("shopping", "ORDER_CREATED"), "shopping.ORDER_CREATED");
        assert_eq!(routing_key_of("shopping", "shopping.ORDER_CREATED"), "ORDER_CREATED");
        assert_eq!(routing_key_of("shopping", "other.ORDER_CREATED"), "other.ORDER_CREATED");
    }

    #[test]
    fn dead_letter_keys_keep_their_dots() {
        let topic = topic_for("shopping", "dead_letter.products_service");
        assert_eq!(routing_key_of("shopping", &topic), "dead_letter.products_service");
    }

    #[test]
    fn bootstrap_servers_strip_scheme_and_credentials() {
        assert_eq!(bootstrap_servers("kafka://localhost:9092"), "localhost:9092");
        assert_eq!(bootstrap_servers("kafka://guest:secret@b1:9092,b2:9092/"), "b1:9092,b2:9092");
        assert_eq!(bootstrap_servers("localhost:9092"), "localhost:9092");
    }

    #[test]
    fn zero_buffer_is_clamped() {
        let connector = RedpandaConnector::new().with_buffer_size(0);
        assert_eq!(connector.buffer_size, 1);
    }
}
