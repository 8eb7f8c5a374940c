//! Dual-sink event publisher.
//!
//! Every event is written to two independent destinations:
//!
//! 1. The **broker**, under a routing key equal to the event type. This is the durable,
//!    authoritative path; a failure here is returned to the caller.
//! 2. The **cloud bus**, as a [`CloudEnvelope`]. This path is best effort: failures are
//!    logged and reported in the [`PublishResult`] but never raised.
//!
//! The payload is serialized once and both sinks are attempted concurrently, so a slow
//! cloud bus never delays the broker write. There is no atomicity between the two: an
//! event may reach one sink and not the other, and consumers must tolerate receiving
//! it on either path, or on both.

use crate::metrics::PublishMetrics;
use shopwire_core::envelope::{CloudEnvelope, service_source};
use shopwire_core::event::DomainEvent;
use shopwire_core::transport::{BrokerChannel, CloudBus, TransportError};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// What happened at one sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOutcome {
    /// The sink accepted the event.
    Delivered,
    /// The sink is not configured and was not attempted.
    Skipped {
        /// Why the sink was skipped
        reason: String,
    },
    /// The sink was attempted and failed.
    Failed {
        /// The error reported by the sink
        reason: String,
    },
}

impl SinkOutcome {
    /// Whether the sink accepted the event.
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    /// Metric label for this outcome.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for SinkOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => f.write_str("delivered"),
            Self::Skipped { reason } => write!(f, "skipped ({reason})"),
            Self::Failed { reason } => write!(f, "failed ({reason})"),
        }
    }
}

/// Per-sink outcome of one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    /// Event type, also the routing key and `DetailType`
    pub event_type: String,
    /// Broker outcome
    pub broker: SinkOutcome,
    /// Cloud bus outcome
    pub cloud: SinkOutcome,
}

/// Publishing failed on the authoritative sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The event could not be serialized; neither sink was attempted.
    #[error("Could not serialize {event_type}: {reason}")]
    Serialize {
        /// Event type being published
        event_type: String,
        /// Serializer message
        reason: String,
    },

    /// The broker rejected the event. The cloud outcome is in `result`.
    #[error("Broker publish of {} failed: {source}", result.event_type)]
    Broker {
        /// Outcome of both sinks
        result: PublishResult,
        /// Broker error
        #[source]
        source: TransportError,
    },
}

struct CloudSink {
    bus: Arc<dyn CloudBus>,
    bus_name: String,
}

/// Publishes events to the broker and, when configured, the cloud bus.
///
/// # Example
///
/// ```
/// use shopwire_core::event::{CustomerCreated, DomainEvent};
/// use shopwire_runtime::publisher::DualSinkPublisher;
/// use shopwire_testing::InMemoryBroker;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new("shopping");
/// let publisher = DualSinkPublisher::new(Arc::new(broker), "customer");
///
/// let event = DomainEvent::CustomerCreated(CustomerCreated {
///     user_id: "u1".into(),
///     email: "a@example.com".into(),
///     phone: String::new(),
/// });
/// let result = publisher.publish_event(&event).await?;
/// assert!(result.broker.is_delivered());
/// assert!(!result.cloud.is_delivered());
/// # Ok(())
/// # }
/// ```
pub struct DualSinkPublisher {
    broker: Arc<dyn BrokerChannel>,
    cloud: Option<CloudSink>,
    source: String,
}

impl DualSinkPublisher {
    /// Create a publisher for `service` with only the broker sink.
    #[must_use]
    pub fn new(broker: Arc<dyn BrokerChannel>, service: &str) -> Self {
        Self {
            broker,
            cloud: None,
            source: service_source(service),
        }
    }

    /// Add the cloud sink. A blank `bus_name` leaves the sink unconfigured.
    #[must_use]
    pub fn with_cloud_bus(mut self, bus: Arc<dyn CloudBus>, bus_name: impl Into<String>) -> Self {
        let bus_name = bus_name.into();
        if bus_name.trim().is_empty() {
            warn!(source = %self.source, "Cloud event bus name is empty, cloud sink disabled");
            self.cloud = None;
        } else {
            self.cloud = Some(CloudSink { bus, bus_name });
        }
        self
    }

    /// `Source` attribute attached to cloud entries.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the cloud sink is configured.
    #[must_use]
    pub const fn has_cloud_sink(&self) -> bool {
        self.cloud.is_some()
    }

    /// Serialize and publish a domain event.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Serialize`] if the event cannot be encoded and
    /// [`PublishError::Broker`] if the broker rejected it.
    pub async fn publish_event(&self, event: &DomainEvent) -> Result<PublishResult, PublishError> {
        let payload = event.to_json().map_err(|e| PublishError::Serialize {
            event_type: event.event_type().to_string(),
            reason: e.to_string(),
        })?;
        self.publish(event.event_type(), &payload).await
    }

    /// Publish an already serialized payload under `event_type`.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Broker`] if the broker rejected the payload. Cloud
    /// failures never produce an error.
    pub async fn publish(&self, event_type: &str, payload: &str) -> Result<PublishResult, PublishError> {
        let broker = async {
            match self.broker.publish(event_type, payload.as_bytes()).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    error!(event_type, exchange = self.broker.exchange(), error = %e, "Broker publish failed");
                    Err(e)
                }
            }
        };

        let cloud = async {
            let Some(sink) = &self.cloud else {
                warn!(event_type, "Cloud event bus not configured, skipping cloud sink");
                return SinkOutcome::Skipped {
                    reason: "cloud event bus not configured".to_string(),
                };
            };

            let envelope = CloudEnvelope::new(&self.source, event_type, payload, &sink.bus_name);
            match sink.bus.put_event(&envelope).await {
                Ok(()) => SinkOutcome::Delivered,
                Err(e) => {
                    error!(event_type, bus = %sink.bus_name, error = %e, "Cloud bus publish failed");
                    SinkOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            }
        };

        let (broker, cloud) = tokio::join!(broker, cloud);

        let broker_outcome = match &broker {
            Ok(()) => SinkOutcome::Delivered,
            Err(e) => SinkOutcome::Failed {
                reason: e.to_string(),
            },
        };
        PublishMetrics::record("broker", broker_outcome.label());
        PublishMetrics::record("cloud", cloud.label());

        let result = PublishResult {
            event_type: event_type.to_string(),
            broker: broker_outcome,
            cloud,
        };

        match broker {
            Ok(()) => {
                debug!(event_type, cloud = %result.cloud, "Event published");
                Ok(result)
            }
            Err(source) => Err(PublishError::Broker { result, source }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use shopwire_core::envelope::unwrap_detail;
    use shopwire_core::event::{Decoded, Order, OrderPlaced};
    use shopwire_core::transport::CloudQueue;
    use shopwire_testing::{InMemoryBroker, InMemoryCloudBus, InMemoryCloudQueue};
    use std::time::Duration;

    fn order_created() -> DomainEvent {
        let order: Order = serde_json::from_value(serde_json::json!({
            "_id": "o1",
            "items": [{ "product": { "_id": "p1", "name": "Mango" }, "unit": 2 }],
            "amount": 240
        }))
        .unwrap();
        DomainEvent::OrderCreated(OrderPlaced {
            user_id: "u1".to_string(),
            order,
        })
    }

    #[tokio::test]
    async fn unconfigured_cloud_sink_is_skipped_not_failed() {
        let broker = InMemoryBroker::new("ex");
        let publisher = DualSinkPublisher::new(Arc::new(broker.clone()), "shopping");

        let result = publisher.publish_event(&order_created()).await.unwrap();

        assert_eq!(result.broker, SinkOutcome::Delivered);
        assert!(matches!(result.cloud, SinkOutcome::Skipped { .. }));
        assert_eq!(broker.published().len(), 1);
        assert_eq!(broker.published()[0].0, "OrderCreated");
    }

    #[tokio::test]
    async fn blank_bus_name_disables_cloud_sink() {
        let publisher = DualSinkPublisher::new(Arc::new(InMemoryBroker::new("ex")), "shopping")
            .with_cloud_bus(Arc::new(InMemoryCloudBus::new()), "  ");
        assert!(!publisher.has_cloud_sink());
    }

    #[tokio::test]
    async fn cloud_failure_is_reported_but_not_raised() {
        let bus = InMemoryCloudBus::new();
        bus.fail_puts("throttled");
        let publisher = DualSinkPublisher::new(Arc::new(InMemoryBroker::new("ex")), "shopping")
            .with_cloud_bus(Arc::new(bus), "bus");

        let result = publisher.publish_event(&order_created()).await.unwrap();

        assert!(result.broker.is_delivered());
        assert!(matches!(result.cloud, SinkOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn broker_failure_is_raised_with_cloud_outcome() {
        let broker = InMemoryBroker::new("ex");
        broker.fail_publishes("channel closed");
        let bus = InMemoryCloudBus::new();
        let publisher = DualSinkPublisher::new(Arc::new(broker), "shopping")
            .with_cloud_bus(Arc::new(bus.clone()), "bus");

        let err = publisher.publish_event(&order_created()).await.unwrap_err();

        let PublishError::Broker { result, .. } = err else {
            unreachable!("expected a broker error");
        };
        assert!(matches!(result.broker, SinkOutcome::Failed { .. }));
        assert_eq!(result.cloud, SinkOutcome::Delivered);
        assert_eq!(bus.entries().len(), 1);
    }

    #[tokio::test]
    async fn cloud_envelope_round_trips_to_an_equal_payload() {
        let bus = InMemoryCloudBus::new();
        let queue = InMemoryCloudQueue::new("q");
        bus.route_to(&queue);
        let publisher = DualSinkPublisher::new(Arc::new(InMemoryBroker::new("ex")), "shopping")
            .with_cloud_bus(Arc::new(bus.clone()), "bus");

        let event = order_created();
        publisher.publish_event(&event).await.unwrap();

        let entry = &bus.entries()[0];
        assert_eq!(entry.source, "shopping.service");
        assert_eq!(entry.detail_type, "OrderCreated");
        assert_eq!(entry.event_bus_name, "bus");

        let message = queue.receive(1, Duration::ZERO).await.unwrap().remove(0);
        let detail = unwrap_detail(&message.body).unwrap();
        let sent: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        let received: serde_json::Value = serde_json::from_slice(&detail).unwrap();
        assert_eq!(sent, received);
        assert_eq!(DomainEvent::decode(&detail).unwrap(), Decoded::Known(event));
    }
}
