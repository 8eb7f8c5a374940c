//! Transport abstractions for both delivery paths.
//!
//! Events leave a service through two independent sinks and arrive through two independent
//! sources:
//!
//! ```text
//!                    ┌──────────────────┐
//!                    │  Dual-sink       │
//!                    │  publisher       │
//!                    └───┬──────────┬───┘
//!                        │          │
//!           routing key  ▼          ▼  PutEvents
//!                ┌────────────┐  ┌────────────┐
//!                │   Broker   │  │ Cloud bus  │
//!                │ (exchange) │  └─────┬──────┘
//!                └─────┬──────┘        │ rule
//!                      │ push          ▼
//!                      │         ┌────────────┐
//!                      │         │Cloud queue │
//!                      │         └─────┬──────┘
//!                      ▼               ▼ long-poll
//!                ┌────────────┐  ┌────────────┐
//!                │   Push     │  │   Pull     │
//!                │  consumer  │  │  consumer  │
//!                └────────────┘  └────────────┘
//! ```
//!
//! # Delivery semantics
//!
//! - **At-least-once** on both paths; the same event may arrive on both, in any order
//! - **Manual acknowledgement**: a broker delivery is acked with [`Delivery::ack`], a queue
//!   message is acked by [`CloudQueue::delete`]; anything not acked is redelivered
//! - **Thread safety**: every trait here is `Send + Sync` so one handle can be shared
//!   between the publisher and the consumers of a process
//!
//! # Dyn compatibility
//!
//! Methods return [`BoxFuture`] instead of using `async fn` so the traits can be used as
//! `Arc<dyn BrokerChannel>` and friends.

use crate::envelope::CloudEnvelope;
use futures::Stream;
use futures::future::BoxFuture;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur on either transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not reach the broker or the channel is unusable
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Publishing to a destination failed
    #[error("Publish failed for '{destination}': {reason}")]
    PublishFailed {
        /// Routing key or bus name
        destination: String,
        /// The reason for failure
        reason: String,
    },

    /// Declaring or binding a queue failed
    #[error("Binding queue '{queue}' failed: {reason}")]
    BindFailed {
        /// The queue being bound
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// A receive call failed
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Deleting a queue message failed
    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    /// Acknowledging a broker delivery failed
    #[error("Acknowledge failed: {0}")]
    AckFailed(String),
}

/// Acknowledges one broker delivery.
///
/// Implemented by each broker adapter: committing an offset, sending a basic ack, or
/// recording the ack in memory for tests.
pub trait Acknowledger: Send + Sync {
    /// Acknowledge the delivery, removing it from the queue.
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>>;
}

/// One message pushed by the broker.
pub struct Delivery {
    routing_key: String,
    payload: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Create a delivery.
    #[must_use]
    pub fn new(routing_key: impl Into<String>, payload: Vec<u8>, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload,
            acker,
        }
    }

    /// Routing key the message was published with.
    #[must_use]
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Raw message body.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AckFailed`] if the broker rejected the acknowledgement;
    /// the message will then be redelivered.
    pub async fn ack(self) -> Result<(), TransportError> {
        self.acker.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries for one bound queue.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, TransportError>> + Send>>;

/// An open broker channel.
///
/// Produced once per process by a [`BrokerConnector`] and shared by the publisher and the
/// push consumer.
pub trait BrokerChannel: Send + Sync {
    /// The exchange this channel publishes to.
    fn exchange(&self) -> &str;

    /// Publish a payload to the exchange under a routing key.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PublishFailed`] or [`TransportError::ConnectionFailed`].
    fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
    ) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Declare a durable queue, bind it once per routing key, and start consuming.
    ///
    /// Binding is idempotent: asserting an existing queue or binding succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] if the queue cannot be declared or bound.
    fn bind(
        &self,
        queue: &str,
        routing_keys: &[String],
    ) -> BoxFuture<'_, Result<DeliveryStream, TransportError>>;
}

/// Opens broker channels.
pub trait BrokerConnector: Send + Sync {
    /// Make one connection attempt and assert the named exchange.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if the broker is unreachable.
    fn connect(
        &self,
        url: &str,
        exchange: &str,
    ) -> BoxFuture<'_, Result<Arc<dyn BrokerChannel>, TransportError>>;
}

/// A cloud event bus that accepts envelopes.
pub trait CloudBus: Send + Sync {
    /// Submit one entry.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PublishFailed`] if the bus rejected the entry.
    fn put_event(&self, envelope: &CloudEnvelope) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// One message received from a cloud queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Queue-assigned message id
    pub message_id: String,
    /// Handle required to delete this receipt of the message
    pub receipt_handle: String,
    /// Raw body (the bus envelope)
    pub body: String,
    /// How many times the message has been received, including this one
    pub receive_count: u32,
}

/// A cloud queue consumed by long-polling.
pub trait CloudQueue: Send + Sync {
    /// Queue address, for logging.
    fn queue_url(&self) -> &str;

    /// Receive up to `max_messages`, waiting up to `wait` for at least one to arrive.
    ///
    /// Received messages stay invisible to other receivers for the queue's visibility
    /// timeout and reappear unless deleted.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ReceiveFailed`] on network or service errors.
    fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> BoxFuture<'_, Result<Vec<QueueMessage>, TransportError>>;

    /// Delete a received message so it is never redelivered.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::DeleteFailed`] on network or service errors.
    fn delete(&self, receipt_handle: &str) -> BoxFuture<'_, Result<(), TransportError>>;
}
