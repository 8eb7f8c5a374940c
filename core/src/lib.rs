//! # Shopwire Core
//!
//! Domain events and transport abstractions for the Shopwire event layer.
//!
//! Services communicate through asynchronous domain events published to two independent
//! transports, a durable broker and a cloud event bus. This crate holds everything the
//! transports, the runtime and the services agree on:
//!
//! - [`event`]: the [`DomainEvent`](event::DomainEvent) sum type and its wire format
//! - [`envelope`]: the cloud bus envelope and how to unwrap it
//! - [`transport`]: broker, cloud bus and cloud queue traits
//! - [`store`]: the marker store behind the idempotency guard
//! - [`dead_letter`]: where poison messages go
//!
//! Adapters live in their own crates (`shopwire-redpanda`, `shopwire-aws`,
//! `shopwire-redis`); in-memory versions for tests live in `shopwire-testing`.

pub mod dead_letter;
pub mod envelope;
pub mod event;
pub mod store;
pub mod transport;

pub use dead_letter::{DeadLetter, DeadLetterSink, Transport};
pub use envelope::{CloudEnvelope, EnvelopeError};
pub use event::{Decoded, DecodeError, DomainEvent, EventKind};
pub use store::{MarkerStore, StoreError};
pub use transport::{
    BrokerChannel, BrokerConnector, CloudBus, CloudQueue, Delivery, DeliveryStream, QueueMessage,
    TransportError,
};
