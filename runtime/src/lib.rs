//! # Shopwire Runtime
//!
//! Event distribution and idempotent consumption on top of the `shopwire-core`
//! transport traits.
//!
//! ## Core Components
//!
//! - **[`ConnectionManager`](connection::ConnectionManager)**: opens the shared broker
//!   channel with bounded retry
//! - **[`DualSinkPublisher`](publisher::DualSinkPublisher)**: writes each event to the
//!   broker and the cloud bus independently
//! - **[`EventRouter`](router::EventRouter)**: decodes payloads and dispatches them to
//!   per-kind handlers with a failure policy
//! - **[`IdempotencyGuard`](idempotency::IdempotencyGuard)**: runs non-idempotent effects
//!   once per logical event
//! - **[`PushConsumer`](push::PushConsumer)** and **[`PullConsumer`](pull::PullConsumer)**:
//!   the two delivery loops, supervised by [`supervise`](supervisor::supervise)
//!
//! ## Example
//!
//! ```ignore
//! let channel = ConnectionManager::new(connector).connect(&url, "shopping").await?;
//! let publisher = DualSinkPublisher::new(Arc::clone(&channel), "shopping")
//!     .with_cloud_bus(bus, "shopping-bus");
//!
//! let router = Arc::new(
//!     EventRouter::new("shopping").route(EventKind::CustomerCreated, FailurePolicy::Redeliver, handler),
//! );
//! let push = PushConsumer::new(channel, "shopping_service", router, shutdown_rx).spawn();
//! ```

/// Bounded retry with backoff
pub mod retry;

/// Broker connection with bounded retry
pub mod connection;

/// Dual-sink publisher
pub mod publisher;

/// Event routing and handler contracts
pub mod router;

/// At-most-once effects per logical event
pub mod idempotency;

/// Broker push consumer
pub mod push;

/// Cloud queue long-poll consumer
pub mod pull;

/// Supervised tasks and shutdown
pub mod supervisor;

/// Prometheus metrics for observability
pub mod metrics;

pub use connection::{ConnectionError, ConnectionManager};
pub use idempotency::{DedupKey, GuardOutcome, IdempotencyGuard};
pub use publisher::{DualSinkPublisher, PublishError, PublishResult, SinkOutcome};
pub use pull::PullConsumer;
pub use push::{BrokerDeadLetters, PushConsumer};
pub use retry::RetryPolicy;
pub use router::{
    DispatchOutcome, Disposition, EventHandler, EventRouter, FailurePolicy, HandlerError, handler_fn,
};
pub use supervisor::{shutdown_within, supervise};
