//! # Shopwire Testing
//!
//! In-memory transports and stores for testing the Shopwire event layer.
//!
//! This crate provides:
//! - [`InMemoryBroker`] and [`InMemoryConnector`]: direct-exchange routing, manual acks,
//!   redelivery of unacked messages on rebind, injectable connect and publish failures
//! - [`InMemoryCloudBus`] and [`InMemoryCloudQueue`]: bus-to-queue forwarding,
//!   long-polling, visibility timeouts and receive counts
//! - [`InMemoryMarkerStore`]: atomic set-if-absent with expiry
//! - [`InMemoryDeadLetters`]: captured dead letters
//!
//! All timing uses tokio's clock, so tests can run with `start_paused = true`.
//!
//! ## Example
//!
//! ```
//! use shopwire_core::transport::BrokerConnector;
//! use shopwire_testing::{InMemoryBroker, InMemoryConnector};
//!
//! # async fn example() {
//! let broker = InMemoryBroker::new("shopping");
//! let connector = InMemoryConnector::new(broker.clone()).failing_first(2);
//!
//! assert!(connector.connect("amqp://localhost", "shopping").await.is_err());
//! assert!(connector.connect("amqp://localhost", "shopping").await.is_err());
//! assert!(connector.connect("amqp://localhost", "shopping").await.is_ok());
//! assert_eq!(connector.attempts(), 3);
//! # }
//! ```

pub mod broker;
pub mod cloud;
pub mod store;

pub use broker::{InMemoryBroker, InMemoryConnector};
pub use cloud::{InMemoryCloudBus, InMemoryCloudQueue, rule_target_body};
pub use store::{InMemoryDeadLetters, InMemoryMarkerStore};

/// Install a test subscriber that writes to the test harness output.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("shopwire=debug")),
        )
        .with_test_writer()
        .try_init();
}
