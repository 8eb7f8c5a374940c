//! # Shopwire Services
//!
//! The three storefront services wired onto the Shopwire event layer. Each process runs
//! one of them, selected by `SERVICE_NAME`:
//!
//! ```text
//!   catalog ──ADD_TO_CART / ADD_TO_WISHLIST / ...──▶ customer, shopping
//!  customer ──CustomerCreated──────────────────────▶ shopping
//!  shopping ──OrderCreated─────────────────────────▶ catalog, customer
//! ```
//!
//! Every event is published to the broker and, when configured, the cloud bus, so a
//! consumer may see the same event twice. The catalog's stock reduction is guarded per
//! order id, and the customer service links each order once.
//!
//! - [`catalog`]: products and inventory
//! - [`customer`]: profiles, wishlists and order history
//! - [`shopping`]: carts and order placement
//! - [`bootstrap`]: transports, routers and consumer tasks for one process
//! - [`config`]: environment configuration

/// Catalog service
pub mod catalog;

/// Customer service
pub mod customer;

/// Shopping service
pub mod shopping;

/// Repository traits and in-memory stores
pub mod repository;

/// Service errors
pub mod error;

/// Environment configuration
pub mod config;

/// Process wiring
pub mod bootstrap;

pub use bootstrap::{Domain, Resources, Service};
pub use config::{ConfigError, ServiceConfig, ServiceKind};
pub use error::ServiceError;
