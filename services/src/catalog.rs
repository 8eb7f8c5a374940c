//! Catalog service: products and inventory.
//!
//! Consumes `OrderCreated` on queue `products_service` and reduces stock for every order
//! line. The same order can arrive on both transports and more than once on each, so the
//! reduction runs through the [`IdempotencyGuard`] under `processed_order:<orderId>`.
//!
//! Produces `ProductCreated` and the wishlist/cart selection events, which carry the full
//! product record looked up at publish time.

use crate::error::{Result, ServiceError};
use crate::repository::{InventoryChange, ProductRepository};
use async_trait::async_trait;
use shopwire_core::event::{DomainEvent, EventKind, Product, ProductSelection};
use shopwire_runtime::{
    DedupKey, DualSinkPublisher, EventHandler, EventRouter, FailurePolicy, GuardOutcome, HandlerError,
    IdempotencyGuard,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Queue the catalog consumes from.
pub const QUEUE: &str = "products_service";

/// Producer-side catalog operations.
pub struct Catalog {
    products: Arc<dyn ProductRepository>,
    publisher: Arc<DualSinkPublisher>,
}

impl Catalog {
    /// Create the service over a product store.
    #[must_use]
    pub fn new(products: Arc<dyn ProductRepository>, publisher: Arc<DualSinkPublisher>) -> Self {
        Self { products, publisher }
    }

    /// Store a product and announce it with `ProductCreated`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Repository`] if the product cannot be stored, or
    /// [`ServiceError::Publish`] if the broker rejected the event.
    pub async fn create_product(&self, product: Product) -> Result<Product> {
        let product = self.products.save(product).await?;
        self.publisher
            .publish_event(&DomainEvent::ProductCreated(product.clone()))
            .await?;
        info!(product_id = %product.id, "Product created");
        Ok(product)
    }

    /// Look up a product.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] if the product does not exist.
    pub async fn product(&self, product_id: &str) -> Result<Product> {
        self.products
            .find_by_id(product_id)
            .await?
            .ok_or_else(|| ServiceError::product_not_found(product_id))
    }

    /// Publish a wishlist or cart selection carrying the stored product record.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotASelection`] for other kinds,
    /// [`ServiceError::NotFound`] if the product does not exist (nothing is published),
    /// or [`ServiceError::Publish`] if the broker rejected the event.
    pub async fn publish_selection(
        &self,
        kind: EventKind,
        user_id: &str,
        product_id: &str,
        qty: i64,
    ) -> Result<DomainEvent> {
        let product = self
            .products
            .find_by_id(product_id)
            .await?
            .ok_or_else(|| ServiceError::product_not_found(product_id))?;

        let selection = ProductSelection {
            user_id: user_id.to_string(),
            product,
            qty,
        };
        let event = DomainEvent::product_selection(kind, selection).ok_or(ServiceError::NotASelection(kind))?;
        self.publisher.publish_event(&event).await?;
        Ok(event)
    }
}

/// Reduces stock once per order.
pub struct InventoryHandler {
    products: Arc<dyn ProductRepository>,
    guard: IdempotencyGuard,
}

impl InventoryHandler {
    /// Create a handler reducing stock in `products`.
    #[must_use]
    pub fn new(products: Arc<dyn ProductRepository>, guard: IdempotencyGuard) -> Self {
        Self { products, guard }
    }
}

#[async_trait]
impl EventHandler for InventoryHandler {
    async fn handle(&self, event: DomainEvent) -> std::result::Result<(), HandlerError> {
        let DomainEvent::OrderCreated(placed) = event else {
            return Ok(());
        };
        let order = placed.order;
        let changes: Vec<InventoryChange> = order
            .items
            .iter()
            .map(|item| InventoryChange {
                product_id: item.product.id.clone(),
                delta: -item.unit,
            })
            .collect();

        let key = DedupKey::processed_order(&order.id);
        let outcome = self
            .guard
            .run_once(&key, || async {
                self.products.adjust_inventory(&changes).await.map_err(HandlerError::from)
            })
            .await?;

        match outcome {
            GuardOutcome::Applied(()) => {
                for change in &changes {
                    debug!(product_id = %change.product_id, by = -change.delta, "Inventory reduced");
                }
                info!(order_id = %order.id, lines = changes.len(), "Inventory reduced for order");
            }
            GuardOutcome::Duplicate => info!(order_id = %order.id, "Order already processed by catalog, skipping"),
        }
        Ok(())
    }
}

/// Event routes of the catalog service.
#[must_use]
pub fn router(products: Arc<dyn ProductRepository>, guard: IdempotencyGuard) -> EventRouter {
    EventRouter::new("catalog").route(
        EventKind::OrderCreated,
        FailurePolicy::Redeliver,
        InventoryHandler::new(products, guard),
    )
}
