//! Shopping service: carts and order placement.
//!
//! Keeps one cart per customer from `CustomerCreated` and the cart selection events on
//! queue `shopping_service`, and turns a cart into an order on request. Placing an order
//! publishes `OrderCreated`, which the catalog and customer services consume.

use crate::error::Result;
use crate::repository::{Cart, CartRepository};
use async_trait::async_trait;
use serde_json::{Map, Value};
use shopwire_core::event::{DomainEvent, EventKind, Order, OrderItem, OrderPlaced, Product};
use shopwire_runtime::{DualSinkPublisher, EventHandler, EventRouter, FailurePolicy, HandlerError};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Queue the shopping service consumes from.
pub const QUEUE: &str = "shopping_service";

/// Status of a freshly placed order.
pub const RECEIVED: &str = "received";

/// Cart and order operations.
pub struct Shopping {
    carts: Arc<dyn CartRepository>,
    publisher: Arc<DualSinkPublisher>,
}

impl Shopping {
    /// Create the service over a cart store.
    #[must_use]
    pub fn new(carts: Arc<dyn CartRepository>, publisher: Arc<DualSinkPublisher>) -> Self {
        Self { carts, publisher }
    }

    /// Apply a cart change for the customer.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Repository`](crate::error::ServiceError::Repository) if the
    /// store failed.
    pub async fn manage_cart(&self, customer_id: &str, product: Product, qty: i64, remove: bool) -> Result<Cart> {
        let cart = self.carts.update_cart(customer_id, product, qty, remove).await?;
        debug!(user_id = %customer_id, lines = cart.items.len(), "Cart updated");
        Ok(cart)
    }

    /// Turn the customer's cart into an order and publish `OrderCreated`.
    ///
    /// Returns `None` without publishing when the cart is empty.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Repository`](crate::error::ServiceError::Repository) if the
    /// store failed, or [`ServiceError::Publish`](crate::error::ServiceError::Publish) if
    /// the broker rejected the event. A rejected order is deleted and its lines go back
    /// into the cart, so the caller can retry.
    pub async fn place_order(&self, customer_id: &str, txn_number: &str) -> Result<Option<Order>> {
        let items = self.carts.take_items(customer_id).await?;
        if items.is_empty() {
            info!(user_id = %customer_id, "Cart is empty, no order placed");
            return Ok(None);
        }

        let order = match self
            .carts
            .save_order(customer_id, new_order(customer_id, txn_number, items.clone()))
            .await
        {
            Ok(order) => order,
            Err(e) => {
                self.carts.restore_items(customer_id, items).await?;
                return Err(e);
            }
        };

        let published = self
            .publisher
            .publish_event(&DomainEvent::OrderCreated(OrderPlaced {
                user_id: customer_id.to_string(),
                order: order.clone(),
            }))
            .await;
        if let Err(e) = published {
            warn!(user_id = %customer_id, order_id = %order.id, error = %e, "OrderCreated not published, restoring cart");
            self.carts.remove_order(customer_id, &order.id).await?;
            self.carts.restore_items(customer_id, order.items).await?;
            return Err(e.into());
        }
        info!(user_id = %customer_id, order_id = %order.id, "Order placed");
        Ok(Some(order))
    }

    /// Orders placed by the customer.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Repository`](crate::error::ServiceError::Repository) if the
    /// store failed.
    pub async fn orders(&self, customer_id: &str) -> Result<Vec<Order>> {
        self.carts.orders(customer_id).await
    }
}

fn new_order(customer_id: &str, txn_number: &str, items: Vec<OrderItem>) -> Order {
    let mut attributes = Map::new();
    attributes.insert("customerId".to_string(), Value::from(customer_id));
    attributes.insert("amount".to_string(), Value::from(order_amount(&items)));
    attributes.insert("status".to_string(), Value::from(RECEIVED));
    attributes.insert("txnNumber".to_string(), Value::from(txn_number));

    Order {
        id: Uuid::new_v4().to_string(),
        items,
        attributes,
    }
}

/// Sum of `price * unit` over the lines, saturating at the `i64` bounds.
///
/// Prices may be numbers or numeric strings and are truncated to whole units, so `12.5`
/// and `"12.5"` both count as 12. Anything else counts as zero.
#[must_use]
pub fn order_amount(items: &[OrderItem]) -> i64 {
    items
        .iter()
        .fold(0_i64, |total, item| total.saturating_add(price_of(&item.product).saturating_mul(item.unit)))
}

fn price_of(product: &Product) -> i64 {
    match product.attributes.get("price") {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(truncate)).unwrap_or(0),
        Some(Value::String(s)) => leading_integer(s),
        _ => 0,
    }
}

#[allow(clippy::cast_possible_truncation)] // `as` saturates out-of-range floats and maps NaN to 0
fn truncate(value: f64) -> i64 {
    value.trunc() as i64
}

/// Optional sign then digits at the start of `s`, ignoring leading whitespace.
fn leading_integer(s: &str) -> i64 {
    let s = s.trim_start();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let magnitude = digits
        .chars()
        .map_while(|c| c.to_digit(10))
        .fold(0_i64, |n, d| n.saturating_mul(10).saturating_add(i64::from(d)));
    if negative { -magnitude } else { magnitude }
}

struct ShoppingEvents(Arc<dyn CartRepository>);

#[async_trait]
impl EventHandler for ShoppingEvents {
    async fn handle(&self, event: DomainEvent) -> std::result::Result<(), HandlerError> {
        match event {
            DomainEvent::CustomerCreated(created) => {
                self.0.ensure_cart(&created.user_id).await?;
                info!(user_id = %created.user_id, "Cart created");
            }
            DomainEvent::AddToCart(selection) => {
                self.0
                    .update_cart(&selection.user_id, selection.product, selection.qty, false)
                    .await?;
            }
            DomainEvent::RemoveFromCart(selection) => {
                self.0
                    .update_cart(&selection.user_id, selection.product, selection.qty, true)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Event routes of the shopping service.
#[must_use]
pub fn router(carts: Arc<dyn CartRepository>) -> EventRouter {
    let handler: Arc<dyn EventHandler> = Arc::new(ShoppingEvents(carts));
    EventRouter::new("shopping")
        .route_shared(EventKind::CustomerCreated, FailurePolicy::Redeliver, Arc::clone(&handler))
        .route_shared(EventKind::AddToCart, FailurePolicy::Redeliver, Arc::clone(&handler))
        .route_shared(EventKind::RemoveFromCart, FailurePolicy::Redeliver, handler)
}
