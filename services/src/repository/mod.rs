//! Repository traits the service handlers persist through.
//!
//! Handlers treat storage as a black box: every entity is reached through one of these
//! traits, and the in-memory implementations in [`memory`] back tests and the default
//! binary.

pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use shopwire_core::event::{Order, OrderItem, Product};

pub use memory::{InMemoryCarts, InMemoryCustomers, InMemoryProducts};

/// Product attribute holding the units in stock.
pub const STOCK_ATTRIBUTE: &str = "unit";

/// One stock adjustment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryChange {
    /// Product whose stock changes
    pub product_id: String,
    /// Signed change; negative to reduce stock
    pub delta: i64,
}

/// Catalog product storage.
#[async_trait]
pub trait ProductRepository: Send + Sync {
    /// Look up a product.
    async fn find_by_id(&self, id: &str) -> Result<Option<Product>>;

    /// Insert or replace a product.
    async fn save(&self, product: Product) -> Result<Product>;

    /// Apply every change, or none if any product is missing.
    async fn adjust_inventory(&self, changes: &[InventoryChange]) -> Result<()>;
}

/// A customer profile as the customer service keeps it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CustomerProfile {
    /// Customer id (`userId` in events)
    pub id: String,
    /// Sign-up email, unique
    pub email: String,
    /// Contact phone
    pub phone: String,
    /// Shipping addresses, opaque
    pub addresses: Vec<Value>,
    /// Wishlisted products
    pub wishlist: Vec<Product>,
    /// Cart mirror kept from cart events
    pub cart: Vec<OrderItem>,
    /// Orders linked to the profile
    pub orders: Vec<Order>,
}

/// Customer profile storage.
#[async_trait]
pub trait CustomerRepository: Send + Sync {
    /// Look up a profile by id.
    async fn find_by_id(&self, id: &str) -> Result<Option<CustomerProfile>>;

    /// Look up a profile by email.
    async fn find_by_email(&self, email: &str) -> Result<Option<CustomerProfile>>;

    /// Insert a new profile; fails if the id or email is taken.
    async fn create(&self, profile: CustomerProfile) -> Result<CustomerProfile>;

    /// Append an address.
    async fn add_address(&self, customer_id: &str, address: Value) -> Result<Value>;

    /// Add the product to the wishlist, or remove it if already present.
    async fn toggle_wishlist(&self, customer_id: &str, product: Product) -> Result<Vec<Product>>;

    /// Apply a cart change; see [`apply_cart_change`].
    async fn update_cart(&self, customer_id: &str, product: Product, qty: i64, remove: bool) -> Result<Vec<OrderItem>>;

    /// Link an order to the profile. Returns `false` if it was already linked.
    async fn link_order(&self, customer_id: &str, order: Order) -> Result<bool>;

    /// Remove a linked order; unknown orders are ignored.
    async fn unlink_order(&self, customer_id: &str, order_id: &str) -> Result<()>;
}

/// A shopping cart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cart {
    /// Owner
    pub customer_id: String,
    /// Lines in the cart
    pub items: Vec<OrderItem>,
}

/// Cart and order storage for the shopping service.
#[async_trait]
pub trait CartRepository: Send + Sync {
    /// Return the customer's cart, creating an empty one if needed.
    async fn ensure_cart(&self, customer_id: &str) -> Result<Cart>;

    /// Apply a cart change, creating the cart if needed.
    async fn update_cart(&self, customer_id: &str, product: Product, qty: i64, remove: bool) -> Result<Cart>;

    /// Remove and return every line of the cart.
    async fn take_items(&self, customer_id: &str) -> Result<Vec<OrderItem>>;

    /// Put taken lines back into the cart. Lines added since for the same product win.
    async fn restore_items(&self, customer_id: &str, items: Vec<OrderItem>) -> Result<()>;

    /// Store a placed order.
    async fn save_order(&self, customer_id: &str, order: Order) -> Result<Order>;

    /// Delete a stored order; unknown orders are ignored.
    async fn remove_order(&self, customer_id: &str, order_id: &str) -> Result<()>;

    /// Orders placed by the customer, oldest first.
    async fn orders(&self, customer_id: &str) -> Result<Vec<Order>>;
}

/// Change a cart line.
///
/// An existing line for the product is removed (`remove`) or has its quantity set to
/// `qty`. A missing line is appended unless removing.
pub fn apply_cart_change(items: &mut Vec<OrderItem>, product: Product, qty: i64, remove: bool) {
    match items.iter().position(|item| item.product.id == product.id) {
        Some(index) if remove => {
            items.remove(index);
        }
        Some(index) => items[index].unit = qty,
        None if remove => {}
        None => items.push(OrderItem { product, unit: qty }),
    }
}

/// Units in stock recorded on a product; absent or non-numeric counts as zero.
#[must_use]
pub fn stock_of(product: &Product) -> i64 {
    product.attributes.get(STOCK_ATTRIBUTE).and_then(Value::as_i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(pairs: &[(&str, i64)]) -> Vec<OrderItem> {
        pairs
            .iter()
            .map(|(id, unit)| OrderItem {
                product: Product::new(*id),
                unit: *unit,
            })
            .collect()
    }

    #[test]
    fn adding_a_new_product_appends_a_line() {
        let mut cart = items(&[("p1", 1)]);
        apply_cart_change(&mut cart, Product::new("p2"), 3, false);
        assert_eq!(cart, items(&[("p1", 1), ("p2", 3)]));
    }

    #[test]
    fn adding_an_existing_product_sets_its_quantity() {
        let mut cart = items(&[("p1", 1)]);
        apply_cart_change(&mut cart, Product::new("p1"), 4, false);
        assert_eq!(cart, items(&[("p1", 4)]));
    }

    #[test]
    fn removing_drops_the_line_or_does_nothing() {
        let mut cart = items(&[("p1", 1), ("p2", 2)]);
        apply_cart_change(&mut cart, Product::new("p1"), 0, true);
        apply_cart_change(&mut cart, Product::new("p9"), 0, true);
        assert_eq!(cart, items(&[("p2", 2)]));
    }

    #[test]
    fn stock_reads_the_unit_attribute() {
        let mut product = Product::new("p1");
        assert_eq!(stock_of(&product), 0);
        product.attributes.insert(STOCK_ATTRIBUTE.to_string(), Value::from(12));
        assert_eq!(stock_of(&product), 12);
    }
}
