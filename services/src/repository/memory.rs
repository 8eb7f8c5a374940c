//! In-memory repositories.

use super::{
    Cart, CartRepository, CustomerProfile, CustomerRepository, InventoryChange, ProductRepository,
    STOCK_ATTRIBUTE, apply_cart_change, stock_of,
};
use crate::error::{Result, ServiceError};
use async_trait::async_trait;
use serde_json::Value;
use shopwire_core::event::{Order, OrderItem, Product};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| ServiceError::Repository("lock poisoned".to_string()))
}

/// Products keyed by id.
#[derive(Clone, Default)]
pub struct InMemoryProducts {
    products: Arc<Mutex<HashMap<String, Product>>>,
}

impl InMemoryProducts {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stock of a product, if it exists.
    #[must_use]
    pub fn stock(&self, id: &str) -> Option<i64> {
        self.products.lock().ok()?.get(id).map(stock_of)
    }
}

#[async_trait]
impl ProductRepository for InMemoryProducts {
    async fn find_by_id(&self, id: &str) -> Result<Option<Product>> {
        Ok(lock(&self.products)?.get(id).cloned())
    }

    async fn save(&self, product: Product) -> Result<Product> {
        lock(&self.products)?.insert(product.id.clone(), product.clone());
        Ok(product)
    }

    async fn adjust_inventory(&self, changes: &[InventoryChange]) -> Result<()> {
        let mut products = lock(&self.products)?;
        if let Some(missing) = changes.iter().find(|c| !products.contains_key(&c.product_id)) {
            return Err(ServiceError::product_not_found(&missing.product_id));
        }
        for change in changes {
            if let Some(product) = products.get_mut(&change.product_id) {
                let stock = stock_of(product) + change.delta;
                product.attributes.insert(STOCK_ATTRIBUTE.to_string(), Value::from(stock));
            }
        }
        Ok(())
    }
}

/// Customer profiles keyed by id.
#[derive(Clone, Default)]
pub struct InMemoryCustomers {
    profiles: Arc<Mutex<HashMap<String, CustomerProfile>>>,
}

impl InMemoryCustomers {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_profile<T>(&self, id: &str, f: impl FnOnce(&mut CustomerProfile) -> T) -> Result<T> {
        let mut profiles = lock(&self.profiles)?;
        let profile = profiles.get_mut(id).ok_or_else(|| ServiceError::customer_not_found(id))?;
        Ok(f(profile))
    }
}

#[async_trait]
impl CustomerRepository for InMemoryCustomers {
    async fn find_by_id(&self, id: &str) -> Result<Option<CustomerProfile>> {
        Ok(lock(&self.profiles)?.get(id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<CustomerProfile>> {
        Ok(lock(&self.profiles)?.values().find(|p| p.email == email).cloned())
    }

    async fn create(&self, profile: CustomerProfile) -> Result<CustomerProfile> {
        let mut profiles = lock(&self.profiles)?;
        if profiles.contains_key(&profile.id) || profiles.values().any(|p| p.email == profile.email) {
            return Err(ServiceError::AlreadyExists {
                entity: "customer",
                id: profile.email,
            });
        }
        profiles.insert(profile.id.clone(), profile.clone());
        Ok(profile)
    }

    async fn add_address(&self, customer_id: &str, address: Value) -> Result<Value> {
        self.with_profile(customer_id, |profile| {
            profile.addresses.push(address.clone());
            address
        })
    }

    async fn toggle_wishlist(&self, customer_id: &str, product: Product) -> Result<Vec<Product>> {
        self.with_profile(customer_id, |profile| {
            if let Some(index) = profile.wishlist.iter().position(|p| p.id == product.id) {
                profile.wishlist.remove(index);
            } else {
                profile.wishlist.push(product);
            }
            profile.wishlist.clone()
        })
    }

    async fn update_cart(&self, customer_id: &str, product: Product, qty: i64, remove: bool) -> Result<Vec<OrderItem>> {
        self.with_profile(customer_id, |profile| {
            apply_cart_change(&mut profile.cart, product, qty, remove);
            profile.cart.clone()
        })
    }

    async fn link_order(&self, customer_id: &str, order: Order) -> Result<bool> {
        self.with_profile(customer_id, |profile| {
            if profile.orders.iter().any(|o| o.id == order.id) {
                return false;
            }
            profile.orders.push(order);
            true
        })
    }

    async fn unlink_order(&self, customer_id: &str, order_id: &str) -> Result<()> {
        self.with_profile(customer_id, |profile| profile.orders.retain(|o| o.id != order_id))
    }
}

#[derive(Default)]
struct Shop {
    carts: HashMap<String, Vec<OrderItem>>,
    orders: HashMap<String, Vec<Order>>,
}

/// Carts and orders keyed by customer.
#[derive(Clone, Default)]
pub struct InMemoryCarts {
    shop: Arc<Mutex<Shop>>,
}

impl InMemoryCarts {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a cart exists for the customer.
    #[must_use]
    pub fn has_cart(&self, customer_id: &str) -> bool {
        self.shop.lock().is_ok_and(|shop| shop.carts.contains_key(customer_id))
    }
}

#[async_trait]
impl CartRepository for InMemoryCarts {
    async fn ensure_cart(&self, customer_id: &str) -> Result<Cart> {
        let mut shop = lock(&self.shop)?;
        let items = shop.carts.entry(customer_id.to_string()).or_default().clone();
        Ok(Cart {
            customer_id: customer_id.to_string(),
            items,
        })
    }

    async fn update_cart(&self, customer_id: &str, product: Product, qty: i64, remove: bool) -> Result<Cart> {
        let mut shop = lock(&self.shop)?;
        let items = shop.carts.entry(customer_id.to_string()).or_default();
        apply_cart_change(items, product, qty, remove);
        Ok(Cart {
            customer_id: customer_id.to_string(),
            items: items.clone(),
        })
    }

    async fn take_items(&self, customer_id: &str) -> Result<Vec<OrderItem>> {
        let mut shop = lock(&self.shop)?;
        Ok(shop.carts.get_mut(customer_id).map(std::mem::take).unwrap_or_default())
    }

    async fn restore_items(&self, customer_id: &str, items: Vec<OrderItem>) -> Result<()> {
        let mut shop = lock(&self.shop)?;
        let cart = shop.carts.entry(customer_id.to_string()).or_default();
        let newer = std::mem::take(cart);
        cart.extend(
            items
                .into_iter()
                .filter(|item| !newer.iter().any(|n| n.product.id == item.product.id)),
        );
        cart.extend(newer);
        Ok(())
    }

    async fn save_order(&self, customer_id: &str, order: Order) -> Result<Order> {
        lock(&self.shop)?
            .orders
            .entry(customer_id.to_string())
            .or_default()
            .push(order.clone());
        Ok(order)
    }

    async fn remove_order(&self, customer_id: &str, order_id: &str) -> Result<()> {
        if let Some(orders) = lock(&self.shop)?.orders.get_mut(customer_id) {
            orders.retain(|o| o.id != order_id);
        }
        Ok(())
    }

    async fn orders(&self, customer_id: &str) -> Result<Vec<Order>> {
        Ok(lock(&self.shop)?.orders.get(customer_id).cloned().unwrap_or_default())
    }
}
