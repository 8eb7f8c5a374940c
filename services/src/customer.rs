//! Customer service: profiles, wishlists and the order history.
//!
//! Consumes wishlist and cart selections and `OrderCreated` on queue `customer_service`:
//!
//! | event | effect | on failure |
//! |---|---|---|
//! | `ADD_TO_WISHLIST`, `REMOVE_FROM_WISHLIST` | toggle the product in the wishlist | swallow |
//! | `ADD_TO_CART`, `REMOVE_FROM_CART` | mirror the cart change | swallow |
//! | `OrderCreated` | link the order, publish `CustomerOrderLinked` | redeliver |
//!
//! Wishlist and cart mirroring is best effort, so those routes acknowledge even when the
//! profile is missing. Linking is idempotent per order id, and `CustomerOrderLinked` is
//! only published by the delivery that actually linked the order. A link whose event the
//! broker rejected is rolled back before the delivery is redelivered.

use crate::error::{Result, ServiceError};
use crate::repository::{CustomerProfile, CustomerRepository};
use async_trait::async_trait;
use serde_json::Value;
use shopwire_core::event::{AddressAdded, CustomerCreated, DomainEvent, EventKind, Order, OrderPlaced};
use shopwire_runtime::{DualSinkPublisher, EventHandler, EventRouter, FailurePolicy, HandlerError};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Queue the customer service consumes from.
pub const QUEUE: &str = "customer_service";

/// Sign-up request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCustomer {
    /// Id assigned by the caller
    pub id: String,
    /// Email, unique across customers
    pub email: String,
    /// Contact phone
    pub phone: String,
}

/// Customer operations, shared by the producer side and the event handler.
pub struct Customers {
    repository: Arc<dyn CustomerRepository>,
    publisher: Arc<DualSinkPublisher>,
}

impl Customers {
    /// Create the service over a profile store.
    #[must_use]
    pub fn new(repository: Arc<dyn CustomerRepository>, publisher: Arc<DualSinkPublisher>) -> Self {
        Self { repository, publisher }
    }

    /// Create a profile and publish `CustomerCreated`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::AlreadyExists`] if the email is taken, or
    /// [`ServiceError::Publish`] if the broker rejected the event.
    pub async fn sign_up(&self, customer: NewCustomer) -> Result<CustomerProfile> {
        if self.repository.find_by_email(&customer.email).await?.is_some() {
            return Err(ServiceError::AlreadyExists {
                entity: "customer",
                id: customer.email,
            });
        }

        let profile = self
            .repository
            .create(CustomerProfile {
                id: customer.id,
                email: customer.email,
                phone: customer.phone,
                ..CustomerProfile::default()
            })
            .await?;

        self.publisher
            .publish_event(&DomainEvent::CustomerCreated(CustomerCreated {
                user_id: profile.id.clone(),
                email: profile.email.clone(),
                phone: profile.phone.clone(),
            }))
            .await?;
        info!(user_id = %profile.id, "CustomerCreated event published");
        Ok(profile)
    }

    /// Add an address and publish `CustomerAddressAdded`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] for an unknown customer, or
    /// [`ServiceError::Publish`] if the broker rejected the event.
    pub async fn add_address(&self, user_id: &str, address: Value) -> Result<Value> {
        let address = self.repository.add_address(user_id, address).await?;
        self.publisher
            .publish_event(&DomainEvent::CustomerAddressAdded(AddressAdded {
                user_id: user_id.to_string(),
                address: address.clone(),
            }))
            .await?;
        info!(user_id = %user_id, "CustomerAddressAdded event published");
        Ok(address)
    }

    /// Link an order to a profile and publish `CustomerOrderLinked` the first time.
    ///
    /// Returns `false` when the order was already linked. If the broker rejects the
    /// event the link is undone, so a redelivery links and publishes again.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] for an unknown customer, or
    /// [`ServiceError::Publish`] if the broker rejected the event.
    pub async fn link_order(&self, user_id: &str, order: Order) -> Result<bool> {
        if !self.repository.link_order(user_id, order.clone()).await? {
            info!(user_id = %user_id, order_id = %order.id, "Order already linked, skipping");
            return Ok(false);
        }

        let order_id = order.id.clone();
        let published = self
            .publisher
            .publish_event(&DomainEvent::CustomerOrderLinked(OrderPlaced {
                user_id: user_id.to_string(),
                order,
            }))
            .await;
        if let Err(e) = published {
            warn!(user_id = %user_id, order_id = %order_id, error = %e, "CustomerOrderLinked not published, unlinking order");
            self.repository.unlink_order(user_id, &order_id).await?;
            return Err(e.into());
        }
        info!(user_id = %user_id, "CustomerOrderLinked event published");
        Ok(true)
    }

    /// Look up a profile.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] for an unknown customer.
    pub async fn profile(&self, user_id: &str) -> Result<CustomerProfile> {
        self.repository
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| ServiceError::customer_not_found(user_id))
    }
}

struct CustomerEvents(Arc<Customers>);

#[async_trait]
impl EventHandler for CustomerEvents {
    async fn handle(&self, event: DomainEvent) -> std::result::Result<(), HandlerError> {
        let repository = &self.0.repository;
        match event {
            DomainEvent::AddToWishlist(selection) | DomainEvent::RemoveFromWishlist(selection) => {
                let wishlist = repository.toggle_wishlist(&selection.user_id, selection.product).await?;
                debug!(user_id = %selection.user_id, size = wishlist.len(), "Wishlist updated");
            }
            DomainEvent::AddToCart(selection) => {
                repository
                    .update_cart(&selection.user_id, selection.product, selection.qty, false)
                    .await?;
            }
            DomainEvent::RemoveFromCart(selection) => {
                repository
                    .update_cart(&selection.user_id, selection.product, selection.qty, true)
                    .await?;
            }
            DomainEvent::OrderCreated(placed) => {
                self.0.link_order(&placed.user_id, placed.order).await?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Event routes of the customer service.
#[must_use]
pub fn router(customers: Arc<Customers>) -> EventRouter {
    let handler: Arc<dyn EventHandler> = Arc::new(CustomerEvents(customers));
    let swallowed = [
        EventKind::AddToWishlist,
        EventKind::RemoveFromWishlist,
        EventKind::AddToCart,
        EventKind::RemoveFromCart,
    ];

    swallowed
        .into_iter()
        .fold(EventRouter::new("customer"), |router, kind| {
            router.route_shared(kind, FailurePolicy::Swallow, Arc::clone(&handler))
        })
        .route_shared(EventKind::OrderCreated, FailurePolicy::Redeliver, handler)
}
