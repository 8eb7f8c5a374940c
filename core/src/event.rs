//! Domain events exchanged between services.
//!
//! A domain event is a fact notification with the wire shape `{"event": <tag>, "data": {...}}`.
//! The vocabulary is closed per producer, so the event is modelled as a sum type keyed by
//! its tag, with one concrete payload per tag. Payloads are decoded once at the router
//! boundary and handlers only ever see typed data.
//!
//! # Unknown events
//!
//! The same exchange may carry events meant for other services. Decoding an envelope whose
//! tag is not part of the vocabulary is not an error: [`DomainEvent::decode`] returns
//! [`Decoded::Unknown`] and the caller ignores it.
//!
//! # Example
//!
//! ```
//! use shopwire_core::event::{Decoded, DomainEvent, EventKind};
//!
//! let raw = br#"{"event":"ADD_TO_CART","data":{"userId":"u1","product":{"_id":"p1"},"qty":2}}"#;
//! let Decoded::Known(event) = DomainEvent::decode(raw).unwrap() else { panic!() };
//! assert_eq!(event.kind(), EventKind::AddToCart);
//! assert_eq!(event.user_id(), "u1");
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Errors raised while decoding a domain event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload is not a `{event, data}` JSON object.
    #[error("Malformed event payload: {0}")]
    Malformed(String),

    /// The tag is known but `data` does not match its shape.
    #[error("Invalid data for event '{event}': {reason}")]
    InvalidData {
        /// Event tag as received
        event: String,
        /// Deserializer message
        reason: String,
    },
}

/// The closed event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// A customer signed up.
    CustomerCreated,
    /// A customer added a shipping address.
    CustomerAddressAdded,
    /// The customer service linked an order to a profile.
    CustomerOrderLinked,
    /// The shopping service placed an order.
    OrderCreated,
    /// A product was added to a wishlist.
    AddToWishlist,
    /// A product was removed from a wishlist.
    RemoveFromWishlist,
    /// A product was added to a cart.
    AddToCart,
    /// A product was removed from a cart.
    RemoveFromCart,
    /// The catalog created a product.
    ProductCreated,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 9] = [
        Self::CustomerCreated,
        Self::CustomerAddressAdded,
        Self::CustomerOrderLinked,
        Self::OrderCreated,
        Self::AddToWishlist,
        Self::RemoveFromWishlist,
        Self::AddToCart,
        Self::RemoveFromCart,
        Self::ProductCreated,
    ];

    /// Wire tag, also used as the broker routing key.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CustomerCreated => "CustomerCreated",
            Self::CustomerAddressAdded => "CustomerAddressAdded",
            Self::CustomerOrderLinked => "CustomerOrderLinked",
            Self::OrderCreated => "OrderCreated",
            Self::AddToWishlist => "ADD_TO_WISHLIST",
            Self::RemoveFromWishlist => "REMOVE_FROM_WISHLIST",
            Self::AddToCart => "ADD_TO_CART",
            Self::RemoveFromCart => "REMOVE_FROM_CART",
            Self::ProductCreated => "ProductCreated",
        }
    }

    /// Look up a wire tag. `CREATE_ORDER` is accepted as a legacy spelling of `OrderCreated`.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        if tag == "CREATE_ORDER" {
            return Some(Self::OrderCreated);
        }
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A product reference as carried inside events.
///
/// Only `_id` is interpreted; every other attribute of the product record is kept
/// verbatim so relaying an event does not drop fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Product identifier
    #[serde(rename = "_id")]
    pub id: String,
    /// Remaining product attributes (name, price, stock, ...)
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Product {
    /// Create a product reference with no extra attributes.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Map::new(),
        }
    }
}

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    /// Ordered product
    pub product: Product,
    /// Units ordered
    pub unit: i64,
}

/// An order as carried inside events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Order identifier; stable across redeliveries
    #[serde(rename = "_id", alias = "orderId")]
    pub id: String,
    /// Order lines
    #[serde(default)]
    pub items: Vec<OrderItem>,
    /// Remaining order attributes (amount, status, txnId, ...)
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// Payload of `CustomerCreated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerCreated {
    /// New customer id
    pub user_id: String,
    /// Sign-up email
    pub email: String,
    /// Sign-up phone number
    #[serde(default)]
    pub phone: String,
}

/// Payload of `CustomerAddressAdded`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressAdded {
    /// Owning customer
    pub user_id: String,
    /// Address record as stored by the customer service
    pub address: Value,
}

/// Payload of `OrderCreated` and `CustomerOrderLinked`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPlaced {
    /// Owning customer
    pub user_id: String,
    /// The order
    pub order: Order,
}

/// Payload of the wishlist and cart events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSelection {
    /// Owning customer
    pub user_id: String,
    /// Selected product (full record looked up by the catalog)
    pub product: Product,
    /// Quantity
    #[serde(default)]
    pub qty: i64,
}

/// A domain event: one variant per tag of the vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum DomainEvent {
    /// `CustomerCreated`
    CustomerCreated(CustomerCreated),
    /// `CustomerAddressAdded`
    CustomerAddressAdded(AddressAdded),
    /// `CustomerOrderLinked`
    CustomerOrderLinked(OrderPlaced),
    /// `OrderCreated`
    #[serde(alias = "CREATE_ORDER")]
    OrderCreated(OrderPlaced),
    /// `ADD_TO_WISHLIST`
    #[serde(rename = "ADD_TO_WISHLIST")]
    AddToWishlist(ProductSelection),
    /// `REMOVE_FROM_WISHLIST`
    #[serde(rename = "REMOVE_FROM_WISHLIST")]
    RemoveFromWishlist(ProductSelection),
    /// `ADD_TO_CART`
    #[serde(rename = "ADD_TO_CART")]
    AddToCart(ProductSelection),
    /// `REMOVE_FROM_CART`
    #[serde(rename = "REMOVE_FROM_CART")]
    RemoveFromCart(ProductSelection),
    /// `ProductCreated`; `data` is the full product record
    ProductCreated(Product),
}

/// Result of decoding a raw payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A tag from the vocabulary with well-formed data.
    Known(DomainEvent),
    /// A well-formed envelope whose tag is not part of the vocabulary.
    Unknown(String),
}

#[derive(Deserialize)]
struct RawEvent {
    event: String,
    data: Value,
}

fn data<T: DeserializeOwned>(event: &str, data: Value) -> Result<T, DecodeError> {
    serde_json::from_value(data).map_err(|e| DecodeError::InvalidData {
        event: event.to_string(),
        reason: e.to_string(),
    })
}

impl DomainEvent {
    /// Decode a raw `{event, data}` payload.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Malformed`] if the payload is not a JSON object with both
    /// `event` and `data`, and [`DecodeError::InvalidData`] if a known tag carries data
    /// of the wrong shape. Unknown tags are not errors.
    pub fn decode(raw: &[u8]) -> Result<Decoded, DecodeError> {
        let raw: RawEvent =
            serde_json::from_slice(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let Some(kind) = EventKind::parse(&raw.event) else {
            return Ok(Decoded::Unknown(raw.event));
        };

        let tag = raw.event.as_str();
        let event = match kind {
            EventKind::CustomerCreated => Self::CustomerCreated(data(tag, raw.data)?),
            EventKind::CustomerAddressAdded => Self::CustomerAddressAdded(data(tag, raw.data)?),
            EventKind::CustomerOrderLinked => Self::CustomerOrderLinked(data(tag, raw.data)?),
            EventKind::OrderCreated => Self::OrderCreated(data(tag, raw.data)?),
            EventKind::AddToWishlist => Self::AddToWishlist(data(tag, raw.data)?),
            EventKind::RemoveFromWishlist => Self::RemoveFromWishlist(data(tag, raw.data)?),
            EventKind::AddToCart => Self::AddToCart(data(tag, raw.data)?),
            EventKind::RemoveFromCart => Self::RemoveFromCart(data(tag, raw.data)?),
            EventKind::ProductCreated => Self::ProductCreated(data(tag, raw.data)?),
        };
        Ok(Decoded::Known(event))
    }

    /// Kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::CustomerCreated(_) => EventKind::CustomerCreated,
            Self::CustomerAddressAdded(_) => EventKind::CustomerAddressAdded,
            Self::CustomerOrderLinked(_) => EventKind::CustomerOrderLinked,
            Self::OrderCreated(_) => EventKind::OrderCreated,
            Self::AddToWishlist(_) => EventKind::AddToWishlist,
            Self::RemoveFromWishlist(_) => EventKind::RemoveFromWishlist,
            Self::AddToCart(_) => EventKind::AddToCart,
            Self::RemoveFromCart(_) => EventKind::RemoveFromCart,
            Self::ProductCreated(_) => EventKind::ProductCreated,
        }
    }

    /// Wire tag of this event.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Customer the event belongs to. `ProductCreated` has no owner and yields `""`.
    #[must_use]
    pub fn user_id(&self) -> &str {
        match self {
            Self::CustomerCreated(e) => &e.user_id,
            Self::CustomerAddressAdded(e) => &e.user_id,
            Self::CustomerOrderLinked(e) | Self::OrderCreated(e) => &e.user_id,
            Self::AddToWishlist(e)
            | Self::RemoveFromWishlist(e)
            | Self::AddToCart(e)
            | Self::RemoveFromCart(e) => &e.user_id,
            Self::ProductCreated(_) => "",
        }
    }

    /// Serialize to the `{event, data}` wire form.
    ///
    /// # Errors
    ///
    /// Returns the serializer error; only possible for non-string map keys inside
    /// opaque attributes, which JSON input cannot produce.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Build a product selection event of the given kind.
    ///
    /// Returns `None` when `kind` is not one of the wishlist or cart kinds.
    #[must_use]
    pub fn product_selection(kind: EventKind, selection: ProductSelection) -> Option<Self> {
        match kind {
            EventKind::AddToWishlist => Some(Self::AddToWishlist(selection)),
            EventKind::RemoveFromWishlist => Some(Self::RemoveFromWishlist(selection)),
            EventKind::AddToCart => Some(Self::AddToCart(selection)),
            EventKind::RemoveFromCart => Some(Self::RemoveFromCart(selection)),
            _ => None,
        }
    }
}
