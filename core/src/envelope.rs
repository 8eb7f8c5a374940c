//! Cloud event bus envelope.
//!
//! On the cloud transport a domain event travels wrapped twice:
//!
//! ```text
//! publisher ──PutEvents{Source, DetailType, Detail, EventBusName}──▶ event bus
//! event bus ──rule target──▶ queue message body:
//!     {"version":"0","id":"…","detail-type":"OrderCreated","source":"shopping.service",
//!      "detail":{"event":"OrderCreated","data":{…}}, …}
//! ```
//!
//! [`CloudEnvelope`] is the outbound entry; [`unwrap_detail`] recovers the inner
//! `{event, data}` payload from a received message body.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while unwrapping a received envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The message body is not JSON.
    #[error("Message body is not valid JSON: {0}")]
    InvalidBody(String),

    /// The body has no `detail` field.
    #[error("Envelope has no detail")]
    MissingDetail,
}

/// Format the `Source` attribute for a producing service (`"catalog"` → `"catalog.service"`).
#[must_use]
pub fn service_source(service: &str) -> String {
    format!("{service}.service")
}

/// An outbound cloud bus entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CloudEnvelope {
    /// Producing service, e.g. `customer.service`
    pub source: String,
    /// Event type; the bus rules match on it
    pub detail_type: String,
    /// JSON-serialized domain event
    pub detail: String,
    /// Target event bus
    pub event_bus_name: String,
}

impl CloudEnvelope {
    /// Wrap a serialized event.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        detail_type: impl Into<String>,
        detail: impl Into<String>,
        event_bus_name: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            detail_type: detail_type.into(),
            detail: detail.into(),
            event_bus_name: event_bus_name.into(),
        }
    }
}

/// The envelope as delivered to a queue subscribed to the bus.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceivedEnvelope {
    /// Producing service, when present
    #[serde(default)]
    pub source: Option<String>,
    /// Event type, when present
    #[serde(rename = "detail-type", alias = "DetailType", default)]
    pub detail_type: Option<String>,
    /// Inner payload: an object, or a JSON string holding it
    #[serde(alias = "Detail", default)]
    pub detail: Value,
}

impl ReceivedEnvelope {
    /// Parse a queue message body.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::InvalidBody`] if the body is not a JSON object.
    pub fn parse(body: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(body).map_err(|e| EnvelopeError::InvalidBody(e.to_string()))
    }

    /// The inner domain event payload as JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::MissingDetail`] if `detail` is absent or null.
    pub fn into_detail(self) -> Result<Vec<u8>, EnvelopeError> {
        match self.detail {
            Value::Null => Err(EnvelopeError::MissingDetail),
            Value::String(inner) => Ok(inner.into_bytes()),
            other => Ok(other.to_string().into_bytes()),
        }
    }
}

/// Extract the inner domain event payload from a queue message body.
///
/// # Errors
///
/// See [`ReceivedEnvelope::parse`] and [`ReceivedEnvelope::into_detail`].
pub fn unwrap_detail(body: &str) -> Result<Vec<u8>, EnvelopeError> {
    ReceivedEnvelope::parse(body)?.into_detail()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unwraps_object_detail() {
        let body = json!({
            "version": "0",
            "detail-type": "OrderCreated",
            "source": "shopping.service",
            "detail": { "event": "OrderCreated", "data": { "userId": "u1" } }
        })
        .to_string();

        let detail: Value = serde_json::from_slice(&unwrap_detail(&body).unwrap()).unwrap();
        assert_eq!(detail, json!({ "event": "OrderCreated", "data": { "userId": "u1" } }));
    }

    #[test]
    fn unwraps_string_detail() {
        let inner = r#"{"event":"ADD_TO_CART","data":{}}"#;
        let body = json!({ "DetailType": "ADD_TO_CART", "Detail": inner }).to_string();

        let envelope = ReceivedEnvelope::parse(&body).unwrap();
        assert_eq!(envelope.detail_type.as_deref(), Some("ADD_TO_CART"));
        assert_eq!(envelope.into_detail().unwrap(), inner.as_bytes());
    }

    #[test]
    fn missing_detail_is_an_error() {
        assert_eq!(
            unwrap_detail(r#"{"source":"x.service"}"#),
            Err(EnvelopeError::MissingDetail)
        );
    }

    #[test]
    fn non_json_body_is_an_error() {
        assert!(matches!(unwrap_detail("not json"), Err(EnvelopeError::InvalidBody(_))));
    }

    #[test]
    fn outbound_envelope_uses_pascal_case() {
        let envelope = CloudEnvelope::new(service_source("customer"), "CustomerCreated", "{}", "bus");
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "Source": "customer.service",
                "DetailType": "CustomerCreated",
                "Detail": "{}",
                "EventBusName": "bus"
            })
        );
    }
}
