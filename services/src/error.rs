//! Service error types.

use shopwire_core::event::EventKind;
use shopwire_runtime::{HandlerError, PublishError};
use thiserror::Error;

/// Errors raised by the service operations and their repositories.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The entity does not exist
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Entity kind, e.g. `product`
        entity: &'static str,
        /// Identifier looked up
        id: String,
    },

    /// The entity already exists
    #[error("{entity} '{id}' already exists")]
    AlreadyExists {
        /// Entity kind
        entity: &'static str,
        /// Conflicting identifier
        id: String,
    },

    /// The event kind cannot be produced by this operation
    #[error("Event {0} is not a product selection")]
    NotASelection(EventKind),

    /// The backing store failed
    #[error("Repository failure: {0}")]
    Repository(String),

    /// Publishing the resulting event failed on the broker
    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl ServiceError {
    pub(crate) fn product_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: "product",
            id: id.to_string(),
        }
    }

    pub(crate) fn customer_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: "customer",
            id: id.to_string(),
        }
    }
}

impl From<ServiceError> for HandlerError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::Publish(e) => Self::Publish(e),
            other => Self::new(other),
        }
    }
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;
