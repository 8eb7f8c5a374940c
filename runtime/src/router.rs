//! Per-service event dispatch.
//!
//! Both consumers hand raw payloads to an [`EventRouter`]. The router decodes the payload
//! into a [`DomainEvent`] once, looks up the route for its kind and runs the handler with
//! a timeout. It never fails outward: every result is described by a
//! [`DispatchOutcome`], whose [`Disposition`] tells the transport whether to
//! acknowledge, redeliver or dead-letter the message.
//!
//! # Example
//!
//! ```
//! use shopwire_core::event::{DomainEvent, EventKind};
//! use shopwire_runtime::router::{Disposition, EventRouter, FailurePolicy, handler_fn};
//!
//! # async fn example() {
//! let router = EventRouter::new("shopping").route(
//!     EventKind::CustomerCreated,
//!     FailurePolicy::Redeliver,
//!     handler_fn(|event: DomainEvent| async move {
//!         println!("welcome {}", event.user_id());
//!         Ok(())
//!     }),
//! );
//!
//! let outcome = router
//!     .dispatch(br#"{"event":"CustomerCreated","data":{"userId":"u1","email":"a@b.c"}}"#)
//!     .await;
//! assert_eq!(outcome.disposition(), Disposition::Acknowledge);
//! # }
//! ```

use crate::publisher::PublishError;
use async_trait::async_trait;
use futures::FutureExt;
use shopwire_core::event::{DecodeError, Decoded, DomainEvent, EventKind};
use shopwire_core::store::StoreError;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// Default per-message handler timeout.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// A handler could not apply an event.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Application-level failure
    #[error("{0}")]
    Failed(String),

    /// The marker store failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A follow-up publish failed
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Another consumer holds the claim for this event
    #[error("Event {0} is being processed by another consumer")]
    InFlight(String),

    /// The handler did not finish in time
    #[error("Handler timed out after {0:?}")]
    TimedOut(Duration),

    /// The handler panicked
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Create an application-level failure.
    pub fn new(message: impl fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

/// Applies one kind of event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Apply `event`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] if the event could not be applied; the route's
    /// [`FailurePolicy`] decides what happens to the message.
    async fn handle(&self, event: DomainEvent) -> Result<(), HandlerError>;
}

/// Handler backed by an async closure. See [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as an [`EventHandler`].
pub const fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(DomainEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(DomainEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: DomainEvent) -> Result<(), HandlerError> {
        (self.0)(event).await
    }
}

/// What to do with a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Leave the message unacknowledged so the transport delivers it again.
    Redeliver,
    /// Log the failure and acknowledge anyway.
    Swallow,
}

/// What a transport should do with a dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Ack or delete it.
    Acknowledge,
    /// Leave it for redelivery.
    Redeliver,
    /// Move it aside; retrying cannot help.
    DeadLetter,
}

impl Disposition {
    /// Metric label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Acknowledge => "acknowledge",
            Self::Redeliver => "redeliver",
            Self::DeadLetter => "dead_letter",
        }
    }
}

/// Result of dispatching one payload.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The route's handler succeeded.
    Handled(EventKind),
    /// No route for this tag; the event belongs to someone else.
    Ignored(String),
    /// The payload could not be decoded.
    Rejected(DecodeError),
    /// The handler failed.
    Failed {
        /// Kind of the failed event
        kind: EventKind,
        /// The route's policy
        policy: FailurePolicy,
        /// The handler's error
        error: HandlerError,
    },
}

impl DispatchOutcome {
    /// How the transport should settle the message.
    #[must_use]
    pub const fn disposition(&self) -> Disposition {
        match self {
            Self::Handled(_)
            | Self::Ignored(_)
            | Self::Failed {
                policy: FailurePolicy::Swallow,
                ..
            } => Disposition::Acknowledge,
            Self::Failed {
                policy: FailurePolicy::Redeliver,
                ..
            } => Disposition::Redeliver,
            Self::Rejected(_) => Disposition::DeadLetter,
        }
    }

    /// Human-readable failure reason, if the dispatch did not succeed.
    #[must_use]
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            Self::Handled(_) | Self::Ignored(_) => None,
            Self::Rejected(e) => Some(e.to_string()),
            Self::Failed { error, .. } => Some(error.to_string()),
        }
    }
}

struct Route {
    handler: Arc<dyn EventHandler>,
    policy: FailurePolicy,
}

/// Dispatch table from event kind to handler.
pub struct EventRouter {
    service: String,
    routes: BTreeMap<EventKind, Route>,
    timeout: Duration,
}

impl EventRouter {
    /// Create an empty router for `service`, with the default 30 second timeout.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            routes: BTreeMap::new(),
            timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }

    /// Route `kind` to `handler`. A second route for the same kind replaces the first.
    #[must_use]
    pub fn route(mut self, kind: EventKind, policy: FailurePolicy, handler: impl EventHandler + 'static) -> Self {
        self.routes.insert(
            kind,
            Route {
                handler: Arc::new(handler),
                policy,
            },
        );
        self
    }

    /// Route `kind` to a shared handler.
    #[must_use]
    pub fn route_shared(mut self, kind: EventKind, policy: FailurePolicy, handler: Arc<dyn EventHandler>) -> Self {
        self.routes.insert(kind, Route { handler, policy });
        self
    }

    /// Override the per-message handler timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Service this router belongs to.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Routed kinds, in vocabulary order.
    #[must_use]
    pub fn kinds(&self) -> Vec<EventKind> {
        self.routes.keys().copied().collect()
    }

    /// Broker routing keys to bind: the wire tag of every routed kind.
    #[must_use]
    pub fn routing_keys(&self) -> Vec<String> {
        self.routes.keys().map(|kind| kind.as_str().to_string()).collect()
    }

    /// Decode `raw` and run the matching handler.
    pub async fn dispatch(&self, raw: &[u8]) -> DispatchOutcome {
        let event = match DomainEvent::decode(raw) {
            Ok(Decoded::Known(event)) => event,
            Ok(Decoded::Unknown(tag)) => {
                trace!(service = %self.service, event_type = %tag, "Ignoring unknown event");
                return DispatchOutcome::Ignored(tag);
            }
            Err(e) => {
                warn!(service = %self.service, error = %e, "Rejecting undecodable payload");
                return DispatchOutcome::Rejected(e);
            }
        };

        let kind = event.kind();
        let Some(route) = self.routes.get(&kind) else {
            trace!(service = %self.service, event_type = %kind, "No route for event");
            return DispatchOutcome::Ignored(kind.as_str().to_string());
        };

        debug!(service = %self.service, event_type = %kind, user_id = event.user_id(), "Dispatching event");
        let run = AssertUnwindSafe(route.handler.handle(event)).catch_unwind();

        let error = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(Ok(()))) => return DispatchOutcome::Handled(kind),
            Ok(Ok(Err(e))) => e,
            Ok(Err(panic)) => HandlerError::Panicked(panic_message(panic.as_ref())),
            Err(_) => HandlerError::TimedOut(self.timeout),
        };

        match route.policy {
            FailurePolicy::Redeliver => {
                error!(service = %self.service, event_type = %kind, error = %error, "Handler failed, message will be redelivered");
            }
            FailurePolicy::Swallow => {
                warn!(service = %self.service, event_type = %kind, error = %error, "Handler failed, acknowledging anyway");
            }
        }
        DispatchOutcome::Failed {
            kind,
            policy: route.policy,
            error,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
