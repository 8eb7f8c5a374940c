//! Idempotency guard for effects that are not naturally idempotent.
//!
//! Transports deliver at least once and the same event can arrive on both paths, so a
//! handler whose effect must happen once (decrementing stock, say) runs it through an
//! [`IdempotencyGuard`]. The guard keeps one marker per logical event in a shared
//! [`MarkerStore`]:
//!
//! ```text
//!   absent ──SET NX EX lease──▶ "pending" ──effect ok──▶ "true" (30 days)
//!                                   │
//!                                   └──effect failed──▶ absent
//! ```
//!
//! The conditional write picks a single winner among concurrent deliveries on every
//! replica. A loser that finds `"true"` skips the event; a loser that finds `"pending"`
//! fails so the message is redelivered later, when the winner has either finished or
//! crashed and let its lease expire.

use crate::metrics::IdempotencyMetrics;
use crate::router::HandlerError;
use shopwire_core::store::{MarkerStore, StoreError};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long a completed marker is kept.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// How long an in-flight claim is held before another consumer may take over.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(5 * 60);

const PROCESSED: &str = "true";
const PENDING: &str = "pending";

/// Key identifying one logical event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

impl DedupKey {
    /// Key `<namespace>:<id>`.
    #[must_use]
    pub fn new(namespace: &str, id: &str) -> Self {
        Self(format!("{namespace}:{id}"))
    }

    /// Key for an order whose inventory effect has been applied.
    #[must_use]
    pub fn processed_order(order_id: &str) -> Self {
        Self::new("processed_order", order_id)
    }

    /// The key as stored.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of trying to claim a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This caller owns the key and should apply the effect.
    Acquired,
    /// The effect was already applied.
    Processed,
    /// Another caller holds an unexpired claim.
    InFlight,
}

/// Result of [`IdempotencyGuard::run_once`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome<T> {
    /// The effect ran.
    Applied(T),
    /// The effect had already run; nothing was done.
    Duplicate,
}

/// Runs effects at most once per [`DedupKey`].
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn MarkerStore>,
    retention: Duration,
    lease: Duration,
}

impl IdempotencyGuard {
    /// Create a guard with a 30-day retention and a 5-minute lease.
    #[must_use]
    pub fn new(store: Arc<dyn MarkerStore>) -> Self {
        Self {
            store,
            retention: DEFAULT_RETENTION,
            lease: DEFAULT_LEASE,
        }
    }

    /// Override how long completed markers are kept.
    #[must_use]
    pub const fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Override how long an in-flight claim is held.
    #[must_use]
    pub const fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Whether the effect for `key` has completed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    pub async fn already_processed(&self, key: &DedupKey) -> Result<bool, StoreError> {
        Ok(self.store.get(key.as_str()).await?.as_deref() == Some(PROCESSED))
    }

    /// Record the effect for `key` as completed, for the retention period.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    pub async fn mark_processed(&self, key: &DedupKey) -> Result<(), StoreError> {
        self.store.set(key.as_str(), PROCESSED, self.retention).await
    }

    /// Atomically claim `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    pub async fn try_claim(&self, key: &DedupKey) -> Result<Claim, StoreError> {
        if self.store.set_if_absent(key.as_str(), PENDING, self.lease).await? {
            return Ok(Claim::Acquired);
        }
        match self.store.get(key.as_str()).await?.as_deref() {
            Some(PROCESSED) => Ok(Claim::Processed),
            // A vanished key expired between the two calls; whoever claims next wins
            _ => Ok(Claim::InFlight),
        }
    }

    /// Give up a claim so a redelivery can try again.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    pub async fn release(&self, key: &DedupKey) -> Result<(), StoreError> {
        self.store.remove(key.as_str()).await
    }

    /// Run `effect` unless it already ran for `key`.
    ///
    /// On success the marker is finalized; on failure the claim is released and the
    /// error returned, so the delivery is retried.
    ///
    /// # Errors
    ///
    /// Returns the effect's error, [`HandlerError::InFlight`] if another consumer holds
    /// the claim, or [`HandlerError::Store`] if the store failed before the effect ran.
    pub async fn run_once<T, F, Fut>(&self, key: &DedupKey, effect: F) -> Result<GuardOutcome<T>, HandlerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, HandlerError>>,
    {
        match self.try_claim(key).await? {
            Claim::Acquired => {}
            Claim::Processed => {
                IdempotencyMetrics::record_duplicate();
                info!(key = %key, "Effect already applied, skipping duplicate delivery");
                return Ok(GuardOutcome::Duplicate);
            }
            Claim::InFlight => {
                warn!(key = %key, "Effect in flight elsewhere, deferring delivery");
                return Err(HandlerError::InFlight(key.to_string()));
            }
        }

        match effect().await {
            Ok(value) => {
                if let Err(e) = self.mark_processed(key).await {
                    // The effect is applied; redelivering would apply it twice after the
                    // lease expires, so report success and keep the pending marker
                    error!(key = %key, error = %e, "Effect applied but marker not finalized");
                }
                Ok(GuardOutcome::Applied(value))
            }
            Err(e) => {
                if let Err(release_error) = self.release(key).await {
                    error!(key = %key, error = %release_error, "Failed to release claim; it expires with its lease");
                }
                Err(e)
            }
        }
    }
}
