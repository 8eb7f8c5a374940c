//! Marker store for idempotency markers.
//!
//! A marker store is a shared key/value store with per-key expiry. The one operation that
//! matters for correctness is [`MarkerStore::set_if_absent`]: it must be atomic across every
//! replica of a service, so that of two concurrent deliveries of the same event exactly one
//! wins the right to apply its effect.

use futures::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;

/// Errors from marker store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached
    #[error("Marker store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected a command
    #[error("Marker store command failed: {0}")]
    CommandFailed(String),
}

/// Keyed markers with expiry.
pub trait MarkerStore: Send + Sync {
    /// Atomically store `value` under `key` unless the key already exists.
    ///
    /// Returns `true` if this call created the key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable or rejects the command.
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, StoreError>>;

    /// Store `value` under `key`, replacing any existing value and expiry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable or rejects the command.
    fn set(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Read the value under `key`, if present and not expired.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable or rejects the command.
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, StoreError>>;

    /// Delete `key`. Deleting a missing key succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable or rejects the command.
    fn remove(&self, key: &str) -> BoxFuture<'_, Result<(), StoreError>>;
}
