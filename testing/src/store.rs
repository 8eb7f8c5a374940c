//! In-memory marker store and dead-letter sink.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap on poisoned locks

use futures::future::BoxFuture;
use shopwire_core::dead_letter::{DeadLetter, DeadLetterSink};
use shopwire_core::store::{MarkerStore, StoreError};
use shopwire_core::transport::TransportError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// In-memory marker store with per-key expiry.
///
/// `set_if_absent` holds the lock for the whole check-and-insert, so concurrent callers
/// see exactly one winner, as with a shared Redis instance. Expiry follows tokio's
/// clock.
#[derive(Clone, Default)]
pub struct InMemoryMarkerStore {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryMarkerStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every command fail (`true`) or succeed again (`false`).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Live value under `key`, bypassing the trait.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value.clone())
    }

    /// Remaining time to live of `key`.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .and_then(|(_, expires_at)| expires_at.checked_duration_since(now))
            .filter(|remaining| !remaining.is_zero())
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

impl MarkerStore for InMemoryMarkerStore {
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, StoreError>> {
        let key = key.to_string();
        let value = value.to_string();

        Box::pin(async move {
            self.check()?;
            let now = Instant::now();
            let mut entries = self.entries.lock().unwrap();
            let live = entries.get(&key).is_some_and(|(_, expires_at)| *expires_at > now);
            if live {
                return Ok(false);
            }
            entries.insert(key, (value, now + ttl));
            Ok(true)
        })
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, Result<(), StoreError>> {
        let key = key.to_string();
        let value = value.to_string();

        Box::pin(async move {
            self.check()?;
            self.entries
                .lock()
                .unwrap()
                .insert(key, (value, Instant::now() + ttl));
            Ok(())
        })
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, StoreError>> {
        let key = key.to_string();

        Box::pin(async move {
            self.check()?;
            Ok(self.value(&key))
        })
    }

    fn remove(&self, key: &str) -> BoxFuture<'_, Result<(), StoreError>> {
        let key = key.to_string();

        Box::pin(async move {
            self.check()?;
            self.entries.lock().unwrap().remove(&key);
            Ok(())
        })
    }
}

/// Dead-letter sink that keeps letters in memory.
#[derive(Clone, Default)]
pub struct InMemoryDeadLetters {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetters {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Letters received so far.
    #[must_use]
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap().clone()
    }
}

impl DeadLetterSink for InMemoryDeadLetters {
    fn dead_letter(&self, letter: &DeadLetter) -> BoxFuture<'_, Result<(), TransportError>> {
        let letter = letter.clone();

        Box::pin(async move {
            self.letters.lock().unwrap().push(letter);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expired_keys_can_be_claimed_again() {
        let store = InMemoryMarkerStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.set_if_absent("k", "pending", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "pending", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", "pending", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let store = InMemoryMarkerStore::new();
        let claims = (0..16).map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .set_if_absent("processed_order:o1", "pending", Duration::from_secs(300))
                    .await
                    .unwrap()
            })
        });

        let mut winners = 0;
        for claim in claims.collect::<Vec<_>>() {
            if claim.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn unavailable_store_reports_errors() {
        let store = InMemoryMarkerStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.get("k").await, Err(StoreError::Unavailable(_))));
    }
}
