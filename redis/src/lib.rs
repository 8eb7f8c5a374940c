//! Redis marker store for Shopwire.
//!
//! [`RedisMarkerStore`] implements [`MarkerStore`] with plain string keys and native
//! expiry. The claim step of the idempotency guard maps to a single command:
//!
//! ```text
//! SET processed_order:<orderId> pending NX EX <lease-secs>
//! ```
//!
//! Redis executes it atomically, so every replica sharing the instance agrees on one
//! winner per key.
//!
//! # Example
//!
//! ```no_run
//! use shopwire_redis::RedisMarkerStore;
//! use shopwire_core::store::MarkerStore;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisMarkerStore::new("redis://127.0.0.1:6379").await?;
//! let won = store.set_if_absent("processed_order:o1", "pending", Duration::from_secs(300)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use futures::future::BoxFuture;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use shopwire_core::store::{MarkerStore, StoreError};
use std::time::Duration;

/// `Redis`-backed marker store.
///
/// Clones share one `ConnectionManager`, which reconnects on its own after a dropped
/// connection.
#[derive(Clone)]
pub struct RedisMarkerStore {
    conn_manager: ConnectionManager,
}

impl RedisMarkerStore {
    /// Connect to `redis_url` (`redis://[:password@]host[:port][/db]` or `rediss://`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the URL is malformed or the server cannot be
    /// reached.
    pub async fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)
            .map_err(|e| StoreError::Unavailable(format!("Failed to create Redis client: {e}")))?;

        let conn_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect to Redis: {e}")))?;

        tracing::info!("RedisMarkerStore initialized");
        Ok(Self { conn_manager })
    }
}

impl MarkerStore for RedisMarkerStore {
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, StoreError>> {
        let mut conn = self.conn_manager.clone();
        let key = key.to_string();
        let value = value.to_string();

        Box::pin(async move {
            // Reply is "OK" when the key was created and nil when it already existed
            let reply: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&value)
                .arg("NX")
                .arg("EX")
                .arg(ttl_seconds(ttl))
                .query_async(&mut conn)
                .await
                .map_err(store_error)?;

            let created = reply.is_some();
            tracing::debug!(key = %key, created, "SET NX");
            Ok(created)
        })
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, Result<(), StoreError>> {
        let mut conn = self.conn_manager.clone();
        let key = key.to_string();
        let value = value.to_string();

        Box::pin(async move {
            let _: () = conn.set_ex(&key, value, ttl_seconds(ttl)).await.map_err(store_error)?;
            Ok(())
        })
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, StoreError>> {
        let mut conn = self.conn_manager.clone();
        let key = key.to_string();

        Box::pin(async move { conn.get(&key).await.map_err(store_error) })
    }

    fn remove(&self, key: &str) -> BoxFuture<'_, Result<(), StoreError>> {
        let mut conn = self.conn_manager.clone();
        let key = key.to_string();

        Box::pin(async move {
            let _: () = conn.del(&key).await.map_err(store_error)?;
            Ok(())
        })
    }
}

/// `EX` takes whole seconds and rejects zero.
fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn store_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::CommandFailed(e.to_string())
    }
}
