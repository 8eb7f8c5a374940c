//! Integration tests for [`RedisMarkerStore`] against a real Redis server.
//!
//! Marked `#[ignore]`: they start a Redis container through testcontainers.
//!
//! ```bash
//! cargo test -p shopwire-redis --test redis_store -- --ignored
//! ```

#![allow(clippy::expect_used)]

use shopwire_core::store::MarkerStore;
use shopwire_redis::RedisMarkerStore;
use shopwire_runtime::{DedupKey, GuardOutcome, IdempotencyGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::redis::{REDIS_PORT, Redis};

async fn start_redis() -> (ContainerAsync<Redis>, RedisMarkerStore) {
    let container = Redis::default().start().await.expect("Failed to start Redis");
    let host = container.get_host().await.expect("Failed to get host");
    let port = container.get_host_port_ipv4(REDIS_PORT).await.expect("Failed to get port");
    let store = RedisMarkerStore::new(&format!("redis://{host}:{port}"))
        .await
        .expect("Failed to connect to Redis");
    (container, store)
}

#[tokio::test]
#[ignore]
async fn set_if_absent_has_one_winner() {
    let (_redis, store) = start_redis().await;
    let ttl = Duration::from_secs(60);

    assert!(store.set_if_absent("processed_order:o1", "pending", ttl).await.expect("SET NX failed"));
    assert!(!store.set_if_absent("processed_order:o1", "pending", ttl).await.expect("SET NX failed"));
    assert_eq!(
        store.get("processed_order:o1").await.expect("GET failed").as_deref(),
        Some("pending")
    );

    store.remove("processed_order:o1").await.expect("DEL failed");
    assert_eq!(store.get("processed_order:o1").await.expect("GET failed"), None);
}

#[tokio::test]
#[ignore]
async fn markers_expire() {
    let (_redis, store) = start_redis().await;

    store
        .set("processed_order:o2", "true", Duration::from_secs(1))
        .await
        .expect("SET EX failed");
    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(store.get("processed_order:o2").await.expect("GET failed"), None);
}

#[tokio::test]
#[ignore]
async fn concurrent_guards_apply_once() {
    let (_redis, store) = start_redis().await;
    let applied = Arc::new(AtomicUsize::new(0));
    let key = DedupKey::processed_order("o3");

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let guard = IdempotencyGuard::new(Arc::new(store.clone()));
            let applied = Arc::clone(&applied);
            let key = key.clone();
            tokio::spawn(async move {
                guard
                    .run_once(&key, || async move {
                        applied.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(())
                    })
                    .await
            })
        })
        .collect();
    for task in tasks {
        let _ = task.await.expect("Task panicked");
    }
    assert_eq!(applied.load(Ordering::SeqCst), 1);

    let guard = IdempotencyGuard::new(Arc::new(store));
    let replay = guard.run_once(&key, || async { Ok(()) }).await.expect("Guard failed");
    assert_eq!(replay, GuardOutcome::Duplicate);
    assert!(guard.already_processed(&key).await.expect("GET failed"));
}
