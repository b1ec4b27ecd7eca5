// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::memory::MemoryStore;
use super::*;
use crate::config::RelayConfig;
use crate::identity::ClientIdentity;
use crate::lock::{LockManager, LOCK_KEY};

fn token_store(kv: &Arc<MemoryStore>) -> (Arc<TokenStore>, Arc<LockManager>) {
    let kv: Arc<dyn SharedStore> = Arc::clone(kv) as Arc<dyn SharedStore>;
    let lock = LockManager::new(
        Arc::clone(&kv),
        ClientIdentity::ephemeral(),
        &RelayConfig::new("http://localhost"),
    );
    (TokenStore::new(kv, Arc::clone(&lock)), lock)
}

#[tokio::test]
async fn read_missing_returns_none() {
    let kv = MemoryStore::new();
    let (store, _lock) = token_store(&kv);
    assert!(store.read().is_none());
}

#[tokio::test]
async fn write_then_read_round_trips_with_user() {
    let kv = MemoryStore::new();
    let (store, _lock) = token_store(&kv);

    let user = serde_json::json!({"id": 7, "email": "a@b.c", "role": "distributor"});
    let pair = TokenPair::new("acc-1", "ref-1").with_user(user.clone());
    store.write(&pair).expect("write");

    let read = store.read().expect("pair");
    assert_eq!(read.access, "acc-1");
    assert_eq!(read.refresh, "ref-1");
    assert_eq!(read.user, Some(user));
}

#[tokio::test]
async fn corrupt_data_reads_as_none() {
    let kv = MemoryStore::new();
    let (store, _lock) = token_store(&kv);
    kv.set(TOKENS_KEY, "{not json").expect("set");
    assert!(store.read().is_none());
}

#[tokio::test]
async fn write_releases_own_lock() {
    let kv = MemoryStore::new();
    let (store, lock) = token_store(&kv);

    assert!(lock.try_acquire("fp"));
    assert!(kv.get(LOCK_KEY).is_some());

    store.write(&TokenPair::new("a", "r")).expect("write");
    assert!(kv.get(LOCK_KEY).is_none());
}

#[tokio::test]
async fn write_leaves_foreign_lock_alone() {
    let kv = MemoryStore::new();
    let (store, _lock) = token_store(&kv);
    let (_other_store, other_lock) = token_store(&kv);

    assert!(other_lock.try_acquire("fp"));
    store.write(&TokenPair::new("a", "r")).expect("write");
    assert!(kv.get(LOCK_KEY).is_some(), "another client's live lock must survive our write");
}

#[tokio::test]
async fn watcher_forwards_pairs_written_by_another_handle() {
    let kv = MemoryStore::new();
    let (writer, _l1) = token_store(&kv);
    let (observer, _l2) = token_store(&kv);

    let shutdown = CancellationToken::new();
    let (event_tx, mut event_rx) = broadcast::channel(8);
    observer.spawn_watcher(shutdown.clone(), event_tx);
    let mut external = observer.subscribe_external();

    // Yield so the watcher task subscribes before the write.
    tokio::task::yield_now().await;
    writer.write(&TokenPair::new("acc-x", "ref-x")).expect("write");

    let pair = tokio::time::timeout(Duration::from_secs(2), external.recv())
        .await
        .expect("timed out")
        .expect("pair");
    assert_eq!(pair.refresh, "ref-x");

    let event = tokio::time::timeout(Duration::from_secs(2), event_rx.recv())
        .await
        .expect("timed out")
        .expect("event");
    assert!(matches!(event, crate::events::SessionEvent::TokensUpdated));

    shutdown.cancel();
}

#[tokio::test]
async fn watcher_ignores_own_writes() {
    let kv = MemoryStore::new();
    let (store, _lock) = token_store(&kv);

    let shutdown = CancellationToken::new();
    let (event_tx, _event_rx) = broadcast::channel(8);
    store.spawn_watcher(shutdown.clone(), event_tx);
    let mut external = store.subscribe_external();

    tokio::task::yield_now().await;
    store.write(&TokenPair::new("a", "r")).expect("write");

    // Give the watcher time to (wrongly) forward the echo.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(external.try_recv().is_err(), "own write must not surface as external");

    shutdown.cancel();
}
