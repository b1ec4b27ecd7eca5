// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared-store abstraction and the token store built on it.
//!
//! Every client of one logged-in session sees the same shared store. The two
//! traits here are the only surface the coordination code touches, so any
//! backend (in-process map, files + fs-watch, a real KV service) can carry a
//! session.

pub mod file;
pub mod memory;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::lock::LockManager;

/// Shared-store key holding the serialized [`TokenPair`].
pub const TOKENS_KEY: &str = "session.tokens";

/// String key-value store shared by all clients of a session.
pub trait KeyValueStore: Send + Sync {
    /// Read a key. Missing keys and unreadable backends both read as `None`.
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn remove(&self, key: &str) -> anyhow::Result<()>;
}

/// Change notification for a shared store.
///
/// Fires the changed key for same-process and other-process writes alike;
/// subscribers that care about the difference compare values themselves.
pub trait ChangeNotifier: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<String>;
}

/// A store that is both readable/writable and observable.
pub trait SharedStore: KeyValueStore + ChangeNotifier {}

impl<T: KeyValueStore + ChangeNotifier> SharedStore for T {}

/// The current access/refresh pair plus opaque minimal user identity.
///
/// `access` and `refresh` are always written together; `user` is carried
/// forward across refreshes unchanged, never derived here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<serde_json::Value>,
}

impl TokenPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self { access: access.into(), refresh: refresh.into(), user: None }
    }

    pub fn with_user(mut self, user: serde_json::Value) -> Self {
        self.user = Some(user);
        self
    }
}

/// Reads and writes the session's token pair in the shared store.
pub struct TokenStore {
    kv: Arc<dyn SharedStore>,
    lock: Arc<LockManager>,
    /// Serialized form of the last pair this handle wrote, used to tell our
    /// own change notifications apart from other clients' writes.
    last_written: parking_lot::Mutex<Option<String>>,
    external_tx: broadcast::Sender<TokenPair>,
}

impl TokenStore {
    pub fn new(kv: Arc<dyn SharedStore>, lock: Arc<LockManager>) -> Arc<Self> {
        let (external_tx, _) = broadcast::channel(16);
        Arc::new(Self { kv, lock, last_written: parking_lot::Mutex::new(None), external_tx })
    }

    /// Read the current pair. Never errors: missing or corrupt data reads as
    /// `None`.
    pub fn read(&self) -> Option<TokenPair> {
        let raw = self.kv.get(TOKENS_KEY)?;
        match serde_json::from_str::<TokenPair>(&raw) {
            Ok(pair) => Some(pair),
            Err(e) => {
                tracing::warn!(err = %e, "corrupt token pair in shared store");
                None
            }
        }
    }

    /// Persist a pair, verify the write by reading it back (retrying once on
    /// mismatch), then release this client's refresh lock — a fresh pair
    /// invalidates any lock tied to the old refresh token.
    pub fn write(&self, pair: &TokenPair) -> anyhow::Result<()> {
        let json = serde_json::to_string(pair)?;
        // Record before writing so the watcher sees our own echo as ours.
        *self.last_written.lock() = Some(json.clone());

        self.kv.set(TOKENS_KEY, &json)?;
        if self.kv.get(TOKENS_KEY).as_deref() != Some(json.as_str()) {
            tracing::warn!("token write readback mismatch, retrying once");
            self.kv.set(TOKENS_KEY, &json)?;
            if self.kv.get(TOKENS_KEY).as_deref() != Some(json.as_str()) {
                tracing::error!("token store inconsistent after retry; shared store is dropping writes");
            }
        }

        self.lock.release();
        Ok(())
    }

    /// Remove the stored pair.
    pub fn clear(&self) -> anyhow::Result<()> {
        *self.last_written.lock() = None;
        self.kv.remove(TOKENS_KEY)
    }

    /// Subscribe to pairs written by other clients (requires
    /// [`TokenStore::spawn_watcher`] to be running).
    pub fn subscribe_external(&self) -> broadcast::Receiver<TokenPair> {
        self.external_tx.subscribe()
    }

    /// Watch the shared store and forward pairs this handle did not write
    /// itself. Runs until `shutdown` is cancelled.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        shutdown: CancellationToken,
        event_tx: broadcast::Sender<crate::events::SessionEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = store.kv.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = rx.recv() => match changed {
                        Ok(key) if key == TOKENS_KEY => store.on_tokens_changed(&event_tx),
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    fn on_tokens_changed(&self, event_tx: &broadcast::Sender<crate::events::SessionEvent>) {
        let raw = self.kv.get(TOKENS_KEY);
        if raw.as_deref() == self.last_written.lock().as_deref() {
            // Echo of our own write.
            return;
        }
        let Some(raw) = raw else { return };
        match serde_json::from_str::<TokenPair>(&raw) {
            Ok(pair) => {
                tracing::debug!("picked up token pair written by another client");
                let _ = self.external_tx.send(pair);
                let _ = event_tx.send(crate::events::SessionEvent::TokensUpdated);
            }
            Err(e) => tracing::warn!(err = %e, "ignoring corrupt external token update"),
        }
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
