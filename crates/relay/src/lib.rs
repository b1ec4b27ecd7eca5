// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authrelay: shared-session token lifecycle coordination.
//!
//! Keeps exactly one valid access/refresh pair available to every concurrent
//! client of a logged-in session over one shared store, silently renewing
//! the short-lived access token with the single-use rotating refresh token —
//! without ever presenting the same refresh token twice and without
//! duplicate network calls from concurrent callers.

pub mod client;
pub mod config;
pub mod events;
pub mod identity;
pub mod lock;
pub mod refresh;
pub mod singleflight;
pub mod store;
pub mod terminate;

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub use crate::client::AuthedClient;
pub use crate::config::RelayConfig;
pub use crate::events::SessionEvent;
pub use crate::identity::ClientIdentity;
pub use crate::store::{KeyValueStore, SharedStore, TokenPair, TokenStore};
pub use crate::terminate::TerminateReason;

use crate::lock::LockManager;
use crate::refresh::RefreshExecutor;
use crate::singleflight::RefreshCoordinator;
use crate::terminate::SessionTerminator;

/// One client's handle onto a shared session.
///
/// Wires the store, lock manager, single-flight coordinator, refresh
/// executor and interceptor together, and watches the shared store for token
/// pairs written by other clients.
pub struct TokenRelay {
    tokens: Arc<TokenStore>,
    coordinator: Arc<RefreshCoordinator>,
    terminator: Arc<SessionTerminator>,
    client: AuthedClient,
    event_tx: broadcast::Sender<SessionEvent>,
    shutdown: CancellationToken,
}

impl TokenRelay {
    /// Build a relay handle over a shared store with the given identity.
    pub fn new(config: RelayConfig, kv: Arc<dyn SharedStore>, identity: ClientIdentity) -> Self {
        // reqwest with rustls-no-provider needs the provider installed once.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .unwrap_or_default();

        let (event_tx, _) = broadcast::channel(64);
        let shutdown = CancellationToken::new();

        let lock = LockManager::new(Arc::clone(&kv), identity, &config);
        let tokens = TokenStore::new(Arc::clone(&kv), Arc::clone(&lock));
        tokens.spawn_watcher(shutdown.clone(), event_tx.clone());

        let terminator = SessionTerminator::new(
            Arc::clone(&kv),
            Arc::clone(&tokens),
            event_tx.clone(),
            config.diagnostics_capacity,
        );
        let executor = RefreshExecutor::new(
            http.clone(),
            config.clone(),
            Arc::clone(&tokens),
            Arc::clone(&terminator),
            event_tx.clone(),
        );
        let coordinator =
            RefreshCoordinator::new(Arc::clone(&tokens), Arc::clone(&lock), executor, &config);
        let client = AuthedClient::new(
            http,
            config,
            Arc::clone(&tokens),
            Arc::clone(&coordinator),
            Arc::clone(&terminator),
        );

        Self { tokens, coordinator, terminator, client, event_tx, shutdown }
    }

    /// Store the pair produced by a completed login.
    pub fn login(&self, pair: &TokenPair) -> anyhow::Result<()> {
        self.tokens.write(pair)
    }

    /// Wipe the session and notify subscribers.
    pub fn logout(&self) {
        self.terminator.terminate(TerminateReason::Logout, "logout requested");
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn terminator(&self) -> &Arc<SessionTerminator> {
        &self.terminator
    }

    pub fn client(&self) -> &AuthedClient {
        &self.client
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Stop background tasks.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TokenRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Current epoch milliseconds.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
