// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Best-effort advisory refresh lock shared between clients.
//!
//! A true distributed mutex would be overkill for N clients of one session:
//! a timestamped record with staleness recovery gives "usually exactly one
//! refresh in flight" without risking permanent deadlock when a holder
//! crashes mid-refresh. The abstract store has no compare-and-swap, so
//! acquisition is read-decide-write with a narrow accepted race window;
//! liveness always wins over strict exclusion.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::config::RelayConfig;
use crate::epoch_ms;
use crate::identity::ClientIdentity;
use crate::store::SharedStore;

/// Shared-store key holding the serialized [`RefreshLock`].
pub const LOCK_KEY: &str = "session.refresh_lock";

/// The lock record written into the shared store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshLock {
    /// Digest of the refresh token the lock protects — unambiguous in logs
    /// without exposing the secret.
    pub token_fingerprint: String,
    pub owner_id: String,
    /// Epoch milliseconds at acquisition.
    pub acquired_at_ms: u64,
}

/// Short stable fingerprint of a refresh token (first 8 bytes of SHA-256).
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Acquire/release/staleness handling for the cross-client refresh lock.
pub struct LockManager {
    kv: Arc<dyn SharedStore>,
    owner: ClientIdentity,
    stale_after_ms: u64,
    poll: std::time::Duration,
    wait_ceiling: std::time::Duration,
}

impl LockManager {
    pub fn new(kv: Arc<dyn SharedStore>, owner: ClientIdentity, config: &RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            kv,
            owner,
            stale_after_ms: config.lock_stale_ms,
            poll: config.lock_poll_interval(),
            wait_ceiling: config.lock_wait_ceiling(),
        })
    }

    pub fn owner_id(&self) -> &str {
        self.owner.id()
    }

    fn current(&self) -> Option<RefreshLock> {
        let raw = self.kv.get(LOCK_KEY)?;
        match serde_json::from_str::<RefreshLock>(&raw) {
            Ok(lock) => Some(lock),
            Err(e) => {
                tracing::warn!(err = %e, "corrupt refresh lock record, treating as absent");
                None
            }
        }
    }

    fn is_stale(&self, lock: &RefreshLock) -> bool {
        epoch_ms().saturating_sub(lock.acquired_at_ms) > self.stale_after_ms
    }

    /// Try to take the lock for `token_fingerprint`.
    ///
    /// A live lock held by another client blocks acquisition. An absent,
    /// self-owned, or stale record is overwritten; clearing a stale foreign
    /// record is logged.
    pub fn try_acquire(&self, token_fingerprint: &str) -> bool {
        if let Some(existing) = self.current() {
            if existing.owner_id != self.owner.id() {
                if !self.is_stale(&existing) {
                    return false;
                }
                tracing::info!(
                    owner = %existing.owner_id,
                    age_ms = epoch_ms().saturating_sub(existing.acquired_at_ms),
                    "clearing stale refresh lock"
                );
            }
        }

        let record = RefreshLock {
            token_fingerprint: token_fingerprint.to_owned(),
            owner_id: self.owner.id().to_owned(),
            acquired_at_ms: epoch_ms(),
        };
        let json = match serde_json::to_string(&record) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!(err = %e, "failed to serialize refresh lock");
                return false;
            }
        };
        match self.kv.set(LOCK_KEY, &json) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(err = %e, "failed to write refresh lock");
                false
            }
        }
    }

    /// Whether another client currently holds a live lock.
    pub fn is_held_by_other(&self, token_fingerprint: &str) -> bool {
        match self.current() {
            Some(lock) if lock.owner_id != self.owner.id() && !self.is_stale(&lock) => {
                tracing::debug!(
                    owner = %lock.owner_id,
                    theirs = %lock.token_fingerprint,
                    ours = %token_fingerprint,
                    "refresh lock held by another client"
                );
                true
            }
            _ => false,
        }
    }

    /// Bounded wait for another client's lock to clear: poll every
    /// `lock_poll_ms`, give up after `lock_wait_ceiling_ms` and proceed
    /// anyway. Returns `false` on timeout.
    pub async fn wait_for_release(&self, token_fingerprint: &str) -> bool {
        let deadline = Instant::now() + self.wait_ceiling;
        while self.is_held_by_other(token_fingerprint) {
            if Instant::now() >= deadline {
                tracing::warn!("gave up waiting for another client's refresh lock, proceeding");
                return false;
            }
            tokio::time::sleep(self.poll).await;
        }
        true
    }

    /// Remove the lock record, but only if this client owns it — never clear
    /// another client's live lock.
    pub fn release(&self) {
        if let Some(lock) = self.current() {
            if lock.owner_id == self.owner.id() {
                if let Err(e) = self.kv.remove(LOCK_KEY) {
                    tracing::warn!(err = %e, "failed to release refresh lock");
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
