// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session termination: wipe everything, record why, force re-auth.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::epoch_ms;
use crate::events::SessionEvent;
use crate::lock::LOCK_KEY;
use crate::refresh::decode_exp;
use crate::store::{SharedStore, TokenStore};

/// Shared-store key holding the diagnostic ring buffer.
pub const DIAGNOSTICS_KEY: &str = "session.diagnostics";

/// Why a session was ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminateReason {
    /// The refresh token's `exp` claim was already in the past.
    RefreshTokenExpired,
    /// The server rejected the refresh token (invalid, blacklisted, used).
    RefreshTokenRejected,
    /// Explicit logout.
    Logout,
}

impl fmt::Display for TerminateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RefreshTokenExpired => "refresh_token_expired",
            Self::RefreshTokenRejected => "refresh_token_rejected",
            Self::Logout => "logout",
        };
        f.write_str(s)
    }
}

/// One entry in the persisted diagnostic ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub at_ms: u64,
    pub reason: TerminateReason,
    pub had_access: bool,
    pub had_refresh: bool,
    /// `exp` claim of the refresh token at termination time, if decodable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at: Option<u64>,
    pub detail: String,
}

/// Wipes session state and records why. Safe to call repeatedly: once the
/// store holds no pair, further calls are no-ops.
pub struct SessionTerminator {
    kv: Arc<dyn SharedStore>,
    tokens: Arc<TokenStore>,
    event_tx: broadcast::Sender<SessionEvent>,
    capacity: usize,
}

impl SessionTerminator {
    pub fn new(
        kv: Arc<dyn SharedStore>,
        tokens: Arc<TokenStore>,
        event_tx: broadcast::Sender<SessionEvent>,
        capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self { kv, tokens, event_tx, capacity })
    }

    /// End the session. Returns `true` when this call performed the wipe.
    pub fn terminate(&self, reason: TerminateReason, detail: &str) -> bool {
        let Some(pair) = self.tokens.read() else {
            tracing::debug!(%reason, "terminate requested but session already empty");
            return false;
        };

        self.append_diagnostic(DiagnosticEntry {
            at_ms: epoch_ms(),
            reason,
            had_access: !pair.access.is_empty(),
            had_refresh: !pair.refresh.is_empty(),
            refresh_expires_at: decode_exp(&pair.refresh),
            detail: detail.to_owned(),
        });

        if let Err(e) = self.tokens.clear() {
            tracing::warn!(err = %e, "failed to clear tokens during termination");
        }
        if let Err(e) = self.kv.remove(LOCK_KEY) {
            tracing::warn!(err = %e, "failed to clear refresh lock during termination");
        }

        tracing::info!(%reason, detail, "session terminated");
        let _ = self.event_tx.send(SessionEvent::Terminated { reason });
        true
    }

    /// The retained diagnostic entries, oldest first.
    pub fn recent_diagnostics(&self) -> Vec<DiagnosticEntry> {
        let Some(raw) = self.kv.get(DIAGNOSTICS_KEY) else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    fn append_diagnostic(&self, entry: DiagnosticEntry) {
        let mut entries = self.recent_diagnostics();
        entries.push(entry);
        if entries.len() > self.capacity {
            let excess = entries.len() - self.capacity;
            entries.drain(..excess);
        }
        match serde_json::to_string(&entries) {
            Ok(json) => {
                if let Err(e) = self.kv.set(DIAGNOSTICS_KEY, &json) {
                    tracing::warn!(err = %e, "failed to persist session diagnostics");
                }
            }
            Err(e) => tracing::warn!(err = %e, "failed to serialize session diagnostics"),
        }
    }
}

#[cfg(test)]
#[path = "terminate_tests.rs"]
mod tests;
