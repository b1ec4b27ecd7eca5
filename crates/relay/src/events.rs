// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};

use crate::terminate::TerminateReason;

/// Events emitted by the relay on its broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A refresh committed a new token pair.
    Refreshed {
        /// Whether the server rotated the refresh token.
        rotated: bool,
    },
    /// A refresh attempt failed without ending the session.
    RefreshFailed { error: String },
    /// The session was wiped; the embedder must force re-authentication.
    Terminated { reason: TerminateReason },
    /// Another client wrote a new token pair to the shared store.
    TokensUpdated,
}
