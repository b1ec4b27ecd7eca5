// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use crate::store::KeyValueStore;

/// Client-local store key for the identity. The store passed to
/// [`ClientIdentity::persisted`] must not be the shared session store —
/// identities are per client by definition.
pub const CLIENT_ID_KEY: &str = "client.id";

/// A per-client identifier used to tell "my own lock" from "someone else's".
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    id: String,
}

impl ClientIdentity {
    /// A fresh random identity for the lifetime of this handle.
    pub fn ephemeral() -> Self {
        Self { id: uuid::Uuid::new_v4().to_string() }
    }

    /// An identity backed by a client-local store, so the same client keeps
    /// its id across restarts. Generated and stored on first use.
    pub fn persisted(local: &dyn KeyValueStore) -> Self {
        if let Some(id) = local.get(CLIENT_ID_KEY) {
            if !id.is_empty() {
                return Self { id };
            }
        }
        let identity = Self::ephemeral();
        if let Err(e) = local.set(CLIENT_ID_KEY, &identity.id) {
            tracing::warn!(err = %e, "failed to persist client identity, using ephemeral id");
        }
        identity
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
#[path = "identity_tests.rs"]
mod tests;
