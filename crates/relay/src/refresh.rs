// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The refresh round trip: redeem the current refresh token for a new pair.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::RelayConfig;
use crate::events::SessionEvent;
use crate::singleflight::InUseMarker;
use crate::store::{TokenPair, TokenStore};
use crate::terminate::{SessionTerminator, TerminateReason};

/// Body of `POST /auth/refresh/`.
#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

/// Successful refresh response.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    access: String,
    #[serde(default)]
    refresh: String,
}

/// Classification of a failed refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshFailure {
    /// The server rejected the refresh token itself — fatal, terminate.
    TokenInvalid,
    /// Local `exp` decode says the token is already dead — fatal, no
    /// network round trip spent.
    TokenExpiredLocally,
    /// A 4xx unrelated to the refresh token — non-fatal.
    ClientError,
    /// Network failure, 5xx, or malformed success body — non-fatal,
    /// presumed transient.
    Transport,
}

impl RefreshFailure {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TokenInvalid | Self::TokenExpiredLocally)
    }
}

/// Classify a non-2xx refresh response.
///
/// 401 always means the refresh token is unusable. 400 is fatal only when
/// the error body's text points at the refresh token (simplejwt-style
/// `token_not_valid` / blacklisted / expired / already-used wording); other
/// 400s belong to the caller's request, not the session.
pub fn classify_refresh_failure(status: u16, body: &str) -> RefreshFailure {
    if status == 401 {
        return RefreshFailure::TokenInvalid;
    }
    if status == 400 {
        let message = extract_error_message(body).to_lowercase();
        let about_token = message.contains("token") || message.contains("refresh");
        let fatal_pattern = ["invalid", "expired", "blacklist", "not valid", "already used"]
            .iter()
            .any(|p| message.contains(p));
        if about_token && fatal_pattern {
            return RefreshFailure::TokenInvalid;
        }
        return RefreshFailure::ClientError;
    }
    if (400..500).contains(&status) {
        return RefreshFailure::ClientError;
    }
    RefreshFailure::Transport
}

/// Pull the human-readable message (and machine code, if any) out of an
/// error body. Falls back to the raw body for non-JSON responses.
fn extract_error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.to_owned();
    };
    let mut parts = Vec::new();
    for field in ["detail", "message", "code"] {
        if let Some(s) = value.get(field).and_then(|v| v.as_str()) {
            parts.push(s.to_owned());
        }
    }
    if parts.is_empty() {
        body.to_owned()
    } else {
        parts.join(" ")
    }
}

/// Decode the `exp` claim of a JWT without verifying it. `None` when the
/// token isn't a decodable JWT.
pub(crate) fn decode_exp(token: &str) -> Option<u64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp")?.as_u64()
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Performs the network exchange of a refresh token for a new pair.
///
/// Only ever invoked from inside the coordinator's single in-flight future.
pub struct RefreshExecutor {
    http: reqwest::Client,
    config: RelayConfig,
    tokens: Arc<TokenStore>,
    terminator: Arc<SessionTerminator>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl RefreshExecutor {
    pub fn new(
        http: reqwest::Client,
        config: RelayConfig,
        tokens: Arc<TokenStore>,
        terminator: Arc<SessionTerminator>,
        event_tx: broadcast::Sender<SessionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self { http, config, tokens, terminator, event_tx })
    }

    /// Redeem `token` for a new pair. `None` means the attempt failed;
    /// whether the session survived depends on the classification (fatal
    /// outcomes have already gone through the terminator).
    ///
    /// When the stored refresh token differs from `token` — another client
    /// rotated it while we were queueing — the newer token is used and the
    /// in-use marker advanced; the flight is not aborted. A token known to
    /// be superseded is never redeemed.
    pub async fn execute(&self, token: String, marker: &InUseMarker) -> Option<TokenPair> {
        let mut token = token;
        if let Some(stored) = self.tokens.read() {
            if !stored.refresh.is_empty() && stored.refresh != token {
                tracing::debug!("refresh token rotated mid-flight, switching to the newer one");
                marker.set(&stored.refresh);
                token = stored.refresh;
            }
        }

        if let Some(exp) = decode_exp(&token) {
            if exp <= now_secs() {
                self.terminator.terminate(
                    TerminateReason::RefreshTokenExpired,
                    "refresh token expired before redemption",
                );
                return None;
            }
        }

        let resp = match self
            .http
            .post(self.config.refresh_url())
            .json(&RefreshRequest { refresh: &token })
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(err = %e, "refresh request failed to reach the server");
                let _ = self.event_tx.send(SessionEvent::RefreshFailed { error: e.to_string() });
                return None;
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let failure = classify_refresh_failure(status.as_u16(), &body);
            let message = extract_error_message(&body);
            match failure {
                RefreshFailure::TokenInvalid => {
                    self.terminator.terminate(
                        TerminateReason::RefreshTokenRejected,
                        &format!("refresh rejected ({status}): {message}"),
                    );
                }
                _ => {
                    tracing::warn!(%status, %message, "refresh failed, keeping current tokens");
                }
            }
            let _ = self
                .event_tx
                .send(SessionEvent::RefreshFailed { error: format!("{status}: {message}") });
            return None;
        }

        let parsed: RefreshResponse = match resp.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(err = %e, "refresh succeeded but the response body is malformed");
                let _ = self.event_tx.send(SessionEvent::RefreshFailed { error: e.to_string() });
                return None;
            }
        };
        if parsed.access.is_empty() || parsed.refresh.is_empty() {
            // Never commit a partial pair.
            tracing::warn!("refresh response is missing a token field, nothing committed");
            let _ = self.event_tx.send(SessionEvent::RefreshFailed {
                error: "refresh response missing access or refresh token".to_owned(),
            });
            return None;
        }

        let user = self.tokens.read().and_then(|p| p.user);
        let rotated = parsed.refresh != token;
        let pair =
            TokenPair { access: parsed.access, refresh: parsed.refresh, user };
        if let Err(e) = self.tokens.write(&pair) {
            tracing::warn!(err = %e, "failed to persist refreshed tokens");
        }
        // Advance the marker so callers still waiting on the old token value
        // transition cleanly.
        marker.set(&pair.refresh);

        tracing::info!(rotated, "session tokens refreshed");
        let _ = self.event_tx.send(SessionEvent::Refreshed { rotated });
        Some(pair)
    }
}

#[cfg(test)]
#[path = "refresh_tests.rs"]
mod tests;
