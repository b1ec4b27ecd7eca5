// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outgoing request interception: bearer attachment and 401 recovery.

use std::sync::Arc;

use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Method, Request, RequestBuilder, Response, StatusCode};

use crate::config::RelayConfig;
use crate::singleflight::RefreshCoordinator;
use crate::store::TokenStore;
use crate::terminate::{SessionTerminator, TerminateReason};

/// An HTTP client that attaches the session's access token and transparently
/// refreshes on 401, retrying the original call exactly once.
pub struct AuthedClient {
    http: reqwest::Client,
    config: RelayConfig,
    tokens: Arc<TokenStore>,
    coordinator: Arc<RefreshCoordinator>,
    terminator: Arc<SessionTerminator>,
}

impl AuthedClient {
    pub(crate) fn new(
        http: reqwest::Client,
        config: RelayConfig,
        tokens: Arc<TokenStore>,
        coordinator: Arc<RefreshCoordinator>,
        terminator: Arc<SessionTerminator>,
    ) -> Self {
        Self { http, config, tokens, coordinator, terminator }
    }

    /// Build a request against the configured API base.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, self.config.api_url(path))
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.request(Method::POST, path)
    }

    /// Build and execute in one step.
    pub async fn send(&self, builder: RequestBuilder) -> reqwest::Result<Response> {
        self.execute(builder.build()?).await
    }

    /// Execute a request with bearer attachment and 401 recovery.
    ///
    /// On a business 401: refresh through the coordinator, then retry the
    /// original request once (method, body, headers preserved) and return
    /// that outcome, win or lose. When the refresh yields nothing, the
    /// original 401 propagates untouched — a failed refresh never
    /// masquerades as the original call's result.
    pub async fn execute(&self, mut req: Request) -> reqwest::Result<Response> {
        let path = req.url().path().to_owned();
        let public = self.config.is_public_path(&path);

        if !public {
            if let Some(pair) = self.tokens.read() {
                attach_bearer(&mut req, &pair.access);
            }
        }

        // Cloned before the send so a consumed (streaming) body just means
        // no retry.
        let retry = req.try_clone();

        let resp = self.http.execute(req).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        if path == self.config.refresh_path {
            // 401 straight off the refresh endpoint: the refresh token is
            // unusable, no recovery possible.
            self.terminator
                .terminate(TerminateReason::RefreshTokenRejected, "refresh endpoint returned 401");
            return Ok(resp);
        }
        if public {
            return Ok(resp);
        }
        let Some(mut retry) = retry else {
            return Ok(resp);
        };

        match self.coordinator.request_refresh().await {
            Some(pair) => {
                attach_bearer(&mut retry, &pair.access);
                // One retry, no further recursion.
                self.http.execute(retry).await
            }
            None => Ok(resp),
        }
    }
}

fn attach_bearer(req: &mut Request, access: &str) {
    match HeaderValue::from_str(&format!("Bearer {access}")) {
        Ok(value) => {
            req.headers_mut().insert(AUTHORIZATION, value);
        }
        Err(e) => tracing::warn!(err = %e, "access token is not a valid header value"),
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
