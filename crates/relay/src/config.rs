// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Configuration for a token relay instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base URL of the API, e.g. `https://api.example.com`.
    pub base_url: String,

    /// Path of the token refresh endpoint.
    pub refresh_path: String,

    /// Path prefixes that never carry a bearer token and never trigger
    /// refresh-and-retry (signup, login, OTP, the refresh endpoint itself).
    pub public_paths: Vec<String>,

    /// Age in milliseconds after which a cross-client refresh lock is
    /// considered abandoned and may be force-cleared by any client.
    pub lock_stale_ms: u64,

    /// Poll interval in milliseconds while waiting for another client's lock.
    pub lock_poll_ms: u64,

    /// Ceiling in milliseconds on the lock wait; after this the refresh
    /// proceeds without exclusion.
    pub lock_wait_ceiling_ms: u64,

    /// Delay in milliseconds before re-checking a flight another caller is
    /// still in the middle of creating.
    pub creating_recheck_ms: u64,

    /// HTTP client timeout in seconds.
    pub http_timeout_secs: u64,

    /// Maximum retained session diagnostic entries.
    pub diagnostics_capacity: usize,
}

impl RelayConfig {
    /// Config with defaults for everything but the API base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            refresh_path: "/auth/refresh/".to_owned(),
            public_paths: vec![
                "/auth/signup/".to_owned(),
                "/auth/login/".to_owned(),
                "/auth/otp/send/".to_owned(),
                "/auth/otp/verify/".to_owned(),
                "/auth/refresh/".to_owned(),
            ],
            lock_stale_ms: 10_000,
            lock_poll_ms: 200,
            lock_wait_ceiling_ms: 5_000,
            creating_recheck_ms: 50,
            http_timeout_secs: 30,
            diagnostics_capacity: 20,
        }
    }

    /// Full URL of the refresh endpoint.
    pub fn refresh_url(&self) -> String {
        self.api_url(&self.refresh_path)
    }

    /// Join a request path onto the base URL.
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Whether a request path is on the unauthenticated allow-list.
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| path.starts_with(p.as_str()))
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_millis(self.lock_stale_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms)
    }

    pub fn lock_wait_ceiling(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ceiling_ms)
    }

    pub fn creating_recheck_delay(&self) -> Duration {
        Duration::from_millis(self.creating_recheck_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
