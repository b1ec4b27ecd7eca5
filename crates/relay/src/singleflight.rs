// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-client single-flight refresh coordination.
//!
//! Concurrent callers inside one client must share a single refresh attempt:
//! the server accepts each refresh token exactly once, so a duplicate
//! redemption kills the session. The coordinator runs the documented
//! tri-state machine `Idle → Creating → Inflight → Idle`; the in-use marker
//! pins the refresh token currently being redeemed and is handed to the
//! executor, which advances it on mid-flight rotation.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;

use crate::config::RelayConfig;
use crate::lock::{fingerprint, LockManager};
use crate::refresh::RefreshExecutor;
use crate::store::{TokenPair, TokenStore};

type SharedFlight = Shared<BoxFuture<'static, Option<TokenPair>>>;

enum FlightState {
    Idle,
    /// A caller decided to refresh but hasn't stored the flight yet.
    Creating,
    Inflight(SharedFlight),
}

/// The refresh token currently being redeemed by this client's in-flight
/// refresh. While set, no new redemption of the same value may start.
#[derive(Clone, Default)]
pub struct InUseMarker(Arc<parking_lot::Mutex<Option<String>>>);

impl InUseMarker {
    pub fn set(&self, token: &str) {
        *self.0.lock() = Some(token.to_owned());
    }

    pub fn get(&self) -> Option<String> {
        self.0.lock().clone()
    }

    /// Clear only if still pointing at `token` — a concurrent successful
    /// refresh may have advanced it to a newer token, which must survive.
    pub fn clear_if(&self, token: &str) {
        let mut guard = self.0.lock();
        if guard.as_deref() == Some(token) {
            *guard = None;
        }
    }
}

enum Claim {
    Won,
    Join(SharedFlight),
    Stalled,
}

/// Deduplicates refresh attempts within one client.
pub struct RefreshCoordinator {
    state: parking_lot::Mutex<FlightState>,
    marker: InUseMarker,
    tokens: Arc<TokenStore>,
    lock: Arc<LockManager>,
    executor: Arc<RefreshExecutor>,
    recheck_delay: Duration,
}

impl RefreshCoordinator {
    pub fn new(
        tokens: Arc<TokenStore>,
        lock: Arc<LockManager>,
        executor: Arc<RefreshExecutor>,
        config: &RelayConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: parking_lot::Mutex::new(FlightState::Idle),
            marker: InUseMarker::default(),
            tokens,
            lock,
            executor,
            recheck_delay: config.creating_recheck_delay(),
        })
    }

    /// The in-use marker shared with the executor.
    pub fn marker(&self) -> InUseMarker {
        self.marker.clone()
    }

    /// Request a refreshed token pair.
    ///
    /// Joins an in-flight refresh when one exists; otherwise starts one.
    /// `None` means no new pair: no refresh token stored, a concurrent
    /// creation stalled, or the attempt itself failed (fatal failures have
    /// already terminated the session by the time this returns).
    pub async fn request_refresh(self: &Arc<Self>) -> Option<TokenPair> {
        let token = {
            // Join any flight that already exists before reading the store.
            let claim = {
                let state = self.state.lock();
                match &*state {
                    FlightState::Inflight(flight) => Claim::Join(flight.clone()),
                    FlightState::Creating => Claim::Stalled,
                    FlightState::Idle => Claim::Won,
                }
            };
            match claim {
                Claim::Join(flight) => return flight.await,
                Claim::Stalled => return self.join_creating().await,
                Claim::Won => {}
            }

            match self.tokens.read() {
                Some(pair) if !pair.refresh.is_empty() => pair.refresh,
                _ => {
                    tracing::debug!("refresh requested but no refresh token is stored");
                    return None;
                }
            }
        };

        // Claim the flight. Another caller may have won since the check
        // above; the marker equality case (same token already being
        // redeemed) is the Inflight branch here.
        let claim = {
            let mut state = self.state.lock();
            match &*state {
                FlightState::Inflight(flight) => Claim::Join(flight.clone()),
                FlightState::Creating => Claim::Stalled,
                FlightState::Idle => {
                    // Marker is set synchronously with the state transition,
                    // before any await, closing the window where two
                    // near-simultaneous callers both decide to refresh.
                    *state = FlightState::Creating;
                    self.marker.set(&token);
                    Claim::Won
                }
            }
        };
        match claim {
            Claim::Join(flight) => return flight.await,
            Claim::Stalled => return self.join_creating().await,
            Claim::Won => {}
        }

        let flight = self.build_flight(token);
        *self.state.lock() = FlightState::Inflight(flight.clone());
        flight.await
    }

    /// A concurrent caller is between "decided to refresh" and "flight
    /// stored": yield once, re-check, and give up rather than spin or start
    /// a duplicate.
    async fn join_creating(self: &Arc<Self>) -> Option<TokenPair> {
        tokio::time::sleep(self.recheck_delay).await;
        let flight = {
            let state = self.state.lock();
            match &*state {
                FlightState::Inflight(flight) => Some(flight.clone()),
                _ => None,
            }
        };
        match flight {
            Some(flight) => flight.await,
            None => {
                tracing::debug!("refresh flight never materialized, giving up this attempt");
                None
            }
        }
    }

    fn build_flight(self: &Arc<Self>, token: String) -> SharedFlight {
        let this = Arc::clone(self);
        async move {
            let fp = fingerprint(&token);
            if this.lock.is_held_by_other(&fp) {
                this.lock.wait_for_release(&fp).await;
            }
            if !this.lock.try_acquire(&fp) {
                // Liveness over strict exclusion: refresh anyway.
                tracing::warn!("refreshing without the cross-client lock");
            }

            let result = this.executor.execute(token.clone(), &this.marker).await;

            // Guaranteed cleanup, success or failure.
            this.lock.release();
            *this.state.lock() = FlightState::Idle;
            this.marker.clear_if(&token);
            result
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
#[path = "singleflight_tests.rs"]
mod tests;
