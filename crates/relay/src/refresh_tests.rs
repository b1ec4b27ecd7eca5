// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use super::*;
use crate::events::SessionEvent;
use crate::identity::ClientIdentity;
use crate::lock::LockManager;
use crate::store::memory::MemoryStore;
use crate::store::{KeyValueStore, SharedStore};

/// Mock refresh endpoint returning canned `(status, body)` responses in
/// order (the last repeats), counting calls and capturing request bodies.
async fn mock_refresh_server(
    responses: Vec<(u16, String)>,
) -> (SocketAddr, Arc<AtomicU32>, Arc<parking_lot::Mutex<Vec<String>>>) {
    let call_count = Arc::new(AtomicU32::new(0));
    let bodies = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let count_clone = Arc::clone(&call_count);
    let bodies_clone = Arc::clone(&bodies);
    let responses = Arc::new(responses);

    let app = Router::new().route(
        "/auth/refresh/",
        post(move |body: String| {
            let count = Arc::clone(&count_clone);
            let bodies = Arc::clone(&bodies_clone);
            let resps = Arc::clone(&responses);
            async move {
                bodies.lock().push(body);
                let idx = count.fetch_add(1, Ordering::Relaxed) as usize;
                let (status, body) = if idx < resps.len() {
                    resps[idx].clone()
                } else {
                    resps.last().cloned().unwrap_or((500, "{}".to_owned()))
                };
                (
                    axum::http::StatusCode::from_u16(status)
                        .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR),
                    body,
                )
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    (addr, call_count, bodies)
}

/// Unsigned JWT with the given `exp` claim, decodable by `decode_exp`.
fn make_jwt(exp: u64) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::json!({ "exp": exp }).to_string());
    format!("{header}.{payload}.sig")
}

struct Harness {
    kv: Arc<MemoryStore>,
    tokens: Arc<TokenStore>,
    terminator: Arc<SessionTerminator>,
    executor: Arc<RefreshExecutor>,
    event_rx: broadcast::Receiver<SessionEvent>,
}

fn harness(addr: SocketAddr) -> Harness {
    let kv = MemoryStore::new();
    let shared: Arc<dyn SharedStore> = Arc::clone(&kv) as Arc<dyn SharedStore>;
    let config = RelayConfig::new(format!("http://{addr}"));
    let lock = LockManager::new(Arc::clone(&shared), ClientIdentity::ephemeral(), &config);
    let tokens = TokenStore::new(Arc::clone(&shared), lock);
    let (event_tx, event_rx) = broadcast::channel(16);
    let terminator = SessionTerminator::new(Arc::clone(&shared), Arc::clone(&tokens), event_tx.clone(), 20);
    let executor = RefreshExecutor::new(
        reqwest::Client::new(),
        config,
        Arc::clone(&tokens),
        Arc::clone(&terminator),
        event_tx,
    );
    Harness { kv, tokens, terminator, executor, event_rx }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[test]
fn refresh_endpoint_401_is_fatal() {
    assert_eq!(classify_refresh_failure(401, ""), RefreshFailure::TokenInvalid);
    assert!(RefreshFailure::TokenInvalid.is_fatal());
}

#[test]
fn simplejwt_token_not_valid_is_fatal() {
    let body = r#"{"detail":"Token is invalid or expired","code":"token_not_valid"}"#;
    assert_eq!(classify_refresh_failure(400, body), RefreshFailure::TokenInvalid);
}

#[test]
fn blacklisted_refresh_token_is_fatal() {
    let body = r#"{"detail":"Token is blacklisted"}"#;
    assert_eq!(classify_refresh_failure(400, body), RefreshFailure::TokenInvalid);
}

#[test]
fn unrelated_400_is_not_fatal() {
    let body = r#"{"detail":"This field is required."}"#;
    assert_eq!(classify_refresh_failure(400, body), RefreshFailure::ClientError);
    assert!(!RefreshFailure::ClientError.is_fatal());
}

#[test]
fn server_errors_are_transport() {
    assert_eq!(classify_refresh_failure(500, "oops"), RefreshFailure::Transport);
    assert_eq!(classify_refresh_failure(503, ""), RefreshFailure::Transport);
}

#[test]
fn non_json_400_falls_back_to_raw_body() {
    assert_eq!(
        classify_refresh_failure(400, "refresh token already used"),
        RefreshFailure::TokenInvalid
    );
}

// ---------------------------------------------------------------------------
// JWT expiry decode
// ---------------------------------------------------------------------------

#[test]
fn decode_exp_reads_the_claim() {
    assert_eq!(decode_exp(&make_jwt(1_900_000_000)), Some(1_900_000_000));
}

#[test]
fn decode_exp_tolerates_non_jwt_tokens() {
    assert_eq!(decode_exp("opaque-refresh-token"), None);
    assert_eq!(decode_exp("a.!!!.c"), None);
    assert_eq!(decode_exp(""), None);
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[tokio::test]
async fn success_commits_pair_and_carries_user_forward() {
    let success = serde_json::json!({ "access": "acc-2", "refresh": "ref-2" }).to_string();
    let (addr, count, bodies) = mock_refresh_server(vec![(200, success)]).await;
    let h = harness(addr);

    let user = serde_json::json!({"id": 1, "email": "x@y.z"});
    h.tokens
        .write(&TokenPair::new("acc-1", "ref-1").with_user(user.clone()))
        .expect("seed");

    let marker = InUseMarker::default();
    marker.set("ref-1");
    let pair = h.executor.execute("ref-1".to_owned(), &marker).await.expect("pair");

    assert_eq!(count.load(Ordering::Relaxed), 1);
    assert_eq!(pair.access, "acc-2");
    assert_eq!(pair.refresh, "ref-2");
    assert_eq!(pair.user, Some(user.clone()));

    let stored = h.tokens.read().expect("stored");
    assert_eq!(stored, pair);
    // User identity survives the refresh bit-for-bit.
    assert_eq!(stored.user, Some(user));
    // Marker advanced to the rotated token.
    assert_eq!(marker.get().as_deref(), Some("ref-2"));

    let body: serde_json::Value =
        serde_json::from_str(&bodies.lock()[0]).expect("request body json");
    assert_eq!(body.get("refresh").and_then(|v| v.as_str()), Some("ref-1"));
}

#[tokio::test]
async fn superseded_token_is_never_redeemed() {
    let success = serde_json::json!({ "access": "acc-3", "refresh": "ref-3" }).to_string();
    let (addr, _count, bodies) = mock_refresh_server(vec![(200, success)]).await;
    let h = harness(addr);

    // Another client rotated to ref-2 while our flight was queueing on ref-1.
    h.tokens.write(&TokenPair::new("acc-2", "ref-2")).expect("seed");

    let marker = InUseMarker::default();
    marker.set("ref-1");
    h.executor.execute("ref-1".to_owned(), &marker).await.expect("pair");

    let body: serde_json::Value =
        serde_json::from_str(&bodies.lock()[0]).expect("request body json");
    assert_eq!(body.get("refresh").and_then(|v| v.as_str()), Some("ref-2"));
}

#[tokio::test]
async fn locally_expired_token_terminates_without_network() {
    let (addr, count, _bodies) = mock_refresh_server(vec![(200, "{}".to_owned())]).await;
    let h = harness(addr);

    let dead = make_jwt(now_secs() - 60);
    h.tokens.write(&TokenPair::new("acc", &dead)).expect("seed");

    let marker = InUseMarker::default();
    let result = h.executor.execute(dead, &marker).await;

    assert!(result.is_none());
    assert_eq!(count.load(Ordering::Relaxed), 0, "no round trip for a dead token");
    assert!(h.tokens.read().is_none(), "session wiped");

    let diags = h.terminator.recent_diagnostics();
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].reason, TerminateReason::RefreshTokenExpired);
}

#[tokio::test]
async fn rejected_token_terminates_exactly_once() {
    let body = r#"{"detail":"Token is invalid or expired","code":"token_not_valid"}"#;
    let (addr, count, _bodies) = mock_refresh_server(vec![(401, body.to_owned())]).await;
    let mut h = harness(addr);

    h.tokens.write(&TokenPair::new("acc", "ref-dead")).expect("seed");

    let marker = InUseMarker::default();
    assert!(h.executor.execute("ref-dead".to_owned(), &marker).await.is_none());
    assert_eq!(count.load(Ordering::Relaxed), 1);
    assert!(h.tokens.read().is_none());
    assert_eq!(h.terminator.recent_diagnostics().len(), 1);

    // A second attempt has no stored token and is a no-op for the terminator.
    assert!(h.executor.execute("ref-dead".to_owned(), &marker).await.is_none());
    assert_eq!(h.terminator.recent_diagnostics().len(), 1);

    let mut saw_terminated = 0;
    while let Ok(event) = h.event_rx.try_recv() {
        if matches!(event, SessionEvent::Terminated { .. }) {
            saw_terminated += 1;
        }
    }
    assert_eq!(saw_terminated, 1);
}

#[tokio::test]
async fn transient_network_failure_keeps_tokens() {
    // Nothing listens here; the request fails at the transport level.
    let addr: SocketAddr = "127.0.0.1:9".parse().expect("addr");
    let h = harness(addr);

    h.tokens.write(&TokenPair::new("acc-1", "ref-1")).expect("seed");

    let marker = InUseMarker::default();
    assert!(h.executor.execute("ref-1".to_owned(), &marker).await.is_none());

    let stored = h.tokens.read().expect("still there");
    assert_eq!(stored.refresh, "ref-1");
    assert!(h.terminator.recent_diagnostics().is_empty(), "no termination for transport errors");
}

#[tokio::test]
async fn unrelated_client_error_keeps_tokens() {
    let body = r#"{"detail":"This field is required."}"#;
    let (addr, _count, _bodies) = mock_refresh_server(vec![(400, body.to_owned())]).await;
    let h = harness(addr);

    h.tokens.write(&TokenPair::new("acc-1", "ref-1")).expect("seed");

    let marker = InUseMarker::default();
    assert!(h.executor.execute("ref-1".to_owned(), &marker).await.is_none());
    assert!(h.tokens.read().is_some());
    assert!(h.terminator.recent_diagnostics().is_empty());
}

#[tokio::test]
async fn partial_success_body_commits_nothing() {
    let partial = serde_json::json!({ "access": "acc-2", "refresh": "" }).to_string();
    let (addr, _count, _bodies) = mock_refresh_server(vec![(200, partial)]).await;
    let h = harness(addr);

    h.tokens.write(&TokenPair::new("acc-1", "ref-1")).expect("seed");

    let marker = InUseMarker::default();
    assert!(h.executor.execute("ref-1".to_owned(), &marker).await.is_none());

    let stored = h.tokens.read().expect("unchanged");
    assert_eq!(stored.access, "acc-1");
    assert_eq!(stored.refresh, "ref-1");
}

#[tokio::test]
async fn kv_is_left_clean_of_lock_after_success() {
    let success = serde_json::json!({ "access": "a2", "refresh": "r2" }).to_string();
    let (addr, _count, _bodies) = mock_refresh_server(vec![(200, success)]).await;
    let h = harness(addr);

    h.tokens.write(&TokenPair::new("a1", "r1")).expect("seed");
    let marker = InUseMarker::default();
    h.executor.execute("r1".to_owned(), &marker).await.expect("pair");

    assert!(h.kv.get(crate::lock::LOCK_KEY).is_none());
}
