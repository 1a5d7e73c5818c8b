//! # Auth Pipeline
//!
//! Attaches credentials to outbound calls and renews them with at most one
//! refresh in flight, however many requests are rejected at once.
//!
//! ## States
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │            sign_in                                                      │
//! │   ┌──────────────────────────────┐                                      │
//! │   │                              ▼                                      │
//! │ ┌─┴──────────────┐  401 /   ┌────────────────────────┐                  │
//! │ │Unauthenticated │  expired │     Authenticated      │                  │
//! │ └────────────────┘ ◄──┐     └───────────┬────────────┘                  │
//! │         ▲             │                 │ first 401 with the current    │
//! │         │ sign_out    │                 │ token (or expired session)    │
//! │         │             │                 ▼                               │
//! │         │             │     ┌────────────────────────┐                  │
//! │         │   refresh   └──── │ RefreshingSingleFlight │ ◄── later 401s   │
//! │         │   failed          │  waiters: [tx, tx, …]  │     join waiters │
//! │         │                   └───────────┬────────────┘                  │
//! │         │                               │ refresh ok                    │
//! │         │                               ▼                               │
//! │         │                   every waiter replays its request once       │
//! │         └────────────────────────────── Authenticated                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//! - While refreshing, no second refresh call is made; all callers wait on
//!   the same result.
//! - A replayed request that is rejected again surfaces as `AuthFailure`.
//! - A failed refresh ends the session: waiters are rejected, the vault is
//!   cleared and session-ended listeners fire. It is never retried here.
//! - The refresh runs in its own task, so dropping a waiting caller does not
//!   cancel it.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, Subscription};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};
use crate::vault::SessionStore;
use tether_core::{AuthSession, HttpMethod};

// =============================================================================
// Public Types
// =============================================================================

/// Observable state of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Authenticated,
    RefreshingSingleFlight,
    Unauthenticated,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEndReason {
    /// The refresh token was rejected or the refresh call failed.
    RefreshFailed,
    /// The host application signed the user out.
    SignedOut,
}

/// Payload delivered to session-ended listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnded {
    pub reason: SessionEndReason,
    pub error: Option<String>,
}

// =============================================================================
// Token Refresher
// =============================================================================

/// Exchanges a session's refresh token for a new session.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, session: &AuthSession) -> SyncResult<AuthSession>;
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Refresher that POSTs `{"refresh_token": …}` to the API.
///
/// Expects `{access_token, refresh_token?, expires_in?}` back. When the
/// server doesn't rotate the refresh token, the old one is kept; when it
/// omits `expires_in`, the access token's JWT `exp` claim is used.
pub struct HttpTokenRefresher {
    transport: Arc<dyn HttpTransport>,
    refresh_path: String,
}

impl HttpTokenRefresher {
    pub fn new(transport: Arc<dyn HttpTransport>, refresh_path: impl Into<String>) -> Self {
        HttpTokenRefresher {
            transport,
            refresh_path: refresh_path.into(),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, session: &AuthSession) -> SyncResult<AuthSession> {
        let request = HttpRequest::new(HttpMethod::Post, self.refresh_path.clone())
            .json(serde_json::json!({ "refresh_token": session.refresh_token }));

        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(SyncError::AuthFailure(format!(
                "refresh rejected with status {}",
                response.status
            )));
        }

        let body: RefreshResponse = response.json()?;
        let expires_at = body
            .expires_in
            .and_then(|secs| Utc::now().checked_add_signed(ChronoDuration::seconds(secs)))
            .or_else(|| jwt_expiry(&body.access_token));

        Ok(AuthSession {
            access_token: body.access_token,
            refresh_token: body
                .refresh_token
                .unwrap_or_else(|| session.refresh_token.clone()),
            expires_at,
            profile: session.profile.clone(),
        })
    }
}

#[derive(Deserialize)]
struct ExpiryClaim {
    #[serde(default)]
    exp: Option<i64>,
}

/// Reads the `exp` claim of a JWT without verifying its signature.
///
/// Only used to schedule a proactive refresh; the server stays authoritative.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data =
        jsonwebtoken::decode::<ExpiryClaim>(token, &DecodingKey::from_secret(&[]), &validation)
            .ok()?;

    data.claims
        .exp
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

// =============================================================================
// Pipeline
// =============================================================================

type Waiter = oneshot::Sender<SyncResult<String>>;

struct AuthInner {
    session: Option<AuthSession>,
    /// `Some` while a refresh is in flight.
    waiters: Option<Vec<Waiter>>,
    /// Bumped whenever the session is replaced or removed from outside a
    /// refresh, so a refresh that finishes afterwards is discarded.
    generation: u64,
}

struct PipelineShared {
    state: Mutex<AuthInner>,
    transport: Arc<dyn HttpTransport>,
    refresher: Arc<dyn TokenRefresher>,
    vault: Arc<dyn SessionStore>,
    session_ended: EventBus<SessionEnded>,
}

/// Authenticated request pipeline. Cheap to clone.
#[derive(Clone)]
pub struct AuthPipeline {
    shared: Arc<PipelineShared>,
}

impl AuthPipeline {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        refresher: Arc<dyn TokenRefresher>,
        vault: Arc<dyn SessionStore>,
    ) -> Self {
        AuthPipeline {
            shared: Arc::new(PipelineShared {
                state: Mutex::new(AuthInner {
                    session: None,
                    waiters: None,
                    generation: 0,
                }),
                transport,
                refresher,
                vault,
                session_ended: EventBus::new(),
            }),
        }
    }

    // =========================================================================
    // Session Lifecycle
    // =========================================================================

    /// Loads a persisted session, if any. Returns whether one was found.
    pub async fn restore(&self) -> SyncResult<bool> {
        let Some(session) = self.shared.vault.load()? else {
            debug!("No persisted session");
            return Ok(false);
        };

        self.install(session).await;
        info!("Session restored from vault");
        Ok(true)
    }

    /// Installs a new session and persists it.
    ///
    /// Callers already waiting on a refresh continue with the new token.
    pub async fn sign_in(&self, session: AuthSession) -> SyncResult<()> {
        self.shared.vault.save(&session)?;
        self.install(session).await;
        info!("Signed in");
        Ok(())
    }

    /// Replaces the session, discarding any refresh in flight and handing
    /// the new token to its waiters.
    async fn install(&self, session: AuthSession) {
        let token = session.access_token.clone();
        let waiters = {
            let mut state = self.shared.state.lock().await;
            state.session = Some(session);
            state.generation += 1;
            state.waiters.take()
        };

        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(Ok(token.clone()));
        }
    }

    /// Drops the session, clears the vault and notifies listeners.
    pub async fn sign_out(&self) -> SyncResult<()> {
        let (had_session, waiters) = {
            let mut state = self.shared.state.lock().await;
            state.generation += 1;
            (state.session.take().is_some(), state.waiters.take())
        };

        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(Err(SyncError::AuthFailure("signed out".into())));
        }

        self.shared.vault.clear()?;

        if had_session {
            info!("Signed out");
            self.shared.session_ended.emit(&SessionEnded {
                reason: SessionEndReason::SignedOut,
                error: None,
            });
        }
        Ok(())
    }

    pub async fn state(&self) -> AuthState {
        let state = self.shared.state.lock().await;
        match (&state.session, &state.waiters) {
            (None, _) => AuthState::Unauthenticated,
            (Some(_), Some(_)) => AuthState::RefreshingSingleFlight,
            (Some(_), None) => AuthState::Authenticated,
        }
    }

    pub async fn session(&self) -> Option<AuthSession> {
        self.shared.state.lock().await.session.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.shared.state.lock().await.session.is_some()
    }

    /// Registers a callback for involuntary and voluntary session ends.
    pub fn on_session_ended<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SessionEnded) + Send + Sync + 'static,
    {
        self.shared.session_ended.subscribe(listener)
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Sends `request` with the current bearer token.
    ///
    /// ## Returns
    /// * `Ok(response)` - any status except a 401 that survived one refresh
    /// * `Err(AuthFailure)` - no session, refresh failed, or rejected again
    /// * `Err(NetworkFailure | Timeout)` - from the transport
    pub async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        let token = self.usable_token().await?;

        let response = self.shared.transport.send(request.with_bearer(&token)).await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }

        debug!(path = %request.path, "Request rejected with 401");
        let fresh = self.token_after_rejection(&token).await?;

        let replay = self.shared.transport.send(request.with_bearer(&fresh)).await?;
        if replay.is_unauthorized() {
            warn!(path = %request.path, "Request rejected again after token refresh");
            return Err(SyncError::AuthFailure(
                "request rejected after token refresh".into(),
            ));
        }

        Ok(replay)
    }

    /// Token to attach to a new request. Waits on a refresh that is in
    /// flight, and starts one when the session has expired.
    async fn usable_token(&self) -> SyncResult<String> {
        let rx = {
            let mut state = self.shared.state.lock().await;
            let Some(session) = &state.session else {
                return Err(SyncError::AuthFailure("not signed in".into()));
            };
            if state.waiters.is_none() && !session.is_expired(Utc::now()) {
                return Ok(session.access_token.clone());
            }
            self.join_refresh(&mut state)?
        };

        Self::await_refresh(rx).await
    }

    /// Token to replay with after `rejected` got a 401.
    async fn token_after_rejection(&self, rejected: &str) -> SyncResult<String> {
        let rx = {
            let mut state = self.shared.state.lock().await;
            let Some(session) = &state.session else {
                return Err(SyncError::AuthFailure("session ended".into()));
            };
            if state.waiters.is_none() && session.access_token != rejected {
                // A refresh already completed after this request was sent.
                return Ok(session.access_token.clone());
            }
            self.join_refresh(&mut state)?
        };

        Self::await_refresh(rx).await
    }

    /// Registers a waiter, starting the refresh if none is in flight.
    fn join_refresh(&self, state: &mut AuthInner) -> SyncResult<oneshot::Receiver<SyncResult<String>>> {
        let (tx, rx) = oneshot::channel();

        match &mut state.waiters {
            Some(waiters) => {
                waiters.push(tx);
                debug!(waiting = waiters.len(), "Joined in-flight token refresh");
            }
            None => {
                let session = state
                    .session
                    .clone()
                    .ok_or_else(|| SyncError::AuthFailure("not signed in".into()))?;
                state.waiters = Some(vec![tx]);

                info!("Starting token refresh");
                let pipeline = self.clone();
                let generation = state.generation;
                tokio::spawn(async move { pipeline.run_refresh(session, generation).await });
            }
        }

        Ok(rx)
    }

    async fn await_refresh(rx: oneshot::Receiver<SyncResult<String>>) -> SyncResult<String> {
        rx.await
            .unwrap_or_else(|_| Err(SyncError::AuthFailure("token refresh abandoned".into())))
    }

    async fn run_refresh(&self, session: AuthSession, generation: u64) {
        let result = self.shared.refresher.refresh(&session).await;

        let waiters = {
            let mut state = self.shared.state.lock().await;
            if state.generation != generation {
                debug!("Session changed during refresh; discarding result");
                return;
            }
            let waiters = state.waiters.take().unwrap_or_default();
            match &result {
                Ok(refreshed) => state.session = Some(refreshed.clone()),
                Err(_) => {
                    state.session = None;
                    state.generation += 1;
                }
            }
            waiters
        };

        match result {
            Ok(refreshed) => {
                if let Err(e) = self.shared.vault.save(&refreshed) {
                    warn!(error = %e, "Refreshed session could not be persisted");
                }
                info!(waiters = waiters.len(), "Token refreshed");
                for waiter in waiters {
                    let _ = waiter.send(Ok(refreshed.access_token.clone()));
                }
            }
            Err(e) => {
                warn!(error = %e, waiters = waiters.len(), "Token refresh failed; ending session");
                if let Err(clear_err) = self.shared.vault.clear() {
                    warn!(error = %clear_err, "Session vault could not be cleared");
                }
                for waiter in waiters {
                    let _ = waiter.send(Err(SyncError::AuthFailure(format!(
                        "token refresh failed: {}",
                        e
                    ))));
                }
                self.shared.session_ended.emit(&SessionEnded {
                    reason: SessionEndReason::RefreshFailed,
                    error: Some(e.to_string()),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::MemoryVault;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Server that accepts exactly one bearer token.
    struct TokenCheckingServer {
        valid: StdMutex<String>,
        seen: StdMutex<Vec<(String, Option<String>)>>,
    }

    impl TokenCheckingServer {
        fn new(valid: &str) -> Arc<Self> {
            Arc::new(TokenCheckingServer {
                valid: StdMutex::new(valid.to_string()),
                seen: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn tokens(&self) -> Vec<Option<String>> {
            self.seen.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl HttpTransport for TokenCheckingServer {
        async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
            let auth = request.header_value("authorization").map(str::to_string);
            self.seen
                .lock()
                .unwrap()
                .push((request.path.clone(), auth.clone()));

            let expected = format!("Bearer {}", self.valid.lock().unwrap());
            if auth.as_deref() == Some(expected.as_str()) {
                Ok(HttpResponse::new(200).with_json(&serde_json::json!({ "path": request.path })))
            } else {
                Ok(HttpResponse::new(401))
            }
        }
    }

    /// Refresher that hands out `access-2` after a delay, or fails.
    struct SlowRefresher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl SlowRefresher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(SlowRefresher {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl TokenRefresher for SlowRefresher {
        async fn refresh(&self, session: &AuthSession) -> SyncResult<AuthSession> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                return Err(SyncError::AuthFailure("refresh token revoked".into()));
            }
            Ok(AuthSession::new("access-2", "refresh-2").with_profile(session.profile.clone()))
        }
    }

    async fn pipeline(
        server: &Arc<TokenCheckingServer>,
        refresher: &Arc<SlowRefresher>,
        vault: &Arc<MemoryVault>,
        session: Option<AuthSession>,
    ) -> AuthPipeline {
        let pipeline = AuthPipeline::new(server.clone(), refresher.clone(), vault.clone());
        if let Some(session) = session {
            pipeline.sign_in(session).await.unwrap();
        }
        pipeline
    }

    #[tokio::test]
    async fn test_attaches_bearer_token() {
        let server = TokenCheckingServer::new("access-1");
        let refresher = SlowRefresher::new(false);
        let vault = Arc::new(MemoryVault::new());
        let p = pipeline(&server, &refresher, &vault, Some(AuthSession::new("access-1", "r"))).await;

        let response = p.send(HttpRequest::get("/me")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(server.tokens(), vec![Some("Bearer access-1".to_string())]);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_401s_share_one_refresh() {
        let server = TokenCheckingServer::new("access-2");
        let refresher = SlowRefresher::new(false);
        let vault = Arc::new(MemoryVault::new());
        let p = pipeline(&server, &refresher, &vault, Some(AuthSession::new("access-1", "refresh-1"))).await;

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let p = p.clone();
                tokio::spawn(async move { p.send(HttpRequest::get(format!("/items/{}", i))).await })
            })
            .collect();

        for handle in handles {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(response.status, 200);
        }

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(server.calls(), 20);
        assert_eq!(p.state().await, AuthState::Authenticated);
        assert_eq!(vault.load().unwrap().unwrap().access_token, "access-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_rejects_all_and_ends_session() {
        let server = TokenCheckingServer::new("never");
        let refresher = SlowRefresher::new(true);
        let vault = Arc::new(MemoryVault::new());
        let p = pipeline(&server, &refresher, &vault, Some(AuthSession::new("access-1", "refresh-1"))).await;

        let ended = Arc::new(StdMutex::new(Vec::new()));
        let ended2 = Arc::clone(&ended);
        let _sub = p.on_session_ended(move |e| ended2.lock().unwrap().push(e.clone()));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let p = p.clone();
                tokio::spawn(async move { p.send(HttpRequest::get("/me")).await })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().unwrap_err().is_auth_error());
        }

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(p.state().await, AuthState::Unauthenticated);
        assert!(vault.load().unwrap().is_none());

        let ended = ended.lock().unwrap();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].reason, SessionEndReason::RefreshFailed);

        // No session: fails fast without touching the network.
        let before = server.calls();
        assert!(p.send(HttpRequest::get("/me")).await.unwrap_err().is_auth_error());
        assert_eq!(server.calls(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_rejected_again_is_auth_failure() {
        let server = TokenCheckingServer::new("something-else");
        let refresher = SlowRefresher::new(false);
        let vault = Arc::new(MemoryVault::new());
        let p = pipeline(&server, &refresher, &vault, Some(AuthSession::new("access-1", "refresh-1"))).await;

        let err = p.send(HttpRequest::get("/me")).await.unwrap_err();
        assert!(err.is_auth_error());
        assert_eq!(server.calls(), 2);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        // The refresh itself succeeded, so the session stays.
        assert_eq!(p.state().await, AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_rejection_of_stale_token_replays_without_refresh() {
        let server = TokenCheckingServer::new("access-2");
        let refresher = SlowRefresher::new(false);
        let vault = Arc::new(MemoryVault::new());
        let p = pipeline(&server, &refresher, &vault, Some(AuthSession::new("access-2", "r"))).await;

        let token = p.token_after_rejection("access-1").await.unwrap();
        assert_eq!(token, "access-2");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_refreshes_before_sending() {
        let server = TokenCheckingServer::new("access-2");
        let refresher = SlowRefresher::new(false);
        let vault = Arc::new(MemoryVault::new());
        let expired = AuthSession::new("access-1", "refresh-1")
            .with_expiry(Utc::now() - ChronoDuration::seconds(5));
        let p = pipeline(&server, &refresher, &vault, Some(expired)).await;

        p.send(HttpRequest::get("/me")).await.unwrap();

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(server.tokens(), vec![Some("Bearer access-2".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_during_refresh_wakes_waiters() {
        let server = TokenCheckingServer::new("manual");
        let refresher = SlowRefresher::new(true);
        let vault = Arc::new(MemoryVault::new());
        let p = pipeline(&server, &refresher, &vault, Some(AuthSession::new("access-1", "r"))).await;

        let sender = p.clone();
        let pending = tokio::spawn(async move { sender.send(HttpRequest::get("/me")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(p.state().await, AuthState::RefreshingSingleFlight);

        p.sign_in(AuthSession::new("manual", "r2")).await.unwrap();
        assert_eq!(pending.await.unwrap().unwrap().status, 200);

        // The stale refresh failure lands later and must not end the new session.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(p.state().await, AuthState::Authenticated);
        assert_eq!(vault.load().unwrap().unwrap().access_token, "manual");
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_during_refresh_wakes_waiters() {
        let server = TokenCheckingServer::new("stored");
        let refresher = SlowRefresher::new(true);
        let vault = Arc::new(MemoryVault::new());
        let p = pipeline(&server, &refresher, &vault, Some(AuthSession::new("access-1", "r"))).await;

        let sender = p.clone();
        let pending = tokio::spawn(async move { sender.send(HttpRequest::get("/me")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(p.state().await, AuthState::RefreshingSingleFlight);

        vault.save(&AuthSession::new("stored", "r2")).unwrap();
        assert!(p.restore().await.unwrap());

        let response = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("waiter was not woken")
            .unwrap()
            .unwrap();
        assert_eq!(response.status, 200);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(p.state().await, AuthState::Authenticated);
        assert_eq!(p.session().await.unwrap().access_token, "stored");
    }

    #[tokio::test]
    async fn test_sign_out_and_restore() {
        let server = TokenCheckingServer::new("access-1");
        let refresher = SlowRefresher::new(false);
        let vault = Arc::new(MemoryVault::new());
        let p = pipeline(&server, &refresher, &vault, Some(AuthSession::new("access-1", "r"))).await;

        let ended = Arc::new(AtomicUsize::new(0));
        let ended2 = Arc::clone(&ended);
        let _sub = p.on_session_ended(move |e| {
            assert_eq!(e.reason, SessionEndReason::SignedOut);
            ended2.fetch_add(1, Ordering::SeqCst);
        });

        p.sign_out().await.unwrap();
        p.sign_out().await.unwrap();
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        assert!(!p.is_authenticated().await);

        vault.save(&AuthSession::new("access-1", "r")).unwrap();
        let fresh = AuthPipeline::new(server.clone(), refresher.clone(), vault.clone());
        assert!(fresh.restore().await.unwrap());
        assert_eq!(fresh.state().await, AuthState::Authenticated);
    }

    // =========================================================================
    // HttpTokenRefresher
    // =========================================================================

    struct CannedTransport {
        response: HttpResponse,
        requests: StdMutex<Vec<HttpRequest>>,
    }

    #[async_trait]
    impl HttpTransport for CannedTransport {
        async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            Ok(self.response.clone())
        }
    }

    fn canned(response: HttpResponse) -> Arc<CannedTransport> {
        Arc::new(CannedTransport {
            response,
            requests: StdMutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_http_refresher_posts_refresh_token() {
        let transport = canned(HttpResponse::new(200).with_json(&serde_json::json!({
            "access_token": "new-access",
            "expires_in": 3600
        })));
        let refresher = HttpTokenRefresher::new(transport.clone(), "/auth/refresh");
        let old = AuthSession::new("old-access", "old-refresh")
            .with_profile(serde_json::json!({ "user_id": 1 }));

        let new = refresher.refresh(&old).await.unwrap();

        assert_eq!(new.access_token, "new-access");
        assert_eq!(new.refresh_token, "old-refresh");
        assert_eq!(new.profile, old.profile);
        assert!(new.expires_at.unwrap() > Utc::now() + ChronoDuration::seconds(3500));

        let sent = transport.requests.lock().unwrap();
        assert_eq!(sent[0].path, "/auth/refresh");
        assert_eq!(sent[0].method, HttpMethod::Post);
        assert_eq!(sent[0].body.as_ref().unwrap()["refresh_token"], "old-refresh");
        assert!(sent[0].header_value("authorization").is_none());
    }

    #[tokio::test]
    async fn test_http_refresher_rejection() {
        let refresher = HttpTokenRefresher::new(canned(HttpResponse::new(400)), "/auth/refresh");
        let err = refresher
            .refresh(&AuthSession::new("a", "r"))
            .await
            .unwrap_err();
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn test_http_refresher_falls_back_to_jwt_exp() {
        let exp = Utc::now().timestamp() + 900;
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &serde_json::json!({ "sub": "7", "exp": exp }),
            &jsonwebtoken::EncodingKey::from_secret(b"server-secret"),
        )
        .unwrap();

        let transport = canned(HttpResponse::new(200).with_json(&serde_json::json!({
            "access_token": token,
            "refresh_token": "rotated"
        })));
        let refresher = HttpTokenRefresher::new(transport, "/auth/refresh");

        let new = refresher.refresh(&AuthSession::new("a", "r")).await.unwrap();
        assert_eq!(new.refresh_token, "rotated");
        assert_eq!(new.expires_at.unwrap().timestamp(), exp);
    }

    #[test]
    fn test_jwt_expiry_of_garbage_is_none() {
        assert_eq!(jwt_expiry("not-a-jwt"), None);
    }
}
