//! Auth session: sign-in state against a remote identity provider.
//!
//! ```text
//! SignedOut ──sign_in──▶ SigningIn ──token──▶ SignedIn
//!     ▲                      │                   │
//!     └──── denied/timeout ──┘                   │
//!     └────────────── sign_out / revocation ─────┘
//! ```
//!
//! Auto-login bookkeeping (`<prefix>auto_login`, `<prefix>last_login`) is
//! written to the local store only, so re-enabling silent sign-in never
//! depends on remote availability.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::local::LocalStore;

/// Bearer token issued by the identity provider.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    secret: String,
    expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Token source supplied by the embedding application.
///
/// `silent` requests must not show any consent UI; they either succeed from
/// an existing grant or fail.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn request_token(&self, silent: bool) -> Result<AccessToken>;

    async fn revoke_token(&self, token: &AccessToken) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    SignedOut,
    SigningIn,
    SignedIn,
}

struct SessionInner {
    state: AuthState,
    token: Option<AccessToken>,
}

/// Returns a dropped, unfinished sign-in attempt to `SignedOut`.
struct PendingSignIn<'a>(&'a AuthSession);

impl Drop for PendingSignIn<'_> {
    fn drop(&mut self) {
        let mut inner = self.0.lock_inner();
        if inner.state == AuthState::SigningIn {
            inner.state = AuthState::SignedOut;
            inner.token = None;
        }
    }
}

pub struct AuthSession {
    provider: Arc<dyn IdentityProvider>,
    local: Arc<LocalStore>,
    inner: Mutex<SessionInner>,
    // Serializes sign-in attempts so concurrent callers share one outcome.
    sign_in_gate: tokio::sync::Mutex<()>,
}

impl AuthSession {
    pub fn new(provider: Arc<dyn IdentityProvider>, local: Arc<LocalStore>) -> Self {
        Self {
            provider,
            local,
            inner: Mutex::new(SessionInner {
                state: AuthState::SignedOut,
                token: None,
            }),
            sign_in_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, state: AuthState, token: Option<AccessToken>) {
        let mut inner = self.lock_inner();
        if inner.state != state {
            tracing::debug!(from = ?inner.state, to = ?state, "auth state change");
        }
        inner.state = state;
        inner.token = token;
    }

    pub fn state(&self) -> AuthState {
        self.lock_inner().state
    }

    pub fn is_signed_in(&self) -> bool {
        let inner = self.lock_inner();
        inner.state == AuthState::SignedIn
            && inner.token.as_ref().is_some_and(|token| !token.is_expired())
    }

    /// Current bearer token, if signed in and not expired.
    pub fn token(&self) -> Option<AccessToken> {
        let inner = self.lock_inner();
        match (&inner.state, &inner.token) {
            (AuthState::SignedIn, Some(token)) if !token.is_expired() => Some(token.clone()),
            _ => None,
        }
    }

    pub fn auto_login_enabled(&self) -> bool {
        let key = self.local.schema().auto_login_key();
        matches!(self.local.load(&key), Some(Value::Bool(true)))
    }

    pub fn set_auto_login(&self, enabled: bool) {
        let key = self.local.schema().auto_login_key();
        self.local.save(&key, &Value::Bool(enabled));
    }

    /// Time of the last successful sign-in on this device.
    pub fn last_login(&self) -> Option<DateTime<Utc>> {
        let key = self.local.schema().last_login_key();
        self.local
            .load(&key)
            .and_then(|value| value.as_i64())
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
    }

    pub fn has_logged_in_before(&self) -> bool {
        self.local.has(&self.local.schema().last_login_key())
    }

    fn record_success(&self) {
        let key = self.local.schema().last_login_key();
        self.local
            .save(&key, &Value::from(Utc::now().timestamp_millis()));
        self.set_auto_login(true);
    }

    /// Request a token, bounded by `timeout`.
    ///
    /// Denial and timeout both leave the session signed out and disable
    /// auto-login so later startups do not repeat a hanging attempt.
    pub async fn sign_in(&self, silent: bool, timeout: Duration) -> bool {
        let _gate = self.sign_in_gate.lock().await;
        if self.is_signed_in() {
            return true;
        }

        self.transition(AuthState::SigningIn, None);
        let _pending = PendingSignIn(self);
        match tokio::time::timeout(timeout, self.provider.request_token(silent)).await {
            Ok(Ok(token)) => {
                self.transition(AuthState::SignedIn, Some(token));
                self.record_success();
                tracing::info!(silent, "signed in");
                true
            }
            Ok(Err(err)) => {
                self.transition(AuthState::SignedOut, None);
                self.set_auto_login(false);
                tracing::warn!(silent, error = %err, "sign-in failed");
                false
            }
            Err(_) => {
                self.transition(AuthState::SignedOut, None);
                self.set_auto_login(false);
                tracing::warn!(silent, timeout_ms = timeout.as_millis() as u64, "sign-in timed out");
                false
            }
        }
    }

    /// Explicit sign-out: revoke the token (best effort) and forget the login.
    pub async fn sign_out(&self) {
        let token = self.lock_inner().token.clone();
        if let Some(token) = token {
            if let Err(err) = self.provider.revoke_token(&token).await {
                tracing::warn!(error = %err, "token revocation failed");
            }
        }
        self.forget_login();
        tracing::info!("signed out");
    }

    /// The provider revoked the token on its own; same transition as sign-out.
    pub fn handle_revocation(&self) {
        self.forget_login();
        tracing::info!("token revoked by provider");
    }

    fn forget_login(&self) {
        self.transition(AuthState::SignedOut, None);
        self.set_auto_login(false);
        self.local.delete(&self.local.schema().last_login_key());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::MemoryMedium;
    use crate::schema::KeySchema;
    use crate::testing::ScriptedIdentity;

    fn session(identity: &ScriptedIdentity) -> AuthSession {
        let local = Arc::new(LocalStore::new(
            MemoryMedium::new(),
            Arc::new(KeySchema::new("game_")),
        ));
        AuthSession::new(Arc::new(identity.clone()), local)
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_sign_in_records_login() {
        let identity = ScriptedIdentity::granting("tok");
        let session = session(&identity);
        assert_eq!(session.state(), AuthState::SignedOut);

        assert!(session.sign_in(false, Duration::from_secs(5)).await);
        assert_eq!(session.state(), AuthState::SignedIn);
        assert_eq!(session.token().unwrap().secret(), "tok");
        assert!(session.auto_login_enabled());
        assert!(session.has_logged_in_before());
        assert!(session.last_login().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_sign_in_disables_auto_login() {
        let identity = ScriptedIdentity::denying();
        let session = session(&identity);
        session.set_auto_login(true);

        assert!(!session.sign_in(true, Duration::from_secs(5)).await);
        assert_eq!(session.state(), AuthState::SignedOut);
        assert!(!session.auto_login_enabled());
        assert_eq!(identity.requests(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_sign_in_disables_auto_login() {
        let identity = ScriptedIdentity::granting("tok").with_delay(Duration::from_millis(6000));
        let session = session(&identity);
        session.set_auto_login(true);

        assert!(!session.sign_in(true, Duration::from_millis(5000)).await);
        assert!(!session.is_signed_in());
        assert!(!session.auto_login_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sign_in_requests_one_token() {
        let identity = ScriptedIdentity::granting("tok").with_delay(Duration::from_millis(100));
        let session = Arc::new(session(&identity));

        let a = tokio::spawn({
            let session = session.clone();
            async move { session.sign_in(false, Duration::from_secs(5)).await }
        });
        let b = tokio::spawn({
            let session = session.clone();
            async move { session.sign_in(false, Duration::from_secs(5)).await }
        });
        assert!(a.await.unwrap());
        assert!(b.await.unwrap());
        assert_eq!(identity.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_revokes_and_forgets() {
        let identity = ScriptedIdentity::granting("tok");
        let session = session(&identity);
        session.sign_in(false, Duration::from_secs(5)).await;

        session.sign_out().await;
        assert_eq!(session.state(), AuthState::SignedOut);
        assert!(session.token().is_none());
        assert!(!session.auto_login_enabled());
        assert!(!session.has_logged_in_before());
        assert_eq!(identity.revoked(), vec!["tok".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revocation_signs_out_without_calling_provider() {
        let identity = ScriptedIdentity::granting("tok");
        let session = session(&identity);
        session.sign_in(true, Duration::from_secs(5)).await;

        session.handle_revocation();
        assert!(!session.is_signed_in());
        assert!(identity.revoked().is_empty());
    }

    #[test]
    fn test_expired_token_is_not_signed_in() {
        let token = AccessToken::new("old").with_expiry(Utc::now() - chrono::Duration::seconds(1));
        assert!(token.is_expired());
        assert!(!format!("{:?}", token).contains("old"));
    }
}
