//! The credential broker.
//!
//! Holds the one live [`Credential`] for the process, refreshes it when it is
//! about to expire, and runs the out-of-band authorization-code exchange. Tool
//! calls never wait on a human: when no usable token exists the broker opens an
//! authorization request and fails fast with the URL to visit.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;

use super::oauth::{OAuthClient, Pkce, TokenEndpointError};
use super::store::{StoreError, TokenStore};
use super::{AuthError, AuthState, Credential};

type RefreshFuture = Shared<BoxFuture<'static, Result<Credential, AuthError>>>;

/// An open authorization-code request. The PKCE verifier stays inside the
/// broker; only what the user needs is exposed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    pub expires_at: DateTime<Utc>,
}

struct PendingAuthorization {
    request: AuthorizationRequest,
    verifier: String,
}

/// Cheaply cloneable handle to the process-wide credential state.
#[derive(Clone)]
pub struct CredentialBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    oauth: OAuthClient,
    store: Arc<dyn TokenStore>,
    margin: Duration,
    authorize_ttl: Duration,
    credential: Mutex<Option<Credential>>,
    /// Access token an upstream API answered 401 for.
    rejected_access_token: Mutex<Option<String>>,
    state: Mutex<AuthState>,
    pending: Mutex<Option<PendingAuthorization>>,
    inflight: Mutex<Option<RefreshFuture>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CredentialBroker {
    /// `margin` is how long before expiry a token counts as stale;
    /// `authorize_ttl` bounds how long an authorization request stays open.
    pub fn new(
        oauth: OAuthClient,
        store: Arc<dyn TokenStore>,
        margin: std::time::Duration,
        authorize_ttl: std::time::Duration,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                oauth,
                store,
                margin: Duration::from_std(margin).unwrap_or_else(|_| Duration::seconds(60)),
                authorize_ttl: Duration::from_std(authorize_ttl).unwrap_or_else(|_| Duration::minutes(5)),
                credential: Mutex::new(None),
                rejected_access_token: Mutex::new(None),
                state: Mutex::new(AuthState::Unauthenticated),
                pending: Mutex::new(None),
                inflight: Mutex::new(None),
            }),
        }
    }

    /// Return a credential valid for at least the safety margin.
    ///
    /// Concurrent callers that miss the fast path share one in-flight
    /// acquisition, so at most one request reaches the token endpoint and every
    /// waiter sees the same outcome.
    pub async fn get_credential(&self) -> Result<Credential, AuthError> {
        if let Some(credential) = self.inner.fresh_in_memory() {
            return Ok(credential);
        }

        let flight = {
            let mut slot = lock(&self.inner.inflight);
            match slot.as_ref() {
                Some(flight) => flight.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let flight = async move {
                        let result = inner.acquire().await;
                        *lock(&inner.inflight) = None;
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };

        flight.await
    }

    /// Open an authorization request, or return the pending one if it has not
    /// expired yet.
    pub fn begin_authorization(&self) -> Result<AuthorizationRequest, AuthError> {
        self.inner.begin_authorization()
    }

    /// Finish the authorization-code exchange started by
    /// [`begin_authorization`](Self::begin_authorization).
    pub async fn complete_authorization(&self, code: &str, state: &str) -> Result<Credential, AuthError> {
        let verifier = {
            let mut pending = lock(&self.inner.pending);
            let matches = pending.as_ref().map(|p| p.request.state == state).unwrap_or(false);
            if !matches {
                tracing::warn!("authorization callback with unknown state");
                return Err(AuthError::StateMismatch);
            }
            let Some(taken) = pending.take() else {
                return Err(AuthError::StateMismatch);
            };
            if taken.request.expires_at <= Utc::now() {
                drop(pending);
                self.inner.settle_state();
                return Err(AuthError::TimedOut);
            }
            taken.verifier
        };

        let credential = match self.inner.oauth.exchange_code(code, &verifier).await {
            Ok(credential) => credential,
            Err(TokenEndpointError::NotConfigured(msg)) => return Err(AuthError::NotConfigured(msg)),
            Err(e) => {
                tracing::warn!(error = %e, "authorization code exchange failed");
                self.inner.settle_state();
                return Err(AuthError::ExchangeFailed(e.to_string()));
            }
        };

        if !credential.covers(self.inner.oauth.required_scopes()) {
            self.inner.settle_state();
            return Err(AuthError::ExchangeFailed(
                "granted scopes do not include the required scopes".into(),
            ));
        }
        if !credential.has_refresh_token() {
            tracing::warn!("authorization granted without a refresh token; re-authorization will be needed on expiry");
        }

        self.inner.adopt(credential.clone()).await;
        tracing::info!(expiry = %credential.expiry, "authorization completed");
        Ok(credential)
    }

    pub fn state(&self) -> AuthState {
        *lock(&self.inner.state)
    }

    /// URL of the open authorization request, if one has not expired.
    pub fn pending_authorization(&self) -> Option<String> {
        lock(&self.inner.pending)
            .as_ref()
            .filter(|p| p.request.expires_at > Utc::now())
            .map(|p| p.request.url.clone())
    }

    /// Mark the current access token as rejected so the next
    /// `get_credential` refreshes instead of reusing it.
    pub fn invalidate_access_token(&self) {
        let mut credential = lock(&self.inner.credential);
        if let Some(c) = credential.take() {
            tracing::info!("access token rejected upstream, forcing refresh");
            *lock(&self.inner.rejected_access_token) = Some(c.access_token.clone());
            // Keep the refresh token around for the next acquisition.
            *credential = Some(Credential {
                expiry: Utc::now() - Duration::days(1),
                ..c
            });
        }
    }

    /// Forget the credential in memory and on disk.
    pub async fn logout(&self) -> Result<(), StoreError> {
        *lock(&self.inner.credential) = None;
        *lock(&self.inner.pending) = None;
        *lock(&self.inner.state) = AuthState::Unauthenticated;
        self.inner.store.clear().await?;
        tracing::info!("stored credential removed");
        Ok(())
    }
}

impl BrokerInner {
    fn fresh_in_memory(&self) -> Option<Credential> {
        lock(&self.credential)
            .as_ref()
            .filter(|c| c.is_fresh(self.margin))
            .cloned()
    }

    fn set_state(&self, next: AuthState) {
        let mut state = lock(&self.state);
        if *state != next {
            tracing::debug!(from = %*state, to = %next, "auth state transition");
            *state = next;
        }
    }

    /// Pick the resting state after a failed exchange or refresh.
    fn settle_state(&self) {
        let next = if lock(&self.pending).is_some() {
            AuthState::Authenticating
        } else if lock(&self.credential).is_some() {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        };
        self.set_state(next);
    }

    /// Slow path of `get_credential`; runs at most once at a time.
    async fn acquire(&self) -> Result<Credential, AuthError> {
        if let Some(credential) = self.fresh_in_memory() {
            return Ok(credential);
        }

        let in_memory = lock(&self.credential).clone();
        let stored = match self.store.load().await {
            Ok(credential) => Some(credential),
            Err(StoreError::NotFound) => None,
            Err(e) => {
                tracing::warn!(error = %e, "token store unavailable, using in-memory credential");
                None
            }
        };

        // Another process (`authorize`) may have written a newer token.
        let candidate = match (in_memory, stored) {
            (Some(mem), Some(disk)) => Some(if disk.expiry > mem.expiry { disk } else { mem }),
            (mem, disk) => mem.or(disk),
        };
        let Some(mut credential) = candidate else {
            return self.needs_authorization("no stored token");
        };

        if lock(&self.rejected_access_token).as_deref() == Some(credential.access_token.as_str()) {
            credential.expiry = Utc::now() - Duration::days(1);
        }

        if !credential.covers(self.oauth.required_scopes()) {
            return self.needs_authorization("stored token lacks the required scopes");
        }

        if credential.is_fresh(self.margin) {
            *lock(&self.credential) = Some(credential.clone());
            self.set_state(AuthState::Authenticated);
            tracing::debug!(expiry = %credential.expiry, "adopted stored token");
            return Ok(credential);
        }

        if !credential.has_refresh_token() {
            return self.needs_authorization("access token expired and no refresh token is available");
        }

        self.set_state(AuthState::Refreshing);
        tracing::info!("refreshing access token");

        match self.oauth.refresh(&credential.refresh_token).await {
            Ok(refreshed) => {
                self.adopt(refreshed.clone()).await;
                tracing::info!(expiry = %refreshed.expiry, "access token refreshed");
                Ok(refreshed)
            }
            Err(TokenEndpointError::InvalidGrant(detail)) => {
                tracing::warn!(detail = %detail, "refresh token revoked");
                self.discard_revoked(&credential.refresh_token).await
            }
            Err(TokenEndpointError::NotConfigured(msg)) => {
                self.settle_state();
                Err(AuthError::NotConfigured(msg))
            }
            Err(e) => {
                tracing::warn!(error = %e, "token refresh failed");
                self.needs_authorization(&format!("token refresh failed: {}", e))
            }
        }
    }

    /// Forget a credential whose refresh token was revoked, unless an
    /// authorization completed while the refresh was in flight.
    async fn discard_revoked(&self, revoked_refresh: &str) -> Result<Credential, AuthError> {
        let replacement = {
            let mut memory = lock(&self.credential);
            let replacement = memory
                .as_ref()
                .filter(|c| c.refresh_token != revoked_refresh && c.is_fresh(self.margin))
                .cloned();
            if replacement.is_none() {
                *memory = None;
            }
            replacement
        };
        if let Some(newer) = replacement {
            tracing::info!("authorization completed during refresh, keeping the new credential");
            self.set_state(AuthState::Authenticated);
            return Ok(newer);
        }

        if let Err(e) = self.store.clear().await {
            tracing::error!(error = %e, "failed to remove revoked token");
        }

        // An exchange adopted between the memory check and the file removal
        // has to be written back.
        let adopted = lock(&self.credential).clone();
        if let Some(newer) = adopted {
            if let Err(e) = self.store.save(&newer).await {
                tracing::error!(error = %e, "failed to persist credential");
            }
            self.set_state(AuthState::Authenticated);
            return Ok(newer);
        }

        tracing::info!("stored token cleared");
        self.needs_authorization("refresh token was revoked or expired")
    }

    /// Install a new credential in memory and persist it. A persistence
    /// failure is logged; the credential stays usable for this process.
    async fn adopt(&self, credential: Credential) {
        *lock(&self.credential) = Some(credential.clone());
        *lock(&self.rejected_access_token) = None;
        *lock(&self.pending) = None;
        self.set_state(AuthState::Authenticated);

        if let Err(e) = self.store.save(&credential).await {
            tracing::error!(error = %e, "failed to persist credential");
        }
    }

    fn needs_authorization(&self, reason: &str) -> Result<Credential, AuthError> {
        let request = self.begin_authorization()?;
        tracing::info!(reason, "authorization required");
        Err(AuthError::NeedsAuthorization {
            reason: reason.to_string(),
            authorize_url: Some(request.url),
        })
    }

    fn begin_authorization(&self) -> Result<AuthorizationRequest, AuthError> {
        let mut pending = lock(&self.pending);
        if let Some(open) = pending.as_ref() {
            if open.request.expires_at > Utc::now() {
                return Ok(open.request.clone());
            }
        }

        let pkce = Pkce::generate();
        let state = uuid::Uuid::new_v4().simple().to_string();
        let url = self
            .oauth
            .authorization_url(&state, &pkce)
            .map_err(|e| match e {
                TokenEndpointError::NotConfigured(msg) => AuthError::NotConfigured(msg),
                other => AuthError::NotConfigured(other.to_string()),
            })?;

        let request = AuthorizationRequest {
            url,
            state,
            expires_at: Utc::now() + self.authorize_ttl,
        };
        *pending = Some(PendingAuthorization {
            request: request.clone(),
            verifier: pkce.verifier,
        });
        drop(pending);

        self.set_state(AuthState::Authenticating);
        tracing::info!(expires_at = %request.expires_at, "authorization request opened");
        Ok(request)
    }
}
