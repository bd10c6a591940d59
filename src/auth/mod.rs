//! OAuth2 credential lifecycle.
//!
//! - `store`: durable, permission-hardened token persistence
//! - `oauth`: authorization URL construction and token endpoint grants
//! - `broker`: the single owner of the live credential (refresh, single-flight,
//!   out-of-band authorization)
//! - `callback`: loopback listener that receives the authorization redirect

pub mod broker;
pub mod callback;
pub mod oauth;
pub mod store;

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use broker::{AuthorizationRequest, CredentialBroker};
pub use oauth::{OAuthClient, OAuthSettings};
pub use store::{FileTokenStore, StoreError, TokenStore};

/// A live OAuth2 credential.
///
/// Callers only ever receive clones; the broker's copy is the one that gets
/// refreshed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    pub expiry: DateTime<Utc>,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
}

impl Credential {
    /// True when the access token is valid for longer than `margin`.
    pub fn is_fresh(&self, margin: Duration) -> bool {
        self.expiry - margin > Utc::now()
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    /// True when every scope in `required` was granted.
    pub fn covers(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.scopes)
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &if self.has_refresh_token() { "[REDACTED]" } else { "<none>" },
            )
            .field("expiry", &self.expiry)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Per-instance authentication state machine.
///
/// `Unauthenticated → Authenticating → Authenticated ⇄ Refreshing`, with
/// `Authenticated → Authenticating` when a refresh token is revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::Authenticating => "authenticating",
            AuthState::Authenticated => "authenticated",
            AuthState::Refreshing => "refreshing",
        };
        f.write_str(s)
    }
}

/// Every way `get_credential` and the authorization operations can fail.
///
/// `Clone` so a single in-flight refresh can hand the same failure to every
/// waiter.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AuthError {
    #[error("authorization required: {reason}")]
    NeedsAuthorization {
        reason: String,
        authorize_url: Option<String>,
    },

    #[error("OAuth client is not configured: {0}")]
    NotConfigured(String),

    #[error("authorization state does not match any pending request")]
    StateMismatch,

    #[error("authorization code exchange failed: {0}")]
    ExchangeFailed(String),

    #[error("timed out waiting for authorization")]
    TimedOut,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::NeedsAuthorization { .. } => "needs_authorization",
            AuthError::NotConfigured(_) => "not_configured",
            AuthError::StateMismatch => "state_mismatch",
            AuthError::ExchangeFailed(_) => "exchange_failed",
            AuthError::TimedOut => "timed_out",
        }
    }

    pub fn authorize_url(&self) -> Option<&str> {
        match self {
            AuthError::NeedsAuthorization { authorize_url, .. } => authorize_url.as_deref(),
            _ => None,
        }
    }
}

/// Parse a space- or comma-separated scope list.
pub fn parse_scopes(raw: &str) -> BTreeSet<String> {
    raw.split(|c: char| c == ' ' || c == ',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
