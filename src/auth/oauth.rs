//! OAuth2 authorization-code grant with PKCE, plus refresh.
//!
//! Speaks Google's endpoints by default; both URIs are configurable so tests
//! can point them at a local mock.

use std::collections::BTreeSet;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration, Utc};
use rand::RngCore;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::{parse_scopes, Credential};
use crate::retry::{send_with_retry, RetryPolicy};

/// Google issues one-hour tokens; used when a response omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Static OAuth client configuration.
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub auth_uri: String,
    pub token_uri: String,
    pub redirect_uri: String,
    pub scopes: BTreeSet<String>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TokenEndpointError {
    /// `invalid_grant`: the code or refresh token is expired, used, or revoked.
    #[error("grant rejected: {0}")]
    InvalidGrant(String),

    /// Network failure or 5xx that survived the retry.
    #[error("token endpoint unavailable: {0}")]
    Transient(String),

    /// Any other refusal (bad client credentials, malformed request, ...).
    #[error("token request rejected: {0}")]
    Rejected(String),

    #[error("OAuth client is not configured: {0}")]
    NotConfigured(String),
}

/// Token endpoint response (RFC 6749 §5.1).
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    pub token_type: Option<String>,
}

impl TokenResponse {
    /// Build a credential, keeping `previous_refresh` when the endpoint did not
    /// rotate the refresh token, and assuming `requested` scopes when the
    /// response does not list the granted ones.
    pub fn into_credential(self, previous_refresh: Option<&str>, requested: &BTreeSet<String>) -> Credential {
        let expires_in = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let scopes = match self.scope.as_deref() {
            Some(s) if !s.trim().is_empty() => parse_scopes(s),
            _ => requested.clone(),
        };
        let refresh_token = self
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| previous_refresh.map(String::from))
            .unwrap_or_default();

        Credential {
            access_token: self.access_token,
            refresh_token,
            expiry: Utc::now() + Duration::seconds(expires_in),
            scopes,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// PKCE verifier/challenge pair (RFC 7636, S256).
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let verifier = URL_SAFE_NO_PAD.encode(bytes);
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self { verifier, challenge }
    }
}

/// OAuth2 client for the authorization and token endpoints.
pub struct OAuthClient {
    settings: OAuthSettings,
    http: Client,
    retry: RetryPolicy,
}

impl OAuthClient {
    pub fn new(settings: OAuthSettings, http: Client, retry: RetryPolicy) -> Self {
        Self {
            settings,
            http,
            retry,
        }
    }

    pub fn settings(&self) -> &OAuthSettings {
        &self.settings
    }

    pub fn required_scopes(&self) -> &BTreeSet<String> {
        &self.settings.scopes
    }

    fn client_credentials(&self) -> Result<(&str, &str), TokenEndpointError> {
        let id = self
            .settings
            .client_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TokenEndpointError::NotConfigured("GOOGLE_OAUTH_CLIENT_ID is not set".into()))?;
        let secret = self
            .settings
            .client_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                TokenEndpointError::NotConfigured("GOOGLE_OAUTH_CLIENT_SECRET is not set".into())
            })?;
        Ok((id, secret))
    }

    /// Build the browser URL for the consent screen.
    ///
    /// `access_type=offline` plus `prompt=consent` makes Google issue a refresh
    /// token even when the user has consented before.
    pub fn authorization_url(&self, state: &str, pkce: &Pkce) -> Result<String, TokenEndpointError> {
        let (client_id, _) = self.client_credentials()?;
        let mut url = url::Url::parse(&self.settings.auth_uri)
            .map_err(|e| TokenEndpointError::NotConfigured(format!("invalid auth URI: {}", e)))?;

        let scope = self
            .settings
            .scopes
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");

        url.query_pairs_mut()
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", &self.settings.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &scope)
            .append_pair("state", state)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent");

        Ok(url.into())
    }

    /// Exchange an authorization code (`grant_type=authorization_code`).
    pub async fn exchange_code(&self, code: &str, verifier: &str) -> Result<Credential, TokenEndpointError> {
        let (client_id, client_secret) = self.client_credentials()?;
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("code_verifier", verifier),
            ("redirect_uri", self.settings.redirect_uri.as_str()),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];

        let token = self.post_token(&form).await?;
        Ok(token.into_credential(None, &self.settings.scopes))
    }

    /// Redeem a refresh token (`grant_type=refresh_token`).
    pub async fn refresh(&self, refresh_token: &str) -> Result<Credential, TokenEndpointError> {
        let (client_id, client_secret) = self.client_credentials()?;
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];

        let token = self.post_token(&form).await?;
        Ok(token.into_credential(Some(refresh_token), &self.settings.scopes))
    }

    async fn post_token(&self, form: &[(&str, &str)]) -> Result<TokenResponse, TokenEndpointError> {
        let resp = send_with_retry(
            || self.http.post(&self.settings.token_uri).form(form),
            &self.retry,
        )
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "token endpoint request failed");
            TokenEndpointError::Transient(e.without_url().to_string())
        })?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<TokenResponse>()
                .await
                .map_err(|e| TokenEndpointError::Rejected(format!("malformed token response: {}", e)));
        }

        let body = resp.text().await.unwrap_or_default();
        Err(classify_failure(status, &body, &self.retry))
    }
}

/// Map a non-2xx token endpoint response onto the error taxonomy.
fn classify_failure(status: reqwest::StatusCode, body: &str, retry: &RetryPolicy) -> TokenEndpointError {
    let parsed: Option<TokenErrorBody> = serde_json::from_str(body).ok();
    let detail = match &parsed {
        Some(b) => match &b.error_description {
            Some(d) => format!("{}: {}", b.error, d),
            None => b.error.clone(),
        },
        None => format!("HTTP {}", status.as_u16()),
    };

    if parsed.as_ref().map(|b| b.error.as_str()) == Some("invalid_grant") {
        return TokenEndpointError::InvalidGrant(detail);
    }
    if status.is_server_error() || retry.is_retryable_status(status) {
        return TokenEndpointError::Transient(detail);
    }
    TokenEndpointError::Rejected(detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SCOPE: &str = "https://www.googleapis.com/auth/analytics.readonly";

    fn settings(token_uri: String) -> OAuthSettings {
        OAuthSettings {
            client_id: Some("client-1.apps.googleusercontent.com".into()),
            client_secret: Some("shh".into()),
            auth_uri: "https://accounts.google.com/o/oauth2/auth".into(),
            token_uri,
            redirect_uri: "http://localhost:8080/oauth/callback".into(),
            scopes: parse_scopes(SCOPE),
        }
    }

    fn client(token_uri: String) -> OAuthClient {
        OAuthClient::new(settings(token_uri), Client::new(), RetryPolicy::immediate())
    }

    #[test]
    fn test_pkce_challenge_is_s256_of_verifier() {
        let pkce = Pkce::generate();
        assert_eq!(pkce.verifier.len(), 43);
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(pkce.verifier.as_bytes()));
        assert_eq!(pkce.challenge, expected);
    }

    #[test]
    fn test_authorization_url_parameters() {
        let oauth = client("http://unused/token".into());
        let pkce = Pkce::generate();
        let url = oauth.authorization_url("state-123", &pkce).unwrap();
        let parsed = url::Url::parse(&url).unwrap();
        let query: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();

        assert!(url.starts_with("https://accounts.google.com/o/oauth2/auth?"));
        assert_eq!(query["client_id"], "client-1.apps.googleusercontent.com");
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["scope"], SCOPE);
        assert_eq!(query["state"], "state-123");
        assert_eq!(query["code_challenge"], pkce.challenge);
        assert_eq!(query["code_challenge_method"], "S256");
        assert_eq!(query["access_type"], "offline");
        assert_eq!(query["redirect_uri"], "http://localhost:8080/oauth/callback");
    }

    #[test]
    fn test_authorization_url_requires_client_id() {
        let mut s = settings("http://unused/token".into());
        s.client_id = None;
        let oauth = OAuthClient::new(s, Client::new(), RetryPolicy::immediate());
        let err = oauth.authorization_url("s", &Pkce::generate()).unwrap_err();
        assert!(matches!(err, TokenEndpointError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token_when_not_rotated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.new",
                "expires_in": 3599,
                "token_type": "Bearer",
                "scope": SCOPE
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cred = client(format!("{}/token", server.uri()))
            .refresh("1//old-refresh")
            .await
            .unwrap();

        assert_eq!(cred.access_token, "ya29.new");
        assert_eq!(cred.refresh_token, "1//old-refresh");
        assert!(cred.expiry > Utc::now() + Duration::minutes(59));
        assert!(cred.scopes.contains(SCOPE));
    }

    #[tokio::test]
    async fn test_exchange_code_sends_verifier() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=4%2Fabc"))
            .and(body_string_contains("code_verifier=verifier-xyz"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.first",
                "refresh_token": "1//first",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cred = client(format!("{}/token", server.uri()))
            .exchange_code("4/abc", "verifier-xyz")
            .await
            .unwrap();

        assert_eq!(cred.refresh_token, "1//first");
        // No scope in the response: the requested scopes are assumed granted.
        assert!(cred.scopes.contains(SCOPE));
    }

    #[tokio::test]
    async fn test_invalid_grant_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Token has been expired or revoked."
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(format!("{}/token", server.uri()))
            .refresh("1//revoked")
            .await
            .unwrap_err();

        assert_eq!(
            err,
            TokenEndpointError::InvalidGrant("invalid_grant: Token has been expired or revoked.".into())
        );
    }

    #[tokio::test]
    async fn test_server_error_is_retried_once_then_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let err = client(format!("{}/token", server.uri()))
            .refresh("1//refresh")
            .await
            .unwrap_err();

        assert!(matches!(err, TokenEndpointError::Transient(_)));
    }

    #[tokio::test]
    async fn test_bad_client_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": "invalid_client"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(format!("{}/token", server.uri()))
            .refresh("1//refresh")
            .await
            .unwrap_err();

        assert_eq!(err, TokenEndpointError::Rejected("invalid_client".into()));
    }
}
