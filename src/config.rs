use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{parse_scopes, OAuthSettings};

pub const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/analytics.readonly";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub token_path: PathBuf,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub auth_uri: String,
    pub token_uri: String,
    pub redirect_uri: String,
    /// Space- or comma-separated OAuth scopes.
    pub scopes: String,
    pub admin_api_url: String,
    pub data_api_url: String,
    /// Verified at startup; never used as a fallback for tool calls.
    pub default_property_id: Option<String>,
    pub http_timeout_secs: u64,
    pub refresh_margin_secs: u64,
    pub authorize_timeout_secs: u64,
}

impl Config {
    pub fn oauth_settings(&self) -> OAuthSettings {
        OAuthSettings {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            auth_uri: self.auth_uri.clone(),
            token_uri: self.token_uri.clone(),
            redirect_uri: self.redirect_uri.clone(),
            scopes: parse_scopes(&self.scopes),
        }
    }

    /// Ties the token file to the OAuth client that issued it.
    pub fn token_identity(&self) -> String {
        self.client_id.clone().unwrap_or_default()
    }

    /// Path of the redirect URI, mounted on the HTTP server.
    pub fn callback_path(&self) -> String {
        url::Url::parse(&self.redirect_uri)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| "/oauth/callback".to_string())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }

    pub fn authorize_timeout(&self) -> Duration {
        Duration::from_secs(self.authorize_timeout_secs)
    }
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn number<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let cfg = Config {
        host: var_or("GA4_HOST", "127.0.0.1"),
        port: number("GA4_PORT", 8000),
        token_path: PathBuf::from(var_or("GA4_TOKEN_PATH", "token.json")),
        client_id: optional("GOOGLE_OAUTH_CLIENT_ID"),
        client_secret: optional("GOOGLE_OAUTH_CLIENT_SECRET"),
        auth_uri: var_or("GA4_OAUTH_AUTH_URI", "https://accounts.google.com/o/oauth2/auth"),
        token_uri: var_or("GA4_OAUTH_TOKEN_URI", "https://oauth2.googleapis.com/token"),
        redirect_uri: var_or("GA4_OAUTH_REDIRECT_URI", "http://localhost:8080/oauth/callback"),
        scopes: var_or("GA4_OAUTH_SCOPES", DEFAULT_SCOPE),
        admin_api_url: var_or("GA4_ADMIN_API_URL", "https://analyticsadmin.googleapis.com"),
        data_api_url: var_or("GA4_DATA_API_URL", "https://analyticsdata.googleapis.com"),
        default_property_id: optional("GA4_PROPERTY_ID"),
        http_timeout_secs: number("GA4_HTTP_TIMEOUT_SECS", 30),
        refresh_margin_secs: number("GA4_REFRESH_MARGIN_SECS", 60),
        authorize_timeout_secs: number("GA4_AUTHORIZE_TIMEOUT_SECS", 300),
    };

    if parse_scopes(&cfg.scopes).is_empty() {
        anyhow::bail!("GA4_OAUTH_SCOPES must name at least one scope");
    }
    if url::Url::parse(&cfg.redirect_uri).is_err() {
        anyhow::bail!("GA4_OAUTH_REDIRECT_URI is not a valid URL: {}", cfg.redirect_uri);
    }
    if cfg.client_id.is_none() || cfg.client_secret.is_none() {
        eprintln!("⚠️  GOOGLE_OAUTH_CLIENT_ID / GOOGLE_OAUTH_CLIENT_SECRET are not set. Tools will report not_configured.");
    }

    Ok(cfg)
}
