//! Wires the configured components into one [`App`].

use std::sync::Arc;

use anyhow::Context;

use crate::auth::{CredentialBroker, FileTokenStore, OAuthClient, TokenStore};
use crate::cache::PropertyCache;
use crate::config::Config;
use crate::ga4::admin::AdminClient;
use crate::ga4::data::DataClient;
use crate::gateway::ToolGateway;
use crate::mcp::{McpServer, ToolRegistry};
use crate::retry::RetryPolicy;

/// Everything a running gateway shares. Cloning shares state.
#[derive(Clone)]
pub struct App {
    pub broker: CredentialBroker,
    pub gateway: ToolGateway,
    pub server: McpServer,
    pub store: Arc<FileTokenStore>,
}

pub fn build(cfg: &Config) -> anyhow::Result<App> {
    build_with_retry(cfg, RetryPolicy::default())
}

pub fn build_with_retry(cfg: &Config, retry: RetryPolicy) -> anyhow::Result<App> {
    let http = reqwest::Client::builder()
        .timeout(cfg.http_timeout())
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    let store = Arc::new(FileTokenStore::new(cfg.token_path.clone(), cfg.token_identity()));
    let oauth = OAuthClient::new(cfg.oauth_settings(), http.clone(), retry.clone());
    let broker = CredentialBroker::new(
        oauth,
        store.clone() as Arc<dyn TokenStore>,
        cfg.refresh_margin(),
        cfg.authorize_timeout(),
    );

    let admin = AdminClient::new(http.clone(), cfg.admin_api_url.clone(), retry.clone());
    let data = DataClient::new(http, cfg.data_api_url.clone(), retry);
    let cache = PropertyCache::new(Arc::new(admin));
    let gateway = ToolGateway::new(broker.clone(), cache, Arc::new(data));
    let server = McpServer::new(ToolRegistry::new(gateway.clone()));

    tracing::debug!(token_path = %cfg.token_path.display(), "gateway components ready");
    Ok(App {
        broker,
        gateway,
        server,
        store,
    })
}
