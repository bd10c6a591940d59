//! Receiving the OAuth redirect.
//!
//! The MCP server routes the redirect through [`complete_redirect`] and
//! [`outcome_page`]; the `authorize` command binds a short-lived loopback
//! listener with [`wait_for_authorization`].

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::{AuthError, Credential, CredentialBroker};

/// Query string Google appends to the redirect URI.
#[derive(Debug, Default, Deserialize)]
pub struct RedirectParams {
    pub code: Option<String>,
    pub state: Option<String>,
    /// Set instead of `code` when the user denies consent.
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("redirect URI {0} cannot be served locally")]
    InvalidRedirect(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("authorization cancelled")]
    Cancelled,

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Validate the redirect parameters and complete the exchange.
pub async fn complete_redirect(
    broker: &CredentialBroker,
    params: RedirectParams,
) -> Result<Credential, AuthError> {
    if let Some(error) = params.error {
        tracing::warn!(error = %error, "authorization denied by user");
        return Err(AuthError::ExchangeFailed(format!("authorization denied: {}", error)));
    }
    let (Some(code), Some(state)) = (params.code, params.state) else {
        return Err(AuthError::ExchangeFailed("redirect is missing code or state".into()));
    };
    broker.complete_authorization(&code, &state).await
}

/// Browser-facing page for an authorization outcome.
pub fn outcome_page(result: &Result<Credential, AuthError>) -> Response {
    match result {
        Ok(_) => (
            StatusCode::OK,
            Html("<h1>Authorization complete</h1><p>You can close this window.</p>"),
        )
            .into_response(),
        Err(e) => {
            let status = match e {
                AuthError::StateMismatch | AuthError::ExchangeFailed(_) => StatusCode::BAD_REQUEST,
                AuthError::TimedOut => StatusCode::REQUEST_TIMEOUT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Html(format!("<h1>Authorization failed</h1><p>{}</p>", e.code()))).into_response()
        }
    }
}

/// Address and path to listen on for a loopback redirect URI.
pub fn loopback_target(redirect_uri: &str) -> Result<(SocketAddr, String), CallbackError> {
    let invalid = || CallbackError::InvalidRedirect(redirect_uri.to_string());
    let url = url::Url::parse(redirect_uri).map_err(|_| invalid())?;

    let ip = match url.host_str() {
        Some("localhost") | Some("127.0.0.1") => std::net::Ipv4Addr::LOCALHOST.into(),
        Some("[::1]") | Some("::1") => std::net::Ipv6Addr::LOCALHOST.into(),
        _ => return Err(invalid()),
    };
    let port = url.port_or_known_default().ok_or_else(invalid)?;
    Ok((SocketAddr::new(ip, port), url.path().to_string()))
}

#[derive(Clone)]
struct ListenerState {
    broker: CredentialBroker,
    done: mpsc::Sender<Result<Credential, AuthError>>,
}

async fn loopback_redirect(
    State(state): State<ListenerState>,
    Query(params): Query<RedirectParams>,
) -> Response {
    let result = complete_redirect(&state.broker, params).await;
    let page = outcome_page(&result);
    let _ = state.done.send(result).await;
    page
}

/// Bind the redirect URI, wait for the browser to come back, and complete the
/// exchange. Bounded by `timeout` and cancelled by Ctrl-C.
pub async fn wait_for_authorization(
    broker: &CredentialBroker,
    redirect_uri: &str,
    timeout: Duration,
) -> Result<Credential, CallbackError> {
    let (addr, path) = loopback_target(redirect_uri)?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| CallbackError::Bind { addr, source })?;

    let (done_tx, mut done_rx) = mpsc::channel(1);
    let app = Router::new().route(&path, get(loopback_redirect)).with_state(ListenerState {
        broker: broker.clone(),
        done: done_tx,
    });

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });
    tracing::info!(%addr, path = %path, "waiting for authorization redirect");

    let outcome = tokio::select! {
        received = done_rx.recv() => match received {
            Some(result) => result.map_err(CallbackError::from),
            None => Err(CallbackError::Cancelled),
        },
        _ = tokio::time::sleep(timeout) => Err(CallbackError::Auth(AuthError::TimedOut)),
        _ = tokio::signal::ctrl_c() => Err(CallbackError::Cancelled),
    };

    let _ = stop_tx.send(());
    if let Err(e) = server.await {
        tracing::warn!(error = %e, "callback listener task failed");
    }
    outcome
}
