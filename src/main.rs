use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ga4_gateway::app::{self, App};
use ga4_gateway::auth::callback::{self, CallbackError};
use ga4_gateway::auth::{StoreError, TokenStore};
use ga4_gateway::cli::{self, Commands, Transport};
use ga4_gateway::config::{self, Config};
use ga4_gateway::mcp::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = cli::Cli::parse();
    let mut cfg = config::load()?;
    args.apply(&mut cfg);

    let result = match args.command {
        Some(Commands::Serve { transport, .. }) => run_server(cfg, transport).await,
        Some(Commands::Authorize) => run_authorize(cfg).await,
        Some(Commands::Status) => run_status(cfg).await,
        Some(Commands::Logout) => run_logout(cfg).await,
        None => run_server(cfg, Transport::Http).await,
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

/// Logs go to stderr: stdout carries the stdio transport.
fn init_tracing() {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        match opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![KeyValue::new(
                "service.name",
                "ga4-gateway",
            )])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
        {
            Ok(tracer) => Some(tracing_opentelemetry::layer().with_tracer(tracer)),
            Err(e) => {
                eprintln!("⚠️  failed to install OpenTelemetry tracer: {}", e);
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ga4_gateway=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(telemetry_layer)
        .init();
}

async fn run_server(cfg: Config, transport: Transport) -> anyhow::Result<()> {
    let App { gateway, server, .. } = app::build(&cfg)?;

    if let Some(property_id) = cfg.default_property_id.clone() {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.verify_default_property(&property_id).await });
    }

    let http_owns_redirect = transport == Transport::Http
        && callback::loopback_target(&cfg.redirect_uri)
            .map(|(addr, _)| addr.port() == cfg.port)
            .unwrap_or(false);
    if !http_owns_redirect {
        let server = server.clone();
        let redirect_uri = cfg.redirect_uri.clone();
        tokio::spawn(async move {
            match server::serve_redirect_listener(server, &redirect_uri).await {
                Ok(()) => {}
                Err(CallbackError::InvalidRedirect(uri)) => {
                    tracing::info!(redirect_uri = %uri, "redirect URI is not loopback; expecting it to be routed externally")
                }
                Err(e) => tracing::warn!(error = %e, "authorization redirect listener unavailable"),
            }
        });
    }

    match transport {
        Transport::Http => {
            let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
                .parse()
                .with_context(|| format!("invalid listen address {}:{}", cfg.host, cfg.port))?;
            server::serve_http(server, addr, &cfg.callback_path()).await?;
        }
        Transport::Stdio => server::serve_stdio(server).await?,
    }
    Ok(())
}

async fn run_authorize(cfg: Config) -> anyhow::Result<()> {
    let App { broker, .. } = app::build(&cfg)?;
    let request = broker.begin_authorization()?;

    eprintln!("Open this URL in a browser to authorize Google Analytics access:\n\n  {}\n", request.url);
    eprintln!("Waiting up to {}s for the redirect (Ctrl-C to cancel)...", cfg.authorize_timeout_secs);

    let credential = callback::wait_for_authorization(&broker, &cfg.redirect_uri, cfg.authorize_timeout()).await?;
    eprintln!(
        "✅ Authorized. Token stored at {} (access token valid until {}).",
        cfg.token_path.display(),
        credential.expiry.to_rfc3339()
    );
    Ok(())
}

async fn run_status(cfg: Config) -> anyhow::Result<()> {
    let App { store, broker, .. } = app::build(&cfg)?;
    let margin = chrono::Duration::seconds(cfg.refresh_margin_secs as i64);

    let status = match store.load().await {
        Ok(credential) => json!({
            "token_path": cfg.token_path.display().to_string(),
            "stored": true,
            "access_token_fresh": credential.is_fresh(margin),
            "expires_at": credential.expiry.to_rfc3339(),
            "has_refresh_token": credential.has_refresh_token(),
            "scopes_sufficient": credential.covers(&cfg.oauth_settings().scopes),
        }),
        Err(StoreError::NotFound) => json!({
            "token_path": cfg.token_path.display().to_string(),
            "stored": false,
            "state": broker.state(),
        }),
        Err(e) => return Err(e.into()),
    };

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn run_logout(cfg: Config) -> anyhow::Result<()> {
    let App { broker, .. } = app::build(&cfg)?;
    broker.logout().await?;
    eprintln!("Stored token removed from {}.", cfg.token_path.display());
    Ok(())
}
