use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::Config;

/// GA4 Gateway: Google Analytics 4 as MCP tools
#[derive(Parser)]
#[command(name = "ga4-gateway", version, about)]
pub struct Cli {
    /// Where the OAuth token is persisted
    #[arg(long, global = true, env = "GA4_TOKEN_PATH")]
    pub token_path: Option<PathBuf>,

    #[arg(long, global = true, env = "GOOGLE_OAUTH_CLIENT_ID")]
    pub client_id: Option<String>,

    #[arg(long, global = true, env = "GOOGLE_OAUTH_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the MCP server (default)
    Serve {
        #[arg(long, value_enum, default_value_t = Transport::Http)]
        transport: Transport,
        /// Interface to bind (http transport)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (http transport)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run the browser authorization flow and store the token
    Authorize,

    /// Show the stored token state without contacting Google
    Status,

    /// Remove the stored token
    Logout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    /// Streamable HTTP on POST /mcp
    Http,
    /// Newline-delimited JSON-RPC on stdin/stdout
    Stdio,
}

impl Cli {
    /// Flags win over the environment-derived config.
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(path) = &self.token_path {
            cfg.token_path = path.clone();
        }
        if let Some(id) = &self.client_id {
            cfg.client_id = Some(id.clone());
        }
        if let Some(secret) = &self.client_secret {
            cfg.client_secret = Some(secret.clone());
        }
        if let Some(Commands::Serve { host, port, .. }) = &self.command {
            if let Some(host) = host {
                cfg.host = host.clone();
            }
            if let Some(port) = port {
                cfg.port = *port;
            }
        }
    }
}
