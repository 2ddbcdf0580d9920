//! # Trellis Server
//!
//! Main binary: loads configuration, opens per-domain storage and TLS
//! material, then serves the client (5222) and server (5269) ports over a
//! single routing node until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use trellis_db::StorageRegistry;
use trellis_federation::TrustStore;
use trellis_stream::listener;
use trellis_stream::tls::{self, TlsContext};
use trellis_stream::{Node, Role};

#[derive(Debug, Parser)]
#[command(name = "trellis", version, about = "Federated XMPP server")]
struct Args {
    /// Configuration file (defaults to ./trellis.toml when present).
    #[arg(short, long, env = "TRELLIS_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = trellis_common::config::init(args.config.as_deref())?;

    // Structured logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "trellis=info,trellis_stream=info".into());
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).with_target(true).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_thread_ids(true).init();
    }

    tracing::info!("Starting Trellis v{}", env!("CARGO_PKG_VERSION"));
    if config.hosts.is_empty() {
        anyhow::bail!("no virtual hosts configured");
    }
    for domain in config.hosts.keys() {
        tracing::info!(domain = %domain, "Serving virtual host");
    }

    // Errs only when a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();
    let tls_ctx = TlsContext::from_config(&config, tls::provider())?;
    let trust = TrustStore::from_config(&config.tls, tls::provider())?;

    let client_addr = SocketAddr::new(config.server.host.parse()?, config.server.client_port);
    let server_addr = SocketAddr::new(config.server.host.parse()?, config.server.server_port);

    let node = Node::builder(config)
        .tls(tls_ctx)
        .trust(trust)
        .open_storage(&StorageRegistry::with_defaults())
        .await?
        .build()?;

    let client_listener = TcpListener::bind(client_addr).await?;
    let server_listener = TcpListener::bind(server_addr).await?;
    tracing::info!("Client connections on {client_addr}");
    tracing::info!("Server connections on {server_addr}");

    tokio::select! {
        res = listener::serve(node.clone(), client_listener, Role::Client) => res?,
        res = listener::serve(node.clone(), server_listener, Role::Server) => res?,
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}
