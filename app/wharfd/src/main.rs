use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wharf_docker::{DaemonClient, EcrCredentialResolver};
use wharf_registry::{create_router, ImageCache, Materializer, RegistryServer};

/// Listen address used when neither the flag nor the environment names
/// one.
const DEFAULT_ADDR: &str = ":5000";

/// Environment variable consulted for the listen address.
const ADDR_ENV: &str = "REGISTRY_HTTP_ADDR";

#[derive(Debug, Parser)]
#[command(name = "wharfd")]
#[command(author, version, about = "Pull-through OCI registry backed by the local Docker daemon", long_about = None)]
struct Args {
    /// Listen address, e.g. ":5000" or "127.0.0.1:5000".
    /// Overrides REGISTRY_HTTP_ADDR.
    #[arg(long)]
    addr: Option<String>,

    /// Cache directory holding exported image layouts.
    #[arg(long, default_value = "cache")]
    cache_dir: PathBuf,

    /// Docker daemon socket.
    #[arg(long, default_value = wharf_docker::client::DEFAULT_SOCKET)]
    docker_socket: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wharfd=info,wharf_registry=info,wharf_docker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    run(Args::parse()).await
}

async fn run(args: Args) -> Result<()> {
    let addr = parse_listen_addr(&resolve_listen_addr(args.addr))?;

    let cache = ImageCache::new(&args.cache_dir)
        .with_context(|| format!("failed to open cache at {}", args.cache_dir.display()))?;
    let daemon = Arc::new(DaemonClient::new(&args.docker_socket));
    let credentials = Arc::new(EcrCredentialResolver::new());
    let materializer = Arc::new(Materializer::new(cache, daemon, credentials));

    info!(
        cache_dir = %args.cache_dir.display(),
        docker_socket = %args.docker_socket.display(),
        "starting registry"
    );

    let server = RegistryServer::new(addr, create_router(materializer));
    tokio::select! {
        result = server.run() => result.context("server error")?,
        () = shutdown_signal() => info!("shutdown signal received"),
    }
    Ok(())
}

/// The flag wins silently; the environment wins with a log line; the
/// default is last.
fn resolve_listen_addr(flag: Option<String>) -> String {
    if let Some(addr) = flag {
        return addr;
    }
    if let Ok(addr) = std::env::var(ADDR_ENV) {
        if !addr.is_empty() {
            info!(addr = %addr, "using listen address from {ADDR_ENV}");
            return addr;
        }
    }
    DEFAULT_ADDR.to_string()
}

/// Accepts the Go-style ":5000" spelling for all-interfaces.
fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .with_context(|| format!("unusable listen address {addr:?}"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
