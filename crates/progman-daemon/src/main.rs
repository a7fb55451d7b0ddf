//! progman-daemon - program manager daemon.
//!
//! Loads the program configuration, constructs the supervisor, and serves
//! its operations over HTTP: status snapshots, start/stop, log snapshots,
//! and a server-sent-events live log stream. On SIGINT or SIGTERM the
//! daemon stops every running program before exiting.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use progman_core::{ManagerConfig, Supervisor};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod routes;

/// progman daemon - supervised program manager
#[derive(Parser, Debug)]
#[command(name = "progman-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to program configuration file
    #[arg(short, long, default_value = "progman.toml")]
    config: PathBuf,

    /// Address to bind the HTTP server on
    #[arg(long, default_value = "127.0.0.1:5000")]
    bind: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let config = ManagerConfig::from_file(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    info!(
        config = %args.config.display(),
        programs = config.programs.len(),
        "configuration loaded"
    );

    let supervisor = Arc::new(Supervisor::new(config));
    let app = routes::router(Arc::clone(&supervisor));

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    info!(addr = %args.bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    // Open SSE connections ended with the server; now take the children down.
    supervisor.shutdown().await;
    info!("daemon exited");
    Ok(())
}

/// Resolve when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            // Fall back to ctrl-c only.
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    info!("shutdown signal received");
}
