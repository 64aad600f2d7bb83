//! Chorus Daemon
//!
//! Standalone server process for the streaming inference session manager.
//! Clients create sessions over HTTP and follow them over SSE.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (binds 127.0.0.1:8787)
//! chorus-daemon
//!
//! # Custom bind address and config file
//! chorus-daemon --bind 0.0.0.0:9000 --config /etc/chorus/chorus.toml
//!
//! # With verbose logging
//! RUST_LOG=debug chorus-daemon
//! ```
//!
//! # Environment Variables
//!
//! - `CHORUS_BIND`: Bind address (default: 127.0.0.1:8787)
//! - `CHORUS_UPSTREAM_URL`: Inference provider base URL
//! - `CHORUS_UPSTREAM_API_KEY`: Provider API key
//! - `CHORUS_MAX_RETRIES`: Retry ceiling for transient upstream failures
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: Graceful shutdown

mod server;

use std::path::PathBuf;

use clap::Parser;
use tokio::signal;
use tracing::info;

use chorus_core::{config, ChatBackend, SessionController};

/// Streaming inference session manager daemon
#[derive(Debug, Parser)]
#[command(name = "chorus-daemon", version, about)]
struct Args {
    /// Bind address for the HTTP surface
    #[arg(long, env = "CHORUS_BIND")]
    bind: Option<String>,

    /// Path to a TOML config file (default: XDG config dir)
    #[arg(long, env = "CHORUS_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chorus_daemon=info".parse()?)
                .add_directive("chorus_core=info".parse()?),
        )
        .with_target(true)
        .init();

    let args = Args::parse();

    info!("Starting Chorus Daemon");
    info!("PID: {}", std::process::id());

    // Load configuration (file layer, then env overrides)
    let mut chorus_config = match args.config {
        Some(ref path) => config::load_config_from_path(path)?,
        None => config::load_config()?,
    };
    if let Some(bind) = args.bind {
        chorus_config.bind_addr = bind;
    }

    info!(
        upstream = %chorus_config.upstream_url,
        bind = %chorus_config.bind_addr,
        "Configuration loaded"
    );

    // Build the controller over the chat-completions backend
    let backend = ChatBackend::new(
        chorus_config.upstream_url.clone(),
        chorus_config.api_key.clone(),
    );
    let controller = SessionController::new(backend, chorus_config.clone());

    // Background eviction sweep
    let _sweeper = controller.spawn_sweeper();

    let app = server::router(controller);
    let listener = tokio::net::TcpListener::bind(&chorus_config.bind_addr).await?;
    info!(addr = %chorus_config.bind_addr, "Listening for connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Chorus daemon stopped cleanly");
    Ok(())
}

/// Resolve when a shutdown signal arrives
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
