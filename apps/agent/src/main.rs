//! # Tether Agent
//!
//! Headless runner for the resilience core.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  load config ─► open client ─► online ─► scheduler drains on its own   │
//! │                                              │                          │
//! │                       status changes, dead letters, session end ─► log │
//! │                                              │                          │
//! │  Ctrl-C / SIGTERM ─► close (running drain finishes first)              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Usage: `tether-agent [path/to/tether.toml]`. Log level follows `RUST_LOG`.

use std::path::PathBuf;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tether_sync::{TetherClient, TetherConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tether_sync=debug")),
        )
        .with_target(true)
        .init();

    info!("Starting Tether agent...");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = TetherConfig::load(config_path)?;
    info!(
        api = %config.api.base_url,
        interval_secs = config.scheduler.sync_interval_secs,
        "Configuration loaded"
    );

    let client = TetherClient::builder(config).online(true).open().await?;

    // Observe
    let _status = client
        .on_status_change(|status| {
            info!(
                online = status.is_online,
                syncing = status.is_syncing,
                pending = status.pending_count,
                errors = status.sync_error_count,
                "Sync status"
            );
        })
        .await;

    let _dead_letters = client.on_dead_letter(|letter| {
        error!(
            id = %letter.operation.id,
            target = %letter.operation.target,
            error = %letter.last_error,
            "Operation dead-lettered"
        );
    });

    let _session = client.on_session_ended(|ended| {
        warn!(reason = ?ended.reason, "Session ended; sign in again to resume delivery");
    });

    if client.session().await.is_none() {
        warn!("No stored session; queued operations wait until sign-in");
    }

    shutdown_signal().await;

    info!("Shutting down...");
    client.close().await;
    info!("Agent stopped");
    Ok(())
}

/// Completes on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
