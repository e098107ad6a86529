//! AgentMesh sidecar process.
//!
//! Loads `.env`, then the layered configuration (`AGENTMESH_CONFIG`,
//! `AGENTMESH__*`), and serves until Ctrl-C or SIGTERM.

use agentmesh_sidecar::{Sidecar, SidecarConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[agentmesh-sidecar] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, kind = ?e.kind(), "sidecar exited with error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), agentmesh_sidecar::SidecarError> {
    let config = SidecarConfig::load()?;
    tracing::info!(
        agent_id = %config.agent_id,
        local_port = config.local_port,
        external_port = config.external_port,
        "configuration loaded"
    );
    let sidecar = Sidecar::new(config)?;

    let shutdown = CancellationToken::new();
    tokio::spawn(forward_signals(shutdown.clone()));

    sidecar.run(shutdown).await
}

async fn forward_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("CTRL-C received; shutting down sidecar"),
        _ = terminate => tracing::info!("SIGTERM received; shutting down sidecar"),
    }
    shutdown.cancel();
}
