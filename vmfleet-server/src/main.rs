//! Entry point: loads configuration, brings the fleet's network fabric up,
//! restores persisted VM records, and serves the HTTP surface until asked
//! to shut down (§4.9).

mod error;
mod http;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use vmfleet_core::{Config, VmManager};

/// Command-line arguments for the vmfleet control plane.
#[derive(Debug, Parser)]
#[command(name = "vmfleet-server", version, about = "Control plane for a fleet of lightweight VMs")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, env = "VMFLEET_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load(&cli.config).context("loading configuration")?;
    let listen = format!("{}:{}", config.host, config.port);

    let manager = Arc::new(VmManager::new(config).context("bringing up network fabric")?);
    manager.restore_from_disk().await.context("restoring persisted VM records")?;

    let close_manager = manager.clone();
    manager.sessions().set_on_close(move |vm_name| {
        let manager = close_manager.clone();
        let vm_name = vm_name.to_owned();
        tokio::spawn(async move {
            if let Err(e) = manager.destroy(&vm_name).await {
                tracing::warn!(vm_name, error = %e, "failed to destroy VM after session close");
            }
        });
    });

    let state = http::AppState { manager: manager.clone() };
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&listen).await.with_context(|| format!("binding {listen}"))?;
    tracing::info!(%listen, "vmfleet-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    manager.destroy_all().await.context("destroying VMs on shutdown")?;

    Ok(())
}

/// Resolves once SIGTERM or SIGINT arrives, letting in-flight requests
/// drain before axum's listener is dropped.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
