// meshsync daemon: discovery, sync sessions, catalog gossip and model transfer for one node.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mesh_daemon::{config, MeshNode};
use tracing::info;

#[derive(Parser)]
#[command(name = "mesh-daemon", version)]
#[command(about = "Offline-first mesh sync node")]
struct Cli {
    /// Path to configuration file (default: ~/.config/meshsync/config.toml, then /etc/meshsync/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Peer id (overrides config file and environment)
    #[arg(long)]
    peer_id: Option<String>,

    /// Models directory (overrides config file and environment)
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Do not serve local models over HTTP
    #[arg(long)]
    no_serve: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesh_daemon=info,mesh_core=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(id) = cli.peer_id {
        cfg.peer_id = id;
    }
    if let Some(dir) = cli.models_dir {
        cfg.models_dir = dir;
    }
    if cli.no_serve {
        cfg.serve_models = false;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let node = MeshNode::start(cfg).await.context("starting mesh node")?;
        shutdown_signal().await?;
        info!("shutting down");
        node.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
