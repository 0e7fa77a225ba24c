//! grouphttp node daemon: receiver, transport and discovery for one cluster member.

use std::path::PathBuf;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("grouphttp-node {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument '{}'", other),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = grouphttp_node::config::load(config_path.as_deref()).context("loading configuration")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (cluster, mut inbox) = grouphttp_node::Cluster::start(cfg)
            .await
            .context("starting node")?;
        // Join failures are logged by the adapter; the node keeps serving.
        let _ = cluster.connect().await;
        tokio::spawn(async move {
            while let Some(msg) = inbox.recv().await {
                tracing::info!(
                    "{} bytes from {} ({})",
                    msg.payload.len(),
                    msg.sender,
                    msg.endpoint
                );
            }
        });
        shutdown_signal().await?;
        tracing::info!("shutting down");
        cluster.disconnect().await;
        anyhow::Ok(())
    })?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
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
