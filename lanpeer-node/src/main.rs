// lanpeer: LAN peer daemon. Discovery beacon, UDP transport, retransmit monitor and console.

mod config;
mod console;
mod discovery;
mod tasks;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use lanpeer_core::Node;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::transport::ChannelOutbox;

#[derive(Parser, Debug)]
#[command(name = "lanpeer", version, about = "Chat and file transfer between peers on the local network")]
struct Args {
    /// Name this device announces to its peers.
    name: String,
    /// Config file (default: ~/.config/lanpeer/config.toml, then /etc/lanpeer/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// UDP port; overrides config and environment.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut cfg = config::load(args.config.as_deref()).context("loading config")?;
    if let Some(port) = args.port {
        cfg.port = port;
    }
    anyhow::ensure!(
        !args.name.is_empty() && !args.name.contains(':'),
        "device name must be non-empty and must not contain ':'"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let socket = Arc::new(
            transport::bind(cfg.port).with_context(|| format!("binding UDP port {}", cfg.port))?,
        );
        let (outbox, queue) = ChannelOutbox::channel();
        let outbox = Arc::new(outbox);
        let node = Arc::new(Node::new(args.name.clone(), cfg.node_options(), outbox.clone()));
        info!(name = %args.name, port = cfg.port, "node started");

        tasks::spawn_named("writer", transport::run_writer(socket.clone(), queue));
        tasks::spawn_named("receiver", transport::run_receiver(socket, node.clone()));
        discovery::spawn_beacon(
            node.clone(),
            outbox,
            cfg.broadcast_addr,
            cfg.port,
            cfg.heartbeat_interval(),
        );
        discovery::spawn_reaper(node.clone(), cfg.reap_interval());
        transport::spawn_retransmit_monitor(node.clone(), cfg.retransmit_monitor());
        tokio::spawn(console::run(node));

        shutdown_signal().await?;
        info!("shutting down");
        anyhow::Ok(())
    })?;
    rt.shutdown_timeout(std::time::Duration::from_secs(1));
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
