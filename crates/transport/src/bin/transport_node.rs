//! Demo node
//!
//! Listens for WebSocket peers, dials the addresses given with `--connect`
//! and logs everything it receives. Typing a line on stdin sends it to all
//! connected peers.

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use streamnet_transport::{EndpointEvent, NodeConfig, PeerInfo, WsEndpoint};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "transport-node")]
#[command(about = "Stream network node speaking the WebSocket peer transport")]
struct Args {
    /// Interface to listen on
    #[arg(long, env = "TRANSPORT_NODE_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(long, env = "TRANSPORT_NODE_PORT")]
    port: Option<u16>,

    /// Peer id of this node (random when omitted)
    #[arg(long, env = "TRANSPORT_NODE_PEER_ID")]
    peer_id: Option<String>,

    /// Addresses of nodes to connect to, e.g. ws://127.0.0.1:30301
    #[arg(long = "connect", value_name = "URL")]
    connect: Vec<String>,

    /// TOML configuration file
    #[arg(long, env = "TRANSPORT_NODE_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Seconds between metrics log lines
    #[arg(long, default_value_t = 30)]
    metrics_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    streamnet_transport::init_logging();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if let Some(host) = args.host {
        config.ws.host = host;
    }
    if let Some(port) = args.port {
        config.ws.port = port;
    }
    config.validate()?;

    let peer_id = args
        .peer_id
        .unwrap_or_else(|| format!("node-{}", uuid::Uuid::new_v4().simple()));
    let endpoint = WsEndpoint::start(PeerInfo::new_node(peer_id.as_str()), config.ws).await?;

    tracing::info!("Node {} listening on {}", peer_id, endpoint.address());
    let mut events = endpoint.subscribe();

    for address in &args.connect {
        match endpoint.connect(address).await {
            Ok(remote) => tracing::info!("Connected to {} at {}", remote, address),
            Err(e) => tracing::warn!("Failed to connect to {}: {}", address, e),
        }
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut metrics_tick = tokio::time::interval(Duration::from_secs(args.metrics_interval.max(1)));

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(EndpointEvent::MessageReceived { peer_info, message }) => {
                    tracing::info!("{}: {}", peer_info.peer_id, message);
                }
                Ok(EndpointEvent::PeerConnected(peer_info)) => {
                    tracing::info!("Peer connected: {}", peer_info);
                }
                Ok(EndpointEvent::PeerDisconnected { peer_info, reason }) => {
                    tracing::info!("Peer disconnected: {} ({})", peer_info, reason);
                }
                Ok(other) => tracing::debug!(?other, "Endpoint event"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {} endpoint events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    for peer in endpoint.get_peers() {
                        if let Err(e) = endpoint.send(&peer, line.clone()).await {
                            tracing::warn!("Failed to send to {}: {}", peer, e);
                        }
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => stdin_open = false,
            },
            _ = metrics_tick.tick() => {
                let snapshot = endpoint.metrics();
                tracing::info!("metrics: {}", serde_json::to_string(&snapshot)?);
            }
        }
    }

    endpoint.stop().await;
    Ok(())
}
