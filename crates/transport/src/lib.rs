//! Peer-to-peer message transport for stream network nodes
//!
//! Maintains direct duplex channels to other nodes over WebRTC data
//! channels ([`rtc::WebRtcEndpoint`]) or WebSockets ([`ws::WsEndpoint`]).
//! Both endpoints keep at most one [`Connection`](connection::Connection)
//! per peer and share the same connection state machine: queued sends with
//! bounded retries, backpressure, ping/pong liveness and a deferred
//! connection attempt that survives connection replacement.
//!
//! # Example
//!
//! ```no_run
//! use streamnet_transport::{PeerInfo, WsEndpoint, WsEndpointConfig};
//!
//! # async fn example() -> streamnet_transport::Result<()> {
//! let endpoint = WsEndpoint::start(PeerInfo::new_node("node-1"), WsEndpointConfig::default()).await?;
//! let peer_id = endpoint.connect("ws://127.0.0.1:30301").await?;
//! endpoint.send(&peer_id, "hello").await?;
//! endpoint.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod metrics;
pub mod peer_info;
pub mod rtc;
pub mod ws;

pub use config::{
    ConnectionConfig, NodeConfig, TurnServerConfig, WebRtcEndpointConfig, WsEndpointConfig,
};
pub use connection::{is_offering, ConnectionState};
pub use error::{ConnectionError, Error, Result};
pub use events::{EndpointEvent, EndpointEventReceiver};
pub use metrics::MetricsSnapshot;
pub use peer_info::{PeerId, PeerInfo, PeerType};
pub use rtc::{RtcSignaller, WebRtcEndpoint};
pub use ws::{DisconnectionReason, WsEndpoint};

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// For binaries; the library itself only emits events.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
