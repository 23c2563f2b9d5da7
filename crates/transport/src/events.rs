//! Notifications published by the endpoints

use crate::error::ConnectionError;
use crate::peer_info::PeerInfo;
use tokio::sync::broadcast;

/// Capacity of an endpoint's event channel. Slow subscribers lag and
/// skip events rather than stalling the endpoint.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum EndpointEvent {
    /// A connection to the peer opened. Fired once per peer until it
    /// disconnects, even if the underlying connection is replaced.
    PeerConnected(PeerInfo),

    /// The peer's open connection closed
    PeerDisconnected {
        peer_info: PeerInfo,
        reason: ConnectionError,
    },

    MessageReceived {
        peer_info: PeerInfo,
        message: String,
    },

    /// Sends to the peer are paused until its buffer drains
    HighBackPressure(PeerInfo),

    LowBackPressure(PeerInfo),
}

impl EndpointEvent {
    pub fn peer_info(&self) -> &PeerInfo {
        match self {
            EndpointEvent::PeerConnected(peer_info)
            | EndpointEvent::HighBackPressure(peer_info)
            | EndpointEvent::LowBackPressure(peer_info) => peer_info,
            EndpointEvent::PeerDisconnected { peer_info, .. }
            | EndpointEvent::MessageReceived { peer_info, .. } => peer_info,
        }
    }
}

pub type EndpointEventSender = broadcast::Sender<EndpointEvent>;
pub type EndpointEventReceiver = broadcast::Receiver<EndpointEvent>;

pub(crate) fn channel() -> EndpointEventSender {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}
