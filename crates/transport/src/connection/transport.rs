//! The seam between the transport-agnostic [`Connection`](super::Connection)
//! and a concrete channel (WebRTC data channel or WebSocket)

use crate::error::ConnectionError;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

impl DescriptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DescriptionKind::Offer => "offer",
            DescriptionKind::Answer => "answer",
        }
    }
}

/// Everything a transport reports back to its connection
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The channel is ready to carry messages
    Open,
    /// The channel closed. `None` means an orderly close.
    Closed(Option<ConnectionError>),
    /// Non-fatal error worth logging
    Error(String),
    Message(String),
    Ping,
    Pong,
    /// Buffered bytes dropped below the low watermark
    BufferedAmountLow,
    /// Local SDP to relay to the peer
    LocalDescription { kind: DescriptionKind, sdp: String },
    /// Local ICE candidate to relay to the peer
    LocalCandidate { candidate: String, mid: String },
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Channel-specific operations a connection drives.
///
/// Implementations report state changes through the
/// [`TransportEventSender`] handed to them at construction.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start establishing the channel
    async fn do_connect(&self) -> Result<(), ConnectionError>;

    /// Tear the channel down. Must tolerate being called more than once.
    async fn do_close(&self, reason: ConnectionError);

    /// Hand one message to the channel. `Ok(false)` means it was not accepted.
    async fn do_send_message(&self, message: &str) -> Result<bool, ConnectionError>;

    /// Send a liveness ping outside the message stream. The peer answers
    /// it and the answer arrives as [`TransportEvent::Pong`].
    async fn send_ping(&self) -> Result<(), ConnectionError>;

    /// Answer a [`TransportEvent::Ping`]
    async fn send_pong(&self) -> Result<(), ConnectionError>;

    fn is_open(&self) -> bool;

    async fn buffered_amount(&self) -> usize;

    fn max_message_size(&self) -> usize;

    /// Diagnostic summary attached to failed send attempts
    fn describe_state(&self) -> String;
}
