//! Interface to the relay that carries WebRTC signalling between peers
//!
//! The relay itself (usually a tracker connection) lives outside this
//! crate. [`WebRtcEndpoint`](super::WebRtcEndpoint) registers listeners
//! once at construction and is the only caller of the `send_*` methods.

use crate::peer_info::{PeerId, PeerInfo};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Relayed SDP offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferOptions {
    pub router_id: String,
    pub originator_info: PeerInfo,
    pub connection_id: String,
    pub description: String,
}

/// Relayed SDP answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerOptions {
    pub router_id: String,
    pub originator_info: PeerInfo,
    pub connection_id: String,
    pub description: String,
}

/// Relayed ICE candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidateOptions {
    pub router_id: String,
    pub originator_info: PeerInfo,
    pub connection_id: String,
    pub candidate: String,
    pub mid: String,
}

/// Request from a peer asking us to initiate the negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub router_id: String,
    pub originator_info: PeerInfo,
    pub target_node: PeerId,
}

/// Relay-side failure concerning one of our connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorOptions {
    pub error_code: String,
    pub target_node: PeerId,
}

pub type Listener<T> = Arc<dyn Fn(T) + Send + Sync>;

#[async_trait]
pub trait RtcSignaller: Send + Sync {
    fn set_offer_listener(&self, listener: Listener<OfferOptions>);

    fn set_answer_listener(&self, listener: Listener<AnswerOptions>);

    fn set_ice_candidate_listener(&self, listener: Listener<IceCandidateOptions>);

    fn set_connect_listener(&self, listener: Listener<ConnectOptions>);

    fn set_error_listener(&self, listener: Listener<ErrorOptions>);

    /// Detach every listener
    fn clear_listeners(&self);

    async fn send_rtc_offer(
        &self,
        router_id: &str,
        target_peer_id: &str,
        connection_id: &str,
        description: &str,
    ) -> Result<()>;

    async fn send_rtc_answer(
        &self,
        router_id: &str,
        target_peer_id: &str,
        connection_id: &str,
        description: &str,
    ) -> Result<()>;

    async fn send_rtc_ice_candidate(
        &self,
        router_id: &str,
        target_peer_id: &str,
        connection_id: &str,
        candidate: &str,
        mid: &str,
    ) -> Result<()>;

    async fn send_rtc_connect(&self, router_id: &str, target_peer_id: &str) -> Result<()>;
}
