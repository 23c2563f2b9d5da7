//! Peer connection abstraction and the native `webrtc` binding

use crate::config::TurnServerConfig;
use crate::connection::{TransportEvent, TransportEventSender};
use crate::error::ConnectionError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Label of the single data channel carrying all messages
pub const DATA_CHANNEL_LABEL: &str = "streamrDataChannel";

/// Liveness ping. Sent as a binary message; application messages are
/// always strings.
pub const PING_FRAME: &[u8] = b"ping";

/// Answer to [`PING_FRAME`]
pub const PONG_FRAME: &[u8] = b"pong";

/// Map an inbound binary data channel message to a liveness event
pub fn classify_binary(data: &[u8]) -> Option<TransportEvent> {
    if data == PING_FRAME {
        Some(TransportEvent::Ping)
    } else if data == PONG_FRAME {
        Some(TransportEvent::Pong)
    } else {
        None
    }
}

/// Parameters for creating one peer connection
#[derive(Debug, Clone)]
pub struct RtcPeerParams {
    pub stun_urls: Vec<String>,
    pub turn_servers: Vec<TurnServerConfig>,
    pub max_message_size: usize,
    pub buffer_threshold_low: usize,
    /// The offerer creates the data channel, the answerer waits for it
    pub is_offerer: bool,
}

/// One WebRTC peer connection with a single ordered data channel
#[async_trait]
pub trait RtcPeer: Send + Sync {
    /// Create and apply a local offer, returning its SDP
    async fn create_offer(&self) -> Result<String, ConnectionError>;

    /// Apply a remote offer and return the SDP of the local answer
    async fn accept_offer(&self, sdp: &str) -> Result<String, ConnectionError>;

    async fn accept_answer(&self, sdp: &str) -> Result<(), ConnectionError>;

    async fn add_remote_candidate(&self, candidate: &str, mid: &str)
        -> Result<(), ConnectionError>;

    async fn send_text(&self, message: &str) -> Result<bool, ConnectionError>;

    async fn send_binary(&self, data: &[u8]) -> Result<bool, ConnectionError>;

    fn is_open(&self) -> bool;

    async fn buffered_amount(&self) -> usize;

    /// Connection and ICE state for diagnostics
    fn state_summary(&self) -> String;

    async fn close(&self);
}

/// Creates [`RtcPeer`]s. Events are reported through `events`.
#[async_trait]
pub trait RtcPeerFactory: Send + Sync {
    async fn create_peer(
        &self,
        params: RtcPeerParams,
        events: TransportEventSender,
    ) -> Result<Arc<dyn RtcPeer>, ConnectionError>;
}

/// Factory backed by the `webrtc` crate
#[derive(Debug, Default, Clone)]
pub struct NativeRtcPeerFactory;

impl NativeRtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RtcPeerFactory for NativeRtcPeerFactory {
    #[instrument(skip(self, params, events), fields(is_offerer = params.is_offerer))]
    async fn create_peer(
        &self,
        params: RtcPeerParams,
        events: TransportEventSender,
    ) -> Result<Arc<dyn RtcPeer>, ConnectionError> {
        let peer = NativeRtcPeer::new(params, events).await?;
        Ok(peer)
    }
}

pub struct NativeRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    data_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    state: Arc<Mutex<RTCPeerConnectionState>>,
    open: Arc<AtomicBool>,
    params: RtcPeerParams,
    events: TransportEventSender,
}

fn webrtc_error(context: &str, err: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::Transport(format!("{}: {}", context, err))
}

impl NativeRtcPeer {
    async fn new(
        params: RtcPeerParams,
        events: TransportEventSender,
    ) -> Result<Arc<Self>, ConnectionError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| webrtc_error("Failed to register codecs", e))?;

        let interceptor_registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| webrtc_error("Failed to register interceptors", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = params
            .stun_urls
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(params.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| webrtc_error("Failed to create peer connection", e))?,
        );

        let peer = Arc::new(Self {
            peer_connection: Arc::clone(&peer_connection),
            data_channel: Mutex::new(None),
            state: Arc::new(Mutex::new(RTCPeerConnectionState::New)),
            open: Arc::new(AtomicBool::new(false)),
            params,
            events,
        });

        let candidate_events = peer.events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(TransportEvent::LocalCandidate {
                            candidate: init.candidate,
                            mid: init.sdp_mid.unwrap_or_default(),
                        });
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let state = Arc::clone(&peer.state);
        let state_events = peer.events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let state = Arc::clone(&state);
                let events = state_events.clone();
                Box::pin(async move {
                    debug!("Peer connection state changed to {}", s);
                    *state.lock() = s;
                    if s == RTCPeerConnectionState::Failed {
                        let _ = events.send(TransportEvent::Closed(Some(
                            ConnectionError::Transport("peer connection failed".to_string()),
                        )));
                    }
                })
            },
        ));

        if peer.params.is_offerer {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let data_channel = peer_connection
                .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
                .await
                .map_err(|e| webrtc_error("Failed to create data channel", e))?;
            peer.attach_data_channel(data_channel).await;
        } else {
            let weak: Weak<Self> = Arc::downgrade(&peer);
            peer_connection.on_data_channel(Box::new(move |data_channel: Arc<RTCDataChannel>| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(peer) = weak.upgrade() {
                        peer.attach_data_channel(data_channel).await;
                    }
                })
            }));
        }

        Ok(peer)
    }

    async fn attach_data_channel(&self, data_channel: Arc<RTCDataChannel>) {
        info!("Data channel '{}' attached", data_channel.label());

        data_channel
            .set_buffered_amount_low_threshold(self.params.buffer_threshold_low)
            .await;

        let events = self.events.clone();
        data_channel
            .on_buffered_amount_low(Box::new(move || {
                let events = events.clone();
                Box::pin(async move {
                    let _ = events.send(TransportEvent::BufferedAmountLow);
                })
            }))
            .await;

        let events = self.events.clone();
        let open = Arc::clone(&self.open);
        data_channel.on_open(Box::new(move || {
            Box::pin(async move {
                open.store(true, Ordering::SeqCst);
                let _ = events.send(TransportEvent::Open);
            })
        }));

        let events = self.events.clone();
        let open = Arc::clone(&self.open);
        data_channel.on_close(Box::new(move || {
            let events = events.clone();
            let open = Arc::clone(&open);
            Box::pin(async move {
                open.store(false, Ordering::SeqCst);
                let _ = events.send(TransportEvent::Closed(None));
            })
        }));

        let events = self.events.clone();
        data_channel.on_error(Box::new(move |err| {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(TransportEvent::Error(err.to_string()));
            })
        }));

        let events = self.events.clone();
        data_channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            Box::pin(async move {
                if msg.is_string {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => {
                            let _ = events.send(TransportEvent::Message(text));
                        }
                        Err(err) => {
                            warn!("Dropping data channel message that is not UTF-8: {}", err);
                            let _ = events.send(TransportEvent::Error(format!(
                                "invalid UTF-8 in data channel message: {}",
                                err.utf8_error()
                            )));
                        }
                    }
                } else if let Some(event) = classify_binary(&msg.data) {
                    let _ = events.send(event);
                } else {
                    debug!("Ignoring binary data channel message of {} bytes", msg.data.len());
                }
            })
        }));

        *self.data_channel.lock() = Some(data_channel);
    }

    fn channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.data_channel.lock().clone()
    }

    async fn local_sdp(&self) -> Result<String, ConnectionError> {
        self.peer_connection
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| {
                ConnectionError::Transport("No local description after negotiation".to_string())
            })
    }
}

#[async_trait]
impl RtcPeer for NativeRtcPeer {
    async fn create_offer(&self) -> Result<String, ConnectionError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| webrtc_error("Failed to create offer", e))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| webrtc_error("Failed to set local description", e))?;

        self.local_sdp().await
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String, ConnectionError> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| webrtc_error("Failed to parse offer", e))?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| webrtc_error("Failed to set remote description", e))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| webrtc_error("Failed to create answer", e))?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| webrtc_error("Failed to set local description", e))?;

        self.local_sdp().await
    }

    async fn accept_answer(&self, sdp: &str) -> Result<(), ConnectionError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| webrtc_error("Failed to parse answer", e))?;

        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| webrtc_error("Failed to set remote description", e))
    }

    async fn add_remote_candidate(
        &self,
        candidate: &str,
        mid: &str,
    ) -> Result<(), ConnectionError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: Some(mid.to_string()),
            ..Default::default()
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| webrtc_error("Failed to add ICE candidate", e))
    }

    async fn send_text(&self, message: &str) -> Result<bool, ConnectionError> {
        let Some(channel) = self.channel() else {
            return Ok(false);
        };
        channel
            .send_text(message.to_string())
            .await
            .map(|_| true)
            .map_err(|e| webrtc_error("Data channel send failed", e))
    }

    async fn send_binary(&self, data: &[u8]) -> Result<bool, ConnectionError> {
        let Some(channel) = self.channel() else {
            return Ok(false);
        };
        channel
            .send(&Bytes::copy_from_slice(data))
            .await
            .map(|_| true)
            .map_err(|e| webrtc_error("Data channel send failed", e))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn buffered_amount(&self) -> usize {
        match self.channel() {
            Some(channel) => channel.buffered_amount().await,
            None => 0,
        }
    }

    fn state_summary(&self) -> String {
        format!(
            "peer connection {}, ice {}, data channel {}",
            *self.state.lock(),
            self.peer_connection.ice_connection_state(),
            self.channel()
                .map(|c| c.ready_state().to_string())
                .unwrap_or_else(|| "none".to_string())
        )
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(channel) = self.channel() {
            if let Err(e) = channel.close().await {
                debug!("Data channel close failed: {}", e);
            }
        }
        if let Err(e) = self.peer_connection.close().await {
            debug!("Peer connection close failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_binary() {
        assert!(matches!(classify_binary(PING_FRAME), Some(TransportEvent::Ping)));
        assert!(matches!(classify_binary(PONG_FRAME), Some(TransportEvent::Pong)));
        assert!(classify_binary(b"pinged").is_none());
        assert!(classify_binary(&[0xff, b'a']).is_none());
    }
}
