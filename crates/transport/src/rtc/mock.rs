//! In-memory signalling relay and peer connections
//!
//! Lets two or more [`WebRtcEndpoint`](super::WebRtcEndpoint)s negotiate and
//! exchange messages inside one process without ICE or DTLS.

use super::peer::{classify_binary, RtcPeer, RtcPeerFactory, RtcPeerParams};
use super::signaller::{
    AnswerOptions, ConnectOptions, ErrorOptions, IceCandidateOptions, Listener, OfferOptions,
    RtcSignaller,
};
use crate::connection::{TransportEvent, TransportEventSender};
use crate::error::ConnectionError;
use crate::peer_info::{PeerId, PeerInfo};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Error code relayed back when the target of a signal is unknown
pub const UNKNOWN_PEER: &str = "UNKNOWN_PEER";

/// A signal a [`MockSignaller`] was asked to relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalRecord {
    Offer { target: PeerId, connection_id: String },
    Answer { target: PeerId, connection_id: String },
    IceCandidate { target: PeerId, connection_id: String },
    Connect { target: PeerId },
}

#[derive(Default)]
struct HubInner {
    signallers: Mutex<HashMap<PeerId, Weak<MockSignaller>>>,
}

/// Routes signals between [`MockSignaller`]s by peer id
#[derive(Clone, Default)]
pub struct MockSignallerHub {
    inner: Arc<HubInner>,
}

impl MockSignallerHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a signaller for `peer_info`, replacing any previous one
    pub fn signaller(&self, peer_info: PeerInfo) -> Arc<MockSignaller> {
        let signaller = Arc::new(MockSignaller {
            peer_info: peer_info.clone(),
            hub: Arc::clone(&self.inner),
            listeners: Mutex::new(Listeners::default()),
            sent: Mutex::new(Vec::new()),
            relay_enabled: AtomicBool::new(true),
        });
        self.inner
            .signallers
            .lock()
            .insert(peer_info.peer_id, Arc::downgrade(&signaller));
        signaller
    }
}

#[derive(Default)]
struct Listeners {
    offer: Option<Listener<OfferOptions>>,
    answer: Option<Listener<AnswerOptions>>,
    ice_candidate: Option<Listener<IceCandidateOptions>>,
    connect: Option<Listener<ConnectOptions>>,
    error: Option<Listener<ErrorOptions>>,
}

pub struct MockSignaller {
    peer_info: PeerInfo,
    hub: Arc<HubInner>,
    listeners: Mutex<Listeners>,
    sent: Mutex<Vec<SignalRecord>>,
    relay_enabled: AtomicBool,
}

impl MockSignaller {
    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    /// Every signal relayed so far
    pub fn sent(&self) -> Vec<SignalRecord> {
        self.sent.lock().clone()
    }

    /// When disabled, outgoing signals are recorded but not delivered
    pub fn set_relay_enabled(&self, enabled: bool) {
        self.relay_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn has_listeners(&self) -> bool {
        self.listeners.lock().offer.is_some()
    }

    pub fn deliver_offer(&self, options: OfferOptions) {
        let listener = self.listeners.lock().offer.clone();
        if let Some(listener) = listener {
            listener(options);
        }
    }

    pub fn deliver_answer(&self, options: AnswerOptions) {
        let listener = self.listeners.lock().answer.clone();
        if let Some(listener) = listener {
            listener(options);
        }
    }

    pub fn deliver_ice_candidate(&self, options: IceCandidateOptions) {
        let listener = self.listeners.lock().ice_candidate.clone();
        if let Some(listener) = listener {
            listener(options);
        }
    }

    pub fn deliver_connect(&self, options: ConnectOptions) {
        let listener = self.listeners.lock().connect.clone();
        if let Some(listener) = listener {
            listener(options);
        }
    }

    pub fn deliver_error(&self, options: ErrorOptions) {
        let listener = self.listeners.lock().error.clone();
        if let Some(listener) = listener {
            listener(options);
        }
    }

    /// Record `record` and return the target if it should be delivered.
    /// Unknown targets are answered with an `UNKNOWN_PEER` error signal.
    fn route(&self, record: SignalRecord, target: &str) -> Option<Arc<MockSignaller>> {
        self.sent.lock().push(record);
        if !self.relay_enabled.load(Ordering::SeqCst) {
            return None;
        }

        let target_signaller = self
            .hub
            .signallers
            .lock()
            .get(target)
            .and_then(Weak::upgrade);

        if target_signaller.is_none() {
            debug!("Mock relay has no route to {}", target);
            self.deliver_error(ErrorOptions {
                error_code: UNKNOWN_PEER.to_string(),
                target_node: target.to_string(),
            });
        }
        target_signaller
    }
}

#[async_trait]
impl RtcSignaller for MockSignaller {
    fn set_offer_listener(&self, listener: Listener<OfferOptions>) {
        self.listeners.lock().offer = Some(listener);
    }

    fn set_answer_listener(&self, listener: Listener<AnswerOptions>) {
        self.listeners.lock().answer = Some(listener);
    }

    fn set_ice_candidate_listener(&self, listener: Listener<IceCandidateOptions>) {
        self.listeners.lock().ice_candidate = Some(listener);
    }

    fn set_connect_listener(&self, listener: Listener<ConnectOptions>) {
        self.listeners.lock().connect = Some(listener);
    }

    fn set_error_listener(&self, listener: Listener<ErrorOptions>) {
        self.listeners.lock().error = Some(listener);
    }

    fn clear_listeners(&self) {
        *self.listeners.lock() = Listeners::default();
    }

    async fn send_rtc_offer(
        &self,
        router_id: &str,
        target_peer_id: &str,
        connection_id: &str,
        description: &str,
    ) -> Result<()> {
        let record = SignalRecord::Offer {
            target: target_peer_id.to_string(),
            connection_id: connection_id.to_string(),
        };
        if let Some(target) = self.route(record, target_peer_id) {
            target.deliver_offer(OfferOptions {
                router_id: router_id.to_string(),
                originator_info: self.peer_info.clone(),
                connection_id: connection_id.to_string(),
                description: description.to_string(),
            });
        }
        Ok(())
    }

    async fn send_rtc_answer(
        &self,
        router_id: &str,
        target_peer_id: &str,
        connection_id: &str,
        description: &str,
    ) -> Result<()> {
        let record = SignalRecord::Answer {
            target: target_peer_id.to_string(),
            connection_id: connection_id.to_string(),
        };
        if let Some(target) = self.route(record, target_peer_id) {
            target.deliver_answer(AnswerOptions {
                router_id: router_id.to_string(),
                originator_info: self.peer_info.clone(),
                connection_id: connection_id.to_string(),
                description: description.to_string(),
            });
        }
        Ok(())
    }

    async fn send_rtc_ice_candidate(
        &self,
        router_id: &str,
        target_peer_id: &str,
        connection_id: &str,
        candidate: &str,
        mid: &str,
    ) -> Result<()> {
        let record = SignalRecord::IceCandidate {
            target: target_peer_id.to_string(),
            connection_id: connection_id.to_string(),
        };
        if let Some(target) = self.route(record, target_peer_id) {
            target.deliver_ice_candidate(IceCandidateOptions {
                router_id: router_id.to_string(),
                originator_info: self.peer_info.clone(),
                connection_id: connection_id.to_string(),
                candidate: candidate.to_string(),
                mid: mid.to_string(),
            });
        }
        Ok(())
    }

    async fn send_rtc_connect(&self, router_id: &str, target_peer_id: &str) -> Result<()> {
        let record = SignalRecord::Connect {
            target: target_peer_id.to_string(),
        };
        if let Some(target) = self.route(record, target_peer_id) {
            target.deliver_connect(ConnectOptions {
                router_id: router_id.to_string(),
                originator_info: self.peer_info.clone(),
                target_node: target_peer_id.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct NetworkInner {
    next_key: AtomicU64,
    peers: Mutex<HashMap<u64, Weak<MockRtcPeer>>>,
    buffered_amount: AtomicUsize,
}

impl NetworkInner {
    fn peer(&self, key: u64) -> Option<Arc<MockRtcPeer>> {
        self.peers.lock().get(&key).and_then(Weak::upgrade)
    }
}

/// [`RtcPeerFactory`] whose peers talk to each other in memory.
///
/// SDP strings carry the peer's network key, so an offer/answer exchange
/// through any signaller links the two peers and opens their channels.
#[derive(Clone, Default)]
pub struct MockRtcNetwork {
    inner: Arc<NetworkInner>,
}

impl MockRtcNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffered amount every peer reports
    pub fn set_buffered_amount(&self, amount: usize) {
        self.inner.buffered_amount.store(amount, Ordering::SeqCst);
    }

    /// Peers created and not yet closed
    pub fn live_peer_count(&self) -> usize {
        self.inner
            .peers
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|peer| !peer.closed.load(Ordering::SeqCst))
            .count()
    }
}

#[async_trait]
impl RtcPeerFactory for MockRtcNetwork {
    async fn create_peer(
        &self,
        params: RtcPeerParams,
        events: TransportEventSender,
    ) -> std::result::Result<Arc<dyn RtcPeer>, ConnectionError> {
        let key = self.inner.next_key.fetch_add(1, Ordering::SeqCst) + 1;
        let peer = Arc::new(MockRtcPeer {
            key,
            network: Arc::clone(&self.inner),
            events,
            is_offerer: params.is_offerer,
            remote: Mutex::new(None),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            remote_candidates: AtomicUsize::new(0),
        });
        self.inner.peers.lock().insert(key, Arc::downgrade(&peer));
        Ok(peer)
    }
}

pub struct MockRtcPeer {
    key: u64,
    network: Arc<NetworkInner>,
    events: TransportEventSender,
    is_offerer: bool,
    remote: Mutex<Option<u64>>,
    open: AtomicBool,
    closed: AtomicBool,
    remote_candidates: AtomicUsize,
}

impl MockRtcPeer {
    fn parse_key(sdp: &str, prefix: &str) -> std::result::Result<u64, ConnectionError> {
        sdp.strip_prefix(prefix)
            .and_then(|key| key.parse().ok())
            .ok_or_else(|| ConnectionError::Transport(format!("malformed mock sdp: {}", sdp)))
    }

    fn announce_candidate(&self) {
        let _ = self.events.send(TransportEvent::LocalCandidate {
            candidate: format!("mock-candidate:{}", self.key),
            mid: "0".to_string(),
        });
    }

    fn set_open(&self) {
        if !self.closed.load(Ordering::SeqCst) && !self.open.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Open);
        }
    }

    fn remote_peer(&self) -> Option<Arc<MockRtcPeer>> {
        let key = (*self.remote.lock())?;
        self.network.peer(key)
    }
}

#[async_trait]
impl RtcPeer for MockRtcPeer {
    async fn create_offer(&self) -> std::result::Result<String, ConnectionError> {
        self.announce_candidate();
        Ok(format!("mock-offer:{}", self.key))
    }

    async fn accept_offer(&self, sdp: &str) -> std::result::Result<String, ConnectionError> {
        let remote = Self::parse_key(sdp, "mock-offer:")?;
        *self.remote.lock() = Some(remote);
        self.announce_candidate();
        Ok(format!("mock-answer:{}", self.key))
    }

    async fn accept_answer(&self, sdp: &str) -> std::result::Result<(), ConnectionError> {
        let remote_key = Self::parse_key(sdp, "mock-answer:")?;
        *self.remote.lock() = Some(remote_key);

        let remote = self.network.peer(remote_key).ok_or_else(|| {
            ConnectionError::Transport(format!("mock peer {} is gone", remote_key))
        })?;
        if *remote.remote.lock() == Some(self.key) && !remote.closed.load(Ordering::SeqCst) {
            self.set_open();
            remote.set_open();
        }
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        _candidate: &str,
        _mid: &str,
    ) -> std::result::Result<(), ConnectionError> {
        self.remote_candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_text(&self, message: &str) -> std::result::Result<bool, ConnectionError> {
        if !self.open.load(Ordering::SeqCst) {
            return Ok(false);
        }
        match self.remote_peer() {
            Some(remote) if remote.open.load(Ordering::SeqCst) => {
                let _ = remote.events.send(TransportEvent::Message(message.to_string()));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn send_binary(&self, data: &[u8]) -> std::result::Result<bool, ConnectionError> {
        if !self.open.load(Ordering::SeqCst) {
            return Ok(false);
        }
        match self.remote_peer() {
            Some(remote) if remote.open.load(Ordering::SeqCst) => {
                match classify_binary(data) {
                    Some(event) => {
                        let _ = remote.events.send(event);
                    }
                    None => debug!("Mock peer {} dropping {} binary bytes", self.key, data.len()),
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn buffered_amount(&self) -> usize {
        self.network.buffered_amount.load(Ordering::SeqCst)
    }

    fn state_summary(&self) -> String {
        format!(
            "mock peer {} (offerer={}, open={}, remote={:?}, remote candidates={})",
            self.key,
            self.is_offerer,
            self.open.load(Ordering::SeqCst),
            *self.remote.lock(),
            self.remote_candidates.load(Ordering::SeqCst)
        )
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        if let Some(remote) = self.remote_peer() {
            if remote.open.swap(false, Ordering::SeqCst) {
                let _ = remote.events.send(TransportEvent::Closed(None));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DescriptionKind;
    use crate::rtc::transport::WebRtcTransport;
    use crate::connection::Transport;
    use tokio::sync::mpsc;

    fn params(is_offerer: bool) -> RtcPeerParams {
        RtcPeerParams {
            stun_urls: Vec::new(),
            turn_servers: Vec::new(),
            max_message_size: 1024,
            buffer_threshold_low: 32,
            is_offerer,
        }
    }

    #[tokio::test]
    async fn test_unknown_target_relays_error() {
        let hub = MockSignallerHub::new();
        let signaller = hub.signaller(PeerInfo::new_node("a"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        signaller.set_error_listener(Arc::new(move |err: ErrorOptions| {
            let _ = tx.send(err);
        }));

        signaller.send_rtc_connect("router", "ghost").await.unwrap();

        let err = rx.recv().await.unwrap();
        assert_eq!(err.error_code, UNKNOWN_PEER);
        assert_eq!(err.target_node, "ghost");
        assert_eq!(
            signaller.sent(),
            vec![SignalRecord::Connect {
                target: "ghost".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_remote_description() {
        let network = MockRtcNetwork::new();
        let factory: Arc<dyn RtcPeerFactory> = Arc::new(network.clone());
        let (offer_tx, mut offer_rx) = mpsc::unbounded_channel();
        let (answer_tx, mut answer_rx) = mpsc::unbounded_channel();
        let offerer = WebRtcTransport::new(Arc::clone(&factory), params(true), offer_tx);
        let answerer = WebRtcTransport::new(factory, params(false), answer_tx);

        answerer.add_remote_candidate("early", "0").await.unwrap();
        assert_eq!(answerer.buffered_candidate_count(), 1);

        offerer.do_connect().await.unwrap();
        let offer = loop {
            match offer_rx.recv().await.unwrap() {
                TransportEvent::LocalDescription { sdp, .. } => break sdp,
                _ => continue,
            }
        };

        answerer
            .set_remote_description(DescriptionKind::Offer, &offer)
            .await
            .unwrap();
        assert_eq!(answerer.buffered_candidate_count(), 0);

        let answer = loop {
            match answer_rx.recv().await.unwrap() {
                TransportEvent::LocalDescription { kind, sdp } => {
                    assert_eq!(kind, DescriptionKind::Answer);
                    break sdp;
                }
                _ => continue,
            }
        };
        offerer
            .set_remote_description(DescriptionKind::Answer, &answer)
            .await
            .unwrap();

        assert!(offerer.is_open());
        assert!(answerer.is_open());
        assert!(answerer.do_send_message("hi").await.unwrap());
        assert_eq!(network.live_peer_count(), 2);

        offerer.do_close(ConnectionError::closed()).await;
        assert!(!answerer.is_open());
        assert_eq!(network.live_peer_count(), 1);
    }
}
