//! WebRTC data channel binding of [`Transport`]

use super::peer::{RtcPeer, RtcPeerFactory, RtcPeerParams, PING_FRAME, PONG_FRAME};
use crate::connection::{DescriptionKind, Transport, TransportEvent, TransportEventSender};
use crate::error::ConnectionError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

#[derive(Default)]
struct PendingCandidates {
    remote_description_set: bool,
    candidates: Vec<(String, String)>,
}

/// Drives one [`RtcPeer`] for a connection.
///
/// The peer is created lazily, either by `do_connect()` or by the first
/// remote description. Remote ICE candidates that arrive before the remote
/// description are buffered and applied right after it.
pub struct WebRtcTransport {
    factory: Arc<dyn RtcPeerFactory>,
    params: RtcPeerParams,
    events: TransportEventSender,
    peer: OnceCell<Arc<dyn RtcPeer>>,
    pending: Mutex<PendingCandidates>,
}

impl WebRtcTransport {
    pub fn new(
        factory: Arc<dyn RtcPeerFactory>,
        params: RtcPeerParams,
        events: TransportEventSender,
    ) -> Self {
        Self {
            factory,
            params,
            events,
            peer: OnceCell::new(),
            pending: Mutex::new(PendingCandidates::default()),
        }
    }

    pub fn is_offerer(&self) -> bool {
        self.params.is_offerer
    }

    async fn peer(&self) -> Result<&Arc<dyn RtcPeer>, ConnectionError> {
        self.peer
            .get_or_try_init(|| {
                self.factory
                    .create_peer(self.params.clone(), self.events.clone())
            })
            .await
    }

    /// Apply the peer's SDP. An offer is answered through a
    /// `LocalDescription` event.
    pub async fn set_remote_description(
        &self,
        kind: DescriptionKind,
        sdp: &str,
    ) -> Result<(), ConnectionError> {
        let peer = self.peer().await?;

        match kind {
            DescriptionKind::Offer => {
                let answer = peer.accept_offer(sdp).await?;
                let _ = self.events.send(TransportEvent::LocalDescription {
                    kind: DescriptionKind::Answer,
                    sdp: answer,
                });
            }
            DescriptionKind::Answer => peer.accept_answer(sdp).await?,
        }

        let buffered = {
            let mut pending = self.pending.lock();
            pending.remote_description_set = true;
            std::mem::take(&mut pending.candidates)
        };

        if !buffered.is_empty() {
            debug!("Applying {} buffered remote candidates", buffered.len());
        }
        for (candidate, mid) in buffered {
            if let Err(err) = peer.add_remote_candidate(&candidate, &mid).await {
                warn!(error = %err, "Failed to apply buffered remote candidate");
            }
        }

        Ok(())
    }

    pub async fn add_remote_candidate(
        &self,
        candidate: &str,
        mid: &str,
    ) -> Result<(), ConnectionError> {
        {
            let mut pending = self.pending.lock();
            if !pending.remote_description_set {
                pending
                    .candidates
                    .push((candidate.to_string(), mid.to_string()));
                return Ok(());
            }
        }

        self.peer().await?.add_remote_candidate(candidate, mid).await
    }

    pub fn buffered_candidate_count(&self) -> usize {
        self.pending.lock().candidates.len()
    }

    async fn send_frame(&self, frame: &[u8]) -> Result<(), ConnectionError> {
        match self.peer.get() {
            Some(peer) if peer.send_binary(frame).await? => Ok(()),
            Some(_) => Err(ConnectionError::Transport("data channel not ready".to_string())),
            None => Err(ConnectionError::Transport("peer connection not created".to_string())),
        }
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn do_connect(&self) -> Result<(), ConnectionError> {
        let peer = self.peer().await?;
        if self.params.is_offerer {
            let offer = peer.create_offer().await?;
            let _ = self.events.send(TransportEvent::LocalDescription {
                kind: DescriptionKind::Offer,
                sdp: offer,
            });
        }
        Ok(())
    }

    async fn do_close(&self, _reason: ConnectionError) {
        if let Some(peer) = self.peer.get() {
            peer.close().await;
        }
    }

    async fn do_send_message(&self, message: &str) -> Result<bool, ConnectionError> {
        match self.peer.get() {
            Some(peer) => peer.send_text(message).await,
            None => Ok(false),
        }
    }

    async fn send_ping(&self) -> Result<(), ConnectionError> {
        self.send_frame(PING_FRAME).await
    }

    async fn send_pong(&self) -> Result<(), ConnectionError> {
        self.send_frame(PONG_FRAME).await
    }

    fn is_open(&self) -> bool {
        self.peer.get().map(|peer| peer.is_open()).unwrap_or(false)
    }

    async fn buffered_amount(&self) -> usize {
        match self.peer.get() {
            Some(peer) => peer.buffered_amount().await,
            None => 0,
        }
    }

    fn max_message_size(&self) -> usize {
        self.params.max_message_size
    }

    fn describe_state(&self) -> String {
        self.peer
            .get()
            .map(|peer| peer.state_summary())
            .unwrap_or_else(|| "peer connection not created".to_string())
    }
}
