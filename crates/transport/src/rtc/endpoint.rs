//! Registry of WebRTC connections and the signalling coordinator
//!
//! All registry mutations and every signalling message are processed by a
//! single pump task, in arrival order. That keeps an offer ahead of the ICE
//! candidates that follow it and lets the connection-id checks reason about
//! one consistent registry.

use super::peer::{NativeRtcPeerFactory, RtcPeerFactory, RtcPeerParams};
use super::signaller::{
    AnswerOptions, ConnectOptions, ErrorOptions, IceCandidateOptions, OfferOptions, RtcSignaller,
};
use super::transport::WebRtcTransport;
use crate::config::WebRtcEndpointConfig;
use crate::connection::{
    is_offering, Connection, ConnectionEnvelope, ConnectionEvent, ConnectionEventReceiver,
    ConnectionEventSender, ConnectionIdCounter, ConnectionOptions, ConnectionPromise,
    ConnectionState, DeferredConnectionAttempt, DescriptionKind,
};
use crate::error::{ConnectionError, Error, Result};
use crate::events::{self, EndpointEvent, EndpointEventReceiver, EndpointEventSender};
use crate::metrics::{EndpointMetrics, MetricsSnapshot};
use crate::peer_info::{PeerId, PeerInfo};
use futures::future::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Upper bound on waiting for transports to tear down in `stop()`
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub type RtcConnection = Connection<WebRtcTransport>;

struct Entry {
    connection: Arc<RtcConnection>,
    router_id: String,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<PeerId, Entry>,
    /// Connections that emitted `PeerConnected`, keyed by local id
    announced: HashMap<u64, PeerInfo>,
    stopped: bool,
}

enum Signal {
    Offer(OfferOptions),
    Answer(AnswerOptions),
    IceCandidate(IceCandidateOptions),
    Connect(ConnectOptions),
    Error(ErrorOptions),
}

struct Inner {
    peer_info: PeerInfo,
    config: WebRtcEndpointConfig,
    signaller: Arc<dyn RtcSignaller>,
    factory: Arc<dyn RtcPeerFactory>,
    registry: Mutex<Registry>,
    ids: ConnectionIdCounter,
    connection_events: ConnectionEventSender,
    events: EndpointEventSender,
    metrics: EndpointMetrics,
}

/// Maintains at most one WebRTC connection per peer and negotiates them
/// through an [`RtcSignaller`].
pub struct WebRtcEndpoint {
    inner: Arc<Inner>,
    pump: JoinHandle<()>,
}

impl WebRtcEndpoint {
    /// Create an endpoint and register its listeners on `signaller`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        peer_info: PeerInfo,
        config: WebRtcEndpointConfig,
        signaller: Arc<dyn RtcSignaller>,
        factory: Arc<dyn RtcPeerFactory>,
    ) -> Result<Self> {
        config.validate()?;

        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            peer_info,
            config,
            signaller,
            factory,
            registry: Mutex::new(Registry::default()),
            ids: ConnectionIdCounter::new(),
            connection_events: connection_tx,
            events: events::channel(),
            metrics: EndpointMetrics::new(),
        });

        register_listeners(inner.signaller.as_ref(), signal_tx);
        let pump = tokio::spawn(run_pump(Arc::downgrade(&inner), connection_rx, signal_rx));

        info!(peer_id = %inner.peer_info.peer_id, "WebRTC endpoint started");
        Ok(Self { inner, pump })
    }

    /// Create an endpoint whose peer connections use the `webrtc` crate
    pub fn with_native_peers(
        peer_info: PeerInfo,
        config: WebRtcEndpointConfig,
        signaller: Arc<dyn RtcSignaller>,
    ) -> Result<Self> {
        Self::new(
            peer_info,
            config,
            signaller,
            Arc::new(NativeRtcPeerFactory::new()),
        )
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.inner.peer_info
    }

    /// Connect to `target_peer_id`, relaying signals through `router_id`.
    ///
    /// Resolves immediately if already open and joins the pending attempt
    /// if a negotiation is in flight. Unless `tracker_instructed`, an
    /// answering peer asks the target to start the negotiation.
    #[instrument(skip(self), fields(self_id = %self.inner.peer_info.peer_id))]
    pub async fn connect(
        &self,
        target_peer_id: &str,
        router_id: &str,
        tracker_instructed: bool,
    ) -> Result<PeerId> {
        let promise = self.inner.begin_connect(
            PeerInfo::new_unknown(target_peer_id),
            router_id,
            tracker_instructed,
        )?;
        Ok(promise.await?)
    }

    /// Queue `message` for `peer_id`. Resolves once the message was handed
    /// to the data channel.
    pub async fn send(&self, peer_id: &str, message: impl Into<String>) -> Result<PeerId> {
        let connection = {
            let registry = self.inner.registry.lock();
            if registry.stopped {
                return Err(Error::EndpointStopped);
            }
            registry
                .connections
                .get(peer_id)
                .map(|entry| Arc::clone(&entry.connection))
        }
        .ok_or_else(|| Error::NotConnected(peer_id.to_string()))?;

        match connection.send(message.into()).await {
            Ok(()) => {
                self.inner.metrics.record_sent();
                Ok(peer_id.to_string())
            }
            Err(err) => {
                self.inner.metrics.record_send_failure();
                Err(err.into())
            }
        }
    }

    /// Close and forget the connection to `peer_id`. No-op if there is none.
    pub fn close(&self, peer_id: &str, reason: &str) {
        let entry = self.inner.registry.lock().connections.remove(peer_id);
        if let Some(entry) = entry {
            info!(peer_id, reason, "Closing connection");
            entry
                .connection
                .close(Some(ConnectionError::Closed(reason.to_string())));
        }
    }

    /// Refuse further connects, detach from the signaller and close every
    /// connection.
    #[instrument(skip(self), fields(self_id = %self.inner.peer_info.peer_id))]
    pub async fn stop(&self) {
        let connections: Vec<_> = {
            let mut registry = self.inner.registry.lock();
            registry.stopped = true;
            registry
                .connections
                .drain()
                .map(|(_, entry)| entry.connection)
                .collect()
        };

        self.inner.signaller.clear_listeners();

        for connection in &connections {
            connection.close(None);
        }

        let teardown = futures::future::join_all(connections.iter().map(|c| c.wait_closed()));
        if tokio::time::timeout(STOP_TIMEOUT, teardown).await.is_err() {
            warn!("Timed out waiting for connections to close");
        }

        info!("WebRTC endpoint stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.registry.lock().stopped
    }

    /// Peers with an open connection
    pub fn get_peers(&self) -> Vec<PeerId> {
        self.open_connections()
            .iter()
            .map(|connection| connection.peer_id())
            .collect()
    }

    pub fn get_peer_infos(&self) -> Vec<PeerInfo> {
        self.open_connections()
            .iter()
            .map(|connection| connection.peer_info())
            .collect()
    }

    /// Last measured round-trip time per open peer, in milliseconds
    pub fn get_rtts(&self) -> HashMap<PeerId, u64> {
        self.open_connections()
            .iter()
            .filter_map(|connection| {
                connection
                    .rtt()
                    .map(|rtt| (connection.peer_id(), rtt.as_millis() as u64))
            })
            .collect()
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.connection_state(peer_id) == Some(ConnectionState::Open)
    }

    pub fn connection_state(&self, peer_id: &str) -> Option<ConnectionState> {
        self.inner
            .registry
            .lock()
            .connections
            .get(peer_id)
            .map(|entry| entry.connection.state())
    }

    /// Negotiation round of the registered connection to `peer_id`
    pub fn connection_id(&self, peer_id: &str) -> Option<String> {
        self.inner
            .registry
            .lock()
            .connections
            .get(peer_id)
            .and_then(|entry| entry.connection.connection_id())
    }

    /// Number of registered connections, open or negotiating
    pub fn connection_count(&self) -> usize {
        self.inner.registry.lock().connections.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn subscribe(&self) -> EndpointEventReceiver {
        self.inner.events.subscribe()
    }

    fn open_connections(&self) -> Vec<Arc<RtcConnection>> {
        self.inner
            .registry
            .lock()
            .connections
            .values()
            .filter(|entry| entry.connection.is_open())
            .map(|entry| Arc::clone(&entry.connection))
            .collect()
    }
}

impl Drop for WebRtcEndpoint {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn register_listeners(signaller: &dyn RtcSignaller, tx: mpsc::UnboundedSender<Signal>) {
    let sender = tx.clone();
    signaller.set_offer_listener(Arc::new(move |options| {
        let _ = sender.send(Signal::Offer(options));
    }));
    let sender = tx.clone();
    signaller.set_answer_listener(Arc::new(move |options| {
        let _ = sender.send(Signal::Answer(options));
    }));
    let sender = tx.clone();
    signaller.set_ice_candidate_listener(Arc::new(move |options| {
        let _ = sender.send(Signal::IceCandidate(options));
    }));
    let sender = tx.clone();
    signaller.set_connect_listener(Arc::new(move |options| {
        let _ = sender.send(Signal::Connect(options));
    }));
    signaller.set_error_listener(Arc::new(move |options| {
        let _ = tx.send(Signal::Error(options));
    }));
}

async fn run_pump(
    inner: Weak<Inner>,
    mut connection_rx: ConnectionEventReceiver,
    mut signal_rx: mpsc::UnboundedReceiver<Signal>,
) {
    let mut signals_open = true;
    loop {
        tokio::select! {
            envelope = connection_rx.recv() => {
                let Some(envelope) = envelope else { break };
                let Some(inner) = inner.upgrade() else { break };
                inner.handle_connection_event(envelope).await;
            }
            signal = signal_rx.recv(), if signals_open => {
                match signal {
                    Some(signal) => {
                        let Some(inner) = inner.upgrade() else { break };
                        inner.handle_signal(signal).await;
                    }
                    None => signals_open = false,
                }
            }
        }
    }
}

impl Inner {
    fn self_id(&self) -> &str {
        &self.peer_info.peer_id
    }

    fn create_connection(
        &self,
        peer_info: PeerInfo,
        deferred: Option<DeferredConnectionAttempt>,
    ) -> Arc<RtcConnection> {
        let params = RtcPeerParams {
            stun_urls: self.config.stun_urls.clone(),
            turn_servers: self.config.turn_servers.clone(),
            max_message_size: self.config.connection.max_message_size,
            buffer_threshold_low: self.config.connection.buffer_threshold_low,
            is_offerer: is_offering(self.self_id(), &peer_info.peer_id),
        };
        let factory = Arc::clone(&self.factory);

        Connection::new(
            ConnectionOptions {
                id: self.ids.next(),
                self_id: self.peer_info.peer_id.clone(),
                peer_info,
                config: self.config.connection.clone(),
                events: self.connection_events.clone(),
                deferred,
            },
            move |events| WebRtcTransport::new(factory, params, events),
        )
    }

    fn begin_connect(
        &self,
        target: PeerInfo,
        router_id: &str,
        tracker_instructed: bool,
    ) -> Result<ConnectionPromise> {
        let target_peer_id = target.peer_id.clone();
        let connection = {
            let mut registry = self.registry.lock();
            if registry.stopped {
                return Err(Error::EndpointStopped);
            }
            if target_peer_id == self.peer_info.peer_id {
                return Err(Error::SelfConnection(target_peer_id));
            }

            if let Some(entry) = registry.connections.get(&target_peer_id) {
                if entry.connection.is_open() {
                    return Ok(futures::future::ready(Ok(target_peer_id)).boxed().shared());
                }
                if let Some(promise) = entry.connection.promise() {
                    debug!(peer_id = %target_peer_id, "Joining pending connection attempt");
                    return Ok(promise);
                }
            }

            let connection = self.create_connection(target, None);
            if connection.is_offering() {
                connection.set_connection_id(Uuid::new_v4().to_string());
            }
            registry.connections.insert(
                target_peer_id.clone(),
                Entry {
                    connection: Arc::clone(&connection),
                    router_id: router_id.to_string(),
                },
            );
            connection
        };

        let promise = connection
            .promise()
            .ok_or_else(|| Error::Connection(ConnectionError::closed()))?;
        connection.connect()?;

        if !tracker_instructed && !connection.is_offering() {
            let signaller = Arc::clone(&self.signaller);
            let router_id = router_id.to_string();
            tokio::spawn(async move {
                if let Err(err) = signaller.send_rtc_connect(&router_id, &target_peer_id).await {
                    warn!(peer_id = %target_peer_id, error = %err, "Failed to send rtc connect");
                }
            });
        }

        Ok(promise)
    }

    /// Swap the registered connection to `peer_info` for a fresh one taking
    /// over its pending attempt. The caller starts the returned connection.
    fn replace_connection(
        &self,
        registry: &mut Registry,
        peer_info: PeerInfo,
        router_id: &str,
        connection_id: String,
    ) -> Arc<RtcConnection> {
        let peer_id = peer_info.peer_id.clone();
        let old = registry.connections.remove(&peer_id);
        let deferred = old
            .as_ref()
            .and_then(|entry| entry.connection.steal_deferred_connection_attempt());

        let connection = self.create_connection(peer_info, deferred);
        connection.set_connection_id(connection_id.clone());
        registry.connections.insert(
            peer_id.clone(),
            Entry {
                connection: Arc::clone(&connection),
                router_id: router_id.to_string(),
            },
        );
        self.metrics.record_replacement();

        if let Some(old) = old {
            info!(
                peer_id = %peer_id,
                old_connection_id = ?old.connection.connection_id(),
                connection_id = %connection_id,
                "Replacing connection"
            );
            old.connection.close(Some(ConnectionError::Closed(
                "replaced by new connection".to_string(),
            )));
        }

        connection
    }

    /// Registered connection and router id, if `id` is still the current
    /// connection for `peer_id`
    fn current(&self, peer_id: &str, id: u64) -> Option<(Arc<RtcConnection>, String)> {
        self.registry
            .lock()
            .connections
            .get(peer_id)
            .filter(|entry| entry.connection.id() == id)
            .map(|entry| (Arc::clone(&entry.connection), entry.router_id.clone()))
    }

    fn publish(&self, event: EndpointEvent) {
        let _ = self.events.send(event);
    }

    async fn handle_connection_event(&self, envelope: ConnectionEnvelope) {
        let ConnectionEnvelope { id, peer_id, event } = envelope;
        let current = self.current(&peer_id, id);

        match event {
            ConnectionEvent::LocalDescription { kind, sdp } => {
                let Some((connection, router_id)) = current else {
                    debug!(id, peer_id = %peer_id, "Dropping local description of replaced connection");
                    return;
                };
                let connection_id = connection.connection_id().unwrap_or_default();
                let result = match kind {
                    DescriptionKind::Offer => {
                        self.signaller
                            .send_rtc_offer(&router_id, &peer_id, &connection_id, &sdp)
                            .await
                    }
                    DescriptionKind::Answer => {
                        self.signaller
                            .send_rtc_answer(&router_id, &peer_id, &connection_id, &sdp)
                            .await
                    }
                };
                if let Err(err) = result {
                    warn!(peer_id = %peer_id, kind = kind.as_str(), error = %err, "Failed to relay description");
                }
            }
            ConnectionEvent::LocalCandidate { candidate, mid } => {
                let Some((connection, router_id)) = current else {
                    return;
                };
                let connection_id = connection.connection_id().unwrap_or_default();
                if let Err(err) = self
                    .signaller
                    .send_rtc_ice_candidate(&router_id, &peer_id, &connection_id, &candidate, &mid)
                    .await
                {
                    warn!(peer_id = %peer_id, error = %err, "Failed to relay ICE candidate");
                }
            }
            ConnectionEvent::Open => {
                let Some((connection, _)) = current else {
                    debug!(id, peer_id = %peer_id, "Replaced connection opened, ignoring");
                    return;
                };
                let peer_info = connection.peer_info();
                self.registry.lock().announced.insert(id, peer_info.clone());
                self.metrics.record_opened();
                info!(
                    peer_id = %peer_id,
                    connection_id = ?connection.connection_id(),
                    "Connected"
                );
                self.publish(EndpointEvent::PeerConnected(peer_info));
            }
            ConnectionEvent::Message(message) => {
                self.metrics.record_received();
                let peer_info = current
                    .map(|(connection, _)| connection.peer_info())
                    .unwrap_or_else(|| PeerInfo::new_unknown(peer_id.as_str()));
                self.publish(EndpointEvent::MessageReceived { peer_info, message });
            }
            ConnectionEvent::BufferHigh => {
                if let Some((connection, _)) = current {
                    self.publish(EndpointEvent::HighBackPressure(connection.peer_info()));
                }
            }
            ConnectionEvent::BufferLow => {
                if let Some((connection, _)) = current {
                    self.publish(EndpointEvent::LowBackPressure(connection.peer_info()));
                }
            }
            ConnectionEvent::Closed { reason, was_open } => {
                let announced = {
                    let mut registry = self.registry.lock();
                    if current.is_some() {
                        registry.connections.remove(&peer_id);
                    }
                    registry.announced.remove(&id)
                };
                debug!(id, peer_id = %peer_id, reason = %reason, was_open, "Connection closed");
                if let Some(peer_info) = announced {
                    self.metrics.record_closed();
                    info!(peer_id = %peer_id, reason = %reason, "Disconnected");
                    self.publish(EndpointEvent::PeerDisconnected { peer_info, reason });
                }
            }
        }
    }

    async fn handle_signal(&self, signal: Signal) {
        match signal {
            Signal::Offer(options) => self.on_offer(options).await,
            Signal::Answer(options) => self.on_answer(options).await,
            Signal::IceCandidate(options) => self.on_ice_candidate(options).await,
            Signal::Connect(options) => self.on_connect(options),
            Signal::Error(options) => self.on_error(options),
        }
    }

    #[instrument(skip(self, options), fields(peer_id = %options.originator_info.peer_id, connection_id = %options.connection_id))]
    async fn on_offer(&self, options: OfferOptions) {
        let OfferOptions {
            router_id,
            originator_info,
            connection_id,
            description,
        } = options;
        let peer_id = originator_info.peer_id.clone();

        if is_offering(self.self_id(), &peer_id) {
            warn!("Received offer from a peer that should answer, ignoring");
            return;
        }

        let (connection, start) = {
            let mut registry = self.registry.lock();
            if registry.stopped {
                return;
            }

            let existing = registry
                .connections
                .get(&peer_id)
                .map(|entry| Arc::clone(&entry.connection));

            match existing {
                Some(existing) => match existing.connection_id() {
                    Some(current) if current == connection_id => {
                        debug!("Duplicate offer for current negotiation, ignoring");
                        return;
                    }
                    Some(_) => {
                        let connection = self.replace_connection(
                            &mut registry,
                            originator_info,
                            &router_id,
                            connection_id,
                        );
                        (connection, true)
                    }
                    None if existing.state() == ConnectionState::Closed => {
                        let connection = self.replace_connection(
                            &mut registry,
                            originator_info,
                            &router_id,
                            connection_id,
                        );
                        (connection, true)
                    }
                    None => {
                        existing.set_connection_id(connection_id);
                        existing.set_peer_info(originator_info);
                        if let Some(entry) = registry.connections.get_mut(&peer_id) {
                            entry.router_id = router_id;
                        }
                        (existing, false)
                    }
                },
                None => {
                    let connection = self.create_connection(originator_info, None);
                    connection.set_connection_id(connection_id);
                    registry.connections.insert(
                        peer_id.clone(),
                        Entry {
                            connection: Arc::clone(&connection),
                            router_id,
                        },
                    );
                    (connection, true)
                }
            }
        };

        if start {
            if let Err(err) = connection.connect() {
                warn!(error = %err, "Failed to start connection for offer");
                return;
            }
        }

        if let Err(err) = connection
            .transport()
            .set_remote_description(DescriptionKind::Offer, &description)
            .await
        {
            warn!(error = %err, "Failed to apply remote offer");
            connection.close(Some(err));
        }
    }

    async fn on_answer(&self, options: AnswerOptions) {
        let peer_id = options.originator_info.peer_id.clone();
        let Some(connection) = self.matching_connection(&peer_id, &options.connection_id, "answer")
        else {
            return;
        };

        if connection.peer_info().is_unknown() {
            connection.set_peer_info(options.originator_info);
        }

        if let Err(err) = connection
            .transport()
            .set_remote_description(DescriptionKind::Answer, &options.description)
            .await
        {
            warn!(peer_id = %peer_id, error = %err, "Failed to apply remote answer");
            connection.close(Some(err));
        }
    }

    async fn on_ice_candidate(&self, options: IceCandidateOptions) {
        let peer_id = options.originator_info.peer_id.clone();
        let Some(connection) =
            self.matching_connection(&peer_id, &options.connection_id, "ICE candidate")
        else {
            return;
        };

        if let Err(err) = connection
            .transport()
            .add_remote_candidate(&options.candidate, &options.mid)
            .await
        {
            warn!(peer_id = %peer_id, error = %err, "Failed to add remote ICE candidate");
        }
    }

    /// Connection to `peer_id` whose negotiation round is `connection_id`.
    /// Anything else is a stale signal.
    fn matching_connection(
        &self,
        peer_id: &str,
        connection_id: &str,
        what: &str,
    ) -> Option<Arc<RtcConnection>> {
        let connection = self
            .registry
            .lock()
            .connections
            .get(peer_id)
            .map(|entry| Arc::clone(&entry.connection));

        match connection {
            None => {
                debug!(peer_id, what, "Signal for unknown connection, dropping");
                self.metrics.record_stale_signal();
                None
            }
            Some(connection) if connection.connection_id().as_deref() != Some(connection_id) => {
                debug!(
                    peer_id,
                    what,
                    expected = ?connection.connection_id(),
                    received = connection_id,
                    "Stale signal, dropping"
                );
                self.metrics.record_stale_signal();
                None
            }
            Some(connection) => Some(connection),
        }
    }

    fn on_connect(&self, options: ConnectOptions) {
        let ConnectOptions {
            router_id,
            originator_info,
            ..
        } = options;
        let peer_id = originator_info.peer_id.clone();

        if !is_offering(self.self_id(), &peer_id) {
            warn!(peer_id = %peer_id, "Received rtc connect from a peer that should offer, ignoring");
            return;
        }

        let replacement = {
            let mut registry = self.registry.lock();
            if registry.stopped {
                return;
            }
            if registry.connections.contains_key(&peer_id) {
                Some(self.replace_connection(
                    &mut registry,
                    originator_info.clone(),
                    &router_id,
                    Uuid::new_v4().to_string(),
                ))
            } else {
                None
            }
        };

        match replacement {
            Some(connection) => {
                if let Err(err) = connection.connect() {
                    warn!(peer_id = %peer_id, error = %err, "Failed to start replacement connection");
                }
            }
            None => {
                if let Err(err) = self.begin_connect(originator_info, &router_id, true) {
                    warn!(peer_id = %peer_id, error = %err, "Failed to connect on request");
                }
            }
        }
    }

    fn on_error(&self, options: ErrorOptions) {
        let connection = self
            .registry
            .lock()
            .connections
            .get(&options.target_node)
            .map(|entry| Arc::clone(&entry.connection));

        if let Some(connection) = connection {
            warn!(
                peer_id = %options.target_node,
                error_code = %options.error_code,
                "Signalling relay reported an error, closing connection"
            );
            connection.close(Some(ConnectionError::Transport(format!(
                "signalling error: {}",
                options.error_code
            ))));
        }
    }
}

impl std::fmt::Debug for WebRtcEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcEndpoint")
            .field("peer_id", &self.inner.peer_info.peer_id)
            .field("connections", &self.connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::mock::{MockRtcNetwork, MockSignallerHub, SignalRecord};
    use tokio_test::assert_err;

    fn endpoint(hub: &MockSignallerHub, network: &MockRtcNetwork, id: &str) -> WebRtcEndpoint {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("streamnet_transport=debug")
            .try_init();
        let signaller = hub.signaller(PeerInfo::new_node(id));
        WebRtcEndpoint::new(
            PeerInfo::new_node(id),
            WebRtcEndpointConfig::default(),
            signaller,
            Arc::new(network.clone()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let hub = MockSignallerHub::new();
        let network = MockRtcNetwork::new();
        let ep = endpoint(&hub, &network, "peer1");

        let err = assert_err!(ep.connect("peer1", "router", false).await);
        assert!(matches!(err, Error::SelfConnection(_)));
        assert_eq!(ep.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_after_stop_rejected() {
        let hub = MockSignallerHub::new();
        let network = MockRtcNetwork::new();
        let ep = endpoint(&hub, &network, "peer1");

        ep.stop().await;
        let err = assert_err!(ep.connect("peer2", "router", false).await);
        assert!(matches!(err, Error::EndpointStopped));
        assert_eq!(network.live_peer_count(), 0);
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let hub = MockSignallerHub::new();
        let network = MockRtcNetwork::new();
        let ep = endpoint(&hub, &network, "peer1");

        let err = assert_err!(ep.send("peer2", "hello").await);
        assert!(matches!(err, Error::NotConnected(ref p) if p == "peer2"));
    }

    #[tokio::test]
    async fn test_offerer_assigns_connection_id() {
        let hub = MockSignallerHub::new();
        let network = MockRtcNetwork::new();
        let signaller = hub.signaller(PeerInfo::new_node("peer1"));
        let ep = WebRtcEndpoint::new(
            PeerInfo::new_node("peer1"),
            WebRtcEndpointConfig::default(),
            signaller.clone(),
            Arc::new(network),
        )
        .unwrap();

        // Signals go nowhere, the attempt stays pending
        signaller.set_relay_enabled(false);
        let promise = ep
            .inner
            .begin_connect(PeerInfo::new_unknown("peer2"), "router", false)
            .unwrap();
        assert!(promise.peek().is_none());

        let connection_id = ep.connection_id("peer2").unwrap();
        assert!(Uuid::parse_str(&connection_id).is_ok());
        assert_eq!(ep.connection_state("peer2"), Some(ConnectionState::Connecting));
        assert!(!signaller
            .sent()
            .iter()
            .any(|record| matches!(record, SignalRecord::Connect { .. })));
    }
}
