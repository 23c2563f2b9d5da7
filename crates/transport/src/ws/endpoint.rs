//! WebSocket listener, dialer and connection registry
//!
//! Sockets are registered by the canonical address of the remote node. When
//! two nodes dial each other at the same time each ends up with two sockets
//! for one address; both sides keep the socket dialled by the node with the
//! smaller address and close the other with `DUPLICATE_SOCKET`.

use super::codes::{close_frame_for, DisconnectionReason};
use super::handshake::{
    address_from_uri, build_url, canonical_address, listen_address, read_headers, write_headers,
    PEER_ID_HEADER,
};
use super::peer_book::PeerBook;
use super::transport::{WebSocketTransport, WsStream};
use crate::config::WsEndpointConfig;
use crate::connection::{
    Connection, ConnectionEnvelope, ConnectionEvent, ConnectionEventReceiver,
    ConnectionEventSender, ConnectionIdCounter, ConnectionOptions, ConnectionPromise,
    ConnectionState, DeferredConnectionAttempt,
};
use crate::error::{ConnectionError, Error, Result};
use crate::events::{self, EndpointEvent, EndpointEventReceiver, EndpointEventSender};
use crate::metrics::{EndpointMetrics, MetricsSnapshot};
use crate::peer_info::{PeerId, PeerInfo};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{accept_hdr_async, connect_async, MaybeTlsStream};
use tracing::{debug, info, instrument, trace, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub type WsConnection = Connection<WebSocketTransport>;

type DialFuture = Shared<BoxFuture<'static, std::result::Result<PeerId, ConnectionError>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The remote node dialled us
    Inbound,
    /// We dialled the remote node
    Outbound,
}

struct Entry {
    connection: Arc<WsConnection>,
    direction: Direction,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<String, Entry>,
    peer_book: PeerBook,
    /// Connections whose peer has been announced with `PeerConnected`,
    /// keyed by local id. Moves to the survivor of a duplicate socket.
    announced: HashMap<u64, PeerInfo>,
    stopped: bool,
}

impl Registry {
    fn address_of_connection(&self, id: u64) -> Option<String> {
        self.connections
            .iter()
            .find(|(_, entry)| entry.connection.id() == id)
            .map(|(address, _)| address.clone())
    }
}

struct Inner {
    peer_info: PeerInfo,
    config: WsEndpointConfig,
    address: String,
    local_addr: SocketAddr,
    registry: Mutex<Registry>,
    dialing: Mutex<HashMap<String, DialFuture>>,
    ids: ConnectionIdCounter,
    connection_events: ConnectionEventSender,
    events: EndpointEventSender,
    metrics: EndpointMetrics,
}

/// Accepts and dials WebSocket connections, keeping one per remote node
pub struct WsEndpoint {
    inner: Arc<Inner>,
    accept_loop: JoinHandle<()>,
    pump: JoinHandle<()>,
}

impl WsEndpoint {
    /// Bind the listener and start accepting connections
    #[instrument(skip(config), fields(peer_id = %peer_info.peer_id))]
    pub async fn start(peer_info: PeerInfo, config: WsEndpointConfig) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        let address = match &config.advertised_address {
            Some(advertised) => canonical_address(advertised)
                .map_err(|e| Error::InvalidConfig(e.to_string()))?,
            None => listen_address(&config.host, local_addr.port())
                .map_err(|e| Error::InvalidConfig(e.to_string()))?,
        };

        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            peer_info,
            config,
            address,
            local_addr,
            registry: Mutex::new(Registry::default()),
            dialing: Mutex::new(HashMap::new()),
            ids: ConnectionIdCounter::new(),
            connection_events: connection_tx,
            events: events::channel(),
            metrics: EndpointMetrics::new(),
        });

        let accept_loop = tokio::spawn(run_accept_loop(Arc::downgrade(&inner), listener));
        let pump = tokio::spawn(run_pump(Arc::downgrade(&inner), connection_rx));

        info!(address = %inner.address, local_addr = %local_addr, "WebSocket endpoint listening");
        Ok(Self {
            inner,
            accept_loop,
            pump,
        })
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.inner.peer_info
    }

    /// Address other nodes dial to reach us
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Connect to the node at `address` and return its peer id.
    ///
    /// Resolves immediately if a socket to that address is open. Concurrent
    /// calls for the same address share one dial.
    #[instrument(skip(self), fields(self_address = %self.inner.address))]
    pub async fn connect(&self, address: &str) -> Result<PeerId> {
        let address = canonical_address(address)?;

        let pending = {
            let registry = self.inner.registry.lock();
            if registry.stopped {
                return Err(Error::EndpointStopped);
            }
            if address == self.inner.address {
                return Err(Error::SelfConnection(address));
            }
            match registry.connections.get(&address) {
                Some(entry) if entry.connection.is_open() => {
                    return Ok(entry.connection.peer_id());
                }
                Some(entry) => entry.connection.promise(),
                None => None,
            }
        };
        if let Some(promise) = pending {
            return Ok(promise.await?);
        }

        let dial = {
            let mut dialing = self.inner.dialing.lock();
            dialing
                .entry(address.clone())
                .or_insert_with(|| self.inner.spawn_dial(address.clone()))
                .clone()
        };
        Ok(dial.await?)
    }

    /// Dials in flight, including those whose callers went away
    pub fn pending_dials(&self) -> usize {
        self.inner.dialing.lock().len()
    }

    /// Queue `message` for `peer_id`
    pub async fn send(&self, peer_id: &str, message: impl Into<String>) -> Result<PeerId> {
        let connection = {
            let registry = self.inner.registry.lock();
            if registry.stopped {
                return Err(Error::EndpointStopped);
            }
            registry
                .peer_book
                .address_of(peer_id)
                .ok()
                .and_then(|address| registry.connections.get(address))
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

    /// Close the socket to `peer_id`. `reason` may be one of the
    /// [`DisconnectionReason`] strings to send its code. No-op if not
    /// connected.
    pub fn close(&self, peer_id: &str, reason: &str) {
        let connection = {
            let mut registry = self.inner.registry.lock();
            let Ok(address) = registry.peer_book.address_of(peer_id).map(str::to_string) else {
                return;
            };
            registry.peer_book.remove_by_address(&address);
            registry.connections.remove(&address)
        };

        if let Some(entry) = connection {
            info!(peer_id, reason, "Closing connection");
            entry
                .connection
                .close(Some(ConnectionError::Closed(reason.to_string())));
        }
    }

    /// Stop accepting, then close every socket with `GRACEFUL_SHUTDOWN`
    #[instrument(skip(self), fields(address = %self.inner.address))]
    pub async fn stop(&self) {
        let connections: Vec<_> = {
            let mut registry = self.inner.registry.lock();
            registry.stopped = true;
            registry.peer_book = PeerBook::new();
            registry
                .connections
                .drain()
                .map(|(_, entry)| entry.connection)
                .collect()
        };
        self.accept_loop.abort();

        let reason = ConnectionError::Closed(DisconnectionReason::GracefulShutdown.reason().to_string());
        for connection in &connections {
            connection.close(Some(reason.clone()));
        }

        let teardown = futures::future::join_all(connections.iter().map(|c| c.wait_closed()));
        if tokio::time::timeout(STOP_TIMEOUT, teardown).await.is_err() {
            warn!("Timed out waiting for sockets to close");
        }

        info!("WebSocket endpoint stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.registry.lock().stopped
    }

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
        let registry = self.inner.registry.lock();
        registry
            .peer_book
            .address_of(peer_id)
            .ok()
            .and_then(|address| registry.connections.get(address))
            .is_some_and(|entry| entry.connection.is_open())
    }

    /// Address the peer's socket is registered under
    pub fn resolve_address(&self, peer_id: &str) -> Option<String> {
        self.inner
            .registry
            .lock()
            .peer_book
            .address_of(peer_id)
            .ok()
            .map(str::to_string)
    }

    pub fn connection_direction(&self, address: &str) -> Option<Direction> {
        self.inner
            .registry
            .lock()
            .connections
            .get(address)
            .map(|entry| entry.direction)
    }

    /// Number of registered sockets, open or not
    pub fn connection_count(&self) -> usize {
        self.inner.registry.lock().connections.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn subscribe(&self) -> EndpointEventReceiver {
        self.inner.events.subscribe()
    }

    fn open_connections(&self) -> Vec<Arc<WsConnection>> {
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

impl Drop for WsEndpoint {
    fn drop(&mut self) {
        self.accept_loop.abort();
        self.pump.abort();
    }
}

impl std::fmt::Debug for WsEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsEndpoint")
            .field("address", &self.inner.address)
            .field("connections", &self.connection_count())
            .finish()
    }
}

async fn run_accept_loop(inner: Weak<Inner>, listener: TcpListener) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "Failed to accept connection");
                continue;
            }
        };
        let Some(inner) = inner.upgrade() else { break };
        if inner.registry.lock().stopped {
            break;
        }
        tokio::spawn(inner.accept_socket(stream, remote));
    }
}

async fn run_pump(inner: Weak<Inner>, mut connection_rx: ConnectionEventReceiver) {
    while let Some(envelope) = connection_rx.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        inner.handle_connection_event(envelope);
    }
}

/// Close a socket that never became a connection
async fn reject_socket(mut stream: WsStream, reason: ConnectionError) {
    let frame = close_frame_for(&reason);
    let _ = tokio::time::timeout(Duration::from_secs(1), stream.close(Some(frame))).await;
}

impl Inner {
    fn publish(&self, event: EndpointEvent) {
        let _ = self.events.send(event);
    }

    fn timeout_error(&self) -> ConnectionError {
        ConnectionError::ConnectionTimeout {
            timeout_ms: self.config.connection.new_connection_timeout_ms,
        }
    }

    async fn accept_socket(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let mut handshake = None;
        let self_info = self.peer_info.clone();
        let callback = |request: &Request,
                        mut response: Response|
         -> std::result::Result<Response, ErrorResponse> {
            let result = read_headers(request.headers()).and_then(|peer_info| {
                let address = canonical_address(&address_from_uri(request.uri())?)?;
                Ok((peer_info, address))
            });
            if result.is_ok() {
                if let Err(err) = write_headers(response.headers_mut(), &self_info) {
                    warn!(error = %err, "Failed to write handshake headers");
                }
            }
            handshake = Some(result);
            Ok(response)
        };

        let upgrade = tokio::time::timeout(
            self.config.connection.new_connection_timeout(),
            accept_hdr_async(MaybeTlsStream::Plain(stream), callback),
        )
        .await;
        let ws = match upgrade {
            Ok(Ok(ws)) => ws,
            Ok(Err(err)) => {
                debug!(remote = %remote, error = %err, "WebSocket upgrade failed");
                return;
            }
            Err(_) => {
                debug!(remote = %remote, "WebSocket upgrade timed out");
                return;
            }
        };

        let handshake =
            handshake.unwrap_or_else(|| Err(ConnectionError::MissingParameter(PEER_ID_HEADER.to_string())));
        let (peer_info, address) = match handshake {
            Ok(identified) => identified,
            Err(err) => {
                warn!(remote = %remote, error = %err, "Rejecting connection");
                self.metrics.record_handshake_rejection();
                reject_socket(ws, err).await;
                return;
            }
        };

        debug!(remote = %remote, peer = %peer_info, address = %address, "Inbound socket");
        if let Err(err) = self.register_socket(ws, peer_info, address, Direction::Inbound) {
            debug!(remote = %remote, error = %err, "Inbound socket not registered");
        }
    }

    /// Run a dial to completion in its own task and forget it afterwards,
    /// whether or not anyone is still waiting for it. Called with the
    /// `dialing` lock held, so the task cannot remove its entry before it
    /// is inserted.
    fn spawn_dial(self: &Arc<Self>, address: String) -> DialFuture {
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = Arc::clone(&inner).dial(address.clone()).await;
            inner.dialing.lock().remove(&address);
            result
        });
        async move {
            task.await.unwrap_or_else(|err| {
                Err(ConnectionError::Transport(format!("dial task failed: {}", err)))
            })
        }
        .boxed()
        .shared()
    }

    async fn dial(self: Arc<Self>, address: String) -> std::result::Result<PeerId, ConnectionError> {
        let url = build_url(&address, &self.address)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        write_headers(request.headers_mut(), &self.peer_info)?;

        debug!(address = %address, "Dialling");
        let (ws, response) = match tokio::time::timeout(
            self.config.connection.new_connection_timeout(),
            connect_async(request),
        )
        .await
        {
            Ok(Ok(connected)) => connected,
            Ok(Err(err)) => return Err(ConnectionError::Transport(err.to_string())),
            Err(_) => return Err(self.timeout_error()),
        };

        let peer_info = match read_headers(response.headers()) {
            Ok(peer_info) => peer_info,
            Err(err) => {
                warn!(address = %address, error = %err, "Peer answered without identity");
                reject_socket(ws, err.clone()).await;
                return Err(err);
            }
        };

        if peer_info.peer_id == self.peer_info.peer_id {
            let err = ConnectionError::Closed(format!("{} is our own address", address));
            reject_socket(ws, err.clone()).await;
            return Err(err);
        }

        self.register_socket(ws, peer_info, address, Direction::Outbound)?
            .await
    }

    /// Register an upgraded socket, applying the duplicate socket tie-break.
    ///
    /// Returns the promise of whichever connection ends up registered for
    /// `address`.
    fn register_socket(
        &self,
        ws: WsStream,
        peer_info: PeerInfo,
        address: String,
        direction: Direction,
    ) -> std::result::Result<ConnectionPromise, ConnectionError> {
        if !self.peer_info.shares_protocol_with(&peer_info) {
            warn!(
                peer = %peer_info,
                ours = ?(&self.peer_info.control_layer_versions, &self.peer_info.message_layer_versions),
                theirs = ?(&peer_info.control_layer_versions, &peer_info.message_layer_versions),
                "No shared protocol versions"
            );
        }

        let mut registry = self.registry.lock();
        if registry.stopped {
            drop(registry);
            let reason = ConnectionError::Closed(DisconnectionReason::GracefulShutdown.reason().to_string());
            tokio::spawn(reject_socket(ws, reason.clone()));
            return Err(reason);
        }

        let existing = registry
            .connections
            .get(&address)
            .filter(|entry| entry.connection.state() != ConnectionState::Closed)
            .map(|entry| Arc::clone(&entry.connection));

        if let Some(existing) = &existing {
            // Keep the socket dialled by the node with the smaller address
            let keep_new = (direction == Direction::Outbound) == (self.address < address);
            if !keep_new {
                drop(registry);
                self.metrics.record_duplicate_socket();
                debug!(address = %address, ?direction, "Dropping duplicate socket");
                tokio::spawn(reject_socket(ws, ConnectionError::DuplicateSocket));

                let peer_id = existing.peer_id();
                return Ok(existing
                    .promise()
                    .unwrap_or_else(|| futures::future::ready(Ok(peer_id)).boxed().shared()));
            }
        }

        let old = registry.connections.remove(&address);
        let deferred: Option<DeferredConnectionAttempt> = old
            .as_ref()
            .and_then(|entry| entry.connection.steal_deferred_connection_attempt());
        let connection = self.create_connection(ws, peer_info.clone(), &address, deferred);
        let promise = connection
            .promise()
            .ok_or_else(ConnectionError::closed)?;

        if let Some(old) = &old {
            if let Some(peer_info) = registry.announced.remove(&old.connection.id()) {
                registry.announced.insert(connection.id(), peer_info);
            }
        }
        registry.connections.insert(
            address.clone(),
            Entry {
                connection: Arc::clone(&connection),
                direction,
            },
        );
        registry.peer_book.add(&address, peer_info);
        drop(registry);

        if let Some(old) = old {
            if existing.is_some() {
                self.metrics.record_duplicate_socket();
                debug!(address = %address, ?direction, "Replacing duplicate socket");
            }
            old.connection.close(Some(ConnectionError::DuplicateSocket));
        }

        connection.connect()?;
        Ok(promise)
    }

    fn create_connection(
        &self,
        ws: WsStream,
        peer_info: PeerInfo,
        address: &str,
        deferred: Option<DeferredConnectionAttempt>,
    ) -> Arc<WsConnection> {
        let max_message_size = self.config.connection.max_message_size;
        let buffer_threshold_low = self.config.connection.buffer_threshold_low;
        let address = address.to_string();

        Connection::new(
            ConnectionOptions {
                id: self.ids.next(),
                self_id: self.peer_info.peer_id.clone(),
                peer_info,
                config: self.config.connection.clone(),
                events: self.connection_events.clone(),
                deferred,
            },
            move |events| {
                WebSocketTransport::new(ws, address, max_message_size, buffer_threshold_low, events)
            },
        )
    }

    fn handle_connection_event(&self, envelope: ConnectionEnvelope) {
        let ConnectionEnvelope { id, peer_id, event } = envelope;

        match event {
            ConnectionEvent::Open => {
                let announce = {
                    let mut registry = self.registry.lock();
                    let Some(address) = registry.address_of_connection(id) else {
                        return;
                    };
                    if registry.announced.contains_key(&id) {
                        None
                    } else {
                        let peer_info = registry
                            .connections
                            .get(&address)
                            .map(|entry| entry.connection.peer_info())
                            .unwrap_or_else(|| PeerInfo::new_unknown(peer_id.as_str()));
                        registry.announced.insert(id, peer_info.clone());
                        Some((address, peer_info))
                    }
                };
                if let Some((address, peer_info)) = announce {
                    self.metrics.record_opened();
                    info!(peer = %peer_info, address = %address, "Connected");
                    self.publish(EndpointEvent::PeerConnected(peer_info));
                }
            }
            ConnectionEvent::Closed { reason, .. } => {
                let announced = {
                    let mut registry = self.registry.lock();
                    if let Some(address) = registry.address_of_connection(id) {
                        registry.connections.remove(&address);
                        registry.peer_book.remove_by_address(&address);
                    }
                    registry.announced.remove(&id)
                };
                debug!(id, peer_id = %peer_id, reason = %reason, "Socket closed");
                if let Some(peer_info) = announced {
                    self.metrics.record_closed();
                    info!(peer = %peer_info, reason = %reason, "Disconnected");
                    self.publish(EndpointEvent::PeerDisconnected { peer_info, reason });
                }
            }
            ConnectionEvent::Message(message) => {
                self.metrics.record_received();
                let peer_info = self.peer_info_of(id, &peer_id);
                self.publish(EndpointEvent::MessageReceived { peer_info, message });
            }
            ConnectionEvent::BufferHigh => {
                let peer_info = self.peer_info_of(id, &peer_id);
                self.publish(EndpointEvent::HighBackPressure(peer_info));
            }
            ConnectionEvent::BufferLow => {
                let peer_info = self.peer_info_of(id, &peer_id);
                self.publish(EndpointEvent::LowBackPressure(peer_info));
            }
            ConnectionEvent::LocalDescription { .. } | ConnectionEvent::LocalCandidate { .. } => {
                trace!(id, "Ignoring signalling event on a socket");
            }
        }
    }

    fn peer_info_of(&self, id: u64, peer_id: &str) -> PeerInfo {
        let registry = self.registry.lock();
        registry
            .address_of_connection(id)
            .and_then(|address| registry.connections.get(&address))
            .map(|entry| entry.connection.peer_info())
            .unwrap_or_else(|| PeerInfo::new_unknown(peer_id))
    }
}
