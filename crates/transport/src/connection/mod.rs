//! Per-peer duplex connection state machine
//!
//! A [`Connection`] owns one outbound [`MessageQueue`], one
//! [`DeferredConnectionAttempt`] and the timers driving the connection
//! timeout, ping/pong liveness and flush retries. Everything that differs
//! between WebRTC and WebSocket lives behind the [`Transport`] trait.
//!
//! Lifecycle: `New -> Connecting -> Open -> Closed`. `Closed` is terminal and
//! re-entering it is a no-op. A connection is never reused for a second
//! negotiation; replacements are new instances that may take over the
//! deferred attempt via [`Connection::steal_deferred_connection_attempt`].

pub mod deferred;
pub mod queue;
pub mod timers;
pub mod transport;

pub use deferred::{ConnectionPromise, DeferredConnectionAttempt};
pub use queue::{MessageQueue, QueueItem, SendOutcome, MAX_TRIES};
pub use timers::{TaskTimers, TimerKind};
pub use transport::{
    DescriptionKind, Transport, TransportEvent, TransportEventReceiver, TransportEventSender,
};

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::peer_info::{PeerId, PeerInfo};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, instrument, trace, warn};

/// Messages handed to the transport before yielding to other tasks
const FLUSH_BATCH_SIZE: usize = 10;

/// Returns true if `self_id` sends the SDP offer to `peer_id`.
///
/// Both peers evaluate this independently and always agree on exactly one
/// offerer for any pair of distinct ids.
pub fn is_offering(self_id: &str, peer_id: &str) -> bool {
    self_id < peer_id
}

/// Allocates locally unique, monotonically increasing connection ids
#[derive(Debug, Default)]
pub struct ConnectionIdCounter(AtomicU64);

impl ConnectionIdCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Open,
    Closed,
}

/// Notifications a connection sends to its owning endpoint
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Open,
    Closed {
        reason: ConnectionError,
        was_open: bool,
    },
    Message(String),
    BufferHigh,
    BufferLow,
    LocalDescription {
        kind: DescriptionKind,
        sdp: String,
    },
    LocalCandidate {
        candidate: String,
        mid: String,
    },
}

/// A [`ConnectionEvent`] tagged with its source connection
#[derive(Debug, Clone)]
pub struct ConnectionEnvelope {
    pub id: u64,
    pub peer_id: PeerId,
    pub event: ConnectionEvent,
}

pub type ConnectionEventSender = mpsc::UnboundedSender<ConnectionEnvelope>;
pub type ConnectionEventReceiver = mpsc::UnboundedReceiver<ConnectionEnvelope>;

/// Construction parameters for [`Connection::new`]
pub struct ConnectionOptions {
    pub id: u64,
    pub self_id: PeerId,
    pub peer_info: PeerInfo,
    pub config: ConnectionConfig,
    pub events: ConnectionEventSender,
    /// Attempt taken over from a replaced connection, if any
    pub deferred: Option<DeferredConnectionAttempt>,
}

#[derive(Debug, Default)]
struct PingState {
    attempts: u32,
    last_ping_sent_at: Option<Instant>,
    rtt: Option<Duration>,
}

pub struct Connection<T: Transport> {
    id: u64,
    self_id: PeerId,
    peer_info: Mutex<PeerInfo>,
    connection_id: Mutex<Option<String>>,
    config: ConnectionConfig,
    state: Mutex<ConnectionState>,
    queue: Mutex<MessageQueue>,
    deferred: Mutex<Option<DeferredConnectionAttempt>>,
    timers: TaskTimers,
    ping: Mutex<PingState>,
    paused: AtomicBool,
    flush_lock: tokio::sync::Mutex<()>,
    flush_requested: AtomicBool,
    closing: Mutex<Option<JoinHandle<()>>>,
    transport: T,
    transport_events: Mutex<Option<TransportEventReceiver>>,
    events: ConnectionEventSender,
    this: Weak<Self>,
}

impl<T: Transport> Connection<T> {
    /// Create a connection in state `New`.
    ///
    /// `make_transport` receives the sender the transport must report its
    /// events through.
    pub fn new<F>(options: ConnectionOptions, make_transport: F) -> Arc<Self>
    where
        F: FnOnce(TransportEventSender) -> T,
    {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = make_transport(transport_tx);
        let deferred = options.deferred.unwrap_or_default();

        Arc::new_cyclic(|this| Self {
            id: options.id,
            self_id: options.self_id,
            peer_info: Mutex::new(options.peer_info),
            connection_id: Mutex::new(None),
            queue: Mutex::new(MessageQueue::new(options.config.max_queue_size)),
            config: options.config,
            state: Mutex::new(ConnectionState::New),
            deferred: Mutex::new(Some(deferred)),
            timers: TaskTimers::new(),
            ping: Mutex::new(PingState::default()),
            paused: AtomicBool::new(false),
            flush_lock: tokio::sync::Mutex::new(()),
            flush_requested: AtomicBool::new(false),
            closing: Mutex::new(None),
            transport,
            transport_events: Mutex::new(Some(transport_rx)),
            events: options.events,
            this: this.clone(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_info.lock().peer_id.clone()
    }

    pub fn peer_info(&self) -> PeerInfo {
        self.peer_info.lock().clone()
    }

    pub fn set_peer_info(&self, peer_info: PeerInfo) {
        *self.peer_info.lock() = peer_info;
    }

    /// Negotiation round shared with the peer, if assigned
    pub fn connection_id(&self) -> Option<String> {
        self.connection_id.lock().clone()
    }

    pub fn set_connection_id(&self, connection_id: impl Into<String>) {
        *self.connection_id.lock() = Some(connection_id.into());
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn is_offering(&self) -> bool {
        is_offering(&self.self_id, &self.peer_info.lock().peer_id)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn queue_size(&self) -> usize {
        self.queue.lock().size()
    }

    /// Last measured round-trip time
    pub fn rtt(&self) -> Option<Duration> {
        self.ping.lock().rtt
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Promise of the pending connection attempt. `None` once it has settled.
    pub fn promise(&self) -> Option<ConnectionPromise> {
        self.deferred.lock().as_ref().map(|d| d.promise())
    }

    /// Take ownership of the pending attempt so a replacement can settle it
    pub fn steal_deferred_connection_attempt(&self) -> Option<DeferredConnectionAttempt> {
        self.deferred.lock().take()
    }

    /// Start negotiating.
    ///
    /// # Errors
    ///
    /// `AlreadyClosed` on a closed connection, `InvalidState` if `connect()`
    /// was already called.
    #[instrument(skip(self), fields(id = self.id, peer_id = %self.peer_id()))]
    pub fn connect(&self) -> Result<(), ConnectionError> {
        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::New => *state = ConnectionState::Connecting,
                ConnectionState::Closed => return Err(ConnectionError::AlreadyClosed),
                other => {
                    return Err(ConnectionError::InvalidState(format!(
                        "connect() called while {:?}",
                        other
                    )))
                }
            }
        }

        self.start_event_pump();

        let timeout = self.config.new_connection_timeout();
        let this = self.this.clone();
        self.timers
            .schedule(TimerKind::ConnectionTimeout, timeout, async move {
                if let Some(conn) = this.upgrade() {
                    if conn.state() != ConnectionState::Open {
                        warn!(
                            id = conn.id,
                            peer_id = %conn.peer_id(),
                            "Connection not open after {:?}, closing",
                            timeout
                        );
                        conn.close(Some(ConnectionError::ConnectionTimeout {
                            timeout_ms: timeout.as_millis() as u64,
                        }));
                    }
                }
            });

        let this = self.this.clone();
        tokio::spawn(async move {
            let Some(conn) = this.upgrade() else { return };
            if let Err(err) = conn.transport.do_connect().await {
                warn!(id = conn.id, error = %err, "Transport failed to connect");
                conn.close(Some(err));
            }
        });

        Ok(())
    }

    /// Queue `message` for delivery.
    ///
    /// Never blocks. The returned future settles when this particular
    /// message is handed to the transport, or is dropped.
    pub fn send(&self, message: String) -> impl Future<Output = SendOutcome> + Send + 'static {
        let receiver = {
            let mut queue = self.queue.lock();
            if self.state() == ConnectionState::Closed {
                None
            } else {
                Some(queue.add(message))
            }
        };

        if receiver.is_some() {
            self.request_flush();
        }

        async move {
            match receiver {
                Some(receiver) => receiver
                    .await
                    .unwrap_or_else(|_| Err(ConnectionError::closed())),
                None => Err(ConnectionError::AlreadyClosed),
            }
        }
    }

    /// Close the connection. Idempotent.
    ///
    /// Cancels every timer, tears down the transport, rejects queued
    /// messages and the pending attempt with `reason` (default `"closed"`),
    /// then emits a single `Closed` event.
    #[instrument(skip(self), fields(id = self.id, peer_id = %self.peer_id()))]
    pub fn close(&self, reason: Option<ConnectionError>) {
        let previous = {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            std::mem::replace(&mut *state, ConnectionState::Closed)
        };
        let reason = reason.unwrap_or_else(ConnectionError::closed);
        debug!(reason = %reason, "Closing connection");

        self.timers.cancel_all();

        if let Some(conn) = self.this.upgrade() {
            let close_reason = reason.clone();
            let handle = tokio::spawn(async move {
                conn.transport.do_close(close_reason).await;
            });
            *self.closing.lock() = Some(handle);
        }

        {
            let mut ping = self.ping.lock();
            ping.attempts = 0;
            ping.last_ping_sent_at = None;
        }
        self.paused.store(false, Ordering::SeqCst);
        self.queue.lock().clear(reason.clone());

        if let Some(deferred) = self.deferred.lock().take() {
            deferred.reject(reason.clone());
        }

        self.emit(ConnectionEvent::Closed {
            reason,
            was_open: previous == ConnectionState::Open,
        });
    }

    /// Wait for the transport teardown started by `close()`
    pub async fn wait_closed(&self) {
        let handle = self.closing.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Send one ping.
    ///
    /// Closes with `DeadConnection` once `max_ping_pong_attempts` pings went
    /// unanswered. Returns false when the connection is not open.
    pub async fn ping(&self) -> bool {
        if self.state() != ConnectionState::Open {
            return false;
        }

        let exhausted = {
            let mut ping = self.ping.lock();
            if ping.attempts >= self.config.max_ping_pong_attempts {
                true
            } else {
                ping.attempts += 1;
                ping.last_ping_sent_at = Some(Instant::now());
                false
            }
        };

        if exhausted {
            warn!(
                id = self.id,
                peer_id = %self.peer_id(),
                "Failed to receive any pong after {} ping attempts, closing connection",
                self.config.max_ping_pong_attempts
            );
            self.close(Some(ConnectionError::DeadConnection));
            return false;
        }

        if let Err(err) = self.transport.send_ping().await {
            debug!(id = self.id, error = %err, "Failed to send ping");
        }
        true
    }

    fn on_pong(&self) {
        let mut ping = self.ping.lock();
        ping.attempts = 0;
        if let Some(sent_at) = ping.last_ping_sent_at.take() {
            ping.rtt = Some(sent_at.elapsed());
        }
    }

    fn on_open(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::New | ConnectionState::Connecting => {
                    *state = ConnectionState::Open
                }
                _ => return,
            }
        }

        debug!(id = self.id, peer_id = %self.peer_id(), "Connection open");
        self.timers.cancel(TimerKind::ConnectionTimeout);

        if let Some(deferred) = self.deferred.lock().take() {
            deferred.resolve(self.peer_id());
        }

        self.emit(ConnectionEvent::Open);
        self.start_ping_loop();
        self.request_flush();
    }

    fn on_buffered_amount_low(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            debug!(id = self.id, "Buffered amount low, resuming sends");
            self.emit(ConnectionEvent::BufferLow);
            self.request_flush();
        }
    }

    fn start_event_pump(&self) {
        let Some(mut receiver) = self.transport_events.lock().take() else {
            return;
        };
        let this = self.this.clone();
        self.timers.spawn(TimerKind::EventPump, async move {
            while let Some(event) = receiver.recv().await {
                let Some(conn) = this.upgrade() else { break };
                conn.handle_transport_event(event).await;
                if conn.state() == ConnectionState::Closed {
                    break;
                }
            }
        });
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        trace!(id = self.id, ?event, "Transport event");
        match event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::Closed(reason) => {
                self.close(Some(reason.unwrap_or_else(ConnectionError::closed)))
            }
            TransportEvent::Error(err) => {
                warn!(id = self.id, peer_id = %self.peer_id(), error = %err, "Transport error")
            }
            TransportEvent::Message(message) => self.emit(ConnectionEvent::Message(message)),
            TransportEvent::Ping => {
                if let Err(err) = self.transport.send_pong().await {
                    debug!(id = self.id, error = %err, "Failed to send pong");
                }
            }
            TransportEvent::Pong => self.on_pong(),
            TransportEvent::BufferedAmountLow => self.on_buffered_amount_low(),
            TransportEvent::LocalDescription { kind, sdp } => {
                self.emit(ConnectionEvent::LocalDescription { kind, sdp })
            }
            TransportEvent::LocalCandidate { candidate, mid } => {
                self.emit(ConnectionEvent::LocalCandidate { candidate, mid })
            }
        }
    }

    fn start_ping_loop(&self) {
        let this = self.this.clone();
        let interval = self.config.ping_interval();
        self.timers.spawn(TimerKind::Ping, async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(conn) = this.upgrade() else { break };
                if !conn.ping().await {
                    break;
                }
            }
        });
    }

    fn request_flush(&self) {
        self.flush_requested.store(true, Ordering::SeqCst);
        if let Some(conn) = self.this.upgrade() {
            tokio::spawn(conn.attempt_to_flush_messages());
        }
    }

    fn schedule_flush_retry(&self) {
        let this = self.this.clone();
        self.timers.schedule(
            TimerKind::FlushRetry,
            self.config.flush_retry_timeout(),
            async move {
                if let Some(conn) = this.upgrade() {
                    conn.request_flush();
                }
            },
        );
    }

    /// Run flushes until no trigger is pending.
    ///
    /// Only one flush runs at a time. A trigger that arrives while a flush
    /// holds the lock is picked up by that flush's next iteration.
    async fn attempt_to_flush_messages(self: Arc<Self>) {
        loop {
            {
                let Ok(_guard) = self.flush_lock.try_lock() else {
                    return;
                };
                while self.flush_requested.swap(false, Ordering::SeqCst) {
                    self.flush().await;
                }
            }
            // A trigger that lost the race for the lock just before release
            if !self.flush_requested.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    async fn flush(&self) {
        let mut flushed_in_batch = 0;

        loop {
            if self.state() != ConnectionState::Open || !self.transport.is_open() {
                return;
            }

            if flushed_in_batch >= FLUSH_BATCH_SIZE {
                flushed_in_batch = 0;
                tokio::task::yield_now().await;
                continue;
            }

            let (seq, message, failed) = {
                let queue = self.queue.lock();
                match queue.peek() {
                    Some(item) => (item.seq(), item.message().to_owned(), item.is_failed()),
                    None => return,
                }
            };

            if failed {
                if let Some(item) = self.queue.lock().pop_if(seq) {
                    let failure = item.failure();
                    item.reject(failure);
                }
                continue;
            }

            let max = self.transport.max_message_size();
            if message.len() > max {
                error!(
                    id = self.id,
                    peer_id = %self.peer_id(),
                    "Dropping message of {} bytes, maximum is {}",
                    message.len(),
                    max
                );
                if let Some(item) = self.queue.lock().pop_if(seq) {
                    item.reject(ConnectionError::MessageTooLarge {
                        size: message.len(),
                        max,
                    });
                }
                continue;
            }

            if self.paused.load(Ordering::SeqCst)
                || self.transport.buffered_amount().await >= self.config.buffer_threshold_high
            {
                if !self.paused.swap(true, Ordering::SeqCst) {
                    debug!(id = self.id, "Buffered amount high, pausing sends");
                    self.emit(ConnectionEvent::BufferHigh);
                }
                // The low watermark may have been crossed before we paused
                if self.transport.buffered_amount().await < self.config.buffer_threshold_low
                    && self.paused.swap(false, Ordering::SeqCst)
                {
                    self.emit(ConnectionEvent::BufferLow);
                    continue;
                }
                return;
            }

            let result = self.transport.do_send_message(&message).await;
            // A send may report success while the channel closed mid-call
            let delivered = matches!(result, Ok(true)) && self.transport.is_open();

            if delivered {
                if let Some(item) = self.queue.lock().pop_if(seq) {
                    item.delivered();
                }
                flushed_in_batch += 1;
                continue;
            }

            let info = match result {
                Err(err) => format!("{} ({})", err, self.transport.describe_state()),
                Ok(true) => format!(
                    "channel closed during send ({})",
                    self.transport.describe_state()
                ),
                Ok(false) => format!(
                    "send not accepted ({})",
                    self.transport.describe_state()
                ),
            };
            debug!(id = self.id, info = %info, "Failed to send message");

            let exhausted = {
                let mut queue = self.queue.lock();
                match queue.peek_mut() {
                    Some(item) if item.seq() == seq => {
                        item.increment_tries(info);
                        item.is_failed()
                    }
                    _ => false,
                }
            };

            if exhausted {
                if let Some(item) = self.queue.lock().pop_if(seq) {
                    let failure = item.failure();
                    warn!(
                        id = self.id,
                        peer_id = %self.peer_id(),
                        error = %failure,
                        "Dropping message after {} tries",
                        MAX_TRIES
                    );
                    item.reject(failure);
                }
                continue;
            }

            self.schedule_flush_retry();
            return;
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(ConnectionEnvelope {
            id: self.id,
            peer_id: self.peer_id(),
            event,
        });
    }
}

impl<T: Transport> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id())
            .field("connection_id", &self.connection_id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize};
    use tokio::time::timeout;
    use tokio_test::{assert_err, assert_ok};

    struct MockTransport {
        events: TransportEventSender,
        auto_open: bool,
        answer_pings: bool,
        open: AtomicBool,
        sent: Mutex<Vec<String>>,
        pings: AtomicU32,
        buffered: AtomicUsize,
        failing_sends: AtomicU32,
        /// Next send is accepted while the channel goes down underneath it
        close_during_send: AtomicBool,
        close_calls: AtomicU32,
    }

    impl MockTransport {
        fn new(events: TransportEventSender, auto_open: bool, answer_pings: bool) -> Self {
            Self {
                events,
                auto_open,
                answer_pings,
                open: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
                pings: AtomicU32::new(0),
                buffered: AtomicUsize::new(0),
                failing_sends: AtomicU32::new(0),
                close_during_send: AtomicBool::new(false),
                close_calls: AtomicU32::new(0),
            }
        }

        fn open_now(&self) {
            self.open.store(true, Ordering::SeqCst);
            let _ = self.events.send(TransportEvent::Open);
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn do_connect(&self) -> Result<(), ConnectionError> {
            if self.auto_open {
                self.open_now();
            }
            Ok(())
        }

        async fn do_close(&self, _reason: ConnectionError) {
            self.open.store(false, Ordering::SeqCst);
            self.close_calls.fetch_add(1, Ordering::SeqCst);
        }

        async fn do_send_message(&self, message: &str) -> Result<bool, ConnectionError> {
            if self.failing_sends.load(Ordering::SeqCst) > 0 {
                self.failing_sends.fetch_sub(1, Ordering::SeqCst);
                return Err(ConnectionError::Transport("flaky".to_string()));
            }
            self.sent.lock().push(message.to_string());
            if self.close_during_send.swap(false, Ordering::SeqCst) {
                self.open.store(false, Ordering::SeqCst);
                return Ok(true);
            }
            Ok(self.open.load(Ordering::SeqCst))
        }

        async fn send_ping(&self) -> Result<(), ConnectionError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.answer_pings {
                let _ = self.events.send(TransportEvent::Pong);
            }
            Ok(())
        }

        async fn send_pong(&self) -> Result<(), ConnectionError> {
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        fn max_message_size(&self) -> usize {
            64
        }

        fn describe_state(&self) -> String {
            format!("mock open={}", self.open.load(Ordering::SeqCst))
        }
    }

    fn quiet_config() -> ConnectionConfig {
        ConnectionConfig {
            ping_interval_ms: 60_000,
            ..Default::default()
        }
    }

    fn connection(
        config: ConnectionConfig,
        auto_open: bool,
        answer_pings: bool,
    ) -> (Arc<Connection<MockTransport>>, ConnectionEventReceiver) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("streamnet_transport=debug")
            .try_init();

        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new(
            ConnectionOptions {
                id: 1,
                self_id: "peer1".to_string(),
                peer_info: PeerInfo::new_unknown("peer2"),
                config,
                events: tx,
                deferred: None,
            },
            |events| MockTransport::new(events, auto_open, answer_pings),
        );
        (conn, rx)
    }

    async fn next_event(rx: &mut ConnectionEventReceiver) -> ConnectionEvent {
        timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out waiting for connection event")
            .expect("event channel closed")
            .event
    }

    async fn wait_open(rx: &mut ConnectionEventReceiver) {
        assert!(matches!(next_event(rx).await, ConnectionEvent::Open));
    }

    #[test]
    fn test_is_offering_is_antisymmetric() {
        let ids = ["peer1", "peer2", "a", "B", "node-0x01", "node-0x10", ""];
        for a in ids {
            for b in ids {
                if a != b {
                    assert_ne!(is_offering(a, b), is_offering(b, a), "{} vs {}", a, b);
                }
            }
        }
        assert!(is_offering("peer1", "peer2"));
    }

    #[test]
    fn test_id_counter_is_monotonic() {
        let counter = ConnectionIdCounter::new();
        let first = counter.next();
        assert!(counter.next() > first);
    }

    #[tokio::test]
    async fn test_connect_after_close_fails() {
        let (conn, _rx) = connection(quiet_config(), true, true);
        conn.close(None);
        assert_eq!(conn.connect(), Err(ConnectionError::AlreadyClosed));
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let (conn, _rx) = connection(quiet_config(), false, true);
        assert_ok!(conn.connect());
        assert!(matches!(
            conn.connect(),
            Err(ConnectionError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_open_resolves_attempt() {
        let (conn, mut rx) = connection(quiet_config(), true, true);
        let promise = conn.promise().unwrap();
        assert_ok!(conn.connect());

        wait_open(&mut rx).await;
        assert_eq!(promise.await, Ok("peer2".to_string()));
        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(conn.promise().is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, mut rx) = connection(quiet_config(), true, true);
        assert_ok!(conn.connect());
        wait_open(&mut rx).await;

        conn.close(None);
        conn.close(Some(ConnectionError::DeadConnection));

        match next_event(&mut rx).await {
            ConnectionEvent::Closed { reason, was_open } => {
                assert_eq!(reason, ConnectionError::closed());
                assert!(was_open);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());

        conn.wait_closed().await;
        assert_eq!(conn.transport().close_calls.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_rejects_pending_attempt() {
        let (conn, _rx) = connection(quiet_config(), false, true);
        assert_ok!(conn.connect());
        let promise = conn.promise().unwrap();

        conn.close(None);
        assert_eq!(promise.await, Err(ConnectionError::closed()));
    }

    #[tokio::test]
    async fn test_close_rejects_queued_messages() {
        let (conn, _rx) = connection(quiet_config(), false, true);
        assert_ok!(conn.connect());
        let pending = conn.send("hello".to_string());

        conn.close(Some(ConnectionError::DeadConnection));
        assert_eq!(pending.await, Err(ConnectionError::DeadConnection));
        assert_eq!(
            conn.send("late".to_string()).await,
            Err(ConnectionError::AlreadyClosed)
        );
    }

    #[tokio::test]
    async fn test_messages_queued_before_open_are_delivered_in_order() {
        let (conn, mut rx) = connection(quiet_config(), false, true);
        assert_ok!(conn.connect());

        let mut first = Box::pin(conn.send("a".to_string()));
        let second = conn.send("b".to_string());
        assert!(timeout(Duration::from_millis(50), &mut first).await.is_err());
        assert_eq!(conn.queue_size(), 2);

        conn.transport().open_now();
        wait_open(&mut rx).await;

        assert_ok!(first.await);
        assert_ok!(second.await);
        assert_eq!(conn.transport().sent(), vec!["a", "b"]);
        assert_eq!(conn.queue_size(), 0);
    }

    #[tokio::test]
    async fn test_oversized_message_dropped_connection_survives() {
        let (conn, mut rx) = connection(quiet_config(), true, true);
        assert_ok!(conn.connect());
        wait_open(&mut rx).await;

        let result = conn.send("x".repeat(100)).await;
        assert_eq!(
            result,
            Err(ConnectionError::MessageTooLarge { size: 100, max: 64 })
        );

        assert_ok!(conn.send("ok".to_string()).await);
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(conn.transport().sent(), vec!["ok"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_is_retried() {
        let (conn, mut rx) = connection(quiet_config(), true, true);
        assert_ok!(conn.connect());
        wait_open(&mut rx).await;

        conn.transport().failing_sends.store(3, Ordering::SeqCst);
        assert_ok!(conn.send("retry me".to_string()).await);
        assert_eq!(conn.transport().sent(), vec!["retry me"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_gives_up_after_max_tries() {
        let (conn, mut rx) = connection(quiet_config(), true, true);
        assert_ok!(conn.connect());
        wait_open(&mut rx).await;

        conn.transport().failing_sends.store(1_000, Ordering::SeqCst);
        let err = assert_err!(conn.send("doomed".to_string()).await);
        match err {
            ConnectionError::SendFailed { tries, infos } => {
                assert_eq!(tries, MAX_TRIES);
                assert_eq!(infos.len(), MAX_TRIES as usize);
                assert!(infos[0].contains("flaky"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_accepted_by_closing_channel_stays_queued() {
        let (conn, mut rx) = connection(quiet_config(), true, true);
        assert_ok!(conn.connect());
        wait_open(&mut rx).await;

        conn.transport().close_during_send.store(true, Ordering::SeqCst);
        let mut pending = Box::pin(conn.send("in flight".to_string()));
        assert!(timeout(Duration::from_secs(5), &mut pending).await.is_err());

        assert_eq!(conn.transport().sent(), vec!["in flight"]);
        assert_eq!(conn.queue_size(), 1);
        assert_eq!(conn.queue.lock().peek().map(|item| item.tries()), Some(1));

        let lost = ConnectionError::Transport("channel lost".to_string());
        conn.close(Some(lost.clone()));
        assert_eq!(pending.await, Err(lost));
    }

    #[tokio::test]
    async fn test_backpressure_emits_single_high_and_low() {
        let (conn, mut rx) = connection(quiet_config(), true, true);
        assert_ok!(conn.connect());
        wait_open(&mut rx).await;

        conn.transport().buffered.store(200_000, Ordering::SeqCst);
        let first = conn.send("a".to_string());
        assert!(matches!(next_event(&mut rx).await, ConnectionEvent::BufferHigh));

        let second = conn.send("b".to_string());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(conn.is_paused());
        assert!(rx.try_recv().is_err());

        conn.transport().buffered.store(0, Ordering::SeqCst);
        let _ = conn.transport().events.send(TransportEvent::BufferedAmountLow);

        assert!(matches!(next_event(&mut rx).await, ConnectionEvent::BufferLow));
        assert_ok!(first.await);
        assert_ok!(second.await);
        assert_eq!(conn.transport().sent(), vec!["a", "b"]);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_timeout() {
        let (conn, mut rx) = connection(quiet_config(), false, true);
        let promise = conn.promise().unwrap();
        assert_ok!(conn.connect());

        assert_eq!(
            promise.await,
            Err(ConnectionError::ConnectionTimeout { timeout_ms: 15_000 })
        );
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            next_event(&mut rx).await,
            ConnectionEvent::Closed { was_open: false, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_pings_close_dead_connection() {
        let (conn, mut rx) = connection(ConnectionConfig::default(), true, false);
        assert_ok!(conn.connect());
        wait_open(&mut rx).await;

        match next_event(&mut rx).await {
            ConnectionEvent::Closed { reason, was_open } => {
                assert_eq!(reason, ConnectionError::DeadConnection);
                assert!(was_open);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(conn.transport().pings.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_records_rtt_and_keeps_alive() {
        let (conn, mut rx) = connection(ConnectionConfig::default(), true, true);
        assert_ok!(conn.connect());
        wait_open(&mut rx).await;
        assert!(conn.rtt().is_none());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(conn.rtt().is_some());
        assert!(conn.transport().pings.load(Ordering::SeqCst) >= 10);
    }

    #[tokio::test]
    async fn test_stolen_attempt_is_not_rejected_on_close() {
        let (conn, _rx) = connection(quiet_config(), false, true);
        let promise = conn.promise().unwrap();
        let stolen = conn.steal_deferred_connection_attempt().unwrap();

        conn.close(None);
        stolen.resolve("peer2".to_string());
        assert_eq!(promise.await, Ok("peer2".to_string()));
    }
}
