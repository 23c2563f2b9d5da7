//! WebSocket binding of [`Transport`]

use super::codes::{close_frame_for, error_from_close};
use crate::connection::{Transport, TransportEvent, TransportEventSender};
use crate::error::ConnectionError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `do_close` waits for the close frame to be written
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Drives an already upgraded socket.
///
/// The socket is open as soon as `do_connect` starts its reader and writer
/// tasks. Outbound frames go through an unbounded channel to the writer;
/// the bytes still waiting there are the buffered amount.
pub struct WebSocketTransport {
    remote_address: String,
    stream: Mutex<Option<WsStream>>,
    events: TransportEventSender,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    open: Arc<AtomicBool>,
    buffered: Arc<AtomicUsize>,
    buffer_threshold_low: usize,
    max_message_size: usize,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    pub fn new(
        stream: WsStream,
        remote_address: impl Into<String>,
        max_message_size: usize,
        buffer_threshold_low: usize,
        events: TransportEventSender,
    ) -> Self {
        Self {
            remote_address: remote_address.into(),
            stream: Mutex::new(Some(stream)),
            events,
            outbound: Mutex::new(None),
            open: Arc::new(AtomicBool::new(false)),
            buffered: Arc::new(AtomicUsize::new(0)),
            buffer_threshold_low,
            max_message_size,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Queue a control frame. Control frames are not counted as buffered.
    fn send_control(&self, frame: Message) -> Result<(), ConnectionError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ConnectionError::Transport("socket is not open".to_string()));
        }
        match self.outbound.lock().as_ref() {
            Some(outbound) => outbound
                .send(frame)
                .map_err(|_| ConnectionError::Transport("socket writer stopped".to_string())),
            None => Err(ConnectionError::Transport("socket is not open".to_string())),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn do_connect(&self) -> Result<(), ConnectionError> {
        let stream = self
            .stream
            .lock()
            .take()
            .ok_or_else(|| ConnectionError::InvalidState("socket already started".to_string()))?;
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let events = self.events.clone();
        let buffered = Arc::clone(&self.buffered);
        let low = self.buffer_threshold_low;
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                let len = match &message {
                    Message::Text(text) => text.len(),
                    _ => 0,
                };

                if let Err(err) = sink.send(message).await {
                    let _ = events.send(TransportEvent::Error(format!("write failed: {}", err)));
                    break;
                }

                if len > 0 {
                    let before = buffered.fetch_sub(len, Ordering::SeqCst);
                    if before >= low && before - len < low {
                        let _ = events.send(TransportEvent::BufferedAmountLow);
                    }
                }
                if is_close {
                    break;
                }
            }
        });

        let events = self.events.clone();
        let open = Arc::clone(&self.open);
        let address = self.remote_address.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let _ = events.send(TransportEvent::Message(text));
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => {
                            let _ = events.send(TransportEvent::Message(text));
                        }
                        Err(err) => {
                            warn!(
                                address = %address,
                                "Dropping binary frame of {} bytes that is not UTF-8",
                                err.as_bytes().len()
                            );
                            let _ = events.send(TransportEvent::Error(format!(
                                "invalid UTF-8 in binary frame: {}",
                                err.utf8_error()
                            )));
                        }
                    },
                    // Pings are answered by tungstenite itself
                    Some(Ok(Message::Pong(_))) => {
                        let _ = events.send(TransportEvent::Pong);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = match frame {
                            Some(frame) => error_from_close(u16::from(frame.code), &frame.reason),
                            None => ConnectionError::Closed("1005: no reason".to_string()),
                        };
                        debug!(address = %address, reason = %reason, "Socket closed by peer");
                        break Some(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        break Some(ConnectionError::Transport(err.to_string()));
                    }
                    None => break None,
                }
            };
            open.store(false, Ordering::SeqCst);
            let _ = events.send(TransportEvent::Closed(reason));
        });

        *self.outbound.lock() = Some(tx);
        *self.writer.lock() = Some(writer);
        *self.reader.lock() = Some(reader);
        self.open.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Open);
        Ok(())
    }

    async fn do_close(&self, reason: ConnectionError) {
        self.open.store(false, Ordering::SeqCst);
        let frame = close_frame_for(&reason);

        // Never started: close the raw socket directly
        let unstarted = self.stream.lock().take();
        if let Some(mut stream) = unstarted {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, stream.close(Some(frame))).await;
            return;
        }

        if let Some(outbound) = self.outbound.lock().take() {
            let _ = outbound.send(Message::Close(Some(frame)));
        }

        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
                trace!(address = %self.remote_address, "Writer did not finish, aborting");
                writer.abort();
            }
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    async fn do_send_message(&self, message: &str) -> Result<bool, ConnectionError> {
        if !self.open.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let outbound = self.outbound.lock();
        let Some(outbound) = outbound.as_ref() else {
            return Ok(false);
        };
        self.buffered.fetch_add(message.len(), Ordering::SeqCst);
        if outbound.send(Message::Text(message.to_string())).is_err() {
            self.buffered.fetch_sub(message.len(), Ordering::SeqCst);
            return Ok(false);
        }
        Ok(true)
    }

    async fn send_ping(&self) -> Result<(), ConnectionError> {
        self.send_control(Message::Ping(Vec::new()))
    }

    async fn send_pong(&self) -> Result<(), ConnectionError> {
        self.send_control(Message::Pong(Vec::new()))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn describe_state(&self) -> String {
        format!(
            "socket to {} (open={}, buffered={})",
            self.remote_address,
            self.open.load(Ordering::SeqCst),
            self.buffered.load(Ordering::SeqCst)
        )
    }
}
