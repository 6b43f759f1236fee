//! WebSocket transport: one persistent connection to the collaboration relay.
//!
//! Provides:
//! - Connection lifecycle (connect with timeout, disconnect)
//! - A bounded outbound queue ([`Outbox`]) drained by a writer task
//! - Inbound raw frames delivered as [`TransportEvent`]s
//! - Exponential-backoff reconnection after an unexpected close
//!
//! ```text
//!  components ──Outbox──► [bounded queue] ──writer task──► WebSocket
//!                                                             │
//!  dispatcher ◄──TransportEvent── reader task ◄───────────────┘
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{split_frames, OutboundFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the transport toward the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One raw JSON frame (a single line of a text message)
    Frame(String),
    /// Socket opened; `reconnected` is set when this ends a backoff cycle
    Connected { reconnected: bool },
    /// Socket closed without `disconnect()` being called
    Closed,
    /// A reconnection attempt has been scheduled
    Reconnecting { attempt: u32, delay: Duration },
    /// Backoff gave up; the session must be rejoined manually
    ReconnectExhausted { attempts: u32 },
}

/// Exponential backoff: attempt `n` (1-based) waits `base_delay × 2^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt, or `None` once exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1)?;
        self.base_delay.checked_mul(factor)
    }

    /// The full backoff schedule.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_attempts).filter_map(|n| self.delay_for(n)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("connection to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
}

/// Handle for enqueueing outbound frames. Cheap to clone.
///
/// Sending never blocks: a full queue drops the frame.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<OutboundFrame>,
}

impl Outbox {
    /// Create an outbox and the receiving end of its bounded queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue a frame. Returns `false` if it was dropped.
    pub fn send(&self, frame: OutboundFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                log::warn!("Outbound queue full, dropping {} frame", frame.kind());
                false
            }
            Err(TrySendError::Closed(frame)) => {
                log::debug!("Outbound queue closed, dropping {} frame", frame.kind());
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    /// Write whatever is queued, then close the socket
    Flush,
    /// The socket is gone; leave queued frames for the next connection
    Abort,
}

struct Connection {
    shutdown: watch::Sender<Option<Shutdown>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

/// The transport. Owned by the session manager behind an `Arc`.
pub struct Transport {
    url: String,
    connect_timeout: Duration,
    policy: ReconnectPolicy,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Bumped on every open and on `disconnect()`; stale readers stay silent
    generation: Arc<AtomicU64>,

    /// Failed reconnection attempts since the last successful open
    attempts: AtomicU32,

    outbox: Outbox,
    outbound_rx: Arc<Mutex<mpsc::Receiver<OutboundFrame>>>,

    events_tx: mpsc::Sender<TransportEvent>,

    connection: Mutex<Option<Connection>>,
}

impl Transport {
    /// Create a disconnected transport. Returns the event receiver the
    /// dispatcher drains.
    pub fn new(
        url: impl Into<String>,
        connect_timeout: Duration,
        policy: ReconnectPolicy,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (outbox, outbound_rx) = Outbox::channel(queue_capacity);
        let (events_tx, events_rx) = mpsc::channel(1024);
        let transport = Self {
            url: url.into(),
            connect_timeout,
            policy,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            generation: Arc::new(AtomicU64::new(0)),
            attempts: AtomicU32::new(0),
            outbox,
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
            events_tx,
            connection: Mutex::new(None),
        };
        (transport, events_rx)
    }

    /// A handle for enqueueing frames on this transport.
    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Failed reconnection attempts in the current backoff cycle.
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Open the connection. No-op if already connected.
    ///
    /// Fails if the socket is not open within the connect timeout.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let (previous, expected) = {
            let mut state = self.state.write().await;
            if *state == ConnectionState::Connected {
                return Ok(());
            }
            let expected = self.generation.load(Ordering::SeqCst);
            (std::mem::replace(&mut *state, ConnectionState::Connecting), expected)
        };

        // Frames queued with no connection belong to no one.
        if previous == ConnectionState::Disconnected {
            self.discard_pending().await;
        }

        match self.open(expected, false).await {
            Ok(true) => {
                self.attempts.store(0, Ordering::SeqCst);
                Ok(())
            }
            Ok(false) => Err(TransportError::Connect {
                url: self.url.clone(),
                reason: "cancelled by disconnect".to_string(),
            }),
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Close the connection on purpose. Frames already queued are written
    /// before the close; nothing queued afterwards survives.
    pub async fn disconnect(&self) {
        {
            let mut state = self.state.write().await;
            self.generation.fetch_add(1, Ordering::SeqCst);
            *state = ConnectionState::Disconnected;
        }

        let connection = self.connection.lock().await.take();
        if let Some(mut conn) = connection {
            let _ = conn.shutdown.send(Some(Shutdown::Flush));
            if tokio::time::timeout(self.connect_timeout, &mut conn.writer).await.is_err() {
                log::warn!("Timed out flushing outbound frames, closing anyway");
                conn.writer.abort();
            }
            conn.reader.abort();
            log::info!("Disconnected from collaboration server");
        }
        self.discard_pending().await;
    }

    /// Start the backoff cycle after an unexpected close.
    ///
    /// Returns `false` if a cycle is already running or the transport is
    /// connected again.
    pub async fn begin_reconnect(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state.write().await;
            if matches!(*state, ConnectionState::Reconnecting | ConnectionState::Connected) {
                return false;
            }
            *state = ConnectionState::Reconnecting;
        }

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            transport.reconnect_loop().await;
        });
        true
    }

    async fn reconnect_loop(&self) {
        loop {
            let attempt = self.attempts.load(Ordering::SeqCst) + 1;
            let Some(delay) = self.policy.delay_for(attempt) else {
                let attempts = attempt - 1;
                log::error!(
                    "Lost connection to collaboration server after {attempts} reconnection attempts"
                );
                *self.state.write().await = ConnectionState::Disconnected;
                self.discard_pending().await;
                let _ = self
                    .events_tx
                    .send(TransportEvent::ReconnectExhausted { attempts })
                    .await;
                return;
            };

            self.attempts.store(attempt, Ordering::SeqCst);
            log::info!(
                "Attempting to reconnect ({attempt}/{}) in {}ms",
                self.policy.max_attempts,
                delay.as_millis()
            );
            let _ = self
                .events_tx
                .send(TransportEvent::Reconnecting { attempt, delay })
                .await;

            tokio::time::sleep(delay).await;

            let expected = {
                let state = self.state.read().await;
                if *state != ConnectionState::Reconnecting {
                    log::debug!("Reconnection cancelled");
                    return;
                }
                self.generation.load(Ordering::SeqCst)
            };

            match self.open(expected, true).await {
                Ok(true) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    return;
                }
                Ok(false) => {
                    log::debug!("Reconnection cancelled");
                    return;
                }
                Err(e) => log::error!("Reconnection failed: {e}"),
            }
        }
    }

    /// Dial the relay and spawn the reader/writer tasks.
    ///
    /// The socket is only installed if no `disconnect()` happened since
    /// `expected` was read; otherwise it is closed and `Ok(false)` returned.
    async fn open(&self, expected: u64, reconnected: bool) -> Result<bool, TransportError> {
        let dial = tokio_tungstenite::connect_async(self.url.as_str());
        let ws_stream = match tokio::time::timeout(self.connect_timeout, dial).await {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                return Err(TransportError::Connect {
                    url: self.url.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(TransportError::Timeout {
                    url: self.url.clone(),
                    timeout: self.connect_timeout,
                })
            }
        };

        // Lock order: connection, then state. `disconnect()` bumps the
        // generation under the state lock, so it either finds this socket
        // installed or we find the bump.
        let mut connection = self.connection.lock().await;
        let mut state = self.state.write().await;
        if self.generation.load(Ordering::SeqCst) != expected {
            drop(state);
            drop(connection);
            let mut ws_stream = ws_stream;
            let _ = ws_stream.close(None).await;
            return Ok(false);
        }

        let (ws_writer, ws_reader) = ws_stream.split();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (shutdown_tx, shutdown_rx) = watch::channel(None);

        *state = ConnectionState::Connected;
        drop(state);

        let writer = tokio::spawn(write_loop(ws_writer, self.outbound_rx.clone(), shutdown_rx));
        let reader = tokio::spawn(read_loop(
            ws_reader,
            ReaderContext {
                generation,
                current_generation: self.generation.clone(),
                state: self.state.clone(),
                events_tx: self.events_tx.clone(),
                shutdown: shutdown_tx.clone(),
            },
        ));

        let previous = connection.replace(Connection {
            shutdown: shutdown_tx,
            writer,
            reader,
        });
        drop(connection);
        if let Some(old) = previous {
            old.reader.abort();
        }

        log::info!("Connected to collaboration server at {}", self.url);
        let _ = self
            .events_tx
            .send(TransportEvent::Connected { reconnected })
            .await;
        Ok(true)
    }

    async fn discard_pending(&self) {
        let mut rx = self.outbound_rx.lock().await;
        let mut dropped = 0usize;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            log::debug!("Discarded {dropped} unsent frames");
        }
    }
}

/// Writer task: forward the outbound queue to the socket.
async fn write_loop(
    mut ws_writer: SplitSink<WsStream, WsMessage>,
    outbound: Arc<Mutex<mpsc::Receiver<OutboundFrame>>>,
    mut shutdown: watch::Receiver<Option<Shutdown>>,
) {
    // Held for the lifetime of this connection; the next writer waits here.
    let mut rx = outbound.lock().await;

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                let mode = if changed.is_ok() { *shutdown.borrow() } else { Some(Shutdown::Abort) };
                if mode == Some(Shutdown::Flush) {
                    while let Ok(frame) = rx.try_recv() {
                        if write_frame(&mut ws_writer, &frame).await.is_err() {
                            break;
                        }
                    }
                    let _ = ws_writer.close().await;
                }
                break;
            }

            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if write_frame(&mut ws_writer, &frame).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn write_frame(
    ws_writer: &mut SplitSink<WsStream, WsMessage>,
    frame: &OutboundFrame,
) -> Result<(), ()> {
    let text = match frame.encode() {
        Ok(text) => text,
        Err(e) => {
            log::warn!("Dropping unencodable {} frame: {e}", frame.kind());
            return Ok(());
        }
    };
    log::trace!("-> {}", frame.kind());
    ws_writer.send(WsMessage::text(text)).await.map_err(|e| {
        log::warn!("Failed to write {} frame: {e}", frame.kind());
    })
}

struct ReaderContext {
    generation: u64,
    current_generation: Arc<AtomicU64>,
    state: Arc<RwLock<ConnectionState>>,
    events_tx: mpsc::Sender<TransportEvent>,
    shutdown: watch::Sender<Option<Shutdown>>,
}

/// Reader task: split text messages into frames for the dispatcher.
async fn read_loop(mut ws_reader: SplitStream<WsStream>, ctx: ReaderContext) {
    while let Some(msg) = ws_reader.next().await {
        let text = match msg {
            Ok(WsMessage::Text(text)) => text.as_str().to_owned(),
            Ok(WsMessage::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    log::warn!("Ignoring non-UTF-8 binary message ({} bytes)", data.len());
                    continue;
                }
            },
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        for line in split_frames(&text) {
            if ctx.events_tx.send(TransportEvent::Frame(line.to_string())).await.is_err() {
                return;
            }
        }
    }

    if ctx.current_generation.load(Ordering::SeqCst) != ctx.generation {
        return;
    }

    log::info!("Disconnected from collaboration server");
    let _ = ctx.shutdown.send(Some(Shutdown::Abort));
    *ctx.state.write().await = ConnectionState::Disconnected;
    let _ = ctx.events_tx.send(TransportEvent::Closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::User;

    fn test_transport(url: &str) -> (Arc<Transport>, mpsc::Receiver<TransportEvent>) {
        let (transport, events) = Transport::new(
            url,
            Duration::from_millis(500),
            ReconnectPolicy::default(),
            4,
        );
        (Arc::new(transport), events)
    }

    #[test]
    fn test_default_backoff_schedule() {
        let policy = ReconnectPolicy::default();
        let schedule: Vec<u64> = policy.schedule().iter().map(|d| d.as_millis() as u64).collect();
        assert_eq!(schedule, vec![1000, 2000, 4000, 8000, 16000]);
    }

    #[test]
    fn test_no_sixth_attempt() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(5), Some(Duration::from_secs(16)));
        assert_eq!(policy.delay_for(6), None);
        assert_eq!(policy.delay_for(0), None);
    }

    #[test]
    fn test_custom_policy() {
        let policy = ReconnectPolicy { base_delay: Duration::from_millis(10), max_attempts: 3 };
        assert_eq!(
            policy.schedule(),
            vec![Duration::from_millis(10), Duration::from_millis(20), Duration::from_millis(40)]
        );
    }

    #[tokio::test]
    async fn test_outbox_drops_when_full() {
        let (outbox, mut rx) = Outbox::channel(2);
        let frame = OutboundFrame::LeaveSession { session_id: "s".into(), user_id: "u".into() };

        assert!(outbox.send(frame.clone()));
        assert!(outbox.send(frame.clone()));
        assert!(!outbox.send(frame.clone()));

        assert_eq!(rx.recv().await, Some(frame));
    }

    #[tokio::test]
    async fn test_outbox_closed_receiver() {
        let (outbox, rx) = Outbox::channel(2);
        drop(rx);
        let user = User::new("Alice");
        assert!(!outbox.send(OutboundFrame::JoinSession { session_id: "s".into(), user }));
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (transport, _events) = test_transport("ws://127.0.0.1:1");
        assert_eq!(transport.state().await, ConnectionState::Disconnected);
        assert!(!transport.is_connected().await);
        assert_eq!(transport.reconnect_attempts(), 0);
        assert_eq!(transport.url(), "ws://127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_connect_refused_returns_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (transport, _events) = test_transport(&format!("ws://127.0.0.1:{port}"));
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert_eq!(transport.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_times_out_without_handshake() {
        // Accepts TCP but never answers the WebSocket handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let (transport, _events) = Transport::new(
            format!("ws://127.0.0.1:{port}"),
            Duration::from_millis(100),
            ReconnectPolicy::default(),
            4,
        );
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_when_idle_is_noop() {
        let (transport, _events) = test_transport("ws://127.0.0.1:1");
        transport.outbox().send(OutboundFrame::LeaveSession {
            session_id: "s".into(),
            user_id: "u".into(),
        });
        transport.disconnect().await;
        assert_eq!(transport.state().await, ConnectionState::Disconnected);
        // Pending frames are discarded.
        assert!(transport.outbound_rx.lock().await.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_discards_frames_queued_while_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (transport, _events) = test_transport(&format!("ws://127.0.0.1:{port}"));
        assert!(transport.outbox().send(OutboundFrame::LeaveSession {
            session_id: "session_old".into(),
            user_id: "u".into(),
        }));

        assert!(transport.connect().await.is_err());
        assert!(transport.outbound_rx.lock().await.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_gives_up_on_stalled_peer() {
        // Completes the handshake, then never reads.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let _ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let (transport, _events) = Transport::new(
            format!("ws://127.0.0.1:{port}"),
            Duration::from_millis(300),
            ReconnectPolicy::default(),
            4,
        );
        transport.connect().await.unwrap();

        // Far more than the socket buffers can absorb.
        let author = User::with_id("user_a", "Alice");
        for _ in 0..4 {
            let message = crate::model::Message::new(
                "session_s",
                &author,
                "x".repeat(8 * 1024 * 1024),
                vec![],
                None,
            );
            transport.outbox().send(OutboundFrame::ChatMessage { message });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(3), transport.disconnect())
            .await
            .expect("disconnect hung on a stalled peer");
        assert_eq!(transport.state().await, ConnectionState::Disconnected);
    }
}
