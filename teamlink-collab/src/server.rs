//! Reference relay server.
//!
//! ```text
//! Client A ──┐
//!            ├── Room (session id) ── BroadcastGroup ──┬──► Client A (skips own frames)
//! Client B ──┘         │                               ├──► Client B
//!                      ├── roster                      └──► Client C
//!                      ├── comments
//!                      └── last relayed version per document
//! ```
//!
//! Everything lives in memory. The relay holds no document text: a
//! `sync_document` is answered with the latest relayed version and empty
//! content.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{BroadcastGroup, RelayedFrame};
use crate::model::{Comment, DocumentUri, Session, User};
use crate::protocol::{split_frames, InboundFrame, OutboundFrame};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Joins beyond this roster size are refused
    pub max_participants: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            max_participants: 50,
            broadcast_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub active_rooms: usize,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// One session room.
struct Room {
    session: Session,
    broadcast: Arc<BroadcastGroup>,
    /// user id → connection currently representing that user
    members: HashMap<String, u64>,
    comments: HashMap<String, Comment>,
    versions: HashMap<DocumentUri, u64>,
}

impl Room {
    fn new(session: Session, capacity: usize) -> Self {
        Self {
            session,
            broadcast: Arc::new(BroadcastGroup::new(capacity)),
            members: HashMap::new(),
            comments: HashMap::new(),
            versions: HashMap::new(),
        }
    }
}

/// Per-connection routing state.
struct Membership {
    session_id: String,
    user_id: String,
    rx: broadcast::Receiver<Arc<RelayedFrame>>,
}

struct Shared {
    config: RelayConfig,
    rooms: RwLock<HashMap<String, Room>>,
    stats: RwLock<RelayStats>,
    next_connection: AtomicU64,
}

/// The relay. Cheap to clone; clones share rooms and stats.
#[derive(Clone)]
pub struct RelayServer {
    shared: Arc<Shared>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                rooms: RwLock::new(HashMap::new()),
                stats: RwLock::new(RelayStats::default()),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }

    /// Bind the configured address and serve until an accept fails.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.shared.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = shared.handle_connection(stream, addr).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.shared.stats.read().await.clone()
    }

    pub async fn room_count(&self) -> usize {
        self.shared.rooms.read().await.len()
    }

    /// Roster of a room, if it exists.
    pub async fn participants(&self, session_id: &str) -> Option<Vec<User>> {
        let rooms = self.shared.rooms.read().await;
        rooms.get(session_id).map(|room| room.session.participant_list())
    }
}

impl Shared {
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), RelayError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let conn_id = self.next_connection.fetch_add(1, Ordering::SeqCst);

        log::info!("WebSocket connection {conn_id} established from {addr}");
        {
            let mut stats = self.stats.write().await;
            stats.total_connections += 1;
            stats.active_connections += 1;
        }

        let mut membership: Option<Membership> = None;
        let result = self.pump(conn_id, ws_stream, &mut membership).await;

        if let Some(m) = membership.take() {
            self.depart(conn_id, &m.session_id, &m.user_id).await;
        }
        self.stats.write().await.active_connections -= 1;
        log::info!("Connection {conn_id} from {addr} closed");
        result
    }

    /// Read client frames and forward room traffic until the socket closes.
    async fn pump(
        &self,
        conn_id: u64,
        ws_stream: WebSocketStream<TcpStream>,
        membership: &mut Option<Membership>,
    ) -> Result<(), RelayError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let text = match msg {
                        Some(Ok(WsMessage::Text(text))) => text.as_str().to_owned(),
                        Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(e.into()),
                    };

                    for line in split_frames(&text) {
                        let frame = match OutboundFrame::decode(line) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Connection {conn_id}: dropping frame: {e}");
                                continue;
                            }
                        };
                        self.stats.write().await.total_frames += 1;

                        for reply in self.handle_frame(conn_id, frame, membership).await {
                            ws_sender.send(WsMessage::text(reply)).await?;
                        }
                    }
                }

                relayed = recv_relayed(membership) => {
                    match relayed {
                        Ok(frame) if frame.origin == conn_id => {}
                        Ok(frame) => ws_sender.send(WsMessage::text(frame.text.clone())).await?,
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Connection {conn_id} lagged, {n} frames dropped");
                            if let Some(m) = membership.as_ref() {
                                if let Some(room) = self.rooms.read().await.get(&m.session_id) {
                                    room.broadcast.record_dropped(n);
                                }
                            }
                        }
                        Err(RecvError::Closed) => *membership = None,
                    }
                }
            }
        }
    }

    /// Apply one client frame. Returns frames to send back to the origin.
    async fn handle_frame(
        &self,
        conn_id: u64,
        frame: OutboundFrame,
        membership: &mut Option<Membership>,
    ) -> Vec<String> {
        log::debug!("Connection {conn_id} -> {}", frame.kind());
        let mut replies = Vec::new();

        match frame {
            OutboundFrame::CreateSession { session } => {
                let session_id = session.id.clone();
                let owner_id = session.owner_id.clone();
                let rx = {
                    let mut rooms = self.rooms.write().await;
                    let room = rooms
                        .entry(session_id.clone())
                        .or_insert_with(|| Room::new(session, self.config.broadcast_capacity));
                    room.members.insert(owner_id.clone(), conn_id);
                    room.broadcast.subscribe()
                };
                self.switch_membership(conn_id, membership, session_id.clone(), owner_id, rx)
                    .await;
                self.refresh_room_count().await;
                log::info!("Session {session_id} created");
            }

            OutboundFrame::JoinSession { session_id, user } => {
                let joined = {
                    let mut rooms = self.rooms.write().await;
                    match rooms.get_mut(&session_id) {
                        None => {
                            log::warn!("Join for unknown session {session_id}");
                            None
                        }
                        Some(room)
                            if !room.session.participants.contains_key(&user.id)
                                && room.session.participants.len() >= self.config.max_participants =>
                        {
                            log::warn!("Session {session_id} is full, refusing {}", user.id);
                            None
                        }
                        Some(room) => {
                            room.session.add_participant(user.clone());
                            room.members.insert(user.id.clone(), conn_id);
                            let _ = room
                                .broadcast
                                .broadcast(conn_id, &InboundFrame::UserJoined { user: user.clone() });
                            Some((room.session.clone(), room.broadcast.subscribe()))
                        }
                    }
                };

                if let Some((session, rx)) = joined {
                    self.switch_membership(conn_id, membership, session_id.clone(), user.id.clone(), rx)
                        .await;
                    log::info!("{} joined session {session_id}", user.name);
                    push_encoded(&mut replies, &InboundFrame::SessionJoined { session });
                }
            }

            OutboundFrame::LeaveSession { session_id, user_id } => {
                if membership.as_ref().is_some_and(|m| m.session_id == session_id) {
                    *membership = None;
                }
                self.depart(conn_id, &session_id, &user_id).await;
            }

            OutboundFrame::PresenceUpdate { session_id, presence } => {
                self.relay(conn_id, &session_id, &InboundFrame::PresenceUpdate { presence })
                    .await;
            }

            OutboundFrame::DocumentOperation { session_id, operation } => {
                {
                    let mut rooms = self.rooms.write().await;
                    if let Some(room) = rooms.get_mut(&session_id) {
                        room.versions
                            .insert(operation.document_uri.clone(), operation.version);
                    }
                }
                self.relay(conn_id, &session_id, &InboundFrame::DocumentOperation { operation })
                    .await;
            }

            OutboundFrame::SyncDocument { session_id, document_uri } => {
                let version = {
                    let rooms = self.rooms.read().await;
                    rooms
                        .get(&session_id)
                        .and_then(|room| room.versions.get(&document_uri).copied())
                        .unwrap_or(0)
                };
                push_encoded(
                    &mut replies,
                    &InboundFrame::DocumentSync { document_uri, content: String::new(), version },
                );
            }

            OutboundFrame::ChatMessage { message } => {
                let session_id = message.session_id.clone();
                self.relay(conn_id, &session_id, &InboundFrame::ChatMessage { message })
                    .await;
            }

            OutboundFrame::AddComment { session_id, comment } => {
                {
                    let mut rooms = self.rooms.write().await;
                    if let Some(room) = rooms.get_mut(&session_id) {
                        room.comments.insert(comment.id.clone(), comment.clone());
                    }
                }
                self.relay(conn_id, &session_id, &InboundFrame::CommentAdded { comment })
                    .await;
            }

            OutboundFrame::ReplyComment { session_id, comment_id, reply } => {
                self.update_comment(conn_id, &session_id, &comment_id, |c| c.replies.push(reply))
                    .await;
            }

            OutboundFrame::ResolveComment { session_id, comment_id, resolved } => {
                self.update_comment(conn_id, &session_id, &comment_id, |c| c.is_resolved = resolved)
                    .await;
            }
        }

        replies
    }

    /// Broadcast a frame to a room, skipping the origin connection.
    async fn relay(&self, conn_id: u64, session_id: &str, frame: &InboundFrame) {
        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(session_id) else {
            log::debug!("Dropping {} for unknown session {session_id}", frame.kind());
            return;
        };
        if let Err(e) = room.broadcast.broadcast(conn_id, frame) {
            log::warn!("Failed to relay {}: {e}", frame.kind());
        }
    }

    async fn update_comment<F>(&self, conn_id: u64, session_id: &str, comment_id: &str, f: F)
    where
        F: FnOnce(&mut Comment),
    {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(session_id) else {
            return;
        };
        let Some(comment) = room.comments.get_mut(comment_id) else {
            log::debug!("Update for unknown comment {comment_id}");
            return;
        };
        f(comment);
        let frame = InboundFrame::CommentUpdated { comment: comment.clone() };
        if let Err(e) = room.broadcast.broadcast(conn_id, &frame) {
            log::warn!("Failed to relay comment update: {e}");
        }
    }

    /// Move a connection into a room, leaving any previous one.
    async fn switch_membership(
        &self,
        conn_id: u64,
        membership: &mut Option<Membership>,
        session_id: String,
        user_id: String,
        rx: broadcast::Receiver<Arc<RelayedFrame>>,
    ) {
        if let Some(previous) = membership.take() {
            if previous.session_id != session_id {
                self.depart(conn_id, &previous.session_id, &previous.user_id).await;
            }
        }
        *membership = Some(Membership { session_id, user_id, rx });
    }

    /// Remove a user from a room if this connection still represents them.
    async fn depart(&self, conn_id: u64, session_id: &str, user_id: &str) {
        {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.get_mut(session_id) else {
                return;
            };
            if room.members.get(user_id) != Some(&conn_id) {
                return;
            }
            room.members.remove(user_id);
            room.session.remove_participant(user_id);
            let _ = room
                .broadcast
                .broadcast(conn_id, &InboundFrame::UserLeft { user_id: user_id.to_string() });
            log::info!("User {user_id} left session {session_id}");

            if room.members.is_empty() {
                rooms.remove(session_id);
                log::info!("Session {session_id} closed (no members)");
            }
        }
        self.refresh_room_count().await;
    }

    async fn refresh_room_count(&self) {
        let count = self.rooms.read().await.len();
        self.stats.write().await.active_rooms = count;
    }
}

/// Next relayed frame for this connection; pends forever outside a room.
async fn recv_relayed(
    membership: &mut Option<Membership>,
) -> Result<Arc<RelayedFrame>, RecvError> {
    match membership {
        Some(m) => m.rx.recv().await,
        None => std::future::pending().await,
    }
}

fn push_encoded(replies: &mut Vec<String>, frame: &InboundFrame) {
    match frame.encode() {
        Ok(text) => replies.push(text),
        Err(e) => log::warn!("Failed to encode {} reply: {e}", frame.kind()),
    }
}
