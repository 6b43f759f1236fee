//! Routes transport events and inbound frames to the owning component.
//!
//! Runs as a single background task, so inbound handling is serialized.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::document::DocumentSync;
use crate::events::{CollabEvent, EventBus};
use crate::messaging::Messaging;
use crate::presence::PresenceTracker;
use crate::protocol::InboundFrame;
use crate::session::SessionManager;
use crate::transport::{Transport, TransportEvent};

pub struct Dispatcher {
    transport: Arc<Transport>,
    events: EventBus,
    sessions: SessionManager,
    presence: PresenceTracker,
    documents: DocumentSync,
    messaging: Messaging,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<Transport>,
        events: EventBus,
        sessions: SessionManager,
        presence: PresenceTracker,
        documents: DocumentSync,
        messaging: Messaging,
    ) -> Self {
        Self {
            transport,
            events,
            sessions,
            presence,
            documents,
            messaging,
        }
    }

    /// Drain transport events until the transport goes away.
    pub async fn run(self, mut rx: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_transport_event(event).await;
        }
        log::debug!("Dispatcher stopped");
    }

    pub async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(text) => self.dispatch_text(&text).await,
            TransportEvent::Connected { reconnected } => {
                self.events.emit(CollabEvent::Connected { reconnected });
                if reconnected {
                    self.sessions.rejoin().await;
                }
            }
            TransportEvent::Closed => {
                self.events.emit(CollabEvent::Disconnected);
                if self.sessions.view().is_active().await {
                    self.transport.begin_reconnect().await;
                }
            }
            TransportEvent::Reconnecting { attempt, delay } => {
                self.events.emit(CollabEvent::Reconnecting { attempt, delay });
            }
            TransportEvent::ReconnectExhausted { attempts } => {
                log::error!("Connection lost, please rejoin the session");
                self.events.emit(CollabEvent::ConnectionLost { attempts });
            }
        }
    }

    /// Decode and route every frame in a text message. Bad frames are
    /// logged and dropped.
    pub async fn dispatch_text(&self, text: &str) {
        for line in crate::protocol::split_frames(text) {
            match InboundFrame::decode(line) {
                Ok(frame) => self.dispatch(frame).await,
                Err(e) => log::warn!("Dropping inbound frame: {e}"),
            }
        }
    }

    pub async fn dispatch(&self, frame: InboundFrame) {
        log::debug!("<- {}", frame.kind());
        // Late frames from a session that was just left must not repopulate state.
        if !matches!(frame, InboundFrame::SessionJoined { .. })
            && !self.sessions.view().is_active().await
        {
            log::debug!("Ignoring {} outside a session", frame.kind());
            return;
        }
        match frame {
            InboundFrame::SessionJoined { session } => {
                self.sessions.handle_session_joined(session).await
            }
            InboundFrame::UserJoined { user } => self.sessions.handle_user_joined(user).await,
            InboundFrame::UserLeft { user_id } => self.sessions.handle_user_left(user_id).await,
            InboundFrame::PresenceUpdate { presence } => self.presence.handle_remote(presence).await,
            InboundFrame::DocumentOperation { operation } => {
                self.documents.handle_remote_operation(operation).await
            }
            InboundFrame::DocumentSync { document_uri, content, version } => {
                self.documents
                    .handle_document_sync(document_uri, content, version)
                    .await
            }
            InboundFrame::ChatMessage { message } => self.messaging.handle_message(message).await,
            InboundFrame::CommentAdded { comment } => {
                self.messaging.handle_comment_added(comment).await
            }
            InboundFrame::CommentUpdated { comment } => {
                self.messaging.handle_comment_updated(comment).await
            }
            InboundFrame::CommentDeleted { comment_id } => {
                self.messaging.handle_comment_deleted(comment_id).await
            }
        }
    }
}
