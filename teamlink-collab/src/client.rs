//! The collaboration client: one handle for the host editor.
//!
//! Owns the transport and wires the components to it. Must be created
//! inside a tokio runtime; the event dispatcher is spawned on construction
//! and aborted when the client is dropped.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{CollabConfig, ConflictResolution};
use crate::dispatcher::Dispatcher;
use crate::document::DocumentSync;
use crate::error::CollabError;
use crate::events::{CollabEvent, EventBus};
use crate::messaging::Messaging;
use crate::model::{
    Comment, CommentReply, DocumentUri, Message, Operation, Presence, PresenceUpdate, Range,
    Session, User,
};
use crate::presence::PresenceTracker;
use crate::session::{SessionManager, SessionView};
use crate::transport::{ConnectionState, Transport};

pub struct CollabClient {
    config: CollabConfig,
    transport: Arc<Transport>,
    view: SessionView,
    events: EventBus,
    sessions: SessionManager,
    presence: PresenceTracker,
    documents: DocumentSync,
    messaging: Messaging,
    dispatcher: JoinHandle<()>,
}

impl CollabClient {
    /// Create a client with a fresh local identity named after the
    /// configured display name.
    pub fn new(config: CollabConfig) -> Self {
        let user = User::new(config.display_name());
        Self::with_user(config, Some(user))
    }

    /// Create a client with an explicit (or no) local identity.
    pub fn with_user(config: CollabConfig, local_user: Option<User>) -> Self {
        let (transport, transport_rx) = Transport::new(
            config.server_url.clone(),
            config.connect_timeout(),
            config.reconnect_policy(),
            config.outbound_queue_capacity,
        );
        let transport = Arc::new(transport);
        let outbox = transport.outbox();

        let view = SessionView::new(local_user);
        let events = EventBus::new(config.event_capacity);

        let presence = PresenceTracker::new(view.clone(), outbox.clone(), events.clone());
        let documents = DocumentSync::new(view.clone(), outbox.clone(), events.clone(), &config);
        let messaging = Messaging::new(view.clone(), outbox, events.clone(), &config);
        let sessions = SessionManager::new(
            transport.clone(),
            view.clone(),
            events.clone(),
            presence.clone(),
            documents.clone(),
            messaging.clone(),
            config.join_timeout(),
            config.max_participants,
        );

        let dispatcher = Dispatcher::new(
            transport.clone(),
            events.clone(),
            sessions.clone(),
            presence.clone(),
            documents.clone(),
            messaging.clone(),
        );
        let dispatcher = tokio::spawn(dispatcher.run(transport_rx));

        Self {
            config,
            transport,
            view,
            events,
            sessions,
            presence,
            documents,
            messaging,
            dispatcher,
        }
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    /// New event receiver. Dropping it unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<CollabEvent> {
        self.events.subscribe()
    }

    pub async fn local_user(&self) -> Option<User> {
        self.view.local_user().await
    }

    /// Replace the local identity. Takes effect for the next session.
    pub async fn set_local_user(&self, user: Option<User>) {
        self.view.set_local_user(user).await;
    }

    // ─── Connection ─────────────────────────────────────────────────

    pub async fn connect(&self) -> Result<(), CollabError> {
        self.ensure_enabled()?;
        self.sessions.connect().await
    }

    pub async fn disconnect(&self) {
        self.sessions.disconnect().await;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.transport.state().await
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.is_connected().await
    }

    // ─── Sessions ───────────────────────────────────────────────────

    pub async fn create_session(
        &self,
        name: impl Into<String>,
        documents: Vec<DocumentUri>,
    ) -> Result<Session, CollabError> {
        self.ensure_enabled()?;
        self.sessions.create_session(name, documents).await
    }

    pub async fn join_session(&self, session_id: &str) -> bool {
        if let Err(e) = self.ensure_enabled() {
            log::warn!("Not joining {session_id}: {e}");
            return false;
        }
        self.sessions.join_session(session_id).await
    }

    pub async fn leave_session(&self) {
        self.sessions.leave_session().await;
    }

    pub async fn get_current_session(&self) -> Option<Session> {
        self.sessions.get_current_session().await
    }

    pub async fn get_session_participants(&self) -> Vec<User> {
        self.sessions.get_session_participants().await
    }

    // ─── Presence ───────────────────────────────────────────────────

    pub async fn update_presence(&self, update: PresenceUpdate) {
        self.presence.update_presence(update).await;
    }

    pub async fn get_presence(&self, user_id: &str) -> Option<Presence> {
        self.presence.get_presence(user_id).await
    }

    pub async fn get_all_presences(&self) -> Vec<Presence> {
        self.presence.get_all_presences().await
    }

    // ─── Documents ──────────────────────────────────────────────────

    pub async fn apply_operation(&self, operation: Operation) -> Option<u64> {
        self.documents.apply_operation(operation).await
    }

    pub async fn get_document_version(&self, document_uri: &str) -> u64 {
        self.documents.get_document_version(document_uri).await
    }

    pub async fn sync_document(&self, document_uri: impl Into<DocumentUri>) {
        self.documents.sync_document(document_uri).await;
    }

    pub fn conflict_resolution(&self) -> ConflictResolution {
        self.documents.conflict_resolution()
    }

    fn ensure_enabled(&self) -> Result<(), CollabError> {
        if self.config.enabled {
            Ok(())
        } else {
            Err(CollabError::FeatureDisabled("collaboration"))
        }
    }

    // ─── Chat & comments ────────────────────────────────────────────

    pub async fn send_message(
        &self,
        content: impl Into<String>,
        mentions: Vec<String>,
        parent_id: Option<String>,
    ) -> Option<Message> {
        self.messaging.send_message(content, mentions, parent_id).await
    }

    pub async fn get_messages(&self, limit: Option<usize>, before: Option<u64>) -> Vec<Message> {
        self.messaging.get_messages(limit, before).await
    }

    pub async fn add_comment(
        &self,
        document_uri: impl Into<DocumentUri>,
        range: Range,
        content: impl Into<String>,
    ) -> Result<Comment, CollabError> {
        self.messaging.add_comment(document_uri, range, content).await
    }

    pub async fn reply_to_comment(
        &self,
        comment_id: &str,
        content: impl Into<String>,
    ) -> Option<CommentReply> {
        self.messaging.reply_to_comment(comment_id, content).await
    }

    pub async fn resolve_comment(&self, comment_id: &str, resolved: bool) {
        self.messaging.resolve_comment(comment_id, resolved).await;
    }

    pub async fn get_comments(&self, document_uri: &str) -> Vec<Comment> {
        self.messaging.get_comments(document_uri).await
    }
}

impl Drop for CollabClient {
    fn drop(&mut self) {
        self.dispatcher.abort();
        // Close the socket if a runtime is still around to run the close.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let transport = self.transport.clone();
            handle.spawn(async move { transport.disconnect().await });
        }
    }
}
