//! Session lifecycle and roster.
//!
//! [`SessionManager`] is the only component that mutates the current
//! session and the only one that opens or closes the transport. The other
//! components read the session through a shared [`SessionView`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;

use crate::document::DocumentSync;
use crate::error::CollabError;
use crate::events::{CollabEvent, EventBus};
use crate::messaging::Messaging;
use crate::model::{DocumentUri, Session, User};
use crate::presence::PresenceTracker;
use crate::protocol::OutboundFrame;
use crate::transport::{ConnectionState, Outbox, Transport};

/// Session id plus local user, captured together for building frames.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub session_id: String,
    pub user: User,
}

/// Read-mostly handle to the current session and the local identity.
///
/// Cloned into every component. Only the session manager writes to it.
#[derive(Debug, Clone, Default)]
pub struct SessionView {
    current: Arc<RwLock<Option<Session>>>,
    local_user: Arc<RwLock<Option<User>>>,
}

impl SessionView {
    pub fn new(local_user: Option<User>) -> Self {
        Self {
            current: Arc::new(RwLock::new(None)),
            local_user: Arc::new(RwLock::new(local_user)),
        }
    }

    /// The active session id and local user, or `None` outside a session.
    pub async fn context(&self) -> Option<SessionContext> {
        let session_id = self.current.read().await.as_ref().map(|s| s.id.clone())?;
        let user = self.local_user.read().await.clone()?;
        Some(SessionContext { session_id, user })
    }

    pub async fn current(&self) -> Option<Session> {
        self.current.read().await.clone()
    }

    pub async fn session_id(&self) -> Option<String> {
        self.current.read().await.as_ref().map(|s| s.id.clone())
    }

    pub async fn is_active(&self) -> bool {
        self.current.read().await.is_some()
    }

    pub async fn local_user(&self) -> Option<User> {
        self.local_user.read().await.clone()
    }

    pub(crate) async fn set_local_user(&self, user: Option<User>) {
        *self.local_user.write().await = user;
    }

    /// Swap the current session, returning the previous one.
    pub(crate) async fn replace(&self, session: Option<Session>) -> Option<Session> {
        std::mem::replace(&mut *self.current.write().await, session)
    }

    /// Mutate the current session in place. Returns the updated snapshot,
    /// or `None` if there is no session.
    pub(crate) async fn update<F>(&self, f: F) -> Option<Session>
    where
        F: FnOnce(&mut Session),
    {
        let mut current = self.current.write().await;
        let session = current.as_mut()?;
        f(session);
        Some(session.clone())
    }
}

/// Creates, joins and leaves sessions; keeps the roster current.
#[derive(Clone)]
pub struct SessionManager {
    transport: Arc<Transport>,
    view: SessionView,
    outbox: Outbox,
    events: EventBus,
    presence: PresenceTracker,
    documents: DocumentSync,
    messaging: Messaging,
    join_timeout: Duration,
    max_participants: usize,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<Transport>,
        view: SessionView,
        events: EventBus,
        presence: PresenceTracker,
        documents: DocumentSync,
        messaging: Messaging,
        join_timeout: Duration,
        max_participants: usize,
    ) -> Self {
        let outbox = transport.outbox();
        Self {
            transport,
            view,
            outbox,
            events,
            presence,
            documents,
            messaging,
            join_timeout,
            max_participants,
        }
    }

    pub fn view(&self) -> &SessionView {
        &self.view
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.transport.state().await
    }

    /// Open the connection without touching session state.
    pub async fn connect(&self) -> Result<(), CollabError> {
        self.transport.connect().await?;
        Ok(())
    }

    /// Close the connection. Never triggers reconnection.
    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
        self.events.emit(CollabEvent::Disconnected);
    }

    /// Create a session owned by the local user and announce it.
    pub async fn create_session(
        &self,
        name: impl Into<String>,
        documents: Vec<DocumentUri>,
    ) -> Result<Session, CollabError> {
        let owner = self.view.local_user().await.ok_or(CollabError::NoLocalUser)?;
        let session = Session::new(name, owner, documents);

        self.transport.connect().await?;

        if let Some(previous) = self.view.replace(Some(session.clone())).await {
            log::warn!("Replacing active session {} with a new one", previous.id);
            self.reset_components().await;
        }
        self.outbox.send(OutboundFrame::CreateSession { session: session.clone() });
        self.events.emit(CollabEvent::SessionCreated(session.clone()));

        log::info!("Created collaboration session: {} ({})", session.name, session.id);
        Ok(session)
    }

    /// Join an existing session. Resolves to `false` on connect failure or
    /// when the relay does not confirm within the join timeout.
    pub async fn join_session(&self, session_id: &str) -> bool {
        let Some(user) = self.view.local_user().await else {
            log::warn!("Cannot join session {session_id}: local user is not initialized");
            return false;
        };

        if let Err(e) = self.transport.connect().await {
            log::error!("Failed to join session {session_id}: {e}");
            return false;
        }

        // Subscribe before sending so the confirmation cannot be missed.
        let mut events = self.events.subscribe();
        self.outbox.send(OutboundFrame::JoinSession {
            session_id: session_id.to_string(),
            user,
        });

        let confirmed = tokio::time::timeout(self.join_timeout, async {
            loop {
                match events.recv().await {
                    Ok(CollabEvent::SessionJoined(session)) if session.id == session_id => {
                        return true;
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        log::debug!("Join wait lagged by {skipped} events");
                        continue;
                    }
                    Err(RecvError::Closed) => return false,
                }
            }
        })
        .await;

        match confirmed {
            Ok(joined) => joined,
            Err(_) => {
                log::warn!(
                    "Timed out after {}ms waiting to join session {session_id}",
                    self.join_timeout.as_millis()
                );
                false
            }
        }
    }

    /// Leave the active session, clear local state and disconnect.
    pub async fn leave_session(&self) {
        let Some(ctx) = self.view.context().await else {
            return;
        };

        self.outbox.send(OutboundFrame::LeaveSession {
            session_id: ctx.session_id.clone(),
            user_id: ctx.user.id,
        });

        self.view.replace(None).await;
        self.reset_components().await;
        self.transport.disconnect().await;

        self.events.emit(CollabEvent::SessionLeft(ctx.session_id.clone()));
        log::info!("Left collaboration session {}", ctx.session_id);
    }

    pub async fn get_current_session(&self) -> Option<Session> {
        self.view.current().await
    }

    pub async fn get_session_participants(&self) -> Vec<User> {
        self.view
            .current()
            .await
            .map(|s| s.participant_list())
            .unwrap_or_default()
    }

    /// Re-announce the local user after an automatic reconnection.
    pub async fn rejoin(&self) {
        let Some(ctx) = self.view.context().await else {
            return;
        };
        log::info!("Rejoining session {} after reconnection", ctx.session_id);
        self.outbox.send(OutboundFrame::JoinSession {
            session_id: ctx.session_id,
            user: ctx.user,
        });
    }

    // ─── Inbound ────────────────────────────────────────────────────

    pub(crate) async fn handle_session_joined(&self, session: Session) {
        let previous = self.view.replace(Some(session.clone())).await;
        if previous.is_some_and(|p| p.id != session.id) {
            self.reset_components().await;
        }
        self.check_roster_size(&session);

        log::info!(
            "Joined collaboration session: {} ({} participants)",
            session.name,
            session.participants.len()
        );
        self.events.emit(CollabEvent::SessionJoined(session));
    }

    pub(crate) async fn handle_user_joined(&self, user: User) {
        let joined = user.clone();
        let Some(session) = self.view.update(|s| {
            s.add_participant(joined);
        })
        .await
        else {
            log::debug!("Ignoring user_joined for {} outside a session", user.id);
            return;
        };
        self.check_roster_size(&session);

        log::info!("{} joined the session", user.name);
        self.events.emit(CollabEvent::UserJoined(user));
        self.events.emit(CollabEvent::SessionUpdated(session));
    }

    pub(crate) async fn handle_user_left(&self, user_id: String) {
        let Some(session) = self.view.update(|s| {
            s.remove_participant(&user_id);
        })
        .await
        else {
            log::debug!("Ignoring user_left for {user_id} outside a session");
            return;
        };
        self.presence.remove(&user_id).await;

        log::info!("User {user_id} left the session");
        self.events.emit(CollabEvent::UserLeft(user_id));
        self.events.emit(CollabEvent::SessionUpdated(session));
    }

    fn check_roster_size(&self, session: &Session) {
        if session.participants.len() > self.max_participants {
            log::warn!(
                "Session {} has {} participants (configured maximum {})",
                session.id,
                session.participants.len(),
                self.max_participants
            );
        }
    }

    async fn reset_components(&self) {
        self.presence.clear().await;
        self.documents.clear().await;
        self.messaging.clear().await;
    }
}
