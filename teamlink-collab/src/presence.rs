//! Presence tracking: who is looking at what.
//!
//! ```text
//! local cursor move ──► update_presence() ──► presence_update ──► relay
//!                                                                  │
//! remote tracker ◄── handle_remote() ◄── dispatcher ◄──────────────┘
//! ```
//!
//! Records are replaced wholesale; there is no merging of partial updates
//! and no ordering check between them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::events::{CollabEvent, EventBus};
use crate::model::{Presence, PresenceUpdate};
use crate::protocol::OutboundFrame;
use crate::session::SessionView;
use crate::transport::Outbox;

/// Latest presence per user id for the active session.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    view: SessionView,
    outbox: Outbox,
    events: EventBus,
    presences: Arc<RwLock<HashMap<String, Presence>>>,
}

impl PresenceTracker {
    pub fn new(view: SessionView, outbox: Outbox, events: EventBus) -> Self {
        Self {
            view,
            outbox,
            events,
            presences: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Publish the local user's presence. No-op outside a session.
    pub async fn update_presence(&self, update: PresenceUpdate) {
        let Some(ctx) = self.view.context().await else {
            return;
        };

        let presence = Presence::from_update(ctx.user.id.clone(), update);
        self.presences
            .write()
            .await
            .insert(ctx.user.id, presence.clone());

        log::trace!("Presence update: typing={}", presence.is_typing);
        self.outbox.send(OutboundFrame::PresenceUpdate {
            session_id: ctx.session_id,
            presence: presence.clone(),
        });
        self.events.emit(CollabEvent::PresenceChanged(presence));
    }

    /// Store a peer's presence, overwriting whatever was there.
    pub async fn handle_remote(&self, presence: Presence) {
        log::trace!("Remote presence from {}", presence.user_id);
        self.presences
            .write()
            .await
            .insert(presence.user_id.clone(), presence.clone());
        self.events.emit(CollabEvent::PresenceChanged(presence));
    }

    pub async fn get_presence(&self, user_id: &str) -> Option<Presence> {
        self.presences.read().await.get(user_id).cloned()
    }

    pub async fn get_all_presences(&self) -> Vec<Presence> {
        self.presences.read().await.values().cloned().collect()
    }

    /// Users currently flagged as typing.
    pub async fn typing_users(&self) -> Vec<String> {
        self.presences
            .read()
            .await
            .values()
            .filter(|p| p.is_typing)
            .map(|p| p.user_id.clone())
            .collect()
    }

    pub async fn remove(&self, user_id: &str) -> Option<Presence> {
        self.presences.write().await.remove(user_id)
    }

    pub async fn clear(&self) {
        self.presences.write().await.clear();
    }
}
