//! Typed event fan-out to the host editor.
//!
//! Every component publishes on one [`EventBus`]; any number of subscribers
//! each get an independent receiver (tokio broadcast channel). A subscriber
//! that stops polling lags and loses the oldest events, never blocking the
//! publishers.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::model::{Comment, DocumentUri, Message, Operation, Presence, Session, User};

/// Events raised by the collaboration client.
#[derive(Debug, Clone, PartialEq)]
pub enum CollabEvent {
    // Session lifecycle
    SessionCreated(Session),
    SessionJoined(Session),
    /// Carries the id of the session that was left
    SessionLeft(String),
    /// Roster changed
    SessionUpdated(Session),

    // Presence
    PresenceChanged(Presence),
    UserJoined(User),
    UserLeft(String),

    // Documents
    OperationReceived(Operation),
    DocumentSynced { uri: DocumentUri, content: String, version: u64 },
    /// An inbound operation did not advance the local version and was dropped
    VersionConflict { uri: DocumentUri, local: u64, remote: u64 },

    // Chat & comments
    MessageReceived(Message),
    CommentAdded(Comment),
    CommentUpdated(Comment),
    CommentDeleted(String),

    // Connection
    Connected { reconnected: bool },
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnection gave up; the user has to rejoin the session
    ConnectionLost { attempts: u32 },
}

/// Broadcast channel for [`CollabEvent`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CollabEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// New independent receiver. Dropping it unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<CollabEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of subscribers that got it.
    pub fn emit(&self, event: CollabEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::new(8);
        assert_eq!(bus.emit(CollabEvent::Disconnected), 0);
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = EventBus::new(8);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        assert_eq!(bus.emit(CollabEvent::UserLeft("user_1".into())), 2);
        assert_eq!(rx1.recv().await.unwrap(), CollabEvent::UserLeft("user_1".into()));
        assert_eq!(rx2.recv().await.unwrap(), CollabEvent::UserLeft("user_1".into()));
    }

    #[tokio::test]
    async fn test_dropping_receiver_unsubscribes() {
        let bus = EventBus::new(8);
        let rx = bus.subscribe();
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
