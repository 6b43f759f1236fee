//! Document edit relay with per-document version counters.
//!
//! Operations are forwarded, never merged. The local version for a
//! document advances by one on each `apply_operation`; inbound operations
//! set it according to the configured [`VersionPolicy`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::{CollabConfig, ConflictResolution, VersionPolicy};
use crate::events::{CollabEvent, EventBus};
use crate::model::{DocumentUri, Operation};
use crate::protocol::OutboundFrame;
use crate::session::SessionView;
use crate::transport::Outbox;

#[derive(Debug, Clone)]
pub struct DocumentSync {
    view: SessionView,
    outbox: Outbox,
    events: EventBus,
    versions: Arc<RwLock<HashMap<DocumentUri, u64>>>,
    policy: VersionPolicy,
    conflict_resolution: ConflictResolution,
    enabled: bool,
}

impl DocumentSync {
    pub fn new(view: SessionView, outbox: Outbox, events: EventBus, config: &CollabConfig) -> Self {
        Self {
            view,
            outbox,
            events,
            versions: Arc::new(RwLock::new(HashMap::new())),
            policy: config.version_policy,
            conflict_resolution: config.conflict_resolution,
            enabled: config.sync_enabled,
        }
    }

    /// Merge strategy the host editor should apply. Not used here.
    pub fn conflict_resolution(&self) -> ConflictResolution {
        self.conflict_resolution
    }

    pub fn version_policy(&self) -> VersionPolicy {
        self.policy
    }

    /// Send a local edit. Returns the new document version, or `None`
    /// outside a session.
    pub async fn apply_operation(&self, operation: Operation) -> Option<u64> {
        if !self.enabled {
            log::debug!("Document sync disabled, not sending operation");
            return None;
        }
        let ctx = self.view.context().await?;

        let version = {
            let mut versions = self.versions.write().await;
            let version = versions.entry(operation.document_uri.clone()).or_insert(0);
            *version += 1;
            *version
        };

        let mut outbound = operation.clone();
        outbound.version = version;
        log::debug!("Sending {:?} on {} at version {version}", outbound.kind, outbound.document_uri);
        self.outbox.send(OutboundFrame::DocumentOperation {
            session_id: ctx.session_id,
            operation: outbound,
        });

        self.events.emit(CollabEvent::OperationReceived(operation));
        Some(version)
    }

    /// Ask the relay for the full content of a document.
    pub async fn sync_document(&self, document_uri: impl Into<DocumentUri>) {
        let Some(session_id) = self.view.session_id().await else {
            return;
        };
        self.outbox.send(OutboundFrame::SyncDocument {
            session_id,
            document_uri: document_uri.into(),
        });
    }

    /// Tracked version for a document; 0 if it has never been seen.
    pub async fn get_document_version(&self, document_uri: &str) -> u64 {
        self.versions.read().await.get(document_uri).copied().unwrap_or(0)
    }

    pub(crate) async fn handle_remote_operation(&self, operation: Operation) {
        let remote = operation.version;
        {
            let mut versions = self.versions.write().await;
            let local = versions.entry(operation.document_uri.clone()).or_insert(0);

            match self.policy {
                VersionPolicy::Trust => {
                    if remote != *local + 1 {
                        log::debug!(
                            "Version gap on {}: local {}, remote {remote}",
                            operation.document_uri,
                            *local
                        );
                    }
                    *local = remote;
                }
                VersionPolicy::RejectStale => {
                    if remote <= *local {
                        let local = *local;
                        drop(versions);
                        log::warn!(
                            "Dropping stale operation on {} (local {local}, remote {remote})",
                            operation.document_uri
                        );
                        self.events.emit(CollabEvent::VersionConflict {
                            uri: operation.document_uri,
                            local,
                            remote,
                        });
                        return;
                    }
                    *local = remote;
                }
            }
        }
        self.events.emit(CollabEvent::OperationReceived(operation));
    }

    pub(crate) async fn handle_document_sync(&self, uri: DocumentUri, content: String, version: u64) {
        self.versions.write().await.insert(uri.clone(), version);
        log::debug!("Document {uri} synced at version {version}");
        self.events.emit(CollabEvent::DocumentSynced { uri, content, version });
    }

    pub async fn clear(&self) {
        self.versions.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Position, Session, User};
    use tokio::sync::mpsc;

    const URI: &str = "file:///src/main.rs";

    async fn sync_with(config: CollabConfig, in_session: bool) -> (DocumentSync, mpsc::Receiver<OutboundFrame>) {
        let alice = User::with_id("user_a", "Alice");
        let view = SessionView::new(Some(alice.clone()));
        if in_session {
            view.replace(Some(Session::new("Demo", alice, vec![URI.into()]))).await;
        }
        let (outbox, rx) = Outbox::channel(16);
        (DocumentSync::new(view, outbox, EventBus::new(16), &config), rx)
    }

    #[tokio::test]
    async fn test_versions_increase_by_one() {
        let (sync, mut rx) = sync_with(CollabConfig::default(), true).await;
        let mut events = sync.events.subscribe();

        for expected in 1..=3 {
            let op = Operation::insert(URI, Position::new(0, 0), "x", "user_a");
            assert_eq!(sync.apply_operation(op.clone()).await, Some(expected));
            assert_eq!(sync.get_document_version(URI).await, expected);

            match rx.try_recv().unwrap() {
                OutboundFrame::DocumentOperation { operation, .. } => {
                    assert_eq!(operation.version, expected)
                }
                other => panic!("unexpected frame {other:?}"),
            }
            // The event carries the operation as submitted.
            assert_eq!(events.try_recv().unwrap(), CollabEvent::OperationReceived(op));
        }
        assert_eq!(sync.get_document_version("file:///other.rs").await, 0);
    }

    #[tokio::test]
    async fn test_apply_without_session_is_noop() {
        let (sync, mut rx) = sync_with(CollabConfig::default(), false).await;
        let op = Operation::delete(URI, Position::new(1, 0), 3, "user_a");
        assert_eq!(sync.apply_operation(op).await, None);
        assert_eq!(sync.get_document_version(URI).await, 0);
        assert!(rx.try_recv().is_err());

        sync.sync_document(URI).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_trust_policy_assigns_remote_version() {
        let (sync, _rx) = sync_with(CollabConfig::default(), true).await;
        let mut op = Operation::insert(URI, Position::new(0, 0), "y", "user_b");

        op.version = 7;
        sync.handle_remote_operation(op.clone()).await;
        assert_eq!(sync.get_document_version(URI).await, 7);

        // Regressions are accepted too.
        op.version = 2;
        sync.handle_remote_operation(op).await;
        assert_eq!(sync.get_document_version(URI).await, 2);
    }

    #[tokio::test]
    async fn test_reject_stale_policy() {
        let config = CollabConfig { version_policy: VersionPolicy::RejectStale, ..CollabConfig::default() };
        let (sync, _rx) = sync_with(config, true).await;
        let mut events = sync.events.subscribe();

        let mut op = Operation::insert(URI, Position::new(0, 0), "y", "user_b");
        op.version = 3;
        sync.handle_remote_operation(op.clone()).await;
        assert!(matches!(events.try_recv().unwrap(), CollabEvent::OperationReceived(_)));

        op.version = 3;
        sync.handle_remote_operation(op).await;
        assert_eq!(
            events.try_recv().unwrap(),
            CollabEvent::VersionConflict { uri: URI.into(), local: 3, remote: 3 }
        );
        assert_eq!(sync.get_document_version(URI).await, 3);
    }

    #[tokio::test]
    async fn test_sync_request_and_response() {
        let (sync, mut rx) = sync_with(CollabConfig::default(), true).await;
        let mut events = sync.events.subscribe();

        sync.sync_document(URI).await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            OutboundFrame::SyncDocument { document_uri, .. } if document_uri == URI
        ));

        sync.handle_document_sync(URI.into(), "fn main() {}".into(), 12).await;
        assert_eq!(sync.get_document_version(URI).await, 12);
        assert_eq!(
            events.try_recv().unwrap(),
            CollabEvent::DocumentSynced { uri: URI.into(), content: "fn main() {}".into(), version: 12 }
        );

        sync.clear().await;
        assert_eq!(sync.get_document_version(URI).await, 0);
    }

    #[tokio::test]
    async fn test_conflict_resolution_is_exposed() {
        let config = CollabConfig { conflict_resolution: ConflictResolution::Manual, ..CollabConfig::default() };
        let (sync, _rx) = sync_with(config, true).await;
        assert_eq!(sync.conflict_resolution(), ConflictResolution::Manual);
        assert_eq!(sync.version_policy(), VersionPolicy::Trust);
    }
}
