//! Integration tests for presence propagation through the relay.
//!
//! Two clients share a session; presence published by one must show up at
//! the other with the same cursor, selection and typing state.

use teamlink_collab::model::now_millis;
use teamlink_collab::{
    CollabClient, CollabConfig, CollabEvent, Position, PresenceUpdate, Range, RelayConfig,
    RelayServer,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{timeout, Duration};

async fn start_test_relay() -> (RelayServer, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let relay = RelayServer::new(RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..RelayConfig::default()
    });
    let server = relay.clone();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (relay, format!("ws://127.0.0.1:{port}"))
}

fn client(url: &str, name: &str) -> CollabClient {
    CollabClient::new(CollabConfig {
        server_url: url.to_string(),
        user_name: name.to_string(),
        join_timeout_ms: 2_000,
        ..CollabConfig::default()
    })
}

async fn next_presence(rx: &mut broadcast::Receiver<CollabEvent>) -> teamlink_collab::Presence {
    timeout(Duration::from_secs(3), async {
        loop {
            match rx.recv().await {
                Ok(CollabEvent::PresenceChanged(presence)) => return presence,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for presence")
}

/// Alice creates, Bob joins. Returns both once the relay has confirmed Bob.
async fn shared_session(relay: &RelayServer, url: &str) -> (CollabClient, CollabClient) {
    let alice = client(url, "Alice");
    let bob = client(url, "Bob");
    let session = alice.create_session("Pairing", vec!["file:///src/lib.rs".into()]).await.unwrap();

    timeout(Duration::from_secs(2), async {
        while relay.participants(&session.id).await.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("relay never saw the session");

    assert!(bob.join_session(&session.id).await);
    (alice, bob)
}

#[tokio::test]
async fn test_typing_state_reaches_peer() {
    let (relay, url) = start_test_relay().await;
    let (alice, bob) = shared_session(&relay, &url).await;
    let mut bob_events = bob.subscribe();
    let alice_id = alice.local_user().await.unwrap().id;

    let before = now_millis();
    alice.update_presence(PresenceUpdate::typing(true)).await;

    let seen = next_presence(&mut bob_events).await;
    assert_eq!(seen.user_id, alice_id);
    assert!(seen.is_typing);
    assert!(seen.last_activity >= before);

    let stored = bob.get_presence(&alice_id).await.unwrap();
    assert_eq!(stored, seen);
}

#[tokio::test]
async fn test_cursor_and_selection_reach_peer() {
    let (relay, url) = start_test_relay().await;
    let (alice, bob) = shared_session(&relay, &url).await;
    let mut alice_events = alice.subscribe();
    let bob_id = bob.local_user().await.unwrap().id;

    bob.update_presence(PresenceUpdate {
        document_uri: Some("file:///src/lib.rs".into()),
        cursor_position: Some(Position::new(12, 4)),
        selection: Some(Range::new(12, 0, 14, 2)),
        is_typing: None,
    })
    .await;

    let seen = next_presence(&mut alice_events).await;
    assert_eq!(seen.user_id, bob_id);
    assert_eq!(seen.document_uri.as_deref(), Some("file:///src/lib.rs"));
    assert_eq!(seen.cursor_position, Some(Position::new(12, 4)));
    assert_eq!(seen.selection, Some(Range::new(12, 0, 14, 2)));
    assert!(!seen.is_typing);
}

#[tokio::test]
async fn test_latest_presence_wins() {
    let (relay, url) = start_test_relay().await;
    let (alice, bob) = shared_session(&relay, &url).await;
    let mut bob_events = bob.subscribe();
    let alice_id = alice.local_user().await.unwrap().id;

    alice.update_presence(PresenceUpdate::typing(true)).await;
    alice
        .update_presence(PresenceUpdate::cursor("file:///src/lib.rs", Position::new(1, 1)))
        .await;

    next_presence(&mut bob_events).await;
    let last = next_presence(&mut bob_events).await;
    assert!(!last.is_typing);
    assert_eq!(bob.get_presence(&alice_id).await, Some(last));
    assert_eq!(bob.get_all_presences().await.len(), 1);
}

#[tokio::test]
async fn test_presence_removed_when_peer_leaves() {
    let (relay, url) = start_test_relay().await;
    let (alice, bob) = shared_session(&relay, &url).await;
    let mut bob_events = bob.subscribe();
    let alice_id = alice.local_user().await.unwrap().id;

    alice.update_presence(PresenceUpdate::typing(true)).await;
    next_presence(&mut bob_events).await;
    assert!(bob.get_presence(&alice_id).await.is_some());

    alice.leave_session().await;
    timeout(Duration::from_secs(3), async {
        loop {
            if let Ok(CollabEvent::UserLeft(id)) = bob_events.recv().await {
                if id == alice_id {
                    break;
                }
            }
        }
    })
    .await
    .expect("bob never saw alice leave");

    assert!(bob.get_presence(&alice_id).await.is_none());
    assert_eq!(bob.get_session_participants().await.len(), 1);
}
