//! Interactive session loop: stdin lines become chat, events are printed.
//!
//! Commands:
//! - `/who`: list participants
//! - `/typing`: toggle the typing indicator
//! - `/sync <uri>`: request a document sync
//! - `/history [n]`: show the last `n` messages (default 20)
//! - `/quit`: leave the session

use anyhow::Result;
use teamlink_collab::{CollabClient, CollabEvent, PresenceUpdate};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

pub async fn run(client: &CollabClient) -> Result<()> {
    let mut events = client.subscribe();
    let me = client.local_user().await.map(|u| u.id).unwrap_or_default();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&me, &event),
                Err(RecvError::Lagged(n)) => log::warn!("Missed {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut typing = false;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.splitn(2, ' ');
        match (parts.next(), parts.next()) {
            (Some("/quit"), _) => break,
            (Some("/who"), _) => {
                for user in client.get_session_participants().await {
                    let state = if user.is_online { "online" } else { "away" };
                    println!("  {} ({}) {state}", user.name, user.id);
                }
            }
            (Some("/typing"), _) => {
                typing = !typing;
                client.update_presence(PresenceUpdate::typing(typing)).await;
            }
            (Some("/sync"), Some(uri)) => client.sync_document(uri.trim()).await,
            (Some("/history"), count) => {
                let limit = count.and_then(|c| c.trim().parse().ok()).unwrap_or(20);
                for message in client.get_messages(Some(limit), None).await {
                    println!("  [{}] {}", message.user_name, message.content);
                }
            }
            (Some(command), _) if command.starts_with('/') => {
                println!("Unknown command {command}");
            }
            _ => {
                if client.send_message(line, Vec::new(), None).await.is_none() {
                    println!("Not in a session");
                }
            }
        }
    }

    client.leave_session().await;
    printer.abort();
    Ok(())
}

fn print_event(me: &str, event: &CollabEvent) {
    match event {
        CollabEvent::MessageReceived(message) if message.user_id != me => {
            println!("[{}] {}", message.user_name, message.content);
        }
        CollabEvent::UserJoined(user) => println!("* {} joined", user.name),
        CollabEvent::UserLeft(user_id) => println!("* {user_id} left"),
        CollabEvent::PresenceChanged(presence) if presence.user_id != me && presence.is_typing => {
            println!("* {} is typing...", presence.user_id);
        }
        CollabEvent::DocumentSynced { uri, version, .. } => {
            println!("* {uri} is at version {version}");
        }
        CollabEvent::CommentAdded(comment) => {
            println!("* {} commented on {}: {}", comment.user_name, comment.document_uri, comment.content);
        }
        CollabEvent::Reconnecting { attempt, delay } => {
            println!("* Connection lost, retrying ({attempt}) in {}ms", delay.as_millis());
        }
        CollabEvent::Connected { reconnected: true } => println!("* Reconnected"),
        CollabEvent::ConnectionLost { .. } => {
            println!("* Connection lost. Please rejoin the session.");
        }
        _ => log::debug!("{event:?}"),
    }
}
