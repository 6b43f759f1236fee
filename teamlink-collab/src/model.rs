//! Session data model shared by every component and by the wire protocol.
//!
//! All records serialize with camelCase field names so they can be relayed
//! verbatim inside JSON frames. Timestamps are milliseconds since the Unix
//! epoch.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Document identifier (a URI string such as `file:///src/main.rs`).
pub type DocumentUri = String;

/// Fixed palette participants are coloured from.
pub const USER_PALETTE: [&str; 10] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FFEAA7",
    "#DDA0DD", "#98D8C8", "#F7DC6F", "#BB8FCE", "#85C1E9",
];

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Generate a locally unique identifier such as `msg_3f2a…`.
pub fn generate_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

/// Pick a stable palette colour for an identifier.
pub fn palette_color(id: &str) -> &'static str {
    let hash = id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    USER_PALETTE[hash as usize % USER_PALETTE.len()]
}

// ───────────────────────────────────────────────────────────────────
// Users & sessions
// ───────────────────────────────────────────────────────────────────

/// A participant identity with display metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Hex colour from [`USER_PALETTE`].
    pub color: String,
    pub is_online: bool,
    pub last_seen: u64,
}

impl User {
    /// Create a fresh online identity with a generated id.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(generate_id("user"), name)
    }

    /// Create with an explicit id (for testing and for relayed users).
    pub fn with_id(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        let color = palette_color(&id).to_string();
        Self {
            id,
            name: name.into(),
            email: None,
            avatar: None,
            color,
            is_online: true,
            last_seen: now_millis(),
        }
    }
}

/// A shared editing session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    /// Roster keyed by user id.
    pub participants: HashMap<String, User>,
    #[serde(default)]
    pub documents: Vec<DocumentUri>,
    pub created_at: u64,
    pub is_active: bool,
}

impl Session {
    /// Create a new active session owned by `owner`, who is its only participant.
    pub fn new(name: impl Into<String>, owner: User, documents: Vec<DocumentUri>) -> Self {
        let mut participants = HashMap::new();
        let owner_id = owner.id.clone();
        participants.insert(owner.id.clone(), owner);
        Self {
            id: generate_id("session"),
            name: name.into(),
            owner_id,
            participants,
            documents,
            created_at: now_millis(),
            is_active: true,
        }
    }

    /// Insert or refresh a participant. Returns `true` if the user was new.
    pub fn add_participant(&mut self, user: User) -> bool {
        self.participants.insert(user.id.clone(), user).is_none()
    }

    pub fn remove_participant(&mut self, user_id: &str) -> Option<User> {
        self.participants.remove(user_id)
    }

    pub fn is_owner(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }

    /// Participants as an unordered list.
    pub fn participant_list(&self) -> Vec<User> {
        self.participants.values().cloned().collect()
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence
// ───────────────────────────────────────────────────────────────────

/// Zero-based line/column position in a document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// Inclusive start / exclusive end text range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Range {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl Range {
    pub fn new(start_line: u32, start_column: u32, end_line: u32, end_column: u32) -> Self {
        Self { start_line, start_column, end_line, end_column }
    }

    pub fn is_empty(&self) -> bool {
        self.start_line == self.end_line && self.start_column == self.end_column
    }
}

/// Ephemeral per-user state. Replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_uri: Option<DocumentUri>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Range>,
    #[serde(default)]
    pub is_typing: bool,
    pub last_activity: u64,
}

/// Partial presence supplied by the caller. Omitted fields are absent in
/// the resulting record, not carried over from the previous one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceUpdate {
    pub document_uri: Option<DocumentUri>,
    pub cursor_position: Option<Position>,
    pub selection: Option<Range>,
    pub is_typing: Option<bool>,
}

impl PresenceUpdate {
    pub fn typing(is_typing: bool) -> Self {
        Self { is_typing: Some(is_typing), ..Self::default() }
    }

    pub fn cursor(document_uri: impl Into<DocumentUri>, position: Position) -> Self {
        Self {
            document_uri: Some(document_uri.into()),
            cursor_position: Some(position),
            ..Self::default()
        }
    }
}

impl Presence {
    /// Build a full record for `user_id`, stamped with the current time.
    pub fn from_update(user_id: impl Into<String>, update: PresenceUpdate) -> Self {
        Self {
            user_id: user_id.into(),
            document_uri: update.document_uri,
            cursor_position: update.cursor_position,
            selection: update.selection,
            is_typing: update.is_typing.unwrap_or(false),
            last_activity: now_millis(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Document operations
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Delete,
    Replace,
}

/// A single edit forwarded between participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub document_uri: DocumentUri,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    pub user_id: String,
    pub timestamp: u64,
    /// Document-scoped version, assigned by the sender at apply time.
    #[serde(default)]
    pub version: u64,
}

impl Operation {
    fn build(
        kind: OperationKind,
        document_uri: impl Into<DocumentUri>,
        position: Position,
        text: Option<String>,
        length: Option<u32>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            document_uri: document_uri.into(),
            position,
            text,
            length,
            user_id: user_id.into(),
            timestamp: now_millis(),
            version: 0,
        }
    }

    pub fn insert(
        document_uri: impl Into<DocumentUri>,
        position: Position,
        text: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self::build(OperationKind::Insert, document_uri, position, Some(text.into()), None, user_id)
    }

    pub fn delete(
        document_uri: impl Into<DocumentUri>,
        position: Position,
        length: u32,
        user_id: impl Into<String>,
    ) -> Self {
        Self::build(OperationKind::Delete, document_uri, position, None, Some(length), user_id)
    }

    pub fn replace(
        document_uri: impl Into<DocumentUri>,
        position: Position,
        length: u32,
        text: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self::build(
            OperationKind::Replace,
            document_uri,
            position,
            Some(text.into()),
            Some(length),
            user_id,
        )
    }
}

// ───────────────────────────────────────────────────────────────────
// Chat & comments
// ───────────────────────────────────────────────────────────────────

/// A chat message. `parent_id` threads it under another message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub user_name: String,
    pub content: String,
    pub timestamp: u64,
    /// Mentioned user ids, without duplicates.
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Message {
    pub fn new(
        session_id: impl Into<String>,
        author: &User,
        content: impl Into<String>,
        mentions: Vec<String>,
        parent_id: Option<String>,
    ) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(mentions.len());
        for mention in mentions {
            if !unique.contains(&mention) {
                unique.push(mention);
            }
        }
        Self {
            id: generate_id("msg"),
            session_id: session_id.into(),
            user_id: author.id.clone(),
            user_name: author.name.clone(),
            content: content.into(),
            timestamp: now_millis(),
            mentions: unique,
            is_edited: false,
            parent_id,
        }
    }

    pub fn mentions_user(&self, user_id: &str) -> bool {
        self.mentions.iter().any(|m| m == user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentReply {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub content: String,
    pub timestamp: u64,
}

impl CommentReply {
    pub fn new(author: &User, content: impl Into<String>) -> Self {
        Self {
            id: generate_id("comment"),
            user_id: author.id.clone(),
            user_name: author.name.clone(),
            content: content.into(),
            timestamp: now_millis(),
        }
    }
}

/// An inline code comment anchored to a document range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub document_uri: DocumentUri,
    pub range: Range,
    pub user_id: String,
    pub user_name: String,
    pub content: String,
    pub timestamp: u64,
    #[serde(default)]
    pub replies: Vec<CommentReply>,
    #[serde(default)]
    pub is_resolved: bool,
}

impl Comment {
    pub fn new(
        document_uri: impl Into<DocumentUri>,
        range: Range,
        author: &User,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_id("comment"),
            document_uri: document_uri.into(),
            range,
            user_id: author.id.clone(),
            user_name: author.name.clone(),
            content: content.into(),
            timestamp: now_millis(),
            replies: Vec::new(),
            is_resolved: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_prefixed_and_unique() {
        let a = generate_id("msg");
        let b = generate_id("msg");
        assert!(a.starts_with("msg_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_palette_color_is_stable() {
        let c1 = palette_color("user_abc");
        let c2 = palette_color("user_abc");
        assert_eq!(c1, c2);
        assert!(USER_PALETTE.contains(&c1));

        let user = User::with_id("user_abc", "Alice");
        assert_eq!(user.color, c1);
        assert!(user.is_online);
    }

    #[test]
    fn test_new_session_has_owner_as_sole_participant() {
        let owner = User::new("Alice");
        let session = Session::new("Demo", owner.clone(), Vec::new());

        assert_eq!(session.name, "Demo");
        assert!(session.id.starts_with("session_"));
        assert!(session.is_owner(&owner.id));
        assert_eq!(session.participant_list(), vec![owner]);
        assert!(session.is_active);
    }

    #[test]
    fn test_session_roster_add_remove() {
        let mut session = Session::new("Demo", User::new("Alice"), Vec::new());
        let bob = User::new("Bob");

        assert!(session.add_participant(bob.clone()));
        assert!(!session.add_participant(bob.clone()));
        assert_eq!(session.participants.len(), 2);

        assert_eq!(session.remove_participant(&bob.id), Some(bob.clone()));
        assert!(session.remove_participant(&bob.id).is_none());
    }

    #[test]
    fn test_presence_from_partial_update_drops_omitted_fields() {
        let presence = Presence::from_update("user_1", PresenceUpdate::typing(true));
        assert!(presence.is_typing);
        assert!(presence.cursor_position.is_none());
        assert!(presence.document_uri.is_none());

        let presence = Presence::from_update(
            "user_1",
            PresenceUpdate::cursor("file:///a.rs", Position::new(3, 4)),
        );
        assert!(!presence.is_typing);
        assert_eq!(presence.cursor_position, Some(Position::new(3, 4)));
    }

    #[test]
    fn test_message_mentions_deduplicated() {
        let author = User::new("Alice");
        let msg = Message::new(
            "session_1",
            &author,
            "hi @bob",
            vec!["user_bob".into(), "user_bob".into(), "user_carol".into()],
            None,
        );
        assert_eq!(msg.mentions, vec!["user_bob".to_string(), "user_carol".to_string()]);
        assert!(msg.mentions_user("user_carol"));
        assert!(!msg.is_edited);
    }

    #[test]
    fn test_operation_serializes_kind_as_type() {
        let op = Operation::insert("file:///a.rs", Position::new(0, 0), "x", "user_1");
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "insert");
        assert_eq!(json["documentUri"], "file:///a.rs");
        assert!(json.get("length").is_none());
    }

    #[test]
    fn test_range_is_empty() {
        assert!(Range::new(1, 2, 1, 2).is_empty());
        assert!(!Range::new(1, 2, 1, 5).is_empty());
    }
}
