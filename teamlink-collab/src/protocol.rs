//! JSON wire protocol for the collaboration session.
//!
//! Wire format: newline-delimited JSON text frames, each tagged by `type`:
//! ```text
//! {"type":"chat_message","message":{"id":"msg_…","content":"hello",…}}\n
//! {"type":"user_left","userId":"user_…"}\n
//! ```
//!
//! Client → server frames are [`OutboundFrame`]; server → client frames are
//! [`InboundFrame`]. Both are closed enums, so routing is an exhaustive
//! `match` rather than a string switch.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Comment, CommentReply, DocumentUri, Message, Operation, Presence, Session, User};

/// Frames sent by the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum InboundFrame {
    /// Confirms a `join_session` with the full session snapshot
    SessionJoined { session: Session },
    /// Another participant joined
    UserJoined { user: User },
    /// A participant left or dropped
    UserLeft { user_id: String },
    PresenceUpdate { presence: Presence },
    DocumentOperation { operation: Operation },
    /// Full document content in answer to `sync_document`
    DocumentSync { document_uri: DocumentUri, content: String, version: u64 },
    ChatMessage { message: Message },
    CommentAdded { comment: Comment },
    CommentUpdated { comment: Comment },
    CommentDeleted { comment_id: String },
}

impl InboundFrame {
    /// Every `type` tag this enum understands.
    pub const KINDS: [&'static str; 10] = [
        "session_joined",
        "user_joined",
        "user_left",
        "presence_update",
        "document_operation",
        "document_sync",
        "chat_message",
        "comment_added",
        "comment_updated",
        "comment_deleted",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionJoined { .. } => "session_joined",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::PresenceUpdate { .. } => "presence_update",
            Self::DocumentOperation { .. } => "document_operation",
            Self::DocumentSync { .. } => "document_sync",
            Self::ChatMessage { .. } => "chat_message",
            Self::CommentAdded { .. } => "comment_added",
            Self::CommentUpdated { .. } => "comment_updated",
            Self::CommentDeleted { .. } => "comment_deleted",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        decode_frame(line, &Self::KINDS)
    }
}

/// Frames sent by a client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OutboundFrame {
    CreateSession { session: Session },
    JoinSession { session_id: String, user: User },
    LeaveSession { session_id: String, user_id: String },
    PresenceUpdate { session_id: String, presence: Presence },
    DocumentOperation { session_id: String, operation: Operation },
    SyncDocument { session_id: String, document_uri: DocumentUri },
    ChatMessage { message: Message },
    AddComment { session_id: String, comment: Comment },
    ReplyComment { session_id: String, comment_id: String, reply: CommentReply },
    ResolveComment { session_id: String, comment_id: String, resolved: bool },
}

impl OutboundFrame {
    pub const KINDS: [&'static str; 10] = [
        "create_session",
        "join_session",
        "leave_session",
        "presence_update",
        "document_operation",
        "sync_document",
        "chat_message",
        "add_comment",
        "reply_comment",
        "resolve_comment",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateSession { .. } => "create_session",
            Self::JoinSession { .. } => "join_session",
            Self::LeaveSession { .. } => "leave_session",
            Self::PresenceUpdate { .. } => "presence_update",
            Self::DocumentOperation { .. } => "document_operation",
            Self::SyncDocument { .. } => "sync_document",
            Self::ChatMessage { .. } => "chat_message",
            Self::AddComment { .. } => "add_comment",
            Self::ReplyComment { .. } => "reply_comment",
            Self::ResolveComment { .. } => "resolve_comment",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        decode_frame(line, &Self::KINDS)
    }
}

/// Split a text message into its newline-delimited frames, skipping blanks.
pub fn split_frames(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim).filter(|line| !line.is_empty())
}

fn encode_frame<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    // serde_json never emits raw newlines, so one frame is always one line.
    serde_json::to_string(frame).map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn decode_frame<T: DeserializeOwned>(line: &str, kinds: &[&str]) -> Result<T, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or(ProtocolError::MissingType)?;
    if !kinds.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Protocol errors. Never fatal: the dispatcher logs and drops the frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame has no `type` field")]
    MissingType,
    #[error("unknown frame type `{0}`")]
    UnknownType(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
}
