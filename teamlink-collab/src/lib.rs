//! # teamlink-collab: real-time collaboration sessions
//!
//! Session protocol client for shared editing: presence, document edit
//! relay, chat and inline comments over one WebSocket connection with
//! automatic reconnection. Includes a small in-memory relay server.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────── CollabClient ────────────────────────┐
//! │ SessionManager  PresenceTracker  DocumentSync  Messaging     │
//! │        │               │              │            │         │
//! │        └───────────────┴──── Outbox ──┴────────────┘         │
//! │                              │                               │
//! │  EventBus ◄── Dispatcher ◄── Transport ◄──── WebSocket ──────┼──► RelayServer
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: Users, sessions, presence, operations, messages, comments
//! - [`protocol`]: JSON frames (`InboundFrame` / `OutboundFrame`)
//! - [`transport`]: WebSocket connection, outbound queue, reconnection
//! - [`session`]: Session lifecycle and roster
//! - [`presence`]: Per-user cursor / selection / typing state
//! - [`document`]: Operation relay and document versions
//! - [`messaging`]: Chat and inline comments
//! - [`dispatcher`]: Routing of inbound frames
//! - [`events`]: `CollabEvent` broadcast to subscribers
//! - [`client`]: The `CollabClient` facade
//! - [`server`] / [`broadcast`]: Reference relay

pub mod broadcast;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod document;
pub mod error;
pub mod events;
pub mod messaging;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RelayedFrame};
pub use client::CollabClient;
pub use config::{CollabConfig, ConfigError, ConflictResolution, ParticipantRole, VersionPolicy};
pub use error::CollabError;
pub use events::{CollabEvent, EventBus};
pub use model::{
    Comment, CommentReply, DocumentUri, Message, Operation, OperationKind, Position, Presence,
    PresenceUpdate, Range, Session, User,
};
pub use protocol::{InboundFrame, OutboundFrame, ProtocolError};
pub use server::{RelayConfig, RelayError, RelayServer, RelayStats};
pub use session::{SessionContext, SessionManager, SessionView};
pub use transport::{ConnectionState, ReconnectPolicy, TransportError};
