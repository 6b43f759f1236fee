use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::transport::TransportError;

/// Errors surfaced to callers of the collaboration API.
///
/// Only precondition violations and transport failures are reported this
/// way; missing-session cases of fire-and-forget operations are silent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollabError {
    #[error("local user is not initialized")]
    NoLocalUser,
    #[error("not in a collaboration session")]
    NoActiveSession,
    #[error("{0} disabled by configuration")]
    FeatureDisabled(&'static str),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
