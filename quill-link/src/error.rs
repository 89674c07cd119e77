//! Errors surfaced by connections, the registry and the transport.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Everything that can go wrong between a caller and the far end.
///
/// `Clone` so that one failed connect attempt can be handed to every
/// caller awaiting the same registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("invalid WebSocket URL: {0}")]
    InvalidUrl(String),

    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The far end closed the socket because a request named a session
    /// it did not issue.
    #[error("session mismatch: {0}")]
    SessionMismatch(String),

    #[error("request {id} timed out after {timeout:?}")]
    RequestTimeout { id: String, timeout: Duration },

    #[error("server error (code {code}): {message}")]
    Server { code: i32, message: String },

    #[error("request id {0} is already pending")]
    DuplicateRequestId(String),

    #[error("socket closed: {0}")]
    SocketClosed(String),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("no session established")]
    NoSession,

    #[error("connection is not open")]
    NotOpen,

    #[error("connection service error: {0}")]
    Service(String),
}

impl LinkError {
    /// Failures the suggestion flow absorbs silently by falling back to
    /// idle, as opposed to ones worth a notice.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Self::NoSession | Self::NotOpen | Self::SocketClosed(_)
        )
    }
}
