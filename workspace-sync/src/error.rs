//! Error taxonomy shared by the document cache, the session coordinator and
//! the pull-sync endpoint.

use thiserror::Error;

/// Errors surfaced by sync operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Room, campaign or blob is absent when it must exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing or unrecognized credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The identity is known but not permitted to access the target.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Malformed version vector, room id or connection path.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// CRDT type tag outside the supported set.
    #[error("unsupported room kind: {0}")]
    UnsupportedRoomKind(String),

    /// Blob or metadata store unreachable. Retryable.
    #[error("storage I/O error: {0}")]
    Io(String),

    /// The fork was built in memory but its blob or metadata never became durable.
    #[error("fork of {uri} failed: {reason}")]
    ForkFailure { uri: String, reason: String },

    /// An update or snapshot payload could not be decoded or applied.
    #[error("CRDT error: {0}")]
    Crdt(String),

    /// The coordinator mailbox is closed (process shutting down).
    #[error("coordinator unavailable: {0}")]
    Unavailable(String),
}

impl SyncError {
    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Io(_) | SyncError::Unavailable(_))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
