//! Error taxonomy of the synchronization core.
//!
//! Every variant except [`SyncError::ConnectionClosed`] is recovered by the
//! engine itself (rejoin, resync or offline fallback); they are surfaced to
//! the application through [`SessionEvent`](crate::engine::SessionEvent)s so
//! it can show what happened.

use crate::protocol::ProtocolError;
use crate::transform::TransformGap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// No acknowledgement or join reply within the configured window.
    #[error("timed out waiting for the server")]
    Timeout,

    /// The server's state counter differs from the local one.
    #[error("state mismatch: local {local}, server {remote}")]
    StateMismatch { local: u64, remote: u64 },

    /// The server refused to open another real-time session.
    #[error("no real-time session available")]
    SessionFull,

    /// The transform table has no rule for an operand pair.
    #[error(transparent)]
    TransformGap(#[from] TransformGap),

    /// The local text drifted from the server's without any reported error.
    #[error("local text differs from the server copy")]
    TextDrift,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("connection to the collaboration server was lost")]
    ConnectionClosed,

    #[error("no collaborative script is open")]
    NoActiveSession,

    /// The script is open read-only: offline without ownership, or write
    /// access was revoked.
    #[error("the script is read-only")]
    ReadOnly,
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
