//! Error types for the connection and session layer.

use std::io;

use thiserror::Error;

use crate::session::{SessionId, SessionState};

/// Result type alias for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Network operation errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Failed to bind the listener.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        /// The address we tried to bind.
        addr: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Failed to establish an outbound connection.
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        /// The address we tried to dial.
        addr: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A frame was offered to a session outside the `WORKING` state.
    #[error("Session {id} is not working (state: {state})")]
    NotWorking {
        /// Session the write was attempted on.
        id: SessionId,
        /// State the session was in.
        state: SessionState,
    },

    /// `start` was called on a session whose pumps already ran.
    #[error("Session {0} was already started")]
    AlreadyStarted(SessionId),

    /// The session's write pump is gone, so the frame could not be queued.
    #[error("Session {0} is disconnected")]
    Disconnected(SessionId),

    /// No live session has this id.
    #[error("Unknown session {0}")]
    UnknownSession(SessionId),

    /// Protocol-level error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The kind byte of a frame header is not a known frame kind.
    #[error("Unknown frame kind: {0:#x}")]
    UnknownFrameKind(u8),
}
