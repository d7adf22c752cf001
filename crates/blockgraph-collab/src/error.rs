//! Error types for blockgraph-collab
//!
//! This module provides error types for the collaboration hub,
//! covering transport, decoding, and room lifecycle failures.

use thiserror::Error;

/// Collaboration error type
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying transport failed to read, write or close
    #[error("transport error: {0}")]
    Transport(String),

    /// Connection closed by the peer
    #[error("connection closed")]
    ConnectionClosed,

    /// Message could not be decoded for its declared type
    #[error("decode error: {0}")]
    Decode(String),

    /// Client sent a message only the server may originate
    #[error("protocol violation: client sent server-only message {0:?}")]
    ProtocolViolation(String),

    /// Outbound mailbox of a session was full
    #[error("outbound mailbox full for session {0}")]
    MailboxFull(u64),

    /// Room control loop is no longer running
    #[error("room closed: {0}")]
    RoomClosed(String),

    /// Initial snapshot could not be produced
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// Invalid configuration
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Create a transport error
    #[must_use]
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a decode error
    #[must_use]
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a snapshot error
    #[must_use]
    pub fn snapshot(msg: impl Into<String>) -> Self {
        Self::Snapshot(msg.into())
    }

    /// Get a stable error code for logs and diagnostics
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport_error",
            Self::ConnectionClosed => "connection_closed",
            Self::Decode(_) => "decode_error",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::MailboxFull(_) => "mailbox_full",
            Self::RoomClosed(_) => "room_closed",
            Self::Snapshot(_) => "snapshot_error",
            Self::Config(_) => "config_error",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<axum::Error> for Error {
    fn from(err: axum::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Result type alias for collaboration operations
pub type Result<T> = std::result::Result<T, Error>;
