//! Typed errors for the protocol and transport layers.
//!
//! Raw `serde_json` and OS socket errors never cross a module boundary:
//! everything is mapped into one of these enums, and each variant knows the
//! wire [`ErrorCode`] it reports as.

use crate::command::ErrorCode;
use std::path::PathBuf;
use thiserror::Error;

/// Failure to construct, encode, decode, or validate an [`Envelope`].
///
/// [`Envelope`]: crate::message::Envelope
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The bytes were not valid JSON.
    #[error("malformed message: {0}")]
    MalformedJson(#[source] serde_json::Error),

    /// The message parsed but a required field is missing or has the
    /// wrong type.
    #[error("invalid message: missing or invalid field '{0}'")]
    MissingField(&'static str),

    /// The message names a protocol version this build does not speak.
    #[error("unsupported protocol version '{0}'")]
    UnsupportedVersion(String),

    /// The envelope could not be serialized. Practically unreachable for
    /// well-formed payloads; kept so encoding never panics.
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ProtocolError {
    /// The wire error code this failure reports as.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProtocolError::MalformedJson(_) => ErrorCode::MalformedJson,
            ProtocolError::MissingField(_) => ErrorCode::InvalidMessage,
            ProtocolError::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            ProtocolError::Encode(_) => ErrorCode::InternalError,
        }
    }
}

/// Failure at the socket or framing layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A blocking operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The peer closed the connection mid-message or the stream broke.
    #[error("connection lost")]
    ConnectionLost,

    /// The socket exists but nothing is accepting on it.
    #[error("connection refused on {0}")]
    ConnectionRefused(PathBuf),

    /// The socket path does not exist (engine not running).
    #[error("socket not found: {0}")]
    SocketNotFound(PathBuf),

    /// A frame declared or carried more bytes than the protocol ceiling.
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },

    /// A frame declared a zero-length body.
    #[error("zero-length frame")]
    EmptyFrame,

    /// The framed bytes failed to decode into an envelope.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Any other socket-level failure.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// The wire error code this failure reports as.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            TransportError::Timeout => ErrorCode::Timeout,
            TransportError::ConnectionLost => ErrorCode::ConnectionLost,
            TransportError::ConnectionRefused(_) => ErrorCode::ConnectionRefused,
            TransportError::SocketNotFound(_) => ErrorCode::ConnectionFailed,
            TransportError::MessageTooLarge { .. } => ErrorCode::MessageTooLarge,
            TransportError::EmptyFrame => ErrorCode::InvalidMessage,
            TransportError::Protocol(e) => e.error_code(),
            TransportError::Io(_) => ErrorCode::SocketError,
        }
    }

    /// True when the connection can keep serving messages after this error.
    ///
    /// Frame-level violations desynchronize the length-prefix stream, so the
    /// connection must be dropped; a decode failure inside a well-delimited
    /// frame leaves the stream intact.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::Protocol(_))
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
