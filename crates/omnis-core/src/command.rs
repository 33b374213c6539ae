//! Closed protocol vocabularies: commands, events, and error codes.
//!
//! These enums are the complete sets the two processes may exchange. They
//! are deliberately not extension points: the engine rejects any command
//! outside [`Command`] before dispatch, and unknown event or error-code
//! strings fail to parse rather than falling back to a default.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fixed set of verbs the UI process may invoke on the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    Ping,
    GetStatus,
    GetBranding,
    GetJobNames,
    StartInstallation,
    CancelInstallation,
    ValidateConfig,
    Shutdown,
}

impl Command {
    /// All commands, in a stable order. Used for whitelist iteration.
    pub const ALL: [Command; 8] = [
        Command::Ping,
        Command::GetStatus,
        Command::GetBranding,
        Command::GetJobNames,
        Command::StartInstallation,
        Command::CancelInstallation,
        Command::ValidateConfig,
        Command::Shutdown,
    ];

    /// Wire representation of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Ping => "PING",
            Command::GetStatus => "GET_STATUS",
            Command::GetBranding => "GET_BRANDING",
            Command::GetJobNames => "GET_JOB_NAMES",
            Command::StartInstallation => "START_INSTALLATION",
            Command::CancelInstallation => "CANCEL_INSTALLATION",
            Command::ValidateConfig => "VALIDATE_CONFIG",
            Command::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PING" => Ok(Command::Ping),
            "GET_STATUS" => Ok(Command::GetStatus),
            "GET_BRANDING" => Ok(Command::GetBranding),
            "GET_JOB_NAMES" => Ok(Command::GetJobNames),
            "START_INSTALLATION" => Ok(Command::StartInstallation),
            "CANCEL_INSTALLATION" => Ok(Command::CancelInstallation),
            "VALIDATE_CONFIG" => Ok(Command::ValidateConfig),
            "SHUTDOWN" => Ok(Command::Shutdown),
            other => Err(UnknownName {
                kind: "command",
                name: other.to_string(),
            }),
        }
    }
}

/// The fixed set of notifications the engine may broadcast to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    JobStarted,
    JobProgress,
    JobCompleted,
    ErrorOccurred,
    InstallationComplete,
    EngineReady,
    EngineShutdown,
}

impl EventKind {
    /// Wire representation of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::JobStarted => "JOB_STARTED",
            EventKind::JobProgress => "JOB_PROGRESS",
            EventKind::JobCompleted => "JOB_COMPLETED",
            EventKind::ErrorOccurred => "ERROR_OCCURRED",
            EventKind::InstallationComplete => "INSTALLATION_COMPLETE",
            EventKind::EngineReady => "ENGINE_READY",
            EventKind::EngineShutdown => "ENGINE_SHUTDOWN",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "JOB_STARTED" => Ok(EventKind::JobStarted),
            "JOB_PROGRESS" => Ok(EventKind::JobProgress),
            "JOB_COMPLETED" => Ok(EventKind::JobCompleted),
            "ERROR_OCCURRED" => Ok(EventKind::ErrorOccurred),
            "INSTALLATION_COMPLETE" => Ok(EventKind::InstallationComplete),
            "ENGINE_READY" => Ok(EventKind::EngineReady),
            "ENGINE_SHUTDOWN" => Ok(EventKind::EngineShutdown),
            other => Err(UnknownName {
                kind: "event",
                name: other.to_string(),
            }),
        }
    }
}

/// Machine-readable failure taxonomy carried in error responses.
///
/// Grouped by origin: protocol, connection, authorization, engine state,
/// installation, and system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Protocol
    InvalidMessage,
    UnsupportedVersion,
    InvalidCommand,
    MalformedJson,
    MessageTooLarge,
    // Connection
    ConnectionFailed,
    ConnectionLost,
    ConnectionRefused,
    SocketError,
    // Authorization
    PermissionDenied,
    InvalidCredentials,
    // Engine state
    EngineNotReady,
    EngineBusy,
    InvalidState,
    // Installation
    InvalidTarget,
    InsufficientSpace,
    DiskIoError,
    JobFailed,
    ValidationFailed,
    // System
    Timeout,
    InternalError,
}

impl ErrorCode {
    /// Wire representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::UnsupportedVersion => "UNSUPPORTED_VERSION",
            ErrorCode::InvalidCommand => "INVALID_COMMAND",
            ErrorCode::MalformedJson => "MALFORMED_JSON",
            ErrorCode::MessageTooLarge => "MESSAGE_TOO_LARGE",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::ConnectionLost => "CONNECTION_LOST",
            ErrorCode::ConnectionRefused => "CONNECTION_REFUSED",
            ErrorCode::SocketError => "SOCKET_ERROR",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::InvalidCredentials => "INVALID_CREDENTIALS",
            ErrorCode::EngineNotReady => "ENGINE_NOT_READY",
            ErrorCode::EngineBusy => "ENGINE_BUSY",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::InvalidTarget => "INVALID_TARGET",
            ErrorCode::InsufficientSpace => "INSUFFICIENT_SPACE",
            ErrorCode::DiskIoError => "DISK_IO_ERROR",
            ErrorCode::JobFailed => "JOB_FAILED",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INVALID_MESSAGE" => Ok(ErrorCode::InvalidMessage),
            "UNSUPPORTED_VERSION" => Ok(ErrorCode::UnsupportedVersion),
            "INVALID_COMMAND" => Ok(ErrorCode::InvalidCommand),
            "MALFORMED_JSON" => Ok(ErrorCode::MalformedJson),
            "MESSAGE_TOO_LARGE" => Ok(ErrorCode::MessageTooLarge),
            "CONNECTION_FAILED" => Ok(ErrorCode::ConnectionFailed),
            "CONNECTION_LOST" => Ok(ErrorCode::ConnectionLost),
            "CONNECTION_REFUSED" => Ok(ErrorCode::ConnectionRefused),
            "SOCKET_ERROR" => Ok(ErrorCode::SocketError),
            "PERMISSION_DENIED" => Ok(ErrorCode::PermissionDenied),
            "INVALID_CREDENTIALS" => Ok(ErrorCode::InvalidCredentials),
            "ENGINE_NOT_READY" => Ok(ErrorCode::EngineNotReady),
            "ENGINE_BUSY" => Ok(ErrorCode::EngineBusy),
            "INVALID_STATE" => Ok(ErrorCode::InvalidState),
            "INVALID_TARGET" => Ok(ErrorCode::InvalidTarget),
            "INSUFFICIENT_SPACE" => Ok(ErrorCode::InsufficientSpace),
            "DISK_IO_ERROR" => Ok(ErrorCode::DiskIoError),
            "JOB_FAILED" => Ok(ErrorCode::JobFailed),
            "VALIDATION_FAILED" => Ok(ErrorCode::ValidationFailed),
            "TIMEOUT" => Ok(ErrorCode::Timeout),
            "INTERNAL_ERROR" => Ok(ErrorCode::InternalError),
            other => Err(UnknownName {
                kind: "error code",
                name: other.to_string(),
            }),
        }
    }
}

/// Parse failure for a name outside one of the closed sets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{name}'")]
pub struct UnknownName {
    kind: &'static str,
    name: String,
}

// ── Tests ────────────────────────────────────────────────────────────────────
