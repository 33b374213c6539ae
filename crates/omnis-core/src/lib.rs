//! Core library for the omnis installer IPC channel.
//!
//! The installer is split into an unprivileged UI process and a privileged
//! engine process. Everything that crosses that boundary goes through the
//! types in this crate:
//!
//! - [`message`] — the versioned [`Envelope`](message::Envelope) carrying
//!   requests, responses, and broadcast events, plus the closed
//!   [`Command`](command::Command) / [`EventKind`](command::EventKind) /
//!   [`ErrorCode`](command::ErrorCode) vocabularies.
//! - [`framing`] — length-prefixed framing of encoded envelopes on a byte
//!   stream.
//! - [`transport`] — Unix domain socket setup for both sides (bind with
//!   owner-only permissions, connect with timeout).
//! - [`error`] — the typed error taxonomy shared by both processes.
//!
//! The privileged server lives in `omnis-engine`; the UI-side client lives
//! in `omnis-client`. Both are thin layers over this crate.

pub mod command;
pub mod error;
pub mod framing;
pub mod logging;
pub mod message;
pub mod transport;

pub use command::{Command, ErrorCode, EventKind};
pub use error::{ProtocolError, TransportError};
pub use message::{Envelope, ErrorInfo, MessageType, PROTOCOL_VERSION};
