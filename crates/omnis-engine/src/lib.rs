//! Privileged engine side of the omnis installer IPC channel.
//!
//! The engine process owns the listening socket and everything behind it:
//!
//! - [`security`] — the last line of defense between request-derived data
//!   and privileged handler logic (command whitelist, structural limits,
//!   path screening).
//! - [`dispatch`] — the registry mapping [`Command`](omnis_core::Command)s
//!   to handler functions and shaping their results into responses.
//! - [`server`] — connection acceptance, per-connection request loops, and
//!   out-of-band event broadcasting.
//! - [`engine`] — the built-in handlers for the fixed command set and the
//!   seam where the job-orchestration layer plugs in.
//! - [`config`] — TOML configuration with full defaults.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod security;
pub mod server;

pub use config::EngineConfig;
pub use dispatch::{Dispatcher, HandlerError};
pub use engine::{Engine, EventSink, JobBackend};
pub use security::{SecurityValidator, ValidationError, ValidatorLimits};
pub use server::{IpcServer, ServerConfig, ServerState};
