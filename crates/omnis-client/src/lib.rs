//! Client library for the omnis installer engine IPC socket.
//!
//! [`IpcClient`] connects to the engine's Unix socket, correlates requests
//! with responses by message id, and fans broadcast events out to registered
//! subscriptions. One background task owns the read half of the socket and
//! one owns the write half, so any number of callers can issue requests
//! concurrently over a single connection.

pub mod client;

pub use client::{ClientError, EventCallback, IpcClient, ResponseCallback};
