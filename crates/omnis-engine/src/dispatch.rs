//! Command dispatch: routing validated requests to registered handlers.
//!
//! The dispatcher owns an explicit map from the closed [`Command`] enum to
//! handler functions, so registering anything outside the fixed command set
//! is impossible by construction. Each command holds exactly one handler at
//! a time — sync or async — and re-registration replaces the previous one
//! with a warning.
//!
//! Handler results are translated into response envelopes here; a handler
//! failure, including a panic, becomes an error response and never a
//! process-level fault.

use crate::security::ValidationError;
use omnis_core::command::{Command, ErrorCode};
use omnis_core::message::{Envelope, ErrorInfo};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// A typed failure produced by a command handler.
///
/// Carries the wire error code plus a message for the UI and optional
/// diagnostic details.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct HandlerError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
}

impl HandlerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

impl From<ValidationError> for HandlerError {
    fn from(err: ValidationError) -> Self {
        HandlerError::new(err.error_code(), err.to_string())
    }
}

/// Result type every handler produces.
pub type HandlerResult = Result<Value, HandlerError>;

type SyncHandler = Arc<dyn Fn(Value) -> HandlerResult + Send + Sync>;
type BoxedFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
type AsyncHandler = Arc<dyn Fn(Value) -> BoxedFuture + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

/// Registry mapping commands to handler functions.
#[derive(Default)]
pub struct Dispatcher {
    handlers: Mutex<HashMap<Command, Handler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a synchronous handler to `command`.
    ///
    /// Replaces any previously registered handler for the command, sync or
    /// async, so a command never holds two handlers at once.
    pub fn register<F>(&self, command: Command, handler: F)
    where
        F: Fn(Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(command, Handler::Sync(Arc::new(handler)));
    }

    /// Bind an asynchronous handler to `command`. Same replacement rule as
    /// [`register`](Self::register).
    pub fn register_async<F, Fut>(&self, command: Command, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let wrapped: AsyncHandler = Arc::new(move |args| Box::pin(handler(args)) as BoxedFuture);
        self.insert(command, Handler::Async(wrapped));
    }

    fn insert(&self, command: Command, handler: Handler) {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        if handlers.insert(command, handler).is_some() {
            warn!("Replacing existing handler for command {command}");
        }
    }

    /// True when a handler is registered for `command`.
    pub fn has_handler(&self, command: Command) -> bool {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&command)
    }

    /// Route a validated request to its handler and shape the outcome into
    /// a response envelope echoing the request id.
    ///
    /// A missing handler yields an `INVALID_COMMAND` error response. A
    /// panicking handler is contained and reported as `INTERNAL_ERROR`.
    pub async fn dispatch(&self, request: &Envelope) -> Envelope {
        let name = request.command().unwrap_or("").to_string();
        let command: Command = match name.parse() {
            Ok(c) => c,
            Err(_) => {
                return Envelope::error_response(
                    &request.id,
                    &name,
                    ErrorInfo::new(
                        ErrorCode::InvalidCommand,
                        format!("unknown command: '{name}'"),
                    ),
                );
            }
        };

        let handler = {
            let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            handlers.get(&command).cloned()
        };

        let Some(handler) = handler else {
            return Envelope::error_response(
                &request.id,
                command.as_str(),
                ErrorInfo::new(
                    ErrorCode::InvalidCommand,
                    format!("no handler registered for command {command}"),
                ),
            );
        };

        debug!("Dispatching {command} (request {})", request.id);
        let args = request.args();
        let outcome = match handler {
            Handler::Sync(f) => match std::panic::catch_unwind(AssertUnwindSafe(|| f(args))) {
                Ok(result) => result,
                Err(_) => Err(panic_error(command)),
            },
            Handler::Async(f) => {
                // Run the future on its own task so a panic is contained in
                // the join error instead of unwinding through this loop.
                match tokio::spawn(f(args)).await {
                    Ok(result) => result,
                    Err(join_err) => {
                        warn!("Handler task for {command} failed: {join_err}");
                        Err(panic_error(command))
                    }
                }
            }
        };

        match outcome {
            Ok(result) => Envelope::response(&request.id, command.as_str(), result),
            Err(err) => Envelope::error_response(
                &request.id,
                command.as_str(),
                ErrorInfo::new(err.code, err.message).with_details(err.details),
            ),
        }
    }
}

fn panic_error(command: Command) -> HandlerError {
    HandlerError::new(
        ErrorCode::InternalError,
        format!("handler for {command} failed unexpectedly"),
    )
}

// ── Tests ────────────────────────────────────────────────────────────────────
