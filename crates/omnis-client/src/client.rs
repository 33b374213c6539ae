//! Connection handle for the engine socket.
//!
//! The client splits its socket: a background receive task owns the read
//! half and routes every inbound envelope, while a writer task owns the
//! write half and drains an outbound queue. Callers never touch the socket,
//! so concurrent requests from many tasks share one connection safely.
//!
//! Responses are matched to callers by envelope id. Broadcast events are
//! fanned out to registered subscriptions; a subscription callback that
//! panics is contained and does not take down the receive loop.

use omnis_core::command::{Command, ErrorCode, EventKind};
use omnis_core::error::TransportError;
use omnis_core::framing::{recv_envelope, send_envelope};
use omnis_core::message::{Envelope, MessageType};
use omnis_core::transport::{DEFAULT_CONNECT_TIMEOUT, connect_with_timeout};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default bound on a single request/response round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const OUTBOUND_QUEUE_LEN: usize = 64;

/// Failures surfaced to client callers.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("request timed out")]
    Timeout,
    #[error("connection to the engine was lost")]
    ConnectionLost,
    #[error("client is not connected")]
    NotConnected,
    /// The engine answered with an error response.
    #[error("engine error {code}: {message}")]
    Remote {
        code: ErrorCode,
        message: String,
        details: Value,
    },
}

impl ClientError {
    /// Wire error code best describing this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ClientError::Transport(e) => e.error_code(),
            ClientError::Timeout => ErrorCode::Timeout,
            ClientError::ConnectionLost | ClientError::NotConnected => ErrorCode::ConnectionLost,
            ClientError::Remote { code, .. } => *code,
        }
    }
}

/// Called once with the outcome of a fire-and-forget request.
pub type ResponseCallback = Box<dyn FnOnce(Result<Value, ClientError>) + Send + 'static>;

/// Called for every broadcast event a subscription matches.
pub type EventCallback = Arc<dyn Fn(EventKind, &Value) + Send + Sync>;

enum Waiter {
    Oneshot(oneshot::Sender<Envelope>),
    Callback(ResponseCallback),
    /// Fire-and-forget request: the response is expected and drained, just
    /// not delivered anywhere.
    Discard,
}

struct Subscription {
    filter: Option<EventKind>,
    callback: EventCallback,
}

type PendingMap = Arc<Mutex<HashMap<String, Waiter>>>;
type SubscriptionMap = Arc<Mutex<HashMap<u64, Subscription>>>;

/// A live connection to the engine socket.
///
/// Dropping the client closes the connection; pending requests then fail
/// with [`ClientError::ConnectionLost`].
pub struct IpcClient {
    outbound: mpsc::Sender<Envelope>,
    pending: PendingMap,
    subscriptions: SubscriptionMap,
    next_sub_id: AtomicU64,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcClient")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl IpcClient {
    /// Connect to the engine socket at `path`.
    pub async fn connect(path: &Path) -> Result<Self, ClientError> {
        Self::connect_timeout(path, DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Connect with an explicit connection timeout.
    pub async fn connect_timeout(path: &Path, timeout: Duration) -> Result<Self, ClientError> {
        let stream = connect_with_timeout(path, timeout).await?;
        info!("Connected to engine at {}", path.display());

        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_LEN);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let subscriptions: SubscriptionMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        tokio::spawn(writer_loop(write_half, outbound_rx, cancel.clone()));
        tokio::spawn(receive_loop(
            read_half,
            pending.clone(),
            subscriptions.clone(),
            connected.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            outbound: outbound_tx,
            pending,
            subscriptions,
            next_sub_id: AtomicU64::new(1),
            connected,
            cancel,
        })
    }

    /// True while the connection is up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Close the connection. Pending requests fail with
    /// [`ClientError::ConnectionLost`]; subscriptions stop firing.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("Disconnecting from engine");
        }
        self.cancel.cancel();
    }

    /// Send `command` and wait for its response.
    ///
    /// Returns the response's result map on success and
    /// [`ClientError::Remote`] when the engine answers with an error
    /// response. `timeout` defaults to [`DEFAULT_REQUEST_TIMEOUT`].
    pub async fn send_command(
        &self,
        command: Command,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let request = Envelope::request(command, args);
        let id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), Waiter::Oneshot(tx));

        if self.outbound.send(request).await.is_err() {
            lock(&self.pending).remove(&id);
            return Err(ClientError::ConnectionLost);
        }

        let timeout = timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => interpret_response(response),
            // The receive loop dropped the waiter without answering.
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Send `command` without waiting. When `callback` is given it fires
    /// once with the outcome; without one, the response is discarded.
    ///
    /// Returns the request id.
    pub async fn send_command_async(
        &self,
        command: Command,
        args: Value,
        callback: Option<ResponseCallback>,
    ) -> Result<String, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let request = Envelope::request(command, args);
        let id = request.id.clone();
        let waiter = match callback {
            Some(callback) => Waiter::Callback(callback),
            None => Waiter::Discard,
        };
        lock(&self.pending).insert(id.clone(), waiter);

        if self.outbound.send(request).await.is_err() {
            if let Some(Waiter::Callback(callback)) = lock(&self.pending).remove(&id) {
                callback(Err(ClientError::ConnectionLost));
            }
            return Err(ClientError::ConnectionLost);
        }
        Ok(id)
    }

    /// Register `callback` for broadcast events. `filter` narrows delivery
    /// to one event kind; `None` matches every event.
    ///
    /// Returns a subscription id for [`unsubscribe_event`](Self::unsubscribe_event).
    pub fn subscribe_event(&self, filter: Option<EventKind>, callback: EventCallback) -> u64 {
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.subscriptions).insert(id, Subscription { filter, callback });
        id
    }

    /// Remove a subscription. Returns `false` when the id is unknown.
    pub fn unsubscribe_event(&self, id: u64) -> bool {
        lock(&self.subscriptions).remove(&id).is_some()
    }

    /// Round-trip liveness check: sends PING and verifies the echo.
    pub async fn ping(&self) -> Result<(), ClientError> {
        let result = self
            .send_command(Command::Ping, json!({ "echo": "ping" }), None)
            .await?;
        if result.get("pong").and_then(Value::as_bool) == Some(true) {
            Ok(())
        } else {
            Err(ClientError::Remote {
                code: ErrorCode::InternalError,
                message: "malformed PING response".to_string(),
                details: result,
            })
        }
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn interpret_response(response: Envelope) -> Result<Value, ClientError> {
    if response.is_success() {
        return Ok(response.result());
    }
    match response.error_info() {
        Some(info) => Err(ClientError::Remote {
            code: info.code,
            message: info.message,
            details: info.details,
        }),
        None => Err(ClientError::Remote {
            code: ErrorCode::InternalError,
            message: "error response without error details".to_string(),
            details: Value::Null,
        }),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Background tasks ─────────────────────────────────────────────────────────

/// Sole writer for the socket; drains the outbound queue in order.
async fn writer_loop(
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            envelope = outbound_rx.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };
        if let Err(e) = send_envelope(&mut write_half, &envelope).await {
            warn!("Write to engine failed: {e}");
            cancel.cancel();
            break;
        }
    }
    debug!("Client writer finished");
}

/// Reads every inbound envelope and routes it: responses to their waiting
/// caller, events to matching subscriptions.
async fn receive_loop(
    mut read_half: OwnedReadHalf,
    pending: PendingMap,
    subscriptions: SubscriptionMap,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = recv_envelope(&mut read_half) => result,
        };
        match result {
            Ok(Some(envelope)) => route_envelope(envelope, &pending, &subscriptions),
            Ok(None) => {
                info!("Engine closed the connection");
                break;
            }
            Err(e) if e.is_recoverable() => {
                warn!("Discarding undecodable message from engine: {e}");
            }
            Err(e) => {
                warn!("Connection to engine failed: {e}");
                break;
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    cancel.cancel();

    // Fail everything still waiting. Oneshot waiters observe the drop;
    // callbacks are told explicitly.
    let waiters: Vec<Waiter> = lock(&pending).drain().map(|(_, w)| w).collect();
    for waiter in waiters {
        if let Waiter::Callback(callback) = waiter {
            callback(Err(ClientError::ConnectionLost));
        }
    }
    debug!("Client receive loop finished");
}

fn route_envelope(envelope: Envelope, pending: &PendingMap, subscriptions: &SubscriptionMap) {
    match envelope.kind {
        MessageType::Response => match lock(pending).remove(&envelope.id) {
            Some(Waiter::Oneshot(tx)) => {
                let _ = tx.send(envelope);
            }
            Some(Waiter::Callback(callback)) => {
                let outcome = interpret_response(envelope);
                if std::panic::catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
                    warn!("Response callback panicked");
                }
            }
            Some(Waiter::Discard) => debug!("Drained fire-and-forget response {}", envelope.id),
            None => warn!("Dropping response with unknown id {}", envelope.id),
        },
        MessageType::Event => {
            let Some(kind) = envelope.event_name().and_then(|n| n.parse::<EventKind>().ok())
            else {
                warn!("Dropping event with unknown name {:?}", envelope.event_name());
                return;
            };
            let data = envelope.event_data();

            let callbacks: Vec<EventCallback> = lock(subscriptions)
                .values()
                .filter(|sub| sub.filter.is_none() || sub.filter == Some(kind))
                .map(|sub| sub.callback.clone())
                .collect();
            for callback in callbacks {
                if std::panic::catch_unwind(AssertUnwindSafe(|| callback(kind, &data))).is_err() {
                    warn!("Event callback panicked on {kind}");
                }
            }
        }
        MessageType::Request => {
            warn!("Dropping unexpected request from engine (id {})", envelope.id);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
