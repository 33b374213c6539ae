//! The privileged side of the IPC channel.
//!
//! The server owns the listening socket and three kinds of tasks:
//!
//! - one **accept loop**, inserting new connections into the shared registry;
//! - one **handler loop per connection**, which receives requests, runs them
//!   through the [`SecurityValidator`] and the [`Dispatcher`], and queues the
//!   response;
//! - one **broadcast loop**, fanning queued events out to every connection.
//!
//! Every byte written to a connection goes through that connection's
//! outbound queue, consumed by a single writer task. The handler loop and
//! the broadcast loop both feed the queue and never touch the socket
//! directly, so a response and a broadcast event can never interleave
//! mid-frame.
//!
//! Lifecycle: `Stopped → Starting → Running → Stopping → Stopped`. A server
//! instance runs once; construct a new one to listen again.

use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::security::SecurityValidator;
use anyhow::{Context, Result, bail};
use omnis_core::command::EventKind;
use omnis_core::error::TransportError;
use omnis_core::framing::{recv_envelope, send_envelope};
use omnis_core::message::{Envelope, ErrorInfo};
use omnis_core::transport::{bind_server_socket, remove_socket_file};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::net::unix::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tunables for the server loops.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path of the listening socket.
    pub socket_path: PathBuf,
    /// Bound on writing one frame to a client; a peer that stops reading
    /// is disconnected after this long.
    pub write_timeout: Duration,
    /// Bounded wait for background loops during [`IpcServer::stop`].
    pub shutdown_timeout: Duration,
    /// Capacity of the shared event broadcast queue.
    pub event_queue_len: usize,
    /// Capacity of each connection's outbound queue.
    pub connection_queue_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(omnis_core::transport::DEFAULT_SOCKET_PATH),
            write_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            event_queue_len: 256,
            connection_queue_len: 64,
        }
    }
}

impl From<&EngineConfig> for ServerConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            socket_path: cfg.socket_path.clone(),
            write_timeout: cfg.timeouts.send(),
            shutdown_timeout: cfg.timeouts.shutdown(),
            ..Self::default()
        }
    }
}

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Registry entry for one live connection: its label and the sending end of
/// its outbound queue.
struct ConnectionHandle {
    peer: String,
    outbound: mpsc::Sender<Envelope>,
}

type ConnectionMap = Arc<Mutex<HashMap<u64, ConnectionHandle>>>;

/// The IPC server owning the privileged end of the socket.
pub struct IpcServer {
    config: ServerConfig,
    validator: Arc<SecurityValidator>,
    dispatcher: Arc<Dispatcher>,
    state: Mutex<ServerState>,
    connections: ConnectionMap,
    event_tx: mpsc::Sender<Envelope>,
    event_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    cancel: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl IpcServer {
    pub fn new(
        config: ServerConfig,
        validator: Arc<SecurityValidator>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_queue_len);
        Self {
            config,
            validator,
            dispatcher,
            state: Mutex::new(ServerState::Stopped),
            connections: Arc::new(Mutex::new(HashMap::new())),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            cancel: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *lock(&self.state)
    }

    /// Number of currently tracked connections.
    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Bind the socket and launch the accept and broadcast loops.
    ///
    /// Broadcasts `ENGINE_READY` once running.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if *state != ServerState::Stopped {
                bail!("server cannot start from state {state:?}");
            }
            *state = ServerState::Starting;
        }

        let event_rx = lock(&self.event_rx)
            .take()
            .context("server instances are single-use; construct a new one to restart")?;

        let listener = bind_server_socket(&self.config.socket_path).with_context(|| {
            format!("Failed to bind socket {}", self.config.socket_path.display())
        })?;
        info!(
            "IPC server listening on {}",
            self.config.socket_path.display()
        );

        let accept = tokio::spawn(accept_loop(
            listener,
            self.connections.clone(),
            self.validator.clone(),
            self.dispatcher.clone(),
            self.cancel.clone(),
            self.config.clone(),
        ));
        let broadcast = tokio::spawn(broadcast_loop(
            event_rx,
            self.connections.clone(),
            self.cancel.clone(),
        ));
        {
            let mut loops = lock(&self.loops);
            loops.push(accept);
            loops.push(broadcast);
        }

        *lock(&self.state) = ServerState::Running;
        self.broadcast_event(EventKind::EngineReady, json!({}))?;
        Ok(())
    }

    /// Enqueue an event for broadcast to every connected client.
    ///
    /// Events are fanned out in the order they were enqueued here.
    pub fn broadcast_event(&self, kind: EventKind, data: Value) -> Result<()> {
        let envelope = Envelope::event(kind, data);
        match self.event_tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => bail!("event queue is full"),
            Err(mpsc::error::TrySendError::Closed(_)) => bail!("server is not running"),
        }
    }

    /// An [`EventSink`](crate::engine::EventSink) feeding this server's
    /// broadcast queue; hand it to the job backend.
    pub fn event_sink(&self) -> crate::engine::EventSink {
        let tx = self.event_tx.clone();
        Arc::new(move |kind, data| {
            if tx.try_send(Envelope::event(kind, data)).is_err() {
                warn!("Dropping {kind} event: broadcast queue unavailable");
            }
        })
    }

    /// Stop serving: notify clients, close connections, unbind the socket.
    ///
    /// Queues `ENGINE_SHUTDOWN` to every live connection before anything is
    /// torn down, so clients observe the event ahead of the close. Loops are
    /// joined with a bounded wait and aborted if they overrun it.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            match *state {
                ServerState::Running | ServerState::Starting => *state = ServerState::Stopping,
                _ => return Ok(()),
            }
        }
        info!("IPC server stopping");

        let shutdown = Envelope::event(EventKind::EngineShutdown, json!({}));
        for handle in lock(&self.connections).values() {
            if handle.outbound.try_send(shutdown.clone()).is_err() {
                debug!("Could not queue shutdown event for {}", handle.peer);
            }
        }

        // Cancelling ends the accept, broadcast, and handler loops; clearing
        // the registry drops the last queue senders, letting each writer
        // drain its remaining messages and close its socket.
        self.cancel.cancel();
        lock(&self.connections).clear();

        let handles: Vec<JoinHandle<()>> = lock(&self.loops).drain(..).collect();
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.config.shutdown_timeout, handle)
                .await
                .is_err()
            {
                warn!("Server loop did not stop within the shutdown timeout; aborting");
                abort.abort();
            }
        }

        remove_socket_file(&self.config.socket_path);
        *lock(&self.state) = ServerState::Stopped;
        info!("IPC server stopped");
        Ok(())
    }
}

/// Poisoning is unrecoverable state corruption for these maps; continuing
/// with the inner value matches how the rest of the process treats them.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Accept loop ──────────────────────────────────────────────────────────────

async fn accept_loop(
    listener: tokio::net::UnixListener,
    connections: ConnectionMap,
    validator: Arc<SecurityValidator>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    config: ServerConfig,
) {
    info!("Accept loop started");
    let mut next_id: u64 = 1;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let conn_id = next_id;
                        next_id += 1;
                        let peer = format!("client-{conn_id}");
                        info!("Accepted connection {peer}");

                        let (read_half, write_half) = stream.into_split();
                        let (outbound_tx, outbound_rx) =
                            mpsc::channel(config.connection_queue_len);
                        lock(&connections).insert(
                            conn_id,
                            ConnectionHandle {
                                peer: peer.clone(),
                                outbound: outbound_tx.clone(),
                            },
                        );

                        let conn_cancel = cancel.child_token();
                        tokio::spawn(writer_loop(
                            peer.clone(),
                            write_half,
                            outbound_rx,
                            conn_cancel.clone(),
                            config.write_timeout,
                        ));
                        tokio::spawn(handler_loop(
                            conn_id,
                            peer,
                            read_half,
                            outbound_tx,
                            connections.clone(),
                            validator.clone(),
                            dispatcher.clone(),
                            conn_cancel,
                        ));
                    }
                    Err(e) => {
                        error!("Accept error: {e}");
                        // Brief pause before retrying to avoid a tight error loop
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    info!("Accept loop stopped");
}

// ── Per-connection writer ────────────────────────────────────────────────────

/// Sole writer for one connection's socket. Exits when every sender is gone
/// (after draining queued messages) or on a write failure, which also ends
/// the connection's handler loop via the shared token.
///
/// Each write is bounded: a peer that stops reading eventually fills the
/// socket buffer, and the stalled send is abandoned after `write_timeout`
/// instead of stranding this task forever.
async fn writer_loop<W>(
    peer: String,
    mut write_half: W,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    conn_cancel: CancellationToken,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = outbound_rx.recv().await {
        match tokio::time::timeout(write_timeout, send_envelope(&mut write_half, &envelope)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Write to {peer} failed: {e}");
                conn_cancel.cancel();
                break;
            }
            Err(_) => {
                warn!("Write to {peer} stalled; dropping connection");
                conn_cancel.cancel();
                break;
            }
        }
    }
    debug!("Writer for {peer} finished");
}

// ── Per-connection handler loop ──────────────────────────────────────────────

/// Receives and serves requests for one connection until it closes or the
/// connection token is cancelled.
///
/// The receive future stays live until a whole frame arrives: only
/// cancellation or connection loss interrupts it, so a frame trickling in
/// slowly is never torn mid-read. A quiet peer simply leaves the receive
/// pending.
#[allow(clippy::too_many_arguments)]
async fn handler_loop(
    conn_id: u64,
    peer: String,
    mut read_half: OwnedReadHalf,
    outbound: mpsc::Sender<Envelope>,
    connections: ConnectionMap,
    validator: Arc<SecurityValidator>,
    dispatcher: Arc<Dispatcher>,
    conn_cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = conn_cancel.cancelled() => break,
            result = recv_envelope(&mut read_half) => {
                match result {
                    Ok(None) => {
                        debug!("{peer} closed the connection");
                        break;
                    }
                    Ok(Some(request)) => {
                        let response =
                            process_request(&request, &validator, &dispatcher).await;
                        if outbound.send(response).await.is_err() {
                            break;
                        }
                    }
                    Err(e) if e.is_recoverable() => {
                        // A well-framed but undecodable message: reject it and
                        // keep serving this connection.
                        warn!("Bad message from {peer}: {e}");
                        let response = Envelope::error_response(
                            "unknown",
                            "",
                            ErrorInfo::new(e.error_code(), e.to_string()),
                        );
                        if outbound.send(response).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // Framing violation or broken stream: the length
                        // prefix can no longer be trusted, so the connection
                        // must go. Report first when the stream still works.
                        warn!("Connection {peer} failed: {e}");
                        if !matches!(e, TransportError::ConnectionLost) {
                            let response = Envelope::error_response(
                                "unknown",
                                "",
                                ErrorInfo::new(e.error_code(), e.to_string()),
                            );
                            let _ = outbound.send(response).await;
                        }
                        break;
                    }
                }
            }
        }
    }

    lock(&connections).remove(&conn_id);
    info!("Connection {peer} closed");
}

/// Validate and dispatch one request, producing the response envelope.
async fn process_request(
    request: &Envelope,
    validator: &SecurityValidator,
    dispatcher: &Dispatcher,
) -> Envelope {
    if let Err(e) = request.validate() {
        return Envelope::error_response(
            &request.id,
            request.command().unwrap_or(""),
            ErrorInfo::new(e.error_code(), e.to_string()),
        );
    }

    let command = match validator.validate_request(request) {
        Ok(command) => command,
        Err(e) => {
            warn!("Rejected request {}: {e}", request.id);
            return Envelope::error_response(
                &request.id,
                request.command().unwrap_or(""),
                ErrorInfo::new(e.error_code(), e.to_string()),
            );
        }
    };

    // Each hop constructs a fresh envelope; the dispatcher sees the
    // sanitized argument tree, never the raw one.
    let sanitized = Envelope {
        payload: json!({
            "command": command.as_str(),
            "args": validator.sanitize(&request.args()),
        }),
        ..request.clone()
    };
    dispatcher.dispatch(&sanitized).await
}

// ── Broadcast loop ───────────────────────────────────────────────────────────

/// Fans queued events out to every tracked connection.
///
/// A connection whose outbound queue is closed or full is dropped from the
/// registry; delivery to the remaining connections continues regardless.
async fn broadcast_loop(
    mut event_rx: mpsc::Receiver<Envelope>,
    connections: ConnectionMap,
    cancel: CancellationToken,
) {
    info!("Broadcast loop started");

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = event_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let targets: Vec<(u64, String, mpsc::Sender<Envelope>)> = lock(&connections)
            .iter()
            .map(|(id, handle)| (*id, handle.peer.clone(), handle.outbound.clone()))
            .collect();

        for (conn_id, peer, outbound) in targets {
            if let Err(e) = outbound.try_send(event.clone()) {
                warn!("Dropping connection {peer}: event delivery failed ({e})");
                lock(&connections).remove(&conn_id);
            }
        }
    }

    info!("Broadcast loop stopped");
}

// ── Tests ────────────────────────────────────────────────────────────────────
