//! Unix domain socket setup for the engine and UI sides.
//!
//! Trust between the two processes is established entirely by filesystem
//! permissions: the socket directory is created mode 0700 and the socket
//! file is chmodded to 0600 before any client can race a connection in.
//! There are no credentials inside the protocol itself.

use crate::error::TransportError;
use std::path::Path;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

/// Default socket path for the engine.
pub const DEFAULT_SOCKET_PATH: &str = "/run/omnis/ipc.sock";

/// Default timeout applied when connecting to the engine socket. Distinct
/// from the steady-state receive timeout, which callers choose per read.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Create the listening socket for the privileged side.
///
/// Ensures the parent directory exists with owner-only permissions, removes
/// a stale socket file left by a previous crash, binds, and tightens the
/// socket file itself to owner-only before returning.
pub fn bind_server_socket(path: &Path) -> Result<UnixListener, TransportError> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
    }

    if path.exists() {
        warn!("Removing stale socket file: {}", path.display());
        std::fs::remove_file(path)?;
    }

    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    debug!("Bound socket at {}", path.display());
    Ok(listener)
}

/// Connect to the engine socket with a bounded wait.
///
/// Fails distinctly for a missing socket path, a refused connection (socket
/// file present but nobody accepting), a timeout, and any other I/O error.
pub async fn connect_with_timeout(
    path: &Path,
    timeout: Duration,
) -> Result<UnixStream, TransportError> {
    if !path.exists() {
        return Err(TransportError::SocketNotFound(path.to_path_buf()));
    }

    match tokio::time::timeout(timeout, UnixStream::connect(path)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            Err(TransportError::ConnectionRefused(path.to_path_buf()))
        }
        Ok(Err(e)) => Err(TransportError::Io(e)),
        Err(_) => Err(TransportError::Timeout),
    }
}

/// Remove the socket file on the listening side. Idempotent.
pub fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed socket file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove socket file {}: {e}", path.display()),
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
