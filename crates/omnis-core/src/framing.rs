//! Length-prefixed framing of envelopes on a byte stream.
//!
//! Wire format: a 4-byte unsigned big-endian length, then exactly that many
//! bytes of JSON-encoded envelope. The 10 MiB ceiling is enforced on both
//! sides before any body bytes are buffered, so a hostile peer cannot make
//! the privileged process allocate an arbitrary amount of memory.

use crate::error::TransportError;
use crate::message::Envelope;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum encoded envelope size: 10 MiB.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Encode and write one envelope as a single frame.
///
/// The size ceiling is checked before any bytes hit the stream; on success
/// the frame has been written and flushed in full. A partial write surfaces
/// as the underlying I/O error, never as success.
pub async fn send_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let body = envelope.encode().map_err(TransportError::Protocol)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge {
            size: body.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let len = (body.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and decode it.
///
/// Returns `Ok(None)` only when the peer closed cleanly at a frame boundary
/// (zero bytes consumed). EOF anywhere inside a frame is
/// [`TransportError::ConnectionLost`]. A declared length of zero or above
/// the ceiling is rejected before the body is read.
pub async fn recv_envelope<R>(reader: &mut R) -> Result<Option<Envelope>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(TransportError::ConnectionLost);
        }
        filled += n;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len == 0 {
        return Err(TransportError::EmptyFrame);
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TransportError::ConnectionLost
        } else {
            TransportError::Io(e)
        }
    })?;

    let envelope = Envelope::decode(&body).map_err(TransportError::Protocol)?;
    Ok(Some(envelope))
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use serde_json::json;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let env = Envelope::request(Command::Ping, json!({ "echo": "hello" }));

        send_envelope(&mut client, &env).await.unwrap();
        let back = recv_envelope(&mut server).await.unwrap().unwrap();
        assert_eq!(back, env);
    }

    #[tokio::test]
    async fn test_multiple_frames_in_sequence() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let first = Envelope::request(Command::Ping, json!({ "n": 1 }));
        let second = Envelope::request(Command::GetStatus, json!({}));

        send_envelope(&mut client, &first).await.unwrap();
        send_envelope(&mut client, &second).await.unwrap();

        assert_eq!(recv_envelope(&mut server).await.unwrap().unwrap(), first);
        assert_eq!(recv_envelope(&mut server).await.unwrap().unwrap(), second);
    }

    #[tokio::test]
    async fn test_clean_close_yields_none() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);
        assert!(recv_envelope(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_mid_prefix_is_connection_lost() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[0, 0]).await.unwrap();
        drop(client);
        let err = recv_envelope(&mut server).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionLost));
    }

    #[tokio::test]
    async fn test_close_mid_body_is_connection_lost() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        // Declare 100 bytes, deliver 3.
        client.write_all(&100u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);
        let err = recv_envelope(&mut server).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionLost));
    }

    #[tokio::test]
    async fn test_oversized_declared_length_rejected_before_body() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let declared = (MAX_MESSAGE_SIZE + 1) as u32;
        client.write_all(&declared.to_be_bytes()).await.unwrap();
        let err = recv_envelope(&mut server).await.unwrap_err();
        match err {
            TransportError::MessageTooLarge { size, max } => {
                assert_eq!(size, MAX_MESSAGE_SIZE + 1);
                assert_eq!(max, MAX_MESSAGE_SIZE);
            }
            other => panic!("expected MessageTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_length_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&0u32.to_be_bytes()).await.unwrap();
        let err = recv_envelope(&mut server).await.unwrap_err();
        assert!(matches!(err, TransportError::EmptyFrame));
    }

    #[tokio::test]
    async fn test_oversized_send_rejected_without_writing() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let huge = "x".repeat(MAX_MESSAGE_SIZE);
        let env = Envelope::request(Command::ValidateConfig, json!({ "blob": huge }));
        let err = send_envelope(&mut client, &env).await.unwrap_err();
        assert!(matches!(err, TransportError::MessageTooLarge { .. }));

        // Nothing was written: the reader still sees a clean close.
        drop(client);
        assert!(recv_envelope(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let garbage = b"this is not json";
        client
            .write_all(&(garbage.len() as u32).to_be_bytes())
            .await
            .unwrap();
        client.write_all(garbage).await.unwrap();
        let err = recv_envelope(&mut server).await.unwrap_err();
        assert!(err.is_recoverable());

        // The stream stays framed: a valid envelope after the bad frame
        // still parses.
        let env = Envelope::request(Command::Ping, json!({}));
        send_envelope(&mut client, &env).await.unwrap();
        assert_eq!(recv_envelope(&mut server).await.unwrap().unwrap(), env);
    }
}
