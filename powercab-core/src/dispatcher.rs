//! Per-connection read loop.
//!
//! One task per accepted socket. Frames are length-prefixed, so the loop
//! reads the two-byte length word, then the rest of the frame, decodes and
//! verifies it, and routes it through the handlers. A companion writer
//! task drains the connection's outbound channel so slow sockets never
//! block frame processing.
//!
//! Malformed traffic is counted against the connection's suspicious-packet
//! budget rather than killing the socket, with one exception: a length
//! word pointing past the frame-size cap leaves the stream unrecoverable,
//! so the connection closes immediately.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use powercab_proto::{CodecError, Command, Frame, MAX_FRAME_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::engine::Engine;
use crate::handlers::{self, HandlerOutcome};
use crate::session::StationConnection;

/// Outbound frames queued per connection before senders see backpressure.
const OUTBOUND_QUEUE: usize = 64;

enum ReadError {
    /// Peer closed the socket.
    Closed,
    Io(std::io::Error),
    /// Declared length exceeds the frame-size cap.
    Oversize(usize),
}

/// Drive one station socket until it closes.
///
/// Generic over the stream so tests can drive the full loop over an
/// in-memory duplex pipe.
pub async fn run_connection<S>(
    engine: Arc<Engine>,
    stream: S,
    socket_id: u64,
    remote_addr: SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
    let (shutdown_tx, _) = watch::channel(false);
    let conn = Arc::new(StationConnection::new(
        socket_id,
        remote_addr,
        out_tx,
        shutdown_tx,
    ));
    engine.registry().add(conn.clone());
    debug!(socket_id, remote = %remote_addr, "connection accepted");

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if let Err(e) = writer.write_all(&bytes).await {
                debug!(error = %e, "station socket write failed");
                break;
            }
        }
    });

    let mut closed = conn.closed_signal();
    loop {
        tokio::select! {
            _ = closed.changed() => break,
            read = tokio::time::timeout(
                engine.config().idle_timeout,
                read_frame(&mut reader),
            ) => match read {
                Err(_) => {
                    debug!(socket_id, "idle timeout, closing connection");
                    break;
                }
                Ok(Err(ReadError::Closed)) => break,
                Ok(Err(ReadError::Io(e))) => {
                    debug!(socket_id, error = %e, "station socket read failed");
                    break;
                }
                Ok(Err(ReadError::Oversize(declared))) => {
                    conn.record_suspicious();
                    warn!(
                        socket_id,
                        remote = %remote_addr,
                        declared,
                        "oversized frame, closing connection"
                    );
                    break;
                }
                Ok(Ok(buf)) => {
                    if !process_frame(&engine, &conn, &buf).await {
                        break;
                    }
                }
            },
        }
    }

    engine.drop_connection(socket_id).await;
    conn.close();
    writer_task.abort();
    debug!(socket_id, remote = %remote_addr, "connection task finished");
}

/// Read one length-prefixed frame, returning the full buffer including the
/// length word.
async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, ReadError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    map_eof(reader.read_exact(&mut len_buf).await)?;
    let declared = u16::from_be_bytes(len_buf) as usize;
    if 2 + declared > MAX_FRAME_SIZE {
        return Err(ReadError::Oversize(declared));
    }
    // Undersized lengths are read as declared and rejected by the decoder,
    // which keeps the stream aligned on frame boundaries.
    let mut buf = vec![0u8; 2 + declared];
    buf[..2].copy_from_slice(&len_buf);
    map_eof(reader.read_exact(&mut buf[2..]).await)?;
    Ok(buf)
}

fn map_eof<T>(result: std::io::Result<T>) -> Result<T, ReadError> {
    result.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ReadError::Closed
        } else {
            ReadError::Io(e)
        }
    })
}

/// Decode, verify and dispatch one frame. Returns `false` when the
/// connection must close.
async fn process_frame(engine: &Arc<Engine>, conn: &Arc<StationConnection>, buf: &[u8]) -> bool {
    let frame = match Frame::decode(buf) {
        Ok(frame) => frame,
        Err(e) => return suspect(engine, conn, e),
    };

    // Before login only 0x60 is accepted.
    if !conn.is_authenticated() && frame.command != Command::Login {
        return suspect(engine, conn, UnauthenticatedOpcode(frame.command));
    }
    // The login handler verifies the token itself once the station's key
    // is known; every later frame is checked here.
    if let Some(secret) = conn.secret_key() {
        if !frame.verify_token(&secret) {
            return suspect(engine, conn, CodecError::BadToken);
        }
    }

    match handlers::dispatch(engine, conn, &frame).await {
        Ok(HandlerOutcome::Reply(command, payload)) => {
            conn.record_valid();
            match conn.secret_key() {
                Some(secret) => {
                    let bytes = Frame::encode(command, frame.vsn, &payload, &secret);
                    conn.send(bytes).await.is_ok()
                }
                // Closed or never authenticated under us; nothing to sign
                // the reply with.
                None => false,
            }
        }
        Ok(HandlerOutcome::None) => {
            conn.record_valid();
            true
        }
        Ok(HandlerOutcome::Drop) => false,
        Ok(HandlerOutcome::Suspicious(e)) => suspect(engine, conn, e),
        Err(e) => {
            // Lenient by design: the operation failed but the connection
            // stays usable for the station's next attempt.
            error!(
                socket_id = conn.socket_id,
                command = %frame.command,
                error = %e,
                "handler error"
            );
            true
        }
    }
}

struct UnauthenticatedOpcode(Command);

impl fmt::Display for UnauthenticatedOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "opcode {} before login", self.0)
    }
}

/// Count a suspicious packet; returns `false` once the connection is over
/// budget and must close.
fn suspect(engine: &Engine, conn: &StationConnection, reason: impl fmt::Display) -> bool {
    warn!(
        socket_id = conn.socket_id,
        remote = %conn.remote_addr,
        %reason,
        "suspicious packet"
    );
    !engine.registry().record_suspicious(conn)
}
