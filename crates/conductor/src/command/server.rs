//! Command surface transport: newline-delimited JSON requests over a Unix
//! domain socket, one connection per call (§4.3).

use serde::Deserialize;
use serde_json::{json, Value};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use super::dispatch;
use crate::context::AppContext;
use crate::error::{Error, Result};

/// Requests larger than this are rejected before they are fully read, so a
/// misbehaving client can't exhaust memory one socket write at a time.
const MAX_REQUEST_BYTES: usize = 1_048_576;

#[derive(Debug, Deserialize)]
struct Envelope {
    command: String,
    #[serde(default)]
    args: Value,
}

/// Bind the socket at `path`, removing a stale file left by an unclean
/// shutdown first, and set `0600` permissions before accepting connections.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

/// Accept loop: serve connections until `shutdown` fires, then stop taking
/// new ones (in-flight connections are allowed to finish).
pub async fn run(
    listener: UnixListener,
    ctx: AppContext,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let ctx = ctx.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, ctx, shutdown).await {
                                warn!(error = %e, "command connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to accept command connection"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("command surface shutting down");
                    return;
                }
            }
        }
    }
}

async fn serve_connection(
    stream: UnixStream,
    ctx: AppContext,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let mut line = Vec::new();
        let read = read_bounded_line(&mut reader, &mut line).await?;
        if read == 0 {
            return Ok(());
        }

        let response = match serde_json::from_slice::<Envelope>(&line) {
            Ok(envelope) => match dispatch(&ctx, &envelope.command, envelope.args, &mut shutdown).await {
                Ok(value) => merge_ok(value),
                Err(e) => error_envelope(&e),
            },
            Err(e) => json!({"error": format!("malformed request: {e}")}),
        };

        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        write_half.write_all(&out).await?;
    }
}

/// Read one newline-terminated request, rejecting anything over
/// [`MAX_REQUEST_BYTES`] rather than buffering it fully.
async fn read_bounded_line<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> Result<usize> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(buf.len());
        }
        if let Some(pos) = available.iter().position(|&b| b == b'\n') {
            buf.extend_from_slice(&available[..pos]);
            reader.consume(pos + 1);
            if buf.len() > MAX_REQUEST_BYTES {
                return Err(Error::config("request exceeds 1 MiB limit"));
            }
            return Ok(buf.len() + 1);
        }
        let chunk_len = available.len();
        if buf.len() + chunk_len > MAX_REQUEST_BYTES {
            reader.consume(chunk_len);
            return Err(Error::config("request exceeds 1 MiB limit"));
        }
        buf.extend_from_slice(available);
        reader.consume(chunk_len);
    }
}

/// Success envelope: `{"ok":true, ...fields}`.
fn merge_ok(mut value: Value) -> Value {
    if let Value::Object(map) = &mut value {
        map.insert("ok".to_string(), Value::Bool(true));
        value
    } else {
        json!({"ok": true, "result": value})
    }
}

/// Error envelope. `ConflictingState` gets the richer `{"ok":false,...}`
/// shape the allocator/merger retry paths key off of; everything else is a
/// bare `{"error":...}` (§7 error taxonomy).
fn error_envelope(err: &Error) -> Value {
    if let Error::Core(core) = err {
        if core.is_conflicting_state() {
            return json!({"ok": false, "error": core.to_string()});
        }
    }
    json!({"error": err.to_string()})
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::broadcast::NullBroadcast;
    use crate::supervisor::NullSupervisor;
    use conductor_core::Config;
    use serial_test::serial;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    async fn context() -> AppContext {
        let store = crate::store::Store::open_in_memory().await.expect("open");
        AppContext::new(
            store,
            Config { project_dir: "/tmp".to_string(), ..Config::default() },
            Arc::new(NullSupervisor::new()),
            Arc::new(NullBroadcast),
        )
    }

    /// Binds a real socket and exercises the newline-delimited protocol
    /// end to end. `#[serial]` because every case in this module binds a
    /// socket path and accept loops on a shared-fate Tokio runtime.
    #[tokio::test]
    #[serial]
    async fn ping_round_trips_over_the_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("conductor.sock");
        let listener = bind(&socket_path).expect("bind");
        let ctx = context().await;
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let server = tokio::spawn(run(listener, ctx, shutdown_rx));

        let mut stream = UnixStream::connect(&socket_path).await.expect("connect");
        stream.write_all(b"{\"command\":\"ping\",\"args\":{}}\n").await.expect("write");

        let mut reader = BufReader::new(&mut stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("read");
        let response: Value = serde_json::from_str(line.trim()).expect("parse");
        assert_eq!(response["ok"], Value::Bool(true));

        let _ = shutdown_tx.send(true);
        drop(stream);
        server.await.expect("server task");
    }

    /// §4.3/spec.md's boundary case: a request over 1 MiB closes the
    /// connection without ever reaching the dispatcher.
    #[tokio::test]
    #[serial]
    async fn oversized_request_closes_connection_without_response() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("conductor.sock");
        let listener = bind(&socket_path).expect("bind");
        let ctx = context().await;
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let server = tokio::spawn(run(listener, ctx, shutdown_rx));

        let mut stream = UnixStream::connect(&socket_path).await.expect("connect");
        let oversized_args = "x".repeat(MAX_REQUEST_BYTES + 1);
        let payload = format!("{{\"command\":\"ping\",\"args\":\"{oversized_args}\"}}\n");
        stream.write_all(payload.as_bytes()).await.expect("write");

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.expect("read to eof");
        assert!(buf.is_empty(), "server must close without writing a response line");

        let _ = shutdown_tx.send(true);
        server.await.expect("server task");
    }
}
