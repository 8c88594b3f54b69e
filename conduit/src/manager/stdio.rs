//! Process-transport adapter.
//!
//! One spawned child per connection. Line-delimited JSON on stdout carries
//! both correlated responses and unsolicited pushes; stderr is logged and
//! never parsed as protocol data.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::pending::PendingTable;
use super::{PushHandler, PushMessage};
use crate::error::McpError;
use crate::protocol::{classify, Inbound};

/// Termination signal delivered on close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Signal {
    /// Ask the process to exit (SIGTERM). The default.
    #[default]
    Terminate,
    /// Force-kill (SIGKILL).
    Kill,
}

pub(crate) type Writer = Box<dyn AsyncWrite + Send + Unpin>;
pub(crate) type WriterHandle = Arc<Mutex<Option<Writer>>>;

pub(crate) type StdioRegistry = Arc<Mutex<HashMap<String, StdioConnection>>>;

/// Live state for one process connection.
pub(crate) struct StdioConnection {
    writer: WriterHandle,
    pub(crate) pending: Arc<PendingTable>,
    child: Option<Child>,
    reader_task: JoinHandle<()>,
    stderr_task: Option<JoinHandle<()>>,
}

impl StdioConnection {
    pub(crate) fn writer_handle(&self) -> WriterHandle {
        self.writer.clone()
    }

    /// Tear the connection down after it has been removed from the registry.
    ///
    /// The writer is taken before pending requests are drained, so a call
    /// racing this shutdown either gets drained here or fails its write and
    /// cleans up after itself; it can never park forever.
    pub(crate) async fn shutdown(mut self, signal: Signal) {
        self.writer.lock().await.take();
        self.pending.drain(|| McpError::ConnectionClosed).await;
        self.reader_task.abort();
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        if let Some(mut child) = self.child.take() {
            deliver_signal(&mut child, signal);
        }
    }
}

/// Spawn a child process and wire it up as a connection.
///
/// No handshake: the connection is usable as soon as the handle exists.
pub(crate) fn spawn_connection(
    registry: &StdioRegistry,
    connection_id: String,
    mut command: Command,
    on_push: Option<PushHandler>,
) -> Result<StdioConnection, McpError> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| McpError::ConnectionError("child stdin not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| McpError::ConnectionError("child stdout not captured".to_string()))?;

    let stderr_task = child.stderr.take().map(|stderr| {
        let id = connection_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(connection_id = %id, "mcp stderr: {line}");
            }
        })
    });

    let mut conn = wire_connection(registry, connection_id, Box::new(stdin), stdout, on_push);
    conn.child = Some(child);
    conn.stderr_task = stderr_task;
    Ok(conn)
}

/// Wire a connection over arbitrary async pipes (no child process).
pub(crate) fn wire_connection<R>(
    registry: &StdioRegistry,
    connection_id: String,
    writer: Writer,
    reader: R,
    on_push: Option<PushHandler>,
) -> StdioConnection
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let pending = Arc::new(PendingTable::default());
    let reader_task = spawn_reader_task(
        registry.clone(),
        connection_id,
        pending.clone(),
        reader,
        on_push,
    );
    StdioConnection {
        writer: Arc::new(Mutex::new(Some(writer))),
        pending,
        child: None,
        reader_task,
        stderr_task: None,
    }
}

/// Serialize and write one newline-terminated message.
///
/// A `Value::String` payload is written verbatim. Returns false, without
/// writing, when the sink is gone or the write fails.
pub(crate) async fn write_line(writer: &WriterHandle, payload: &Value) -> bool {
    let mut guard = writer.lock().await;
    let Some(writer) = guard.as_mut() else {
        return false;
    };

    let line = match payload {
        Value::String(text) => text.clone(),
        other => match serde_json::to_string(other) {
            Ok(line) => line,
            Err(_) => return false,
        },
    };
    let mut bytes = line.into_bytes();
    bytes.push(b'\n');

    if writer.write_all(&bytes).await.is_err() {
        return false;
    }
    writer.flush().await.is_ok()
}

/// Read stdout line by line, dispatching responses to the pending table
/// and everything else to the push handler. Terminal events (EOF, read
/// error) reject all pending callers and dispose the connection.
fn spawn_reader_task<R>(
    registry: StdioRegistry,
    connection_id: String,
    pending: Arc<PendingTable>,
    reader: R,
    on_push: Option<PushHandler>,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let value: Value = match serde_json::from_str(&line) {
                        Ok(value) => value,
                        Err(err) => {
                            tracing::warn!(
                                connection_id = %connection_id,
                                "discarding unparseable line: {err}"
                            );
                            continue;
                        }
                    };
                    match classify(&value) {
                        Inbound::Response { id, reply } => match pending.remove(&id).await {
                            Some(tx) => {
                                let _ = tx.send(reply.into_result());
                            }
                            // Response for a request we are not waiting on:
                            // forward it instead of dropping it.
                            None => deliver_push(&on_push, &connection_id, value),
                        },
                        Inbound::Push => deliver_push(&on_push, &connection_id, value),
                    }
                }
                Ok(None) => {
                    tracing::info!(connection_id = %connection_id, "mcp process closed its output");
                    pending.drain(|| McpError::ConnectionClosed).await;
                    dispose(&registry, &connection_id).await;
                    return;
                }
                Err(err) => {
                    tracing::warn!(connection_id = %connection_id, "mcp process read failed: {err}");
                    let message = err.to_string();
                    pending
                        .drain(|| McpError::ConnectionError(message.clone()))
                        .await;
                    dispose(&registry, &connection_id).await;
                    return;
                }
            }
        }
    })
}

fn deliver_push(on_push: &Option<PushHandler>, connection_id: &str, value: Value) {
    match on_push {
        Some(handler) => handler(PushMessage::Json(value)),
        None => {
            tracing::debug!(connection_id = %connection_id, "dropping push message (no handler)")
        }
    }
}

/// Registry removal performed by the reader task for its own connection.
async fn dispose(registry: &StdioRegistry, connection_id: &str) {
    registry.lock().await.remove(connection_id);
}

#[cfg(unix)]
fn deliver_signal(child: &mut Child, signal: Signal) {
    let Some(pid) = child.id() else {
        return;
    };
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // Safety: signalling a child we spawned and still own.
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}

#[cfg(not(unix))]
fn deliver_signal(child: &mut Child, _signal: Signal) {
    let _ = child.start_kill();
}
