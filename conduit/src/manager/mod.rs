//! Connection registry and RPC facade.
//!
//! A `Manager` owns every transport handle and all correlation state;
//! callers only ever hold opaque connection ids. Stream (SSE) and process
//! connections live in separate keyed maps, and an id appears in exactly
//! one of the two. Independent managers can coexist.

mod pending;
pub(crate) mod sse;
pub(crate) mod stdio;

pub use stdio::Signal;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::config::McpServerConfig;
use crate::error::McpError;
use crate::protocol::Request;

/// An inbound message with no matching pending request.
#[derive(Debug, Clone)]
pub enum PushMessage {
    /// Payload parsed as JSON.
    Json(Value),
    /// Raw text that failed to parse (stream transport only).
    Text(String),
}

/// Per-connection handler for unsolicited messages. Fire and forget;
/// never shares a code path with request correlation.
pub type PushHandler = Arc<dyn Fn(PushMessage) + Send + Sync>;

/// Multi-transport MCP connection manager.
pub struct Manager {
    sse: sse::SseRegistry,
    stdio: stdio::StdioRegistry,
    http: reqwest::Client,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self {
            sse: Arc::new(Mutex::new(HashMap::new())),
            stdio: Arc::new(Mutex::new(HashMap::new())),
            http: reqwest::Client::new(),
        }
    }

    /// Fresh random id: connection ids never repeat, correlation ids never
    /// collide with a concurrently outstanding request.
    fn fresh_id() -> String {
        Uuid::new_v4().to_string()
    }

    // =========================================================================
    // Opening connections
    // =========================================================================

    /// Open a stream connection. Resolves once the remote reports readiness;
    /// a pre-ready failure registers nothing.
    pub async fn open_sse(
        &self,
        url: &str,
        on_push: Option<PushHandler>,
    ) -> Result<String, McpError> {
        let resp = sse::probe(&self.http, url).await?;
        let connection_id = Self::fresh_id();

        // Insert under the registry lock so the pump task cannot observe
        // termination and attempt disposal before the id is registered.
        let mut connections = self.sse.lock().await;
        let pump_task =
            sse::spawn_pump_task(self.sse.clone(), connection_id.clone(), resp, on_push);
        connections.insert(
            connection_id.clone(),
            sse::SseConnection {
                endpoint: url.to_string(),
                pump_task,
            },
        );
        drop(connections);

        tracing::info!(connection_id = %connection_id, url, "opened SSE connection");
        Ok(connection_id)
    }

    /// Open a process connection by spawning `command args...`.
    pub async fn open_stdio(
        &self,
        command: &str,
        args: &[String],
        on_push: Option<PushHandler>,
    ) -> Result<String, McpError> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        self.open_stdio_command(cmd, on_push).await
    }

    /// Open a process connection from a pre-built command (env, cwd, ...).
    pub async fn open_stdio_command(
        &self,
        command: Command,
        on_push: Option<PushHandler>,
    ) -> Result<String, McpError> {
        let connection_id = Self::fresh_id();

        let mut connections = self.stdio.lock().await;
        let conn = stdio::spawn_connection(&self.stdio, connection_id.clone(), command, on_push)?;
        connections.insert(connection_id.clone(), conn);
        drop(connections);

        tracing::info!(connection_id = %connection_id, "opened stdio connection");
        Ok(connection_id)
    }

    /// Wire a process-kind connection over arbitrary async pipes instead of
    /// a spawned child. Used by in-memory tests and embedders.
    pub async fn open_stdio_io<R, W>(
        &self,
        reader: R,
        writer: W,
        on_push: Option<PushHandler>,
    ) -> String
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let connection_id = Self::fresh_id();

        let mut connections = self.stdio.lock().await;
        let conn = stdio::wire_connection(
            &self.stdio,
            connection_id.clone(),
            Box::new(writer),
            reader,
            on_push,
        );
        connections.insert(connection_id.clone(), conn);
        drop(connections);

        connection_id
    }

    /// Open whichever transport a config entry describes. Env values are
    /// expanded the same way configured servers expect elsewhere.
    pub async fn open_from_config(
        &self,
        config: &McpServerConfig,
        on_push: Option<PushHandler>,
    ) -> Result<String, McpError> {
        match config {
            McpServerConfig::Stream { url } => self.open_sse(url, on_push).await,
            McpServerConfig::Process { command, args, env } => {
                let mut cmd = Command::new(command);
                cmd.args(args);
                for (key, value) in env {
                    let expanded =
                        shellexpand::env(value).unwrap_or_else(|_| value.clone().into());
                    cmd.env(key, expanded.as_ref());
                }
                self.open_stdio_command(cmd, on_push).await
            }
        }
    }

    // =========================================================================
    // RPC facade
    // =========================================================================

    /// List the tools a connection's server exposes. Returns the raw
    /// `result` field of the response.
    pub async fn list_tools(&self, connection_id: &str) -> Result<Value, McpError> {
        self.request(connection_id, Request::list_tools(Self::fresh_id()))
            .await
    }

    /// Call a tool on a connection's server. Returns the raw `result` field.
    pub async fn call_tool(
        &self,
        connection_id: &str,
        tool_name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, McpError> {
        self.request(
            connection_id,
            Request::call_tool(Self::fresh_id(), tool_name, arguments),
        )
        .await
    }

    /// Dispatch one request over whichever transport the connection uses.
    /// Stream connections are probed first, then process connections.
    async fn request(&self, connection_id: &str, request: Request) -> Result<Value, McpError> {
        let endpoint = {
            let connections = self.sse.lock().await;
            connections
                .get(connection_id)
                .map(|conn| conn.endpoint.clone())
        };
        if let Some(endpoint) = endpoint {
            return sse::exchange(&self.http, &endpoint, &request).await;
        }

        let (pending, writer) = {
            let connections = self.stdio.lock().await;
            match connections.get(connection_id) {
                Some(conn) => (conn.pending.clone(), conn.writer_handle()),
                None => return Err(McpError::NoConnection(connection_id.to_string())),
            }
        };

        let (tx, rx) = oneshot::channel();
        pending.insert(request.id.clone(), tx).await?;

        let payload = serde_json::to_value(&request)?;
        if !stdio::write_line(&writer, &payload).await {
            pending.remove(&request.id).await;
            return Err(McpError::SendFailed(connection_id.to_string()));
        }

        // Parked until the reader task settles or drains this entry. No
        // timeout at this layer: closing the connection is the only way out.
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(McpError::ConnectionClosed),
        }
    }

    /// Write one raw payload to a process connection's input. A
    /// `Value::String` goes out verbatim; anything else is serialized.
    /// Returns false without writing when the id is unknown or the input
    /// channel is gone.
    pub async fn send(&self, connection_id: &str, payload: &Value) -> bool {
        let writer = {
            let connections = self.stdio.lock().await;
            match connections.get(connection_id) {
                Some(conn) => conn.writer_handle(),
                None => return false,
            }
        };
        stdio::write_line(&writer, payload).await
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Close a stream connection. False when the id is unknown.
    pub async fn close_sse(&self, connection_id: &str) -> bool {
        let conn = self.sse.lock().await.remove(connection_id);
        match conn {
            Some(conn) => {
                conn.shutdown();
                tracing::info!(connection_id = %connection_id, "closed SSE connection");
                true
            }
            None => false,
        }
    }

    /// Close a process connection with the default termination signal.
    pub async fn close_stdio(&self, connection_id: &str) -> bool {
        self.close_stdio_with_signal(connection_id, Signal::default())
            .await
    }

    /// Close a process connection: rejects every pending request with a
    /// closed-before-response error, then signals the child. False when the
    /// id is unknown.
    pub async fn close_stdio_with_signal(&self, connection_id: &str, signal: Signal) -> bool {
        let conn = self.stdio.lock().await.remove(connection_id);
        match conn {
            Some(conn) => {
                conn.shutdown(signal).await;
                tracing::info!(connection_id = %connection_id, ?signal, "closed stdio connection");
                true
            }
            None => false,
        }
    }

    /// Snapshot of currently registered stream connection ids.
    pub async fn active_sse_ids(&self) -> Vec<String> {
        self.sse.lock().await.keys().cloned().collect()
    }

    /// Snapshot of currently registered process connection ids.
    pub async fn active_stdio_ids(&self) -> Vec<String> {
        self.stdio.lock().await.keys().cloned().collect()
    }

    /// Close every connection of both kinds. No-op when nothing is open.
    pub async fn close_all(&self) {
        for id in self.active_sse_ids().await {
            self.close_sse(&id).await;
        }
        for id in self.active_stdio_ids().await {
            self.close_stdio(&id).await;
        }
    }
}
