//! Error types for the connection manager.

use serde_json::Value;

/// Errors surfaced by the connection manager and its RPC facade.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// No connection is registered under the given id.
    #[error("no connection found: {0}")]
    NoConnection(String),

    /// The stream-transport HTTP exchange failed at the transport level.
    #[error("HTTP error from MCP server: {0}")]
    Http(String),

    /// The remote answered with an error envelope.
    #[error("MCP error: {message}")]
    Rpc {
        message: String,
        data: Option<Value>,
    },

    /// Writing a request to a connection's input channel failed.
    #[error("failed to send request to connection {0}")]
    SendFailed(String),

    /// The transport failed abruptly while requests were in flight.
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// The connection closed before a response arrived.
    #[error("connection closed before response")]
    ConnectionClosed,

    /// A request id was reused while still pending on the same connection.
    #[error("request id already pending: {0}")]
    DuplicateRequestId(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
