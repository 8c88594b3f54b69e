//! Multi-transport MCP connection manager.
//!
//! Opens, tracks, and tears down connections to MCP servers over two
//! transports - a persistent SSE push stream and a spawned child process -
//! correlating request/response pairs and cascading transport failures to
//! in-flight callers.

pub mod config;
pub mod error;
pub mod manager;
pub mod protocol;

pub use error::McpError;
pub use manager::{Manager, PushHandler, PushMessage, Signal};
