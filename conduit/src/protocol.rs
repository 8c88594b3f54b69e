//! Wire envelope types shared by both transports.
//!
//! Inbound messages are classified exactly once, at the parse boundary,
//! into either a correlated response or an unsolicited push. Downstream
//! code never re-inspects `result`/`error` fields ad hoc.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::McpError;

/// Methods understood by the servers this manager talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "listTools")]
    ListTools,
    #[serde(rename = "callTool")]
    CallTool,
}

/// Request envelope written to a connection.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub id: String,
    pub method: Method,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<RequestParams>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestParams {
    #[serde(rename = "toolName")]
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl Request {
    pub fn list_tools(id: String) -> Self {
        Self {
            id,
            method: Method::ListTools,
            params: None,
        }
    }

    pub fn call_tool(id: String, tool_name: &str, arguments: Option<Value>) -> Self {
        Self {
            id,
            method: Method::CallTool,
            params: Some(RequestParams {
                tool_name: tool_name.to_string(),
                arguments,
            }),
        }
    }
}

/// Error payload carried by a response envelope: `{ "message": ..., ... }`.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ErrorInfo {
    /// Best-effort parse; a malformed error field still yields a message.
    pub(crate) fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|_| Self {
            message: value.to_string(),
            extra: serde_json::Map::new(),
        })
    }

    pub(crate) fn into_error(self) -> McpError {
        let data = if self.extra.is_empty() {
            None
        } else {
            Some(Value::Object(self.extra))
        };
        McpError::Rpc {
            message: self.message,
            data,
        }
    }
}

/// A correlated reply, decided once: result or error.
#[derive(Debug, Clone)]
pub enum Reply {
    Result(Value),
    Error(ErrorInfo),
}

impl Reply {
    pub(crate) fn into_result(self) -> Result<Value, McpError> {
        match self {
            Reply::Result(value) => Ok(value),
            Reply::Error(info) => Err(info.into_error()),
        }
    }
}

/// Classification of an inbound message.
#[derive(Debug)]
pub enum Inbound {
    /// Carries a string `id` and a `result` or `error` field.
    Response { id: String, reply: Reply },
    /// Everything else: notifications, server-initiated requests,
    /// responses without a usable id. The caller still owns the value.
    Push,
}

/// Classify a parsed inbound value.
///
/// Messages carrying a `method` field are requests/notifications from the
/// server, never replies, even when they also carry an id.
pub fn classify(value: &Value) -> Inbound {
    if value.get("method").is_none() {
        if let Some(id) = value.get("id").and_then(Value::as_str) {
            if let Some(err) = value.get("error") {
                return Inbound::Response {
                    id: id.to_string(),
                    reply: Reply::Error(ErrorInfo::from_value(err)),
                };
            }
            if let Some(result) = value.get("result") {
                return Inbound::Response {
                    id: id.to_string(),
                    reply: Reply::Result(result.clone()),
                };
            }
        }
    }
    Inbound::Push
}
