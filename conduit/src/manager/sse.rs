//! Stream-transport adapter (SSE).
//!
//! One persistent server-initiated event stream per connection, used only
//! for push delivery. RPC calls against a stream connection are a separate
//! POST exchange to the same endpoint and never touch this channel.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;

use super::{PushHandler, PushMessage};
use crate::error::McpError;
use crate::protocol::{ErrorInfo, Request};

pub(crate) type SseRegistry = Arc<Mutex<HashMap<String, SseConnection>>>;

/// Live state for one stream connection.
pub(crate) struct SseConnection {
    pub(crate) endpoint: String,
    pub(crate) pump_task: JoinHandle<()>,
}

impl SseConnection {
    pub(crate) fn shutdown(self) {
        self.pump_task.abort();
    }
}

fn media_type(content_type: &str) -> &str {
    content_type.trim().split(';').next().unwrap_or("").trim()
}

fn is_event_stream_content_type(content_type: &str) -> bool {
    media_type(content_type).eq_ignore_ascii_case("text/event-stream")
}

/// Establish the push stream. An error before readiness is returned to the
/// caller and nothing gets registered.
pub(crate) async fn probe(
    http: &reqwest::Client,
    endpoint: &str,
) -> Result<reqwest::Response, McpError> {
    let resp = http
        .get(endpoint)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
        .map_err(|err| McpError::Http(format!("SSE connect failed: {err}")))?;

    if !resp.status().is_success() {
        return Err(McpError::Http(format!(
            "SSE connect failed: status={}",
            resp.status()
        )));
    }

    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !is_event_stream_content_type(content_type) {
        return Err(McpError::Http(format!(
            "SSE connect failed: expected content-type text/event-stream, got {content_type}"
        )));
    }

    Ok(resp)
}

/// Pump events until the stream ends. Terminal events after readiness
/// dispose the connection; there is no pending state to reject.
pub(crate) fn spawn_pump_task(
    registry: SseRegistry,
    connection_id: String,
    resp: reqwest::Response,
    on_push: Option<PushHandler>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stream = resp.bytes_stream().map(|chunk| chunk.map_err(io::Error::other));
        let mut reader = BufReader::new(StreamReader::new(stream));
        match pump_events(&mut reader, &on_push).await {
            Ok(()) => {
                tracing::info!(connection_id = %connection_id, "SSE stream closed")
            }
            Err(err) => {
                tracing::warn!(connection_id = %connection_id, "SSE stream failed: {err}")
            }
        }
        registry.lock().await.remove(&connection_id);
    })
}

/// Parse SSE framing: `data:` lines accumulate, a blank line dispatches.
async fn pump_events<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    on_push: &Option<PushHandler>,
) -> Result<(), io::Error> {
    let mut data = String::new();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);

        if trimmed.is_empty() {
            if data.is_empty() {
                continue;
            }
            deliver(on_push, std::mem::take(&mut data));
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("data:") {
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest);
        }
    }
}

/// Deliver one event payload: parsed JSON when possible, raw text otherwise.
fn deliver(on_push: &Option<PushHandler>, payload: String) {
    let Some(handler) = on_push else {
        tracing::debug!("dropping SSE push message (no handler)");
        return;
    };
    match serde_json::from_str::<serde_json::Value>(&payload) {
        Ok(value) => handler(PushMessage::Json(value)),
        Err(_) => handler(PushMessage::Text(payload)),
    }
}

/// One correlated request/response exchange against the stream connection's
/// endpoint, independent of push delivery.
pub(crate) async fn exchange(
    http: &reqwest::Client,
    endpoint: &str,
    request: &Request,
) -> Result<serde_json::Value, McpError> {
    let resp = http
        .post(endpoint)
        .json(request)
        .send()
        .await
        .map_err(|err| McpError::Http(err.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(McpError::Http(format!("status {status}")));
    }

    let body: serde_json::Value = resp
        .json()
        .await
        .map_err(|err| McpError::Http(format!("invalid response body: {err}")))?;

    if let Some(err) = body.get("error") {
        return Err(ErrorInfo::from_value(err).into_error());
    }
    Ok(body
        .get("result")
        .cloned()
        .unwrap_or(serde_json::Value::Null))
}
