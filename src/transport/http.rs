//! HTTP protocol client for Streamable HTTP MCP endpoints.
//!
//! Each JSON-RPC message is POSTed to the base URL. Replies arrive either as
//! a plain JSON body or as an SSE stream whose `data:` payloads carry
//! JSON-RPC messages. A single failure ends the probe; nothing is retried.

use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;

use crate::model::ToolDescriptor;
use crate::transport::{
    JsonRpcNotification, JsonRpcRequest, METHOD_INITIALIZE, METHOD_INITIALIZED,
    METHOD_TOOLS_LIST, ProtocolError, ToolListing, initialize_params, list_params,
    match_response, parse_tools_page,
};

/// Session header assigned by the server on `initialize`.
pub const SESSION_HEADER: &str = "mcp-session-id";

const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// Probes a Streamable HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    handshake: bool,
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            handshake: true,
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            handshake: true,
        }
    }

    /// Skip `initialize` and go straight to `tools/list`.
    pub fn without_handshake(mut self) -> Self {
        self.handshake = false;
        self
    }

    /// Run the discovery exchange against `base_url`, all within `timeout`.
    pub async fn probe(
        &self,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Vec<ToolDescriptor>, ProtocolError> {
        match tokio::time::timeout(timeout, self.exchange(base_url)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout {
                operation: format!("HTTP exchange with {base_url}"),
                after_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn exchange(&self, base_url: &str) -> Result<Vec<ToolDescriptor>, ProtocolError> {
        let mut session = Session {
            id: None,
            next_request: 1,
        };

        if self.handshake {
            self.request(base_url, &mut session, METHOD_INITIALIZE, Some(initialize_params()))
                .await?;
            self.notify(base_url, &session, METHOD_INITIALIZED).await?;
        }

        let mut listing = ToolListing::default();
        let mut cursor: Option<String> = None;
        loop {
            let result = self
                .request(
                    base_url,
                    &mut session,
                    METHOD_TOOLS_LIST,
                    list_params(cursor.as_deref()),
                )
                .await?;
            match listing.push(parse_tools_page(result)?)? {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(listing.finish())
    }

    async fn post<T: Serialize>(
        &self,
        base_url: &str,
        session: &Session,
        body: &T,
    ) -> Result<reqwest::Response, ProtocolError> {
        let mut request = self
            .client
            .post(base_url)
            .header(ACCEPT, ACCEPT_BOTH)
            .json(body);
        if let Some(id) = &session.id {
            request = request.header(SESSION_HEADER, id);
        }
        let response = request.send().await.map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProtocolError::ServerError {
                code: i64::from(status.as_u16()),
                message: if text.trim().is_empty() {
                    status.to_string()
                } else {
                    format!("{status}: {}", text.trim())
                },
            });
        }
        Ok(response)
    }

    async fn request(
        &self,
        base_url: &str,
        session: &mut Session,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ProtocolError> {
        let id = session.next_request;
        session.next_request += 1;
        let mut response = self
            .post(base_url, session, &JsonRpcRequest::new(id, method, params))
            .await?;

        if let Some(assigned) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            session.id = Some(assigned.to_string());
        }

        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if !is_sse {
            let body = response.bytes().await.map_err(classify_reqwest_error)?;
            let message: Value = serde_json::from_slice(&body)
                .map_err(|e| ProtocolError::malformed(format!("{method} reply is not JSON: {e}")))?;
            return match_response(message, id)?.ok_or_else(|| {
                ProtocolError::malformed(format!("{method} reply carried no response"))
            });
        }

        // Read the stream until our response arrives; servers may keep it open
        let mut decoder = SseDecoder::default();
        while let Some(chunk) = response.chunk().await.map_err(classify_reqwest_error)? {
            for data in decoder.push(&chunk) {
                if let Some(result) = sse_message(&data, id)? {
                    return Ok(result);
                }
            }
        }
        for data in decoder.finish() {
            if let Some(result) = sse_message(&data, id)? {
                return Ok(result);
            }
        }
        Err(ProtocolError::malformed(format!(
            "{method} event stream ended without a response"
        )))
    }

    async fn notify(
        &self,
        base_url: &str,
        session: &Session,
        method: &str,
    ) -> Result<(), ProtocolError> {
        self.post(base_url, session, &JsonRpcNotification::new(method))
            .await
            .map(|_| ())
    }
}

struct Session {
    id: Option<String>,
    next_request: u64,
}

fn sse_message(data: &str, id: u64) -> Result<Option<Value>, ProtocolError> {
    if data.trim().is_empty() {
        return Ok(None);
    }
    let message: Value = serde_json::from_str(data)
        .map_err(|e| ProtocolError::malformed(format!("SSE data is not JSON: {e}")))?;
    match_response(message, id)
}

fn classify_reqwest_error(error: reqwest::Error) -> ProtocolError {
    if error.is_timeout() {
        ProtocolError::Timeout {
            operation: "HTTP request".to_string(),
            after_ms: 0,
        }
    } else if error.is_decode() || error.is_body() {
        ProtocolError::malformed(error.to_string())
    } else {
        ProtocolError::ConnectionRefused(error.to_string())
    }
}

/// Incremental `text/event-stream` decoder yielding each event's data.
///
/// Bytes are buffered until a line is complete, so a UTF-8 sequence split
/// across network chunks decodes intact.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed a chunk; returns the data of every event it completed.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
            // event:, id:, retry: and comments carry nothing we need
        }
        events
    }

    /// Flush a final event not followed by a blank line.
    fn finish(mut self) -> Vec<String> {
        let mut events = self.push(b"\n");
        if !self.data.is_empty() {
            events.push(self.data.join("\n"));
        }
        events
    }
}
