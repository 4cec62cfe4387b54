//! Protocol transport clients for tool discovery.
//!
//! Both clients perform the same logical exchange: `initialize`, the
//! `notifications/initialized` notification, then `tools/list` until the
//! server stops returning a `nextCursor`.
//!
//! - `stdio`: newline-delimited JSON-RPC over a process's standard streams
//! - `http`: JSON-RPC POSTs against a Streamable HTTP endpoint

pub mod http;
pub mod stdio;

use std::collections::HashSet;

use rmcp::model::{ClientCapabilities, ClientInfo, Implementation, ProtocolVersion};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::error::FailureKind;
use crate::model::ToolDescriptor;

pub(crate) const JSONRPC_VERSION: &str = "2.0";
pub(crate) const METHOD_INITIALIZE: &str = "initialize";
pub(crate) const METHOD_INITIALIZED: &str = "notifications/initialized";
pub(crate) const METHOD_TOOLS_LIST: &str = "tools/list";

/// A failed protocol exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("response id {got} does not match request id {expected}")]
    Desync { expected: u64, got: String },

    #[error("server process exited{}", exit_suffix(.exit_code))]
    ProcessExited { exit_code: Option<i32> },

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("server error {code}: {message}")]
    ServerError { code: i64, message: String },
}

fn exit_suffix(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!(" with code {code}"),
        None => String::new(),
    }
}

impl ProtocolError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ProtocolError::Timeout { .. } => FailureKind::Timeout,
            ProtocolError::MalformedResponse(_) => FailureKind::MalformedResponse,
            ProtocolError::Desync { .. } => FailureKind::Desync,
            ProtocolError::ProcessExited { exit_code } => FailureKind::ProcessExited {
                exit_code: *exit_code,
            },
            ProtocolError::ConnectionRefused(_) => FailureKind::ConnectionRefused,
            ProtocolError::ServerError { .. } => FailureKind::ServerError,
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        ProtocolError::MalformedResponse(message.into())
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonRpcNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
}

impl<'a> JsonRpcNotification<'a> {
    pub fn new(method: &'a str) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
        }
    }
}

/// `initialize` params announcing this client.
pub(crate) fn initialize_params() -> Value {
    let info = ClientInfo {
        meta: None,
        protocol_version: ProtocolVersion::V_2025_06_18,
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "prospector".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            title: None,
            icons: None,
            website_url: None,
        },
    };
    serde_json::to_value(info).unwrap_or_else(|_| Value::Object(Default::default()))
}

/// `tools/list` params for the given page.
pub(crate) fn list_params(cursor: Option<&str>) -> Option<Value> {
    cursor.map(|c| serde_json::json!({ "cursor": c }))
}

/// Match an incoming message against the outstanding request `expected`.
///
/// Returns `Ok(None)` for messages to skip: server notifications and
/// server-initiated requests.
pub(crate) fn match_response(
    message: Value,
    expected: u64,
) -> Result<Option<Value>, ProtocolError> {
    let Value::Object(mut message) = message else {
        return Err(ProtocolError::malformed("message is not a JSON object"));
    };
    if message.contains_key("method") {
        return Ok(None);
    }

    let id = message
        .remove("id")
        .ok_or_else(|| ProtocolError::malformed("response without id"))?;
    let error = message.remove("error");

    // Parse errors carry a null id; report the error itself
    let id_matches = id.as_u64() == Some(expected);
    if !id_matches && !(id.is_null() && error.is_some()) {
        return Err(ProtocolError::Desync {
            expected,
            got: id.to_string(),
        });
    }

    if let Some(error) = error {
        return Err(ProtocolError::ServerError {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }

    message
        .remove("result")
        .map(Some)
        .ok_or_else(|| ProtocolError::malformed("response has neither result nor error"))
}

/// One page of a `tools/list` result.
#[derive(Debug)]
pub(crate) struct ToolsPage {
    pub tools: Vec<ToolDescriptor>,
    pub next_cursor: Option<String>,
}

pub(crate) fn parse_tools_page(result: Value) -> Result<ToolsPage, ProtocolError> {
    let Value::Object(mut result) = result else {
        return Err(ProtocolError::malformed("tools/list result is not an object"));
    };
    let raw_tools = match result.remove("tools") {
        Some(Value::Array(tools)) => tools,
        Some(_) => return Err(ProtocolError::malformed("'tools' is not an array")),
        None => return Err(ProtocolError::malformed("tools/list result has no 'tools'")),
    };
    let next_cursor = match result.remove("nextCursor") {
        None | Some(Value::Null) => None,
        Some(Value::String(cursor)) if cursor.is_empty() => None,
        Some(Value::String(cursor)) => Some(cursor),
        Some(_) => return Err(ProtocolError::malformed("'nextCursor' is not a string")),
    };
    let tools = raw_tools
        .into_iter()
        .map(parse_tool)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ToolsPage { tools, next_cursor })
}

/// Validate one tool entry against the MCP `Tool` shape.
fn parse_tool(raw: Value) -> Result<ToolDescriptor, ProtocolError> {
    let category = raw
        .get("category")
        .or_else(|| raw.get("_meta").and_then(|meta| meta.get("category")))
        .and_then(Value::as_str)
        .map(str::to_string);
    let tool: rmcp::model::Tool = serde_json::from_value(raw)
        .map_err(|e| ProtocolError::malformed(format!("invalid tool entry: {e}")))?;
    if tool.name.trim().is_empty() {
        return Err(ProtocolError::malformed("tool with empty name"));
    }
    Ok(ToolDescriptor {
        name: tool.name.into_owned(),
        description: tool.description.map(|d| d.into_owned()).unwrap_or_default(),
        input_schema: Value::Object((*tool.input_schema).clone()),
        output_schema: tool.output_schema.map(|schema| Value::Object((*schema).clone())),
        category,
    })
}

/// Accumulates pages, rejecting duplicate names and repeated cursors.
#[derive(Debug, Default)]
pub(crate) struct ToolListing {
    tools: Vec<ToolDescriptor>,
    names: HashSet<String>,
    cursors: HashSet<String>,
}

impl ToolListing {
    /// Add a page; returns the cursor for the next request, if any.
    pub fn push(&mut self, page: ToolsPage) -> Result<Option<String>, ProtocolError> {
        for tool in page.tools {
            if !self.names.insert(tool.name.clone()) {
                return Err(ProtocolError::malformed(format!(
                    "duplicate tool name '{}'",
                    tool.name
                )));
            }
            self.tools.push(tool);
        }
        match page.next_cursor {
            Some(cursor) if !self.cursors.insert(cursor.clone()) => Err(ProtocolError::malformed(
                format!("server repeated cursor '{cursor}'"),
            )),
            next => Ok(next),
        }
    }

    pub fn finish(self) -> Vec<ToolDescriptor> {
        self.tools
    }
}
