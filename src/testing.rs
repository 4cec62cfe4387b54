//! Test fixtures: an rmcp server over an in-memory pipe, a scripted stdio
//! peer, an axum MCP endpoint, and a fake container runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::future::BoxFuture;
use rmcp::handler::server::ServerHandler;
use rmcp::model::{
    Implementation, JsonObject, ListToolsResult, PaginatedRequestParams, ServerCapabilities,
    ServerInfo, Tool,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::{ErrorData as McpError, ServiceExt};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheEntry, CacheError, DiscoveryCache};
use crate::config::TransportKind;
use crate::fingerprint::Fingerprint;
use crate::model::{DiscoveryResult, SubjectClass};
use crate::runtime::{
    ContainerRuntime, EphemeralInstance, InstanceEndpoint, LaunchSpec, RuntimeError,
};
use crate::transport::http::SESSION_HEADER;
use crate::transport::stdio::StdioPipes;

/// Minimal MCP server that lists a fixed set of tools.
#[derive(Clone)]
pub struct FixtureServer {
    tools: Vec<Tool>,
}

impl ServerHandler for FixtureServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "fixture".into(),
                version: "0.0.1".into(),
                title: None,
                icons: None,
                website_url: None,
            },
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: self.tools.clone(),
            next_cursor: None,
            meta: None,
        })
    }
}

pub fn fixture_tool(name: &str) -> Tool {
    let schema: JsonObject = serde_json::from_value(json!({
        "type": "object",
        "properties": {"query": {"type": "string"}}
    }))
    .expect("schema literal is an object");
    Tool::new(name.to_string(), format!("Fixture tool {name}"), Arc::new(schema))
}

/// Serve `names` from an rmcp server and return the client end as pipes.
pub fn spawn_fixture_server(names: &[&str]) -> StdioPipes {
    let server = FixtureServer {
        tools: names.iter().map(|name| fixture_tool(name)).collect(),
    };
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let (server_read, server_write) = tokio::io::split(server_stream);
        if let Ok(running) = server.serve((server_read, server_write)).await {
            let _ = running.waiting().await;
        }
    });
    let (client_read, client_write) = tokio::io::split(client_stream);
    StdioPipes::from_streams(client_read, client_write)
}

/// Received messages, in arrival order.
pub type Transcript = Arc<Mutex<Vec<Value>>>;

/// A line-level peer driven by `respond`, which maps each received message
/// to the raw lines to send back (`None` or an empty vec sends nothing).
pub fn spawn_scripted_peer<F>(mut respond: F) -> (StdioPipes, Transcript)
where
    F: FnMut(&Value) -> Option<Vec<String>> + Send + 'static,
{
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
    let transcript: Transcript = Arc::new(Mutex::new(Vec::new()));
    let seen = transcript.clone();
    tokio::spawn(async move {
        let (server_read, mut server_write) = tokio::io::split(server_stream);
        let mut lines = BufReader::new(server_read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(message) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let replies = respond(&message).unwrap_or_default();
            seen.lock().await.push(message);
            for reply in replies {
                if server_write
                    .write_all(format!("{reply}\n").as_bytes())
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    });
    let (client_read, client_write) = tokio::io::split(client_stream);
    (
        StdioPipes::from_streams(client_read, client_write),
        transcript,
    )
}

/// Body framing used by [`McpEndpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFormat {
    Json,
    Sse,
}

/// Scriptable Streamable HTTP MCP endpoint.
#[derive(Clone)]
pub struct McpEndpoint {
    tools: Vec<String>,
    format: ReplyFormat,
    page_size: Option<usize>,
    session: Option<String>,
    status: Option<u16>,
    id_offset: u64,
    delay: Option<Duration>,
    log: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl McpEndpoint {
    pub fn new(tools: &[&str]) -> Self {
        Self {
            tools: tools.iter().map(|t| t.to_string()).collect(),
            format: ReplyFormat::Json,
            page_size: None,
            session: None,
            status: None,
            id_offset: 0,
            delay: None,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_format(mut self, format: ReplyFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn with_session(mut self, session: &str) -> Self {
        self.session = Some(session.to_string());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_id_offset(mut self, offset: u64) -> Self {
        self.id_offset = offset;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Methods received, in order.
    pub async fn methods(&self) -> Vec<String> {
        self.log.lock().await.iter().map(|(m, _)| m.clone()).collect()
    }

    /// Session header sent with each message, in order.
    pub async fn sessions(&self) -> Vec<Option<String>> {
        self.log.lock().await.iter().map(|(_, s)| s.clone()).collect()
    }

    fn tools_page(&self, cursor: Option<&str>) -> Value {
        let start = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let size = self.page_size.unwrap_or(self.tools.len().max(1));
        let end = (start + size).min(self.tools.len());
        let tools: Vec<Value> = self.tools[start.min(end)..end]
            .iter()
            .map(|name| {
                json!({
                    "name": name,
                    "description": format!("Endpoint tool {name}"),
                    "inputSchema": {"type": "object"}
                })
            })
            .collect();
        let mut page = json!({ "tools": tools });
        if end < self.tools.len() {
            page["nextCursor"] = json!(end.to_string());
        }
        page
    }
}

async fn handle_mcp(
    State(endpoint): State<McpEndpoint>,
    headers: HeaderMap,
    Json(message): Json<Value>,
) -> Response {
    let session = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let method = message["method"].as_str().unwrap_or_default().to_string();
    endpoint.log.lock().await.push((method.clone(), session));

    if let Some(delay) = endpoint.delay {
        tokio::time::sleep(delay).await;
    }
    if let Some(status) = endpoint.status {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, "endpoint failure").into_response();
    }
    let Some(id) = message.get("id").and_then(Value::as_u64) else {
        return StatusCode::ACCEPTED.into_response();
    };

    let result = match method.as_str() {
        "initialize" => json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "endpoint", "version": "0.0.1"}
        }),
        "tools/list" => endpoint.tools_page(message["params"]["cursor"].as_str()),
        _ => {
            let reply = json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": "Method not found"}
            });
            return Json(reply).into_response();
        }
    };
    let reply = json!({"jsonrpc": "2.0", "id": id + endpoint.id_offset, "result": result});

    let mut response = match endpoint.format {
        ReplyFormat::Json => Json(reply).into_response(),
        ReplyFormat::Sse => (
            [(header::CONTENT_TYPE, "text/event-stream")],
            format!("event: message\ndata: {reply}\n\n"),
        )
            .into_response(),
    };
    if method == "initialize" {
        if let Some(session) = endpoint
            .session
            .as_deref()
            .and_then(|s| HeaderValue::from_str(s).ok())
        {
            response.headers_mut().insert(SESSION_HEADER, session);
        }
    }
    response
}

/// Serve `endpoint` on a loopback port; returns its `/mcp` URL.
pub async fn spawn_http_endpoint(endpoint: McpEndpoint) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let addr = listener.local_addr().expect("listener address");
    let router = Router::new()
        .route("/mcp", post(handle_mcp))
        .with_state(endpoint);
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}/mcp")
}

/// URL on a port nothing listens on.
pub async fn refused_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let addr = listener.local_addr().expect("listener address");
    drop(listener);
    format!("http://{addr}/mcp")
}

/// What a [`FakeRuntime`] start produces for one transport.
#[derive(Debug, Clone)]
pub enum FakeLaunch {
    /// A working server listing these tools
    Tools(Vec<String>),
    /// A server that never answers
    Silent,
    /// An instance that cannot be reached
    Refuse,
    /// `start` itself fails
    Fail(String),
    /// A stdio process that exits with this code after the first request
    Exit(i32),
}

impl FakeLaunch {
    pub fn tools(names: &[&str]) -> Self {
        FakeLaunch::Tools(names.iter().map(|n| n.to_string()).collect())
    }
}

/// Container runtime double that counts starts and stops.
pub struct FakeRuntime {
    stdio: FakeLaunch,
    http: FakeLaunch,
    starts: AtomicUsize,
    stops: AtomicUsize,
    launches: std::sync::Mutex<Vec<LaunchSpec>>,
}

impl FakeRuntime {
    pub fn new(stdio: FakeLaunch, http: FakeLaunch) -> Self {
        Self {
            stdio,
            http,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            launches: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().map(|l| l.clone()).unwrap_or_default()
    }

    async fn endpoint_for(
        &self,
        spec: &LaunchSpec,
    ) -> Result<InstanceEndpoint, RuntimeError> {
        let launch = match spec.transport {
            TransportKind::Stdio => &self.stdio,
            TransportKind::Http => &self.http,
        };
        let endpoint = match (spec.transport, launch) {
            (_, FakeLaunch::Fail(message)) => {
                return Err(RuntimeError::StartFailed {
                    image: spec.image.clone(),
                    message: message.clone(),
                });
            }
            (TransportKind::Stdio, FakeLaunch::Tools(names)) => {
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                InstanceEndpoint::Stdio(spawn_fixture_server(&names))
            }
            (TransportKind::Stdio, FakeLaunch::Silent) => {
                InstanceEndpoint::Stdio(spawn_scripted_peer(|_| None).0)
            }
            (TransportKind::Stdio, FakeLaunch::Refuse) => {
                let (client, server) = tokio::io::duplex(1024);
                drop(server);
                let (read, write) = tokio::io::split(client);
                InstanceEndpoint::Stdio(StdioPipes::from_streams(read, write))
            }
            (TransportKind::Stdio, FakeLaunch::Exit(code)) => {
                let child = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(format!("read line; exit {code}"))
                    .stdin(std::process::Stdio::piped())
                    .stdout(std::process::Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| RuntimeError::StartFailed {
                        image: spec.image.clone(),
                        message: e.to_string(),
                    })?;
                let pipes = StdioPipes::from_child(child).map_err(|e| RuntimeError::StartFailed {
                    image: spec.image.clone(),
                    message: e.to_string(),
                })?;
                InstanceEndpoint::Stdio(pipes)
            }
            (TransportKind::Http, FakeLaunch::Tools(names)) => {
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                InstanceEndpoint::Http {
                    base_url: spawn_http_endpoint(McpEndpoint::new(&names)).await,
                }
            }
            (TransportKind::Http, FakeLaunch::Silent) => InstanceEndpoint::Http {
                base_url: spawn_http_endpoint(
                    McpEndpoint::new(&[]).with_delay(Duration::from_secs(60)),
                )
                .await,
            },
            (TransportKind::Http, FakeLaunch::Refuse | FakeLaunch::Exit(_)) => {
                InstanceEndpoint::Http {
                    base_url: refused_url().await,
                }
            }
        };
        Ok(endpoint)
    }
}

impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    fn start<'a>(
        &'a self,
        spec: &'a LaunchSpec,
    ) -> BoxFuture<'a, Result<EphemeralInstance, RuntimeError>> {
        Box::pin(async move {
            if let Ok(mut launches) = self.launches.lock() {
                launches.push(spec.clone());
            }
            let endpoint = self.endpoint_for(spec).await?;
            let n = self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(EphemeralInstance {
                id: format!("fake-{n}"),
                endpoint,
                stderr: None,
                cancel: CancellationToken::new(),
            })
        })
    }

    fn stop<'a>(&'a self, _instance_id: &'a str) -> BoxFuture<'a, Result<(), RuntimeError>> {
        Box::pin(async move {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn is_startup_exit(&self, exit_code: i32) -> bool {
        (125..=127).contains(&exit_code)
    }
}

/// Cache whose every operation fails.
pub struct FailingCache;

fn unavailable() -> CacheError {
    CacheError::Io {
        path: "/unavailable".to_string(),
        source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
    }
}

impl DiscoveryCache for FailingCache {
    fn get<'a>(
        &'a self,
        _fingerprint: &'a Fingerprint,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>, CacheError>> {
        Box::pin(async { Err(unavailable()) })
    }

    fn put<'a>(
        &'a self,
        _result: &'a DiscoveryResult,
        _ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async { Err(unavailable()) })
    }

    fn invalidate<'a>(
        &'a self,
        _fingerprint: &'a Fingerprint,
    ) -> BoxFuture<'a, Result<bool, CacheError>> {
        Box::pin(async { Err(unavailable()) })
    }

    fn clear_class(&self, _class: SubjectClass) -> BoxFuture<'_, Result<usize, CacheError>> {
        Box::pin(async { Err(unavailable()) })
    }

    fn clear_all(&self) -> BoxFuture<'_, Result<usize, CacheError>> {
        Box::pin(async { Err(unavailable()) })
    }
}
