//! Stdio protocol client: newline-delimited JSON-RPC over a process's
//! standard streams.
//!
//! Every non-blank line on stdout must be a JSON message. Anything else is a
//! malformed response; lines are never filtered.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::model::ToolDescriptor;
use crate::transport::{
    JsonRpcNotification, JsonRpcRequest, METHOD_INITIALIZE, METHOD_INITIALIZED,
    METHOD_TOOLS_LIST, ProtocolError, ToolListing, initialize_params, list_params,
    match_response, parse_tools_page,
};

/// How long to wait for an exit status after stdout closes.
const EXIT_GRACE: Duration = Duration::from_millis(500);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The standard streams of one server process, plus the request id counter.
///
/// Request ids start at 1 and increase by one per request for the life of
/// the connection. Replies to ids sent before the current exchange began
/// are leftovers from an abandoned exchange and are skipped.
pub struct StdioPipes {
    lines: Lines<BufReader<BoxedReader>>,
    writer: BoxedWriter,
    child: Option<Child>,
    next_id: u64,
    exchange_start: u64,
}

impl fmt::Debug for StdioPipes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdioPipes")
            .field("pid", &self.child.as_ref().and_then(Child::id))
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl StdioPipes {
    /// Wrap a spawned child whose stdin and stdout are piped.
    ///
    /// Take stderr before calling this if it should be drained.
    pub fn from_child(mut child: Child) -> std::io::Result<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("child stdin is not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout is not piped"))?;
        let mut pipes = Self::from_streams(stdout, stdin);
        pipes.child = Some(child);
        Ok(pipes)
    }

    /// Wrap arbitrary streams, e.g. one end of an in-memory duplex.
    pub fn from_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: BoxedReader = Box::new(reader);
        Self {
            lines: BufReader::new(reader).lines(),
            writer: Box::new(writer),
            child: None,
            next_id: 1,
            exchange_start: 1,
        }
    }

    /// Exit code of the child, if it exits within a short grace period.
    pub async fn exit_code(&mut self) -> Option<i32> {
        let child = self.child.as_mut()?;
        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => status.code(),
            _ => None,
        }
    }

    async fn exited(&mut self) -> ProtocolError {
        ProtocolError::ProcessExited {
            exit_code: self.exit_code().await,
        }
    }

    async fn write_message<T: Serialize>(
        &mut self,
        message: &T,
        deadline: &Deadline,
        operation: &str,
    ) -> Result<(), ProtocolError> {
        let mut line = serde_json::to_string(message)
            .map_err(|e| ProtocolError::malformed(format!("failed to encode request: {e}")))?;
        line.push('\n');
        let write = async {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.flush().await
        };
        let outcome = tokio::time::timeout_at(deadline.at, write).await;
        match outcome {
            Err(_) => Err(deadline.elapsed(operation)),
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "stdin write failed");
                Err(self.exited().await)
            }
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn request(
        &mut self,
        method: &str,
        params: Option<Value>,
        deadline: &Deadline,
    ) -> Result<Value, ProtocolError> {
        let id = self.next_id;
        self.next_id += 1;
        self.write_message(&JsonRpcRequest::new(id, method, params), deadline, method)
            .await?;

        loop {
            let next = tokio::time::timeout_at(deadline.at, self.lines.next_line()).await;
            let line = match next {
                Err(_) => return Err(deadline.elapsed(method)),
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => return Err(self.exited().await),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                    return Err(ProtocolError::malformed(format!("stdout is not UTF-8: {e}")));
                }
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "stdout read failed");
                    return Err(self.exited().await);
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let message: Value = serde_json::from_str(&line).map_err(|e| {
                ProtocolError::malformed(format!(
                    "non-JSON line on stdout ({e}): {}",
                    truncate(&line)
                ))
            })?;
            if let Some(stale) = stale_reply_id(&message, self.exchange_start) {
                tracing::debug!(method, id = stale, "skipping reply to an abandoned request");
                continue;
            }
            match match_response(message, id)? {
                Some(result) => return Ok(result),
                None => tracing::debug!(method, "skipping server-initiated message"),
            }
        }
    }

    async fn notify(&mut self, method: &str, deadline: &Deadline) -> Result<(), ProtocolError> {
        self.write_message(&JsonRpcNotification::new(method), deadline, method)
            .await
    }
}

/// An absolute deadline plus the budget it was derived from, for messages.
struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    fn after(start: Instant, budget: Duration) -> Self {
        Self {
            at: start + budget,
            budget,
        }
    }

    fn elapsed(&self, operation: &str) -> ProtocolError {
        ProtocolError::Timeout {
            operation: operation.to_string(),
            after_ms: self.budget.as_millis() as u64,
        }
    }
}

/// Id of a reply to a request sent before `exchange_start`.
fn stale_reply_id(message: &Value, exchange_start: u64) -> Option<u64> {
    if message.get("method").is_some() {
        return None;
    }
    message
        .get("id")?
        .as_u64()
        .filter(|id| *id < exchange_start)
}

fn truncate(line: &str) -> &str {
    match line.char_indices().nth(120) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

/// Run the discovery exchange over `pipes`.
///
/// The handshake may use at most half of `timeout`; the `tools/list` pages
/// share whatever remains of the overall deadline.
pub async fn probe(
    pipes: &mut StdioPipes,
    timeout: Duration,
) -> Result<Vec<ToolDescriptor>, ProtocolError> {
    let start = Instant::now();
    let handshake = Deadline::after(start, timeout / 2);
    let overall = Deadline::after(start, timeout);
    pipes.exchange_start = pipes.next_id;

    pipes
        .request(METHOD_INITIALIZE, Some(initialize_params()), &handshake)
        .await?;
    pipes.notify(METHOD_INITIALIZED, &handshake).await?;

    let mut listing = ToolListing::default();
    let mut cursor: Option<String> = None;
    loop {
        let result = pipes
            .request(METHOD_TOOLS_LIST, list_params(cursor.as_deref()), &overall)
            .await?;
        match listing.push(parse_tools_page(result)?)? {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(listing.finish())
}

/// Shared handle to the stdio streams of an instance the caller keeps
/// running.
#[derive(Clone)]
pub struct StdioHandle {
    label: String,
    pipes: Arc<Mutex<StdioPipes>>,
}

impl fmt::Debug for StdioHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdioHandle")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl StdioHandle {
    /// `label` identifies the instance in fingerprints and logs.
    pub fn new(label: impl Into<String>, pipes: StdioPipes) -> Self {
        Self {
            label: label.into(),
            pipes: Arc::new(Mutex::new(pipes)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Probe the instance. Concurrent probes on one handle are serialized.
    pub async fn probe(&self, timeout: Duration) -> Result<Vec<ToolDescriptor>, ProtocolError> {
        let mut pipes = self.pipes.lock().await;
        probe(&mut pipes, timeout).await
    }
}
