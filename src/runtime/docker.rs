//! Docker-compatible CLI runtime (`docker`, `podman`, ...).
//!
//! - stdio: `run -i --rm`; the CLI client's own pipes carry the protocol
//! - http: `run -d --rm -p 127.0.0.1::<port>`, then `port` for the host side
//! - teardown: `rm -f`

use std::process::Output;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{RuntimeSection, TransportKind};
use crate::runtime::{
    ContainerRuntime, EphemeralInstance, InstanceEndpoint, LaunchSpec, RuntimeError,
    STDERR_CAPACITY, StderrBuffer,
};
use crate::transport::stdio::StdioPipes;

/// Distinguishes instances started by one process.
static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Exit codes `docker run` uses for its own failures (daemon error, command
/// not executable, command not found).
const RUNTIME_EXIT_CODES: [i32; 3] = [125, 126, 127];

const READINESS_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
    stop_timeout: Duration,
    startup_timeout: Duration,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::from_config(&RuntimeSection::default())
    }
}

impl DockerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            ..Self::default()
        }
    }

    pub fn from_config(config: &RuntimeSection) -> Self {
        Self {
            binary: config.binary.clone(),
            stop_timeout: config.stop_timeout(),
            startup_timeout: config.startup_timeout(),
        }
    }

    async fn start_stdio(
        &self,
        name: String,
        spec: &LaunchSpec,
    ) -> Result<EphemeralInstance, RuntimeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(run_args(&name, spec));
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(spec, e))?;

        let stderr_buf = Arc::new(Mutex::new(StderrBuffer::new(STDERR_CAPACITY)));
        let cancel = CancellationToken::new();
        if let Some(stderr) = child.stderr.take() {
            start_stderr_drain(stderr, name.clone(), stderr_buf.clone(), cancel.clone());
        }

        let pipes = StdioPipes::from_child(child).map_err(|e| RuntimeError::StartFailed {
            image: spec.image.clone(),
            message: e.to_string(),
        })?;

        Ok(EphemeralInstance {
            id: name,
            endpoint: InstanceEndpoint::Stdio(pipes),
            stderr: Some(stderr_buf),
            cancel,
        })
    }

    async fn start_http(
        &self,
        name: String,
        spec: &LaunchSpec,
    ) -> Result<EphemeralInstance, RuntimeError> {
        let ready_within = spec
            .ready_timeout
            .map_or(self.startup_timeout, |t| t.min(self.startup_timeout));
        let deadline = Instant::now() + ready_within;

        // Armed before `run -d`: the container can exist before the command returns
        let guard = ContainerGuard::new(self.clone(), name.clone());
        let output = match self.run_cli(&run_args(&name, spec), spec).await {
            Ok(output) => output,
            Err(e @ RuntimeError::Unavailable(..)) => {
                guard.disarm();
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        if !output.status.success() {
            guard.disarm();
            return Err(RuntimeError::StartFailed {
                image: spec.image.clone(),
                message: describe_output(&output),
            });
        }

        match self.resolve_http_endpoint(&name, spec, deadline).await {
            Ok(base_url) => {
                guard.disarm();
                Ok(EphemeralInstance {
                    id: name,
                    endpoint: InstanceEndpoint::Http { base_url },
                    stderr: None,
                    cancel: CancellationToken::new(),
                })
            }
            Err(e) => {
                if let Err(stop_err) = self.remove(&name).await {
                    tracing::warn!(
                        container = %name,
                        error = %stop_err,
                        "cleanup after failed start failed"
                    );
                }
                guard.disarm();
                Err(e)
            }
        }
    }

    async fn resolve_http_endpoint(
        &self,
        name: &str,
        spec: &LaunchSpec,
        deadline: Instant,
    ) -> Result<String, RuntimeError> {
        let port_args = vec![
            "port".to_string(),
            name.to_string(),
            format!("{}/tcp", spec.container_port),
        ];
        let output = self.run_cli(&port_args, spec).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let host_port = parse_host_port(&stdout).ok_or_else(|| RuntimeError::StartFailed {
            image: spec.image.clone(),
            message: format!(
                "could not resolve host port for {}/tcp: {}",
                spec.container_port,
                describe_output(&output)
            ),
        })?;

        wait_for_listener(host_port, deadline).await;
        Ok(format!("http://127.0.0.1:{}{}", host_port, spec.endpoint))
    }

    /// Run one runtime CLI command to completion, bounded by the startup timeout.
    async fn run_cli(&self, args: &[String], spec: &LaunchSpec) -> Result<Output, RuntimeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(true);
        match tokio::time::timeout(self.startup_timeout, cmd.output()).await {
            Err(_) => Err(RuntimeError::StartFailed {
                image: spec.image.clone(),
                message: format!(
                    "'{} {}' timed out after {}s",
                    self.binary,
                    args.first().map(String::as_str).unwrap_or_default(),
                    self.startup_timeout.as_secs()
                ),
            }),
            Ok(Err(e)) => Err(self.spawn_error(spec, e)),
            Ok(Ok(output)) => Ok(output),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["rm", "-f", name]);
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(true);
        let output = match tokio::time::timeout(self.stop_timeout, cmd.output()).await {
            Err(_) => {
                return Err(RuntimeError::StopFailed(
                    name.to_string(),
                    format!("timed out after {}s", self.stop_timeout.as_secs()),
                ));
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RuntimeError::Unavailable(self.binary.clone(), e.to_string()));
            }
            Ok(Err(e)) => return Err(RuntimeError::StopFailed(name.to_string(), e.to_string())),
            Ok(Ok(output)) => output,
        };
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") || stderr.contains("no such container") {
            return Ok(());
        }
        Err(RuntimeError::StopFailed(name.to_string(), describe_output(&output)))
    }

    fn spawn_error(&self, spec: &LaunchSpec, e: std::io::Error) -> RuntimeError {
        if e.kind() == std::io::ErrorKind::NotFound {
            RuntimeError::Unavailable(self.binary.clone(), e.to_string())
        } else {
            RuntimeError::StartFailed {
                image: spec.image.clone(),
                message: e.to_string(),
            }
        }
    }
}

impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        &self.binary
    }

    fn start<'a>(
        &'a self,
        spec: &'a LaunchSpec,
    ) -> BoxFuture<'a, Result<EphemeralInstance, RuntimeError>> {
        Box::pin(async move {
            let name = container_name(&spec.name_hint);
            tracing::info!(
                container = %name,
                image = %spec.image,
                transport = %spec.transport,
                "starting ephemeral container"
            );
            match spec.transport {
                TransportKind::Stdio => self.start_stdio(name, spec).await,
                TransportKind::Http => self.start_http(name, spec).await,
            }
        })
    }

    fn stop<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, Result<(), RuntimeError>> {
        Box::pin(self.remove(instance_id))
    }

    fn is_startup_exit(&self, exit_code: i32) -> bool {
        RUNTIME_EXIT_CODES.contains(&exit_code)
    }
}

/// Removes a detached container whose start never completed, for example
/// because the starting future was dropped.
struct ContainerGuard {
    runtime: DockerRuntime,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(runtime: DockerRuntime, name: String) -> Self {
        Self {
            runtime,
            name,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                container = %self.name,
                "no async runtime to remove abandoned container; it may need manual cleanup"
            );
            return;
        };
        tracing::debug!(container = %self.name, "removing container from abandoned start");
        let runtime = self.runtime.clone();
        let name = std::mem::take(&mut self.name);
        handle.spawn(async move {
            match runtime.remove(&name).await {
                Ok(()) => tracing::info!(container = %name, "abandoned container removed"),
                Err(e) => tracing::warn!(
                    container = %name,
                    error = %e,
                    "abandoned container cleanup failed"
                ),
            }
        });
    }
}

/// Unique, runtime-safe container name.
fn container_name(hint: &str) -> String {
    let mut slug: String = hint
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    slug.truncate(40);
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "instance" } else { slug };
    format!(
        "prospector-{}-{}-{}",
        slug,
        std::process::id(),
        INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// `run` arguments for `spec`, detached with a published port for HTTP.
fn run_args(name: &str, spec: &LaunchSpec) -> Vec<String> {
    let mut args = vec!["run".to_string()];
    match spec.transport {
        TransportKind::Stdio => args.push("-i".to_string()),
        TransportKind::Http => args.push("-d".to_string()),
    }
    args.extend(["--rm".to_string(), "--name".to_string(), name.to_string()]);
    if spec.transport == TransportKind::Http {
        args.push("-p".to_string());
        args.push(format!("127.0.0.1::{}", spec.container_port));
    }
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(spec.image.clone());
    args.extend(spec.args.iter().cloned());
    args
}

/// Host port from `port` output such as `127.0.0.1:49153`.
fn parse_host_port(stdout: &str) -> Option<u16> {
    stdout
        .lines()
        .filter_map(|line| line.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.parse().ok())
}

fn describe_output(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    match output.status.code() {
        Some(code) if stderr.is_empty() => format!("exit code {code}"),
        Some(code) => format!("exit code {code}: {stderr}"),
        None if stderr.is_empty() => "terminated by signal".to_string(),
        None => format!("terminated by signal: {stderr}"),
    }
}

/// Poll until something accepts connections on `port`, or the deadline passes.
async fn wait_for_listener(port: u16, deadline: Instant) {
    while Instant::now() < deadline {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(READINESS_POLL).await;
    }
    tracing::debug!(port, "published port not accepting connections before startup deadline");
}

/// Start a background task that drains stderr from the runtime client.
///
/// Each line is logged at debug level and pushed into the rolling buffer.
fn start_stderr_drain(
    child_stderr: tokio::process::ChildStderr,
    container: String,
    stderr_buf: Arc<Mutex<StderrBuffer>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(child_stderr).lines();
        loop {
            tokio::select! {
                line_result = lines.next_line() => {
                    match line_result {
                        Ok(Some(line)) => {
                            tracing::debug!(
                                container = %container,
                                line = %line,
                                "instance stderr"
                            );
                            stderr_buf.lock().await.push(line);
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    });
}
