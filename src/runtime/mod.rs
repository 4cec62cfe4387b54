//! Ephemeral runtime controller: short-lived instances started only for
//! discovery.
//!
//! A [`ContainerRuntime`] knows how to start and stop instances. An
//! [`EphemeralRuntimeHandle`] owns exactly one running instance and stops it
//! exactly once, either through [`EphemeralRuntimeHandle::release`] or, if
//! the owning future is dropped mid-probe, from its destructor.

pub mod docker;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::TransportKind;
use crate::transport::stdio::StdioPipes;

/// Stderr lines kept per instance.
pub const STDERR_CAPACITY: usize = 100;

/// Lines of stderr attached to failure messages.
pub const STDERR_TAIL: usize = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("container runtime '{0}' is not available: {1}")]
    Unavailable(String, String),

    #[error("failed to start '{image}': {message}")]
    StartFailed { image: String, message: String },

    #[error("failed to stop instance '{0}': {1}")]
    StopFailed(String, String),
}

/// Everything needed to start one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub image: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub transport: TransportKind,
    /// Port the server listens on inside the container (HTTP only)
    pub container_port: u16,
    /// HTTP path appended to the published address
    pub endpoint: String,
    /// Readable prefix for the instance name
    pub name_hint: String,
    /// Caller's budget for the instance to start accepting connections;
    /// the runtime's own startup timeout still applies
    pub ready_timeout: Option<Duration>,
}

/// How the probe reaches a started instance.
#[derive(Debug)]
pub enum InstanceEndpoint {
    Stdio(StdioPipes),
    Http { base_url: String },
}

/// A started instance as returned by a runtime.
#[derive(Debug)]
pub struct EphemeralInstance {
    pub id: String,
    pub endpoint: InstanceEndpoint,
    pub stderr: Option<Arc<Mutex<StderrBuffer>>>,
    /// Cancelled on release to stop background tasks such as stderr drains
    pub cancel: CancellationToken,
}

/// Starts and stops discovery-only instances.
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn start<'a>(
        &'a self,
        spec: &'a LaunchSpec,
    ) -> BoxFuture<'a, Result<EphemeralInstance, RuntimeError>>;

    /// Stop and remove an instance. Stopping an instance that is already
    /// gone succeeds.
    fn stop<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, Result<(), RuntimeError>>;

    /// Whether a stdio process exit code means the instance never started
    /// (runtime error, image missing) rather than a server crash.
    fn is_startup_exit(&self, _exit_code: i32) -> bool {
        false
    }
}

/// Exclusive owner of one ephemeral instance.
pub struct EphemeralRuntimeHandle {
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    endpoint: InstanceEndpoint,
    stderr: Option<Arc<Mutex<StderrBuffer>>>,
    cancel: CancellationToken,
    released: AtomicBool,
}

impl std::fmt::Debug for EphemeralRuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralRuntimeHandle")
            .field("runtime", &self.runtime.name())
            .field("id", &self.id)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

impl EphemeralRuntimeHandle {
    /// Start an instance and take ownership of it.
    pub async fn acquire(
        runtime: Arc<dyn ContainerRuntime>,
        spec: &LaunchSpec,
    ) -> Result<Self, RuntimeError> {
        let instance = runtime.start(spec).await?;
        tracing::info!(
            container = %instance.id,
            image = %spec.image,
            transport = %spec.transport,
            runtime = runtime.name(),
            "ephemeral instance started"
        );
        Ok(Self {
            runtime,
            id: instance.id,
            endpoint: instance.endpoint,
            stderr: instance.stderr,
            cancel: instance.cancel,
            released: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint_mut(&mut self) -> &mut InstanceEndpoint {
        &mut self.endpoint
    }

    /// The last `lines` lines the instance wrote to stderr.
    pub async fn stderr_tail(&self, lines: usize) -> Vec<String> {
        match &self.stderr {
            Some(buffer) => buffer.lock().await.tail(lines),
            None => Vec::new(),
        }
    }

    /// Whether the instance has been handed back for teardown.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Stop the instance and wait for the stop to finish.
    ///
    /// Idempotent. The stop runs on its own task, so it completes even if
    /// the caller is cancelled while waiting.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let task = spawn_stop(self.runtime.clone(), self.id.clone());
        if let Err(e) = task.await {
            tracing::warn!(container = %self.id, error = %e, "teardown task failed");
        }
    }
}

impl Drop for EphemeralRuntimeHandle {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        match tokio::runtime::Handle::try_current() {
            Ok(_) => {
                tracing::debug!(container = %self.id, "releasing abandoned ephemeral instance");
                spawn_stop(self.runtime.clone(), self.id.clone());
            }
            Err(_) => {
                tracing::warn!(
                    container = %self.id,
                    "no async runtime to stop ephemeral instance; it may need manual cleanup"
                );
            }
        }
    }
}

fn spawn_stop(runtime: Arc<dyn ContainerRuntime>, id: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match runtime.stop(&id).await {
            Ok(()) => tracing::info!(container = %id, "ephemeral instance stopped"),
            Err(e) => tracing::warn!(container = %id, error = %e, "ephemeral teardown failed"),
        }
    })
}

/// Rolling buffer for an instance's stderr output, for diagnostics.
#[derive(Debug)]
pub struct StderrBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl StderrBuffer {
    /// Create a new stderr buffer with the given line capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity,
        }
    }

    /// Push a new stderr line, evicting the oldest if at capacity.
    pub fn push(&mut self, line: String) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Read access to buffered stderr lines.
    pub fn lines(&self) -> &VecDeque<String> {
        &self.lines
    }

    /// Copy of the newest `count` lines, oldest first.
    pub fn tail(&self, count: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLaunch, FakeRuntime};

    fn spec(transport: TransportKind) -> LaunchSpec {
        LaunchSpec {
            image: "ghcr.io/acme/files:1.0".to_string(),
            args: vec![],
            env: BTreeMap::new(),
            transport,
            container_port: 7071,
            endpoint: "/mcp".to_string(),
            name_hint: "files".to_string(),
            ready_timeout: None,
        }
    }

    async fn settle() {
        // Let spawned teardown tasks run
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let runtime = Arc::new(FakeRuntime::new(FakeLaunch::tools(&["a"]), FakeLaunch::Refuse));
        let handle = EphemeralRuntimeHandle::acquire(runtime.clone(), &spec(TransportKind::Stdio))
            .await
            .unwrap();
        handle.release().await;
        handle.release().await;
        drop(handle);
        settle().await;
        assert_eq!(runtime.starts(), 1);
        assert_eq!(runtime.stops(), 1);
    }

    #[tokio::test]
    async fn test_drop_without_release_stops_instance() {
        let runtime = Arc::new(FakeRuntime::new(FakeLaunch::tools(&["a"]), FakeLaunch::Refuse));
        let handle = EphemeralRuntimeHandle::acquire(runtime.clone(), &spec(TransportKind::Stdio))
            .await
            .unwrap();
        assert!(!handle.is_released());
        drop(handle);
        settle().await;
        assert_eq!(runtime.stops(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_probe_still_stops_instance() {
        let runtime = Arc::new(FakeRuntime::new(FakeLaunch::Silent, FakeLaunch::Refuse));
        let rt: Arc<dyn ContainerRuntime> = runtime.clone();
        let attempt = async move {
            let mut handle = EphemeralRuntimeHandle::acquire(rt, &spec(TransportKind::Stdio))
                .await
                .unwrap();
            if let InstanceEndpoint::Stdio(pipes) = handle.endpoint_mut() {
                let _ = crate::transport::stdio::probe(pipes, Duration::from_secs(30)).await;
            }
            handle.release().await;
        };
        let outcome = tokio::time::timeout(Duration::from_millis(100), attempt).await;
        assert!(outcome.is_err());
        settle().await;
        assert_eq!(runtime.stops(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_creates_no_handle() {
        let runtime = Arc::new(FakeRuntime::new(
            FakeLaunch::Fail("pull access denied".to_string()),
            FakeLaunch::Refuse,
        ));
        let err = EphemeralRuntimeHandle::acquire(runtime.clone(), &spec(TransportKind::Stdio))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::StartFailed { .. }));
        settle().await;
        assert_eq!(runtime.stops(), 0);
    }

    #[test]
    fn test_stderr_buffer_rolls_over() {
        let mut buffer = StderrBuffer::new(3);
        for i in 0..5 {
            buffer.push(format!("line {i}"));
        }
        assert_eq!(buffer.lines().len(), 3);
        assert_eq!(buffer.tail(2), vec!["line 3".to_string(), "line 4".to_string()]);
        assert_eq!(buffer.tail(10).len(), 3);
    }
}
