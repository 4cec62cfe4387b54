//! Discovery coordinator: fingerprint, cache lookup, then the strategy chain.
//!
//! Strategies run one at a time in priority order, each under its own
//! timeout. The first success wins, including a success with zero tools.
//! Every failure is recorded and the chain moves on; only exhaustion is an
//! error.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use crate::cache::{CacheError, DiscoveryCache, FileCache};
use crate::config::{ProspectorConfig, TransportKind};
use crate::error::{DiscoveryError, FailureKind, StrategyFailure};
use crate::fingerprint::{Fingerprint, fingerprint};
use crate::model::{
    DEFAULT_HTTP_ENDPOINT, DiscoveryResult, LiveAddress, StrategyKind, Subject, ToolDescriptor,
};
use crate::runtime::docker::DockerRuntime;
use crate::runtime::{
    ContainerRuntime, EphemeralRuntimeHandle, InstanceEndpoint, LaunchSpec, STDERR_TAIL,
};
use crate::static_metadata::read_static_tools;
use crate::template::{DirectoryTemplates, TemplateError, TemplateMetadata, TemplateSource};
use crate::transport::http::HttpProbe;
use crate::transport::{ProtocolError, stdio};

/// Default wall-clock budget per strategy attempt.
pub const DEFAULT_STRATEGY_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-call discovery options.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Skip the cache read; the result is still written back
    pub force_refresh: bool,
    /// Skip both the cache read and the write
    pub no_cache: bool,
    pub timeout_per_strategy: Duration,
    /// Merged into the subject's configuration before fingerprinting
    pub config_overrides: BTreeMap<String, String>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            force_refresh: false,
            no_cache: false,
            timeout_per_strategy: DEFAULT_STRATEGY_TIMEOUT,
            config_overrides: BTreeMap::new(),
        }
    }
}

impl DiscoveryOptions {
    pub fn refresh() -> Self {
        Self {
            force_refresh: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_per_strategy = timeout;
        self
    }

    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config_overrides.insert(key.into(), value.into());
        self
    }
}

/// The discovery methods, dispatched through [`ToolDiscovery::attempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    LiveProtocol,
    StdioEphemeral,
    HttpEphemeral,
    StaticMetadata,
}

impl Strategy {
    /// The reported kind of this strategy when applied to `subject`.
    pub fn kind(&self, subject: &Subject) -> StrategyKind {
        match self {
            Strategy::LiveProtocol => match subject {
                Subject::Running(LiveAddress::Stdio(_)) => StrategyKind::LiveStdio,
                _ => StrategyKind::LiveHttp,
            },
            Strategy::StdioEphemeral => StrategyKind::StdioEphemeral,
            Strategy::HttpEphemeral => StrategyKind::HttpEphemeral,
            Strategy::StaticMetadata => StrategyKind::Static,
        }
    }
}

/// Strategies applicable to `subject`, in priority order.
///
/// A template that declares its transports omits the ephemeral strategies it
/// cannot use. A template without an image keeps them; they fail at startup.
pub fn strategies_for(subject: &Subject, template: Option<&TemplateMetadata>) -> Vec<Strategy> {
    match subject {
        Subject::Running(_) => vec![Strategy::LiveProtocol],
        Subject::Image(_) => vec![Strategy::StdioEphemeral, Strategy::HttpEphemeral],
        Subject::Template(_) => {
            let supports = |kind: TransportKind| template.is_none_or(|t| t.supports(kind));
            let mut strategies = Vec::with_capacity(3);
            if supports(TransportKind::Stdio) {
                strategies.push(Strategy::StdioEphemeral);
            }
            if supports(TransportKind::Http) {
                strategies.push(Strategy::HttpEphemeral);
            }
            strategies.push(Strategy::StaticMetadata);
            strategies
        }
    }
}

type TemplateLookup = Option<Result<TemplateMetadata, TemplateError>>;

/// The discovery engine.
pub struct ToolDiscovery {
    cache: Arc<dyn DiscoveryCache>,
    runtime: Arc<dyn ContainerRuntime>,
    templates: Arc<dyn TemplateSource>,
    http: HttpProbe,
    cache_ttl: Duration,
}

impl ToolDiscovery {
    pub fn new(
        cache: Arc<dyn DiscoveryCache>,
        runtime: Arc<dyn ContainerRuntime>,
        templates: Arc<dyn TemplateSource>,
    ) -> Self {
        Self {
            cache,
            runtime,
            templates,
            http: HttpProbe::new(),
            cache_ttl: crate::cache::DEFAULT_TTL,
        }
    }

    /// File cache, container CLI runtime, and template directory from config.
    pub fn from_config(config: &ProspectorConfig) -> Self {
        Self::new(
            Arc::new(FileCache::new(config.discovery.resolved_cache_dir())),
            Arc::new(DockerRuntime::from_config(&config.runtime)),
            Arc::new(DirectoryTemplates::new(config.discovery.templates_dir.clone())),
        )
        .with_cache_ttl(config.discovery.cache_ttl())
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_http_probe(mut self, probe: HttpProbe) -> Self {
        self.http = probe;
        self
    }

    pub fn cache(&self) -> &Arc<dyn DiscoveryCache> {
        &self.cache
    }

    async fn load_template(&self, subject: &Subject) -> TemplateLookup {
        match subject {
            Subject::Template(t) => Some(self.templates.load(&t.template_id).await),
            _ => None,
        }
    }

    /// Cache key `discover` would use for `subject` with `overrides`.
    pub async fn fingerprint(
        &self,
        subject: &Subject,
        overrides: &BTreeMap<String, String>,
    ) -> Fingerprint {
        let subject = subject.with_overrides(overrides);
        let template = self.load_template(&subject).await;
        fingerprint(&subject, template.as_ref().and_then(|t| t.as_ref().ok()))
    }

    /// Drop the cached result for `subject`. Returns whether one existed.
    pub async fn invalidate(
        &self,
        subject: &Subject,
        overrides: &BTreeMap<String, String>,
    ) -> Result<bool, CacheError> {
        let key = self.fingerprint(subject, overrides).await;
        let removed = self.cache.invalidate(&key).await?;
        tracing::info!(subject = %key, removed, "invalidated discovery cache entry");
        Ok(removed)
    }

    /// Discover the tools `subject` exposes.
    pub async fn discover(
        &self,
        subject: &Subject,
        options: &DiscoveryOptions,
    ) -> Result<DiscoveryResult, DiscoveryError> {
        let subject = subject.with_overrides(&options.config_overrides);
        let template = self.load_template(&subject).await;
        let metadata = template.as_ref().and_then(|t| t.as_ref().ok());
        let key = fingerprint(&subject, metadata);

        if let Some(Err(e)) = &template {
            tracing::warn!(subject = %key, error = %e, "template metadata unavailable");
        }

        if !options.no_cache && !options.force_refresh {
            match self.cache.get(&key).await {
                Ok(Some(entry)) => {
                    tracing::info!(
                        subject = %key,
                        expires_at = %entry.expires_at,
                        "discovery cache hit"
                    );
                    let mut result = entry.result;
                    result.cached_from = Some(result.origin());
                    result.strategy_used = StrategyKind::Cached;
                    return Ok(result);
                }
                Ok(None) => tracing::debug!(subject = %key, "discovery cache miss"),
                Err(e) => {
                    tracing::warn!(
                        subject = %key,
                        error = %e,
                        "cache read failed, treating as miss"
                    );
                }
            }
        }

        let mut failures = Vec::new();
        for strategy in strategies_for(&subject, metadata) {
            let kind = strategy.kind(&subject);
            tracing::info!(subject = %key, strategy = %kind, "attempting discovery strategy");

            let deadline = Instant::now() + options.timeout_per_strategy;
            let attempt = self.attempt(strategy, kind, &subject, template.as_ref(), deadline);
            let outcome = match tokio::time::timeout_at(deadline, attempt).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StrategyFailure::new(
                    kind,
                    FailureKind::Timeout,
                    format!(
                        "no result within {}ms",
                        options.timeout_per_strategy.as_millis()
                    ),
                )),
            };

            match outcome {
                Ok(tools) => {
                    tracing::info!(
                        subject = %key,
                        strategy = %kind,
                        tools = tools.len(),
                        "discovered tools"
                    );
                    let result = DiscoveryResult {
                        tools,
                        strategy_used: kind,
                        discovered_at: Utc::now(),
                        subject_fingerprint: key.clone(),
                        failures,
                        cached_from: None,
                    };
                    if !options.no_cache {
                        if let Err(e) = self.cache.put(&result, self.cache_ttl).await {
                            tracing::warn!(subject = %key, error = %e, "cache write failed");
                        }
                    }
                    return Ok(result);
                }
                Err(failure) => {
                    tracing::warn!(
                        subject = %key,
                        strategy = %kind,
                        error = %failure,
                        "discovery strategy failed"
                    );
                    failures.push(failure);
                }
            }
        }

        Err(DiscoveryError {
            fingerprint: key,
            failures,
        })
    }

    /// Run one strategy against `subject`.
    async fn attempt(
        &self,
        strategy: Strategy,
        kind: StrategyKind,
        subject: &Subject,
        template: Option<&Result<TemplateMetadata, TemplateError>>,
        deadline: Instant,
    ) -> Result<Vec<ToolDescriptor>, StrategyFailure> {
        match strategy {
            Strategy::LiveProtocol => self.attempt_live(subject, kind, deadline).await,
            Strategy::StdioEphemeral => {
                let spec = launch_spec(subject, template, TransportKind::Stdio).map_err(|message| {
                    StrategyFailure::new(kind, FailureKind::StartupFailure, message)
                })?;
                self.attempt_ephemeral(spec, kind, deadline).await
            }
            Strategy::HttpEphemeral => {
                let spec = launch_spec(subject, template, TransportKind::Http).map_err(|message| {
                    StrategyFailure::new(kind, FailureKind::StartupFailure, message)
                })?;
                self.attempt_ephemeral(spec, kind, deadline).await
            }
            Strategy::StaticMetadata => match template {
                Some(Ok(metadata)) => read_static_tools(metadata).map_err(|e| {
                    StrategyFailure::new(kind, FailureKind::MetadataUnavailable, e.to_string())
                }),
                Some(Err(e)) => Err(StrategyFailure::new(
                    kind,
                    FailureKind::MetadataUnavailable,
                    e.to_string(),
                )),
                None => Err(StrategyFailure::new(
                    kind,
                    FailureKind::MetadataUnavailable,
                    "subject has no template metadata",
                )),
            },
        }
    }

    async fn attempt_live(
        &self,
        subject: &Subject,
        kind: StrategyKind,
        deadline: Instant,
    ) -> Result<Vec<ToolDescriptor>, StrategyFailure> {
        let timeout = remaining(deadline);
        let outcome = match subject {
            Subject::Running(LiveAddress::Http { base_url }) => {
                self.http.probe(base_url, timeout).await
            }
            Subject::Running(LiveAddress::Stdio(handle)) => handle.probe(timeout).await,
            _ => {
                return Err(StrategyFailure::new(
                    kind,
                    FailureKind::StartupFailure,
                    "subject is not a running instance",
                ));
            }
        };
        outcome.map_err(|e| StrategyFailure::new(kind, e.failure_kind(), e.to_string()))
    }

    async fn attempt_ephemeral(
        &self,
        mut spec: LaunchSpec,
        kind: StrategyKind,
        deadline: Instant,
    ) -> Result<Vec<ToolDescriptor>, StrategyFailure> {
        spec.ready_timeout = Some(remaining(deadline));
        let mut handle = EphemeralRuntimeHandle::acquire(self.runtime.clone(), &spec)
            .await
            .map_err(|e| StrategyFailure::new(kind, FailureKind::StartupFailure, e.to_string()))?;

        let timeout = remaining(deadline);
        let outcome = match handle.endpoint_mut() {
            InstanceEndpoint::Stdio(pipes) => stdio::probe(pipes, timeout).await,
            InstanceEndpoint::Http { base_url } => {
                let url = base_url.clone();
                self.http.probe(&url, timeout).await
            }
        };
        let outcome = match outcome {
            Ok(tools) => Ok(tools),
            Err(e) => Err(self.ephemeral_failure(&handle, kind, e).await),
        };

        handle.release().await;
        outcome
    }

    async fn ephemeral_failure(
        &self,
        handle: &EphemeralRuntimeHandle,
        kind: StrategyKind,
        error: ProtocolError,
    ) -> StrategyFailure {
        let failure = match &error {
            ProtocolError::ProcessExited {
                exit_code: Some(code),
            } if self.runtime.is_startup_exit(*code) => FailureKind::StartupFailure,
            _ => error.failure_kind(),
        };
        let mut message = error.to_string();
        let tail = handle.stderr_tail(STDERR_TAIL).await;
        if !tail.is_empty() {
            message.push_str(&format!(" (stderr: {})", tail.join(" | ")));
        }
        StrategyFailure::new(kind, failure, message)
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Launch parameters for an ephemeral instance of `subject` over `transport`.
fn launch_spec(
    subject: &Subject,
    template: Option<&Result<TemplateMetadata, TemplateError>>,
    transport: TransportKind,
) -> Result<LaunchSpec, String> {
    match subject {
        Subject::Template(t) => {
            let metadata = match template {
                Some(Ok(metadata)) => metadata,
                Some(Err(e)) => return Err(format!("template metadata unavailable: {e}")),
                None => return Err("template metadata unavailable".to_string()),
            };
            let image = metadata
                .image_ref()
                .ok_or_else(|| "no image configured".to_string())?;
            Ok(LaunchSpec {
                image,
                args: Vec::new(),
                env: metadata.launch_env(&t.config, transport),
                transport,
                container_port: metadata.container_port(),
                endpoint: metadata.endpoint().to_string(),
                name_hint: t.template_id.clone(),
                ready_timeout: None,
            })
        }
        Subject::Image(i) => Ok(LaunchSpec {
            image: i.image.clone(),
            args: i.args.clone(),
            env: i.env.clone(),
            transport,
            container_port: i.port,
            endpoint: DEFAULT_HTTP_ENDPOINT.to_string(),
            name_hint: image_name_hint(&i.image),
            ready_timeout: None,
        }),
        Subject::Running(_) => Err("running instances are probed in place".to_string()),
    }
}

/// `ghcr.io/acme/files:1.0` → `files`
fn image_name_hint(image: &str) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    let last = last.split('@').next().unwrap_or(last);
    last.split(':').next().unwrap_or(last).to_string()
}
