//! Core discovery data model: tool descriptors, discovery subjects, and results.
//!
//! Everything here is plain data. Subjects are built once per discovery call and
//! never mutated; applying configuration overrides produces a new subject.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StrategyFailure;
use crate::fingerprint::Fingerprint;
use crate::transport::stdio::StdioHandle;

/// Container port probed by the HTTP strategy when nothing else is declared.
pub const DEFAULT_HTTP_PORT: u16 = 7071;

/// Path appended to an ephemeral instance's address for the HTTP strategy.
pub const DEFAULT_HTTP_ENDPOINT: &str = "/mcp";

/// One discoverable operation exposed by a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// The discovery method that produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Served from the discovery cache without running any strategy.
    Cached,
    /// Live protocol exchange over an already-running instance's stdio.
    #[serde(rename = "protocol-stdio")]
    LiveStdio,
    /// Live protocol exchange against an already-running instance's URL.
    #[serde(rename = "protocol-http")]
    LiveHttp,
    /// Protocol exchange over stdio with a throwaway container.
    StdioEphemeral,
    /// Protocol exchange over HTTP with a throwaway container.
    HttpEphemeral,
    /// Tool list declared in the template's bundled metadata.
    Static,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Cached => "cached",
            StrategyKind::LiveStdio => "protocol-stdio",
            StrategyKind::LiveHttp => "protocol-http",
            StrategyKind::StdioEphemeral => "stdio-ephemeral",
            StrategyKind::HttpEphemeral => "http-ephemeral",
            StrategyKind::Static => "static",
        }
    }

    /// True for strategies that talked to a live server.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            StrategyKind::LiveStdio
                | StrategyKind::LiveHttp
                | StrategyKind::StdioEphemeral
                | StrategyKind::HttpEphemeral
        )
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of one successful discovery.
///
/// Tool order is the order the source reported them in. An empty tool list is a
/// valid result ("no capabilities"), not a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResult {
    pub tools: Vec<ToolDescriptor>,
    pub strategy_used: StrategyKind,
    pub discovered_at: DateTime<Utc>,
    pub subject_fingerprint: Fingerprint,
    /// Failures of strategies attempted before the one that succeeded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<StrategyFailure>,
    /// Original strategy of a result served from the cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_from: Option<StrategyKind>,
}

impl DiscoveryResult {
    /// The strategy that actually produced the tools, looking through the cache.
    pub fn origin(&self) -> StrategyKind {
        self.cached_from.unwrap_or(self.strategy_used)
    }

    /// True when the tools did not come from a live protocol exchange.
    pub fn is_fallback(&self) -> bool {
        !self.origin().is_live()
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }
}

/// Address of an instance that is already running and owned by the caller.
#[derive(Debug, Clone)]
pub enum LiveAddress {
    /// Base URL of an HTTP-transport server (e.g. `http://localhost:7071/mcp`).
    Http { base_url: String },
    /// Connected standard streams of a stdio-transport server.
    Stdio(StdioHandle),
}

/// A template plus its fully resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSubject {
    pub template_id: String,
    pub config: BTreeMap<String, String>,
}

/// A bare container image plus invocation arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSubject {
    pub image: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Container port the server listens on when started for HTTP.
    pub port: u16,
}

/// What is being probed. Exactly one form per discovery call.
#[derive(Debug, Clone)]
pub enum Subject {
    Running(LiveAddress),
    Template(TemplateSubject),
    Image(ImageSubject),
}

/// Coarse subject category, used as the fingerprint and cache-entry prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectClass {
    Template,
    Image,
    Live,
}

impl SubjectClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectClass::Template => "template",
            SubjectClass::Image => "image",
            SubjectClass::Live => "live",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "template" => Some(SubjectClass::Template),
            "image" => Some(SubjectClass::Image),
            "live" => Some(SubjectClass::Live),
            _ => None,
        }
    }
}

impl fmt::Display for SubjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Subject {
    pub fn template(
        template_id: impl Into<String>,
        config: BTreeMap<String, String>,
    ) -> Self {
        Subject::Template(TemplateSubject {
            template_id: template_id.into(),
            config,
        })
    }

    pub fn image(image: impl Into<String>, args: Vec<String>) -> Self {
        Subject::Image(ImageSubject {
            image: image.into(),
            args,
            env: BTreeMap::new(),
            port: DEFAULT_HTTP_PORT,
        })
    }

    pub fn http(base_url: impl Into<String>) -> Self {
        Subject::Running(LiveAddress::Http {
            base_url: base_url.into(),
        })
    }

    pub fn stdio(handle: StdioHandle) -> Self {
        Subject::Running(LiveAddress::Stdio(handle))
    }

    pub fn class(&self) -> SubjectClass {
        match self {
            Subject::Running(_) => SubjectClass::Live,
            Subject::Template(_) => SubjectClass::Template,
            Subject::Image(_) => SubjectClass::Image,
        }
    }

    /// Return a copy with `overrides` merged into the subject's configuration.
    ///
    /// Overrides land in the template config map or the image environment.
    /// Running instances have no configuration, so they come back unchanged.
    pub fn with_overrides(&self, overrides: &BTreeMap<String, String>) -> Subject {
        match self {
            Subject::Template(t) => {
                let mut config = t.config.clone();
                config.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
                Subject::Template(TemplateSubject {
                    template_id: t.template_id.clone(),
                    config,
                })
            }
            Subject::Image(i) => {
                let mut env = i.env.clone();
                env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
                Subject::Image(ImageSubject {
                    env,
                    ..i.clone()
                })
            }
            Subject::Running(_) => self.clone(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Running(LiveAddress::Http { base_url }) => {
                write!(f, "running instance at {base_url}")
            }
            Subject::Running(LiveAddress::Stdio(handle)) => {
                write!(f, "running stdio instance '{}'", handle.label())
            }
            Subject::Template(t) => write!(f, "template '{}'", t.template_id),
            Subject::Image(i) => write!(f, "image '{}'", i.image),
        }
    }
}
