//! Error types for Prospector discovery operations.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fingerprint::Fingerprint;
use crate::model::StrategyKind;

/// Main error type for Prospector setup and maintenance operations.
///
/// Discovery itself never returns this: a discovery call either produces a
/// result or a [`DiscoveryError`].
#[derive(Error, Debug)]
pub enum ProspectorError {
    /// Invalid value in a named config section
    #[error("invalid config for '{0}': {1}")]
    InvalidConfig(String, String),

    /// Config file could not be read or parsed
    #[error("failed to load config {0}: {1}")]
    ConfigLoad(String, String),

    /// Template metadata could not be loaded
    #[error(transparent)]
    Template(#[from] crate::template::TemplateError),

    /// Discovery cache storage failed
    #[error(transparent)]
    Cache(#[from] crate::cache::CacheError),

    /// Fingerprint string is not in `<class>-<sha256 hex>` form
    #[error("invalid fingerprint '{0}'")]
    InvalidFingerprint(String),
}

/// Result type alias for Prospector operations
pub type Result<T> = std::result::Result<T, ProspectorError>;

/// Why a single strategy attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// No answer within the per-strategy timeout
    Timeout,
    /// Response was not valid JSON or not a valid tool listing
    MalformedResponse,
    /// Response id did not match the outstanding request
    Desync,
    /// The server process exited before answering
    ProcessExited { exit_code: Option<i32> },
    /// The ephemeral instance could not be started at all
    StartupFailure,
    /// Nothing was listening at the target address
    ConnectionRefused,
    /// The server answered with a protocol or HTTP error
    ServerError,
    /// Bundled template metadata was missing or unreadable
    MetadataUnavailable,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Timeout => f.write_str("timeout"),
            FailureKind::MalformedResponse => f.write_str("malformed response"),
            FailureKind::Desync => f.write_str("response desync"),
            FailureKind::ProcessExited {
                exit_code: Some(code),
            } => write!(f, "process exited with code {code}"),
            FailureKind::ProcessExited { exit_code: None } => f.write_str("process exited"),
            FailureKind::StartupFailure => f.write_str("startup failure"),
            FailureKind::ConnectionRefused => f.write_str("connection refused"),
            FailureKind::ServerError => f.write_str("server error"),
            FailureKind::MetadataUnavailable => f.write_str("metadata unavailable"),
        }
    }
}

/// One failed strategy attempt. Always recoverable: the coordinator moves on
/// to the next strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyFailure {
    pub strategy: StrategyKind,
    pub failure: FailureKind,
    pub message: String,
}

impl StrategyFailure {
    pub fn new(strategy: StrategyKind, failure: FailureKind, message: impl Into<String>) -> Self {
        Self {
            strategy,
            failure,
            message: message.into(),
        }
    }
}

impl fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.strategy, self.failure, self.message)
    }
}

/// Every applicable strategy failed.
///
/// Failures are kept in attempt order, one per attempted strategy.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("tool discovery failed for {fingerprint}: {}", summarize(.failures))]
pub struct DiscoveryError {
    pub fingerprint: Fingerprint,
    pub failures: Vec<StrategyFailure>,
}

impl DiscoveryError {
    pub fn attempted(&self) -> Vec<StrategyKind> {
        self.failures.iter().map(|f| f.strategy).collect()
    }
}

fn summarize(failures: &[StrategyFailure]) -> String {
    if failures.is_empty() {
        return "no applicable strategies".to_string();
    }
    failures
        .iter()
        .enumerate()
        .map(|(i, failure)| format!("[{}] {}", i + 1, failure))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_display() {
        let err = ProspectorError::InvalidConfig(
            "discovery".to_string(),
            "timeout_per_strategy_secs must be > 0".to_string(),
        );
        assert_eq!(
            err.to_string(),
            "invalid config for 'discovery': timeout_per_strategy_secs must be > 0"
        );
    }

    #[test]
    fn test_strategy_failure_display() {
        let failure = StrategyFailure::new(
            StrategyKind::StdioEphemeral,
            FailureKind::ProcessExited { exit_code: Some(125) },
            "image pull failed",
        );
        assert_eq!(
            failure.to_string(),
            "stdio-ephemeral: process exited with code 125: image pull failed"
        );
    }

    #[test]
    fn test_discovery_error_lists_failures_in_order() {
        let err = DiscoveryError {
            fingerprint: Fingerprint::for_test("template"),
            failures: vec![
                StrategyFailure::new(
                    StrategyKind::StdioEphemeral,
                    FailureKind::StartupFailure,
                    "no image configured",
                ),
                StrategyFailure::new(
                    StrategyKind::Static,
                    FailureKind::MetadataUnavailable,
                    "no tools",
                ),
            ],
        };
        let message = err.to_string();
        let stdio_at = message.find("[1] stdio-ephemeral").unwrap();
        let static_at = message.find("[2] static").unwrap();
        assert!(stdio_at < static_at);
        assert_eq!(
            err.attempted(),
            vec![StrategyKind::StdioEphemeral, StrategyKind::Static]
        );
    }

    #[test]
    fn test_failure_kind_serialization() {
        let json = serde_json::to_value(FailureKind::ProcessExited { exit_code: Some(1) }).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "process_exited", "exit_code": 1}));
        let timeout = serde_json::to_value(FailureKind::Timeout).unwrap();
        assert_eq!(timeout, serde_json::json!({"kind": "timeout"}));
    }
}
