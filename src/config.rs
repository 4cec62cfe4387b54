//! Prospector configuration: deserialization and validation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProspectorError;

/// Supported MCP transport types.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level Prospector configuration, parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProspectorConfig {
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub runtime: RuntimeSection,
}

/// `[discovery]`: strategy timeouts, cache, and template location.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySection {
    /// Wall-clock budget for each strategy attempt, default 10s
    #[serde(default = "default_timeout_per_strategy_secs")]
    pub timeout_per_strategy_secs: u64,
    /// Lifetime of a cached discovery result, default 5 minutes
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Cache directory. Defaults to `<user cache dir>/prospector/tools`.
    pub cache_dir: Option<PathBuf>,
    /// Directory holding one `<id>/template.json` per template.
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,
}

/// `[runtime]`: the container CLI used for ephemeral instances.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSection {
    /// Docker-compatible CLI binary (e.g., "docker", "podman")
    #[serde(default = "default_runtime_binary")]
    pub binary: String,
    /// Upper bound for `rm -f` during teardown
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Upper bound for detached `run` and `port` lookups
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

fn default_timeout_per_strategy_secs() -> u64 {
    10
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("templates")
}

fn default_runtime_binary() -> String {
    "docker".to_string()
}

fn default_stop_timeout_secs() -> u64 {
    10
}

fn default_startup_timeout_secs() -> u64 {
    60
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            timeout_per_strategy_secs: default_timeout_per_strategy_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_dir: None,
            templates_dir: default_templates_dir(),
        }
    }
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            binary: default_runtime_binary(),
            stop_timeout_secs: default_stop_timeout_secs(),
            startup_timeout_secs: default_startup_timeout_secs(),
        }
    }
}

impl DiscoverySection {
    pub fn timeout_per_strategy(&self) -> Duration {
        Duration::from_secs(self.timeout_per_strategy_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Configured cache directory, or the per-user default.
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }
}

impl RuntimeSection {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

/// `<user cache dir>/prospector/tools`, or a temp-dir fallback when the
/// platform reports no cache directory.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("prospector").join("tools"))
        .unwrap_or_else(|| std::env::temp_dir().join("prospector-tools"))
}

impl ProspectorConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let config: ProspectorConfig = toml::from_str(content)
            .map_err(|e| ProspectorError::ConfigLoad("<inline>".to_string(), e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a config file.
    pub async fn load(path: &Path) -> crate::Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ProspectorError::ConfigLoad(path.display().to_string(), e.to_string()))?;
        let config: ProspectorConfig = toml::from_str(&content)
            .map_err(|e| ProspectorError::ConfigLoad(path.display().to_string(), e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the config, failing fast before any discovery runs.
    pub fn validate(&self) -> crate::Result<()> {
        // 1. Discovery budgets must be non-zero
        if self.discovery.timeout_per_strategy_secs == 0 {
            return Err(ProspectorError::InvalidConfig(
                "discovery".to_string(),
                "timeout_per_strategy_secs must be > 0".to_string(),
            ));
        }
        if self.discovery.cache_ttl_secs == 0 {
            return Err(ProspectorError::InvalidConfig(
                "discovery".to_string(),
                "cache_ttl_secs must be > 0".to_string(),
            ));
        }

        // 2. Runtime binary must be a bare command, not a shell snippet
        let binary = self.runtime.binary.trim();
        if binary.is_empty() {
            return Err(ProspectorError::InvalidConfig(
                "runtime".to_string(),
                "binary must be non-empty".to_string(),
            ));
        }
        if binary.contains(char::is_whitespace) {
            return Err(ProspectorError::InvalidConfig(
                "runtime".to_string(),
                format!("binary '{}' must be a single executable, not a command line", binary),
            ));
        }

        // 3. Runtime timeouts must be non-zero
        if self.runtime.stop_timeout_secs == 0 {
            return Err(ProspectorError::InvalidConfig(
                "runtime".to_string(),
                "stop_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.runtime.startup_timeout_secs == 0 {
            return Err(ProspectorError::InvalidConfig(
                "runtime".to_string(),
                "startup_timeout_secs must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_toml(toml_str: &str) -> ProspectorConfig {
        toml::from_str(toml_str).expect("valid TOML")
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_toml("");
        assert!(config.validate().is_ok());
        assert_eq!(config.discovery.timeout_per_strategy(), Duration::from_secs(10));
        assert_eq!(config.discovery.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.discovery.templates_dir, PathBuf::from("templates"));
        assert_eq!(config.runtime.binary, "docker");
        assert_eq!(config.runtime.stop_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_full_config() {
        let config = parse_toml(
            r#"
            [discovery]
            timeout_per_strategy_secs = 20
            cache_ttl_secs = 60
            cache_dir = "/var/cache/prospector"
            templates_dir = "/srv/templates"

            [runtime]
            binary = "podman"
            stop_timeout_secs = 5
            startup_timeout_secs = 90
            "#,
        );
        assert!(config.validate().is_ok());
        assert_eq!(
            config.discovery.resolved_cache_dir(),
            PathBuf::from("/var/cache/prospector")
        );
        assert_eq!(config.runtime.binary, "podman");
        assert_eq!(config.runtime.startup_timeout(), Duration::from_secs(90));
    }

    #[test]
    fn test_zero_strategy_timeout_rejected() {
        let config = parse_toml(
            r#"
            [discovery]
            timeout_per_strategy_secs = 0
            "#,
        );
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ProspectorError::InvalidConfig(section, msg))
                if section == "discovery" && msg.contains("timeout_per_strategy_secs")
        ));
    }

    #[test]
    fn test_zero_cache_ttl_rejected() {
        let config = parse_toml(
            r#"
            [discovery]
            cache_ttl_secs = 0
            "#,
        );
        assert!(matches!(
            config.validate(),
            Err(ProspectorError::InvalidConfig(_, msg)) if msg.contains("cache_ttl_secs")
        ));
    }

    #[test]
    fn test_runtime_binary_with_arguments_rejected() {
        let config = parse_toml(
            r#"
            [runtime]
            binary = "sudo docker"
            "#,
        );
        assert!(matches!(
            config.validate(),
            Err(ProspectorError::InvalidConfig(section, _)) if section == "runtime"
        ));
    }

    #[test]
    fn test_empty_runtime_binary_rejected() {
        let config = parse_toml(
            r#"
            [runtime]
            binary = ""
            "#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_str_reports_parse_errors() {
        let result = ProspectorConfig::from_toml_str("[discovery\n");
        assert!(matches!(result, Err(ProspectorError::ConfigLoad(_, _))));
    }

    #[test]
    fn test_transport_kind_lowercase() {
        let kind: TransportKind = serde_json::from_str("\"stdio\"").unwrap();
        assert_eq!(kind, TransportKind::Stdio);
        assert_eq!(TransportKind::Http.to_string(), "http");
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prospector.toml");
        std::fs::write(&path, "[runtime]\nbinary = \"podman\"\n").unwrap();
        let config = ProspectorConfig::load(&path).await.unwrap();
        assert_eq!(config.runtime.binary, "podman");
    }
}
