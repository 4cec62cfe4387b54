//! Template metadata: the declared shape of a deployable server template.
//!
//! Templates are read-only here. A [`TemplateSource`] resolves a template id
//! to its parsed `template.json`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use serde::Deserialize;
use thiserror::Error;

use crate::config::TransportKind;
use crate::model::{DEFAULT_HTTP_ENDPOINT, DEFAULT_HTTP_PORT};

/// File name of the metadata document inside a template directory.
pub const TEMPLATE_FILE: &str = "template.json";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template '{0}' not found")]
    NotFound(String),

    #[error("invalid template id '{0}'")]
    InvalidId(String),

    #[error("template '{0}' metadata is invalid: {1}")]
    Invalid(String, String),

    #[error("failed to read template '{0}': {1}")]
    Io(String, String),
}

/// Parsed `template.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateMetadata {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub docker_image: Option<String>,
    #[serde(default)]
    pub docker_tag: Option<String>,
    #[serde(default)]
    pub transport: Option<TransportSpec>,
    /// HTTP path the server answers on, default `/mcp`
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub config_schema: Option<ConfigSchema>,
    /// Declared tool list. `None` means the template bundles no tool metadata.
    #[serde(default)]
    pub tools: Option<Vec<TemplateTool>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransportSpec {
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub supported: Vec<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigSchema {
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PropertySchema {
    #[serde(default)]
    pub env_mapping: Option<String>,
    #[serde(default)]
    pub secret: bool,
    #[serde(default)]
    pub sensitive: bool,
}

impl PropertySchema {
    pub fn is_secret(&self) -> bool {
        self.secret || self.sensitive
    }
}

/// One tool as declared in template metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema", alias = "input_schema")]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub category: Option<String>,
}

impl TemplateMetadata {
    /// Whether the template can be launched over `kind`.
    ///
    /// No transport block, or one that lists nothing, means every transport.
    pub fn supports(&self, kind: TransportKind) -> bool {
        let Some(transport) = &self.transport else {
            return true;
        };
        if transport.supported.is_empty() {
            return match &transport.default {
                Some(default) => default.eq_ignore_ascii_case(kind.as_str()),
                None => true,
            };
        }
        transport
            .supported
            .iter()
            .any(|t| t.eq_ignore_ascii_case(kind.as_str()))
    }

    /// Full image reference, with the tag applied when the image has none.
    pub fn image_ref(&self) -> Option<String> {
        let image = self.docker_image.as_deref()?.trim();
        if image.is_empty() {
            return None;
        }
        let last_segment = image.rsplit('/').next().unwrap_or(image);
        match self.docker_tag.as_deref().map(str::trim) {
            Some(tag) if !tag.is_empty() && !last_segment.contains(':') && !image.contains('@') => {
                Some(format!("{image}:{tag}"))
            }
            _ => Some(image.to_string()),
        }
    }

    pub fn container_port(&self) -> u16 {
        self.transport
            .as_ref()
            .and_then(|t| t.port)
            .unwrap_or(DEFAULT_HTTP_PORT)
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(DEFAULT_HTTP_ENDPOINT)
    }

    /// Environment for launching this template over `transport`.
    ///
    /// Config keys go through their `env_mapping`; unmapped keys are
    /// upper-cased.
    pub fn launch_env(
        &self,
        config: &BTreeMap<String, String>,
        transport: TransportKind,
    ) -> BTreeMap<String, String> {
        let properties = self.config_schema.as_ref().map(|s| &s.properties);
        let mut env: BTreeMap<String, String> = config
            .iter()
            .map(|(key, value)| {
                let name = properties
                    .and_then(|p| p.get(key))
                    .and_then(|p| p.env_mapping.clone())
                    .unwrap_or_else(|| key.to_uppercase());
                (name, value.clone())
            })
            .collect();
        env.insert("MCP_TRANSPORT".to_string(), transport.as_str().to_string());
        env.insert("MCP_PORT".to_string(), self.container_port().to_string());
        env
    }
}

/// Resolves template ids to metadata.
pub trait TemplateSource: Send + Sync {
    fn load<'a>(
        &'a self,
        template_id: &'a str,
    ) -> BoxFuture<'a, Result<TemplateMetadata, TemplateError>>;
}

/// Templates laid out as `<root>/<id>/template.json`.
#[derive(Debug, Clone)]
pub struct DirectoryTemplates {
    root: PathBuf,
}

impl DirectoryTemplates {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn validate_id(template_id: &str) -> Result<(), TemplateError> {
    let invalid = template_id.trim().is_empty()
        || template_id.contains(['/', '\\'])
        || template_id == "."
        || template_id == "..";
    if invalid {
        return Err(TemplateError::InvalidId(template_id.to_string()));
    }
    Ok(())
}

impl TemplateSource for DirectoryTemplates {
    fn load<'a>(
        &'a self,
        template_id: &'a str,
    ) -> BoxFuture<'a, Result<TemplateMetadata, TemplateError>> {
        Box::pin(async move {
            validate_id(template_id)?;
            let path = self.root.join(template_id).join(TEMPLATE_FILE);
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(TemplateError::NotFound(template_id.to_string()));
                }
                Err(e) => return Err(TemplateError::Io(template_id.to_string(), e.to_string())),
            };
            serde_json::from_str(&content)
                .map_err(|e| TemplateError::Invalid(template_id.to_string(), e.to_string()))
        })
    }
}

/// In-memory templates keyed by id.
#[derive(Debug, Clone, Default)]
pub struct MemoryTemplates {
    templates: HashMap<String, TemplateMetadata>,
}

impl MemoryTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, template_id: impl Into<String>, metadata: TemplateMetadata) -> Self {
        self.insert(template_id, metadata);
        self
    }

    pub fn insert(&mut self, template_id: impl Into<String>, metadata: TemplateMetadata) {
        self.templates.insert(template_id.into(), metadata);
    }
}

impl TemplateSource for MemoryTemplates {
    fn load<'a>(
        &'a self,
        template_id: &'a str,
    ) -> BoxFuture<'a, Result<TemplateMetadata, TemplateError>> {
        Box::pin(async move {
            validate_id(template_id)?;
            self.templates
                .get(template_id)
                .cloned()
                .ok_or_else(|| TemplateError::NotFound(template_id.to_string()))
        })
    }
}
