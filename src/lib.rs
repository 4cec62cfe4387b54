//! Prospector: MCP tool discovery engine
//! Works out which tools an MCP server exposes: probes running instances,
//! launches throwaway containers over STDIO or HTTP, falls back to template
//! metadata, and caches results under a content fingerprint.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fingerprint;
pub mod model;
pub mod runtime;
pub mod static_metadata;
pub mod template;
pub mod transport;

#[cfg(test)]
mod testing;

pub use cache::{CacheEntry, CacheError, DiscoveryCache, FileCache, MemoryCache};
pub use config::{ProspectorConfig, TransportKind};
pub use coordinator::{DiscoveryOptions, Strategy, ToolDiscovery, strategies_for};
pub use error::{DiscoveryError, FailureKind, ProspectorError, Result, StrategyFailure};
pub use fingerprint::{Fingerprint, fingerprint};
pub use model::{
    DiscoveryResult, ImageSubject, LiveAddress, StrategyKind, Subject, SubjectClass,
    TemplateSubject, ToolDescriptor,
};
pub use runtime::docker::DockerRuntime;
pub use runtime::{ContainerRuntime, EphemeralRuntimeHandle, LaunchSpec, RuntimeError};
pub use template::{DirectoryTemplates, MemoryTemplates, TemplateMetadata, TemplateSource};
pub use transport::ProtocolError;
pub use transport::http::HttpProbe;
pub use transport::stdio::{StdioHandle, StdioPipes};
