/// Plugin traits and metadata.
///
/// A plugin is an already-instantiated object implementing [`Plugin`]. It
/// always carries identity metadata and may expose any subset of the query
/// capabilities through the `as_*` accessors, so the pipeline knows which
/// hooks to call without inspecting concrete types.
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::query::{QueryDescriptor, Rows};

/// Processing role of a plugin. Informational; capabilities decide behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginKind {
    Validator,
    Transformer,
    DriverAdapter,
    #[default]
    Extension,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginKind::Validator => write!(f, "validator"),
            PluginKind::Transformer => write!(f, "transformer"),
            PluginKind::DriverAdapter => write!(f, "driver-adapter"),
            PluginKind::Extension => write!(f, "extension"),
        }
    }
}

/// Identity metadata every plugin must provide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub kind: PluginKind,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>, kind: PluginKind) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            kind,
            dependencies: Vec::new(),
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }
}

/// Lifecycle state tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Registered,
    Initializing,
    Active,
    Failed,
    TornDown,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginState::Registered => write!(f, "registered"),
            PluginState::Initializing => write!(f, "initializing"),
            PluginState::Active => write!(f, "active"),
            PluginState::Failed => write!(f, "failed"),
            PluginState::TornDown => write!(f, "torn-down"),
        }
    }
}

/// Verdict of a validation hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(String),
}

/// Trait that all runtime plugins implement.
///
/// `setup` and `teardown` default to no-ops. Query capabilities are opt-in:
/// return `Some(self)` from the matching accessor.
///
/// # Example
///
/// ```ignore
/// struct TenantFilter { meta: PluginMetadata }
///
/// #[async_trait]
/// impl Plugin for TenantFilter {
///     fn metadata(&self) -> &PluginMetadata { &self.meta }
///     fn as_transformer(&self) -> Option<&dyn QueryTransformer> { Some(self) }
/// }
///
/// #[async_trait]
/// impl QueryTransformer for TenantFilter {
///     async fn before_query(&self, query: QueryDescriptor) -> Result<QueryDescriptor> {
///         Ok(query.with_filter(Predicate::eq("tenant", "acme")))
///     }
/// }
/// ```
#[async_trait]
pub trait Plugin: Send + Sync {
    fn metadata(&self) -> &PluginMetadata;

    fn name(&self) -> &str {
        &self.metadata().name
    }

    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        Ok(())
    }

    fn as_validator(&self) -> Option<&dyn QueryValidator> {
        None
    }

    fn as_transformer(&self) -> Option<&dyn QueryTransformer> {
        None
    }
}

/// Capability: accept or reject a query before it reaches the driver.
#[async_trait]
pub trait QueryValidator: Send + Sync {
    async fn validate(&self, query: &QueryDescriptor) -> Result<Verdict>;
}

/// Capability: rewrite the query on the way in and the rows on the way out.
///
/// Both hooks default to passing their input through unchanged, so a
/// transformer only implements the side it cares about.
#[async_trait]
pub trait QueryTransformer: Send + Sync {
    async fn before_query(&self, query: QueryDescriptor) -> Result<QueryDescriptor> {
        Ok(query)
    }

    async fn after_query(&self, rows: Rows) -> Result<Rows> {
        Ok(rows)
    }
}

/// A plugin that only declares metadata. Used when checking a dependency set
/// loaded from a manifest without instantiating the real plugins.
#[derive(Debug, Clone)]
pub struct DeclaredPlugin {
    meta: PluginMetadata,
}

impl DeclaredPlugin {
    pub fn new(meta: PluginMetadata) -> Self {
        Self { meta }
    }
}

#[async_trait]
impl Plugin for DeclaredPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.meta
    }
}
