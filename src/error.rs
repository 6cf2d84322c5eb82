//! Error types shared by every qpipe component.
//!
//! Plugins, drivers and connectors are external code and report failures
//! through `anyhow`. The core wraps those failures into [`Error`] variants that
//! carry the plugin or driver name, so callers can match on them instead of
//! parsing messages.

use std::fmt;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Pipeline phase a plugin hook ran in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Validate,
    BeforeQuery,
    AfterQuery,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Validate => write!(f, "validate"),
            Phase::BeforeQuery => write!(f, "before"),
            Phase::AfterQuery => write!(f, "after"),
        }
    }
}

/// A single plugin's failure during setup or teardown.
#[derive(Debug)]
pub struct PluginFailure {
    pub plugin: String,
    pub cause: anyhow::Error,
}

impl fmt::Display for PluginFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.plugin, self.cause)
    }
}

/// One validator's reason for refusing a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub plugin: String,
    pub reason: String,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.plugin, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("plugin '{name}' is already registered")]
    DuplicatePlugin { name: String },

    /// `path` starts and ends with the same plugin name.
    #[error("cyclic plugin dependency: {}", .path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("plugin '{plugin}' depends on '{dependency}', which is not registered")]
    MissingDependency { plugin: String, dependency: String },

    #[error("setup of plugin '{plugin}' failed: {cause:#}{}", list_failures(.teardown_failures))]
    PluginSetupFailed {
        plugin: String,
        #[source]
        cause: anyhow::Error,
        /// Failures collected while rolling back plugins that were already set up.
        teardown_failures: Vec<PluginFailure>,
    },

    #[error("teardown failed for {} plugin(s){}", .failures.len(), list_failures(.failures))]
    PluginTeardownFailed { failures: Vec<PluginFailure> },

    #[error("query on '{target}' is not well formed")]
    MalformedQuery { target: String },

    #[error("query rejected by {}", list_rejections(.rejections))]
    ValidationRejected { rejections: Vec<Rejection> },

    #[error("plugin '{plugin}' failed in {phase} phase: {cause:#}")]
    TransformFailed {
        plugin: String,
        phase: Phase,
        #[source]
        cause: anyhow::Error,
    },

    #[error("connection pool limit reached for driver '{driver}'")]
    PoolLimitReached { driver: String },

    #[error("driver '{driver}' was closed while waiting for a connection")]
    DriverClosed { driver: String },

    #[error("failed to open connection for driver '{driver}': {cause:#}")]
    ConnectFailed {
        driver: String,
        #[source]
        cause: anyhow::Error,
    },

    #[error("driver '{driver}' failed: {cause:#}")]
    DriverExecutionFailed {
        driver: String,
        #[source]
        cause: anyhow::Error,
    },

    #[error("no driver registered under '{driver}'")]
    UnknownDriver { driver: String },

    #[error("runtime is not initialized")]
    NotInitialized,

    #[error("runtime is already initialized")]
    AlreadyInitialized,

    #[error("configuration error: {0:#}")]
    Config(#[source] anyhow::Error),
}

impl Error {
    /// Name of the plugin the error is attributed to, if any.
    pub fn plugin(&self) -> Option<&str> {
        match self {
            Error::DuplicatePlugin { name } => Some(name),
            Error::MissingDependency { plugin, .. }
            | Error::PluginSetupFailed { plugin, .. }
            | Error::TransformFailed { plugin, .. } => Some(plugin),
            Error::ValidationRejected { rejections } => {
                rejections.first().map(|r| r.plugin.as_str())
            }
            _ => None,
        }
    }
}

fn list_failures(failures: &[PluginFailure]) -> String {
    if failures.is_empty() {
        return String::new();
    }
    let items: Vec<String> = failures.iter().map(|f| f.to_string()).collect();
    format!(" (teardown: {})", items.join("; "))
}

fn list_rejections(rejections: &[Rejection]) -> String {
    let items: Vec<String> = rejections.iter().map(|r| r.to_string()).collect();
    items.join("; ")
}
