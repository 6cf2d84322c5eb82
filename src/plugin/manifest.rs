//! Plugin manifests: a TOML list of plugin declarations.
//!
//! ```toml
//! [[plugins]]
//! name = "tenant"
//! version = "1.0.0"
//! kind = "transformer"
//! dependencies = ["auth"]
//! ```
//!
//! A manifest lets a dependency set be checked without building the plugins.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::types::{DeclaredPlugin, Plugin, PluginMetadata};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginManifest {
    #[serde(default)]
    pub plugins: Vec<PluginMetadata>,
}

impl PluginManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plugin manifest: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid plugin manifest: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Every declaration, in file order, as a metadata-only plugin ready for
    /// [`Runtime::initialize`](crate::Runtime::initialize).
    pub fn into_plugins(self) -> Vec<Arc<dyn Plugin>> {
        self.plugins
            .into_iter()
            .map(|meta| Arc::new(DeclaredPlugin::new(meta)) as Arc<dyn Plugin>)
            .collect()
    }
}
