//! Plugin setup and teardown.
//!
//! Setup runs forward through the resolved order. When a plugin fails, the
//! plugins that already finished setup are torn down in reverse before the
//! failure is returned, so nothing initialized is left behind.

use std::sync::Arc;

use tracing::{info, warn};

use super::registry::PluginRegistry;
use super::types::{Plugin, PluginState};
use crate::error::{Error, PluginFailure, Result};

/// Drives plugin setup/teardown and records which plugins are live.
#[derive(Default)]
pub struct LifecycleManager {
    /// Plugins whose setup completed, in setup order.
    active: Vec<Arc<dyn Plugin>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the plugins currently set up, in setup order.
    pub fn active(&self) -> Vec<&str> {
        self.active.iter().map(|p| p.name()).collect()
    }

    /// Set plugins up one at a time, in the given order.
    ///
    /// On failure the failing plugin is marked `Failed`, every plugin set up
    /// before it is torn down in reverse, and the original error is returned
    /// together with any teardown failures from that rollback.
    pub async fn setup(
        &mut self,
        registry: &mut PluginRegistry,
        ordered: &[Arc<dyn Plugin>],
    ) -> Result<()> {
        for plugin in ordered {
            let name = plugin.name().to_string();
            registry.set_state(&name, PluginState::Initializing);

            match plugin.setup().await {
                Ok(()) => {
                    registry.set_state(&name, PluginState::Active);
                    info!(plugin = %name, "plugin set up");
                    self.active.push(Arc::clone(plugin));
                }
                Err(cause) => {
                    registry.set_state(&name, PluginState::Failed);
                    warn!(plugin = %name, error = %cause, "plugin setup failed, rolling back");
                    let teardown_failures = self.teardown_active(registry).await;
                    return Err(Error::PluginSetupFailed {
                        plugin: name,
                        cause,
                        teardown_failures,
                    });
                }
            }
        }
        Ok(())
    }

    /// Tear down every live plugin in reverse setup order.
    ///
    /// A failing teardown does not stop the remaining ones; all failures are
    /// returned together.
    pub async fn teardown(&mut self, registry: &mut PluginRegistry) -> Result<()> {
        let failures = self.teardown_active(registry).await;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::PluginTeardownFailed { failures })
        }
    }

    async fn teardown_active(&mut self, registry: &mut PluginRegistry) -> Vec<PluginFailure> {
        let mut failures = Vec::new();
        while let Some(plugin) = self.active.pop() {
            let name = plugin.name().to_string();
            match plugin.teardown().await {
                Ok(()) => {
                    registry.set_state(&name, PluginState::TornDown);
                    info!(plugin = %name, "plugin torn down");
                }
                Err(cause) => {
                    registry.set_state(&name, PluginState::Failed);
                    warn!(plugin = %name, error = %cause, "plugin teardown failed");
                    failures.push(PluginFailure {
                        plugin: name,
                        cause,
                    });
                }
            }
        }
        failures
    }
}
