//! Runtime facade: plugins, pool and pipeline behind one
//! `initialize` / `execute` / `shutdown` surface.
//!
//! Each runtime owns its own registry and pool. Nothing is global, so several
//! runtimes can live side by side in one process.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::plugin::{LifecycleManager, Plugin, PluginRegistry, PluginState};
use crate::pool::{ConnectionPool, Connector, NoopConnector, PoolStats};
use crate::query::{Driver, QueryDescriptor, QueryOutcome, QueryPipeline};

pub struct Runtime {
    config: RuntimeConfig,
    registry: PluginRegistry,
    lifecycle: LifecycleManager,
    pool: ConnectionPool,
    pipeline: QueryPipeline,
    drivers: HashMap<String, Arc<dyn Driver>>,
    /// Plugins in resolved order; empty until initialized.
    plugins: Vec<Arc<dyn Plugin>>,
    initialized: bool,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_connector(config, Arc::new(NoopConnector))
    }

    pub fn with_connector(config: RuntimeConfig, connector: Arc<dyn Connector>) -> Self {
        let pool = ConnectionPool::with_connector(
            config.pool.limits(),
            connector,
            config.pool.acquire_timeout(),
        );
        let pipeline = QueryPipeline::new(config.pipeline.validation);
        Self {
            config,
            registry: PluginRegistry::new(),
            lifecycle: LifecycleManager::new(),
            pool,
            pipeline,
            drivers: HashMap::new(),
            plugins: Vec::new(),
            initialized: false,
        }
    }

    /// Make a driver available under `name`. The name is also the pool key.
    pub fn register_driver(&mut self, name: impl Into<String>, driver: Arc<dyn Driver>) {
        self.drivers.insert(name.into(), driver);
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Register, resolve and set up `plugins`.
    ///
    /// Nothing is kept usable on failure: a registration or resolution error
    /// leaves the runtime untouched, and a setup error has already torn down
    /// the plugins that were set up. Plugin states stay queryable afterwards.
    pub async fn initialize(&mut self, plugins: Vec<Arc<dyn Plugin>>) -> Result<()> {
        if self.initialized {
            return Err(Error::AlreadyInitialized);
        }

        let mut registry = PluginRegistry::new();
        for plugin in plugins {
            registry.register(plugin)?;
        }
        let ordered = registry.resolve_plugins()?;

        let result = self.lifecycle.setup(&mut registry, &ordered).await;
        self.registry = registry;
        result?;

        info!(plugins = ordered.len(), "runtime initialized");
        self.plugins = ordered;
        self.initialized = true;
        Ok(())
    }

    /// Run `query` through the pipeline and the driver registered as
    /// `driver_name`.
    pub async fn execute(&self, query: QueryDescriptor, driver_name: &str) -> Result<QueryOutcome> {
        self.run(None, query, driver_name).await
    }

    /// Like [`Runtime::execute`], recording `caller` in the execution context
    /// and on the returned outcome.
    pub async fn execute_as(
        &self,
        caller: &str,
        query: QueryDescriptor,
        driver_name: &str,
    ) -> Result<QueryOutcome> {
        self.run(Some(caller), query, driver_name).await
    }

    async fn run(
        &self,
        caller: Option<&str>,
        query: QueryDescriptor,
        driver_name: &str,
    ) -> Result<QueryOutcome> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        let driver = self
            .drivers
            .get(driver_name)
            .ok_or_else(|| Error::UnknownDriver {
                driver: driver_name.to_string(),
            })?;

        let mut ctx = self.pipeline.context(query);
        if let Some(caller) = caller {
            ctx = ctx.with_caller(caller);
        }
        self.pipeline
            .execute(ctx, &self.plugins, driver_name, driver.as_ref(), Some(&self.pool))
            .await
    }

    /// Tear plugins down in reverse setup order, then close every pooled
    /// connection. Connections are closed even when teardown fails.
    pub async fn shutdown(&mut self) -> Result<()> {
        let result = self.lifecycle.teardown(&mut self.registry).await;
        let closed = self.pool.close_all();
        self.plugins.clear();
        self.initialized = false;
        match &result {
            Ok(()) => info!(closed, "runtime shut down"),
            Err(err) => warn!(closed, error = %err, "runtime shut down with teardown failures"),
        }
        result
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Names of the set-up plugins in resolved order.
    pub fn plugin_order(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn plugin_state(&self, name: &str) -> Option<PluginState> {
        self.registry.state(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{PluginKind, PluginMetadata};
    use crate::pool::Connection;
    use crate::query::Rows;
    use async_trait::async_trait;
    use serde_json::json;

    struct Bare {
        meta: PluginMetadata,
        fail_setup: bool,
    }

    #[async_trait]
    impl Plugin for Bare {
        fn metadata(&self) -> &PluginMetadata {
            &self.meta
        }

        async fn setup(&self) -> anyhow::Result<()> {
            if self.fail_setup {
                anyhow::bail!("no backend");
            }
            Ok(())
        }
    }

    fn bare(name: &str, deps: &[&str], fail_setup: bool) -> Arc<dyn Plugin> {
        let mut meta = PluginMetadata::new(name, "1.0.0", PluginKind::Extension);
        for dep in deps {
            meta = meta.depends_on(*dep);
        }
        Arc::new(Bare { meta, fail_setup })
    }

    struct StaticDriver;

    #[async_trait]
    impl Driver for StaticDriver {
        async fn execute(
            &self,
            _query: &QueryDescriptor,
            connection: Option<&Connection>,
        ) -> anyhow::Result<Rows> {
            let id = connection.map(|c| c.id).unwrap_or_default();
            Ok(vec![json!({"connection": id}).as_object().unwrap().clone()])
        }
    }

    fn runtime() -> Runtime {
        let mut runtime = Runtime::new(RuntimeConfig::default());
        runtime.register_driver("db1", Arc::new(StaticDriver));
        runtime
    }

    #[tokio::test]
    async fn test_execute_before_initialize() {
        let runtime = runtime();
        let err = runtime
            .execute(QueryDescriptor::new("users"), "db1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotInitialized));
    }

    #[tokio::test]
    async fn test_initialize_resolves_order() {
        let mut runtime = runtime();
        runtime
            .initialize(vec![bare("b", &["a"], false), bare("a", &[], false)])
            .await
            .unwrap();
        assert!(runtime.is_initialized());
        assert_eq!(runtime.plugin_order(), vec!["a", "b"]);
        assert_eq!(runtime.plugin_state("b"), Some(PluginState::Active));

        let err = runtime.initialize(vec![]).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyInitialized));
    }

    #[tokio::test]
    async fn test_initialize_failure_leaves_runtime_unusable() {
        let mut runtime = runtime();
        let err = runtime
            .initialize(vec![bare("a", &[], false), bare("b", &["a"], true)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PluginSetupFailed { ref plugin, .. } if plugin == "b"));
        assert!(!runtime.is_initialized());
        assert_eq!(runtime.plugin_state("a"), Some(PluginState::TornDown));
        assert_eq!(runtime.plugin_state("b"), Some(PluginState::Failed));
        assert!(runtime
            .execute(QueryDescriptor::new("users"), "db1")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cycle_fails_initialize() {
        let mut runtime = runtime();
        let err = runtime
            .initialize(vec![bare("a", &["b"], false), bare("b", &["a"], false)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CyclicDependency { .. }));
        assert!(!runtime.is_initialized());
    }

    #[tokio::test]
    async fn test_unknown_driver() {
        let mut runtime = runtime();
        runtime.initialize(vec![]).await.unwrap();
        let err = runtime
            .execute(QueryDescriptor::new("users"), "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownDriver { ref driver } if driver == "nope"));
    }

    #[tokio::test]
    async fn test_execute_leases_and_releases() {
        let mut runtime = runtime();
        runtime.initialize(vec![]).await.unwrap();
        let outcome = runtime
            .execute_as("svc", QueryDescriptor::new("users"), "db1")
            .await
            .unwrap();
        assert_ne!(outcome.rows[0]["connection"], json!(0));
        assert_eq!(outcome.caller.as_deref(), Some("svc"));

        let stats = runtime.pool_stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.driver("db1").idle, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_pool() {
        let mut runtime = runtime();
        runtime.initialize(vec![bare("a", &[], false)]).await.unwrap();
        runtime
            .execute(QueryDescriptor::new("users"), "db1")
            .await
            .unwrap();

        runtime.shutdown().await.unwrap();
        assert!(!runtime.is_initialized());
        assert_eq!(runtime.pool_stats().total, 0);
        assert_eq!(runtime.plugin_state("a"), Some(PluginState::TornDown));
        assert!(runtime.plugin_order().is_empty());
    }
}
