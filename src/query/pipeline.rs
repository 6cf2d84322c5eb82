//! Query pipeline: validation, before-waterfall, driver, after-waterfall.
//!
//! Hooks run in resolved plugin order in every phase, including the
//! after-phase, so a plugin's before-hook has always run by the time any later
//! plugin sees the results.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::driver::Driver;
use super::types::{QueryDescriptor, Rows};
use crate::error::{Error, Phase, Rejection, Result};
use crate::plugin::{Plugin, Verdict};
use crate::pool::{Connection, ConnectionPool, PooledConnection};

/// How the validation phase reacts to a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationPolicy {
    /// Stop at the first rejecting validator.
    #[default]
    FailFast,
    /// Ask every validator and report all rejections together.
    CollectAll,
}

/// Per-execution state. Created for one query and dropped when it finishes,
/// which also returns any leased connection to the pool.
pub struct PipelineContext {
    query_id: u64,
    caller: Option<String>,
    started_at: DateTime<Utc>,
    started: Instant,
    query: QueryDescriptor,
    lease: Option<PooledConnection>,
}

impl PipelineContext {
    pub fn query_id(&self) -> u64 {
        self.query_id
    }

    pub fn caller(&self) -> Option<&str> {
        self.caller.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The query as it currently stands in the pipeline.
    pub fn query(&self) -> &QueryDescriptor {
        &self.query
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.lease.as_deref()
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    pub fn with_lease(mut self, lease: PooledConnection) -> Self {
        self.lease = Some(lease);
        self
    }
}

/// Result of a pipeline run that reached the driver.
#[derive(Debug)]
pub struct QueryOutcome {
    pub query_id: u64,
    /// Caller recorded on the context, if any.
    pub caller: Option<String>,
    pub rows: Rows,
    /// Set when an after-hook failed. `rows` then holds the output of the
    /// last after-hook that succeeded.
    ///
    /// Keeping that output means each after-hook receives a copy of the
    /// current rows, so the after-phase clones the result set once per
    /// transformer.
    pub after_error: Option<Error>,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl QueryOutcome {
    pub fn is_complete(&self) -> bool {
        self.after_error.is_none()
    }

    /// Drop partial results and surface the after-phase error, if any.
    pub fn into_result(self) -> Result<Rows> {
        match self.after_error {
            Some(err) => Err(err),
            None => Ok(self.rows),
        }
    }
}

#[derive(Debug)]
pub struct QueryPipeline {
    policy: ValidationPolicy,
    next_query_id: AtomicU64,
}

impl Default for QueryPipeline {
    fn default() -> Self {
        Self::new(ValidationPolicy::default())
    }
}

impl QueryPipeline {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self {
            policy,
            next_query_id: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> ValidationPolicy {
        self.policy
    }

    /// Start a context for one execution of `query`.
    pub fn context(&self, query: QueryDescriptor) -> PipelineContext {
        PipelineContext {
            query_id: self.next_query_id.fetch_add(1, Ordering::Relaxed),
            caller: None,
            started_at: Utc::now(),
            started: Instant::now(),
            query,
            lease: None,
        }
    }

    /// Run a query through all phases.
    ///
    /// The driver is only called once validation and every before-hook have
    /// succeeded. When a pool is given and the context holds no lease yet, a
    /// connection for `driver_name` is leased right before the driver runs and
    /// released when the context is dropped, on every exit path. A failing
    /// after-hook does not discard the driver's rows; it is reported in
    /// [`QueryOutcome::after_error`].
    pub async fn execute(
        &self,
        mut ctx: PipelineContext,
        plugins: &[Arc<dyn Plugin>],
        driver_name: &str,
        driver: &dyn Driver,
        pool: Option<&ConnectionPool>,
    ) -> Result<QueryOutcome> {
        let query_id = ctx.query_id;
        if !ctx.query.is_well_formed() {
            return Err(Error::MalformedQuery {
                target: ctx.query.target.clone(),
            });
        }

        self.validate(&ctx, plugins).await?;

        let mut query = ctx.query.clone();
        for plugin in plugins {
            let Some(transformer) = plugin.as_transformer() else {
                continue;
            };
            trace!(query_id, plugin = plugin.name(), "before hook");
            query = transformer
                .before_query(query)
                .await
                .map_err(|cause| Error::TransformFailed {
                    plugin: plugin.name().to_string(),
                    phase: Phase::BeforeQuery,
                    cause,
                })?;
        }
        ctx.query = query;

        if let Some(pool) = pool {
            if ctx.lease.is_none() {
                ctx.lease = Some(pool.acquire(driver_name).await?);
            }
        }

        debug!(
            query_id,
            caller = ctx.caller(),
            driver = driver_name,
            target = %ctx.query.target,
            "executing query"
        );
        let mut rows = driver
            .execute(&ctx.query, ctx.connection())
            .await
            .map_err(|cause| Error::DriverExecutionFailed {
                driver: driver_name.to_string(),
                cause,
            })?;

        let mut after_error = None;
        for plugin in plugins {
            let Some(transformer) = plugin.as_transformer() else {
                continue;
            };
            trace!(query_id, plugin = plugin.name(), "after hook");
            match transformer.after_query(rows.clone()).await {
                Ok(transformed) => rows = transformed,
                Err(cause) => {
                    warn!(query_id, plugin = plugin.name(), error = %cause, "after hook failed");
                    after_error = Some(Error::TransformFailed {
                        plugin: plugin.name().to_string(),
                        phase: Phase::AfterQuery,
                        cause,
                    });
                    break;
                }
            }
        }

        debug!(
            query_id,
            caller = ctx.caller(),
            rows = rows.len(),
            elapsed_ms = ctx.elapsed().as_millis() as u64,
            "query finished"
        );
        let elapsed = ctx.elapsed();
        Ok(QueryOutcome {
            query_id,
            caller: ctx.caller.take(),
            rows,
            after_error,
            started_at: ctx.started_at,
            elapsed,
        })
    }

    async fn validate(&self, ctx: &PipelineContext, plugins: &[Arc<dyn Plugin>]) -> Result<()> {
        let mut rejections = Vec::new();
        for plugin in plugins {
            let Some(validator) = plugin.as_validator() else {
                continue;
            };
            let verdict = validator
                .validate(&ctx.query)
                .await
                .map_err(|cause| Error::TransformFailed {
                    plugin: plugin.name().to_string(),
                    phase: Phase::Validate,
                    cause,
                })?;
            if let Verdict::Reject(reason) = verdict {
                debug!(query_id = ctx.query_id, plugin = plugin.name(), %reason, "query rejected");
                rejections.push(Rejection {
                    plugin: plugin.name().to_string(),
                    reason,
                });
                if self.policy == ValidationPolicy::FailFast {
                    break;
                }
            }
        }

        if rejections.is_empty() {
            Ok(())
        } else {
            Err(Error::ValidationRejected { rejections })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{PluginKind, PluginMetadata, QueryTransformer, QueryValidator};
    use crate::query::types::Predicate;
    use anyhow::bail;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Test double covering every hook, configured per test.
    struct Hooks {
        meta: PluginMetadata,
        log: Log,
        reject: Option<&'static str>,
        append: Option<Predicate>,
        tag_rows: bool,
        fail: Option<Phase>,
        validates: bool,
        transforms: bool,
    }

    impl Hooks {
        fn new(name: &str, log: &Log) -> Self {
            Self {
                meta: PluginMetadata::new(name, "0.1.0", PluginKind::Extension),
                log: Arc::clone(log),
                reject: None,
                append: None,
                tag_rows: false,
                fail: None,
                validates: false,
                transforms: false,
            }
        }

        fn rejecting(mut self, reason: &'static str) -> Self {
            self.reject = Some(reason);
            self.validates = true;
            self
        }

        fn accepting(mut self) -> Self {
            self.validates = true;
            self
        }

        fn appending(mut self, predicate: Predicate) -> Self {
            self.append = Some(predicate);
            self.transforms = true;
            self
        }

        fn tagging(mut self) -> Self {
            self.tag_rows = true;
            self.transforms = true;
            self
        }

        fn failing(mut self, phase: Phase) -> Self {
            self.fail = Some(phase);
            match phase {
                Phase::Validate => self.validates = true,
                _ => self.transforms = true,
            }
            self
        }

        fn build(self) -> Arc<dyn Plugin> {
            Arc::new(self)
        }

        fn record(&self, event: &str) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", event, self.meta.name));
        }
    }

    #[async_trait]
    impl Plugin for Hooks {
        fn metadata(&self) -> &PluginMetadata {
            &self.meta
        }

        fn as_validator(&self) -> Option<&dyn QueryValidator> {
            if self.validates {
                Some(self)
            } else {
                None
            }
        }

        fn as_transformer(&self) -> Option<&dyn QueryTransformer> {
            if self.transforms {
                Some(self)
            } else {
                None
            }
        }
    }

    #[async_trait]
    impl QueryValidator for Hooks {
        async fn validate(&self, _query: &QueryDescriptor) -> anyhow::Result<Verdict> {
            self.record("validate");
            if self.fail == Some(Phase::Validate) {
                bail!("validator crashed");
            }
            Ok(match self.reject {
                Some(reason) => Verdict::Reject(reason.to_string()),
                None => Verdict::Accept,
            })
        }
    }

    #[async_trait]
    impl QueryTransformer for Hooks {
        async fn before_query(&self, query: QueryDescriptor) -> anyhow::Result<QueryDescriptor> {
            self.record("before");
            if self.fail == Some(Phase::BeforeQuery) {
                bail!("cannot rewrite");
            }
            Ok(match &self.append {
                Some(predicate) => query.with_filter(predicate.clone()),
                None => query,
            })
        }

        async fn after_query(&self, mut rows: Rows) -> anyhow::Result<Rows> {
            self.record("after");
            if self.fail == Some(Phase::AfterQuery) {
                bail!("cannot post-process");
            }
            if self.tag_rows {
                for row in &mut rows {
                    row.insert(self.meta.name.clone(), json!(true));
                }
            }
            Ok(rows)
        }
    }

    #[derive(Default)]
    struct RecordingDriver {
        received: Mutex<Vec<QueryDescriptor>>,
        fail: bool,
    }

    #[async_trait]
    impl Driver for RecordingDriver {
        async fn execute(
            &self,
            query: &QueryDescriptor,
            _connection: Option<&Connection>,
        ) -> anyhow::Result<Rows> {
            self.received.lock().unwrap().push(query.clone());
            if self.fail {
                bail!("backend unavailable");
            }
            let row = json!({"id": 1, "name": "ada"});
            Ok(vec![row.as_object().unwrap().clone()])
        }
    }

    impl RecordingDriver {
        fn calls(&self) -> usize {
            self.received.lock().unwrap().len()
        }
    }

    async fn run(
        pipeline: &QueryPipeline,
        plugins: &[Arc<dyn Plugin>],
        driver: &RecordingDriver,
    ) -> Result<QueryOutcome> {
        let ctx = pipeline.context(QueryDescriptor::new("users"));
        pipeline.execute(ctx, plugins, "memory", driver, None).await
    }

    #[tokio::test]
    async fn test_no_plugins_passes_query_and_rows_through() {
        let pipeline = QueryPipeline::default();
        let driver = RecordingDriver::default();
        let outcome = run(&pipeline, &[], &driver).await.unwrap();
        assert!(outcome.is_complete());
        assert_eq!(driver.received.lock().unwrap()[0], QueryDescriptor::new("users"));
        assert_eq!(outcome.rows[0]["name"], json!("ada"));
    }

    #[tokio::test]
    async fn test_before_hooks_compose_in_order() {
        let log = Log::default();
        let plugins = vec![
            Hooks::new("p1", &log).appending(Predicate::eq("x", 1)).build(),
            Hooks::new("p2", &log).appending(Predicate::eq("y", 2)).build(),
        ];
        let pipeline = QueryPipeline::default();
        let driver = RecordingDriver::default();
        run(&pipeline, &plugins, &driver).await.unwrap();

        let received = driver.received.lock().unwrap();
        let fields: Vec<&str> = received[0].filter.iter().map(|p| p.field.as_str()).collect();
        assert_eq!(fields, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_after_hooks_use_same_order() {
        let log = Log::default();
        let plugins = vec![
            Hooks::new("a", &log).tagging().build(),
            Hooks::new("b", &log).tagging().build(),
        ];
        let pipeline = QueryPipeline::default();
        let driver = RecordingDriver::default();
        let outcome = run(&pipeline, &plugins, &driver).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["before:a", "before:b", "after:a", "after:b"]
        );
        assert_eq!(outcome.rows[0]["a"], json!(true));
        assert_eq!(outcome.rows[0]["b"], json!(true));
    }

    #[tokio::test]
    async fn test_fail_fast_stops_at_first_rejection() {
        let log = Log::default();
        let plugins = vec![
            Hooks::new("ok", &log).accepting().build(),
            Hooks::new("no-limit", &log).rejecting("limit required").build(),
            Hooks::new("no-sort", &log).rejecting("sort required").build(),
        ];
        let pipeline = QueryPipeline::new(ValidationPolicy::FailFast);
        let driver = RecordingDriver::default();
        let err = run(&pipeline, &plugins, &driver).await.unwrap_err();

        match err {
            Error::ValidationRejected { rejections } => {
                assert_eq!(rejections.len(), 1);
                assert_eq!(rejections[0].plugin, "no-limit");
                assert_eq!(rejections[0].reason, "limit required");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(driver.calls(), 0);
        assert!(!log.lock().unwrap().contains(&"validate:no-sort".to_string()));
    }

    #[tokio::test]
    async fn test_collect_all_reports_every_rejection() {
        let log = Log::default();
        let plugins = vec![
            Hooks::new("no-limit", &log).rejecting("limit required").build(),
            Hooks::new("ok", &log).accepting().build(),
            Hooks::new("no-sort", &log).rejecting("sort required").build(),
        ];
        let pipeline = QueryPipeline::new(ValidationPolicy::CollectAll);
        let driver = RecordingDriver::default();
        let err = run(&pipeline, &plugins, &driver).await.unwrap_err();

        let Error::ValidationRejected { rejections } = err else {
            panic!("expected rejection");
        };
        let names: Vec<&str> = rejections.iter().map(|r| r.plugin.as_str()).collect();
        assert_eq!(names, vec!["no-limit", "no-sort"]);
        assert_eq!(log.lock().unwrap().len(), 3);
        assert_eq!(driver.calls(), 0);
    }

    #[tokio::test]
    async fn test_validator_error_is_wrapped() {
        let log = Log::default();
        let plugins = vec![Hooks::new("broken", &log).failing(Phase::Validate).build()];
        let pipeline = QueryPipeline::default();
        let driver = RecordingDriver::default();
        let err = run(&pipeline, &plugins, &driver).await.unwrap_err();
        assert!(matches!(
            err,
            Error::TransformFailed { ref plugin, phase: Phase::Validate, .. } if plugin == "broken"
        ));
        assert_eq!(driver.calls(), 0);
    }

    #[tokio::test]
    async fn test_before_failure_skips_driver() {
        let log = Log::default();
        let plugins = vec![
            Hooks::new("first", &log).appending(Predicate::eq("x", 1)).build(),
            Hooks::new("broken", &log).failing(Phase::BeforeQuery).build(),
            Hooks::new("last", &log).appending(Predicate::eq("y", 1)).build(),
        ];
        let pipeline = QueryPipeline::default();
        let driver = RecordingDriver::default();
        let err = run(&pipeline, &plugins, &driver).await.unwrap_err();

        assert!(matches!(
            err,
            Error::TransformFailed { ref plugin, phase: Phase::BeforeQuery, .. } if plugin == "broken"
        ));
        assert_eq!(driver.calls(), 0);
        assert!(!log.lock().unwrap().contains(&"before:last".to_string()));
    }

    #[tokio::test]
    async fn test_after_failure_keeps_rows() {
        let log = Log::default();
        let plugins = vec![
            Hooks::new("tagger", &log).tagging().build(),
            Hooks::new("broken", &log).failing(Phase::AfterQuery).build(),
            Hooks::new("late", &log).tagging().build(),
        ];
        let pipeline = QueryPipeline::default();
        let driver = RecordingDriver::default();
        let outcome = run(&pipeline, &plugins, &driver).await.unwrap();

        assert!(!outcome.is_complete());
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0]["tagger"], json!(true));
        assert!(outcome.rows[0].get("late").is_none());
        assert!(matches!(
            outcome.after_error,
            Some(Error::TransformFailed { phase: Phase::AfterQuery, .. })
        ));
        assert!(outcome.into_result().is_err());
    }

    #[tokio::test]
    async fn test_driver_error_passes_through() {
        let pipeline = QueryPipeline::default();
        let driver = RecordingDriver {
            fail: true,
            ..Default::default()
        };
        let err = run(&pipeline, &[], &driver).await.unwrap_err();
        match err {
            Error::DriverExecutionFailed { driver, cause } => {
                assert_eq!(driver, "memory");
                assert_eq!(cause.to_string(), "backend unavailable");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_query_rejected() {
        let pipeline = QueryPipeline::default();
        let driver = RecordingDriver::default();
        let ctx = pipeline.context(QueryDescriptor::new(""));
        let err = pipeline
            .execute(ctx, &[], "memory", &driver, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedQuery { .. }));
        assert_eq!(driver.calls(), 0);
    }

    #[tokio::test]
    async fn test_lease_held_only_while_running() {
        let pool = ConnectionPool::new(crate::pool::PoolLimits::new(1, 1));
        let pipeline = QueryPipeline::default();
        let driver = RecordingDriver::default();
        let ctx = pipeline.context(QueryDescriptor::new("users"));
        pipeline
            .execute(ctx, &[], "memory", &driver, Some(&pool))
            .await
            .unwrap();
        let stats = pool.stats();
        assert_eq!(stats.driver("memory").active, 0);
        assert_eq!(stats.driver("memory").idle, 1);
    }

    #[tokio::test]
    async fn test_rejected_query_never_leases() {
        let log = Log::default();
        let plugins = vec![Hooks::new("deny", &log).rejecting("no").build()];
        let pool = ConnectionPool::new(crate::pool::PoolLimits::new(1, 1));
        let pipeline = QueryPipeline::default();
        let driver = RecordingDriver::default();
        let ctx = pipeline.context(QueryDescriptor::new("users"));
        let result = pipeline
            .execute(ctx, &plugins, "memory", &driver, Some(&pool))
            .await;
        assert!(result.is_err());
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn test_driver_error_releases_lease() {
        let pool = ConnectionPool::new(crate::pool::PoolLimits::new(1, 1));
        let pipeline = QueryPipeline::default();
        let driver = RecordingDriver {
            fail: true,
            ..Default::default()
        };
        let ctx = pipeline.context(QueryDescriptor::new("users"));
        let result = pipeline
            .execute(ctx, &[], "memory", &driver, Some(&pool))
            .await;
        assert!(result.is_err());
        assert_eq!(pool.stats().driver("memory").active, 0);
    }

    #[test]
    fn test_context_ids_increase() {
        let pipeline = QueryPipeline::default();
        let first = pipeline.context(QueryDescriptor::new("a"));
        let second = pipeline.context(QueryDescriptor::new("a")).with_caller("svc");
        assert!(second.query_id() > first.query_id());
        assert_eq!(second.caller(), Some("svc"));
        assert!(first.connection().is_none());
    }

    #[tokio::test]
    async fn test_outcome_carries_caller() {
        let pipeline = QueryPipeline::default();
        let driver = RecordingDriver::default();
        let ctx = pipeline
            .context(QueryDescriptor::new("users"))
            .with_caller("billing");
        let outcome = pipeline
            .execute(ctx, &[], "memory", &driver, None)
            .await
            .unwrap();
        assert_eq!(outcome.caller.as_deref(), Some("billing"));

        let outcome = run(&pipeline, &[], &driver).await.unwrap();
        assert!(outcome.caller.is_none());
    }

    #[test]
    fn test_policy_deserialize() {
        let policy: ValidationPolicy = serde_json::from_str("\"collect-all\"").unwrap();
        assert_eq!(policy, ValidationPolicy::CollectAll);
        assert_eq!(ValidationPolicy::default(), ValidationPolicy::FailFast);
    }
}
