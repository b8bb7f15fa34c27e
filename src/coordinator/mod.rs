// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Routing engine coordinator.
//!
//! Ties together:
//! - the staging store via [`crate::store::ChangeStore`]
//! - gap bookkeeping via [`crate::gap::GapTracker`]
//! - routing via [`crate::router::Router`] and [`crate::router::MetadataRouter`]
//! - the metadata cache, refreshed from the config watch channel
//!
//! # Lifecycle
//!
//! 1. `start()` runs a full gap analysis so gaps left by a crash are repaired
//! 2. the routing loop runs a pass every `settings.routing.interval`
//! 3. a purge task deletes old CLOSED/SKIPPED gaps
//! 4. `shutdown()` signals both tasks and waits for the running pass
//!
//! `route_once()` runs a pass on demand and works in any state except
//! shutting down and stopped.

mod routing_loop;
mod types;

pub use types::{EngineState, HealthCheck, PassReport};

use crate::cache::MetadataCache;
use crate::config::EngineConfig;
use crate::error::{ReplicationError, Result};
use crate::gap::GapTracker;
use crate::metrics;
use crate::resilience::{retry, RateLimiter, RetryConfig};
use crate::router::{MetadataRouter, RouteScript, Router, TriggerResync};
use crate::store::{ChangeStore, SqliteStore};
use crate::topology::{NodeDirectory, StaticNodeDirectory};
use routing_loop::PassRunner;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Consecutive failed passes before the engine reports unhealthy.
const UNHEALTHY_AFTER_FAILURES: usize = 3;

/// How long `shutdown()` waits for each task.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The routing engine.
///
/// Owns the background work that turns captured rows into outgoing batches.
/// Applying batches on the target side is [`crate::writer::ConflictAwareWriter`]'s
/// job and is not driven from here.
pub struct RoutingEngine<S: ChangeStore = SqliteStore> {
    config: EngineConfig,

    /// Runtime config updates (also feeds the metadata cache)
    config_rx: watch::Receiver<EngineConfig>,

    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    store: Arc<S>,
    directory: Arc<dyn NodeDirectory>,
    cache: Arc<MetadataCache>,
    gap_tracker: Arc<GapTracker<S>>,

    /// Registered route scripts, replayed whenever the router is rebuilt.
    scripts: Vec<(String, Arc<dyn RouteScript>)>,
    resync: Option<Arc<dyn TriggerResync>>,

    router: Arc<Router<S>>,
    runner: Arc<PassRunner<S>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl RoutingEngine<SqliteStore> {
    /// Open the SQLite staging store named in `config.store` and build the
    /// engine on it.
    pub async fn open(config: EngineConfig, config_rx: watch::Receiver<EngineConfig>) -> Result<Self> {
        let store = SqliteStore::from_config(&config.store).await?;
        Ok(Self::with_store(config, config_rx, Arc::new(store)))
    }
}

impl<S: ChangeStore> RoutingEngine<S> {
    /// Build an engine on an existing store, with a node directory taken from
    /// `config.nodes` and `config.node_group_links`.
    pub fn with_store(config: EngineConfig, config_rx: watch::Receiver<EngineConfig>, store: Arc<S>) -> Self {
        let directory: Arc<dyn NodeDirectory> = Arc::new(StaticNodeDirectory::from_config(&config));
        Self::with_directory(config, config_rx, store, directory)
    }

    /// Build an engine with a caller-supplied node directory.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to launch the background loops.
    pub fn with_directory(
        config: EngineConfig,
        config_rx: watch::Receiver<EngineConfig>,
        store: Arc<S>,
        directory: Arc<dyn NodeDirectory>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let cache = Arc::new(MetadataCache::new(config_rx.clone()));
        let gap_tracker = Arc::new(GapTracker::new(Arc::clone(&store), config.settings.gaps.clone()));
        let router = build_router(&config, &store, &cache, &directory, &[], None);
        let runner = Arc::new(PassRunner::new(
            Arc::clone(&gap_tracker),
            Arc::clone(&router),
            Arc::clone(&cache),
            config.settings.routing.max_concurrent_channels,
        ));

        Self {
            config,
            config_rx,
            state_tx,
            state_rx,
            store,
            directory,
            cache,
            gap_tracker,
            scripts: Vec::new(),
            resync: None,
            router,
            runner,
            shutdown_tx,
            shutdown_rx,
            handles: RwLock::new(Vec::new()),
        }
    }

    /// Register a script for scripted routers.
    pub fn with_script(mut self, name: &str, script: Arc<dyn RouteScript>) -> Self {
        self.scripts.push((name.to_string(), script));
        self.rebuild_router();
        self
    }

    /// Hook called when a metadata row changes a trigger definition.
    pub fn with_trigger_resync(mut self, resync: Arc<dyn TriggerResync>) -> Self {
        self.resync = Some(resync);
        self.rebuild_router();
        self
    }

    fn rebuild_router(&mut self) {
        self.router = build_router(
            &self.config,
            &self.store,
            &self.cache,
            &self.directory,
            &self.scripts,
            self.resync.clone(),
        );
        self.runner = Arc::new(PassRunner::new(
            Arc::clone(&self.gap_tracker),
            Arc::clone(&self.router),
            Arc::clone(&self.cache),
            self.config.settings.routing.max_concurrent_channels,
        ));
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn router(&self) -> &Arc<Router<S>> {
        &self.router
    }

    pub fn gap_tracker(&self) -> &Arc<GapTracker<S>> {
        &self.gap_tracker
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Latest config seen on the watch channel.
    pub fn current_config(&self) -> EngineConfig {
        self.config_rx.borrow().clone()
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Health snapshot for monitoring endpoints. Performs no I/O.
    ///
    /// ```rust,ignore
    /// let health = engine.health_check();
    /// if health.ready {
    ///     HttpResponse::Ok()
    /// } else {
    ///     HttpResponse::ServiceUnavailable()
    /// }
    /// ```
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let consecutive_failures = self.runner.consecutive_failures();
        let ready = state == EngineState::Running;
        HealthCheck {
            state,
            ready,
            healthy: ready && consecutive_failures < UNHEALTHY_AFTER_FAILURES,
            passes: self.runner.passes(),
            consecutive_failures,
            millis_since_success: self.runner.millis_since_success(),
        }
    }

    /// Start the engine.
    ///
    /// 1. Validates the config
    /// 2. Runs a full gap analysis (retried with startup backoff)
    /// 3. Spawns the routing loop (if `settings.routing.enabled`)
    /// 4. Spawns the gap purge task
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(
            node_id = %self.config.node_id,
            node_group_id = %self.config.node_group_id,
            channels = self.config.channels.len(),
            "Starting routing engine"
        );
        self.set_state(EngineState::Starting);

        if let Err(e) = self.config.validate() {
            error!(error = %e, "Invalid engine config");
            self.set_state(EngineState::Failed);
            return Err(e);
        }

        let gap_tracker = Arc::clone(&self.gap_tracker);
        let analysis = retry(&RetryConfig::startup(), "full_gap_analysis", || {
            let gap_tracker = Arc::clone(&gap_tracker);
            async move { gap_tracker.full_gap_analysis().await }
        })
        .await;
        if let Err(e) = analysis {
            error!(error = %e, "Full gap analysis failed");
            self.set_state(EngineState::Failed);
            return Err(e);
        }

        if self.config.settings.routing.enabled {
            self.spawn_routing_loop().await;
        } else {
            info!("Routing loop disabled, passes run only through route_once()");
        }
        self.spawn_purge_task().await;

        self.set_state(EngineState::Running);
        info!("Routing engine running");
        Ok(())
    }

    async fn spawn_routing_loop(&self) {
        let runner = Arc::clone(&self.runner);
        let interval = self.config.settings.routing.interval_duration();
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            routing_loop::run_routing_loop(runner, interval, shutdown_rx).await;
        });

        info!(interval_ms = interval.as_millis() as u64, "Spawned routing loop");
        self.handles.write().await.push(handle);
    }

    async fn spawn_purge_task(&self) {
        let gap_tracker = Arc::clone(&self.gap_tracker);
        let interval = self.config.settings.gaps.purge_interval_duration();
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(
            routing_loop::run_purge_loop(gap_tracker, interval, shutdown_rx)
                .instrument(info_span!("engine", node_id = %self.config.node_id)),
        );

        debug!("Spawned gap purge task");
        self.handles.write().await.push(handle);
    }

    /// Run one routing pass now.
    ///
    /// Waits for a pass already running in the background loop to finish.
    pub async fn route_once(&self) -> Result<PassReport> {
        if matches!(self.state(), EngineState::ShuttingDown | EngineState::Stopped) {
            return Err(ReplicationError::Shutdown);
        }
        self.runner.run().await
    }

    /// Shutdown the engine gracefully.
    ///
    /// The routing loop finishes the pass it is in, so the batches it routed
    /// are committed and reconciled before the task exits. The store is
    /// closed last.
    pub async fn shutdown(&mut self) {
        info!("Shutting down routing engine");
        self.set_state(EngineState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };

        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to drain and complete");
        }

        for (i, mut handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown, aborting");
                    handle.abort();
                }
            }
        }

        if let Err(e) = self.store.close().await {
            warn!(error = %e, "Failed to close store");
        }

        self.set_state(EngineState::Stopped);
        info!("Routing engine stopped");
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }
}

fn build_router<S: ChangeStore>(
    config: &EngineConfig,
    store: &Arc<S>,
    cache: &Arc<MetadataCache>,
    directory: &Arc<dyn NodeDirectory>,
    scripts: &[(String, Arc<dyn RouteScript>)],
    resync: Option<Arc<dyn TriggerResync>>,
) -> Arc<Router<S>> {
    let mut metadata_router = MetadataRouter::new(
        Arc::clone(directory),
        Arc::clone(cache),
        &config.metadata.table_prefix,
        config.topology.master_to_master,
    );
    if let Some(resync) = resync {
        metadata_router = metadata_router.with_resync(resync);
    }

    let rate_limiter = config.settings.routing.rate_limit_config().map(|cfg| {
        info!(
            rate_per_sec = cfg.refill_rate,
            burst = cfg.burst_size,
            "Rate limiting enabled for routing"
        );
        RateLimiter::new(cfg)
    });

    let mut router = Router::new(
        Arc::clone(store),
        Arc::clone(cache),
        Arc::clone(directory),
        Arc::new(metadata_router),
        config.settings.reader.clone(),
    )
    .with_rate_limiter(rate_limiter);
    for (name, script) in scripts {
        router = router.with_script(name, Arc::clone(script));
    }
    Arc::new(router)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, NodeConfig, RouterConfig, RouterType, TriggerConfig};
    use crate::model::{ChangeRow, EventType, GapStatus, SchemaSnapshot};
    use crate::store::InMemoryStore;

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::for_testing("000", "corp");
        config.channels = vec![ChannelConfig::new("default"), ChannelConfig::new("config")];
        for (id, external) in [("001", "s1"), ("002", "s2")] {
            config.nodes.push(NodeConfig {
                node_id: id.into(),
                node_group_id: "store".into(),
                external_id: external.into(),
                created_at_node_id: Some("000".into()),
                sync_enabled: true,
            });
        }
        config.triggers.push(TriggerConfig {
            trigger_id: "item".into(),
            source_table: "item".into(),
            channel_id: "default".into(),
            routers: vec!["corp_2_store".into()],
        });
        config
            .routers
            .push(RouterConfig::new("corp_2_store", "corp", "store", RouterType::Default));
        config
    }

    fn engine(config: EngineConfig) -> (RoutingEngine<InMemoryStore>, watch::Sender<EngineConfig>) {
        let (tx, rx) = watch::channel(config.clone());
        let engine = RoutingEngine::with_store(config, rx, Arc::new(InMemoryStore::new()));
        (engine, tx)
    }

    fn item_row(id: i64) -> ChangeRow {
        let snapshot = Arc::new(SchemaSnapshot::new(1, "item", "item", &["ID", "STORE_ID"], &["ID"]));
        ChangeRow::new(id, EventType::Insert, "default", snapshot)
            .with_row_data(&[Some(&id.to_string()), Some("s1")])
    }

    #[test]
    fn test_engine_initial_state() {
        let (engine, _tx) = engine(test_config());
        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_running());
        assert_eq!(engine.node_id(), "000");

        let health = engine.health_check();
        assert!(!health.ready);
        assert!(!health.healthy);
        assert_eq!(health.passes, 0);
        assert!(health.millis_since_success.is_none());
    }

    #[tokio::test]
    async fn test_engine_start_invalid_state() {
        let (mut engine, _tx) = engine(test_config());
        let _ = engine.state_tx.send(EngineState::Running);

        let result = engine.start().await;
        if let Err(ReplicationError::InvalidState { expected, actual }) = result {
            assert_eq!(expected, "Created");
            assert_eq!(actual, "Running");
        } else {
            panic!("Expected InvalidState error");
        }
    }

    #[tokio::test]
    async fn test_engine_start_rejects_invalid_config() {
        let mut config = test_config();
        config.triggers[0].channel_id = "missing".into();
        let (mut engine, _tx) = engine(config);

        let result = engine.start().await;
        assert!(matches!(result, Err(ReplicationError::Config(_))));
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[tokio::test]
    async fn test_engine_shutdown_from_created() {
        let (mut engine, _tx) = engine(test_config());
        engine.shutdown().await;

        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(matches!(engine.route_once().await, Err(ReplicationError::Shutdown)));
    }

    #[tokio::test]
    async fn test_route_once_routes_and_closes_gaps() {
        let (engine, _tx) = engine(test_config());
        for id in 1..=3 {
            engine.store().insert(item_row(id)).await;
        }

        let report = engine.route_once().await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.channels.len(), 2);
        assert_eq!(report.rows_read(), 3);
        assert_eq!(report.data_events(), 6);
        assert_eq!(report.observed, 3);

        for id in 1..=3 {
            assert!(engine.store().is_routed(id).await);
        }
        let gaps = engine.store().gaps().await;
        assert!(gaps
            .iter()
            .any(|g| g.status == GapStatus::Open && g.start_id == 4));

        // Nothing new: the next pass reads nothing
        let report = engine.route_once().await.unwrap();
        assert_eq!(report.rows_read(), 0);

        let health = engine.health_check();
        assert_eq!(health.passes, 2);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.millis_since_success.is_some());
    }

    #[tokio::test]
    async fn test_background_loop_routes_new_rows() {
        let (mut engine, _tx) = engine(test_config());
        engine.start().await.unwrap();
        assert!(engine.is_running());
        assert!(engine.health_check().healthy);

        engine.store().insert(item_row(1)).await;

        let mut routed = false;
        for _ in 0..100 {
            if engine.store().is_routed(1).await {
                routed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(routed, "row was not routed by the background loop");

        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_disabled_loop_still_allows_route_once() {
        let mut config = test_config();
        config.settings.routing.enabled = false;
        let (mut engine, _tx) = engine(config);
        engine.start().await.unwrap();

        engine.store().insert(item_row(1)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!engine.store().is_routed(1).await);

        engine.route_once().await.unwrap();
        assert!(engine.store().is_routed(1).await);
        engine.shutdown().await;
    }
}
