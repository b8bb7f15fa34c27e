// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Router: assigns captured rows to target nodes and outgoing batches.
//!
//! One call to [`Router::route_channel()`] is one pass over one channel:
//!
//! ```text
//!  GapAwareReader ──take()──► one-row lookahead ──► per trigger router:
//!                             (transaction boundary)   candidates = nodes of target group
//!                                                      strategy.route() → node ids
//!                                                      − local node, − source node
//!                                                 ──► BatchAccumulator.add(node, row)
//!                                                 ──► close? → complete_batch hooks → commit
//!  EndOfStream ──► final commit ──► context_committed hooks ──► ChannelPassResult
//! ```
//!
//! A row that no router selects, or that belongs to a channel with
//! `ignore_data`, is still recorded against the unrouted node so the gap
//! tracker sees it as handled.
//!
//! # Failure
//!
//! Any error routing a row stops the reader and rolls back the batches not
//! yet committed. Rows of those batches are not reported as observed, so
//! their gaps stay open and the next pass reads them again.

pub mod context;
pub mod metadata;
pub mod strategy;

pub use context::{ContextValue, RouterContext, RoutingStats};
pub use metadata::{MetadataRouter, TriggerResync};
pub use strategy::{
    column_values, match_columns, parse_column_expressions, ColumnExpression, ColumnMap,
    MatchOp, MatchValue, NodeIds, RouteScript, RouterStrategy, ScriptRegistry,
};

use crate::batch::{BatchAccumulator, CloseReason};
use crate::cache::{MetadataCache, RoutingMetadata};
use crate::config::{ChannelConfig, ReaderConfig, RouterConfig};
use crate::error::Result;
use crate::metrics;
use crate::model::{ChangeRow, DataId, EventType, Gap, UNROUTED_NODE_ID};
use crate::reader::{GapAwareReader, ReadSummary, ReaderItem};
use crate::resilience::RateLimiter;
use crate::store::{ChangeStore, RoutingLookups};
use crate::topology::NodeDirectory;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Router id recorded on data events of unrouted rows.
pub const UNKNOWN_ROUTER_ID: &str = "?";

/// Outcome of one channel pass.
#[derive(Debug, Clone, Default)]
pub struct ChannelPassResult {
    pub channel_id: String,
    pub rows_read: u64,
    pub data_events: u64,
    pub batches: u64,
    pub unrouted: u64,
    /// Ids whose data events were committed, ascending.
    pub observed_ids: Vec<DataId>,
    /// The reader scanned its whole range and every row read was committed.
    pub all_data_read: bool,
    pub error: Option<String>,
}

impl ChannelPassResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-pass bookkeeping that is not router state.
#[derive(Default)]
struct PassState {
    /// Routed rows in open batches.
    pending_ids: Vec<DataId>,
    /// Routed rows in committed batches.
    observed_ids: Vec<DataId>,
    /// Strategies built this pass, by router id.
    strategies: HashMap<String, RouterStrategy>,
}

pub struct Router<S> {
    store: Arc<S>,
    cache: Arc<MetadataCache>,
    directory: Arc<dyn NodeDirectory>,
    metadata_router: Arc<MetadataRouter>,
    scripts: ScriptRegistry,
    rate_limiter: Option<RateLimiter>,
    reader_config: ReaderConfig,
}

impl<S: ChangeStore> Router<S> {
    pub fn new(
        store: Arc<S>,
        cache: Arc<MetadataCache>,
        directory: Arc<dyn NodeDirectory>,
        metadata_router: Arc<MetadataRouter>,
        reader_config: ReaderConfig,
    ) -> Self {
        Self {
            store,
            cache,
            directory,
            metadata_router,
            scripts: ScriptRegistry::new(),
            rate_limiter: None,
            reader_config,
        }
    }

    /// Register a script for `RouterType::Scripted { script: name }`.
    pub fn with_script(mut self, name: &str, script: Arc<dyn RouteScript>) -> Self {
        self.scripts.insert(name.to_string(), script);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Option<RateLimiter>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    /// Route the unrouted rows of `channel` inside `gaps`.
    ///
    /// Never returns an error: failures are reported in
    /// [`ChannelPassResult::error`] after the uncommitted work is rolled back.
    pub async fn route_channel(&self, channel: &ChannelConfig, gaps: Vec<Gap>) -> ChannelPassResult {
        let started = Instant::now();
        let metadata = self.cache.metadata().await;
        let mut ctx = RouterContext::new(channel.clone());
        let mut batches = BatchAccumulator::new(Arc::clone(&self.store), channel.clone());
        let mut pass = PassState::default();
        let mut reader = GapAwareReader::spawn(Arc::clone(&self.store), channel, gaps, &self.reader_config);

        let outcome = self
            .drain(&mut reader, &mut ctx, &mut batches, &metadata, &mut pass)
            .await;

        let mut result = ChannelPassResult {
            channel_id: channel.channel_id.clone(),
            ..Default::default()
        };
        match outcome {
            Ok(summary) => {
                result.all_data_read = summary.all_data_read && summary.error.is_none();
                result.error = summary.error;
                for strategy in pass.strategies.values() {
                    strategy.context_committed(&mut ctx).await;
                }
            }
            Err(e) => {
                reader.stop();
                batches.rollback();
                pass.pending_ids.clear();
                warn!(channel_id = %channel.channel_id, error = %e, "Routing pass failed");
                result.error = Some(e.to_string());
            }
        }
        reader.join().await;

        let stats = ctx.stats();
        result.rows_read = stats.rows_read;
        result.data_events = stats.data_events;
        result.batches = stats.batches_closed;
        result.unrouted = stats.rows_unrouted;
        pass.observed_ids.sort_unstable();
        result.observed_ids = pass.observed_ids;

        metrics::record_routing_pass(&channel.channel_id, result.rows_read, started.elapsed(), result.is_success());
        if result.rows_read > 0 {
            info!(
                channel_id = %channel.channel_id,
                rows = result.rows_read,
                data_events = result.data_events,
                batches = result.batches,
                unrouted = result.unrouted,
                router_ms = stats.router_time.as_millis() as u64,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Routed channel"
            );
        }
        result
    }

    /// Take rows until end of stream. Each row is routed once the next item
    /// is known, so the transaction boundary is exact.
    async fn drain(
        &self,
        reader: &mut GapAwareReader,
        ctx: &mut RouterContext,
        batches: &mut BatchAccumulator<S>,
        metadata: &RoutingMetadata,
        pass: &mut PassState,
    ) -> Result<ReadSummary> {
        let mut current: Option<ChangeRow> = None;
        loop {
            match reader.take().await? {
                ReaderItem::Row(next) => {
                    if let Some(row) = current.take() {
                        ctx.advance(row.transaction_id.as_deref(), Some(next.transaction_id.as_deref()));
                        self.route_row(row, ctx, batches, metadata, pass).await?;
                    }
                    current = Some(next);
                }
                ReaderItem::EndOfStream(summary) => {
                    if let Some(row) = current.take() {
                        ctx.advance(row.transaction_id.as_deref(), None);
                        self.route_row(row, ctx, batches, metadata, pass).await?;
                    }
                    self.commit(batches, ctx, pass, CloseReason::EndOfPass).await?;
                    return Ok(summary);
                }
            }
        }
    }

    async fn route_row(
        &self,
        row: ChangeRow,
        ctx: &mut RouterContext,
        batches: &mut BatchAccumulator<S>,
        metadata: &RoutingMetadata,
        pass: &mut PassState,
    ) -> Result<()> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }
        ctx.stats_mut().rows_read += 1;

        let me = self.directory.identity();
        let mut routed = false;
        if !ctx.channel().ignore_data {
            for trigger_router in metadata.trigger_routers_for(&row.snapshot.trigger_id) {
                let config = &trigger_router.router;
                if !event_enabled(config, row.event_type) {
                    continue;
                }
                let strategy = self.strategy_for(config, pass)?;
                let candidates = self.directory.nodes_in_group(&config.target_group_id);

                let started = Instant::now();
                let nodes = strategy.route(ctx, &row, &candidates, false).await.map_err(|e| {
                    metrics::record_router_error(strategy.type_name());
                    e
                })?;
                ctx.stats_mut().router_time += started.elapsed();

                let mut nodes = nodes.unwrap_or_default();
                nodes.remove(&me.node_id);
                if !config.ping_back_enabled {
                    if let Some(source) = &row.source_node_id {
                        nodes.remove(source);
                    }
                }
                for node_id in &nodes {
                    self.add_to_batch(node_id, &row, &config.router_id, ctx, batches, pass).await?;
                    routed = true;
                }
            }
        }

        if !routed {
            debug!(data_id = row.data_id, table = %row.table_name, "Row not routed to any node");
            self.add_to_batch(UNROUTED_NODE_ID, &row, UNKNOWN_ROUTER_ID, ctx, batches, pass)
                .await?;
            ctx.stats_mut().rows_unrouted += 1;
        }
        pass.pending_ids.push(row.data_id);

        if let Some(reason) = batches.needs_commit() {
            self.commit(batches, ctx, pass, reason).await?;
        }
        Ok(())
    }

    async fn add_to_batch(
        &self,
        node_id: &str,
        row: &ChangeRow,
        router_id: &str,
        ctx: &mut RouterContext,
        batches: &mut BatchAccumulator<S>,
        pass: &mut PassState,
    ) -> Result<()> {
        if batches.must_close_before(node_id, row) {
            self.commit(batches, ctx, pass, CloseReason::TransactionBoundary).await?;
        }
        batches
            .add(node_id, row, router_id, ctx.at_transaction_boundary())
            .await?;
        ctx.stats_mut().data_events += 1;
        Ok(())
    }

    /// Run `complete_batch` hooks, then persist every open batch.
    async fn commit(
        &self,
        batches: &mut BatchAccumulator<S>,
        ctx: &mut RouterContext,
        pass: &mut PassState,
        reason: CloseReason,
    ) -> Result<()> {
        if batches.is_empty() {
            return Ok(());
        }
        for batch in batches.open_batches() {
            for strategy in pass.strategies.values() {
                strategy.complete_batch(ctx, batch);
            }
        }
        let committed = batches.commit(reason).await?;
        ctx.stats_mut().batches_closed += committed.batches.len() as u64;
        let unrouted: u64 = committed
            .batches
            .iter()
            .filter(|b| b.is_unrouted())
            .map(|b| b.data_event_count)
            .sum();
        if unrouted > 0 {
            metrics::record_unrouted(&ctx.channel().channel_id, unrouted);
        }
        pass.observed_ids.append(&mut pass.pending_ids);
        Ok(())
    }

    fn strategy_for(&self, config: &RouterConfig, pass: &mut PassState) -> Result<RouterStrategy> {
        if let Some(strategy) = pass.strategies.get(&config.router_id) {
            return Ok(strategy.clone());
        }
        let lookups: Arc<dyn RoutingLookups> = Arc::clone(&self.store) as Arc<dyn RoutingLookups>;
        let strategy = RouterStrategy::from_config(config, lookups, &self.scripts, &self.metadata_router)?;
        pass.strategies.insert(config.router_id.clone(), strategy.clone());
        Ok(strategy)
    }
}

/// Whether the router syncs this kind of event.
fn event_enabled(router: &RouterConfig, event: EventType) -> bool {
    match event {
        EventType::Insert => router.sync_on_insert,
        EventType::Update => router.sync_on_update,
        EventType::Delete => router.sync_on_delete,
        _ => true,
    }
}
