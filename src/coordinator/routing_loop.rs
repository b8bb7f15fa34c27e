// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Routing pass and the background loops that drive it.
//!
//! A pass is:
//! 1. `find_gaps()` once for the whole pass (gaps are global, not per channel)
//! 2. every enabled channel routed concurrently, up to `max_concurrent_channels`
//! 3. one `reconcile()` over the union of ids the channels committed
//!
//! Passes never overlap: `route_once()` and the background loop share one lock.

use super::types::PassReport;
use crate::cache::MetadataCache;
use crate::error::Result;
use crate::gap::GapTracker;
use crate::model::DataId;
use crate::resilience::RetryConfig;
use crate::router::{ChannelPassResult, Router};
use crate::store::ChangeStore;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, info_span, instrument, warn, Instrument};

pub(crate) struct PassRunner<S> {
    gap_tracker: Arc<GapTracker<S>>,
    router: Arc<Router<S>>,
    cache: Arc<MetadataCache>,
    max_concurrent_channels: usize,
    pass_lock: Mutex<()>,
    passes: AtomicU64,
    consecutive_failures: AtomicUsize,
    /// Unix millis of the last successful pass, 0 if none.
    last_success_ms: AtomicI64,
}

impl<S: ChangeStore> PassRunner<S> {
    pub(crate) fn new(
        gap_tracker: Arc<GapTracker<S>>,
        router: Arc<Router<S>>,
        cache: Arc<MetadataCache>,
        max_concurrent_channels: usize,
    ) -> Self {
        Self {
            gap_tracker,
            router,
            cache,
            max_concurrent_channels: max_concurrent_channels.max(1),
            pass_lock: Mutex::new(()),
            passes: AtomicU64::new(0),
            consecutive_failures: AtomicUsize::new(0),
            last_success_ms: AtomicI64::new(0),
        }
    }

    pub(crate) fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub(crate) fn consecutive_failures(&self) -> usize {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn millis_since_success(&self) -> Option<u64> {
        let last = self.last_success_ms.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        Some((chrono::Utc::now().timestamp_millis() - last).max(0) as u64)
    }

    /// Run one full pass.
    ///
    /// Channel failures do not fail the pass: they are reported per channel
    /// and their ids stay in open gaps. Only gap table errors are returned.
    #[instrument(skip_all)]
    pub(crate) async fn run(&self) -> Result<PassReport> {
        let _pass = self.pass_lock.lock().await;
        let started = Instant::now();

        let outcome = self.route_all().await;
        self.passes.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(mut report) => {
                report.duration = started.elapsed();
                if report.is_success() {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    self.last_success_ms
                        .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
                } else {
                    self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        failed_channels = ?report.failed_channels(),
                        "Routing pass finished with channel failures"
                    );
                }
                if report.rows_read() > 0 {
                    info!(
                        rows_read = report.rows_read(),
                        data_events = report.data_events(),
                        gaps_opened = report.gaps.opened,
                        gaps_closed = report.gaps.closed,
                        gaps_skipped = report.gaps.skipped,
                        duration_ms = report.duration.as_millis() as u64,
                        "Routing pass complete"
                    );
                } else {
                    debug!(
                        gaps_skipped = report.gaps.skipped,
                        "Routing pass complete, nothing to route"
                    );
                }
                Ok(report)
            }
            Err(e) => {
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Routing pass failed");
                Err(e)
            }
        }
    }

    async fn route_all(&self) -> Result<PassReport> {
        let gaps = self.gap_tracker.find_gaps().await?;
        let channels = self.cache.metadata().await.enabled_channels();

        let router = &self.router;
        let futures: Vec<_> = channels
            .iter()
            .map(|channel| router.route_channel(channel, gaps.clone()))
            .collect();
        let results: Vec<ChannelPassResult> = stream::iter(futures)
            .buffer_unordered(self.max_concurrent_channels)
            .collect()
            .await;

        let all_data_read = results.iter().all(|r| r.all_data_read);
        let observed = union_observed(&results);
        let gap_report = self.gap_tracker.reconcile(&observed, all_data_read).await?;

        let mut results = results;
        results.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));

        Ok(PassReport {
            channels: results,
            gaps: gap_report,
            all_data_read,
            observed: observed.len(),
            duration: Duration::ZERO,
        })
    }
}

/// Ids committed by any channel, ascending and deduplicated.
pub(crate) fn union_observed(results: &[ChannelPassResult]) -> Vec<DataId> {
    let mut ids: Vec<DataId> = results
        .iter()
        .flat_map(|r| r.observed_ids.iter().copied())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Run passes every `interval` until shutdown.
///
/// After a failed pass the next one waits for the daemon backoff instead of
/// the interval, so a broken store is not hammered.
pub(crate) async fn run_routing_loop<S: ChangeStore>(
    runner: Arc<PassRunner<S>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = info_span!("routing_loop", interval_ms = interval.as_millis() as u64);
    async move {
        info!("Starting routing loop");
        let backoff = RetryConfig::daemon();

        loop {
            let failures = runner.consecutive_failures();
            let wait = if failures == 0 {
                interval
            } else {
                backoff.delay_for_attempt(failures).max(interval)
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    // Errors are logged and counted inside run().
                    let _ = runner.run().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Routing loop received shutdown signal");
                        break;
                    }
                }
            }
        }

        info!("Routing loop stopped");
    }
    .instrument(span)
    .await
}

/// Purge resolved gaps every `interval` until shutdown.
pub(crate) async fn run_purge_loop<S: ChangeStore>(
    gap_tracker: Arc<GapTracker<S>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = info_span!("gap_purge", interval_ms = interval.as_millis() as u64);
    async move {
        let mut timer = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so startup is not slowed.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = gap_tracker.purge_resolved().await {
                        warn!(error = %e, "Failed to purge resolved gaps");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Gap purge task stopping");
                        break;
                    }
                }
            }
        }
    }
    .instrument(span)
    .await
}
