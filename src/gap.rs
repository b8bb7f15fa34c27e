// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Gap tracking.
//!
//! A gap is an id interval that may still hold captured rows nobody has
//! routed. Ids are allocated before the capturing transaction commits, so a
//! row can appear below ids that were already routed. Gaps are how the
//! engine finds those late rows without rescanning everything.
//!
//! # One Pass
//!
//! ```text
//! find_gaps()                      reader scans gaps    reconcile(observed, all_read)
//!     │                                   │                        │
//!     ▼                                   ▼                        ▼
//! [1..=1 OPEN] [4..=50M OPEN]   ids seen: 1, 4, 5, 9    [1..=1 CLOSED]
//!                                                       [4..=5 CLOSED] [6..=8 OPEN]
//!                                                       [9..=9 CLOSED] [10..=10+50M OPEN]
//! ```
//!
//! The last gap is the open-ended tail. It is never closed for lack of data
//! because its upper bound is provisional; when data is found in it a new tail
//! starts just past the highest id seen.
//!
//! # Expiry
//!
//! An interior gap with no data becomes SKIPPED once the source can prove no
//! transaction is still pending that could land in it, or once it is older
//! than `stale_gap_timeout`. A create time further in the future than
//! `clock_sync_threshold` counts as fresh.
//!
//! # Concurrency
//!
//! Detection and reconcile run under one `tokio::sync::Mutex`, so two passes
//! never interleave gap writes.

use crate::config::GapConfig;
use crate::error::Result;
use crate::metrics;
use crate::model::{now_millis, DataId, Gap, GapStatus};
use crate::store::{GapStore, MutationStore, TransactionVisibility};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Share of `max_window` above which a non-tail gap is considered suspicious.
const SUSPICIOUS_GAP_RATIO: f64 = 0.75;

/// What one reconcile changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub opened: usize,
    pub closed: usize,
    pub skipped: usize,
    pub rejected: usize,
    /// Gaps whose expiry check failed and stayed OPEN.
    pub errors: usize,
}

/// Gap changes computed from observed ids, before expiry checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GapPlan {
    pub removed: Vec<Gap>,
    pub added: Vec<Gap>,
    /// Interior gaps with no observed data. Candidates for SKIPPED.
    pub empty: Vec<Gap>,
}

/// Split gaps around the ids observed in them.
///
/// `gaps` must be ordered and disjoint; `observed` is sorted. Gaps with data
/// are replaced by CLOSED runs for the data and OPEN gaps for the holes. If
/// the last gap held data, a new tail `(last + 1, last + 1 + max_window)`
/// replaces its remainder.
pub fn plan_reconcile(gaps: &[Gap], observed: &BTreeSet<DataId>, max_window: i64, now: i64) -> GapPlan {
    let mut plan = GapPlan::default();

    for (i, gap) in gaps.iter().enumerate() {
        let is_last = i + 1 == gaps.len();
        let ids: Vec<DataId> = observed.range(gap.start_id..=gap.end_id).copied().collect();

        if ids.is_empty() {
            if !is_last {
                plan.empty.push(gap.clone());
            }
            continue;
        }

        plan.removed.push(gap.clone());

        let mut cursor = gap.start_id;
        let mut run_start = ids[0];
        let mut run_end = ids[0];
        let mut runs = Vec::new();
        for &id in &ids[1..] {
            if id == run_end + 1 {
                run_end = id;
            } else {
                runs.push((run_start, run_end));
                run_start = id;
                run_end = id;
            }
        }
        runs.push((run_start, run_end));

        for (start, end) in runs {
            if start > cursor {
                plan.added.push(Gap::new(cursor, start - 1).with_create_time(now));
            }
            plan.added
                .push(Gap::new(start, end).with_status(GapStatus::Closed).with_create_time(now));
            cursor = end + 1;
        }

        if is_last {
            plan.added
                .push(Gap::new(cursor, cursor + max_window).with_create_time(now));
        } else if cursor <= gap.end_id {
            plan.added.push(Gap::new(cursor, gap.end_id).with_create_time(now));
        }
    }

    plan
}

/// Whether an empty gap may be skipped.
pub fn is_gap_expired(
    gap: &Gap,
    now: i64,
    visibility: TransactionVisibility,
    stale_timeout_ms: i64,
    clock_sync_threshold_ms: i64,
) -> bool {
    if gap.create_time - now > clock_sync_threshold_ms {
        return false;
    }
    let aged_out = now - gap.create_time > stale_timeout_ms;
    let no_pending = match visibility {
        TransactionVisibility::Unsupported => false,
        TransactionVisibility::NonePending => true,
        TransactionVisibility::EarliestPending(earliest) => {
            gap.create_time < earliest - clock_sync_threshold_ms
        }
    };
    no_pending || aged_out
}

/// Owner of the gap table.
pub struct GapTracker<S> {
    store: Arc<S>,
    config: GapConfig,
    host: String,
    /// OPEN gaps handed out by the latest `find_gaps()`.
    gaps: Mutex<Vec<Gap>>,
}

impl<S: MutationStore + GapStore> GapTracker<S> {
    pub fn new(store: Arc<S>, config: GapConfig) -> Self {
        Self {
            store,
            config,
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            gaps: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &GapConfig {
        &self.config
    }

    /// OPEN gaps to scan this pass, ordered by start id.
    ///
    /// Prunes invalid gaps when configured, and adds a tail gap if none of
    /// the open gaps is large enough to bound the scan.
    pub async fn find_gaps(&self) -> Result<Vec<Gap>> {
        let mut guard = self.gaps.lock().await;
        let mut gaps = self.store.load_open_gaps().await?;
        gaps.sort_by_key(|g| (g.start_id, g.end_id));

        if self.config.detect_invalid_gaps {
            let (kept, removed, added) = prune_invalid_gaps(&gaps, self.config.max_window);
            if !removed.is_empty() {
                warn!(
                    removed = removed.len(),
                    added = added.len(),
                    "Pruned invalid gaps"
                );
                let added = self.stamp(added);
                self.store.apply_gap_changes(&removed, &added).await?;
            }
            gaps = kept;
        }

        let tail_size = self.config.max_window - 1;
        if !gaps.iter().any(|g| g.size() >= tail_size) {
            let start = match gaps.last() {
                Some(last) => last.end_id + 1,
                None => self.first_tail_start().await?,
            };
            let tail = Gap::new(start, start + self.config.max_window);
            let tail = self.stamp(vec![tail]);
            info!(start_id = start, end_id = start + self.config.max_window, "Created tail gap");
            self.store.apply_gap_changes(&[], &tail).await?;
            gaps.extend(tail);
        }

        metrics::set_open_gaps(gaps.len());
        debug!(gap_count = gaps.len(), "Found gaps");
        *guard = gaps.clone();
        Ok(gaps)
    }

    /// Start of the tail when no OPEN gap exists: just past the highest
    /// routed id or resolved gap, or at the lowest staged row when that is
    /// higher.
    async fn first_tail_start(&self) -> Result<DataId> {
        let resolved_end = self.store.load_all_gaps().await?.iter().map(|g| g.end_id).max();
        let below_first_row = self.store.min_data_id().await?.map(|id| id - 1);
        let last_routed = self.store.max_routed_data_id().await?;
        debug!(?resolved_end, ?below_first_row, ?last_routed, "Seeding tail gap");
        Ok([resolved_end, below_first_row, last_routed]
            .into_iter()
            .flatten()
            .max()
            .map_or(0, |id| id + 1))
    }

    /// Fold the ids routed this pass into the gap table.
    ///
    /// `all_data_read` is false when any channel stopped early (row limit,
    /// error, abort). Empty gaps then need the store to confirm they hold no
    /// unrouted rows before they are skipped.
    pub async fn reconcile(&self, observed: &[DataId], all_data_read: bool) -> Result<ReconcileReport> {
        let mut guard = self.gaps.lock().await;
        if guard.is_empty() {
            return Ok(ReconcileReport::default());
        }

        let observed: BTreeSet<DataId> = observed.iter().copied().collect();
        let now = now_millis();
        let plan = plan_reconcile(&guard, &observed, self.config.max_window, now);
        let mut report = ReconcileReport::default();

        let mut removed = plan.removed;
        let mut added = Vec::with_capacity(plan.added.len());

        // Everything that still exists after this reconcile, for duplicate checks.
        let mut live: BTreeSet<(DataId, DataId)> = guard
            .iter()
            .filter(|g| !removed.iter().any(|r| r.same_range(g)))
            .map(|g| (g.start_id, g.end_id))
            .collect();

        for gap in plan.added {
            if let Some(reason) = self.validate_new_gap(&gap, &live) {
                warn!(
                    start_id = gap.start_id,
                    end_id = gap.end_id,
                    reason,
                    "Rejected new gap"
                );
                metrics::record_gap_rejected(reason);
                report.rejected += 1;
                continue;
            }
            live.insert((gap.start_id, gap.end_id));
            match gap.status {
                GapStatus::Closed => report.closed += 1,
                _ => report.opened += 1,
            }
            added.push(gap);
        }

        let skipped = self.expire_empty_gaps(&plan.empty, now, all_data_read, &mut report).await?;
        for gap in &skipped {
            removed.push(gap.clone());
            added.push(gap.clone().with_status(GapStatus::Skipped));
        }
        report.skipped = skipped.len();
        log_skipped_gaps(&skipped);

        let added = self.stamp(added);
        self.store.apply_gap_changes(&removed, &added).await?;

        let open: Vec<Gap> = guard
            .iter()
            .filter(|g| !removed.iter().any(|r| r.same_range(g)))
            .cloned()
            .chain(added.iter().filter(|g| g.status == GapStatus::Open).cloned())
            .collect();
        metrics::set_open_gaps(open.len());
        metrics::record_gap_changes(report.opened, report.closed, report.skipped);
        *guard = Vec::new();

        debug!(
            opened = report.opened,
            closed = report.closed,
            skipped = report.skipped,
            rejected = report.rejected,
            all_data_read,
            "Reconciled gaps"
        );
        Ok(report)
    }

    /// Rebuild the gap table from routed data. Run once at startup to repair
    /// gaps left behind when a pass committed its batches but crashed before
    /// writing its gap changes.
    pub async fn full_gap_analysis(&self) -> Result<ReconcileReport> {
        info!("Full gap analysis is running");
        let started = std::time::Instant::now();
        let gaps = self.find_gaps().await?;

        let mut observed = Vec::new();
        for gap in &gaps {
            observed.extend(self.store.routed_ids_in_range(gap.start_id, gap.end_id).await?);
        }

        let report = self.reconcile(&observed, false).await?;
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            routed_ids = observed.len(),
            opened = report.opened,
            closed = report.closed,
            "Full gap analysis is done"
        );
        Ok(report)
    }

    /// Delete CLOSED/SKIPPED gaps older than the retention period.
    pub async fn purge_resolved(&self) -> Result<u64> {
        let _guard = self.gaps.lock().await;
        let retention = self.config.resolved_gap_retention_duration().as_millis() as i64;
        let purged = self.store.purge_resolved_gaps(now_millis() - retention).await?;
        if purged > 0 {
            info!(purged, "Purged resolved gaps");
            metrics::record_gaps_purged(purged);
        }
        Ok(purged)
    }

    async fn expire_empty_gaps(
        &self,
        empty: &[Gap],
        now: i64,
        all_data_read: bool,
        report: &mut ReconcileReport,
    ) -> Result<Vec<Gap>> {
        if empty.is_empty() {
            return Ok(Vec::new());
        }
        let visibility = self.store.transaction_visibility().await?;
        let stale_ms = self.config.stale_gap_timeout_duration().as_millis() as i64;
        let clock_ms = self.config.clock_sync_threshold_duration().as_millis() as i64;

        let mut skipped = Vec::new();
        for gap in empty {
            if !is_gap_expired(gap, now, visibility, stale_ms, clock_ms) {
                continue;
            }
            if !all_data_read {
                match self.store.count_unrouted_in_range(gap.start_id, gap.end_id).await {
                    Ok(0) => {}
                    Ok(count) => {
                        debug!(start_id = gap.start_id, end_id = gap.end_id, count, "Expired gap still holds rows");
                        continue;
                    }
                    Err(e) => {
                        warn!(
                            start_id = gap.start_id,
                            end_id = gap.end_id,
                            error = %e,
                            "Gap expiry check failed, leaving gap open"
                        );
                        report.errors += 1;
                        continue;
                    }
                }
            }
            skipped.push(gap.clone());
        }
        Ok(skipped)
    }

    fn validate_new_gap(&self, gap: &Gap, live: &BTreeSet<(DataId, DataId)>) -> Option<&'static str> {
        if !self.config.detect_invalid_gaps {
            return None;
        }
        if gap.start_id > gap.end_id {
            return Some("reversed");
        }
        if live.contains(&(gap.start_id, gap.end_id)) {
            return Some("duplicate");
        }
        let max = self.config.max_window;
        if gap.status == GapStatus::Open
            && gap.size() < max - 1
            && gap.size() as f64 >= max as f64 * SUSPICIOUS_GAP_RATIO
        {
            return Some("suspicious_size");
        }
        None
    }

    fn stamp(&self, gaps: Vec<Gap>) -> Vec<Gap> {
        gaps.into_iter()
            .map(|mut g| {
                g.last_update_host = self.host.clone();
                g
            })
            .collect()
    }
}

/// Remove gaps left inconsistent by crashes.
///
/// Returns `(kept, removed, added)`: nested gaps and gaps past the tail are
/// removed and re-added as SKIPPED; partially overlapping gaps are merged.
pub fn prune_invalid_gaps(gaps: &[Gap], max_window: i64) -> (Vec<Gap>, Vec<Gap>, Vec<Gap>) {
    let mut kept: Vec<Gap> = Vec::with_capacity(gaps.len());
    let mut removed = Vec::new();
    let mut added = Vec::new();
    let mut tail_found = false;
    let tail_size = max_window - 1;

    let skip = |gap: &Gap, removed: &mut Vec<Gap>, added: &mut Vec<Gap>| {
        removed.push(gap.clone());
        added.push(gap.clone().with_status(GapStatus::Skipped));
    };

    for cur in gaps {
        if tail_found {
            warn!(start_id = cur.start_id, end_id = cur.end_id, "Removing gap found after tail gap");
            skip(cur, &mut removed, &mut added);
            continue;
        }

        let Some(prev) = kept.last().cloned() else {
            tail_found = cur.size() >= tail_size;
            kept.push(cur.clone());
            continue;
        };

        if prev.contains_gap(cur) {
            warn!(start_id = cur.start_id, end_id = cur.end_id, "Removing nested gap");
            skip(cur, &mut removed, &mut added);
        } else if cur.contains_gap(&prev) {
            warn!(start_id = prev.start_id, end_id = prev.end_id, "Removing nested gap");
            skip(&prev, &mut removed, &mut added);
            kept.pop();
            tail_found = cur.size() >= tail_size;
            kept.push(cur.clone());
        } else if prev.overlaps(cur) {
            let is_tail = cur.size() >= tail_size;
            let end = if is_tail {
                prev.start_id + tail_size
            } else {
                prev.end_id.max(cur.end_id)
            };
            let merged = Gap::new(prev.start_id, end).with_create_time(prev.create_time);
            warn!(
                start_id = merged.start_id,
                end_id = merged.end_id,
                "Merging overlapping gaps"
            );
            removed.push(prev.clone());
            removed.push(cur.clone());
            added.push(merged.clone());
            kept.pop();
            tail_found = merged.size() >= tail_size;
            kept.push(merged);
        } else {
            tail_found = cur.size() >= tail_size;
            kept.push(cur.clone());
        }
    }

    (kept, removed, added)
}

fn log_skipped_gaps(skipped: &[Gap]) {
    let Some(first) = skipped.first() else {
        return;
    };
    let min_id = skipped.iter().map(|g| g.start_id).min().unwrap_or(first.start_id);
    let max_id = skipped.iter().map(|g| g.end_id).max().unwrap_or(first.end_id);
    let min_time = skipped.iter().map(|g| g.create_time).min().unwrap_or(first.create_time);
    let max_time = skipped.iter().map(|g| g.create_time).max().unwrap_or(first.create_time);
    info!(
        count = skipped.len(),
        min_id,
        max_id,
        min_create_time = min_time,
        max_create_time = max_time,
        "Expired data gaps"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeRow, DataEvent, EventType, SchemaSnapshot};
    use crate::store::{BatchStore, InMemoryStore};

    const MAX: i64 = 1000;

    fn config() -> GapConfig {
        GapConfig {
            max_window: MAX,
            ..Default::default()
        }
    }

    fn ids(list: &[DataId]) -> BTreeSet<DataId> {
        list.iter().copied().collect()
    }

    fn ranges(gaps: &[Gap]) -> Vec<(DataId, DataId, GapStatus)> {
        gaps.iter().map(|g| (g.start_id, g.end_id, g.status)).collect()
    }

    async fn stage(store: &InMemoryStore, id: DataId) {
        let snapshot = Arc::new(SchemaSnapshot::new(1, "t", "t", &["ID"], &["ID"]));
        store
            .insert(ChangeRow::new(id, EventType::Insert, "default", snapshot).with_row_data(&[Some("1")]))
            .await;
    }

    #[test]
    fn test_plan_single_id_gap_closes_and_moves_tail() {
        let plan = plan_reconcile(&[Gap::new(1, 1)], &ids(&[1]), MAX, 0);
        assert_eq!(
            ranges(&plan.added),
            vec![(1, 1, GapStatus::Closed), (2, 2 + MAX, GapStatus::Open)]
        );
        assert_eq!(plan.removed.len(), 1);
        assert!(plan.empty.is_empty());
    }

    #[test]
    fn test_plan_splits_interior_gap() {
        let gaps = vec![Gap::new(1, 10), Gap::new(20, 20 + MAX)];
        let plan = plan_reconcile(&gaps, &ids(&[3, 4, 7]), MAX, 0);
        assert_eq!(
            ranges(&plan.added),
            vec![
                (1, 2, GapStatus::Open),
                (3, 4, GapStatus::Closed),
                (5, 6, GapStatus::Open),
                (7, 7, GapStatus::Closed),
                (8, 10, GapStatus::Open),
            ]
        );
        // The tail had no data: untouched and not an expiry candidate.
        assert_eq!(plan.removed.len(), 1);
        assert!(plan.empty.is_empty());
    }

    #[test]
    fn test_plan_empty_interior_gap_is_candidate() {
        let gaps = vec![Gap::new(1, 5), Gap::new(6, 6 + MAX)];
        let plan = plan_reconcile(&gaps, &ids(&[6]), MAX, 0);
        assert_eq!(ranges(&plan.empty), vec![(1, 5, GapStatus::Open)]);
        assert_eq!(
            ranges(&plan.added),
            vec![(6, 6, GapStatus::Closed), (7, 7 + MAX, GapStatus::Open)]
        );
    }

    #[test]
    fn test_expiry_rules() {
        let now = 1_000_000;
        let gap = Gap::new(1, 1).with_create_time(now - 10_000);
        assert!(!is_gap_expired(&gap, now, TransactionVisibility::Unsupported, 60_000, 1_000));
        assert!(is_gap_expired(&gap, now, TransactionVisibility::Unsupported, 5_000, 1_000));
        assert!(is_gap_expired(&gap, now, TransactionVisibility::NonePending, 60_000, 1_000));
        assert!(is_gap_expired(&gap, now, TransactionVisibility::EarliestPending(now), 60_000, 1_000));
        assert!(!is_gap_expired(
            &gap,
            now,
            TransactionVisibility::EarliestPending(now - 10_500),
            60_000,
            1_000
        ));

        // Create time far in the future: clock skew, treat as fresh.
        let future = Gap::new(1, 1).with_create_time(now + 120_000);
        assert!(!is_gap_expired(&future, now, TransactionVisibility::NonePending, 0, 60_000));
    }

    #[test]
    fn test_prune_nested_and_overlapping() {
        let gaps = vec![
            Gap::new(1, 100),
            Gap::new(10, 20),
            Gap::new(90, 150),
            Gap::new(200, 200 + MAX),
            Gap::new(5000, 5010),
        ];
        let (kept, removed, added) = prune_invalid_gaps(&gaps, MAX);
        assert_eq!(
            kept.iter().map(|g| (g.start_id, g.end_id)).collect::<Vec<_>>(),
            vec![(1, 150), (200, 200 + MAX)]
        );
        assert_eq!(removed.len(), 4);
        assert!(added.contains(&Gap::new(10, 20).with_status(GapStatus::Skipped).with_create_time(gaps[1].create_time)));
        assert!(added.iter().any(|g| g.start_id == 5000 && g.status == GapStatus::Skipped));
    }

    #[tokio::test]
    async fn test_find_gaps_creates_tail_on_empty_store() {
        let store = Arc::new(InMemoryStore::new());
        let tracker = GapTracker::new(Arc::clone(&store), config());
        let gaps = tracker.find_gaps().await.unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!((gaps[0].start_id, gaps[0].end_id), (0, MAX));
        assert_eq!(store.gaps().await.len(), 1);

        // Second call reuses the stored tail
        let again = tracker.find_gaps().await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(store.gaps().await.len(), 1);
    }

    #[tokio::test]
    async fn test_first_tail_starts_after_routed_data() {
        let store = Arc::new(InMemoryStore::new());
        for id in [4000, 4001, 5000] {
            stage(&store, id).await;
        }
        let events: Vec<DataEvent> = [4000, 4001]
            .into_iter()
            .map(|id| DataEvent {
                data_id: id,
                batch_id: 1,
                router_id: "r".into(),
            })
            .collect();
        store.save_routing(&[], &events).await.unwrap();

        let tracker = GapTracker::new(Arc::clone(&store), config());
        let gaps = tracker.find_gaps().await.unwrap();
        assert_eq!(ranges(&gaps), vec![(4002, 4002 + MAX, GapStatus::Open)]);
        assert!(gaps[0].contains(5000));

        tracker.reconcile(&[5000], true).await.unwrap();
        let stored = store.gaps().await;
        assert!(stored
            .iter()
            .any(|g| g.status == GapStatus::Closed && g.start_id == 5000 && g.end_id == 5000));
        assert!(stored.iter().any(|g| g.status == GapStatus::Open && g.start_id == 5001));
    }

    #[tokio::test]
    async fn test_first_tail_starts_at_lowest_row() {
        let store = Arc::new(InMemoryStore::new());
        stage(&store, 7000).await;
        stage(&store, 7003).await;

        let tracker = GapTracker::new(Arc::clone(&store), config());
        let gaps = tracker.find_gaps().await.unwrap();
        assert_eq!(ranges(&gaps), vec![(7000, 7000 + MAX, GapStatus::Open)]);
    }

    #[tokio::test]
    async fn test_first_tail_starts_after_resolved_gaps() {
        let store = Arc::new(InMemoryStore::new());
        store
            .apply_gap_changes(&[], &[Gap::new(1, 40).with_status(GapStatus::Closed)])
            .await
            .unwrap();

        let tracker = GapTracker::new(Arc::clone(&store), config());
        let gaps = tracker.find_gaps().await.unwrap();
        assert_eq!(ranges(&gaps), vec![(41, 41 + MAX, GapStatus::Open)]);
    }

    #[tokio::test]
    async fn test_reconcile_persists_closed_and_tail() {
        let store = Arc::new(InMemoryStore::new());
        store.apply_gap_changes(&[], &[Gap::new(1, 1)]).await.unwrap();
        let tracker = GapTracker::new(Arc::clone(&store), config());

        // (1,1) is too small to be a tail, so one is appended after it.
        let gaps = tracker.find_gaps().await.unwrap();
        assert_eq!(ranges(&gaps), vec![(1, 1, GapStatus::Open), (2, 2 + MAX, GapStatus::Open)]);

        let report = tracker.reconcile(&[1], true).await.unwrap();
        assert_eq!(report.closed, 1);
        let stored = store.gaps().await;
        assert_eq!(
            ranges(&stored),
            vec![(1, 1, GapStatus::Closed), (2, 2 + MAX, GapStatus::Open)]
        );
    }

    #[tokio::test]
    async fn test_stale_gap_skipped_only_when_empty() {
        let store = Arc::new(InMemoryStore::new());
        let old = now_millis() - 3_600_000;
        store
            .apply_gap_changes(
                &[],
                &[
                    Gap::new(1, 5).with_create_time(old),
                    Gap::new(6, 10).with_create_time(old),
                    Gap::new(11, 11 + MAX).with_create_time(old),
                ],
            )
            .await
            .unwrap();
        // Row 7 exists but was not read this pass.
        stage(&store, 7).await;

        let tracker = GapTracker::new(Arc::clone(&store), config());
        tracker.find_gaps().await.unwrap();
        let report = tracker.reconcile(&[], false).await.unwrap();
        assert_eq!(report.skipped, 1);

        let stored = store.gaps().await;
        assert!(stored.iter().any(|g| g.start_id == 1 && g.status == GapStatus::Skipped));
        assert!(stored.iter().any(|g| g.start_id == 6 && g.status == GapStatus::Open));
    }

    #[tokio::test]
    async fn test_visibility_none_pending_skips_fresh_gaps() {
        let store = Arc::new(InMemoryStore::new());
        store
            .apply_gap_changes(&[], &[Gap::new(1, 5), Gap::new(6, 6 + MAX)])
            .await
            .unwrap();
        store.set_visibility(TransactionVisibility::NonePending).await;

        let tracker = GapTracker::new(Arc::clone(&store), config());
        tracker.find_gaps().await.unwrap();
        let report = tracker.reconcile(&[], true).await.unwrap();
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_detection_is_idempotent_without_new_data() {
        let store = Arc::new(InMemoryStore::new());
        store
            .apply_gap_changes(&[], &[Gap::new(1, 5), Gap::new(6, 6 + MAX)])
            .await
            .unwrap();
        let tracker = GapTracker::new(Arc::clone(&store), config());

        tracker.find_gaps().await.unwrap();
        tracker.reconcile(&[], true).await.unwrap();
        let first: Vec<_> = ranges(&store.gaps().await);

        tracker.find_gaps().await.unwrap();
        tracker.reconcile(&[], true).await.unwrap();
        assert_eq!(ranges(&store.gaps().await), first);
    }

    #[tokio::test]
    async fn test_full_gap_analysis_closes_routed_ids() {
        let store = Arc::new(InMemoryStore::new());
        store.apply_gap_changes(&[], &[Gap::new(1, 1 + MAX)]).await.unwrap();
        for id in 1..=3 {
            stage(&store, id).await;
        }
        // Routed before a crash; the gap update never happened.
        let events: Vec<DataEvent> = (1..=3)
            .map(|id| DataEvent {
                data_id: id,
                batch_id: 1,
                router_id: "r".into(),
            })
            .collect();
        store.save_routing(&[], &events).await.unwrap();

        let tracker = GapTracker::new(Arc::clone(&store), config());
        let report = tracker.full_gap_analysis().await.unwrap();
        assert_eq!(report.closed, 1);

        let open = store.load_open_gaps().await.unwrap();
        assert_eq!(ranges(&open), vec![(4, 4 + MAX, GapStatus::Open)]);
    }

    #[tokio::test]
    async fn test_suspicious_gap_rejected() {
        let store = Arc::new(InMemoryStore::new());
        store.apply_gap_changes(&[], &[Gap::new(1, 1 + MAX)]).await.unwrap();
        let tracker = GapTracker::new(Arc::clone(&store), config());
        tracker.find_gaps().await.unwrap();

        // A hole of 899 ids opens in front of id 900.
        let report = tracker.reconcile(&[900], true).await.unwrap();
        assert_eq!(report.rejected, 1);
        assert!(!store.gaps().await.iter().any(|g| g.start_id == 1 && g.status == GapStatus::Open));
    }

    #[tokio::test]
    async fn test_purge_resolved() {
        let store = Arc::new(InMemoryStore::new());
        let old = now_millis() - 2 * 24 * 3_600_000;
        store
            .apply_gap_changes(
                &[],
                &[
                    Gap::new(1, 1).with_status(GapStatus::Closed).with_create_time(old),
                    Gap::new(2, 2 + MAX).with_create_time(old),
                ],
            )
            .await
            .unwrap();
        let tracker = GapTracker::new(Arc::clone(&store), config());
        assert_eq!(tracker.purge_resolved().await.unwrap(), 1);
        assert_eq!(store.gaps().await.len(), 1);
    }
}
