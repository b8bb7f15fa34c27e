// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory store.
//!
//! Same semantics as [`SqliteStore`](super::SqliteStore) without a database.
//! Used by tests and by embedders that stage rows themselves. Transaction
//! visibility is settable so gap expiry can be driven deterministically.

use super::{
    BatchStore, BoxFuture, GapStore, MutationStore, RoutingLookups, RowStream, ScanFilter,
    TransactionVisibility,
};
use crate::error::Result;
use crate::model::{BatchStatus, ChangeRow, DataEvent, DataId, Gap, GapStatus, OutgoingBatch};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;

#[derive(Default)]
struct State {
    rows: BTreeMap<DataId, ChangeRow>,
    gaps: BTreeMap<(DataId, DataId), Gap>,
    batches: BTreeMap<i64, OutgoingBatch>,
    events: Vec<DataEvent>,
    routed: HashSet<DataId>,
    next_batch_id: i64,
    next_data_id: DataId,
    visibility: Option<TransactionVisibility>,
    /// table → rows of (column → value)
    lookup_tables: HashMap<String, Vec<HashMap<String, String>>>,
    subselect_results: HashMap<String, Vec<String>>,
}

/// Store holding everything in process memory.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a captured row. A non-positive id is replaced by the next id.
    pub async fn insert(&self, mut row: ChangeRow) -> DataId {
        let mut state = self.state.lock().await;
        if row.data_id <= 0 {
            row.data_id = state.next_data_id + 1;
        }
        state.next_data_id = state.next_data_id.max(row.data_id);
        let id = row.data_id;
        state.rows.insert(id, row);
        id
    }

    pub async fn set_visibility(&self, visibility: TransactionVisibility) {
        self.state.lock().await.visibility = Some(visibility);
    }

    /// Add a row to a lookup table used by lookup-table routers.
    pub async fn add_lookup_row(&self, table: &str, columns: &[(&str, &str)]) {
        let row = columns
            .iter()
            .map(|(k, v)| (k.to_ascii_uppercase(), v.to_string()))
            .collect();
        self.state
            .lock()
            .await
            .lookup_tables
            .entry(table.to_ascii_lowercase())
            .or_default()
            .push(row);
    }

    /// Canned result for a subselect expression, returned whatever the bindings.
    pub async fn set_subselect_result(&self, sql: &str, node_ids: &[&str]) {
        self.state
            .lock()
            .await
            .subselect_results
            .insert(sql.to_string(), node_ids.iter().map(|s| s.to_string()).collect());
    }

    pub async fn gaps(&self) -> Vec<Gap> {
        self.state.lock().await.gaps.values().cloned().collect()
    }

    pub async fn data_events(&self) -> Vec<DataEvent> {
        self.state.lock().await.events.clone()
    }

    pub async fn batches(&self) -> Vec<OutgoingBatch> {
        self.state.lock().await.batches.values().cloned().collect()
    }

    pub async fn is_routed(&self, data_id: DataId) -> bool {
        self.state.lock().await.routed.contains(&data_id)
    }
}

impl MutationStore for InMemoryStore {
    fn stream_changes<'a>(
        &'a self,
        channel_id: &'a str,
        filter: &'a ScanFilter,
        _page_size: usize,
    ) -> RowStream<'a> {
        futures::stream::once(async move {
            let state = self.state.lock().await;
            let rows: Vec<Result<ChangeRow>> = state
                .rows
                .values()
                .filter(|r| r.channel_id == channel_id)
                .filter(|r| filter.matches(r.data_id))
                .filter(|r| !state.routed.contains(&r.data_id))
                .cloned()
                .map(Ok)
                .collect();
            futures::stream::iter(rows)
        })
        .flatten()
        .boxed()
    }

    fn routed_ids_in_range(&self, start: DataId, end: DataId) -> BoxFuture<'_, Vec<DataId>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let mut ids: Vec<DataId> = state
                .routed
                .iter()
                .copied()
                .filter(|id| *id >= start && *id <= end)
                .collect();
            ids.sort_unstable();
            Ok(ids)
        })
    }

    fn count_unrouted_in_range(&self, start: DataId, end: DataId) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .rows
                .range(start..=end)
                .filter(|(id, _)| !state.routed.contains(id))
                .count() as u64)
        })
    }

    fn min_data_id(&self) -> BoxFuture<'_, Option<DataId>> {
        Box::pin(async move { Ok(self.state.lock().await.rows.keys().next().copied()) })
    }

    fn max_routed_data_id(&self) -> BoxFuture<'_, Option<DataId>> {
        Box::pin(async move { Ok(self.state.lock().await.routed.iter().max().copied()) })
    }

    fn transaction_visibility(&self) -> BoxFuture<'_, TransactionVisibility> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .await
                .visibility
                .unwrap_or(TransactionVisibility::Unsupported))
        })
    }
}

impl GapStore for InMemoryStore {
    fn load_open_gaps(&self) -> BoxFuture<'_, Vec<Gap>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .gaps
                .values()
                .filter(|g| g.status == GapStatus::Open)
                .cloned()
                .collect())
        })
    }

    fn load_all_gaps(&self) -> BoxFuture<'_, Vec<Gap>> {
        Box::pin(async move { Ok(self.state.lock().await.gaps.values().cloned().collect()) })
    }

    fn apply_gap_changes<'a>(&'a self, removed: &'a [Gap], added: &'a [Gap]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            for gap in removed {
                state.gaps.remove(&(gap.start_id, gap.end_id));
            }
            for gap in added {
                state.gaps.insert((gap.start_id, gap.end_id), gap.clone());
            }
            Ok(())
        })
    }

    fn purge_resolved_gaps(&self, older_than: i64) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let before = state.gaps.len();
            state
                .gaps
                .retain(|_, g| g.status == GapStatus::Open || g.create_time >= older_than);
            Ok((before - state.gaps.len()) as u64)
        })
    }
}

impl BatchStore for InMemoryStore {
    fn allocate_batch_id(&self) -> BoxFuture<'_, i64> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.next_batch_id += 1;
            Ok(state.next_batch_id)
        })
    }

    fn save_routing<'a>(&'a self, batches: &'a [OutgoingBatch], events: &'a [DataEvent]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            for batch in batches {
                state.batches.insert(batch.batch_id, batch.clone());
            }
            for event in events {
                if !state.events.contains(event) {
                    state.routed.insert(event.data_id);
                    state.events.push(event.clone());
                }
            }
            Ok(())
        })
    }

    fn batches_for_node<'a>(&'a self, node_id: &'a str) -> BoxFuture<'a, Vec<OutgoingBatch>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .batches
                .values()
                .filter(|b| b.node_id == node_id)
                .cloned()
                .collect())
        })
    }

    fn batch_events(&self, batch_id: i64) -> BoxFuture<'_, Vec<DataEvent>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let mut events: Vec<DataEvent> = state
                .events
                .iter()
                .filter(|e| e.batch_id == batch_id)
                .cloned()
                .collect();
            events.sort_by_key(|e| e.data_id);
            Ok(events)
        })
    }

    fn update_batch_status(&self, batch_id: i64, status: BatchStatus) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(batch) = self.state.lock().await.batches.get_mut(&batch_id) {
                batch.status = status;
            }
            Ok(())
        })
    }
}

impl RoutingLookups for InMemoryStore {
    fn lookup_external_ids<'a>(
        &'a self,
        lookup_table: &'a str,
        lookup_key_column: &'a str,
        external_id_column: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let key_column = lookup_key_column.to_ascii_uppercase();
            let id_column = external_id_column.to_ascii_uppercase();
            Ok(state
                .lookup_tables
                .get(&lookup_table.to_ascii_lowercase())
                .map(|rows| {
                    rows.iter()
                        .filter(|row| row.get(&key_column).map(String::as_str) == Some(key))
                        .filter_map(|row| row.get(&id_column).cloned())
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn subselect<'a>(
        &'a self,
        sql: &'a str,
        _params: &'a [(String, Option<String>)],
    ) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .await
                .subselect_results
                .get(sql)
                .cloned()
                .unwrap_or_default())
        })
    }
}
