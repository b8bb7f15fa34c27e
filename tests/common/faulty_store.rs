//! Fault-injecting store.
//!
//! Wraps an [`InMemoryStore`] and delegates every call, except where a fault
//! switch is on.

use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use trigger_replication::model::{BatchStatus, DataEvent, DataId, Gap, OutgoingBatch};
use trigger_replication::store::{
    BatchStore, BoxFuture, GapStore, MutationStore, RoutingLookups, RowStream, ScanFilter,
    TransactionVisibility,
};
use trigger_replication::{InMemoryStore, ReplicationError};

#[derive(Default)]
pub struct FaultyStore {
    pub inner: Arc<InMemoryStore>,
    /// Row scans hang forever.
    pub stall_reads: AtomicBool,
    /// Row scans fail on their first item.
    pub fail_reads: AtomicBool,
    /// Gap table writes fail.
    pub fail_gap_writes: AtomicBool,
    /// Batch saves fail.
    pub fail_batch_saves: AtomicBool,
    pub scans_started: AtomicUsize,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(InMemoryStore::new()),
            ..Default::default()
        }
    }

    pub fn set(flag: &AtomicBool, on: bool) {
        flag.store(on, Ordering::SeqCst);
    }
}

fn injected(what: &str) -> ReplicationError {
    ReplicationError::Internal(format!("injected {} failure", what))
}

impl MutationStore for FaultyStore {
    fn stream_changes<'a>(&'a self, channel_id: &'a str, filter: &'a ScanFilter, page_size: usize) -> RowStream<'a> {
        self.scans_started.fetch_add(1, Ordering::SeqCst);
        if self.stall_reads.load(Ordering::SeqCst) {
            return futures::stream::pending().boxed();
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return futures::stream::once(async { Err(injected("read")) }).boxed();
        }
        self.inner.stream_changes(channel_id, filter, page_size)
    }

    fn routed_ids_in_range(&self, start: DataId, end: DataId) -> BoxFuture<'_, Vec<DataId>> {
        self.inner.routed_ids_in_range(start, end)
    }

    fn count_unrouted_in_range(&self, start: DataId, end: DataId) -> BoxFuture<'_, u64> {
        self.inner.count_unrouted_in_range(start, end)
    }

    fn min_data_id(&self) -> BoxFuture<'_, Option<DataId>> {
        self.inner.min_data_id()
    }

    fn max_routed_data_id(&self) -> BoxFuture<'_, Option<DataId>> {
        self.inner.max_routed_data_id()
    }

    fn transaction_visibility(&self) -> BoxFuture<'_, TransactionVisibility> {
        self.inner.transaction_visibility()
    }
}

impl GapStore for FaultyStore {
    fn load_open_gaps(&self) -> BoxFuture<'_, Vec<Gap>> {
        self.inner.load_open_gaps()
    }

    fn load_all_gaps(&self) -> BoxFuture<'_, Vec<Gap>> {
        self.inner.load_all_gaps()
    }

    fn apply_gap_changes<'a>(&'a self, removed: &'a [Gap], added: &'a [Gap]) -> BoxFuture<'a, ()> {
        if self.fail_gap_writes.load(Ordering::SeqCst) {
            return Box::pin(async { Err(injected("gap write")) });
        }
        self.inner.apply_gap_changes(removed, added)
    }

    fn purge_resolved_gaps(&self, older_than: i64) -> BoxFuture<'_, u64> {
        self.inner.purge_resolved_gaps(older_than)
    }
}

impl BatchStore for FaultyStore {
    fn allocate_batch_id(&self) -> BoxFuture<'_, i64> {
        self.inner.allocate_batch_id()
    }

    fn save_routing<'a>(&'a self, batches: &'a [OutgoingBatch], events: &'a [DataEvent]) -> BoxFuture<'a, ()> {
        if self.fail_batch_saves.load(Ordering::SeqCst) {
            return Box::pin(async { Err(injected("batch save")) });
        }
        self.inner.save_routing(batches, events)
    }

    fn batches_for_node<'a>(&'a self, node_id: &'a str) -> BoxFuture<'a, Vec<OutgoingBatch>> {
        self.inner.batches_for_node(node_id)
    }

    fn batch_events(&self, batch_id: i64) -> BoxFuture<'_, Vec<DataEvent>> {
        self.inner.batch_events(batch_id)
    }

    fn update_batch_status(&self, batch_id: i64, status: BatchStatus) -> BoxFuture<'_, ()> {
        self.inner.update_batch_status(batch_id, status)
    }
}

impl RoutingLookups for FaultyStore {
    fn lookup_external_ids<'a>(
        &'a self,
        lookup_table: &'a str,
        lookup_key_column: &'a str,
        external_id_column: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Vec<String>> {
        self.inner
            .lookup_external_ids(lookup_table, lookup_key_column, external_id_column, key)
    }

    fn subselect<'a>(&'a self, sql: &'a str, params: &'a [(String, Option<String>)]) -> BoxFuture<'a, Vec<String>> {
        self.inner.subselect(sql, params)
    }
}
