// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage collaborators.
//!
//! The engine never talks to a database directly; it goes through four traits:
//!
//! | Trait | Consumer | Holds |
//! |-------|----------|-------|
//! | [`MutationStore`] | reader, gap tracker | captured rows (`data`) |
//! | [`GapStore`] | gap tracker | gap rows (`data_gap`) |
//! | [`BatchStore`] | router | `outgoing_batch` + `data_event` |
//! | [`RoutingLookups`] | subselect / lookup-table routers | arbitrary source tables |
//!
//! [`SqliteStore`] implements all four on one SQLite database. [`InMemoryStore`]
//! implements them in memory for tests and embedding.
//!
//! All methods return [`BoxFuture`] so the traits stay object safe.

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::{is_sqlite_busy_error, SqliteStore};

use crate::error::Result;
use crate::model::{ChangeRow, DataEvent, DataId, Gap, OutgoingBatch, BatchStatus};
use futures::stream::BoxStream;
use std::future::Future;
use std::pin::Pin;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Ordered stream of captured rows.
pub type RowStream<'a> = BoxStream<'a, Result<ChangeRow>>;

/// Which ids a reader scan covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanFilter {
    /// Exactly these inclusive ranges.
    Ranges(Vec<(DataId, DataId)>),
    /// Everything between two ids. Used when there are too many gaps to
    /// enumerate. May re-read ids in already closed ranges; the reader drops
    /// rows that fall outside the active gaps.
    Between(DataId, DataId),
}

impl ScanFilter {
    /// Build the filter for a set of ordered gaps.
    ///
    /// Above `max_gaps_to_qualify` gaps the filter widens to
    /// `Between(first.start, last.end)`.
    pub fn from_gaps(gaps: &[Gap], max_gaps_to_qualify: usize) -> Option<Self> {
        let first = gaps.first()?;
        let last = gaps.last()?;
        if gaps.len() > max_gaps_to_qualify {
            Some(ScanFilter::Between(first.start_id, last.end_id))
        } else {
            Some(ScanFilter::Ranges(
                gaps.iter().map(|g| (g.start_id, g.end_id)).collect(),
            ))
        }
    }

    pub fn matches(&self, data_id: DataId) -> bool {
        match self {
            ScanFilter::Ranges(ranges) => ranges.iter().any(|(s, e)| data_id >= *s && data_id <= *e),
            ScanFilter::Between(s, e) => data_id >= *s && data_id <= *e,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, ScanFilter::Between(..))
    }
}

/// What the source database can tell us about in-flight transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionVisibility {
    /// The store cannot see pending transactions; gaps expire by age only.
    Unsupported,
    /// No transaction is in flight.
    NonePending,
    /// The oldest in-flight transaction started at this time (epoch ms).
    EarliestPending(i64),
}

/// Captured row store.
pub trait MutationStore: Send + Sync + 'static {
    /// Rows of a channel inside `filter`, ascending by id, that have not yet
    /// been routed. Fetched `page_size` rows at a time.
    fn stream_changes<'a>(
        &'a self,
        channel_id: &'a str,
        filter: &'a ScanFilter,
        page_size: usize,
    ) -> RowStream<'a>;

    /// Ids in `[start, end]` that already have a data event.
    fn routed_ids_in_range(&self, start: DataId, end: DataId) -> BoxFuture<'_, Vec<DataId>>;

    /// Rows in `[start, end]` (any channel) not yet routed.
    fn count_unrouted_in_range(&self, start: DataId, end: DataId) -> BoxFuture<'_, u64>;

    /// Lowest staged id, routed or not.
    fn min_data_id(&self) -> BoxFuture<'_, Option<DataId>>;

    /// Highest id that has a data event.
    fn max_routed_data_id(&self) -> BoxFuture<'_, Option<DataId>>;

    fn transaction_visibility(&self) -> BoxFuture<'_, TransactionVisibility>;

    /// Release connections at engine shutdown. No-op by default.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Gap table.
pub trait GapStore: Send + Sync + 'static {
    /// OPEN gaps ordered by start id.
    fn load_open_gaps(&self) -> BoxFuture<'_, Vec<Gap>>;

    /// Every gap row regardless of status, ordered by start id.
    fn load_all_gaps(&self) -> BoxFuture<'_, Vec<Gap>>;

    /// Delete `removed` (matched by range) and upsert `added`, atomically.
    fn apply_gap_changes<'a>(&'a self, removed: &'a [Gap], added: &'a [Gap]) -> BoxFuture<'a, ()>;

    /// Delete CLOSED/SKIPPED gaps created before `older_than` (epoch ms).
    fn purge_resolved_gaps(&self, older_than: i64) -> BoxFuture<'_, u64>;
}

/// Outgoing batch and data event tables.
pub trait BatchStore: Send + Sync + 'static {
    /// Next batch id. Strictly increasing.
    fn allocate_batch_id(&self) -> BoxFuture<'_, i64>;

    /// Persist batches and their data events in one transaction.
    fn save_routing<'a>(&'a self, batches: &'a [OutgoingBatch], events: &'a [DataEvent]) -> BoxFuture<'a, ()>;

    fn batches_for_node<'a>(&'a self, node_id: &'a str) -> BoxFuture<'a, Vec<OutgoingBatch>>;

    fn batch_events(&self, batch_id: i64) -> BoxFuture<'_, Vec<DataEvent>>;

    fn update_batch_status(&self, batch_id: i64, status: BatchStatus) -> BoxFuture<'_, ()>;
}

/// Queries made by subselect and lookup-table routers.
pub trait RoutingLookups: Send + Sync + 'static {
    /// External ids mapped to `key` in a lookup table.
    fn lookup_external_ids<'a>(
        &'a self,
        lookup_table: &'a str,
        lookup_key_column: &'a str,
        external_id_column: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Vec<String>>;

    /// Run a router subselect. `:NAME` placeholders bind from `params`.
    /// Returns the first column of each result row.
    fn subselect<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [(String, Option<String>)],
    ) -> BoxFuture<'a, Vec<String>>;
}

/// Everything the routing side needs from one store.
pub trait ChangeStore: MutationStore + GapStore + BatchStore + RoutingLookups {}

impl<T: MutationStore + GapStore + BatchStore + RoutingLookups> ChangeStore for T {}

/// Replace `:NAME` placeholders with `?` and collect bind values in order.
///
/// Unknown names bind NULL. `::` (a cast) and quoted text are left alone.
pub fn expand_named_params(sql: &str, params: &[(String, Option<String>)]) -> (String, Vec<Option<String>>) {
    let mut out = String::with_capacity(sql.len());
    let mut binds = Vec::new();
    let mut chars = sql.chars().peekable();
    let mut in_quote = false;

    while let Some(ch) = chars.next() {
        if ch == '\'' {
            in_quote = !in_quote;
            out.push(ch);
            continue;
        }
        if ch == ':' && !in_quote {
            if chars.peek() == Some(&':') {
                chars.next();
                out.push_str("::");
                continue;
            }
            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            if name.is_empty() {
                out.push(':');
                continue;
            }
            let value = params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(&name))
                .and_then(|(_, v)| v.clone());
            binds.push(value);
            out.push('?');
            continue;
        }
        out.push(ch);
    }

    (out, binds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_filter_degrades_above_threshold() {
        let gaps: Vec<Gap> = (0..5).map(|i| Gap::new(i * 10, i * 10 + 5)).collect();
        let filter = ScanFilter::from_gaps(&gaps, 10).unwrap();
        assert!(!filter.is_degraded());
        assert!(filter.matches(12));
        assert!(!filter.matches(17));

        let filter = ScanFilter::from_gaps(&gaps, 3).unwrap();
        assert_eq!(filter, ScanFilter::Between(0, 45));
        assert!(filter.matches(17));
    }

    #[test]
    fn test_scan_filter_empty_gaps() {
        assert!(ScanFilter::from_gaps(&[], 10).is_none());
    }

    #[test]
    fn test_expand_named_params() {
        let params = vec![
            ("NODE_ID".to_string(), Some("001".to_string())),
            ("STORE_ID".to_string(), None),
        ];
        let (sql, binds) = expand_named_params(
            "select node_id from node where node_id = :NODE_ID or store = :store_id or x = ':NODE_ID' or :NODE_ID::text = y",
            &params,
        );
        assert_eq!(
            sql,
            "select node_id from node where node_id = ? or store = ? or x = ':NODE_ID' or ?::text = y"
        );
        assert_eq!(binds, vec![Some("001".to_string()), None, Some("001".to_string())]);
    }
}
