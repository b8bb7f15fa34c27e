// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outgoing batch accumulation.
//!
//! Routed rows are appended to one open batch per target node. When any
//! batch hits a close condition, every open batch of the channel is closed
//! and persisted together with its data events in one store transaction.
//!
//! ```text
//! row ──► route ──► node 001 ─┐
//!                   node 002 ─┼──► BatchAccumulator ──(close)──► BatchStore::save_routing
//!                   node -1  ─┘    open: {001, 002, -1}          batches + data events
//! ```
//!
//! # Close Conditions
//!
//! | Algorithm | Closes when |
//! |-----------|-------------|
//! | `default` | threshold reached **and** at a transaction boundary |
//! | `transactional` | at every transaction boundary, or threshold at a boundary |
//! | `nontransactional` | threshold reached |
//!
//! Thresholds are `max_batch_size` data events, `max_batch_bytes` payload
//! bytes, and `max_batch_age`. In transactional mode a batch is also closed
//! *before* a row whose transaction differs from the batch's running one.

use crate::config::{BatchAlgorithm, ChannelConfig};
use crate::error::Result;
use crate::metrics;
use crate::model::{now_millis, BatchStatus, ChangeRow, DataEvent, OutgoingBatch};
use crate::store::BatchStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Why a batch was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    MaxSize,
    MaxBytes,
    MaxAge,
    TransactionBoundary,
    /// The pass ended with the batch still open.
    EndOfPass,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::MaxSize => "max_size",
            CloseReason::MaxBytes => "max_bytes",
            CloseReason::MaxAge => "max_age",
            CloseReason::TransactionBoundary => "transaction_boundary",
            CloseReason::EndOfPass => "end_of_pass",
        }
    }
}

fn threshold_reached(batch: &OutgoingBatch, channel: &ChannelConfig, now: i64) -> Option<CloseReason> {
    if batch.data_event_count >= channel.max_batch_size as u64 {
        return Some(CloseReason::MaxSize);
    }
    if channel.max_batch_bytes > 0 && batch.byte_count >= channel.max_batch_bytes {
        return Some(CloseReason::MaxBytes);
    }
    if let Some(age) = channel.max_batch_age_duration() {
        if now - batch.created_at >= age.as_millis() as i64 {
            return Some(CloseReason::MaxAge);
        }
    }
    None
}

/// Whether `batch` is complete after its latest row was added.
///
/// `at_transaction_boundary` is true when the next row read belongs to a
/// different transaction (or there is no next row).
pub fn is_batch_complete(
    batch: &OutgoingBatch,
    channel: &ChannelConfig,
    at_transaction_boundary: bool,
    now: i64,
) -> Option<CloseReason> {
    match channel.batch_algorithm {
        BatchAlgorithm::Nontransactional => threshold_reached(batch, channel, now),
        BatchAlgorithm::Default => {
            if at_transaction_boundary {
                threshold_reached(batch, channel, now)
            } else {
                None
            }
        }
        BatchAlgorithm::Transactional => {
            if at_transaction_boundary {
                Some(threshold_reached(batch, channel, now).unwrap_or(CloseReason::TransactionBoundary))
            } else {
                None
            }
        }
    }
}

/// Whether a transactional batch must close before `row` is added.
///
/// Rows without a transaction id are their own transaction.
pub fn closes_before(batch: &OutgoingBatch, row: &ChangeRow, algorithm: BatchAlgorithm) -> bool {
    if algorithm != BatchAlgorithm::Transactional || batch.data_event_count == 0 {
        return false;
    }
    match (&batch.last_transaction_id, &row.transaction_id) {
        (Some(open), Some(next)) => open != next,
        _ => true,
    }
}

/// What one close persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitResult {
    pub batches: Vec<OutgoingBatch>,
    pub data_events: usize,
}

/// Open batches of one channel pass.
pub struct BatchAccumulator<S> {
    store: Arc<S>,
    channel: ChannelConfig,
    open: BTreeMap<String, OutgoingBatch>,
    events: Vec<DataEvent>,
    pending_close: Option<CloseReason>,
    batches_closed: u64,
}

impl<S: BatchStore> BatchAccumulator<S> {
    pub fn new(store: Arc<S>, channel: ChannelConfig) -> Self {
        Self {
            store,
            channel,
            open: BTreeMap::new(),
            events: Vec::new(),
            pending_close: None,
            batches_closed: 0,
        }
    }

    pub fn channel(&self) -> &ChannelConfig {
        &self.channel
    }

    /// Whether the open batch of `node_id` has to close before `row` joins it.
    /// The caller commits first; [`add()`](Self::add) never does.
    pub fn must_close_before(&self, node_id: &str, row: &ChangeRow) -> bool {
        self.open
            .get(node_id)
            .is_some_and(|b| closes_before(b, row, self.channel.batch_algorithm))
    }

    /// Append `row` to the open batch of `node_id`, opening one if needed.
    pub async fn add(
        &mut self,
        node_id: &str,
        row: &ChangeRow,
        router_id: &str,
        at_transaction_boundary: bool,
    ) -> Result<()> {
        if !self.open.contains_key(node_id) {
            let batch_id = self.store.allocate_batch_id().await?;
            debug!(batch_id, node_id, channel_id = %self.channel.channel_id, "Opened batch");
            self.open.insert(
                node_id.to_string(),
                OutgoingBatch::new(batch_id, node_id, &self.channel.channel_id),
            );
        }

        let Some(batch) = self.open.get_mut(node_id) else {
            return Ok(());
        };
        batch.record(row);
        self.events.push(DataEvent {
            data_id: row.data_id,
            batch_id: batch.batch_id,
            router_id: router_id.to_string(),
        });

        if self.pending_close.is_none() {
            self.pending_close = is_batch_complete(batch, &self.channel, at_transaction_boundary, now_millis());
        }
        Ok(())
    }

    /// A batch reached a close condition; call [`commit()`](Self::commit).
    pub fn needs_commit(&self) -> Option<CloseReason> {
        self.pending_close
    }

    pub fn open_batches(&self) -> impl Iterator<Item = &OutgoingBatch> {
        self.open.values()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    pub fn batches_closed(&self) -> u64 {
        self.batches_closed
    }

    /// Close and persist every open batch with its data events.
    ///
    /// Batches for the unrouted node are stored as OK since nothing will
    /// ever send them.
    pub async fn commit(&mut self, reason: CloseReason) -> Result<CommitResult> {
        if self.open.is_empty() {
            self.pending_close = None;
            return Ok(CommitResult::default());
        }

        let batches: Vec<OutgoingBatch> = std::mem::take(&mut self.open)
            .into_values()
            .map(|mut b| {
                if b.is_unrouted() {
                    b.status = BatchStatus::Ok;
                }
                b
            })
            .collect();
        let events = std::mem::take(&mut self.events);
        self.pending_close = None;

        self.store.save_routing(&batches, &events).await?;

        for batch in &batches {
            metrics::record_batch_closed(&self.channel.channel_id, reason.as_str(), batch.data_event_count);
        }
        metrics::record_data_events(&self.channel.channel_id, events.len());
        self.batches_closed += batches.len() as u64;
        debug!(
            channel_id = %self.channel.channel_id,
            batches = batches.len(),
            data_events = events.len(),
            reason = reason.as_str(),
            "Closed batches"
        );

        Ok(CommitResult {
            batches,
            data_events: events.len(),
        })
    }

    /// Drop open batches and their events without persisting them.
    pub fn rollback(&mut self) {
        if !self.open.is_empty() {
            warn!(
                channel_id = %self.channel.channel_id,
                batches = self.open.len(),
                data_events = self.events.len(),
                "Rolling back open batches"
            );
        }
        self.open.clear();
        self.events.clear();
        self.pending_close = None;
    }
}
