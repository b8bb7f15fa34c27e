// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Gap-aware reader.
//!
//! A producer task streams unrouted rows of one channel, restricted to the
//! open gaps, into a bounded queue that the router drains.
//!
//! ```text
//!  MutationStore ──stream──► peek-ahead buffer ──► mpsc(peek_ahead_window) ──► take()
//!    (paged, id order)        (group by tx id)       Row, Row, ..., EndOfStream
//! ```
//!
//! # Transaction Grouping
//!
//! Unless the channel is non-transactional, once a row of transaction T is
//! sent, every buffered row of T follows it before any other row. The buffer
//! is refilled and searched again until a refill turns up no more rows of T.
//!
//! # End of Stream
//!
//! The producer always finishes with [`ReaderItem::EndOfStream`], even when
//! the scan fails or panics. A closed queue with no marker therefore means
//! the task was killed, and `take()` reports [`ReplicationError::ReaderAborted`].
//! A `take()` that waits longer than `take_timeout` fails with
//! [`ReplicationError::ReaderTimeout`]; the caller abandons the pass.

use crate::config::{ChannelConfig, ReaderConfig};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::model::{ChangeRow, DataId, Gap};
use crate::store::{MutationStore, ScanFilter};
use futures::{FutureExt, StreamExt};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info_span, warn, Instrument};

const STOP_GRACE: Duration = Duration::from_secs(10);

/// One item taken from the reader queue.
#[derive(Debug)]
pub enum ReaderItem {
    Row(ChangeRow),
    /// Always the last item.
    EndOfStream(ReadSummary),
}

/// How a scan ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadSummary {
    pub rows_read: u64,
    /// The scan reached the end of its range. False when it stopped at
    /// `max_data_to_route`, failed, or was cancelled.
    pub all_data_read: bool,
    /// Stopped because the keep-reading flag was cleared.
    pub aborted: bool,
    /// Rows dropped because they fell between gaps of a widened filter.
    pub rows_outside_gaps: u64,
    pub error: Option<String>,
}

/// Consumer half of a running reader.
pub struct GapAwareReader {
    channel_id: String,
    rx: mpsc::Receiver<ReaderItem>,
    keep_reading: Arc<AtomicBool>,
    take_timeout: Duration,
    handle: Option<JoinHandle<()>>,
    finished: bool,
}

impl GapAwareReader {
    /// Start reading `channel` within `gaps` (ordered by start id).
    pub fn spawn<S: MutationStore>(
        store: Arc<S>,
        channel: &ChannelConfig,
        gaps: Vec<Gap>,
        config: &ReaderConfig,
    ) -> Self {
        let capacity = config.peek_ahead_window.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let keep_reading = Arc::new(AtomicBool::new(true));

        let producer = Producer {
            channel_id: channel.channel_id.clone(),
            group_transactions: channel.batch_algorithm.groups_transactions(),
            max_rows: channel.max_data_to_route.max(1) as u64,
            peek_ahead: capacity,
            max_gaps_to_qualify: config.max_gaps_to_qualify,
            page_size: config.page_size.max(1),
            gaps,
            keep_reading: Arc::clone(&keep_reading),
            tx,
        };

        let span = info_span!("reader", channel_id = %channel.channel_id);
        let handle = tokio::spawn(producer.run(store).instrument(span));

        Self {
            channel_id: channel.channel_id.clone(),
            rx,
            keep_reading,
            take_timeout: config.take_timeout_duration(),
            handle: Some(handle),
            finished: false,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Next row or the end-of-stream marker.
    pub async fn take(&mut self) -> Result<ReaderItem> {
        if self.finished {
            return Err(ReplicationError::Internal(format!(
                "reader for channel {} already finished",
                self.channel_id
            )));
        }
        match tokio::time::timeout(self.take_timeout, self.rx.recv()).await {
            Ok(Some(item)) => {
                if matches!(item, ReaderItem::EndOfStream(_)) {
                    self.finished = true;
                }
                Ok(item)
            }
            Ok(None) => {
                self.finished = true;
                Err(ReplicationError::ReaderAborted {
                    channel_id: self.channel_id.clone(),
                })
            }
            Err(_) => {
                metrics::record_reader_timeout(&self.channel_id);
                self.stop();
                Err(ReplicationError::ReaderTimeout {
                    channel_id: self.channel_id.clone(),
                    waited_ms: self.take_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Ask the producer to stop. It finishes the row in hand, then sends
    /// the end-of-stream marker.
    pub fn stop(&self) {
        self.keep_reading.store(false, Ordering::SeqCst);
    }

    /// Shared cancellation flag.
    pub fn keep_reading(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.keep_reading)
    }

    /// Wait for the producer task to exit. A producer stuck inside the
    /// store past the grace period is aborted.
    pub async fn join(mut self) {
        self.stop();
        // Unblock a producer waiting on a full queue.
        self.rx.close();
        if let Some(mut handle) = self.handle.take() {
            let grace = self.take_timeout.min(STOP_GRACE);
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(channel_id = %self.channel_id, "Reader did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

impl Drop for GapAwareReader {
    fn drop(&mut self) {
        self.keep_reading.store(false, Ordering::SeqCst);
    }
}

struct Producer {
    channel_id: String,
    group_transactions: bool,
    max_rows: u64,
    peek_ahead: usize,
    max_gaps_to_qualify: usize,
    page_size: usize,
    gaps: Vec<Gap>,
    keep_reading: Arc<AtomicBool>,
    tx: mpsc::Sender<ReaderItem>,
}

/// Queue closed by the consumer.
struct Disconnected;

impl Producer {
    async fn run<S: MutationStore>(self, store: Arc<S>) {
        let mut summary = ReadSummary::default();
        let outcome = AssertUnwindSafe(self.scan(store.as_ref(), &mut summary))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, rows_read = summary.rows_read, "Reader failed");
                summary.all_data_read = false;
                summary.error = Some(e.to_string());
            }
            Err(_) => {
                error!(rows_read = summary.rows_read, "Reader panicked");
                summary.all_data_read = false;
                summary.error = Some("reader panicked".to_string());
            }
        }

        metrics::record_rows_read(&self.channel_id, summary.rows_read);
        metrics::record_rows_outside_gaps(&self.channel_id, summary.rows_outside_gaps);
        debug!(
            rows_read = summary.rows_read,
            all_data_read = summary.all_data_read,
            aborted = summary.aborted,
            "Reader finished"
        );
        // Consumer may already be gone.
        let _ = self.tx.send(ReaderItem::EndOfStream(summary)).await;
    }

    async fn scan<S: MutationStore>(&self, store: &S, summary: &mut ReadSummary) -> Result<()> {
        let Some(filter) = ScanFilter::from_gaps(&self.gaps, self.max_gaps_to_qualify) else {
            summary.all_data_read = true;
            return Ok(());
        };
        if filter.is_degraded() {
            debug!(gap_count = self.gaps.len(), "Too many gaps, scanning one id range");
        }

        let mut stream = store.stream_changes(&self.channel_id, &filter, self.page_size);
        let mut buffer: VecDeque<ChangeRow> = VecDeque::with_capacity(self.peek_ahead);
        let mut exhausted = false;

        loop {
            if !self.keep_reading.load(Ordering::SeqCst) {
                summary.aborted = true;
                summary.all_data_read = false;
                debug!(rows_read = summary.rows_read, "Reader cancelled");
                return Ok(());
            }

            self.fill(&mut stream, &mut buffer, &mut exhausted, summary, filter.is_degraded())
                .await?;
            let Some(row) = buffer.pop_front() else {
                summary.all_data_read = exhausted;
                return Ok(());
            };

            let transaction_id = row.transaction_id.clone();
            if self.send(row, summary).await.is_err() {
                summary.aborted = true;
                return Ok(());
            }

            if self.group_transactions {
                if let Some(transaction_id) = transaction_id {
                    loop {
                        self.fill(&mut stream, &mut buffer, &mut exhausted, summary, filter.is_degraded())
                            .await?;
                        let mut matched = Vec::new();
                        buffer.retain(|r| {
                            if r.transaction_id.as_deref() == Some(transaction_id.as_str()) {
                                matched.push(r.clone());
                                false
                            } else {
                                true
                            }
                        });
                        if matched.is_empty() {
                            break;
                        }
                        for r in matched {
                            if self.send(r, summary).await.is_err() {
                                summary.aborted = true;
                                return Ok(());
                            }
                        }
                    }
                }
            }

            if summary.rows_read >= self.max_rows {
                summary.all_data_read = exhausted && buffer.is_empty();
                debug!(rows_read = summary.rows_read, "Reached max data to route");
                return Ok(());
            }
        }
    }

    /// Top the buffer up to the peek-ahead depth.
    async fn fill(
        &self,
        stream: &mut crate::store::RowStream<'_>,
        buffer: &mut VecDeque<ChangeRow>,
        exhausted: &mut bool,
        summary: &mut ReadSummary,
        degraded: bool,
    ) -> Result<()> {
        while !*exhausted && buffer.len() < self.peek_ahead {
            match stream.next().await {
                Some(Ok(row)) => {
                    if degraded && !in_gaps(&self.gaps, row.data_id) {
                        summary.rows_outside_gaps += 1;
                        continue;
                    }
                    buffer.push_back(row);
                }
                Some(Err(e)) => return Err(e),
                None => *exhausted = true,
            }
        }
        Ok(())
    }

    async fn send(&self, row: ChangeRow, summary: &mut ReadSummary) -> std::result::Result<(), Disconnected> {
        if self.tx.send(ReaderItem::Row(row)).await.is_err() {
            warn!("Router stopped taking rows");
            return Err(Disconnected);
        }
        summary.rows_read += 1;
        Ok(())
    }
}

/// Whether `data_id` lies in one of the ordered, disjoint `gaps`.
fn in_gaps(gaps: &[Gap], data_id: DataId) -> bool {
    let idx = gaps.partition_point(|g| g.end_id < data_id);
    gaps.get(idx).is_some_and(|g| g.start_id <= data_id)
}
