// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed staging store.
//!
//! Holds captured rows, schema snapshots, gaps and outgoing batches in one
//! database:
//!
//! ```text
//! trigger_hist    snapshot_id → table + column layout
//! data            captured rows (written by capture triggers)
//! data_gap        gap rows, disjoint by invariant
//! outgoing_batch  one row per (node, channel) batch
//! data_event      (data_id, batch_id, router_id) join rows
//! sequence        monotonic batch ids
//! ```
//!
//! # SQLite Busy Handling
//!
//! Capture triggers write to `data` while the routing pass reads it, so
//! SQLITE_BUSY/SQLITE_LOCKED are expected under load. Every statement goes
//! through [`execute_with_retry`] with exponential backoff.
//!
//! # Unrouted Rows
//!
//! "Not yet routed" means "no `data_event` row". The router writes batches and
//! data events in one transaction, so a crash either loses the whole routing
//! unit (rows are re-read next pass) or keeps it (rows are never re-read).

use super::{
    BatchStore, BoxFuture, GapStore, MutationStore, RoutingLookups, RowStream, ScanFilter,
    TransactionVisibility, expand_named_params,
};
use crate::error::{ReplicationError, Result};
use crate::model::{
    BatchStatus, ChangeRow, DataEvent, DataId, EventType, Gap, GapStatus, OutgoingBatch, SchemaSnapshot,
};
use futures::{StreamExt, TryStreamExt};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS trigger_hist (
        snapshot_id INTEGER PRIMARY KEY,
        trigger_id TEXT NOT NULL,
        table_name TEXT NOT NULL,
        column_names TEXT NOT NULL,
        pk_column_names TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS data (
        data_id INTEGER PRIMARY KEY AUTOINCREMENT,
        table_name TEXT NOT NULL,
        event_type TEXT NOT NULL,
        row_data TEXT,
        pk_data TEXT,
        old_data TEXT,
        snapshot_id INTEGER NOT NULL,
        channel_id TEXT NOT NULL,
        transaction_id TEXT,
        source_node_id TEXT,
        external_data TEXT,
        create_time INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS data_channel_id ON data (channel_id, data_id)",
    r#"
    CREATE TABLE IF NOT EXISTS data_gap (
        start_id INTEGER NOT NULL,
        end_id INTEGER NOT NULL,
        status TEXT NOT NULL,
        last_update_host TEXT NOT NULL,
        create_time INTEGER NOT NULL,
        last_update_time INTEGER NOT NULL,
        PRIMARY KEY (start_id, end_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS outgoing_batch (
        batch_id INTEGER PRIMARY KEY,
        node_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        status TEXT NOT NULL,
        insert_count INTEGER NOT NULL,
        update_count INTEGER NOT NULL,
        delete_count INTEGER NOT NULL,
        other_count INTEGER NOT NULL,
        data_event_count INTEGER NOT NULL,
        byte_count INTEGER NOT NULL,
        last_transaction_id TEXT,
        create_time INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS outgoing_batch_node ON outgoing_batch (node_id, status)",
    r#"
    CREATE TABLE IF NOT EXISTS data_event (
        data_id INTEGER NOT NULL,
        batch_id INTEGER NOT NULL,
        router_id TEXT NOT NULL,
        PRIMARY KEY (data_id, batch_id, router_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS data_event_batch ON data_event (batch_id)",
    r#"
    CREATE TABLE IF NOT EXISTS sequence (
        name TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    )
    "#,
];

/// Check if an error is a retryable SQLite busy/locked error
pub fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

/// Staging store backed by SQLite.
pub struct SqliteStore {
    pool: SqlitePool,
    path: String,
    host: String,
}

impl SqliteStore {
    /// Open (or create) the staging database at `path`.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        Self::open(&path_str, true).await
    }

    /// Open using a [`StoreConfig`](crate::config::StoreConfig).
    pub async fn from_config(config: &crate::config::StoreConfig) -> Result<Self> {
        Self::open(&config.sqlite_path, config.wal_mode).await
    }

    async fn open(path_str: &str, wal_mode: bool) -> Result<Self> {
        info!(path = %path_str, "Initializing staging store");

        let journal = if wal_mode {
            sqlx::sqlite::SqliteJournalMode::Wal
        } else {
            sqlx::sqlite::SqliteJournalMode::Memory
        };

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        // An in-memory database lives as long as its single connection.
        let pool_options = if path_str == ":memory:" {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = pool_options.connect_with(options).await?;

        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&pool).await?;
        }

        Ok(Self {
            pool,
            path: path_str.to_string(),
            host: local_host_name(),
        })
    }

    /// Underlying pool, for capture simulation and diagnostics.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Record a schema snapshot so captured rows can reference it.
    pub async fn register_snapshot(&self, snapshot: &SchemaSnapshot) -> Result<()> {
        let pool = &self.pool;
        let columns = snapshot.column_names.join(",");
        let pks = snapshot.pk_column_names.join(",");
        execute_with_retry("register_snapshot", || async {
            sqlx::query(
                r#"
                INSERT INTO trigger_hist (snapshot_id, trigger_id, table_name, column_names, pk_column_names)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(snapshot_id) DO UPDATE SET
                    trigger_id = excluded.trigger_id,
                    table_name = excluded.table_name,
                    column_names = excluded.column_names,
                    pk_column_names = excluded.pk_column_names
                "#,
            )
            .bind(snapshot.snapshot_id)
            .bind(&snapshot.trigger_id)
            .bind(&snapshot.table_name)
            .bind(&columns)
            .bind(&pks)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    /// Stage a captured row, the way a capture trigger would.
    ///
    /// A positive `row.data_id` is used as-is (to stage sparse id sequences);
    /// otherwise the next id is assigned. Returns the stored id.
    pub async fn insert_change(&self, row: &ChangeRow) -> Result<DataId> {
        let pool = &self.pool;
        let explicit_id = (row.data_id > 0).then_some(row.data_id);
        let result = execute_with_retry("insert_change", || async {
            sqlx::query(
                r#"
                INSERT INTO data (data_id, table_name, event_type, row_data, pk_data, old_data,
                                  snapshot_id, channel_id, transaction_id, source_node_id,
                                  external_data, create_time)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(explicit_id)
            .bind(&row.table_name)
            .bind(row.event_type.code())
            .bind(&row.row_data)
            .bind(&row.pk_data)
            .bind(&row.old_data)
            .bind(row.snapshot.snapshot_id)
            .bind(&row.channel_id)
            .bind(&row.transaction_id)
            .bind(&row.source_node_id)
            .bind(&row.external_data)
            .bind(row.create_time)
            .execute(pool)
            .await
        })
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("store_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Staging store closed");
    }

    async fn fetch_page(
        &self,
        channel_id: &str,
        filter: &ScanFilter,
        after: Option<DataId>,
        page_size: usize,
        snapshots: &mut HashMap<i64, Arc<SchemaSnapshot>>,
    ) -> Result<Vec<ChangeRow>> {
        let mut sql = String::from(
            r#"
            SELECT d.data_id, d.table_name, d.event_type, d.row_data, d.pk_data, d.old_data,
                   d.channel_id, d.transaction_id, d.source_node_id, d.external_data, d.create_time,
                   h.snapshot_id, h.trigger_id, h.table_name AS snapshot_table,
                   h.column_names, h.pk_column_names
            FROM data d
            JOIN trigger_hist h ON h.snapshot_id = d.snapshot_id
            WHERE d.channel_id = ? AND d.data_id > ?
              AND NOT EXISTS (SELECT 1 FROM data_event e WHERE e.data_id = d.data_id)
            "#,
        );
        let mut bounds: Vec<i64> = Vec::new();
        match filter {
            ScanFilter::Between(start, end) => {
                sql.push_str(" AND d.data_id BETWEEN ? AND ?");
                bounds.extend([*start, *end]);
            }
            ScanFilter::Ranges(ranges) => {
                let clauses: Vec<&str> = ranges.iter().map(|_| "d.data_id BETWEEN ? AND ?").collect();
                sql.push_str(&format!(" AND ({})", clauses.join(" OR ")));
                for (start, end) in ranges {
                    bounds.extend([*start, *end]);
                }
            }
        }
        sql.push_str(" ORDER BY d.data_id LIMIT ?");

        let pool = &self.pool;
        let after = after.unwrap_or(i64::MIN);
        let limit = page_size.max(1) as i64;
        let rows: Vec<SqliteRow> = execute_with_retry("stream_changes", || {
            let mut query = sqlx::query(&sql).bind(channel_id).bind(after);
            for bound in &bounds {
                query = query.bind(*bound);
            }
            query.bind(limit).fetch_all(pool)
        })
        .await?;

        rows.iter().map(|row| decode_change(row, snapshots)).collect()
    }
}

fn decode_change(row: &SqliteRow, snapshots: &mut HashMap<i64, Arc<SchemaSnapshot>>) -> Result<ChangeRow> {
    let snapshot_id: i64 = row.try_get("snapshot_id")?;
    let snapshot = match snapshots.get(&snapshot_id) {
        Some(s) => Arc::clone(s),
        None => {
            let columns: String = row.try_get("column_names")?;
            let pks: String = row.try_get("pk_column_names")?;
            let snapshot = Arc::new(SchemaSnapshot {
                snapshot_id,
                trigger_id: row.try_get("trigger_id")?,
                table_name: row.try_get("snapshot_table")?,
                column_names: split_names(&columns),
                pk_column_names: split_names(&pks),
            });
            snapshots.insert(snapshot_id, Arc::clone(&snapshot));
            snapshot
        }
    };

    let code: String = row.try_get("event_type")?;
    let event_type = EventType::from_code(&code)
        .ok_or_else(|| ReplicationError::Payload(format!("unknown event type '{}'", code)))?;

    Ok(ChangeRow {
        data_id: row.try_get("data_id")?,
        table_name: row.try_get("table_name")?,
        event_type,
        row_data: row.try_get("row_data")?,
        old_data: row.try_get("old_data")?,
        pk_data: row.try_get("pk_data")?,
        channel_id: row.try_get("channel_id")?,
        transaction_id: row.try_get("transaction_id")?,
        source_node_id: row.try_get("source_node_id")?,
        external_data: row.try_get("external_data")?,
        create_time: row.try_get("create_time")?,
        snapshot,
    })
}

fn split_names(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn decode_gap(row: &SqliteRow) -> Result<Gap> {
    let code: String = row.try_get("status")?;
    Ok(Gap {
        start_id: row.try_get("start_id")?,
        end_id: row.try_get("end_id")?,
        status: GapStatus::from_code(&code).unwrap_or(GapStatus::Open),
        last_update_host: row.try_get("last_update_host")?,
        create_time: row.try_get("create_time")?,
    })
}

fn decode_batch(row: &SqliteRow) -> Result<OutgoingBatch> {
    let code: String = row.try_get("status")?;
    let count = |name: &str| -> Result<u64> { Ok(row.try_get::<i64, _>(name)?.max(0) as u64) };
    Ok(OutgoingBatch {
        batch_id: row.try_get("batch_id")?,
        node_id: row.try_get("node_id")?,
        channel_id: row.try_get("channel_id")?,
        status: BatchStatus::from_code(&code).unwrap_or(BatchStatus::Error),
        insert_count: count("insert_count")?,
        update_count: count("update_count")?,
        delete_count: count("delete_count")?,
        other_count: count("other_count")?,
        data_event_count: count("data_event_count")?,
        byte_count: count("byte_count")?,
        last_transaction_id: row.try_get("last_transaction_id")?,
        created_at: row.try_get("create_time")?,
    })
}

fn local_host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

struct PageState {
    after: Option<DataId>,
    done: bool,
    snapshots: HashMap<i64, Arc<SchemaSnapshot>>,
}

impl MutationStore for SqliteStore {
    fn stream_changes<'a>(
        &'a self,
        channel_id: &'a str,
        filter: &'a ScanFilter,
        page_size: usize,
    ) -> RowStream<'a> {
        let initial = PageState {
            after: None,
            done: false,
            snapshots: HashMap::new(),
        };
        futures::stream::try_unfold(initial, move |mut state| async move {
            if state.done {
                return Ok::<_, ReplicationError>(None);
            }
            let rows = self
                .fetch_page(channel_id, filter, state.after, page_size, &mut state.snapshots)
                .await?;
            if rows.len() < page_size.max(1) {
                state.done = true;
            }
            match rows.last() {
                Some(last) => state.after = Some(last.data_id),
                None => return Ok(None),
            }
            let page = futures::stream::iter(rows.into_iter().map(Ok::<ChangeRow, ReplicationError>));
            Ok(Some((page, state)))
        })
        .try_flatten()
        .boxed()
    }

    fn routed_ids_in_range(&self, start: DataId, end: DataId) -> BoxFuture<'_, Vec<DataId>> {
        Box::pin(async move {
            let pool = &self.pool;
            let ids: Vec<(i64,)> = execute_with_retry("routed_ids_in_range", || async {
                sqlx::query_as(
                    "SELECT DISTINCT data_id FROM data_event WHERE data_id BETWEEN ? AND ? ORDER BY data_id",
                )
                .bind(start)
                .bind(end)
                .fetch_all(pool)
                .await
            })
            .await?;
            Ok(ids.into_iter().map(|(id,)| id).collect())
        })
    }

    fn count_unrouted_in_range(&self, start: DataId, end: DataId) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            let pool = &self.pool;
            let (count,): (i64,) = execute_with_retry("count_unrouted_in_range", || async {
                sqlx::query_as(
                    r#"
                    SELECT COUNT(*) FROM data d
                    WHERE d.data_id BETWEEN ? AND ?
                      AND NOT EXISTS (SELECT 1 FROM data_event e WHERE e.data_id = d.data_id)
                    "#,
                )
                .bind(start)
                .bind(end)
                .fetch_one(pool)
                .await
            })
            .await?;
            Ok(count.max(0) as u64)
        })
    }

    fn min_data_id(&self) -> BoxFuture<'_, Option<DataId>> {
        Box::pin(async move {
            let pool = &self.pool;
            let (min,): (Option<i64>,) = execute_with_retry("min_data_id", || async {
                sqlx::query_as("SELECT MIN(data_id) FROM data").fetch_one(pool).await
            })
            .await?;
            Ok(min)
        })
    }

    fn max_routed_data_id(&self) -> BoxFuture<'_, Option<DataId>> {
        Box::pin(async move {
            let pool = &self.pool;
            let (max,): (Option<i64>,) = execute_with_retry("max_routed_data_id", || async {
                sqlx::query_as("SELECT MAX(data_id) FROM data_event").fetch_one(pool).await
            })
            .await?;
            Ok(max)
        })
    }

    fn transaction_visibility(&self) -> BoxFuture<'_, TransactionVisibility> {
        // SQLite has a single writer and no transaction catalog to inspect.
        Box::pin(async move { Ok(TransactionVisibility::Unsupported) })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            SqliteStore::close(self).await;
            Ok(())
        })
    }
}

impl GapStore for SqliteStore {
    fn load_open_gaps(&self) -> BoxFuture<'_, Vec<Gap>> {
        Box::pin(async move {
            let pool = &self.pool;
            let rows = execute_with_retry("load_open_gaps", || async {
                sqlx::query(
                    "SELECT start_id, end_id, status, last_update_host, create_time FROM data_gap WHERE status = ? ORDER BY start_id, end_id",
                )
                .bind(GapStatus::Open.code())
                .fetch_all(pool)
                .await
            })
            .await?;
            rows.iter().map(decode_gap).collect()
        })
    }

    fn load_all_gaps(&self) -> BoxFuture<'_, Vec<Gap>> {
        Box::pin(async move {
            let pool = &self.pool;
            let rows = execute_with_retry("load_all_gaps", || async {
                sqlx::query(
                    "SELECT start_id, end_id, status, last_update_host, create_time FROM data_gap ORDER BY start_id, end_id",
                )
                .fetch_all(pool)
                .await
            })
            .await?;
            rows.iter().map(decode_gap).collect()
        })
    }

    fn apply_gap_changes<'a>(&'a self, removed: &'a [Gap], added: &'a [Gap]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if removed.is_empty() && added.is_empty() {
                return Ok(());
            }
            let pool = &self.pool;
            let host = &self.host;
            let now = crate::model::now_millis();
            execute_with_retry("apply_gap_changes", || async {
                let mut tx = pool.begin().await?;
                for gap in removed {
                    sqlx::query("DELETE FROM data_gap WHERE start_id = ? AND end_id = ?")
                        .bind(gap.start_id)
                        .bind(gap.end_id)
                        .execute(&mut *tx)
                        .await?;
                }
                for gap in added {
                    sqlx::query(
                        r#"
                        INSERT INTO data_gap (start_id, end_id, status, last_update_host, create_time, last_update_time)
                        VALUES (?, ?, ?, ?, ?, ?)
                        ON CONFLICT(start_id, end_id) DO UPDATE SET
                            status = excluded.status,
                            last_update_host = excluded.last_update_host,
                            last_update_time = excluded.last_update_time
                        "#,
                    )
                    .bind(gap.start_id)
                    .bind(gap.end_id)
                    .bind(gap.status.code())
                    .bind(host)
                    .bind(gap.create_time)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await
            })
            .await?;
            Ok(())
        })
    }

    fn purge_resolved_gaps(&self, older_than: i64) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            let pool = &self.pool;
            let result = execute_with_retry("purge_resolved_gaps", || async {
                sqlx::query("DELETE FROM data_gap WHERE status <> ? AND create_time < ?")
                    .bind(GapStatus::Open.code())
                    .bind(older_than)
                    .execute(pool)
                    .await
            })
            .await?;
            Ok(result.rows_affected())
        })
    }
}

impl BatchStore for SqliteStore {
    fn allocate_batch_id(&self) -> BoxFuture<'_, i64> {
        Box::pin(async move {
            let pool = &self.pool;
            let (id,): (i64,) = execute_with_retry("allocate_batch_id", || async {
                sqlx::query_as(
                    r#"
                    INSERT INTO sequence (name, value) VALUES ('outgoing_batch', 1)
                    ON CONFLICT(name) DO UPDATE SET value = value + 1
                    RETURNING value
                    "#,
                )
                .fetch_one(pool)
                .await
            })
            .await?;
            Ok(id)
        })
    }

    fn save_routing<'a>(&'a self, batches: &'a [OutgoingBatch], events: &'a [DataEvent]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let pool = &self.pool;
            execute_with_retry("save_routing", || async {
                let mut tx = pool.begin().await?;
                for batch in batches {
                    sqlx::query(
                        r#"
                        INSERT INTO outgoing_batch (batch_id, node_id, channel_id, status, insert_count,
                            update_count, delete_count, other_count, data_event_count, byte_count,
                            last_transaction_id, create_time)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                        ON CONFLICT(batch_id) DO UPDATE SET
                            status = excluded.status,
                            insert_count = excluded.insert_count,
                            update_count = excluded.update_count,
                            delete_count = excluded.delete_count,
                            other_count = excluded.other_count,
                            data_event_count = excluded.data_event_count,
                            byte_count = excluded.byte_count,
                            last_transaction_id = excluded.last_transaction_id
                        "#,
                    )
                    .bind(batch.batch_id)
                    .bind(&batch.node_id)
                    .bind(&batch.channel_id)
                    .bind(batch.status.code())
                    .bind(batch.insert_count as i64)
                    .bind(batch.update_count as i64)
                    .bind(batch.delete_count as i64)
                    .bind(batch.other_count as i64)
                    .bind(batch.data_event_count as i64)
                    .bind(batch.byte_count as i64)
                    .bind(&batch.last_transaction_id)
                    .bind(batch.created_at)
                    .execute(&mut *tx)
                    .await?;
                }
                for event in events {
                    sqlx::query("INSERT OR IGNORE INTO data_event (data_id, batch_id, router_id) VALUES (?, ?, ?)")
                        .bind(event.data_id)
                        .bind(event.batch_id)
                        .bind(&event.router_id)
                        .execute(&mut *tx)
                        .await?;
                }
                tx.commit().await
            })
            .await?;
            Ok(())
        })
    }

    fn batches_for_node<'a>(&'a self, node_id: &'a str) -> BoxFuture<'a, Vec<OutgoingBatch>> {
        Box::pin(async move {
            let pool = &self.pool;
            let rows = execute_with_retry("batches_for_node", || async {
                sqlx::query("SELECT * FROM outgoing_batch WHERE node_id = ? ORDER BY batch_id")
                    .bind(node_id)
                    .fetch_all(pool)
                    .await
            })
            .await?;
            rows.iter().map(decode_batch).collect()
        })
    }

    fn batch_events(&self, batch_id: i64) -> BoxFuture<'_, Vec<DataEvent>> {
        Box::pin(async move {
            let pool = &self.pool;
            let rows: Vec<(i64, i64, String)> = execute_with_retry("batch_events", || async {
                sqlx::query_as(
                    "SELECT data_id, batch_id, router_id FROM data_event WHERE batch_id = ? ORDER BY data_id",
                )
                .bind(batch_id)
                .fetch_all(pool)
                .await
            })
            .await?;
            Ok(rows
                .into_iter()
                .map(|(data_id, batch_id, router_id)| DataEvent {
                    data_id,
                    batch_id,
                    router_id,
                })
                .collect())
        })
    }

    fn update_batch_status(&self, batch_id: i64, status: BatchStatus) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let pool = &self.pool;
            execute_with_retry("update_batch_status", || async {
                sqlx::query("UPDATE outgoing_batch SET status = ? WHERE batch_id = ?")
                    .bind(status.code())
                    .bind(batch_id)
                    .execute(pool)
                    .await
            })
            .await?;
            Ok(())
        })
    }
}

impl RoutingLookups for SqliteStore {
    fn lookup_external_ids<'a>(
        &'a self,
        lookup_table: &'a str,
        lookup_key_column: &'a str,
        external_id_column: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            for ident in [lookup_table, lookup_key_column, external_id_column] {
                if !is_identifier(ident) {
                    return Err(ReplicationError::Config(format!(
                        "invalid lookup table identifier '{}'",
                        ident
                    )));
                }
            }
            let sql = format!(
                "SELECT CAST({} AS TEXT) FROM {} WHERE {} = ?",
                external_id_column, lookup_table, lookup_key_column
            );
            let pool = &self.pool;
            let rows: Vec<(Option<String>,)> = execute_with_retry("lookup_external_ids", || async {
                sqlx::query_as(&sql).bind(key).fetch_all(pool).await
            })
            .await?;
            Ok(rows.into_iter().filter_map(|(id,)| id).collect())
        })
    }

    fn subselect<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [(String, Option<String>)],
    ) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let (expanded, binds) = expand_named_params(sql, params);
            let pool = &self.pool;
            let rows: Vec<SqliteRow> = execute_with_retry("subselect", || {
                let mut query = sqlx::query(&expanded);
                for value in &binds {
                    query = query.bind(value.clone());
                }
                query.fetch_all(pool)
            })
            .await?;
            let mut ids = Vec::with_capacity(rows.len());
            for row in &rows {
                // Node ids may be stored as integers; read either representation.
                let id = match row.try_get::<Option<String>, _>(0) {
                    Ok(v) => v,
                    Err(_) => row.try_get::<Option<i64>, _>(0)?.map(|n| n.to_string()),
                };
                if let Some(id) = id {
                    ids.push(id);
                }
            }
            Ok(ids)
        })
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}
