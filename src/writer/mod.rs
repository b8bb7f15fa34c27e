// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conflict-aware apply engine.
//!
//! [`ConflictAwareWriter`] turns delivered batches into statements against a
//! [`TargetPlatform`]. Each batch runs in its own transaction:
//!
//! ```text
//! begin ─► row ─► row ─► ... ─► commit            batch_committed
//!            │         └─ every N rows: commit, sleep, begin   early_commit
//!            └─ CONFLICT ─► resolver (inside the transaction)
//! error ─► rollback                                batch_rolled_back
//! ```
//!
//! INSERT, UPDATE and DELETE detect conflicts through the table's
//! [`ConflictSettings`]; SQL, CREATE and SCRIPT rows only succeed or fail.

pub mod conflict;
pub mod platform;
pub mod statement;

pub use conflict::{
    ConflictInfo, ConflictResolver, ConflictSettings, DefaultConflictResolver, DetectConflict, ResolveConflict,
};
pub use platform::{PlatformTransaction, SqlitePlatform, TableColumn, TableDefinition, TargetPlatform};
pub use statement::{requires_new_statement, DmlStatement, DmlType, StatementKey};

use crate::config::{EngineConfig, WriterConfig};
use crate::error::{PlatformErrorKind, ReplicationError, Result};
use crate::metrics;
use crate::model::{ChangeRow, EventType, OutgoingBatch};
use crate::payload;
use crate::resilience::Bulkhead;
use crate::store::BoxFuture;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Outcome of one row operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Success,
    Conflict,
}

/// Per-batch counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub rows: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub conflicts: u64,
    pub fallback_inserts: u64,
    pub fallback_updates: u64,
    pub missing_deletes: u64,
    pub ignored_rows: u64,
    pub statements_built: u64,
    pub early_commits: u64,
    pub sql_statements: u64,
    pub tables_created: u64,
    pub scripts_run: u64,
    /// The resolver skipped the remainder of the batch.
    pub batch_ignored: bool,
}

/// Hooks around batch commits. All methods default to no-ops.
pub trait WriterListener: Send + Sync {
    fn early_commit(&self, _batch_id: i64, _stats: &WriterStats) {}

    fn batch_committed(&self, _batch_id: i64, _stats: &WriterStats) {}

    fn batch_rolled_back(&self, _batch_id: i64, _error: &ReplicationError) {}
}

/// Runs SCRIPT rows.
pub trait ScriptRunner: Send + Sync {
    fn run<'a>(&'a self, batch: &'a OutgoingBatch, script: &'a str) -> BoxFuture<'a, ()>;
}

pub struct ConflictAwareWriter {
    platform: Arc<dyn TargetPlatform>,
    config: WriterConfig,
    conflicts: Vec<ConflictSettings>,
    default_conflict: ConflictSettings,
    resolver: Arc<dyn ConflictResolver>,
    listeners: Vec<Arc<dyn WriterListener>>,
    script_runner: Option<Arc<dyn ScriptRunner>>,
    tables: DashMap<String, Arc<TableDefinition>>,
    bulkhead: Bulkhead,
}

impl ConflictAwareWriter {
    pub fn new(platform: Arc<dyn TargetPlatform>, config: WriterConfig, conflicts: Vec<ConflictSettings>) -> Self {
        let bulkhead = Bulkhead::new(config.max_concurrent_batches);
        Self {
            platform,
            config,
            conflicts,
            default_conflict: ConflictSettings::default(),
            resolver: Arc::new(DefaultConflictResolver),
            listeners: Vec::new(),
            script_runner: None,
            tables: DashMap::new(),
            bulkhead,
        }
    }

    pub fn from_config(platform: Arc<dyn TargetPlatform>, config: &EngineConfig) -> Self {
        Self::new(platform, config.settings.writer.clone(), config.conflicts.clone())
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn WriterListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_script_runner(mut self, runner: Arc<dyn ScriptRunner>) -> Self {
        self.script_runner = Some(runner);
        self
    }

    pub fn platform(&self) -> &Arc<dyn TargetPlatform> {
        &self.platform
    }

    pub fn conflict_for(&self, table: &str) -> &ConflictSettings {
        conflict::settings_for(&self.conflicts, table).unwrap_or(&self.default_conflict)
    }

    /// Target table layout, cached after the first read.
    pub async fn table(&self, name: &str) -> Result<Arc<TableDefinition>> {
        let key = name.to_ascii_lowercase();
        if let Some(table) = self.tables.get(&key) {
            return Ok(Arc::clone(table.value()));
        }

        let table = self.platform.read_table(name).await?.ok_or_else(|| {
            ReplicationError::platform(
                PlatformErrorKind::Other,
                format!("Table {} does not exist on the target", name),
            )
        })?;
        let table = Arc::new(table);
        self.tables.insert(key, Arc::clone(&table));
        Ok(table)
    }

    pub fn invalidate_table(&self, name: &str) {
        self.tables.remove(&name.to_ascii_lowercase());
    }

    /// Apply one batch in its own transaction.
    #[instrument(skip_all, fields(batch_id = batch.batch_id, channel = %batch.channel_id, rows = rows.len()))]
    pub async fn load_batch(&self, batch: &OutgoingBatch, rows: &[ChangeRow]) -> Result<WriterStats> {
        let _permit = self
            .bulkhead
            .acquire()
            .await
            .map_err(|e| ReplicationError::Internal(e.to_string()))?;
        let start = Instant::now();

        let tx = self.platform.begin().await?;
        let mut writer = BatchWriter::new(self, batch, tx);
        let applied = writer.apply_all(rows).await;
        let result = match applied {
            Ok(()) => writer.finish().await,
            Err(e) => {
                writer.abort().await;
                Err(e)
            }
        };

        match &result {
            Ok(stats) => {
                for listener in &self.listeners {
                    listener.batch_committed(batch.batch_id, stats);
                }
                metrics::record_batch_applied(true, stats.rows, start.elapsed());
                info!(
                    rows = stats.rows,
                    conflicts = stats.conflicts,
                    ignored = stats.ignored_rows,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Batch applied"
                );
            }
            Err(e) => {
                for listener in &self.listeners {
                    listener.batch_rolled_back(batch.batch_id, e);
                }
                metrics::record_batch_applied(false, 0, start.elapsed());
                warn!(error = %e, "Batch rolled back");
            }
        }
        result
    }

    /// Apply several batches, each in its own transaction. Concurrency is
    /// capped by `max_concurrent_batches`.
    pub async fn load_batches(&self, batches: &[(OutgoingBatch, Vec<ChangeRow>)]) -> Vec<Result<WriterStats>> {
        futures::future::join_all(batches.iter().map(|(batch, rows)| self.load_batch(batch, rows))).await
    }
}

/// Parsed payloads of one row, looked up by column name.
struct RowData<'r> {
    row: &'r ChangeRow,
    new: Option<Vec<Option<String>>>,
    old: Option<Vec<Option<String>>>,
    pk: Option<Vec<Option<String>>>,
}

impl<'r> RowData<'r> {
    fn parse(row: &'r ChangeRow) -> Result<Self> {
        Ok(Self {
            row,
            new: row.parsed_row_data()?,
            old: row.parsed_old_data()?,
            pk: row.pk_data.as_deref().map(payload::decode_row).transpose()?,
        })
    }

    fn has_column(&self, name: &str) -> bool {
        self.row.snapshot.column_index(name).is_some()
    }

    fn new_value(&self, name: &str) -> Option<String> {
        let i = self.row.snapshot.column_index(name)?;
        self.new.as_ref()?.get(i).cloned().flatten()
    }

    fn old_value(&self, name: &str) -> Option<String> {
        let i = self.row.snapshot.column_index(name)?;
        self.old.as_ref()?.get(i).cloned().flatten()
    }

    fn pk_value(&self, name: &str) -> Option<String> {
        let position = self
            .row
            .snapshot
            .pk_column_names
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name));
        if let (Some(pk), Some(i)) = (&self.pk, position) {
            return pk.get(i).cloned().flatten();
        }
        if self.old.is_some() {
            self.old_value(name)
        } else {
            self.new_value(name)
        }
    }

    /// Value a lookup key is matched against: the pk as captured, other
    /// columns as they were before the change.
    fn key_value(&self, column: &TableColumn) -> Option<String> {
        if column.primary_key {
            self.pk_value(&column.name)
        } else if self.old.is_some() {
            self.old_value(&column.name)
        } else {
            self.new_value(&column.name)
        }
    }
}

fn needs_update(column: &TableColumn, data: &RowData<'_>, apply_changes_only: bool, auto_increment_updatable: bool) -> bool {
    if column.auto_increment && !auto_increment_updatable {
        return false;
    }
    let new = data.new_value(&column.name);
    match &data.old {
        Some(_) if apply_changes_only => {
            let old = data.old_value(&column.name);
            // Large objects are often not captured in old data.
            new != old || (column.lob && old.as_deref().map_or(true, str::is_empty))
        }
        _ => !column.primary_key || data.pk_value(&column.name) != new,
    }
}

fn lookup_keys<'t>(
    platform: &dyn TargetPlatform,
    table: &'t TableDefinition,
    data: &RowData<'_>,
    conflict: &ConflictSettings,
    changed: &[&'t TableColumn],
    conflict_detection: bool,
) -> Result<Vec<&'t TableColumn>> {
    let present: Vec<&TableColumn> = table.columns.iter().filter(|c| data.has_column(&c.name)).collect();
    let pks: Vec<&TableColumn> = present.iter().copied().filter(|c| c.primary_key).collect();
    let has_old = data.old.is_some();
    let detect = if conflict_detection {
        conflict.detect
    } else {
        DetectConflict::PrimaryKey
    };

    let mut keys: Vec<&TableColumn> = match detect {
        DetectConflict::FullOldRow if has_old => present
            .iter()
            .copied()
            .filter(|c| c.primary_key || !conflict.is_excluded(&c.name))
            .collect(),
        DetectConflict::ChangedColumns if has_old => changed
            .iter()
            .copied()
            .filter(|c| !c.primary_key && !conflict.is_excluded(&c.name))
            .chain(pks.iter().copied())
            .collect(),
        DetectConflict::VersionColumn | DetectConflict::TimestampColumn if has_old => conflict
            .detect_expression
            .as_deref()
            .and_then(|name| present.iter().copied().find(|c| c.name.eq_ignore_ascii_case(name)))
            .filter(|c| !c.primary_key)
            .into_iter()
            .chain(pks.iter().copied())
            .collect(),
        _ => pks,
    };

    if keys.is_empty() {
        keys = present;
    }
    keys.retain(|c| platform.can_use_in_where(c));
    if keys.is_empty() {
        return Err(ReplicationError::NoLookupKeys {
            table: table.name.clone(),
        });
    }
    Ok(keys)
}

/// Split on `;` outside quoted text.
fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in sql.chars() {
        match (quote, ch) {
            (None, '\'' | '"') => {
                quote = Some(ch);
                current.push(ch);
            }
            (Some(q), c) if c == q => {
                quote = None;
                current.push(ch);
            }
            (None, ';') => {
                let statement = current.trim();
                if !statement.is_empty() {
                    statements.push(statement.to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
    statements
}

fn first_value(row: &ChangeRow) -> Result<String> {
    row.parsed_row_data()?
        .and_then(|values| values.into_iter().next().flatten())
        .ok_or_else(|| {
            ReplicationError::Payload(format!(
                "{} event for data id {} carries no payload",
                row.event_type, row.data_id
            ))
        })
}

/// State of one batch being applied. Handed to the [`ConflictResolver`] so it
/// can issue fallback statements in the same transaction.
pub struct BatchWriter<'w> {
    writer: &'w ConflictAwareWriter,
    batch: &'w OutgoingBatch,
    tx: Option<Box<dyn PlatformTransaction>>,
    current: Option<(StatementKey, DmlStatement)>,
    stats: WriterStats,
    uncommitted: usize,
    in_fallback: bool,
    last_conflict: Option<ConflictInfo>,
}

impl<'w> BatchWriter<'w> {
    fn new(writer: &'w ConflictAwareWriter, batch: &'w OutgoingBatch, tx: Box<dyn PlatformTransaction>) -> Self {
        Self {
            writer,
            batch,
            tx: Some(tx),
            current: None,
            stats: WriterStats::default(),
            uncommitted: 0,
            in_fallback: false,
            last_conflict: None,
        }
    }

    pub fn batch(&self) -> &OutgoingBatch {
        self.batch
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut WriterStats {
        &mut self.stats
    }

    /// The most recent conflict seen by a writer operation.
    pub fn last_conflict(&self) -> Option<&ConflictInfo> {
        self.last_conflict.as_ref()
    }

    fn tx(&mut self) -> Result<&mut Box<dyn PlatformTransaction>> {
        self.tx.as_mut().ok_or_else(|| ReplicationError::InvalidState {
            expected: "open transaction".to_string(),
            actual: "none".to_string(),
        })
    }

    async fn apply_all(&mut self, rows: &[ChangeRow]) -> Result<()> {
        for (index, row) in rows.iter().enumerate() {
            match self.apply_row(row).await {
                Ok(()) => {}
                Err(ReplicationError::IgnoreBatch) => {
                    let skipped = (rows.len() - index) as u64;
                    self.stats.ignored_rows += skipped;
                    self.stats.batch_ignored = true;
                    info!(data_id = row.data_id, skipped, "Ignoring remainder of batch");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }

            self.stats.rows += 1;
            self.uncommitted += 1;
            if self.uncommitted >= self.writer.config.max_rows_before_commit.max(1) {
                self.early_commit().await?;
            }
        }
        Ok(())
    }

    /// Apply one row, handing conflicts to the resolver. Called from inside a
    /// resolver, a conflict fails the batch instead.
    pub async fn apply_row(&mut self, row: &ChangeRow) -> Result<()> {
        let writer = self.writer;
        let conflict = writer.conflict_for(&row.table_name);

        let status = match row.event_type {
            EventType::Insert => self.insert(row, true).await?,
            EventType::Update => self.update(row, writer.config.apply_changes_only, true).await?,
            EventType::Delete => self.delete(row, true).await?,
            EventType::Sql => self.sql(row).await?,
            EventType::Create => self.create(row).await?,
            EventType::Script => self.script(row).await?,
            EventType::Reload => {
                debug!(data_id = row.data_id, table = %row.table_name, "Reload request needs no apply");
                LoadStatus::Success
            }
        };

        if status == LoadStatus::Conflict {
            self.stats.conflicts += 1;
            metrics::record_conflict(&row.table_name, conflict.resolve.as_str());

            if self.in_fallback {
                return Err(ReplicationError::ConflictUnresolved {
                    table: row.table_name.clone(),
                    event: row.event_type.to_string(),
                    data_id: row.data_id,
                });
            }

            let info = self
                .last_conflict
                .take()
                .unwrap_or_else(|| ConflictInfo::new(row.event_type));
            let resolver = Arc::clone(&writer.resolver);
            self.in_fallback = true;
            let resolved = resolver.resolve(self, row, conflict, &info).await;
            self.in_fallback = false;
            resolved?;
        }

        metrics::record_row_applied(&row.event_type.to_string());
        Ok(())
    }

    /// Reuse the current statement unless its shape changed.
    fn prepare(&mut self, key: StatementKey, build: impl FnOnce(&StatementKey) -> DmlStatement) -> DmlStatement {
        if let Some((current_key, statement)) = &self.current {
            if !requires_new_statement(Some(current_key), &key) {
                return statement.clone();
            }
        }
        let statement = build(&key);
        self.stats.statements_built += 1;
        self.current = Some((key, statement.clone()));
        statement
    }

    pub async fn insert(&mut self, row: &ChangeRow, conflict_detection: bool) -> Result<LoadStatus> {
        let table = self.writer.table(&row.table_name).await?;
        let data = RowData::parse(row)?;
        if data.new.is_none() {
            return Err(ReplicationError::Payload(format!(
                "Insert for data id {} has no row data",
                row.data_id
            )));
        }

        let columns: Vec<&TableColumn> = table.columns.iter().filter(|c| data.has_column(&c.name)).collect();
        let values: Vec<Option<String>> = columns.iter().map(|c| data.new_value(&c.name)).collect();
        let key = StatementKey {
            dml: DmlType::Insert,
            event: row.event_type,
            table: table.name.clone(),
            columns: columns.iter().map(|c| c.name.clone()).collect(),
            keys: Vec::new(),
            conflict_detection,
            apply_changes_only: false,
            null_keys: Vec::new(),
        };
        let statement = self.prepare(key, |k| DmlStatement::insert(&k.table, &k.columns));
        let binds = statement.bind_values(&values, &[]);

        let result = self.tx()?.execute(&statement.sql, &binds).await;
        match result {
            Ok(0) => self.conflict(row, &table, None).await,
            Ok(_) => {
                self.stats.inserted += 1;
                Ok(LoadStatus::Success)
            }
            Err(e) if e.platform_kind() == Some(PlatformErrorKind::UniqueViolation) => {
                self.conflict(row, &table, e.platform_kind()).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn update(
        &mut self,
        row: &ChangeRow,
        apply_changes_only: bool,
        conflict_detection: bool,
    ) -> Result<LoadStatus> {
        let writer = self.writer;
        let table = writer.table(&row.table_name).await?;
        let data = RowData::parse(row)?;
        if data.new.is_none() {
            return Err(ReplicationError::Payload(format!(
                "Update for data id {} has no row data",
                row.data_id
            )));
        }

        let auto_increment_updatable = writer.platform.auto_increment_updatable();
        let changed: Vec<&TableColumn> = table
            .columns
            .iter()
            .filter(|c| data.has_column(&c.name))
            .filter(|c| needs_update(c, &data, apply_changes_only, auto_increment_updatable))
            .collect();
        if changed.is_empty() {
            debug!(data_id = row.data_id, table = %table.name, "Update changes nothing");
            return Ok(LoadStatus::Success);
        }

        let conflict = writer.conflict_for(&row.table_name);
        let keys = lookup_keys(
            writer.platform.as_ref(),
            &table,
            &data,
            conflict,
            &changed,
            conflict_detection,
        )?;
        let key_values: Vec<Option<String>> = keys.iter().map(|c| data.key_value(c)).collect();
        let values: Vec<Option<String>> = changed.iter().map(|c| data.new_value(&c.name)).collect();

        let key = StatementKey {
            dml: DmlType::Update,
            event: row.event_type,
            table: table.name.clone(),
            columns: changed.iter().map(|c| c.name.clone()).collect(),
            keys: keys.iter().map(|c| c.name.clone()).collect(),
            conflict_detection,
            apply_changes_only,
            null_keys: key_values.iter().map(Option::is_none).collect(),
        };
        let statement = self.prepare(key, |k| DmlStatement::update(&k.table, &k.columns, &k.keys, &k.null_keys));
        let binds = statement.bind_values(&values, &key_values);

        let result = self.tx()?.execute(&statement.sql, &binds).await;
        match result {
            Ok(0) => self.conflict(row, &table, None).await,
            Ok(_) => {
                self.stats.updated += 1;
                Ok(LoadStatus::Success)
            }
            Err(e) if e.platform_kind().is_some_and(|k| k != PlatformErrorKind::Other) => {
                self.conflict(row, &table, e.platform_kind()).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn delete(&mut self, row: &ChangeRow, conflict_detection: bool) -> Result<LoadStatus> {
        let writer = self.writer;
        let table = writer.table(&row.table_name).await?;
        let data = RowData::parse(row)?;

        let conflict = writer.conflict_for(&row.table_name);
        let keys = lookup_keys(writer.platform.as_ref(), &table, &data, conflict, &[], conflict_detection)?;
        let key_values: Vec<Option<String>> = keys.iter().map(|c| data.key_value(c)).collect();

        let key = StatementKey {
            dml: DmlType::Delete,
            event: row.event_type,
            table: table.name.clone(),
            columns: Vec::new(),
            keys: keys.iter().map(|c| c.name.clone()).collect(),
            conflict_detection,
            apply_changes_only: false,
            null_keys: key_values.iter().map(Option::is_none).collect(),
        };
        let statement = self.prepare(key, |k| DmlStatement::delete(&k.table, &k.keys, &k.null_keys));
        let binds = statement.bind_values(&[], &key_values);

        let result = self.tx()?.execute(&statement.sql, &binds).await;
        match result {
            Ok(0) => self.conflict(row, &table, None).await,
            Ok(_) => {
                self.stats.deleted += 1;
                Ok(LoadStatus::Success)
            }
            Err(e) if e.platform_kind() == Some(PlatformErrorKind::ForeignKeyViolation) => {
                self.conflict(row, &table, e.platform_kind()).await
            }
            Err(e) => Err(e),
        }
    }

    async fn conflict(
        &mut self,
        row: &ChangeRow,
        table: &TableDefinition,
        error_kind: Option<PlatformErrorKind>,
    ) -> Result<LoadStatus> {
        let capture = self.writer.conflict_for(&row.table_name).capture_current_row;
        let current_row = if capture && row.event_type != EventType::Delete {
            self.select_current(row, table).await?
        } else {
            None
        };

        debug!(
            data_id = row.data_id,
            table = %table.name,
            event = %row.event_type,
            error_kind = ?error_kind,
            found = current_row.is_some(),
            "Conflict detected"
        );
        self.last_conflict = Some(ConflictInfo {
            event: row.event_type,
            error_kind,
            current_row,
        });
        Ok(LoadStatus::Conflict)
    }

    /// The target row with the same primary key, if any.
    pub async fn current_row(&mut self, row: &ChangeRow) -> Result<Option<Vec<(String, Option<String>)>>> {
        let table = self.writer.table(&row.table_name).await?;
        self.select_current(row, &table).await
    }

    async fn select_current(
        &mut self,
        row: &ChangeRow,
        table: &TableDefinition,
    ) -> Result<Option<Vec<(String, Option<String>)>>> {
        let data = RowData::parse(row)?;
        let pks: Vec<&TableColumn> = table.pk_columns().collect();
        if pks.is_empty() {
            return Ok(None);
        }

        let keys: Vec<String> = pks.iter().map(|c| c.name.clone()).collect();
        let key_values: Vec<Option<String>> = pks.iter().map(|c| data.pk_value(&c.name)).collect();
        let null_keys: Vec<bool> = key_values.iter().map(Option::is_none).collect();
        let columns: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();

        let statement = DmlStatement::select(&table.name, &columns, &keys, &null_keys);
        let binds = statement.bind_values(&[], &key_values);
        let found = self.tx()?.query_row(&statement.sql, &binds).await?;
        Ok(found.map(|values| columns.into_iter().zip(values).collect()))
    }

    async fn sql(&mut self, row: &ChangeRow) -> Result<LoadStatus> {
        let sql = first_value(row)?;
        let statements = split_statements(&sql);
        for statement in &statements {
            debug!(data_id = row.data_id, sql = %statement, "Running SQL event");
            self.tx()?.execute(statement, &[]).await?;
        }
        self.stats.sql_statements += statements.len() as u64;
        Ok(LoadStatus::Success)
    }

    /// CREATE commits what came before it and runs outside the batch
    /// transaction.
    async fn create(&mut self, row: &ChangeRow) -> Result<LoadStatus> {
        let table: TableDefinition = serde_json::from_str(&first_value(row)?)?;
        let platform = Arc::clone(&self.writer.platform);

        self.commit_transaction().await?;
        if let Err(e) = platform.create_table(&table, true).await {
            warn!(table = %table.name, error = %e, "Create failed, retrying without column defaults");
            platform.create_table(&table, false).await?;
        }
        self.writer.invalidate_table(&table.name);
        self.writer.invalidate_table(&row.table_name);
        self.current = None;
        self.stats.tables_created += 1;
        self.begin_transaction().await?;
        Ok(LoadStatus::Success)
    }

    async fn script(&mut self, row: &ChangeRow) -> Result<LoadStatus> {
        let script = first_value(row)?;
        let runner = self.writer.script_runner.as_ref().ok_or_else(|| {
            ReplicationError::platform(
                PlatformErrorKind::Other,
                format!("No script runner registered for data id {}", row.data_id),
            )
        })?;
        runner.run(self.batch, &script).await?;
        self.stats.scripts_run += 1;
        Ok(LoadStatus::Success)
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.tx = Some(self.writer.platform.begin().await?);
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        self.uncommitted = 0;
        Ok(())
    }

    async fn early_commit(&mut self) -> Result<()> {
        self.commit_transaction().await?;
        self.stats.early_commits += 1;
        metrics::record_early_commit();
        for listener in &self.writer.listeners {
            listener.early_commit(self.batch.batch_id, &self.stats);
        }
        debug!(batch_id = self.batch.batch_id, rows = self.stats.rows, "Early commit");

        let pause = self.writer.config.commit_sleep_duration();
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        self.begin_transaction().await
    }

    async fn finish(mut self) -> Result<WriterStats> {
        self.commit_transaction().await?;
        Ok(self.stats)
    }

    async fn abort(&mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                warn!(batch_id = self.batch.batch_id, error = %e, "Rollback failed");
            }
        }
    }
}
