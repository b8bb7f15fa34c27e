// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Target platform adapter.
//!
//! The writer only needs a handful of things from the target database:
//! transactions, parameterised statements whose failures are classified
//! (uniqueness vs. foreign key vs. anything else), table metadata and DDL.
//! [`SqlitePlatform`] provides them on a `sqlx` SQLite pool.

use crate::error::{PlatformErrorKind, ReplicationError, Result};
use crate::store::BoxFuture;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// One column of a target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    #[serde(rename = "type", default = "default_type_name")]
    pub type_name: String,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub auto_increment: bool,
    /// Large object column. Never used in a WHERE clause.
    #[serde(default)]
    pub lob: bool,
    #[serde(default)]
    pub default_value: Option<String>,
}

fn default_type_name() -> String {
    "TEXT".to_string()
}

impl TableColumn {
    pub fn new(name: &str, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
            primary_key: false,
            required: false,
            auto_increment: false,
            lob: false,
            default_value: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.required = true;
        self
    }

    pub fn lob(mut self) -> Self {
        self.lob = true;
        self
    }

    pub fn with_default(mut self, value: &str) -> Self {
        self.default_value = Some(value.to_string());
        self
    }
}

/// Table layout, as read from the target or carried by a CREATE event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<TableColumn>,
}

impl TableDefinition {
    pub fn new(name: &str, columns: Vec<TableColumn>) -> Self {
        Self {
            name: name.to_string(),
            columns,
        }
    }

    /// Case-insensitive column lookup.
    pub fn column(&self, name: &str) -> Option<&TableColumn> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn pk_columns(&self) -> impl Iterator<Item = &TableColumn> {
        self.columns.iter().filter(|c| c.primary_key)
    }

    pub fn create_sql(&self, with_defaults: bool) -> String {
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut part = format!("{} {}", quote_identifier(&c.name), c.type_name);
                if c.required {
                    part.push_str(" NOT NULL");
                }
                if with_defaults {
                    if let Some(default) = &c.default_value {
                        part.push_str(" DEFAULT ");
                        part.push_str(default);
                    }
                }
                part
            })
            .collect();

        let pks: Vec<String> = self.pk_columns().map(|c| quote_identifier(&c.name)).collect();
        if !pks.is_empty() {
            parts.push(format!("PRIMARY KEY ({})", pks.join(", ")));
        }

        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_identifier(&self.name),
            parts.join(", ")
        )
    }
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// One open transaction on the target.
pub trait PlatformTransaction: Send {
    /// Run one statement, binding `values` in order. Returns affected rows.
    fn execute<'a>(&'a mut self, sql: &'a str, values: &'a [Option<String>]) -> BoxFuture<'a, u64>;

    /// First row of a query, every column read as text.
    fn query_row<'a>(
        &'a mut self,
        sql: &'a str,
        values: &'a [Option<String>],
    ) -> BoxFuture<'a, Option<Vec<Option<String>>>>;

    fn commit(self: Box<Self>) -> BoxFuture<'static, ()>;

    fn rollback(self: Box<Self>) -> BoxFuture<'static, ()>;
}

pub trait TargetPlatform: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn begin(&self) -> BoxFuture<'_, Box<dyn PlatformTransaction>>;

    /// Table layout, or `None` when the table does not exist.
    fn read_table<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Option<TableDefinition>>;

    /// Create a table in its own committed transaction.
    fn create_table<'a>(&'a self, table: &'a TableDefinition, with_defaults: bool) -> BoxFuture<'a, ()>;

    /// Whether UPDATE may assign auto-increment columns.
    fn auto_increment_updatable(&self) -> bool {
        false
    }

    fn can_use_in_where(&self, column: &TableColumn) -> bool {
        !column.lob
    }
}

/// Map a driver error onto the writer's classification.
///
/// Busy errors stay `Store` errors so they remain retryable.
pub fn classify_error(err: sqlx::Error) -> ReplicationError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return ReplicationError::platform(PlatformErrorKind::UniqueViolation, db.message());
        }
        if db.is_foreign_key_violation() {
            return ReplicationError::platform(PlatformErrorKind::ForeignKeyViolation, db.message());
        }
    }
    if crate::store::is_sqlite_busy_error(&err) {
        return ReplicationError::Store(err);
    }
    ReplicationError::platform(PlatformErrorKind::Other, err.to_string())
}

// ═══════════════════════════════════════════════════════════════════════════════
// SQLite
// ═══════════════════════════════════════════════════════════════════════════════

pub struct SqlitePlatform {
    pool: SqlitePool,
}

impl SqlitePlatform {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) a target database with foreign keys enforced.
    pub async fn open(path: &str) -> Result<Self> {
        info!(path = %path, "Opening target database");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

struct SqliteTransaction {
    tx: sqlx::Transaction<'static, Sqlite>,
}

impl PlatformTransaction for SqliteTransaction {
    fn execute<'a>(&'a mut self, sql: &'a str, values: &'a [Option<String>]) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            let mut query = sqlx::query(sql);
            for value in values {
                query = query.bind(value.as_deref());
            }
            let result = query.execute(&mut *self.tx).await.map_err(classify_error)?;
            Ok(result.rows_affected())
        })
    }

    fn query_row<'a>(
        &'a mut self,
        sql: &'a str,
        values: &'a [Option<String>],
    ) -> BoxFuture<'a, Option<Vec<Option<String>>>> {
        Box::pin(async move {
            let mut query = sqlx::query(sql);
            for value in values {
                query = query.bind(value.as_deref());
            }
            let row = query.fetch_optional(&mut *self.tx).await.map_err(classify_error)?;
            row.map(|row| {
                (0..row.len())
                    .map(|i| row.try_get::<Option<String>, _>(i).map_err(ReplicationError::from))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()
        })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move { self.tx.commit().await.map_err(classify_error) })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move { self.tx.rollback().await.map_err(classify_error) })
    }
}

impl TargetPlatform for SqlitePlatform {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn begin(&self) -> BoxFuture<'_, Box<dyn PlatformTransaction>> {
        Box::pin(async move {
            let tx = self.pool.begin().await.map_err(classify_error)?;
            Ok(Box::new(SqliteTransaction { tx }) as Box<dyn PlatformTransaction>)
        })
    }

    fn read_table<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Option<TableDefinition>> {
        Box::pin(async move {
            let sql = format!("PRAGMA table_info({})", quote_identifier(table));
            let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
            if rows.is_empty() {
                return Ok(None);
            }

            let mut columns = Vec::with_capacity(rows.len());
            let mut pk_positions = Vec::new();
            for row in &rows {
                let name: String = row.try_get("name")?;
                let type_name: String = row.try_get("type")?;
                let not_null: i64 = row.try_get("notnull")?;
                let default_value: Option<String> = row.try_get("dflt_value")?;
                let pk: i64 = row.try_get("pk")?;

                let upper = type_name.to_ascii_uppercase();
                let mut column = TableColumn::new(&name, &type_name);
                column.required = not_null != 0 || pk > 0;
                column.primary_key = pk > 0;
                column.lob = upper.contains("BLOB") || upper.contains("CLOB");
                column.default_value = default_value;
                if pk > 0 {
                    pk_positions.push((pk, columns.len()));
                }
                columns.push(column);
            }

            // A lone INTEGER PRIMARY KEY aliases the rowid.
            if let [(_, index)] = pk_positions.as_slice() {
                if columns[*index].type_name.eq_ignore_ascii_case("INTEGER") {
                    columns[*index].auto_increment = true;
                }
            }

            debug!(table = %table, columns = columns.len(), "Read target table");
            Ok(Some(TableDefinition::new(table, columns)))
        })
    }

    fn create_table<'a>(&'a self, table: &'a TableDefinition, with_defaults: bool) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let sql = table.create_sql(with_defaults);
            let mut tx = self.pool.begin().await.map_err(classify_error)?;
            sqlx::query(&sql).execute(&mut *tx).await.map_err(classify_error)?;
            tx.commit().await.map_err(classify_error)?;
            info!(table = %table.name, "Created target table");
            Ok(())
        })
    }

    fn auto_increment_updatable(&self) -> bool {
        true
    }
}
