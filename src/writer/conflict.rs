// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conflict policies and the default resolver.
//!
//! A policy has two halves. `detect` decides which columns go into the
//! WHERE clause of UPDATE and DELETE, and so what counts as a conflict.
//! `resolve` decides what happens once one is found:
//!
//! | Resolution | INSERT | UPDATE | DELETE |
//! |------------|--------|--------|--------|
//! | `fallback` | update by pk | update by pk, else insert | delete by pk, else count as missing |
//! | `newer_wins` | fallback when the incoming version is newer, else ignore | same | same |
//! | `ignore` | skip the row (or the rest of the batch) | same | same |
//! | `manual` | fail the batch | same | same |

use super::{BatchWriter, LoadStatus};
use crate::error::{PlatformErrorKind, ReplicationError, Result};
use crate::model::{ChangeRow, EventType};
use crate::store::BoxFuture;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectConflict {
    #[default]
    PrimaryKey,
    FullOldRow,
    ChangedColumns,
    /// Numeric version column named by `detect_expression`.
    VersionColumn,
    /// Timestamp column named by `detect_expression`.
    TimestampColumn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveConflict {
    #[default]
    Fallback,
    NewerWins,
    Ignore,
    Manual,
}

impl ResolveConflict {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolveConflict::Fallback => "fallback",
            ResolveConflict::NewerWins => "newer_wins",
            ResolveConflict::Ignore => "ignore",
            ResolveConflict::Manual => "manual",
        }
    }
}

/// Per-table conflict policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSettings {
    #[serde(default = "default_conflict_id")]
    pub conflict_id: String,

    /// Table this policy applies to. `None` makes it the default policy.
    #[serde(default)]
    pub target_table: Option<String>,

    #[serde(default)]
    pub detect: DetectConflict,

    /// Version or timestamp column for the column based detectors.
    #[serde(default)]
    pub detect_expression: Option<String>,

    /// Columns never used as lookup keys.
    #[serde(default)]
    pub excluded_columns: Vec<String>,

    #[serde(default)]
    pub resolve: ResolveConflict,

    /// When false, an ignore resolution skips the rest of the batch.
    #[serde(default = "default_true")]
    pub resolve_row_only: bool,

    /// Fallback updates only touch changed columns.
    #[serde(default)]
    pub resolve_changes_only: bool,

    /// Read the current target row when a conflict is detected.
    #[serde(default = "default_true")]
    pub capture_current_row: bool,
}

fn default_conflict_id() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ConflictSettings {
    fn default() -> Self {
        Self {
            conflict_id: default_conflict_id(),
            target_table: None,
            detect: DetectConflict::default(),
            detect_expression: None,
            excluded_columns: Vec::new(),
            resolve: ResolveConflict::default(),
            resolve_row_only: true,
            resolve_changes_only: false,
            capture_current_row: true,
        }
    }
}

impl ConflictSettings {
    pub fn for_table(table: &str) -> Self {
        Self {
            conflict_id: table.to_string(),
            target_table: Some(table.to_string()),
            ..Self::default()
        }
    }

    pub fn detect(mut self, detect: DetectConflict, expression: Option<&str>) -> Self {
        self.detect = detect;
        self.detect_expression = expression.map(str::to_string);
        self
    }

    pub fn resolve(mut self, resolve: ResolveConflict) -> Self {
        self.resolve = resolve;
        self
    }

    pub fn is_excluded(&self, column: &str) -> bool {
        self.excluded_columns.iter().any(|c| c.eq_ignore_ascii_case(column))
    }
}

/// Table-specific policy first, then the default entry.
pub fn settings_for<'a>(conflicts: &'a [ConflictSettings], table: &str) -> Option<&'a ConflictSettings> {
    conflicts
        .iter()
        .find(|c| c.target_table.as_deref().is_some_and(|t| t.eq_ignore_ascii_case(table)))
        .or_else(|| conflicts.iter().find(|c| c.target_table.is_none()))
}

/// What the writer saw when a row conflicted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub event: EventType,
    /// Set when the conflict came from a violated constraint rather than a
    /// missed row.
    pub error_kind: Option<PlatformErrorKind>,
    pub current_row: Option<Vec<(String, Option<String>)>>,
}

impl ConflictInfo {
    pub fn new(event: EventType) -> Self {
        Self {
            event,
            error_kind: None,
            current_row: None,
        }
    }

    pub fn current_value(&self, column: &str) -> Option<&str> {
        self.current_row
            .as_ref()?
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .and_then(|(_, value)| value.as_deref())
    }
}

/// Decides what to do with a conflicting row.
///
/// Runs inside the batch transaction. Writer operations called from here
/// never re-enter the resolver.
pub trait ConflictResolver: Send + Sync {
    fn resolve<'a, 'w>(
        &'a self,
        writer: &'a mut BatchWriter<'w>,
        row: &'a ChangeRow,
        conflict: &'a ConflictSettings,
        info: &'a ConflictInfo,
    ) -> BoxFuture<'a, ()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConflictResolver;

impl ConflictResolver for DefaultConflictResolver {
    fn resolve<'a, 'w>(
        &'a self,
        writer: &'a mut BatchWriter<'w>,
        row: &'a ChangeRow,
        conflict: &'a ConflictSettings,
        info: &'a ConflictInfo,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            debug!(
                table = %row.table_name,
                data_id = row.data_id,
                event = %row.event_type,
                resolution = conflict.resolve.as_str(),
                "Resolving conflict"
            );
            match conflict.resolve {
                ResolveConflict::Manual => Err(unresolved(row)),
                ResolveConflict::Ignore => ignore(writer, conflict),
                ResolveConflict::Fallback => fallback(writer, row, conflict, info).await,
                ResolveConflict::NewerWins => {
                    if is_newer(writer, row, conflict).await? {
                        fallback(writer, row, conflict, info).await
                    } else {
                        ignore(writer, conflict)
                    }
                }
            }
        })
    }
}

fn unresolved(row: &ChangeRow) -> ReplicationError {
    ReplicationError::ConflictUnresolved {
        table: row.table_name.clone(),
        event: row.event_type.to_string(),
        data_id: row.data_id,
    }
}

fn ignore(writer: &mut BatchWriter<'_>, conflict: &ConflictSettings) -> Result<()> {
    if conflict.resolve_row_only {
        writer.stats_mut().ignored_rows += 1;
        Ok(())
    } else {
        Err(ReplicationError::IgnoreBatch)
    }
}

async fn fallback(
    writer: &mut BatchWriter<'_>,
    row: &ChangeRow,
    conflict: &ConflictSettings,
    info: &ConflictInfo,
) -> Result<()> {
    match row.event_type {
        EventType::Insert => {
            if writer.update(row, conflict.resolve_changes_only, false).await? == LoadStatus::Conflict {
                return Err(unresolved(row));
            }
            writer.stats_mut().fallback_updates += 1;
        }
        EventType::Update => {
            let mut status = LoadStatus::Conflict;
            // A pk-keyed update already missed; go straight to insert.
            if conflict.detect != DetectConflict::PrimaryKey {
                status = writer.update(row, conflict.resolve_changes_only, false).await?;
            }
            if status == LoadStatus::Success {
                writer.stats_mut().fallback_updates += 1;
            } else {
                if writer.insert(row, false).await? == LoadStatus::Conflict {
                    return Err(unresolved(row));
                }
                writer.stats_mut().fallback_inserts += 1;
            }
        }
        EventType::Delete => {
            if info.error_kind == Some(PlatformErrorKind::ForeignKeyViolation) {
                return Err(unresolved(row));
            }
            let mut status = LoadStatus::Conflict;
            if conflict.detect != DetectConflict::PrimaryKey {
                status = writer.delete(row, false).await?;
            }
            if status == LoadStatus::Conflict {
                let blocked = writer
                    .last_conflict()
                    .and_then(|c| c.error_kind)
                    .is_some_and(|k| k == PlatformErrorKind::ForeignKeyViolation);
                if blocked {
                    return Err(unresolved(row));
                }
                writer.stats_mut().missing_deletes += 1;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Whether the incoming row's version beats the target's. The incoming row
/// wins when the target row or its version is missing.
async fn is_newer(writer: &mut BatchWriter<'_>, row: &ChangeRow, conflict: &ConflictSettings) -> Result<bool> {
    let column = conflict.detect_expression.as_deref().ok_or_else(|| {
        ReplicationError::Config(format!(
            "Conflict {} resolves newer_wins without a detect_expression column",
            conflict.conflict_id
        ))
    })?;

    let current = writer.current_row(row).await?;
    let existing = current.as_ref().and_then(|values| {
        values
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .and_then(|(_, value)| value.clone())
    });
    let Some(existing) = existing else {
        return Ok(true);
    };

    let source = if row.event_type == EventType::Delete {
        row.parsed_old_data()?
    } else {
        row.parsed_row_data()?
    };
    let incoming = source.and_then(|values| {
        row.snapshot
            .column_index(column)
            .and_then(|i| values.get(i).cloned().flatten())
    });
    let Some(incoming) = incoming else {
        return Ok(false);
    };

    Ok(compare_versions(conflict.detect, &incoming, &existing) == Ordering::Greater)
}

pub fn compare_versions(detect: DetectConflict, incoming: &str, existing: &str) -> Ordering {
    if detect == DetectConflict::TimestampColumn {
        if let (Some(a), Some(b)) = (parse_timestamp(incoming), parse_timestamp(existing)) {
            return a.cmp(&b);
        }
    } else {
        if let (Ok(a), Ok(b)) = (incoming.trim().parse::<i64>(), existing.trim().parse::<i64>()) {
            return a.cmp(&b);
        }
        if let (Ok(a), Ok(b)) = (incoming.trim().parse::<f64>(), existing.trim().parse::<f64>()) {
            return a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        }
    }
    incoming.cmp(existing)
}

fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.naive_utc());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, format) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}
