// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! DML statement building and reuse.

use super::platform::quote_identifier;
use crate::model::EventType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmlType {
    Insert,
    Update,
    Delete,
    Select,
}

impl DmlType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DmlType::Insert => "INSERT",
            DmlType::Update => "UPDATE",
            DmlType::Delete => "DELETE",
            DmlType::Select => "SELECT",
        }
    }
}

/// A built statement. Null keys render as `IS NULL` and take no bind slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmlStatement {
    pub dml: DmlType,
    pub table: String,
    pub columns: Vec<String>,
    pub keys: Vec<String>,
    pub null_keys: Vec<bool>,
    pub sql: String,
}

impl DmlStatement {
    pub fn insert(table: &str, columns: &[String]) -> Self {
        let names: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
        let marks = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_identifier(table),
            names.join(", "),
            marks
        );
        Self::build(DmlType::Insert, table, columns, &[], &[], sql)
    }

    pub fn update(table: &str, columns: &[String], keys: &[String], null_keys: &[bool]) -> Self {
        let sets: Vec<String> = columns.iter().map(|c| format!("{} = ?", quote_identifier(c))).collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            quote_identifier(table),
            sets.join(", "),
            where_clause(keys, null_keys)
        );
        Self::build(DmlType::Update, table, columns, keys, null_keys, sql)
    }

    pub fn delete(table: &str, keys: &[String], null_keys: &[bool]) -> Self {
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            quote_identifier(table),
            where_clause(keys, null_keys)
        );
        Self::build(DmlType::Delete, table, &[], keys, null_keys, sql)
    }

    /// Select `columns` as text, for capturing the current target row.
    pub fn select(table: &str, columns: &[String], keys: &[String], null_keys: &[bool]) -> Self {
        let casts: Vec<String> = columns
            .iter()
            .map(|c| format!("CAST({} AS TEXT)", quote_identifier(c)))
            .collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            casts.join(", "),
            quote_identifier(table),
            where_clause(keys, null_keys)
        );
        Self::build(DmlType::Select, table, columns, keys, null_keys, sql)
    }

    fn build(
        dml: DmlType,
        table: &str,
        columns: &[String],
        keys: &[String],
        null_keys: &[bool],
        sql: String,
    ) -> Self {
        Self {
            dml,
            table: table.to_string(),
            columns: columns.to_vec(),
            keys: keys.to_vec(),
            null_keys: null_keys.to_vec(),
            sql,
        }
    }

    /// Column values (for INSERT/UPDATE) followed by the non-null key values.
    pub fn bind_values(&self, column_values: &[Option<String>], key_values: &[Option<String>]) -> Vec<Option<String>> {
        let mut values = Vec::with_capacity(column_values.len() + key_values.len());
        if matches!(self.dml, DmlType::Insert | DmlType::Update) {
            values.extend_from_slice(column_values);
        }
        values.extend(
            key_values
                .iter()
                .zip(self.null_keys.iter())
                .filter(|(_, is_null)| !**is_null)
                .map(|(value, _)| value.clone()),
        );
        values
    }
}

fn where_clause(keys: &[String], null_keys: &[bool]) -> String {
    keys.iter()
        .enumerate()
        .map(|(i, key)| {
            if null_keys.get(i).copied().unwrap_or(false) {
                format!("{} IS NULL", quote_identifier(key))
            } else {
                format!("{} = ?", quote_identifier(key))
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Everything that shapes a statement's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementKey {
    pub dml: DmlType,
    pub event: EventType,
    pub table: String,
    /// Inserted or changed columns.
    pub columns: Vec<String>,
    pub keys: Vec<String>,
    pub conflict_detection: bool,
    pub apply_changes_only: bool,
    pub null_keys: Vec<bool>,
}

/// Whether the next row needs a freshly built statement.
pub fn requires_new_statement(previous: Option<&StatementKey>, next: &StatementKey) -> bool {
    let Some(previous) = previous else {
        return true;
    };
    previous.dml != next.dml
        || previous.event != next.event
        || previous.table != next.table
        || previous.apply_changes_only != next.apply_changes_only
        || previous.conflict_detection != next.conflict_detection
        || previous.columns != next.columns
        || previous.keys != next.keys
        || previous.null_keys != next.null_keys
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn update_key(null_keys: Vec<bool>) -> StatementKey {
        StatementKey {
            dml: DmlType::Update,
            event: EventType::Update,
            table: "item".into(),
            columns: names(&["name"]),
            keys: names(&["id", "code"]),
            conflict_detection: true,
            apply_changes_only: true,
            null_keys,
        }
    }

    #[test]
    fn test_update_with_null_key() {
        let stmt = DmlStatement::update("item", &names(&["name"]), &names(&["id", "code"]), &[false, true]);
        assert_eq!(
            stmt.sql,
            "UPDATE \"item\" SET \"name\" = ? WHERE \"id\" = ? AND \"code\" IS NULL"
        );

        let values = stmt.bind_values(&[Some("pear".into())], &[Some("1".into()), None]);
        assert_eq!(values, vec![Some("pear".to_string()), Some("1".to_string())]);
    }

    #[test]
    fn test_insert_and_delete_sql() {
        let insert = DmlStatement::insert("item", &names(&["id", "name"]));
        assert_eq!(insert.sql, "INSERT INTO \"item\" (\"id\", \"name\") VALUES (?, ?)");

        let delete = DmlStatement::delete("item", &names(&["id"]), &[false]);
        assert_eq!(delete.sql, "DELETE FROM \"item\" WHERE \"id\" = ?");
        assert_eq!(delete.bind_values(&[Some("x".into())], &[Some("7".into())]), vec![Some("7".to_string())]);
    }

    #[test]
    fn test_reuse_decision() {
        let first = update_key(vec![false, false]);
        assert!(requires_new_statement(None, &first));
        assert!(!requires_new_statement(Some(&first), &first.clone()));

        // Null transition in a lookup key
        assert!(requires_new_statement(Some(&first), &update_key(vec![false, true])));

        let mut other_columns = first.clone();
        other_columns.columns.push("price".into());
        assert!(requires_new_statement(Some(&first), &other_columns));

        let mut no_detection = first.clone();
        no_detection.conflict_detection = false;
        assert!(requires_new_statement(Some(&first), &no_detection));

        let mut insert = first.clone();
        insert.dml = DmlType::Insert;
        insert.event = EventType::Insert;
        assert!(requires_new_statement(Some(&first), &insert));
    }
}
