// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Router strategies.
//!
//! Each configured router resolves to one [`RouterStrategy`] variant. All
//! variants take the same inputs: the row, the candidate nodes of the
//! router's target group, and whether this is an initial load. They return
//! the node ids to route to.
//!
//! # Column Map
//!
//! Strategies that look at row values share [`column_values()`]:
//!
//! | Event | `COL` | `OLD_COL` |
//! |-------|-------|-----------|
//! | INSERT/UPDATE | new value | old value (if captured) |
//! | DELETE | old value | old value |
//!
//! When neither payload yields a value, primary key values are used.
//! Keys are upper case.
//!
//! # Column-Match Expressions
//!
//! ```text
//! STORE_ID=:EXTERNAL_ID or REGION!=NULL
//! TAGS contains 'west'
//! STATUS=OPEN
//! OWNER=:OLD_OWNER
//! ```
//!
//! Clauses are joined by ` or ` or newlines; any matching clause routes.
//! `:NODE_ID`, `:EXTERNAL_ID` and `:NODE_GROUP_ID` compare against each
//! candidate and route to the candidates that match. Any other value routes
//! to every candidate when it matches.

use super::context::RouterContext;
use super::metadata::MetadataRouter;
use crate::config::{RouterConfig, RouterType};
use crate::error::{ReplicationError, Result};
use crate::model::{ChangeRow, EventType, Node, OutgoingBatch};
use crate::store::RoutingLookups;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::warn;

/// Upper-cased column name → value. `None` is SQL NULL.
pub type ColumnMap = HashMap<String, Option<String>>;

/// Node ids chosen by a router.
pub type NodeIds = BTreeSet<String>;

/// Build the column map of a row.
pub fn column_values(row: &ChangeRow) -> Result<ColumnMap> {
    let mut map = ColumnMap::new();
    let columns = &row.snapshot.column_names;
    let new = row.parsed_row_data()?;
    let old = row.parsed_old_data()?;

    let current = if row.event_type == EventType::Delete {
        old.as_ref()
    } else {
        new.as_ref()
    };
    if let Some(values) = current {
        for (name, value) in columns.iter().zip(values) {
            map.insert(name.to_ascii_uppercase(), value.clone());
        }
    }
    if let Some(values) = old.as_ref() {
        for (name, value) in columns.iter().zip(values) {
            map.insert(format!("OLD_{}", name.to_ascii_uppercase()), value.clone());
        }
    }

    if map.is_empty() {
        if let Some(values) = row.parsed_pk_data()? {
            for (name, value) in row.snapshot.pk_column_names.iter().zip(values) {
                map.insert(name.to_ascii_uppercase(), value);
            }
        }
    }
    Ok(map)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Column-match expressions
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Equals,
    NotEquals,
    /// The column holds a comma separated list containing the value.
    Contains,
    NotContains,
}

/// Right-hand side of a clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchValue {
    NodeId,
    ExternalId,
    NodeGroupId,
    ExternalData,
    Null,
    /// `:OTHER_COLUMN`
    Column(String),
    Literal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnExpression {
    pub column: String,
    pub op: MatchOp,
    pub value: MatchValue,
}

// Longest operators first so `!=` is not read as `=`.
const OPERATORS: [(&str, MatchOp); 4] = [
    ("!=", MatchOp::NotEquals),
    ("=", MatchOp::Equals),
    (" not contains ", MatchOp::NotContains),
    (" contains ", MatchOp::Contains),
];

/// Parse a column-match expression into clauses.
///
/// A blank expression parses to no clauses (routes nowhere).
pub fn parse_column_expressions(expression: &str) -> Result<Vec<ColumnExpression>> {
    let mut clauses = Vec::new();
    for line in expression.lines() {
        for clause in split_or(line) {
            let clause = clause.trim();
            if clause.is_empty() || clause.eq_ignore_ascii_case("or") {
                continue;
            }
            clauses.push(parse_clause(clause).ok_or_else(|| {
                ReplicationError::Config(format!(
                    "invalid column match clause '{}' in expression '{}'",
                    clause, expression
                ))
            })?);
        }
    }
    if clauses.is_empty() {
        warn!("Column match expression is empty");
    }
    Ok(clauses)
}

/// Split on a standalone `or` / `OR` word.
fn split_or(line: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = line;
    loop {
        let next = [" or ", " OR "].iter().filter_map(|sep| rest.find(sep)).min();
        match next {
            Some(pos) => {
                parts.push(&rest[..pos]);
                rest = &rest[pos + 4..];
            }
            None => {
                parts.push(rest);
                return parts;
            }
        }
    }
}

fn parse_clause(clause: &str) -> Option<ColumnExpression> {
    for (token, op) in OPERATORS {
        let Some(pos) = clause.find(token) else {
            continue;
        };
        let column = clause[..pos].trim();
        let value = clause[pos + token.len()..].trim();
        if column.is_empty() || value.is_empty() || value.contains(token.trim()) {
            return None;
        }
        return Some(ColumnExpression {
            column: column.to_ascii_uppercase(),
            op,
            value: parse_value(value),
        });
    }
    None
}

fn parse_value(value: &str) -> MatchValue {
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        return MatchValue::Literal(value[1..value.len() - 1].replace("''", "'"));
    }
    if value.eq_ignore_ascii_case(":NODE_ID") {
        MatchValue::NodeId
    } else if value.eq_ignore_ascii_case(":EXTERNAL_ID") {
        MatchValue::ExternalId
    } else if value.eq_ignore_ascii_case(":NODE_GROUP_ID") {
        MatchValue::NodeGroupId
    } else if value.eq_ignore_ascii_case(":EXTERNAL_DATA") {
        MatchValue::ExternalData
    } else if value == "NULL" {
        MatchValue::Null
    } else if let Some(column) = value.strip_prefix(':') {
        MatchValue::Column(column.to_ascii_uppercase())
    } else {
        MatchValue::Literal(value.to_string())
    }
}

fn compare(op: MatchOp, column_value: Option<&str>, compare_value: Option<&str>) -> bool {
    match op {
        MatchOp::Equals => column_value == compare_value,
        MatchOp::NotEquals => column_value != compare_value,
        MatchOp::Contains => match (column_value, compare_value) {
            (Some(c), Some(v)) => c.split(',').any(|item| item == v),
            _ => false,
        },
        MatchOp::NotContains => match (column_value, compare_value) {
            (Some(c), Some(v)) => !c.split(',').any(|item| item == v),
            _ => false,
        },
    }
}

/// Evaluate clauses against a row's column map.
pub fn match_columns(
    expressions: &[ColumnExpression],
    columns: &ColumnMap,
    external_data: Option<&str>,
    candidates: &[Node],
) -> NodeIds {
    let mut nodes = NodeIds::new();
    for e in expressions {
        let column_value = columns.get(&e.column).and_then(|v| v.as_deref());
        let per_node: Option<fn(&Node) -> &str> = match e.value {
            MatchValue::NodeId => Some(|n| n.node_id.as_str()),
            MatchValue::ExternalId => Some(|n| n.external_id.as_str()),
            MatchValue::NodeGroupId => Some(|n| n.node_group_id.as_str()),
            _ => None,
        };
        if let Some(attribute) = per_node {
            for node in candidates {
                if compare(e.op, column_value, Some(attribute(node))) {
                    nodes.insert(node.node_id.clone());
                }
            }
            continue;
        }

        let compare_value = match &e.value {
            MatchValue::ExternalData => external_data,
            MatchValue::Null => None,
            MatchValue::Column(other) => columns.get(other).and_then(|v| v.as_deref()),
            MatchValue::Literal(v) => Some(v.as_str()),
            MatchValue::NodeId | MatchValue::ExternalId | MatchValue::NodeGroupId => None,
        };
        if compare(e.op, column_value, compare_value) {
            nodes.extend(candidates.iter().map(|n| n.node_id.clone()));
        }
    }
    nodes
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scripted routers
// ═══════════════════════════════════════════════════════════════════════════════

/// User supplied routing logic, registered by name.
pub trait RouteScript: Send + Sync + 'static {
    fn route(
        &self,
        row: &ChangeRow,
        columns: &ColumnMap,
        candidates: &[Node],
        initial_load: bool,
    ) -> Result<Option<NodeIds>>;

    /// Called for each batch this script routed into, before it is persisted.
    fn complete_batch(&self, _batch: &OutgoingBatch) {}
}

/// Scripts by name.
pub type ScriptRegistry = HashMap<String, Arc<dyn RouteScript>>;

// ═══════════════════════════════════════════════════════════════════════════════
// RouterStrategy
// ═══════════════════════════════════════════════════════════════════════════════

/// A configured router, ready to route rows.
#[derive(Clone)]
pub enum RouterStrategy {
    /// Every candidate.
    Default,
    Column {
        expressions: Arc<Vec<ColumnExpression>>,
    },
    Subselect {
        sql: String,
        lookups: Arc<dyn RoutingLookups>,
    },
    LookupTable {
        lookup_table: String,
        key_column: String,
        lookup_key_column: String,
        external_id_column: String,
        lookups: Arc<dyn RoutingLookups>,
    },
    Scripted {
        name: String,
        script: Arc<dyn RouteScript>,
    },
    Metadata(Arc<MetadataRouter>),
}

impl std::fmt::Debug for RouterStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RouterStrategy::{}", self.type_name())
    }
}

impl RouterStrategy {
    /// Build the strategy for a router.
    pub fn from_config(
        router: &RouterConfig,
        lookups: Arc<dyn RoutingLookups>,
        scripts: &ScriptRegistry,
        metadata: &Arc<MetadataRouter>,
    ) -> Result<Self> {
        Ok(match &router.router {
            RouterType::Default => RouterStrategy::Default,
            RouterType::Column { expression } => RouterStrategy::Column {
                expressions: Arc::new(
                    parse_column_expressions(expression)
                        .map_err(|e| ReplicationError::routing(&router.router_id, e.to_string()))?,
                ),
            },
            RouterType::Subselect { expression } => RouterStrategy::Subselect {
                sql: expression.clone(),
                lookups,
            },
            RouterType::LookupTable {
                lookup_table,
                key_column,
                lookup_key_column,
                external_id_column,
            } => RouterStrategy::LookupTable {
                lookup_table: lookup_table.clone(),
                key_column: key_column.to_ascii_uppercase(),
                lookup_key_column: lookup_key_column.clone(),
                external_id_column: external_id_column.clone(),
                lookups,
            },
            RouterType::Scripted { script } => RouterStrategy::Scripted {
                name: script.clone(),
                script: scripts.get(script).cloned().ok_or_else(|| {
                    ReplicationError::routing(&router.router_id, format!("no route script named {}", script))
                })?,
            },
            RouterType::Metadata => RouterStrategy::Metadata(Arc::clone(metadata)),
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RouterStrategy::Default => "default",
            RouterStrategy::Column { .. } => "column",
            RouterStrategy::Subselect { .. } => "subselect",
            RouterStrategy::LookupTable { .. } => "lookup_table",
            RouterStrategy::Scripted { .. } => "scripted",
            RouterStrategy::Metadata(_) => "metadata",
        }
    }

    /// Node ids `row` should go to. `None` or an empty set means nowhere.
    pub async fn route(
        &self,
        ctx: &mut RouterContext,
        row: &ChangeRow,
        candidates: &[Node],
        initial_load: bool,
    ) -> Result<Option<NodeIds>> {
        match self {
            RouterStrategy::Default => Ok(Some(candidates.iter().map(|n| n.node_id.clone()).collect())),

            RouterStrategy::Column { expressions } => {
                let columns = column_values(row)?;
                if columns.is_empty() {
                    warn!(data_id = row.data_id, "No columns to match");
                    return Ok(None);
                }
                Ok(Some(match_columns(
                    expressions,
                    &columns,
                    row.external_data.as_deref(),
                    candidates,
                )))
            }

            RouterStrategy::Subselect { sql, lookups } => {
                let columns = column_values(row)?;
                let mut params: Vec<(String, Option<String>)> = columns.into_iter().collect();
                params.push(("EXTERNAL_DATA".to_string(), row.external_data.clone()));
                params.push(("SOURCE_NODE_ID".to_string(), row.source_node_id.clone()));
                if let Some(group) = candidates.first().map(|n| n.node_group_id.clone()) {
                    params.push(("NODE_GROUP_ID".to_string(), Some(group)));
                }
                let ids: BTreeSet<String> = lookups.subselect(sql, &params).await?.into_iter().collect();
                Ok(Some(
                    candidates
                        .iter()
                        .filter(|n| ids.contains(&n.node_id))
                        .map(|n| n.node_id.clone())
                        .collect(),
                ))
            }

            RouterStrategy::LookupTable {
                lookup_table,
                key_column,
                lookup_key_column,
                external_id_column,
                lookups,
            } => {
                let columns = column_values(row)?;
                let Some(Some(key)) = columns.get(key_column) else {
                    return Ok(None);
                };
                let external_ids: BTreeSet<String> = lookups
                    .lookup_external_ids(lookup_table, lookup_key_column, external_id_column, key)
                    .await?
                    .into_iter()
                    .collect();
                Ok(Some(
                    candidates
                        .iter()
                        .filter(|n| external_ids.contains(&n.external_id))
                        .map(|n| n.node_id.clone())
                        .collect(),
                ))
            }

            RouterStrategy::Scripted { script, .. } => {
                let columns = column_values(row)?;
                script.route(row, &columns, candidates, initial_load)
            }

            RouterStrategy::Metadata(router) => router.route(ctx, row, candidates, initial_load),
        }
    }

    /// Hook run for each open batch this strategy routed into, before the
    /// batch is persisted.
    pub fn complete_batch(&self, _ctx: &RouterContext, batch: &OutgoingBatch) {
        if let RouterStrategy::Scripted { script, .. } = self {
            script.complete_batch(batch);
        }
    }

    /// Hook run once per pass after its batches are persisted.
    pub async fn context_committed(&self, ctx: &mut RouterContext) {
        if let RouterStrategy::Metadata(router) = self {
            router.context_committed(ctx).await;
        }
    }
}
