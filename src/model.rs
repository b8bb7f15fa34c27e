// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Core data model: captured rows, gaps, outgoing batches and topology rows.

use crate::error::Result;
use crate::payload;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Id of a captured row. Monotonic as captured, possibly sparse.
pub type DataId = i64;

/// Pseudo node that receives rows no router matched. Recording them against
/// this node marks them as routed so they are never rescanned.
pub const UNROUTED_NODE_ID: &str = "-1";

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Event types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Insert,
    Update,
    Delete,
    /// Raw SQL to run on the target.
    Sql,
    /// Table definition to create or alter on the target.
    Create,
    /// Script handed to a registered script runner.
    Script,
    /// Request to reload a table.
    Reload,
}

impl EventType {
    /// Single-letter code stored in the staging table.
    pub fn code(&self) -> &'static str {
        match self {
            EventType::Insert => "I",
            EventType::Update => "U",
            EventType::Delete => "D",
            EventType::Sql => "S",
            EventType::Create => "C",
            EventType::Script => "B",
            EventType::Reload => "R",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "I" => Some(EventType::Insert),
            "U" => Some(EventType::Update),
            "D" => Some(EventType::Delete),
            "S" => Some(EventType::Sql),
            "C" => Some(EventType::Create),
            "B" => Some(EventType::Script),
            "R" => Some(EventType::Reload),
            _ => None,
        }
    }

    /// Insert, update or delete.
    pub fn is_dml(&self) -> bool {
        matches!(self, EventType::Insert | EventType::Update | EventType::Delete)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventType::Insert => "INSERT",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
            EventType::Sql => "SQL",
            EventType::Create => "CREATE",
            EventType::Script => "SCRIPT",
            EventType::Reload => "RELOAD",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// Schema snapshot
// =============================================================================

/// Column layout of a captured table as of capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub snapshot_id: i64,
    pub trigger_id: String,
    pub table_name: String,
    pub column_names: Vec<String>,
    pub pk_column_names: Vec<String>,
}

impl SchemaSnapshot {
    pub fn new(
        snapshot_id: i64,
        trigger_id: &str,
        table_name: &str,
        column_names: &[&str],
        pk_column_names: &[&str],
    ) -> Self {
        Self {
            snapshot_id,
            trigger_id: trigger_id.to_string(),
            table_name: table_name.to_string(),
            column_names: column_names.iter().map(|c| c.to_string()).collect(),
            pk_column_names: pk_column_names.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// SHA-256 over table and column layout, hex encoded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.table_name.to_ascii_lowercase().as_bytes());
        hasher.update([0u8]);
        for column in &self.column_names {
            hasher.update(column.to_ascii_lowercase().as_bytes());
            hasher.update([b',']);
        }
        hasher.update([0u8]);
        for column in &self.pk_column_names {
            hasher.update(column.to_ascii_lowercase().as_bytes());
            hasher.update([b',']);
        }
        hex::encode(hasher.finalize())
    }

    /// Case-insensitive column position.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn is_pk(&self, name: &str) -> bool {
        self.pk_column_names.iter().any(|c| c.eq_ignore_ascii_case(name))
    }
}

// =============================================================================
// Change rows
// =============================================================================

/// One captured mutation awaiting routing.
#[derive(Debug, Clone)]
pub struct ChangeRow {
    pub data_id: DataId,
    pub table_name: String,
    pub event_type: EventType,
    /// New values, CSV encoded in `snapshot.column_names` order.
    pub row_data: Option<String>,
    /// Old values, CSV encoded. Only present when old data capture is on.
    pub old_data: Option<String>,
    /// Primary key values, CSV encoded in `snapshot.pk_column_names` order.
    pub pk_data: Option<String>,
    pub channel_id: String,
    pub transaction_id: Option<String>,
    /// Node the change was captured from, if it arrived by replication.
    pub source_node_id: Option<String>,
    pub external_data: Option<String>,
    pub create_time: i64,
    pub snapshot: Arc<SchemaSnapshot>,
}

impl ChangeRow {
    pub fn new(data_id: DataId, event_type: EventType, channel_id: &str, snapshot: Arc<SchemaSnapshot>) -> Self {
        Self {
            data_id,
            table_name: snapshot.table_name.clone(),
            event_type,
            row_data: None,
            old_data: None,
            pk_data: None,
            channel_id: channel_id.to_string(),
            transaction_id: None,
            source_node_id: None,
            external_data: None,
            create_time: now_millis(),
            snapshot,
        }
    }

    pub fn with_row_data(mut self, values: &[Option<&str>]) -> Self {
        self.row_data = Some(payload::encode_row(values));
        self
    }

    pub fn with_old_data(mut self, values: &[Option<&str>]) -> Self {
        self.old_data = Some(payload::encode_row(values));
        self
    }

    pub fn with_pk_data(mut self, values: &[Option<&str>]) -> Self {
        self.pk_data = Some(payload::encode_row(values));
        self
    }

    pub fn with_transaction(mut self, transaction_id: &str) -> Self {
        self.transaction_id = Some(transaction_id.to_string());
        self
    }

    pub fn with_source_node(mut self, node_id: &str) -> Self {
        self.source_node_id = Some(node_id.to_string());
        self
    }

    pub fn parsed_row_data(&self) -> Result<Option<Vec<Option<String>>>> {
        self.row_data.as_deref().map(payload::decode_row).transpose()
    }

    pub fn parsed_old_data(&self) -> Result<Option<Vec<Option<String>>>> {
        self.old_data.as_deref().map(payload::decode_row).transpose()
    }

    /// Primary key values. Falls back to picking the pk columns out of old,
    /// then new, row data when no pk payload was captured.
    pub fn parsed_pk_data(&self) -> Result<Option<Vec<Option<String>>>> {
        if let Some(pk) = self.pk_data.as_deref() {
            return payload::decode_row(pk).map(Some);
        }
        let source = match self.parsed_old_data()? {
            Some(old) => Some(old),
            None => self.parsed_row_data()?,
        };
        Ok(source.map(|values| {
            self.snapshot
                .pk_column_names
                .iter()
                .map(|pk| {
                    self.snapshot
                        .column_index(pk)
                        .and_then(|i| values.get(i).cloned().flatten())
                })
                .collect()
        }))
    }

    /// Payload size used for byte thresholds.
    pub fn payload_len(&self) -> u64 {
        [&self.row_data, &self.old_data, &self.pk_data]
            .iter()
            .map(|p| p.as_ref().map(|s| s.len() as u64).unwrap_or(0))
            .sum()
    }
}

// =============================================================================
// Gaps
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GapStatus {
    Open,
    Closed,
    Skipped,
}

impl GapStatus {
    pub fn code(&self) -> &'static str {
        match self {
            GapStatus::Open => "GP",
            GapStatus::Closed => "OK",
            GapStatus::Skipped => "SK",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "GP" => Some(GapStatus::Open),
            "OK" => Some(GapStatus::Closed),
            "SK" => Some(GapStatus::Skipped),
            _ => None,
        }
    }
}

/// An inclusive id interval not yet confirmed fully routed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub start_id: DataId,
    pub end_id: DataId,
    pub status: GapStatus,
    /// Host that last wrote the row. Lets an operator see which node left
    /// a gap behind after a crash.
    pub last_update_host: String,
    pub create_time: i64,
}

impl Gap {
    pub fn new(start_id: DataId, end_id: DataId) -> Self {
        Self {
            start_id,
            end_id,
            status: GapStatus::Open,
            last_update_host: String::new(),
            create_time: now_millis(),
        }
    }

    pub fn with_status(mut self, status: GapStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_create_time(mut self, create_time: i64) -> Self {
        self.create_time = create_time;
        self
    }

    pub fn contains(&self, data_id: DataId) -> bool {
        data_id >= self.start_id && data_id <= self.end_id
    }

    /// `end - start`. A single-id gap has size 0.
    pub fn size(&self) -> i64 {
        self.end_id - self.start_id
    }

    pub fn overlaps(&self, other: &Gap) -> bool {
        self.start_id <= other.end_id && other.start_id <= self.end_id
    }

    /// True when `other` lies entirely inside `self`.
    pub fn contains_gap(&self, other: &Gap) -> bool {
        other.start_id >= self.start_id && other.end_id <= self.end_id
    }

    pub fn same_range(&self, other: &Gap) -> bool {
        self.start_id == other.start_id && self.end_id == other.end_id
    }
}

// =============================================================================
// Batches
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    New,
    Sent,
    Error,
    Ok,
}

impl BatchStatus {
    pub fn code(&self) -> &'static str {
        match self {
            BatchStatus::New => "NE",
            BatchStatus::Sent => "SE",
            BatchStatus::Error => "ER",
            BatchStatus::Ok => "OK",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "NE" => Some(BatchStatus::New),
            "SE" => Some(BatchStatus::Sent),
            "ER" => Some(BatchStatus::Error),
            "OK" => Some(BatchStatus::Ok),
            _ => None,
        }
    }
}

/// The unit of delivery to one node on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingBatch {
    pub batch_id: i64,
    pub node_id: String,
    pub channel_id: String,
    pub status: BatchStatus,
    pub insert_count: u64,
    pub update_count: u64,
    pub delete_count: u64,
    pub other_count: u64,
    pub data_event_count: u64,
    pub byte_count: u64,
    /// Transaction of the most recently added row.
    pub last_transaction_id: Option<String>,
    pub created_at: i64,
}

impl OutgoingBatch {
    pub fn new(batch_id: i64, node_id: &str, channel_id: &str) -> Self {
        Self {
            batch_id,
            node_id: node_id.to_string(),
            channel_id: channel_id.to_string(),
            status: BatchStatus::New,
            insert_count: 0,
            update_count: 0,
            delete_count: 0,
            other_count: 0,
            data_event_count: 0,
            byte_count: 0,
            last_transaction_id: None,
            created_at: now_millis(),
        }
    }

    pub fn is_unrouted(&self) -> bool {
        self.node_id == UNROUTED_NODE_ID
    }

    /// Count a row into the batch.
    pub fn record(&mut self, row: &ChangeRow) {
        match row.event_type {
            EventType::Insert => self.insert_count += 1,
            EventType::Update => self.update_count += 1,
            EventType::Delete => self.delete_count += 1,
            _ => self.other_count += 1,
        }
        self.data_event_count += 1;
        self.byte_count += row.payload_len();
        self.last_transaction_id = row.transaction_id.clone();
    }
}

/// Join row between a captured row and the batch it was routed into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEvent {
    pub data_id: DataId,
    pub batch_id: i64,
    pub router_id: String,
}

// =============================================================================
// Topology
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub node_group_id: String,
    pub external_id: String,
    pub created_at_node_id: Option<String>,
    pub sync_enabled: bool,
}

impl Node {
    pub fn new(node_id: &str, node_group_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_group_id: node_group_id.to_string(),
            external_id: node_id.to_string(),
            created_at_node_id: None,
            sync_enabled: true,
        }
    }

    pub fn created_at(mut self, node_id: &str) -> Self {
        self.created_at_node_id = Some(node_id.to_string());
        self
    }
}

impl From<&crate::config::NodeConfig> for Node {
    fn from(config: &crate::config::NodeConfig) -> Self {
        Self {
            node_id: config.node_id.clone(),
            node_group_id: config.node_group_id.clone(),
            external_id: if config.external_id.is_empty() {
                config.node_id.clone()
            } else {
                config.external_id.clone()
            },
            created_at_node_id: config.created_at_node_id.clone(),
            sync_enabled: config.sync_enabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupLink {
    pub source_group_id: String,
    pub target_group_id: String,
    pub sync_config_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> Arc<SchemaSnapshot> {
        Arc::new(SchemaSnapshot::new(1, "item", "item", &["ID", "NAME", "PRICE"], &["ID"]))
    }

    #[test]
    fn test_event_type_codes() {
        for event in [
            EventType::Insert,
            EventType::Update,
            EventType::Delete,
            EventType::Sql,
            EventType::Create,
            EventType::Script,
            EventType::Reload,
        ] {
            assert_eq!(EventType::from_code(event.code()), Some(event));
        }
        assert_eq!(EventType::from_code("X"), None);
        assert_eq!(EventType::Script.to_string(), "SCRIPT");
    }

    #[test]
    fn test_fingerprint_changes_with_layout() {
        let a = SchemaSnapshot::new(1, "item", "item", &["ID", "NAME"], &["ID"]);
        let b = SchemaSnapshot::new(2, "item", "item", &["ID", "NAME", "PRICE"], &["ID"]);
        let c = SchemaSnapshot::new(3, "item", "ITEM", &["id", "name"], &["id"]);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_pk_data_falls_back_to_old_then_new() {
        let row = ChangeRow::new(1, EventType::Update, "default", snapshot())
            .with_row_data(&[Some("7"), Some("new"), Some("1.00")]);
        assert_eq!(row.parsed_pk_data().unwrap(), Some(vec![Some("7".to_string())]));

        let row = row.with_old_data(&[Some("6"), Some("old"), None]);
        assert_eq!(row.parsed_pk_data().unwrap(), Some(vec![Some("6".to_string())]));

        let row = row.with_pk_data(&[Some("5")]);
        assert_eq!(row.parsed_pk_data().unwrap(), Some(vec![Some("5".to_string())]));
    }

    #[test]
    fn test_gap_geometry() {
        let outer = Gap::new(10, 100);
        let inner = Gap::new(20, 30);
        let disjoint = Gap::new(101, 200);
        assert!(outer.contains_gap(&inner));
        assert!(!inner.contains_gap(&outer));
        assert!(outer.overlaps(&inner));
        assert!(!outer.overlaps(&disjoint));
        assert_eq!(Gap::new(1, 1).size(), 0);
        assert!(outer.contains(100));
        assert!(!outer.contains(101));
    }

    #[test]
    fn test_outgoing_batch_record_counts() {
        let mut batch = OutgoingBatch::new(1, "001", "default");
        let row = ChangeRow::new(1, EventType::Insert, "default", snapshot())
            .with_row_data(&[Some("1"), Some("a"), None])
            .with_transaction("tx-1");
        batch.record(&row);
        batch.record(&ChangeRow::new(2, EventType::Sql, "default", snapshot()));

        assert_eq!(batch.insert_count, 1);
        assert_eq!(batch.other_count, 1);
        assert_eq!(batch.data_event_count, 2);
        assert!(batch.byte_count > 0);
        assert_eq!(batch.last_transaction_id, None);
        assert!(!batch.is_unrouted());
        assert!(OutgoingBatch::new(2, UNROUTED_NODE_ID, "default").is_unrouted());
    }
}
