// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests: SQLite staging store through routing to a SQLite target.
//!
//! Each test gets its own temp directory, so no external services are needed.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//! - `route_*` - capture → route → gap reconcile on a real staging database
//! - `apply_*` - routed batches applied by the conflict-aware writer
//! - `restart_*` - state that must survive reopening the staging database

mod common;

use common::{init_tracing, item_delete, item_insert, item_snapshot, item_update, store_config};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::watch;
use trigger_replication::config::RouterType;
use trigger_replication::model::{ChangeRow, DataId, GapStatus, OutgoingBatch};
use trigger_replication::store::{BatchStore, GapStore};
use trigger_replication::writer::{TableColumn, TableDefinition};
use trigger_replication::{
    ConflictAwareWriter, EngineConfig, RoutingEngine, SqlitePlatform, SqliteStore, TargetPlatform,
};

/// Staging database with the `item` snapshot registered.
struct Staging {
    dir: TempDir,
    store: Arc<SqliteStore>,
    /// Rows as staged, by assigned data id.
    rows: HashMap<DataId, ChangeRow>,
}

impl Staging {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(dir.path()).await);
        Self {
            dir,
            store,
            rows: HashMap::new(),
        }
    }

    async fn stage(&mut self, mut row: ChangeRow) -> DataId {
        let id = self.store.insert_change(&row).await.unwrap();
        row.data_id = id;
        self.rows.insert(id, row);
        id
    }

    fn engine(&self, config: EngineConfig) -> (RoutingEngine<SqliteStore>, watch::Sender<EngineConfig>) {
        let (tx, rx) = watch::channel(config.clone());
        (RoutingEngine::with_store(config, rx, Arc::clone(&self.store)), tx)
    }

    /// Batches for `node_id` with their rows, in batch order.
    async fn batches_for(&self, node_id: &str) -> Vec<(OutgoingBatch, Vec<ChangeRow>)> {
        let mut batches = self.store.batches_for_node(node_id).await.unwrap();
        batches.sort_by_key(|b| b.batch_id);
        let mut out = Vec::new();
        for batch in batches {
            let mut events = self.store.batch_events(batch.batch_id).await.unwrap();
            events.sort_by_key(|e| e.data_id);
            let rows = events
                .iter()
                .map(|e| self.rows.get(&e.data_id).cloned().expect("routed row was staged"))
                .collect();
            out.push((batch, rows));
        }
        out
    }
}

async fn open_store(dir: &Path) -> SqliteStore {
    let store = SqliteStore::new(dir.join("staging.db")).await.unwrap();
    store.register_snapshot(&item_snapshot()).await.unwrap();
    store
}

async fn target(dir: &Path) -> Arc<SqlitePlatform> {
    let platform = Arc::new(
        SqlitePlatform::open(&dir.join("target.db").to_string_lossy())
            .await
            .unwrap(),
    );
    let table = TableDefinition::new(
        "item",
        vec![
            TableColumn::new("id", "INTEGER").primary_key(),
            TableColumn::new("store_id", "TEXT"),
            TableColumn::new("name", "TEXT"),
        ],
    );
    platform.create_table(&table, true).await.unwrap();
    platform
}

async fn target_name(platform: &SqlitePlatform, id: i64) -> Option<String> {
    sqlx::query_scalar::<_, Option<String>>("SELECT name FROM item WHERE id = ?")
        .bind(id)
        .fetch_optional(platform.pool())
        .await
        .unwrap()
        .flatten()
}

async fn target_count(platform: &SqlitePlatform) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM item")
        .fetch_one(platform.pool())
        .await
        .unwrap()
}

// =============================================================================
// Routing on a real staging database
// =============================================================================

#[tokio::test]
async fn route_default_router_closes_gaps() {
    init_tracing();
    let mut staging = Staging::new().await;
    let snapshot = item_snapshot();
    for (item_id, name) in [(1, "apple"), (2, "pear"), (3, "plum")] {
        staging.stage(item_insert(&snapshot, 0, item_id, "s1", name)).await;
    }

    let (engine, _tx) = staging.engine(store_config(RouterType::Default));
    let report = engine.route_once().await.unwrap();
    assert!(report.is_success(), "{:?}", report.failed_channels());
    assert!(report.all_data_read);
    assert_eq!(report.rows_read(), 3);
    assert_eq!(report.data_events(), 6);

    for node in ["001", "002"] {
        let batches = staging.batches_for(node).await;
        let rows: usize = batches.iter().map(|(_, rows)| rows.len()).sum();
        assert_eq!(rows, 3, "node {}", node);
    }

    let gaps = staging.store.load_all_gaps().await.unwrap();
    assert!(gaps
        .iter()
        .any(|g| g.status == GapStatus::Closed && g.start_id == 1 && g.end_id == 3));
    assert!(gaps.iter().any(|g| g.status == GapStatus::Open && g.start_id == 4));

    let report = engine.route_once().await.unwrap();
    assert_eq!(report.rows_read(), 0);
}

#[tokio::test]
async fn route_column_router_selects_matching_store() {
    let mut staging = Staging::new().await;
    let snapshot = item_snapshot();
    staging.stage(item_insert(&snapshot, 0, 1, "s1", "apple")).await;
    staging.stage(item_insert(&snapshot, 0, 2, "s2", "pear")).await;
    staging.stage(item_insert(&snapshot, 0, 3, "nowhere", "plum")).await;

    let config = store_config(RouterType::Column {
        expression: "STORE_ID=:EXTERNAL_ID".into(),
    });
    let (engine, _tx) = staging.engine(config);
    let report = engine.route_once().await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.rows_read(), 3);
    assert_eq!(report.channels[0].unrouted, 1);

    let s1: Vec<String> = staging
        .batches_for("001")
        .await
        .into_iter()
        .flat_map(|(_, rows)| rows)
        .filter_map(|r| r.parsed_row_data().unwrap().and_then(|v| v[2].clone()))
        .collect();
    assert_eq!(s1, vec!["apple".to_string()]);

    // The unrouted row is still marked handled.
    assert_eq!(report.observed, 3);
}

#[tokio::test]
async fn route_picks_up_config_change_after_flush() {
    let mut staging = Staging::new().await;
    let snapshot = item_snapshot();
    staging.stage(item_insert(&snapshot, 0, 1, "s1", "apple")).await;

    let (engine, tx) = staging.engine(store_config(RouterType::Default));
    engine.route_once().await.unwrap();
    assert_eq!(staging.batches_for("002").await.len(), 1);

    let mut config = store_config(RouterType::Column {
        expression: "STORE_ID=:EXTERNAL_ID".into(),
    });
    tx.send(config).unwrap();
    engine.cache().flush().await;

    staging.stage(item_insert(&snapshot, 0, 2, "s1", "pear")).await;
    engine.route_once().await.unwrap();

    let s2_rows: usize = staging.batches_for("002").await.iter().map(|(_, r)| r.len()).sum();
    let s1_rows: usize = staging.batches_for("001").await.iter().map(|(_, r)| r.len()).sum();
    assert_eq!(s2_rows, 1);
    assert_eq!(s1_rows, 2);
}

// =============================================================================
// Applying routed batches
// =============================================================================

#[tokio::test]
async fn apply_routed_batches_to_target() {
    let mut staging = Staging::new().await;
    let snapshot = item_snapshot();
    staging.stage(item_insert(&snapshot, 0, 1, "s1", "apple")).await;
    staging.stage(item_insert(&snapshot, 0, 2, "s1", "pear")).await;
    staging.stage(item_update(&snapshot, 0, 1, "s1", "green apple")).await;
    staging.stage(item_delete(&snapshot, 0, 2)).await;

    let config = store_config(RouterType::Default);
    let (engine, _tx) = staging.engine(config.clone());
    engine.route_once().await.unwrap();

    let platform = target(staging.dir.path()).await;
    let writer = ConflictAwareWriter::from_config(platform.clone(), &config);
    for (batch, rows) in staging.batches_for("001").await {
        let stats = writer.load_batch(&batch, &rows).await.unwrap();
        assert_eq!(stats.conflicts, 0);
    }

    assert_eq!(target_count(&platform).await, 1);
    assert_eq!(target_name(&platform, 1).await.as_deref(), Some("green apple"));
}

#[tokio::test]
async fn apply_insert_conflict_falls_back_to_update() {
    let mut staging = Staging::new().await;
    let snapshot = item_snapshot();
    staging.stage(item_insert(&snapshot, 0, 1, "s1", "fresh")).await;

    let config = store_config(RouterType::Default);
    let (engine, _tx) = staging.engine(config.clone());
    engine.route_once().await.unwrap();

    let platform = target(staging.dir.path()).await;
    sqlx::query("INSERT INTO item (id, store_id, name) VALUES (1, 's1', 'stale')")
        .execute(platform.pool())
        .await
        .unwrap();

    let writer = ConflictAwareWriter::from_config(platform.clone(), &config);
    let batches = staging.batches_for("001").await;
    let results = writer.load_batches(&batches).await;
    let stats = results.into_iter().next().unwrap().unwrap();
    assert_eq!(stats.conflicts, 1);
    assert_eq!(stats.fallback_updates, 1);
    assert_eq!(target_name(&platform, 1).await.as_deref(), Some("fresh"));
}

#[tokio::test]
async fn apply_delete_of_missing_row_is_counted() {
    let mut staging = Staging::new().await;
    let snapshot = item_snapshot();
    staging.stage(item_delete(&snapshot, 0, 42)).await;

    let config = store_config(RouterType::Default);
    let (engine, _tx) = staging.engine(config.clone());
    engine.route_once().await.unwrap();

    let platform = target(staging.dir.path()).await;
    let writer = ConflictAwareWriter::from_config(platform.clone(), &config);
    let (batch, rows) = staging.batches_for("002").await.remove(0);
    let stats = writer.load_batch(&batch, &rows).await.unwrap();
    assert_eq!(stats.missing_deletes, 1);
}

// =============================================================================
// Restart
// =============================================================================

#[tokio::test]
async fn restart_keeps_routed_state() {
    let mut staging = Staging::new().await;
    let snapshot = item_snapshot();
    for item_id in 1..=3 {
        staging.stage(item_insert(&snapshot, 0, item_id, "s1", "apple")).await;
    }
    {
        let (engine, _tx) = staging.engine(store_config(RouterType::Default));
        engine.route_once().await.unwrap();
    }
    staging.store.close().await;

    // Reopen the same database file.
    staging.store = Arc::new(open_store(staging.dir.path()).await);
    let id = staging.stage(item_insert(&snapshot, 0, 4, "s2", "pear")).await;
    assert_eq!(id, 4);

    // Background loop off so route_once() sees the new row.
    let mut config = store_config(RouterType::Default);
    config.settings.routing.enabled = false;
    let (mut engine, _tx) = staging.engine(config);
    engine.start().await.unwrap();
    let report = engine.route_once().await.unwrap();
    assert_eq!(report.rows_read(), 1);
    assert_eq!(report.observed, 1);
    engine.shutdown().await;
}
