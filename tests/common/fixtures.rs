//! Config and row fixtures.
//!
//! Topology used throughout: the local node `000` in group `corp` routes
//! table `item` to two stores, `001` (external id `s1`) and `002` (`s2`).

use std::sync::Arc;
use tokio::sync::watch;
use trigger_replication::config::{ChannelConfig, NodeConfig, RouterConfig, RouterType, TriggerConfig};
use trigger_replication::model::{ChangeRow, DataId, EventType, SchemaSnapshot};
use trigger_replication::{EngineConfig, InMemoryStore, RoutingEngine};

pub const ITEM_COLUMNS: [&str; 3] = ["id", "store_id", "name"];

/// Config with one `default` channel and a `corp_2_store` router of type `router`.
pub fn store_config(router: RouterType) -> EngineConfig {
    let mut config = EngineConfig::for_testing("000", "corp");
    config.channels = vec![ChannelConfig::new("default")];
    for (id, external) in [("001", "s1"), ("002", "s2")] {
        config.nodes.push(NodeConfig {
            node_id: id.into(),
            node_group_id: "store".into(),
            external_id: external.into(),
            created_at_node_id: Some("000".into()),
            sync_enabled: true,
        });
    }
    config.triggers.push(TriggerConfig {
        trigger_id: "item".into(),
        source_table: "item".into(),
        channel_id: "default".into(),
        routers: vec!["corp_2_store".into()],
    });
    config
        .routers
        .push(RouterConfig::new("corp_2_store", "corp", "store", router));
    config
}

pub fn item_snapshot() -> Arc<SchemaSnapshot> {
    Arc::new(SchemaSnapshot::new(1, "item", "item", &ITEM_COLUMNS, &["id"]))
}

/// Insert of item `item_id`. A `data_id` of 0 lets the store assign one.
pub fn item_insert(snapshot: &Arc<SchemaSnapshot>, id: DataId, item_id: i64, store_id: &str, name: &str) -> ChangeRow {
    let item_text = item_id.to_string();
    ChangeRow::new(id, EventType::Insert, "default", Arc::clone(snapshot))
        .with_row_data(&[Some(&item_text), Some(store_id), Some(name)])
}

pub fn item_update(snapshot: &Arc<SchemaSnapshot>, id: DataId, item_id: i64, store_id: &str, name: &str) -> ChangeRow {
    let item_text = item_id.to_string();
    ChangeRow::new(id, EventType::Update, "default", Arc::clone(snapshot))
        .with_row_data(&[Some(&item_text), Some(store_id), Some(name)])
        .with_pk_data(&[Some(&item_text)])
}

pub fn item_delete(snapshot: &Arc<SchemaSnapshot>, id: DataId, item_id: i64) -> ChangeRow {
    let item_text = item_id.to_string();
    ChangeRow::new(id, EventType::Delete, "default", Arc::clone(snapshot))
        .with_pk_data(&[Some(&item_text)])
}

/// In-memory engine plus the sender that keeps its config channel open.
pub fn memory_engine(config: EngineConfig) -> (RoutingEngine<InMemoryStore>, watch::Sender<EngineConfig>) {
    let (tx, rx) = watch::channel(config.clone());
    let engine = RoutingEngine::with_store(config, rx, Arc::new(InMemoryStore::new()));
    (engine, tx)
}

/// Install a tracing subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
