// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Router for the engine's own configuration tables.
//!
//! Changes to node, trigger, router, channel and link rows replicate like
//! any other data, but where they go depends on the registration tree
//! rather than plain group links:
//!
//! - node rows go to ancestors of the node they describe, to the node that
//!   registered it, or else to groups linked to the node's group;
//! - other configuration goes to linked groups with `sync_config_enabled`,
//!   skipping nodes at our own depth;
//! - an update that only touches registration / initial-load switches on a
//!   node security row routes nowhere.
//!
//! Cache flushes and trigger resyncs are signalled through the
//! [`RouterContext`] and run once per pass from [`MetadataRouter::context_committed`].

use super::context::RouterContext;
use super::strategy::{column_values, ColumnMap, NodeIds};
use crate::cache::MetadataCache;
use crate::error::Result;
use crate::model::{ChangeRow, EventType, Node, NodeGroupLink};
use crate::topology::{NodeDirectory, NodeTree};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

const CTX_FLUSH_CHANNELS: &str = "metadata.flush_channels";
const CTX_FLUSH_CONFLICTS: &str = "metadata.flush_conflicts";
const CTX_FLUSH_NODES: &str = "metadata.flush_nodes";
const CTX_FLUSH_NODE_SECURITY: &str = "metadata.flush_node_security";
const CTX_FLUSH_LINKS: &str = "metadata.flush_links";
const CTX_RESYNC_ALL: &str = "metadata.resync_all";
const CTX_RESYNC_TRIGGERS: &str = "metadata.resync_triggers";

const FLUSH_KEYS: [&str; 5] = [
    CTX_FLUSH_CHANNELS,
    CTX_FLUSH_CONFLICTS,
    CTX_FLUSH_NODES,
    CTX_FLUSH_NODE_SECURITY,
    CTX_FLUSH_LINKS,
];

/// Node security columns whose changes never replicate on their own.
const REGISTRATION_COLUMNS: [&str; 6] = [
    "REGISTRATION_ENABLED",
    "REGISTRATION_TIME",
    "REGISTRATION_NOT_BEFORE",
    "INITIAL_LOAD_ENABLED",
    "INITIAL_LOAD_TIME",
    "INITIAL_LOAD_ID",
];

/// Rebuilds capture triggers after trigger configuration changes.
pub trait TriggerResync: Send + Sync + 'static {
    /// `None` means every trigger.
    fn resync(&self, trigger_ids: Option<&BTreeSet<String>>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetadataTable {
    Node,
    NodeSecurity,
    NodeHost,
    TableReloadRequest,
    Trigger,
    TriggerRouter,
    Router,
    Channel,
    Conflict,
    NodeGroupLink,
    Other,
}

impl MetadataTable {
    fn of(table_name: &str, prefix: &str) -> Self {
        let lower = table_name.to_ascii_lowercase();
        let Some(name) = lower
            .strip_prefix(&prefix.to_ascii_lowercase())
            .and_then(|n| n.strip_prefix('_'))
        else {
            return MetadataTable::Other;
        };
        match name {
            "node" => MetadataTable::Node,
            "node_security" => MetadataTable::NodeSecurity,
            "node_host" => MetadataTable::NodeHost,
            "table_reload_request" => MetadataTable::TableReloadRequest,
            "trigger" => MetadataTable::Trigger,
            "trigger_router" => MetadataTable::TriggerRouter,
            "router" => MetadataTable::Router,
            "channel" => MetadataTable::Channel,
            "conflict" => MetadataTable::Conflict,
            "node_group_link" => MetadataTable::NodeGroupLink,
            _ => MetadataTable::Other,
        }
    }

    fn describes_node(self) -> bool {
        matches!(
            self,
            MetadataTable::Node | MetadataTable::NodeSecurity | MetadataTable::NodeHost
        )
    }
}

pub struct MetadataRouter {
    directory: Arc<dyn NodeDirectory>,
    cache: Arc<MetadataCache>,
    table_prefix: String,
    master_to_master: bool,
    resync: Option<Arc<dyn TriggerResync>>,
}

impl MetadataRouter {
    pub fn new(
        directory: Arc<dyn NodeDirectory>,
        cache: Arc<MetadataCache>,
        table_prefix: &str,
        master_to_master: bool,
    ) -> Self {
        Self {
            directory,
            cache,
            table_prefix: table_prefix.to_string(),
            master_to_master,
            resync: None,
        }
    }

    pub fn with_resync(mut self, resync: Arc<dyn TriggerResync>) -> Self {
        self.resync = Some(resync);
        self
    }

    #[cfg(test)]
    pub(crate) fn for_testing() -> Self {
        let config = crate::config::EngineConfig::for_testing("000", "corp");
        let (_tx, rx) = tokio::sync::watch::channel(config);
        Self::new(
            Arc::new(crate::topology::StaticNodeDirectory::new(Node::new("000", "corp"))),
            Arc::new(MetadataCache::new(rx)),
            "sym",
            false,
        )
    }

    pub fn route(
        &self,
        ctx: &mut RouterContext,
        row: &ChangeRow,
        candidates: &[Node],
        initial_load: bool,
    ) -> Result<Option<NodeIds>> {
        let columns = column_values(row)?;
        let me = self.directory.identity();
        let tree = self.directory.tree();
        let table = MetadataTable::of(&row.table_name, &self.table_prefix);

        if table == MetadataTable::Node && is_table_sql(row)? {
            ctx.set_flag(CTX_RESYNC_ALL);
            return Ok(Some(self.route_node_tables(row, &columns, &tree, &me, candidates, initial_load)));
        }

        if table.describes_node() {
            match table {
                MetadataTable::Node => ctx.set_flag(CTX_FLUSH_NODES),
                MetadataTable::NodeSecurity => {
                    ctx.set_flag(CTX_FLUSH_NODE_SECURITY);
                    if registration_only_change(row)? {
                        return Ok(Some(NodeIds::new()));
                    }
                }
                _ => {}
            }
            return Ok(Some(self.route_node_tables(row, &columns, &tree, &me, candidates, initial_load)));
        }

        if table == MetadataTable::TableReloadRequest {
            let source = value(&columns, "SOURCE_NODE_ID");
            let target = value(&columns, "TARGET_NODE_ID");
            return Ok(Some(
                candidates
                    .iter()
                    .filter(|n| Some(n.node_id.as_str()) == source || Some(n.node_id.as_str()) == target)
                    .map(|n| n.node_id.clone())
                    .collect(),
            ));
        }

        let mut nodes = NodeIds::new();
        for candidate in candidates {
            if !initial_load && self.same_hops_as_me(&tree, candidate, &me) {
                continue;
            }
            let sync_config = self
                .directory
                .find_link(&me.node_group_id, &candidate.node_group_id)
                .is_some_and(|l| l.sync_config_enabled);
            if initial_load || sync_config {
                nodes.insert(candidate.node_id.clone());
            }
        }

        if row.source_node_id.as_deref().map_or(true, str::is_empty) {
            match table {
                MetadataTable::Trigger | MetadataTable::TriggerRouter => {
                    if let Some(trigger_id) = value(&columns, "TRIGGER_ID") {
                        ctx.add_to_set(CTX_RESYNC_TRIGGERS, trigger_id);
                    }
                }
                MetadataTable::Router | MetadataTable::NodeGroupLink => ctx.set_flag(CTX_RESYNC_ALL),
                _ => {}
            }
        }
        match table {
            MetadataTable::Channel => ctx.set_flag(CTX_FLUSH_CHANNELS),
            MetadataTable::Conflict => ctx.set_flag(CTX_FLUSH_CONFLICTS),
            MetadataTable::NodeGroupLink => ctx.set_flag(CTX_FLUSH_LINKS),
            _ => {}
        }
        Ok(Some(nodes))
    }

    fn route_node_tables(
        &self,
        row: &ChangeRow,
        columns: &ColumnMap,
        tree: &NodeTree,
        me: &Node,
        candidates: &[Node],
        initial_load: bool,
    ) -> NodeIds {
        let Some(record_id) = value(columns, "NODE_ID") else {
            warn!(data_id = row.data_id, table = %row.table_name, "Node row without NODE_ID, routing to all candidates");
            return all(candidates);
        };

        if row.event_type == EventType::Delete {
            if record_id == me.node_id {
                return NodeIds::new();
            }
            let created_at = value(columns, "CREATED_AT_NODE_ID");
            return candidates
                .iter()
                .filter(|n| {
                    n.node_id != record_id
                        && Some(n.node_id.as_str()) != created_at
                        && n.created_at_node_id.as_deref() != Some(record_id)
                })
                .map(|n| n.node_id.clone())
                .collect();
        }

        if tree.root().is_none() || !tree.contains(record_id) || !tree.contains(&me.node_id) {
            warn!(
                data_id = row.data_id,
                node_id = record_id,
                "Node is not in the registration tree, routing to all candidates"
            );
            return all(candidates);
        }

        let links = self.directory.links();
        let mut nodes = NodeIds::new();
        for candidate in candidates {
            let linked = self.is_linked(record_id, columns, candidate, tree, me, &links);
            if linked && (!self.same_hops_as_me(tree, candidate, me) || self.master_to_master)
                || (candidate.node_id == me.node_id && initial_load)
            {
                nodes.insert(candidate.node_id.clone());
            }
        }

        // A node loads its own row at registration
        if !initial_load && row.event_type == EventType::Insert {
            nodes.remove(record_id);
        }
        nodes
    }

    fn is_linked(
        &self,
        record_id: &str,
        columns: &ColumnMap,
        candidate: &Node,
        tree: &NodeTree,
        me: &Node,
        links: &[NodeGroupLink],
    ) -> bool {
        if record_id == candidate.node_id {
            return true;
        }
        if tree.is_in_parent_hierarchy(record_id, &candidate.node_id) {
            return true;
        }

        let record = self.directory.find_node(record_id);
        let created_at = record
            .as_ref()
            .and_then(|n| n.created_at_node_id.clone())
            .or_else(|| value(columns, "CREATED_AT_NODE_ID").map(str::to_string));
        if let Some(created_at) = created_at {
            if created_at != me.node_id && record_id != me.node_id {
                if created_at == candidate.node_id {
                    return true;
                }
                if tree.contains(&candidate.node_id) {
                    return tree.is_in_child_hierarchy(&candidate.node_id, &created_at);
                }
            }
        }

        let Some(group) = record
            .map(|n| n.node_group_id)
            .or_else(|| value(columns, "NODE_GROUP_ID").map(str::to_string))
        else {
            return false;
        };
        links.iter().any(|l| {
            (l.target_group_id == group && l.source_group_id == candidate.node_group_id)
                || (l.source_group_id == group && l.target_group_id == candidate.node_group_id)
        })
    }

    fn same_hops_as_me(&self, tree: &NodeTree, candidate: &Node, me: &Node) -> bool {
        match (tree.hops_from_root(&candidate.node_id), tree.hops_from_root(&me.node_id)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Run the side effects signalled during the pass.
    pub async fn context_committed(&self, ctx: &mut RouterContext) {
        let flush: Vec<&str> = FLUSH_KEYS.iter().copied().filter(|k| ctx.remove(k).is_some()).collect();
        if !flush.is_empty() {
            info!(signals = ?flush, "Configuration changed, flushing metadata cache");
            self.cache.flush().await;
        }

        let resync_all = ctx.remove(CTX_RESYNC_ALL).is_some();
        let triggers = ctx.set(CTX_RESYNC_TRIGGERS).cloned();
        ctx.remove(CTX_RESYNC_TRIGGERS);
        let Some(resync) = &self.resync else {
            return;
        };
        if resync_all {
            info!("Resyncing all triggers");
            resync.resync(None);
        } else if let Some(triggers) = triggers {
            info!(triggers = ?triggers, "Resyncing triggers");
            resync.resync(Some(&triggers));
        }
    }
}

fn value<'a>(columns: &'a ColumnMap, name: &str) -> Option<&'a str> {
    columns.get(name).and_then(|v| v.as_deref())
}

fn all(candidates: &[Node]) -> NodeIds {
    candidates.iter().map(|n| n.node_id.clone()).collect()
}

/// SQL event against the node table that alters the table itself.
fn is_table_sql(row: &ChangeRow) -> Result<bool> {
    if row.event_type != EventType::Sql {
        return Ok(false);
    }
    Ok(row.parsed_row_data()?.is_some_and(|values| {
        values.len() > 1
            && values[0]
                .as_deref()
                .is_some_and(|sql| sql.to_ascii_uppercase().contains("TABLE"))
    }))
}

/// An update whose changed columns are all registration switches.
fn registration_only_change(row: &ChangeRow) -> Result<bool> {
    if row.event_type != EventType::Update {
        return Ok(false);
    }
    let (Some(new), Some(old)) = (row.parsed_row_data()?, row.parsed_old_data()?) else {
        return Ok(false);
    };
    let changed: Vec<&String> = row
        .snapshot
        .column_names
        .iter()
        .zip(new.iter().zip(old.iter()))
        .filter(|(_, (n, o))| n != o)
        .map(|(name, _)| name)
        .collect();
    Ok(!changed.is_empty()
        && changed
            .iter()
            .all(|c| REGISTRATION_COLUMNS.contains(&c.to_ascii_uppercase().as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, EngineConfig};
    use crate::model::{NodeGroupLink, SchemaSnapshot};
    use crate::topology::StaticNodeDirectory;
    use std::sync::Mutex;
    use tokio::sync::watch;

    // 000 (corp) -> 100, 200 (region) -> 101, 201 (store)
    fn directory(me: &str) -> Arc<StaticNodeDirectory> {
        let nodes = [
            Node::new("000", "corp"),
            Node::new("100", "region").created_at("000"),
            Node::new("200", "region").created_at("000"),
            Node::new("101", "store").created_at("100"),
            Node::new("201", "store").created_at("200"),
        ];
        let identity = nodes.iter().find(|n| n.node_id == me).cloned().unwrap();
        let directory = StaticNodeDirectory::new(identity);
        for node in nodes {
            directory.upsert_node(node);
        }
        for (source, target) in [("corp", "region"), ("region", "corp"), ("region", "store"), ("store", "region")] {
            directory.upsert_link(NodeGroupLink {
                source_group_id: source.into(),
                target_group_id: target.into(),
                sync_config_enabled: true,
            });
        }
        Arc::new(directory)
    }

    fn router(directory: Arc<StaticNodeDirectory>) -> (MetadataRouter, Arc<MetadataCache>) {
        let (_tx, rx) = watch::channel(EngineConfig::for_testing("000", "corp"));
        let cache = Arc::new(MetadataCache::new(rx));
        (MetadataRouter::new(directory, Arc::clone(&cache), "sym", false), cache)
    }

    fn node_row(event: EventType, node_id: &str, group: &str, created_at: &str) -> ChangeRow {
        let snapshot = Arc::new(SchemaSnapshot::new(
            1,
            "sym_node",
            "sym_node",
            &["NODE_ID", "NODE_GROUP_ID", "CREATED_AT_NODE_ID"],
            &["NODE_ID"],
        ));
        let values = [Some(node_id), Some(group), Some(created_at)];
        let row = ChangeRow::new(1, event, "config", snapshot);
        if event == EventType::Delete {
            row.with_old_data(&values)
        } else {
            row.with_row_data(&values)
        }
    }

    fn ctx() -> RouterContext {
        RouterContext::new(ChannelConfig::new("config"))
    }

    fn candidates(directory: &StaticNodeDirectory, ids: &[&str]) -> Vec<Node> {
        ids.iter().filter_map(|id| directory.find_node(id)).collect()
    }

    #[test]
    fn test_table_matching() {
        assert_eq!(MetadataTable::of("SYM_NODE", "sym"), MetadataTable::Node);
        assert_eq!(MetadataTable::of("sym_trigger_router", "sym"), MetadataTable::TriggerRouter);
        assert_eq!(MetadataTable::of("sym_parameter", "sym"), MetadataTable::Other);
        assert_eq!(MetadataTable::of("node", "sym"), MetadataTable::Other);
    }

    #[test]
    fn test_node_row_goes_to_ancestors_not_other_branch() {
        let directory = directory("000");
        let (router, _) = router(Arc::clone(&directory));
        let row = node_row(EventType::Update, "101", "store", "100");
        let routed = router
            .route(&mut ctx(), &row, &candidates(&directory, &["100", "200", "201"]), false)
            .unwrap()
            .unwrap();
        assert_eq!(routed, NodeIds::from(["100".to_string()]));
    }

    #[test]
    fn test_two_hop_sibling_needs_a_group_link() {
        let directory = directory("000");
        // Registered by us, so only group links decide
        let row = node_row(EventType::Update, "201", "store", "000");
        directory.upsert_node(Node::new("201", "store").created_at("000"));
        let (router, _) = router(Arc::clone(&directory));
        let store_candidates = candidates(&directory, &["101"]);

        let routed = router.route(&mut ctx(), &row, &store_candidates, false).unwrap().unwrap();
        assert!(routed.is_empty());

        directory.upsert_link(NodeGroupLink {
            source_group_id: "store".into(),
            target_group_id: "store".into(),
            sync_config_enabled: true,
        });
        let routed = router.route(&mut ctx(), &row, &store_candidates, false).unwrap().unwrap();
        assert_eq!(routed, NodeIds::from(["101".to_string()]));
    }

    #[test]
    fn test_node_insert_not_sent_to_itself() {
        let directory = directory("000");
        let (router, _) = router(Arc::clone(&directory));
        let row = node_row(EventType::Insert, "100", "region", "000");
        let routed = router
            .route(&mut ctx(), &row, &candidates(&directory, &["100", "200"]), false)
            .unwrap()
            .unwrap();
        assert!(!routed.contains("100"));

        let routed = router
            .route(&mut ctx(), &row, &candidates(&directory, &["100", "200"]), true)
            .unwrap()
            .unwrap();
        assert!(routed.contains("100"));
    }

    #[test]
    fn test_node_delete_skips_record_creator_and_children() {
        let directory = directory("000");
        let (router, _) = router(Arc::clone(&directory));
        let row = node_row(EventType::Delete, "100", "region", "000");
        let routed = router
            .route(&mut ctx(), &row, &candidates(&directory, &["000", "100", "101", "200"]), false)
            .unwrap()
            .unwrap();
        assert_eq!(routed, NodeIds::from(["200".to_string()]));
    }

    #[test]
    fn test_unknown_node_routes_to_all() {
        let directory = directory("000");
        let (router, _) = router(Arc::clone(&directory));
        let row = node_row(EventType::Update, "999", "store", "555");
        let routed = router
            .route(&mut ctx(), &row, &candidates(&directory, &["100", "200"]), false)
            .unwrap()
            .unwrap();
        assert_eq!(routed.len(), 2);
    }

    #[test]
    fn test_registration_only_update_suppressed() {
        let directory = directory("000");
        let (router, _) = router(Arc::clone(&directory));
        let snapshot = Arc::new(SchemaSnapshot::new(
            2,
            "sym_node_security",
            "sym_node_security",
            &["NODE_ID", "NODE_PASSWORD", "REGISTRATION_ENABLED"],
            &["NODE_ID"],
        ));
        let row = ChangeRow::new(1, EventType::Update, "config", Arc::clone(&snapshot))
            .with_row_data(&[Some("101"), Some("pw"), Some("1")])
            .with_old_data(&[Some("101"), Some("pw"), Some("0")]);
        let routed = router
            .route(&mut ctx(), &row, &candidates(&directory, &["100"]), false)
            .unwrap()
            .unwrap();
        assert!(routed.is_empty());

        let row = ChangeRow::new(2, EventType::Update, "config", snapshot)
            .with_row_data(&[Some("101"), Some("new"), Some("1")])
            .with_old_data(&[Some("101"), Some("pw"), Some("0")]);
        let routed = router
            .route(&mut ctx(), &row, &candidates(&directory, &["100"]), false)
            .unwrap()
            .unwrap();
        assert_eq!(routed.len(), 1);
    }

    #[test]
    fn test_config_rows_follow_sync_config_links() {
        let directory = directory("100");
        let (router, _) = router(Arc::clone(&directory));
        let snapshot = Arc::new(SchemaSnapshot::new(3, "sym_channel", "sym_channel", &["CHANNEL_ID"], &["CHANNEL_ID"]));
        let row = ChangeRow::new(1, EventType::Insert, "config", snapshot).with_row_data(&[Some("sale")]);
        let mut context = ctx();
        let routed = router
            .route(&mut context, &row, &candidates(&directory, &["000", "101", "200"]), false)
            .unwrap()
            .unwrap();
        // 200 is at our depth
        assert_eq!(routed, NodeIds::from(["000".to_string(), "101".to_string()]));
        assert!(context.has(CTX_FLUSH_CHANNELS));
    }

    #[test]
    fn test_reload_request_routes_to_endpoints() {
        let directory = directory("000");
        let (router, _) = router(Arc::clone(&directory));
        let snapshot = Arc::new(SchemaSnapshot::new(
            4,
            "sym_table_reload_request",
            "sym_table_reload_request",
            &["SOURCE_NODE_ID", "TARGET_NODE_ID"],
            &["SOURCE_NODE_ID", "TARGET_NODE_ID"],
        ));
        let row = ChangeRow::new(1, EventType::Insert, "config", snapshot).with_row_data(&[Some("000"), Some("201")]);
        let routed = router
            .route(&mut ctx(), &row, &candidates(&directory, &["100", "200", "201"]), false)
            .unwrap()
            .unwrap();
        assert_eq!(routed, NodeIds::from(["201".to_string()]));
    }

    #[derive(Default)]
    struct RecordingResync(Mutex<Vec<Option<BTreeSet<String>>>>);

    impl TriggerResync for RecordingResync {
        fn resync(&self, trigger_ids: Option<&BTreeSet<String>>) {
            self.0.lock().unwrap().push(trigger_ids.cloned());
        }
    }

    #[tokio::test]
    async fn test_side_effects_run_once_after_commit() {
        let directory = directory("000");
        let resync = Arc::new(RecordingResync::default());
        let (router, cache) = router(Arc::clone(&directory));
        let router = router.with_resync(Arc::clone(&resync) as Arc<dyn TriggerResync>);
        cache.metadata().await;
        assert_eq!(cache.load_count(), 1);

        let snapshot = Arc::new(SchemaSnapshot::new(5, "sym_trigger", "sym_trigger", &["TRIGGER_ID"], &["TRIGGER_ID"]));
        let mut context = ctx();
        for (id, trigger) in [(1, "item"), (2, "sale"), (3, "item")] {
            let row = ChangeRow::new(id, EventType::Update, "config", Arc::clone(&snapshot))
                .with_row_data(&[Some(trigger)]);
            router.route(&mut context, &row, &[], false).unwrap();
        }
        let channel = Arc::new(SchemaSnapshot::new(3, "sym_channel", "sym_channel", &["CHANNEL_ID"], &["CHANNEL_ID"]));
        for id in 4..6 {
            let row = ChangeRow::new(id, EventType::Update, "config", Arc::clone(&channel)).with_row_data(&[Some("c")]);
            router.route(&mut context, &row, &[], false).unwrap();
        }
        assert!(resync.0.lock().unwrap().is_empty());

        router.context_committed(&mut context).await;
        let calls = resync.0.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].as_ref().map(|s| s.len()), Some(2));

        cache.metadata().await;
        assert_eq!(cache.load_count(), 2);

        // Nothing left to do
        router.context_committed(&mut context).await;
        assert_eq!(resync.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_rows_from_other_nodes_do_not_resync() {
        let directory = directory("000");
        let (router, _) = router(Arc::clone(&directory));
        let snapshot = Arc::new(SchemaSnapshot::new(5, "sym_trigger", "sym_trigger", &["TRIGGER_ID"], &["TRIGGER_ID"]));
        let row = ChangeRow::new(1, EventType::Update, "config", snapshot)
            .with_row_data(&[Some("item")])
            .with_source_node("100");
        let mut context = ctx();
        router.route(&mut context, &row, &[], false).unwrap();
        assert!(context.set(CTX_RESYNC_TRIGGERS).is_none());
    }
}
