// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node directory and registration tree.
//!
//! Every node except the root was registered by another node
//! (`created_at_node_id`). Those edges form a tree:
//!
//! ```text
//!            000 (corp, root)         hops 0
//!           /        \
//!        100 (region) 200 (region)    hops 1
//!        /               \
//!      101 (store)       201 (store)  hops 2
//! ```
//!
//! The metadata router uses the tree to decide which nodes hear about a
//! change to a node row: ancestors always do, and siblings at the same depth
//! only do in master-to-master setups.

use crate::config::EngineConfig;
use crate::model::{Node, NodeGroupLink};
use dashmap::DashMap;
use std::collections::HashMap;

/// Node and link lookups used by routers.
pub trait NodeDirectory: Send + Sync + 'static {
    /// The local node.
    fn identity(&self) -> Node;

    fn find_node(&self, node_id: &str) -> Option<Node>;

    fn all_nodes(&self) -> Vec<Node>;

    fn links(&self) -> Vec<NodeGroupLink>;

    /// Sync-enabled nodes of a group.
    fn nodes_in_group(&self, node_group_id: &str) -> Vec<Node> {
        self.all_nodes()
            .into_iter()
            .filter(|n| n.sync_enabled && n.node_group_id == node_group_id)
            .collect()
    }

    fn find_link(&self, source_group_id: &str, target_group_id: &str) -> Option<NodeGroupLink> {
        self.links()
            .into_iter()
            .find(|l| l.source_group_id == source_group_id && l.target_group_id == target_group_id)
    }

    /// Registration tree over every known node.
    fn tree(&self) -> NodeTree {
        NodeTree::build(&self.all_nodes())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NodeTree
// ═══════════════════════════════════════════════════════════════════════════════

/// Parent links between nodes, by registering node.
#[derive(Debug, Clone, Default)]
pub struct NodeTree {
    parents: HashMap<String, Option<String>>,
    root: Option<String>,
}

impl NodeTree {
    pub fn build(nodes: &[Node]) -> Self {
        let known: std::collections::HashSet<&str> = nodes.iter().map(|n| n.node_id.as_str()).collect();
        let mut parents = HashMap::with_capacity(nodes.len());
        for node in nodes {
            // A dangling or self-referencing creator makes the node a root.
            let parent = node
                .created_at_node_id
                .as_ref()
                .filter(|p| **p != node.node_id && known.contains(p.as_str()))
                .cloned();
            parents.insert(node.node_id.clone(), parent);
        }

        let mut roots: Vec<&String> = parents
            .iter()
            .filter(|(_, parent)| parent.is_none())
            .map(|(id, _)| id)
            .collect();
        roots.sort();
        let root = roots.first().map(|r| r.to_string());

        Self { parents, root }
    }

    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.parents.contains_key(node_id)
    }

    pub fn parent(&self, node_id: &str) -> Option<&str> {
        self.parents.get(node_id).and_then(|p| p.as_deref())
    }

    /// Ancestors of a node, nearest first.
    pub fn ancestors(&self, node_id: &str) -> Vec<&str> {
        let mut out = Vec::new();
        let mut current = self.parent(node_id);
        while let Some(id) = current {
            // Registration cycles are data errors; stop instead of looping.
            if out.contains(&id) || out.len() > self.parents.len() {
                break;
            }
            out.push(id);
            current = self.parent(id);
        }
        out
    }

    /// Links between the node and its root. `None` for unknown nodes.
    pub fn hops_from_root(&self, node_id: &str) -> Option<usize> {
        if !self.contains(node_id) {
            return None;
        }
        Some(self.ancestors(node_id).len())
    }

    /// True when `candidate` is an ancestor of `node_id`.
    pub fn is_in_parent_hierarchy(&self, node_id: &str, candidate: &str) -> bool {
        self.ancestors(node_id).contains(&candidate)
    }

    /// True when `candidate` is a descendant of `node_id`.
    pub fn is_in_child_hierarchy(&self, node_id: &str, candidate: &str) -> bool {
        self.is_in_parent_hierarchy(candidate, node_id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StaticNodeDirectory
// ═══════════════════════════════════════════════════════════════════════════════

/// Directory held in memory, seeded from configuration.
pub struct StaticNodeDirectory {
    identity: Node,
    nodes: DashMap<String, Node>,
    links: DashMap<(String, String), NodeGroupLink>,
}

impl StaticNodeDirectory {
    pub fn new(identity: Node) -> Self {
        let nodes = DashMap::new();
        nodes.insert(identity.node_id.clone(), identity.clone());
        Self {
            identity,
            nodes,
            links: DashMap::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let identity = config
            .nodes
            .iter()
            .find(|n| n.node_id == config.node_id)
            .map(Node::from)
            .unwrap_or_else(|| Node::new(&config.node_id, &config.node_group_id));

        let directory = Self::new(identity);
        for node in &config.nodes {
            directory.upsert_node(Node::from(node));
        }
        for link in &config.node_group_links {
            directory.upsert_link(NodeGroupLink {
                source_group_id: link.source_group_id.clone(),
                target_group_id: link.target_group_id.clone(),
                sync_config_enabled: link.sync_config_enabled,
            });
        }
        directory
    }

    pub fn upsert_node(&self, node: Node) {
        self.nodes.insert(node.node_id.clone(), node);
    }

    pub fn remove_node(&self, node_id: &str) {
        if node_id != self.identity.node_id {
            self.nodes.remove(node_id);
        }
    }

    pub fn upsert_link(&self, link: NodeGroupLink) {
        self.links.insert(
            (link.source_group_id.clone(), link.target_group_id.clone()),
            link,
        );
    }
}

impl NodeDirectory for StaticNodeDirectory {
    fn identity(&self) -> Node {
        self.identity.clone()
    }

    fn find_node(&self, node_id: &str) -> Option<Node> {
        self.nodes.get(node_id).map(|r| r.value().clone())
    }

    fn all_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|r| r.value().clone()).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    fn links(&self) -> Vec<NodeGroupLink> {
        self.links.iter().map(|r| r.value().clone()).collect()
    }

    fn find_link(&self, source_group_id: &str, target_group_id: &str) -> Option<NodeGroupLink> {
        self.links
            .get(&(source_group_id.to_string(), target_group_id.to_string()))
            .map(|r| r.value().clone())
    }
}
