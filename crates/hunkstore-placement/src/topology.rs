//! Cluster topology representation

use hunkstore_common::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Node status as seen by placement
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Node accepts new parts
    #[default]
    Active,
    /// Node is administratively excluded from placement and reads
    Banned,
}

/// Node information
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node unique identifier
    pub id: NodeId,
    /// Human-readable name
    pub name: String,
    /// Rack the node belongs to
    pub rack: String,
    /// Node status
    pub status: NodeStatus,
    /// Weight for placement (higher = more data)
    pub weight: f64,
}

impl NodeInfo {
    /// Create an active node with unit weight
    #[must_use]
    pub fn new(name: impl Into<String>, rack: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(),
            name: name.into(),
            rack: rack.into(),
            status: NodeStatus::Active,
            weight: 1.0,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == NodeStatus::Active
    }
}

/// Cluster topology containing all storage nodes
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterTopology {
    /// Version number (incremented on changes)
    pub version: u64,
    nodes: BTreeMap<NodeId, NodeInfo>,
}

impl ClusterTopology {
    /// Create a new empty topology
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a topology of `count` active nodes spread round-robin over `racks` racks
    #[must_use]
    pub fn with_nodes(count: usize, racks: usize) -> Self {
        let mut topology = Self::new();
        for i in 0..count {
            topology.upsert_node(NodeInfo::new(
                format!("node-{i}"),
                format!("rack-{}", i % racks.max(1)),
            ));
        }
        topology
    }

    /// Get all nodes in the cluster
    pub fn all_nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    /// Get a specific node by ID
    #[must_use]
    pub fn get_node(&self, node_id: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(&node_id)
    }

    /// Get all active nodes
    pub fn active_nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values().filter(|n| n.is_active())
    }

    /// Add or update a node
    pub fn upsert_node(&mut self, node: NodeInfo) -> NodeId {
        let id = node.id;
        self.nodes.insert(id, node);
        self.version += 1;
        id
    }

    /// Remove a node
    pub fn remove_node(&mut self, node_id: NodeId) -> Option<NodeInfo> {
        let removed = self.nodes.remove(&node_id);
        if removed.is_some() {
            self.version += 1;
        }
        removed
    }

    /// Change a node's status; returns false for unknown nodes
    pub fn set_status(&mut self, node_id: NodeId, status: NodeStatus) -> bool {
        match self.nodes.get_mut(&node_id) {
            Some(node) => {
                node.status = status;
                self.version += 1;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_add_node() {
        let mut topology = ClusterTopology::new();
        let id = topology.upsert_node(NodeInfo::new("node-1", "rack-1"));

        assert_eq!(topology.version, 1);
        assert_eq!(topology.all_nodes().count(), 1);
        assert_eq!(topology.get_node(id).unwrap().name, "node-1");
    }

    #[test]
    fn test_banned_nodes_are_not_active() {
        let mut topology = ClusterTopology::with_nodes(4, 2);
        let victim = topology.all_nodes().next().unwrap().id;

        assert!(topology.set_status(victim, NodeStatus::Banned));
        assert_eq!(topology.active_nodes().count(), 3);
        assert!(!topology.set_status(NodeId::new(), NodeStatus::Banned));

        assert!(topology.remove_node(victim).is_some());
        assert_eq!(topology.len(), 3);
    }
}
