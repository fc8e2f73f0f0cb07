//! HRW (Highest Random Weight) / rendezvous placement
//!
//! `score(node) = hash(chunk_id, node_id) * weight`. Nodes are taken in
//! descending score order, first one per rack, then filling from racks
//! already used. The result never repeats a node.

use crate::topology::{ClusterTopology, NodeInfo};
use hunkstore_common::{ChunkId, Error, NodeId, Result};
use std::collections::HashSet;

/// Rendezvous-hash placer for chunk parts and replicas
#[derive(Clone, Debug, Default)]
pub struct HrwPlacer {
    seed: u64,
}

impl HrwPlacer {
    #[must_use]
    pub const fn new() -> Self {
        Self { seed: 0 }
    }

    /// Placer with a custom hash seed
    #[must_use]
    pub const fn with_seed(seed: u64) -> Self {
        Self { seed }
    }

    fn score(&self, chunk_hash: u64, node: &NodeInfo) -> u64 {
        let node_hash = xxhash_rust::xxh64::xxh64(node.id.as_bytes(), chunk_hash);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let weight_factor = (node.weight * 1000.0) as u64;
        node_hash.wrapping_mul(weight_factor.max(1))
    }

    /// Select `count` distinct active nodes for a chunk, skipping `exclude`
    pub fn select(
        &self,
        topology: &ClusterTopology,
        chunk_id: &ChunkId,
        count: usize,
        exclude: &[NodeId],
    ) -> Result<Vec<NodeId>> {
        let chunk_hash = xxhash_rust::xxh64::xxh64(chunk_id.as_bytes(), self.seed);

        let mut scored: Vec<(&NodeInfo, u64)> = topology
            .active_nodes()
            .filter(|n| !exclude.contains(&n.id))
            .map(|n| (n, self.score(chunk_hash, n)))
            .collect();

        if scored.len() < count {
            return Err(Error::InsufficientNodes {
                available: scored.len(),
                required: count,
            });
        }

        scored.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));

        let mut selected = Vec::with_capacity(count);
        let mut used_racks: HashSet<&str> = HashSet::new();
        for (node, _) in &scored {
            if selected.len() == count {
                break;
            }
            if used_racks.insert(node.rack.as_str()) {
                selected.push(node.id);
            }
        }
        for (node, _) in &scored {
            if selected.len() == count {
                break;
            }
            if !selected.contains(&node.id) {
                selected.push(node.id);
            }
        }

        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::NodeStatus;

    #[test]
    fn test_hrw_deterministic() {
        let topology = ClusterTopology::with_nodes(12, 3);
        let placer = HrwPlacer::new();
        let chunk_id = ChunkId::new();

        let p1 = placer.select(&topology, &chunk_id, 9, &[]).unwrap();
        let p2 = placer.select(&topology, &chunk_id, 9, &[]).unwrap();
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_nodes_are_distinct() {
        let topology = ClusterTopology::with_nodes(9, 3);
        let placer = HrwPlacer::new();

        for _ in 0..50 {
            let nodes = placer.select(&topology, &ChunkId::new(), 9, &[]).unwrap();
            let unique: HashSet<_> = nodes.iter().collect();
            assert_eq!(unique.len(), 9);
        }
    }

    #[test]
    fn test_racks_spread_first() {
        let topology = ClusterTopology::with_nodes(12, 3);
        let placer = HrwPlacer::new();

        let nodes = placer.select(&topology, &ChunkId::new(), 3, &[]).unwrap();
        let racks: HashSet<_> = nodes
            .iter()
            .map(|id| topology.get_node(*id).unwrap().rack.clone())
            .collect();
        assert_eq!(racks.len(), 3);
    }

    #[test]
    fn test_exclusions_and_banned_nodes() {
        let mut topology = ClusterTopology::with_nodes(5, 1);
        let ids: Vec<NodeId> = topology.all_nodes().map(|n| n.id).collect();
        topology.set_status(ids[0], NodeStatus::Banned);

        let placer = HrwPlacer::new();
        let nodes = placer
            .select(&topology, &ChunkId::new(), 3, &[ids[1]])
            .unwrap();
        assert!(!nodes.contains(&ids[0]));
        assert!(!nodes.contains(&ids[1]));

        let err = placer
            .select(&topology, &ChunkId::new(), 4, &[ids[1]])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientNodes {
                available: 3,
                required: 4
            }
        ));
    }

    #[test]
    fn test_hrw_balance() {
        let topology = ClusterTopology::with_nodes(6, 6);
        let placer = HrwPlacer::new();
        let mut counts = std::collections::HashMap::new();

        for _ in 0..3000 {
            let nodes = placer.select(&topology, &ChunkId::new(), 1, &[]).unwrap();
            *counts.entry(nodes[0]).or_insert(0usize) += 1;
        }
        assert_eq!(counts.len(), 6);
        assert!(counts.values().all(|c| *c > 300));
    }
}
