//! Hunkstore Placement - distinct-node placement of chunk parts
//!
//! Every part of an erasure-coded block, and every replica of a replicated
//! chunk, must land on a different node. Placement uses HRW (rendezvous)
//! hashing over the active nodes of the cluster topology, spreading parts
//! across racks before reusing a rack.
//!
//! # Example
//! ```
//! use hunkstore_common::ChunkId;
//! use hunkstore_placement::{ClusterTopology, HrwPlacer, NodeInfo};
//!
//! let mut topology = ClusterTopology::new();
//! for i in 0..4 {
//!     topology.upsert_node(NodeInfo::new(format!("node-{i}"), "rack-0"));
//! }
//! let nodes = HrwPlacer::new().select(&topology, &ChunkId::new(), 3, &[]).unwrap();
//! assert_eq!(nodes.len(), 3);
//! ```

pub mod hrw;
pub mod topology;

pub use hrw::HrwPlacer;
pub use topology::{ClusterTopology, NodeInfo, NodeStatus};
