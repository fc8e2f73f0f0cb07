//! Storage node I/O for chunk parts
//!
//! A chunk part is an append-only sequence of blocks kept by one node. For a
//! replicated chunk every replica stores part 0 holding the whole blocks; for
//! an erasure-coded chunk node `i` stores part `i` of every block.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use hunkstore_common::{ChunkId, Error, NodeId, Result};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Identifies one part of a chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PartKey {
    pub chunk_id: ChunkId,
    pub part_index: u16,
}

impl PartKey {
    #[must_use]
    pub const fn new(chunk_id: ChunkId, part_index: u16) -> Self {
        Self {
            chunk_id,
            part_index,
        }
    }
}

/// A byte range within one block of a part
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentRange {
    pub block_index: u32,
    pub offset: u64,
    pub length: u64,
}

/// Storage node operations used by hunk readers, writers, repair and GC
#[async_trait]
pub trait ChunkBackend: Send + Sync {
    /// Append blocks to a part, creating it if needed
    async fn append_blocks(&self, node: NodeId, part: PartKey, blocks: Vec<Bytes>) -> Result<()>;

    /// Read byte ranges of a part; one response per fragment, in order
    async fn read_fragments(
        &self,
        node: NodeId,
        part: PartKey,
        fragments: &[FragmentRange],
    ) -> Result<Vec<Bytes>>;

    /// Whether the node holds the part
    async fn has_part(&self, node: NodeId, part: PartKey) -> Result<bool>;

    /// Remove a part; removing a missing part succeeds
    async fn remove_part(&self, node: NodeId, part: PartKey) -> Result<()>;
}

/// In-process backend keeping parts in memory
///
/// Nodes can be banned (every call fails with `NodeUnavailable`) or slowed
/// down, which is how tests exercise reconstruction and hedging.
#[derive(Default)]
pub struct MemoryChunkBackend {
    parts: DashMap<(NodeId, PartKey), Vec<Bytes>>,
    banned: RwLock<HashSet<NodeId>>,
    latency: DashMap<NodeId, Duration>,
    read_requests: AtomicU64,
    write_requests: AtomicU64,
}

impl MemoryChunkBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call addressed to `node` fail
    pub fn ban_node(&self, node: NodeId) {
        self.banned.write().insert(node);
    }

    pub fn unban_node(&self, node: NodeId) {
        self.banned.write().remove(&node);
    }

    /// Delay every call addressed to `node`
    pub fn set_latency(&self, node: NodeId, latency: Duration) {
        self.latency.insert(node, latency);
    }

    pub fn clear_latency(&self, node: NodeId) {
        self.latency.remove(&node);
    }

    /// Number of read calls served or attempted
    #[must_use]
    pub fn read_request_count(&self) -> u64 {
        self.read_requests.load(Ordering::Relaxed)
    }

    /// Number of append calls served or attempted
    #[must_use]
    pub fn write_request_count(&self) -> u64 {
        self.write_requests.load(Ordering::Relaxed)
    }

    /// Number of stored parts belonging to a chunk, across all nodes
    #[must_use]
    pub fn stored_part_count(&self, chunk_id: ChunkId) -> usize {
        self.parts
            .iter()
            .filter(|entry| entry.key().1.chunk_id == chunk_id)
            .count()
    }

    async fn enter(&self, node: NodeId) -> Result<()> {
        let delay = self.latency.get(&node).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.banned.read().contains(&node) {
            return Err(Error::NodeUnavailable(node));
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkBackend for MemoryChunkBackend {
    async fn append_blocks(&self, node: NodeId, part: PartKey, blocks: Vec<Bytes>) -> Result<()> {
        self.write_requests.fetch_add(1, Ordering::Relaxed);
        self.enter(node).await?;
        self.parts.entry((node, part)).or_default().extend(blocks);
        Ok(())
    }

    async fn read_fragments(
        &self,
        node: NodeId,
        part: PartKey,
        fragments: &[FragmentRange],
    ) -> Result<Vec<Bytes>> {
        self.read_requests.fetch_add(1, Ordering::Relaxed);
        self.enter(node).await?;

        let blocks = self.parts.get(&(node, part)).ok_or_else(|| {
            Error::storage(format!(
                "part {} of chunk {} is missing on node {node}",
                part.part_index, part.chunk_id
            ))
        })?;

        fragments
            .iter()
            .map(|fragment| {
                let block = blocks.get(fragment.block_index as usize).ok_or_else(|| {
                    Error::storage(format!(
                        "block {} of chunk {} is missing on node {node}",
                        fragment.block_index, part.chunk_id
                    ))
                })?;
                let start = usize::try_from(fragment.offset)
                    .map_err(|_| Error::internal("fragment offset overflow"))?;
                let end = start
                    + usize::try_from(fragment.length)
                        .map_err(|_| Error::internal("fragment length overflow"))?;
                if end > block.len() {
                    return Err(Error::storage(format!(
                        "fragment {start}..{end} exceeds stored block of {} bytes",
                        block.len()
                    )));
                }
                Ok(block.slice(start..end))
            })
            .collect()
    }

    async fn has_part(&self, node: NodeId, part: PartKey) -> Result<bool> {
        self.enter(node).await?;
        Ok(self.parts.contains_key(&(node, part)))
    }

    async fn remove_part(&self, node: NodeId, part: PartKey) -> Result<()> {
        self.enter(node).await?;
        self.parts.remove(&(node, part));
        Ok(())
    }
}
