//! Chunk metadata shared by the writer, reader and ledger

use hunkstore_common::{Checksum, ChunkId, ErasureCodecId, NodeId};
use serde::{Deserialize, Serialize};

/// What a chunk holds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkKind {
    /// Primary sorted rows
    Store,
    /// Externalized payloads
    Hunk,
}

/// Write lifecycle of a chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkState {
    /// Blocks may still be appended (active hunk store)
    Building,
    /// Immutable
    Sealed,
}

/// Where the parts of a chunk live
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkLayout {
    /// Every replica holds every block in full (part index 0)
    Replicated { replicas: Vec<NodeId> },
    /// Part `i` of every block is stored on `parts[i]`
    Erasure { parts: Vec<NodeId> },
}

impl ChunkLayout {
    /// All nodes holding data of the chunk
    #[must_use]
    pub fn nodes(&self) -> &[NodeId] {
        match self {
            Self::Replicated { replicas } => replicas,
            Self::Erasure { parts } => parts,
        }
    }
}

/// Immutable description of a chunk
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub id: ChunkId,
    pub kind: ChunkKind,
    pub erasure_codec: ErasureCodecId,
    pub layout: ChunkLayout,
    /// Size of every block, in block index order
    pub block_sizes: Vec<u64>,
    /// Checksum of every block, in block index order
    pub block_checksums: Vec<Checksum>,
    /// Number of hunks (hunk chunks) or rows (store chunks)
    pub hunk_count: u64,
    /// Sum of payload sizes, headers excluded
    pub total_hunk_length: u64,
    pub uncompressed_data_size: u64,
    pub compressed_data_size: u64,
}

impl ChunkMeta {
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.block_sizes.len()
    }

    #[must_use]
    pub fn block_size(&self, block_index: u32) -> Option<u64> {
        self.block_sizes.get(block_index as usize).copied()
    }
}

/// Reference from a store chunk to a hunk chunk
///
/// `hunk_count` and `total_hunk_length` count only the hunks of the target
/// chunk that the store chunk's rows point at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HunkChunkRef {
    pub chunk_id: ChunkId,
    pub hunk_count: u64,
    pub total_hunk_length: u64,
    pub erasure_codec: ErasureCodecId,
}
