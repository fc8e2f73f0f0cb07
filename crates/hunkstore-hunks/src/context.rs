//! Shared handles of a hunk storage instance

use crate::backend::{ChunkBackend, MemoryChunkBackend};
use crate::ledger::HunkLedger;
use hunkstore_common::{ChunkId, HunkStoreConfig, NodeId, Result};
use hunkstore_placement::{ClusterTopology, HrwPlacer};
use parking_lot::RwLock;
use std::sync::Arc;

/// Everything the writer, reader and background services share
#[derive(Clone)]
pub struct StorageContext {
    pub ledger: Arc<HunkLedger>,
    pub backend: Arc<dyn ChunkBackend>,
    pub topology: Arc<RwLock<ClusterTopology>>,
    pub placer: HrwPlacer,
    pub config: Arc<HunkStoreConfig>,
}

impl StorageContext {
    /// Validate `config` and build a context
    pub fn new(
        config: HunkStoreConfig,
        backend: Arc<dyn ChunkBackend>,
        topology: ClusterTopology,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ledger: Arc::new(HunkLedger::new()),
            backend,
            topology: Arc::new(RwLock::new(topology)),
            placer: HrwPlacer::new(),
            config: Arc::new(config),
        })
    }

    /// Context over an in-memory backend, returned alongside the backend
    pub fn in_memory(
        config: HunkStoreConfig,
        topology: ClusterTopology,
    ) -> Result<(Self, Arc<MemoryChunkBackend>)> {
        let backend = Arc::new(MemoryChunkBackend::new());
        let ctx = Self::new(config, Arc::clone(&backend) as Arc<dyn ChunkBackend>, topology)?;
        Ok((ctx, backend))
    }

    /// Pick `count` distinct nodes for a chunk
    pub fn select_nodes(
        &self,
        chunk_id: &ChunkId,
        count: usize,
        exclude: &[NodeId],
    ) -> Result<Vec<NodeId>> {
        let topology = self.topology.read();
        self.placer.select(&topology, chunk_id, count, exclude)
    }
}
