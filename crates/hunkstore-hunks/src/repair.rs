//! Erasure health scan and part repair

use crate::backend::FragmentRange;
use crate::chunk::{ChunkLayout, ChunkMeta};
use crate::context::StorageContext;
use crate::writer::part_key;
use bytes::Bytes;
use futures::future::join_all;
use hunkstore_common::{ChunkId, Error, MissingParts, Result};
use hunkstore_erasure::ErasureCodec;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Erasure-coded chunks with missing parts, by role
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureHealth {
    pub data_missing_chunks: Vec<ChunkId>,
    pub parity_missing_chunks: Vec<ChunkId>,
}

impl ErasureHealth {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.data_missing_chunks.is_empty() && self.parity_missing_chunks.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub repaired: Vec<ChunkId>,
    pub unrecoverable: Vec<ChunkId>,
}

/// Finds and rebuilds missing parts of erasure-coded chunks
pub struct ChunkRepairer {
    ctx: StorageContext,
}

impl ChunkRepairer {
    #[must_use]
    pub const fn new(ctx: StorageContext) -> Self {
        Self { ctx }
    }

    /// Sealed erasure-coded chunks; journal chunks still being appended are skipped
    fn erasure_chunks(&self) -> Vec<std::sync::Arc<ChunkMeta>> {
        let mut chunks: Vec<_> = self
            .ctx
            .ledger
            .sealed_chunks()
            .into_iter()
            .filter(|meta| matches!(meta.layout, ChunkLayout::Erasure { .. }))
            .collect();
        chunks.sort_by_key(|meta| meta.id);
        chunks
    }

    /// Parts of a chunk that are not readable on their node
    pub async fn missing_parts(&self, meta: &ChunkMeta) -> Result<MissingParts> {
        let nodes = meta.layout.nodes();
        let mut checks = Vec::with_capacity(nodes.len());
        for (index, node) in nodes.iter().enumerate() {
            let key = part_key(meta.id, index)?;
            checks.push(async move { (index, self.ctx.backend.has_part(*node, key).await) });
        }

        let missing = join_all(checks)
            .await
            .into_iter()
            .filter(|(_, present)| !matches!(present, Ok(true)))
            .map(|(index, _)| index);
        Ok(MissingParts::from_indices(
            missing,
            meta.erasure_codec.data_part_count(),
        ))
    }

    /// Report chunks missing data parts and chunks missing parity parts
    pub async fn scan(&self) -> Result<ErasureHealth> {
        let mut health = ErasureHealth::default();
        for meta in self.erasure_chunks() {
            let missing = self.missing_parts(&meta).await?;
            if missing.has_missing_data() {
                health.data_missing_chunks.push(meta.id);
            }
            if missing.has_missing_parity() {
                health.parity_missing_chunks.push(meta.id);
            }
        }
        Ok(health)
    }

    /// Rebuild missing parts onto fresh nodes wherever enough parts remain
    pub async fn repair(&self) -> Result<RepairReport> {
        let mut report = RepairReport::default();
        for meta in self.erasure_chunks() {
            let missing = self.missing_parts(&meta).await?;
            if missing.is_empty() {
                continue;
            }
            match self.repair_chunk(&meta, &missing).await {
                Ok(()) => report.repaired.push(meta.id),
                Err(e) => {
                    warn!("Cannot repair chunk {}: {e}", meta.id);
                    report.unrecoverable.push(meta.id);
                }
            }
        }
        Ok(report)
    }

    async fn repair_chunk(&self, meta: &ChunkMeta, missing: &MissingParts) -> Result<()> {
        let config = meta
            .erasure_codec
            .erasure_config()
            .ok_or_else(|| Error::internal(format!("chunk {} is not erasure coded", meta.id)))?;
        let codec = ErasureCodec::new(config)?;
        let ChunkLayout::Erasure { parts } = &meta.layout else {
            return Err(Error::internal(format!("chunk {} is not erasure coded", meta.id)));
        };

        let lost: Vec<usize> = missing
            .data
            .iter()
            .chain(&missing.parity)
            .copied()
            .collect();
        let mut available: Vec<bool> = (0..parts.len()).map(|i| !lost.contains(&i)).collect();
        if !codec.can_reconstruct(&available) {
            return Err(Error::DataUnavailable {
                chunk_id: meta.id,
                missing: missing.clone(),
            });
        }

        let mut block_sizes = Vec::with_capacity(meta.block_count());
        let mut ranges = Vec::with_capacity(meta.block_count());
        for (block_index, size) in meta.block_sizes.iter().enumerate() {
            let size = usize::try_from(*size)
                .map_err(|_| Error::internal("block size does not fit in usize"))?;
            block_sizes.push(size);
            ranges.push(FragmentRange {
                block_index: u32::try_from(block_index)
                    .map_err(|_| Error::internal("block index out of range"))?,
                offset: 0,
                length: codec.part_size(size) as u64,
            });
        }

        let mut reads = Vec::new();
        for (index, node) in parts.iter().enumerate() {
            if available[index] {
                let key = part_key(meta.id, index)?;
                let ranges = &ranges;
                reads.push(async move {
                    (index, self.ctx.backend.read_fragments(*node, key, ranges).await)
                });
            }
        }
        let mut fetched: Vec<Option<Vec<Bytes>>> = vec![None; parts.len()];
        for (index, result) in join_all(reads).await {
            match result {
                Ok(blocks) => fetched[index] = Some(blocks),
                Err(e) => {
                    warn!("Part {index} of chunk {} became unreadable: {e}", meta.id);
                    available[index] = false;
                }
            }
        }
        if !codec.can_reconstruct(&available) {
            return Err(Error::DataUnavailable {
                chunk_id: meta.id,
                missing: MissingParts::from_indices(
                    available
                        .iter()
                        .enumerate()
                        .filter(|(_, present)| !**present)
                        .map(|(index, _)| index),
                    codec.data_parts(),
                ),
            });
        }

        let lost: Vec<usize> = (0..parts.len()).filter(|i| !available[*i]).collect();
        let mut rebuilt: Vec<Vec<Bytes>> = vec![Vec::with_capacity(block_sizes.len()); lost.len()];
        for (position, block_size) in block_sizes.iter().enumerate() {
            let block_parts: Vec<Option<Bytes>> = fetched
                .iter()
                .map(|part| part.as_ref().map(|blocks| blocks[position].clone()))
                .collect();
            let all_parts = codec.reconstruct(&block_parts, *block_size)?;
            for (slot, index) in lost.iter().enumerate() {
                rebuilt[slot].push(all_parts[*index].clone());
            }
        }

        let targets = self.ctx.select_nodes(&meta.id, lost.len(), parts)?;
        let mut writes = Vec::with_capacity(lost.len());
        for ((index, node), blocks) in lost.iter().zip(&targets).zip(rebuilt) {
            let key = part_key(meta.id, *index)?;
            writes.push(self.ctx.backend.append_blocks(*node, key, blocks));
        }
        for result in join_all(writes).await {
            result?;
        }

        let mut new_parts = parts.clone();
        for (index, node) in lost.iter().zip(&targets) {
            new_parts[*index] = *node;
        }
        self.ctx
            .ledger
            .update_layout(meta.id, ChunkLayout::Erasure { parts: new_parts })?;
        info!(chunk_id = %meta.id, parts = ?lost, "Repaired erasure chunk");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryChunkBackend;
    use crate::reader::{HunkChunkReader, ReadHunkRequest};
    use crate::writer::{JournalChunkWriter, write_blob_chunk};
    use hunkstore_common::{ErasureCodecId, HunkStoreConfig};
    use hunkstore_placement::ClusterTopology;
    use std::sync::Arc;

    async fn erasure_chunk() -> (StorageContext, Arc<MemoryChunkBackend>, ChunkId, Vec<u8>) {
        let (ctx, backend) =
            StorageContext::in_memory(HunkStoreConfig::default(), ClusterTopology::with_nodes(12, 4))
                .unwrap();
        let data: Vec<u8> = (0..3000u32).map(|i| (i * 7 % 256) as u8).collect();
        let codec: ErasureCodecId = "reed_solomon_6_3".parse().unwrap();
        let chunk_id = write_blob_chunk(&ctx, codec, Bytes::from(data.clone()))
            .await
            .unwrap();
        (ctx, backend, chunk_id, data)
    }

    #[tokio::test]
    async fn test_healthy_chunk() {
        let (ctx, _backend, _chunk_id, _data) = erasure_chunk().await;
        let repairer = ChunkRepairer::new(ctx);
        assert!(repairer.scan().await.unwrap().is_healthy());
        assert_eq!(repairer.repair().await.unwrap(), RepairReport::default());
    }

    #[tokio::test]
    async fn test_repair_restores_missing_parts() {
        let (ctx, backend, chunk_id, data) = erasure_chunk().await;
        let parts = ctx.ledger.chunk_meta(chunk_id).unwrap().layout.nodes().to_vec();
        for index in [0, 1, 4] {
            backend.ban_node(parts[index]);
        }

        let repairer = ChunkRepairer::new(ctx.clone());
        let health = repairer.scan().await.unwrap();
        assert_eq!(health.data_missing_chunks, vec![chunk_id]);
        assert!(health.parity_missing_chunks.is_empty());

        let report = repairer.repair().await.unwrap();
        assert_eq!(report.repaired, vec![chunk_id]);
        assert!(repairer.scan().await.unwrap().is_healthy());

        let new_parts = ctx.ledger.chunk_meta(chunk_id).unwrap().layout.nodes().to_vec();
        for index in [0, 1, 4] {
            assert!(!parts.contains(&new_parts[index]));
        }

        let reader = HunkChunkReader::new(ctx).unwrap();
        let responses = reader
            .read_hunks(&[ReadHunkRequest::new(chunk_id, 0, 0, 3000)])
            .await;
        assert_eq!(responses[0].as_ref().unwrap().as_ref(), data.as_slice());
        assert_eq!(reader.statistics().backend_read_request_count, 6);
    }

    #[tokio::test]
    async fn test_unrecoverable_chunk_reported_in_both_lists() {
        let (ctx, backend, chunk_id, _data) = erasure_chunk().await;
        let parts = ctx.ledger.chunk_meta(chunk_id).unwrap().layout.nodes().to_vec();
        for index in [0, 1, 2, 8] {
            backend.ban_node(parts[index]);
        }

        let repairer = ChunkRepairer::new(ctx.clone());
        let report = repairer.repair().await.unwrap();
        assert_eq!(report.unrecoverable, vec![chunk_id]);

        let health = repairer.scan().await.unwrap();
        assert_eq!(health.data_missing_chunks, vec![chunk_id]);
        assert_eq!(health.parity_missing_chunks, vec![chunk_id]);

        let reader = HunkChunkReader::new(ctx).unwrap();
        let responses = reader
            .read_hunks(&[ReadHunkRequest::new(chunk_id, 0, 10, 10)])
            .await;
        assert!(matches!(responses[0], Err(Error::DataUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_open_journal_chunk_repaired_after_seal() {
        let (ctx, backend) =
            StorageContext::in_memory(HunkStoreConfig::default(), ClusterTopology::with_nodes(12, 4))
                .unwrap();
        let codec: ErasureCodecId = "reed_solomon_6_3".parse().unwrap();
        let mut journal = JournalChunkWriter::create(&ctx, codec).unwrap();
        let chunk_id = journal.chunk_id();
        journal
            .append_hunks(&ctx, &[Bytes::from_static(b"first")])
            .await
            .unwrap();
        let parts = ctx.ledger.chunk_meta(chunk_id).unwrap().layout.nodes().to_vec();
        backend.ban_node(parts[2]);

        let repairer = ChunkRepairer::new(ctx.clone());
        assert!(repairer.scan().await.unwrap().is_healthy());
        assert_eq!(repairer.repair().await.unwrap(), RepairReport::default());
        assert_eq!(
            ctx.ledger.chunk_meta(chunk_id).unwrap().layout.nodes(),
            parts.as_slice()
        );
        assert!(matches!(
            ctx.ledger
                .update_layout(chunk_id, ChunkLayout::Erasure { parts: parts.clone() }),
            Err(Error::InvalidState(_))
        ));

        // Appends still target the placed layout
        backend.unban_node(parts[2]);
        journal
            .append_hunks(&ctx, &[Bytes::from_static(b"second")])
            .await
            .unwrap();
        journal.seal(&ctx).unwrap();

        backend.ban_node(parts[2]);
        let report = repairer.repair().await.unwrap();
        assert_eq!(report.repaired, vec![chunk_id]);
        let new_parts = ctx.ledger.chunk_meta(chunk_id).unwrap().layout.nodes().to_vec();
        assert_ne!(new_parts[2], parts[2]);
        assert!(repairer.scan().await.unwrap().is_healthy());
    }
}
