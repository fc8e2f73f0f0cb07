//! Hunk chunk writer
//!
//! Payloads are framed as hunk records and packed into blocks of roughly
//! `desired_block_size` bytes. A record never spans two blocks; a record
//! larger than the desired size gets a block of its own. On close the
//! blocks are replicated or erasure-encoded onto distinct nodes and the
//! chunk is registered with the ledger.

use crate::backend::PartKey;
use crate::chunk::{ChunkKind, ChunkLayout, ChunkMeta, ChunkState, HunkChunkRef};
use crate::context::StorageContext;
use crate::value::{HunkRef, encode_hunk_record};
use bytes::{Bytes, BytesMut};
use futures::future::try_join_all;
use hunkstore_common::{Checksum, ChunkId, Error, ErasureCodecId, HunkChunkWriterConfig, Result};
use hunkstore_erasure::ErasureCodec;
use tracing::{debug, info};

/// Part key of part `index` of a chunk
pub(crate) fn part_key(chunk_id: ChunkId, index: usize) -> Result<PartKey> {
    let part_index = u16::try_from(index)
        .map_err(|_| Error::internal(format!("part index {index} out of range")))?;
    Ok(PartKey::new(chunk_id, part_index))
}

/// Choose the nodes of a new chunk
pub(crate) fn place_chunk(
    ctx: &StorageContext,
    chunk_id: ChunkId,
    erasure_codec: ErasureCodecId,
) -> Result<ChunkLayout> {
    match erasure_codec.erasure_config() {
        Some(config) => Ok(ChunkLayout::Erasure {
            parts: ctx.select_nodes(&chunk_id, config.total_parts(), &[])?,
        }),
        None => Ok(ChunkLayout::Replicated {
            replicas: ctx.select_nodes(
                &chunk_id,
                ctx.config.hunk_chunk_writer.replication_factor,
                &[],
            )?,
        }),
    }
}

/// Append blocks to every part of a chunk, returning the block checksums
pub(crate) async fn store_blocks(
    ctx: &StorageContext,
    chunk_id: ChunkId,
    erasure_codec: ErasureCodecId,
    layout: &ChunkLayout,
    blocks: &[Bytes],
) -> Result<Vec<Checksum>> {
    match (layout, erasure_codec.erasure_config()) {
        (ChunkLayout::Replicated { replicas }, None) => {
            let key = part_key(chunk_id, 0)?;
            try_join_all(
                replicas
                    .iter()
                    .map(|node| ctx.backend.append_blocks(*node, key, blocks.to_vec())),
            )
            .await?;
        }
        (ChunkLayout::Erasure { parts }, Some(config)) => {
            let codec = ErasureCodec::new(config)?;
            if parts.len() != codec.total_parts() {
                return Err(Error::internal(format!(
                    "chunk {chunk_id} has {} part nodes, codec {erasure_codec} needs {}",
                    parts.len(),
                    codec.total_parts()
                )));
            }

            let mut per_part: Vec<Vec<Bytes>> = vec![Vec::with_capacity(blocks.len()); parts.len()];
            for block in blocks {
                for part in codec.encode_block(block)? {
                    per_part[part.index].push(part.data);
                }
            }

            let writes = parts
                .iter()
                .zip(per_part)
                .enumerate()
                .map(|(index, (node, data))| async move {
                    ctx.backend
                        .append_blocks(*node, part_key(chunk_id, index)?, data)
                        .await
                });
            try_join_all(writes).await?;
        }
        _ => {
            return Err(Error::internal(format!(
                "layout of chunk {chunk_id} does not match codec {erasure_codec}"
            )));
        }
    }

    Ok(blocks.iter().map(|b| Checksum::compute(b)).collect())
}

/// Place, write and describe an immutable chunk; the caller registers it
pub(crate) async fn write_sealed_chunk(
    ctx: &StorageContext,
    chunk_id: ChunkId,
    kind: ChunkKind,
    erasure_codec: ErasureCodecId,
    blocks: Vec<Bytes>,
    hunk_count: u64,
    total_hunk_length: u64,
) -> Result<ChunkMeta> {
    let layout = place_chunk(ctx, chunk_id, erasure_codec)?;
    let block_checksums = store_blocks(ctx, chunk_id, erasure_codec, &layout, &blocks).await?;
    let block_sizes: Vec<u64> = blocks.iter().map(|b| b.len() as u64).collect();
    let data_size = block_sizes.iter().sum();

    Ok(ChunkMeta {
        id: chunk_id,
        kind,
        erasure_codec,
        layout,
        block_sizes,
        block_checksums,
        hunk_count,
        total_hunk_length,
        uncompressed_data_size: data_size,
        compressed_data_size: data_size,
    })
}

/// Builds one hunk chunk
///
/// One writer per chunk; the writer is not shared between tasks.
pub struct HunkChunkWriter {
    chunk_id: ChunkId,
    erasure_codec: ErasureCodecId,
    desired_block_size: usize,
    blocks: Vec<Bytes>,
    current: BytesMut,
    hunk_count: u64,
    total_hunk_length: u64,
}

impl HunkChunkWriter {
    #[must_use]
    pub fn new(erasure_codec: ErasureCodecId, config: &HunkChunkWriterConfig) -> Self {
        Self {
            chunk_id: ChunkId::new(),
            erasure_codec,
            desired_block_size: usize::try_from(config.desired_block_size).unwrap_or(usize::MAX),
            blocks: Vec::new(),
            current: BytesMut::new(),
            hunk_count: 0,
            total_hunk_length: 0,
        }
    }

    #[must_use]
    pub const fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    #[must_use]
    pub const fn erasure_codec(&self) -> ErasureCodecId {
        self.erasure_codec
    }

    #[must_use]
    pub const fn hunk_count(&self) -> u64 {
        self.hunk_count
    }

    #[must_use]
    pub const fn total_hunk_length(&self) -> u64 {
        self.total_hunk_length
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.hunk_count == 0
    }

    /// Append a payload and return its address
    pub fn add_hunk(&mut self, payload: &[u8]) -> Result<HunkRef> {
        let record_length = crate::value::HUNK_HEADER_SIZE + payload.len();
        if !self.current.is_empty() && self.current.len() + record_length > self.desired_block_size
        {
            self.seal_block();
        }
        let block_index = u32::try_from(self.blocks.len()).map_err(|_| {
            Error::internal(format!("hunk chunk {} has too many blocks", self.chunk_id))
        })?;

        let block_offset = self.current.len() as u64;
        encode_hunk_record(payload, &mut self.current);
        self.hunk_count += 1;
        self.total_hunk_length += payload.len() as u64;

        Ok(HunkRef {
            chunk_id: self.chunk_id,
            block_index,
            block_offset,
            length: payload.len() as u64,
        })
    }

    fn seal_block(&mut self) {
        if !self.current.is_empty() {
            self.blocks.push(self.current.split().freeze());
        }
    }

    /// Write the chunk out and register it pinned
    ///
    /// Returns `None` when no hunk was added; nothing is written then. The
    /// caller attaches the chunk or unpins it with
    /// [`HunkLedger::unpin_chunk`](crate::ledger::HunkLedger::unpin_chunk).
    pub async fn close(mut self, ctx: &StorageContext) -> Result<Option<HunkChunkRef>> {
        if self.hunk_count == 0 {
            return Ok(None);
        }
        self.seal_block();
        let block_count = self.blocks.len();

        let meta = write_sealed_chunk(
            ctx,
            self.chunk_id,
            ChunkKind::Hunk,
            self.erasure_codec,
            self.blocks,
            self.hunk_count,
            self.total_hunk_length,
        )
        .await?;
        ctx.ledger
            .register_pinned_chunk(meta, ChunkState::Sealed, vec![])?;

        info!(
            chunk_id = %self.chunk_id,
            hunk_count = self.hunk_count,
            total_hunk_length = self.total_hunk_length,
            block_count,
            erasure_codec = %self.erasure_codec,
            "Sealed hunk chunk"
        );
        Ok(Some(HunkChunkRef {
            chunk_id: self.chunk_id,
            hunk_count: self.hunk_count,
            total_hunk_length: self.total_hunk_length,
            erasure_codec: self.erasure_codec,
        }))
    }
}

/// Append-only hunk chunk that stays open across many appends
///
/// Used by hunk storage logs. Every append writes one block and publishes it
/// in the ledger; the chunk is `Building` until sealed.
pub struct JournalChunkWriter {
    chunk_id: ChunkId,
    erasure_codec: ErasureCodecId,
    layout: ChunkLayout,
    block_count: u32,
    broken: bool,
}

impl JournalChunkWriter {
    /// Place and register an empty journal chunk
    pub fn create(ctx: &StorageContext, erasure_codec: ErasureCodecId) -> Result<Self> {
        let chunk_id = ChunkId::new();
        let layout = place_chunk(ctx, chunk_id, erasure_codec)?;
        ctx.ledger.register_chunk(
            ChunkMeta {
                id: chunk_id,
                kind: ChunkKind::Hunk,
                erasure_codec,
                layout: layout.clone(),
                block_sizes: Vec::new(),
                block_checksums: Vec::new(),
                hunk_count: 0,
                total_hunk_length: 0,
                uncompressed_data_size: 0,
                compressed_data_size: 0,
            },
            ChunkState::Building,
            vec![],
        )?;
        debug!(chunk_id = %chunk_id, "Created journal chunk");

        Ok(Self {
            chunk_id,
            erasure_codec,
            layout,
            block_count: 0,
            broken: false,
        })
    }

    #[must_use]
    pub const fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    #[must_use]
    pub const fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Append a raw block and return its index
    pub async fn append_block(
        &mut self,
        ctx: &StorageContext,
        block: Bytes,
        hunk_count: u64,
        total_hunk_length: u64,
    ) -> Result<u32> {
        if self.broken {
            return Err(Error::InvalidState(format!(
                "journal chunk {} failed a previous append",
                self.chunk_id
            )));
        }

        let size = block.len() as u64;
        let checksums = match store_blocks(
            ctx,
            self.chunk_id,
            self.erasure_codec,
            &self.layout,
            std::slice::from_ref(&block),
        )
        .await
        {
            Ok(checksums) => checksums,
            Err(e) => {
                self.broken = true;
                return Err(e);
            }
        };
        ctx.ledger.append_blocks(
            self.chunk_id,
            &[(size, checksums[0])],
            hunk_count,
            total_hunk_length,
        )?;

        let index = self.block_count;
        self.block_count += 1;
        Ok(index)
    }

    /// Frame payloads into one block and append it
    pub async fn append_hunks(
        &mut self,
        ctx: &StorageContext,
        payloads: &[Bytes],
    ) -> Result<Vec<HunkRef>> {
        let mut block = BytesMut::new();
        let mut refs = Vec::with_capacity(payloads.len());
        let mut total_hunk_length = 0;
        for payload in payloads {
            refs.push(HunkRef {
                chunk_id: self.chunk_id,
                block_index: self.block_count,
                block_offset: block.len() as u64,
                length: payload.len() as u64,
            });
            encode_hunk_record(payload, &mut block);
            total_hunk_length += payload.len() as u64;
        }

        self.append_block(ctx, block.freeze(), payloads.len() as u64, total_hunk_length)
            .await?;
        Ok(refs)
    }

    /// Mark the chunk immutable
    pub fn seal(self, ctx: &StorageContext) -> Result<()> {
        ctx.ledger.seal_chunk(self.chunk_id)?;
        debug!(chunk_id = %self.chunk_id, block_count = self.block_count, "Sealed journal chunk");
        Ok(())
    }
}

/// Write a single-block hunk chunk holding `data` verbatim
pub async fn write_blob_chunk(
    ctx: &StorageContext,
    erasure_codec: ErasureCodecId,
    data: Bytes,
) -> Result<ChunkId> {
    let chunk_id = ChunkId::new();
    let length = data.len() as u64;
    let meta = write_sealed_chunk(
        ctx,
        chunk_id,
        ChunkKind::Hunk,
        erasure_codec,
        vec![data],
        1,
        length,
    )
    .await?;
    ctx.ledger.register_chunk(meta, ChunkState::Sealed, vec![])?;
    Ok(chunk_id)
}

/// Write a journal hunk chunk from raw blocks, one append per block, and seal it
pub async fn write_journal_chunk(
    ctx: &StorageContext,
    erasure_codec: ErasureCodecId,
    blocks: Vec<Bytes>,
) -> Result<ChunkId> {
    let mut writer = JournalChunkWriter::create(ctx, erasure_codec)?;
    for block in blocks {
        let length = block.len() as u64;
        writer.append_block(ctx, block, 1, length).await?;
    }
    let chunk_id = writer.chunk_id();
    writer.seal(ctx)?;
    Ok(chunk_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::HUNK_HEADER_SIZE;
    use hunkstore_common::HunkStoreConfig;
    use hunkstore_placement::ClusterTopology;

    fn context() -> (StorageContext, std::sync::Arc<crate::backend::MemoryChunkBackend>) {
        StorageContext::in_memory(HunkStoreConfig::default(), ClusterTopology::with_nodes(12, 4))
            .unwrap()
    }

    #[test]
    fn test_records_packed_into_blocks() {
        let config = HunkChunkWriterConfig {
            desired_block_size: 100,
            ..HunkChunkWriterConfig::default()
        };
        let mut writer = HunkChunkWriter::new(ErasureCodecId::None, &config);

        let refs: Vec<HunkRef> = (0..5).map(|_| writer.add_hunk(&[b'x'; 26]).unwrap()).collect();
        assert_eq!(refs[0].block_index, 0);
        assert_eq!(refs[0].block_offset, 0);
        assert_eq!(refs[1].block_offset, (HUNK_HEADER_SIZE + 26) as u64);
        assert_eq!(refs[2].block_index, 1);
        assert_eq!(refs[2].block_offset, 0);
        assert_eq!(writer.hunk_count(), 5);
        assert_eq!(writer.total_hunk_length(), 130);
    }

    #[test]
    fn test_oversized_record_gets_own_block() {
        let config = HunkChunkWriterConfig {
            desired_block_size: 16,
            ..HunkChunkWriterConfig::default()
        };
        let mut writer = HunkChunkWriter::new(ErasureCodecId::None, &config);
        let first = writer.add_hunk(&[1; 100]).unwrap();
        let second = writer.add_hunk(&[2; 100]).unwrap();
        assert_eq!((first.block_index, first.block_offset), (0, 0));
        assert_eq!((second.block_index, second.block_offset), (1, 0));
    }

    #[tokio::test]
    async fn test_close_registers_replicated_chunk() {
        let (ctx, backend) = context();
        let mut writer = HunkChunkWriter::new(ErasureCodecId::None, &ctx.config.hunk_chunk_writer);
        for _ in 0..10 {
            writer.add_hunk(b"abcdefghijklmnopqrstuvwxyz").unwrap();
        }
        let chunk_id = writer.chunk_id();
        let hunk_ref = writer.close(&ctx).await.unwrap().unwrap();

        assert_eq!(hunk_ref.hunk_count, 10);
        assert_eq!(hunk_ref.total_hunk_length, 260);
        let attrs = ctx.ledger.chunk_attributes(chunk_id).unwrap();
        assert_eq!(attrs.uncompressed_data_size, 340);
        assert_eq!(attrs.ref_counter, 0);
        assert!(ctx.ledger.begin_removal(chunk_id).is_err());
        assert_eq!(backend.stored_part_count(chunk_id), 3);
    }

    #[tokio::test]
    async fn test_close_empty_writer_writes_nothing() {
        let (ctx, backend) = context();
        let writer = HunkChunkWriter::new(ErasureCodecId::None, &ctx.config.hunk_chunk_writer);
        let chunk_id = writer.chunk_id();
        assert!(writer.close(&ctx).await.unwrap().is_none());
        assert!(!ctx.ledger.contains(chunk_id));
        assert_eq!(backend.write_request_count(), 0);
    }

    #[tokio::test]
    async fn test_erasure_parts_on_distinct_nodes() {
        let (ctx, backend) = context();
        let codec: ErasureCodecId = "reed_solomon_6_3".parse().unwrap();
        let chunk_id = write_blob_chunk(&ctx, codec, Bytes::from(vec![7u8; 1000]))
            .await
            .unwrap();

        let meta = ctx.ledger.chunk_meta(chunk_id).unwrap();
        let nodes = meta.layout.nodes();
        assert_eq!(nodes.len(), 9);
        let distinct: std::collections::HashSet<_> = nodes.iter().collect();
        assert_eq!(distinct.len(), 9);
        assert_eq!(backend.stored_part_count(chunk_id), 9);
    }

    #[tokio::test]
    async fn test_journal_chunk_appends_blocks() {
        let (ctx, _backend) = context();
        let chunk_id = write_journal_chunk(
            &ctx,
            ErasureCodecId::None,
            vec![
                Bytes::from_static(b"abc"),
                Bytes::from_static(b"0123456789"),
                Bytes::from_static(b"abcdef"),
            ],
        )
        .await
        .unwrap();

        let attrs = ctx.ledger.chunk_attributes(chunk_id).unwrap();
        assert_eq!(attrs.block_count, 3);
        assert_eq!(attrs.state, ChunkState::Sealed);
        assert_eq!(attrs.total_hunk_length, 19);
    }

    #[tokio::test]
    async fn test_insufficient_nodes() {
        let (ctx, _backend) = context();
        let codec: ErasureCodecId = "lrc_12_2_2".parse().unwrap();
        let err = write_blob_chunk(&ctx, codec, Bytes::from_static(b"data"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientNodes { .. }));
    }
}
