//! Hunk chunk reader
//!
//! `read_hunks` validates every request on its own, groups the valid ones by
//! chunk and splits each group into backend batches bounded by
//! `max_hunk_count_per_read` and `max_total_hunk_length_per_read`. Batches
//! run concurrently under the in-flight fragment count/length limits.
//!
//! Replicated chunks are read from one replica at a time, failing over to
//! the next. Erasure-coded chunks are read directly from the data parts;
//! when a data part cannot be read the affected blocks are rebuilt from any
//! decodable subset of parts. With hedging enabled a slow primary read is
//! raced against a backup: the next replica, or a reconstruction read.
//!
//! A failure only affects the requests it concerns; the rest of the batch
//! still succeeds.

use crate::backend::{ChunkBackend, FragmentRange};
use crate::chunk::{ChunkLayout, ChunkMeta};
use crate::context::StorageContext;
use crate::hedging::{HedgedRequest, HedgingCounters, HedgingManager};
use crate::stats::{ReaderCounters, ReaderStatistics};
use crate::value::{HunkRef, decode_hunk_record};
use crate::writer::part_key;
use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use hunkstore_common::{
    Checksum, ChunkId, Error, ErasureCodecId, HunkChunkReaderConfig, MissingParts, NodeId, Result,
};
use hunkstore_erasure::ErasureCodec;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// One read request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadHunkRequest {
    pub chunk_id: ChunkId,
    pub block_index: u32,
    pub block_offset: i64,
    pub length: i64,
    /// Expected codec of the chunk, checked when set
    pub erasure_codec: Option<ErasureCodecId>,
    /// Expected size of the block, checked when set
    pub block_size: Option<u64>,
    /// Treat the bytes as a hunk record: verify and strip its header
    pub parse_header: bool,
}

impl ReadHunkRequest {
    /// Raw read of `length` bytes at `block_offset`
    #[must_use]
    pub const fn new(chunk_id: ChunkId, block_index: u32, block_offset: i64, length: i64) -> Self {
        Self {
            chunk_id,
            block_index,
            block_offset,
            length,
            erasure_codec: None,
            block_size: None,
            parse_header: false,
        }
    }

    /// Read of the payload addressed by a hunk reference
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn from_ref(hunk_ref: &HunkRef) -> Self {
        Self {
            chunk_id: hunk_ref.chunk_id,
            block_index: hunk_ref.block_index,
            block_offset: hunk_ref.block_offset as i64,
            length: hunk_ref.record_length() as i64,
            erasure_codec: None,
            block_size: None,
            parse_header: true,
        }
    }

    #[must_use]
    pub const fn with_erasure_codec(mut self, erasure_codec: ErasureCodecId) -> Self {
        self.erasure_codec = Some(erasure_codec);
        self
    }

    #[must_use]
    pub const fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = Some(block_size);
        self
    }
}

struct ValidRead {
    index: usize,
    fragment: FragmentRange,
    parse_header: bool,
}

fn validate(meta: Option<&Arc<ChunkMeta>>, request: &ReadHunkRequest) -> Result<FragmentRange> {
    let meta = meta.ok_or_else(|| Error::InvalidChunkId(request.chunk_id.to_string()))?;

    if request.block_offset < 0 || request.length < 0 {
        return Err(Error::InvalidRange {
            offset: request.block_offset,
            length: request.length,
        });
    }
    if let Some(expected) = request.erasure_codec
        && expected != meta.erasure_codec
    {
        return Err(Error::invalid_argument(format!(
            "chunk {} uses codec {}, request expects {expected}",
            meta.id, meta.erasure_codec
        )));
    }

    let block_size = meta
        .block_size(request.block_index)
        .ok_or(Error::InvalidBlockIndex {
            chunk_id: meta.id,
            block_index: request.block_index,
            block_count: meta.block_count(),
        })?;
    if let Some(expected) = request.block_size
        && expected != block_size
    {
        return Err(Error::invalid_argument(format!(
            "block {} of chunk {} has {block_size} bytes, request expects {expected}",
            request.block_index, meta.id
        )));
    }

    #[allow(clippy::cast_sign_loss)]
    let (offset, length) = (request.block_offset as u64, request.length as u64);
    if length > 0 && offset.saturating_add(length) > block_size {
        return Err(Error::OutOfRange {
            offset,
            length,
            block_size,
        });
    }

    Ok(FragmentRange {
        block_index: request.block_index,
        offset,
        length,
    })
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::internal(format!("{value} does not fit in usize")))
}

/// Backend access shared by primary and backup reads
#[derive(Clone)]
struct FragmentFetcher {
    backend: Arc<dyn ChunkBackend>,
    counters: Arc<ReaderCounters>,
}

impl FragmentFetcher {
    async fn read_part(
        &self,
        node: NodeId,
        chunk_id: ChunkId,
        part_index: usize,
        fragments: &[FragmentRange],
    ) -> Result<Vec<Bytes>> {
        let key = part_key(chunk_id, part_index)?;
        let result = self.backend.read_fragments(node, key, fragments).await;
        let transmitted = result
            .as_ref()
            .map_or(0, |data| data.iter().map(|b| b.len() as u64).sum());
        self.counters.on_backend_read(transmitted);
        let data = result?;
        if data.len() != fragments.len() {
            return Err(Error::internal(format!(
                "node {node} returned {} of {} fragments of chunk {chunk_id} part {part_index}",
                data.len(),
                fragments.len()
            )));
        }
        Ok(data)
    }

    /// Try replicas in order until one answers
    async fn read_replicated(
        self,
        chunk_id: ChunkId,
        replicas: Vec<NodeId>,
        fragments: Arc<[FragmentRange]>,
    ) -> Result<Vec<Bytes>> {
        for node in &replicas {
            match self.read_part(*node, chunk_id, 0, &fragments).await {
                Ok(data) => return Ok(data),
                Err(e) => debug!(chunk_id = %chunk_id, node = %node, "Replica read failed: {e}"),
            }
        }
        warn!(chunk_id = %chunk_id, "No replica could serve the read");
        Err(Error::DataUnavailable {
            chunk_id,
            missing: MissingParts::from_indices([0], 1),
        })
    }

    /// Read data part slices, rebuilding blocks if any data part fails
    async fn read_erasure_direct(
        self,
        meta: Arc<ChunkMeta>,
        codec: Arc<ErasureCodec>,
        fragments: Arc<[FragmentRange]>,
    ) -> Result<Vec<Bytes>> {
        let ChunkLayout::Erasure { parts } = &meta.layout else {
            return Err(Error::internal(format!("chunk {} is not erasure coded", meta.id)));
        };

        let mut plan: BTreeMap<usize, Vec<FragmentRange>> = BTreeMap::new();
        let mut pieces: Vec<Vec<(usize, usize)>> = Vec::with_capacity(fragments.len());
        for fragment in fragments.iter() {
            let block_size = meta.block_size(fragment.block_index).unwrap_or_default();
            let mut fragment_pieces = Vec::new();
            for slice in codec.map_range(
                to_usize(block_size)?,
                to_usize(fragment.offset)?,
                to_usize(fragment.length)?,
            ) {
                let ranges = plan.entry(slice.part_index).or_default();
                fragment_pieces.push((slice.part_index, ranges.len()));
                ranges.push(FragmentRange {
                    block_index: fragment.block_index,
                    offset: slice.offset as u64,
                    length: slice.length as u64,
                });
            }
            pieces.push(fragment_pieces);
        }

        if let Some(part_index) = plan.keys().find(|index| **index >= parts.len()) {
            return Err(Error::internal(format!(
                "chunk {} has no part {part_index}",
                meta.id
            )));
        }
        let reads = plan.iter().map(|(part_index, ranges)| {
            let fetch = self.read_part(parts[*part_index], meta.id, *part_index, ranges);
            async move { (*part_index, fetch.await) }
        });
        let results = join_all(reads).await;
        let mut slices: HashMap<usize, Vec<Bytes>> = HashMap::new();
        for (part_index, result) in results {
            match result {
                Ok(data) => {
                    slices.insert(part_index, data);
                }
                Err(e) => {
                    debug!(
                        chunk_id = %meta.id,
                        part_index,
                        "Data part read failed, reconstructing: {e}"
                    );
                    return self.read_erasure_reconstruct(meta, codec, fragments).await;
                }
            }
        }

        let slice = |part_index: &usize, position: &usize| {
            slices
                .get(part_index)
                .and_then(|data| data.get(*position))
                .ok_or_else(|| {
                    Error::internal(format!(
                        "missing slice {position} of chunk {} part {part_index}",
                        meta.id
                    ))
                })
        };
        pieces
            .iter()
            .map(|fragment_pieces| match fragment_pieces.as_slice() {
                [] => Ok(Bytes::new()),
                [(part_index, position)] => slice(part_index, position).cloned(),
                many => {
                    let mut out = BytesMut::new();
                    for (part_index, position) in many {
                        out.extend_from_slice(slice(part_index, position)?);
                    }
                    Ok(out.freeze())
                }
            })
            .collect()
    }

    /// Rebuild every block touched by `fragments` from any decodable subset of parts
    async fn read_erasure_reconstruct(
        self,
        meta: Arc<ChunkMeta>,
        codec: Arc<ErasureCodec>,
        fragments: Arc<[FragmentRange]>,
    ) -> Result<Vec<Bytes>> {
        let ChunkLayout::Erasure { parts } = &meta.layout else {
            return Err(Error::internal(format!("chunk {} is not erasure coded", meta.id)));
        };

        let blocks: Vec<u32> = fragments
            .iter()
            .map(|f| f.block_index)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut block_sizes = Vec::with_capacity(blocks.len());
        let mut part_ranges = Vec::with_capacity(blocks.len());
        for block_index in &blocks {
            let block_size = to_usize(meta.block_size(*block_index).unwrap_or_default())?;
            block_sizes.push(block_size);
            part_ranges.push(FragmentRange {
                block_index: *block_index,
                offset: 0,
                length: codec.part_size(block_size) as u64,
            });
        }

        let mut available: Vec<Option<Vec<Bytes>>> = vec![None; parts.len()];
        {
            let mut pending: FuturesUnordered<_> = parts
                .iter()
                .enumerate()
                .map(|(part_index, node)| {
                    let fetch = self.read_part(*node, meta.id, part_index, &part_ranges);
                    async move { (part_index, fetch.await) }
                })
                .collect();

            while let Some((part_index, result)) = pending.next().await {
                match result {
                    Ok(data) => available[part_index] = Some(data),
                    Err(e) => debug!(chunk_id = %meta.id, part_index, "Part read failed: {e}"),
                }
                let mask: Vec<bool> = available.iter().map(Option::is_some).collect();
                if codec.can_reconstruct(&mask) {
                    break;
                }
            }
        }

        let mask: Vec<bool> = available.iter().map(Option::is_some).collect();
        if !codec.can_reconstruct(&mask) {
            let missing = MissingParts::from_indices(
                mask.iter()
                    .enumerate()
                    .filter(|(_, present)| !**present)
                    .map(|(index, _)| index),
                codec.data_parts(),
            );
            warn!(chunk_id = %meta.id, "Chunk is unreadable, missing {missing}");
            return Err(Error::DataUnavailable {
                chunk_id: meta.id,
                missing,
            });
        }

        let mut decoded: HashMap<u32, Bytes> = HashMap::with_capacity(blocks.len());
        for (position, block_index) in blocks.iter().enumerate() {
            let block_parts: Vec<Option<Bytes>> = available
                .iter()
                .map(|part| part.as_ref().map(|data| data[position].clone()))
                .collect();
            let block = codec.decode_block(&block_parts, block_sizes[position])?;

            if let Some(expected) = meta.block_checksums.get(*block_index as usize)
                && !expected.verify_full(&block)
            {
                return Err(Error::ChecksumMismatch {
                    expected: expected.xxhash64,
                    actual: Checksum::compute(&block).xxhash64,
                });
            }
            decoded.insert(*block_index, block);
        }

        fragments
            .iter()
            .map(|fragment| {
                let block = decoded
                    .get(&fragment.block_index)
                    .ok_or_else(|| Error::internal("decoded block is missing"))?;
                let start = to_usize(fragment.offset)?;
                let end = start + to_usize(fragment.length)?;
                Ok(block.slice(start..end))
            })
            .collect()
    }
}

/// Batched, hedged reader of hunk chunks
pub struct HunkChunkReader {
    ctx: StorageContext,
    config: HunkChunkReaderConfig,
    hedging: HedgedRequest,
    hedging_manager: Option<Arc<HedgingManager>>,
    inflight_count: Semaphore,
    inflight_length: Semaphore,
    fetcher: FragmentFetcher,
}

impl HunkChunkReader {
    /// Reader configured from `ctx.config.hunk_chunk_reader`
    pub fn new(ctx: StorageContext) -> Result<Self> {
        let config = ctx.config.hunk_chunk_reader.clone();
        config.validate()?;

        let hedging_manager = config
            .hedging_manager
            .as_ref()
            .map(HedgingManager::new)
            .transpose()?
            .map(Arc::new);
        let hedging = HedgedRequest::new(
            hedging_manager.clone(),
            config.fragment_read_hedging_delay(),
        );

        let count_permits = config.max_inflight_fragment_count.min(Semaphore::MAX_PERMITS);
        let length_permits = usize::try_from(config.max_inflight_fragment_length)
            .unwrap_or(usize::MAX)
            .min(Semaphore::MAX_PERMITS);

        Ok(Self {
            fetcher: FragmentFetcher {
                backend: Arc::clone(&ctx.backend),
                counters: Arc::new(ReaderCounters::default()),
            },
            ctx,
            config,
            hedging,
            hedging_manager,
            inflight_count: Semaphore::new(count_permits),
            inflight_length: Semaphore::new(length_permits),
        })
    }

    #[must_use]
    pub fn statistics(&self) -> ReaderStatistics {
        self.fetcher.counters.snapshot()
    }

    /// Primary/backup counters, when a hedging manager is configured
    #[must_use]
    pub fn hedging_counters(&self) -> Option<HedgingCounters> {
        self.hedging_manager.as_ref().map(|m| m.counters())
    }

    /// Serve a batch of requests; one response per request, in order
    pub async fn read_hunks(&self, requests: &[ReadHunkRequest]) -> Vec<Result<Bytes>> {
        let mut responses: Vec<Option<Result<Bytes>>> = (0..requests.len()).map(|_| None).collect();
        let mut metas: HashMap<ChunkId, Option<Arc<ChunkMeta>>> = HashMap::new();
        let mut groups: BTreeMap<ChunkId, Vec<ValidRead>> = BTreeMap::new();

        for (index, request) in requests.iter().enumerate() {
            let meta = metas
                .entry(request.chunk_id)
                .or_insert_with(|| self.ctx.ledger.chunk_meta(request.chunk_id));
            match validate(meta.as_ref(), request) {
                Ok(fragment) if fragment.length == 0 => responses[index] = Some(Ok(Bytes::new())),
                Ok(fragment) => groups.entry(request.chunk_id).or_default().push(ValidRead {
                    index,
                    fragment,
                    parse_header: request.parse_header,
                }),
                Err(e) => {
                    debug!(chunk_id = %request.chunk_id, "Rejected read request: {e}");
                    responses[index] = Some(Err(e));
                }
            }
        }

        let mut batches = Vec::new();
        for (chunk_id, reads) in groups {
            let Some(Some(meta)) = metas.get(&chunk_id) else {
                continue;
            };
            for batch in self.split_batches(reads) {
                batches.push(self.read_batch(Arc::clone(meta), batch));
            }
        }

        for (index, result) in join_all(batches).await.into_iter().flatten() {
            responses[index] = Some(result);
        }

        responses
            .into_iter()
            .map(|response| {
                let response =
                    response.unwrap_or_else(|| Err(Error::internal("read request was not served")));
                if let Ok(payload) = &response {
                    self.fetcher.counters.on_response(payload.len() as u64);
                }
                response
            })
            .collect()
    }

    /// Serve requests resolved from the rows of `store_chunk_id`
    ///
    /// Fails every request with `ConcurrentRewrite` if the store chunk stops
    /// being live before or while the hunks are read.
    pub async fn read_hunks_for_store(
        &self,
        store_chunk_id: ChunkId,
        requests: &[ReadHunkRequest],
    ) -> Vec<Result<Bytes>> {
        let rewritten = || -> Vec<Result<Bytes>> {
            (0..requests.len())
                .map(|_| Err(Error::ConcurrentRewrite(store_chunk_id)))
                .collect()
        };

        if !self.ctx.ledger.is_live_store_chunk(store_chunk_id) {
            return rewritten();
        }
        let responses = self.read_hunks(requests).await;
        if !self.ctx.ledger.is_live_store_chunk(store_chunk_id) {
            warn!(chunk_id = %store_chunk_id, "Store chunk was rewritten during hunk read");
            return rewritten();
        }
        responses
    }

    fn split_batches(&self, reads: Vec<ValidRead>) -> Vec<Vec<ValidRead>> {
        let mut batches: Vec<Vec<ValidRead>> = Vec::new();
        let mut current: Vec<ValidRead> = Vec::new();
        let mut current_length = 0u64;

        for read in reads {
            let full = current.len() >= self.config.max_hunk_count_per_read
                || (!current.is_empty()
                    && current_length + read.fragment.length
                        > self.config.max_total_hunk_length_per_read);
            if full {
                batches.push(std::mem::take(&mut current));
                current_length = 0;
            }
            current_length += read.fragment.length;
            current.push(read);
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    async fn read_batch(
        &self,
        meta: Arc<ChunkMeta>,
        batch: Vec<ValidRead>,
    ) -> Vec<(usize, Result<Bytes>)> {
        let fragments: Arc<[FragmentRange]> = batch.iter().map(|r| r.fragment).collect();
        let total_length: u64 = fragments.iter().map(|f| f.length).sum();

        let count_permits = u32::try_from(fragments.len().min(self.config.max_inflight_fragment_count))
            .unwrap_or(u32::MAX);
        let length_permits =
            u32::try_from(total_length.min(self.config.max_inflight_fragment_length))
                .unwrap_or(u32::MAX);

        let result = async {
            let _count = self
                .inflight_count
                .acquire_many(count_permits)
                .await
                .map_err(|_| Error::Canceled)?;
            let _length = self
                .inflight_length
                .acquire_many(length_permits)
                .await
                .map_err(|_| Error::Canceled)?;
            self.fetch(meta, fragments).await
        }
        .await;

        match result {
            Ok(data) => batch
                .into_iter()
                .zip(data)
                .map(|(read, bytes)| {
                    let payload = if read.parse_header {
                        decode_hunk_record(&bytes)
                    } else {
                        Ok(bytes)
                    };
                    (read.index, payload)
                })
                .collect(),
            Err(e) => batch
                .into_iter()
                .map(|read| (read.index, Err(e.duplicate())))
                .collect(),
        }
    }

    async fn fetch(&self, meta: Arc<ChunkMeta>, fragments: Arc<[FragmentRange]>) -> Result<Vec<Bytes>> {
        match (&meta.layout, meta.erasure_codec.erasure_config()) {
            (ChunkLayout::Replicated { replicas }, None) => {
                let primary = self.fetcher.clone().read_replicated(
                    meta.id,
                    replicas.clone(),
                    Arc::clone(&fragments),
                );
                if replicas.len() < 2 || !self.hedging.is_enabled() {
                    return primary.await;
                }

                let mut rotated = replicas.clone();
                rotated.rotate_left(1);
                let fetcher = self.fetcher.clone();
                let chunk_id = meta.id;
                self.hedging
                    .run(primary, move |_token| {
                        fetcher.read_replicated(chunk_id, rotated, fragments)
                    })
                    .await
            }
            (ChunkLayout::Erasure { .. }, Some(config)) => {
                let codec = Arc::new(ErasureCodec::new(config)?);
                let primary = self.fetcher.clone().read_erasure_direct(
                    Arc::clone(&meta),
                    Arc::clone(&codec),
                    Arc::clone(&fragments),
                );
                if !self.hedging.is_enabled() {
                    return primary.await;
                }

                let fetcher = self.fetcher.clone();
                let backup_meta = Arc::clone(&meta);
                self.hedging
                    .run(primary, move |_token| {
                        fetcher.read_erasure_reconstruct(backup_meta, codec, fragments)
                    })
                    .await
            }
            _ => Err(Error::internal(format!(
                "layout of chunk {} does not match codec {}",
                meta.id, meta.erasure_codec
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryChunkBackend;
    use crate::writer::{HunkChunkWriter, write_blob_chunk};
    use hunkstore_common::HunkStoreConfig;
    use hunkstore_placement::ClusterTopology;

    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

    fn context(config: HunkStoreConfig) -> (StorageContext, Arc<MemoryChunkBackend>) {
        StorageContext::in_memory(config, ClusterTopology::with_nodes(12, 4)).unwrap()
    }

    /// Answers reads from chosen nodes with no fragments at all
    #[derive(Default)]
    struct ShortReadBackend {
        inner: MemoryChunkBackend,
        short: parking_lot::Mutex<std::collections::HashSet<NodeId>>,
    }

    #[async_trait::async_trait]
    impl ChunkBackend for ShortReadBackend {
        async fn append_blocks(
            &self,
            node: NodeId,
            part: crate::backend::PartKey,
            blocks: Vec<Bytes>,
        ) -> Result<()> {
            self.inner.append_blocks(node, part, blocks).await
        }

        async fn read_fragments(
            &self,
            node: NodeId,
            part: crate::backend::PartKey,
            fragments: &[FragmentRange],
        ) -> Result<Vec<Bytes>> {
            if self.short.lock().contains(&node) {
                return Ok(Vec::new());
            }
            self.inner.read_fragments(node, part, fragments).await
        }

        async fn has_part(&self, node: NodeId, part: crate::backend::PartKey) -> Result<bool> {
            self.inner.has_part(node, part).await
        }

        async fn remove_part(&self, node: NodeId, part: crate::backend::PartKey) -> Result<()> {
            self.inner.remove_part(node, part).await
        }
    }

    #[tokio::test]
    async fn test_short_backend_responses_fail_the_part() {
        let backend = Arc::new(ShortReadBackend::default());
        let ctx = StorageContext::new(
            HunkStoreConfig::default(),
            Arc::clone(&backend) as Arc<dyn ChunkBackend>,
            ClusterTopology::with_nodes(12, 4),
        )
        .unwrap();
        let replicated = write_blob_chunk(&ctx, ErasureCodecId::None, Bytes::from_static(ALPHABET))
            .await
            .unwrap();
        let codec: ErasureCodecId = "reed_solomon_6_3".parse().unwrap();
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let erasure = write_blob_chunk(&ctx, codec, Bytes::from(data.clone()))
            .await
            .unwrap();
        let reader = HunkChunkReader::new(ctx.clone()).unwrap();

        let replicas = ctx.ledger.chunk_meta(replicated).unwrap().layout.nodes().to_vec();
        let parts = ctx.ledger.chunk_meta(erasure).unwrap().layout.nodes().to_vec();
        backend.short.lock().insert(replicas[0]);
        backend.short.lock().insert(parts[0]);

        let responses = reader
            .read_hunks(&[
                ReadHunkRequest::new(replicated, 0, 0, 3),
                ReadHunkRequest::new(erasure, 0, 0, 500),
            ])
            .await;
        assert_eq!(responses[0].as_ref().unwrap().as_ref(), b"abc");
        assert_eq!(responses[1].as_ref().unwrap().as_ref(), &data[..500]);

        backend.short.lock().extend(replicas.iter().copied());
        let responses = reader
            .read_hunks(&[ReadHunkRequest::new(replicated, 0, 0, 3)])
            .await;
        assert!(matches!(responses[0], Err(Error::DataUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_read_blob_ranges() {
        let (ctx, _backend) = context(HunkStoreConfig::default());
        let chunk_id = write_blob_chunk(&ctx, ErasureCodecId::None, Bytes::from_static(ALPHABET))
            .await
            .unwrap();
        let reader = HunkChunkReader::new(ctx).unwrap();

        let responses = reader
            .read_hunks(&[
                ReadHunkRequest::new(chunk_id, 0, 0, 26),
                ReadHunkRequest::new(chunk_id, 0, 5, 0),
                ReadHunkRequest::new(chunk_id, 0, 10, 3),
            ])
            .await;
        assert_eq!(responses[0].as_ref().unwrap().as_ref(), ALPHABET);
        assert!(responses[1].as_ref().unwrap().is_empty());
        assert_eq!(responses[2].as_ref().unwrap().as_ref(), b"klm");
        assert_eq!(reader.statistics().backend_read_request_count, 1);
        assert_eq!(reader.statistics().data_weight, 29);
    }

    #[tokio::test]
    async fn test_invalid_requests_fail_individually() {
        let (ctx, _backend) = context(HunkStoreConfig::default());
        let chunk_id = write_blob_chunk(&ctx, ErasureCodecId::None, Bytes::from_static(ALPHABET))
            .await
            .unwrap();
        let reader = HunkChunkReader::new(ctx).unwrap();

        let responses = reader
            .read_hunks(&[
                ReadHunkRequest::new(ChunkId::new(), 0, 0, 1),
                ReadHunkRequest::new(chunk_id, 0, -100, 1),
                ReadHunkRequest::new(chunk_id, 0, 0, -1),
                ReadHunkRequest::new(chunk_id, 0, 100, 1),
                ReadHunkRequest::new(chunk_id, 0, 0, 100),
                ReadHunkRequest::new(chunk_id, 100, 0, 1),
                ReadHunkRequest::new(chunk_id, 0, 1, 2),
            ])
            .await;

        assert!(matches!(responses[0], Err(Error::InvalidChunkId(_))));
        assert!(matches!(responses[1], Err(Error::InvalidRange { .. })));
        assert!(matches!(responses[2], Err(Error::InvalidRange { .. })));
        assert!(matches!(responses[3], Err(Error::OutOfRange { .. })));
        assert!(matches!(responses[4], Err(Error::OutOfRange { .. })));
        assert!(matches!(responses[5], Err(Error::InvalidBlockIndex { .. })));
        assert_eq!(responses[6].as_ref().unwrap().as_ref(), b"bc");
    }

    #[tokio::test]
    async fn test_hint_mismatch_rejected() {
        let (ctx, _backend) = context(HunkStoreConfig::default());
        let chunk_id = write_blob_chunk(&ctx, ErasureCodecId::None, Bytes::from_static(ALPHABET))
            .await
            .unwrap();
        let reader = HunkChunkReader::new(ctx).unwrap();
        let codec: ErasureCodecId = "reed_solomon_6_3".parse().unwrap();

        let responses = reader
            .read_hunks(&[
                ReadHunkRequest::new(chunk_id, 0, 0, 1).with_erasure_codec(codec),
                ReadHunkRequest::new(chunk_id, 0, 0, 1).with_block_size(10),
                ReadHunkRequest::new(chunk_id, 0, 0, 1)
                    .with_erasure_codec(ErasureCodecId::None)
                    .with_block_size(26),
            ])
            .await;
        assert!(matches!(responses[0], Err(Error::InvalidArgument(_))));
        assert!(matches!(responses[1], Err(Error::InvalidArgument(_))));
        assert_eq!(responses[2].as_ref().unwrap().as_ref(), b"a");
    }

    #[tokio::test]
    async fn test_batches_split_by_count_and_length() {
        let mut config = HunkStoreConfig::default();
        config.hunk_chunk_reader.max_hunk_count_per_read = 2;
        config.hunk_chunk_reader.max_total_hunk_length_per_read = 20;
        let (ctx, _backend) = context(config);
        let chunk_id = write_blob_chunk(&ctx, ErasureCodecId::None, Bytes::from_static(ALPHABET))
            .await
            .unwrap();
        let reader = HunkChunkReader::new(ctx).unwrap();

        let requests: Vec<_> = (0..5)
            .map(|i| ReadHunkRequest::new(chunk_id, 0, i * 5, 5))
            .collect();
        let responses = reader.read_hunks(&requests).await;
        assert_eq!(responses[4].as_ref().unwrap().as_ref(), b"uvwxy");
        assert_eq!(reader.statistics().backend_read_request_count, 3);

        let wide = reader
            .read_hunks(&[
                ReadHunkRequest::new(chunk_id, 0, 0, 15),
                ReadHunkRequest::new(chunk_id, 0, 10, 15),
            ])
            .await;
        assert!(wide.iter().all(Result::is_ok));
        assert_eq!(reader.statistics().backend_read_request_count, 5);
    }

    #[tokio::test]
    async fn test_replica_failover() {
        let (ctx, backend) = context(HunkStoreConfig::default());
        let chunk_id = write_blob_chunk(&ctx, ErasureCodecId::None, Bytes::from_static(ALPHABET))
            .await
            .unwrap();
        let replicas = ctx.ledger.chunk_meta(chunk_id).unwrap().layout.nodes().to_vec();
        backend.ban_node(replicas[0]);
        backend.ban_node(replicas[1]);
        let reader = HunkChunkReader::new(ctx).unwrap();

        let responses = reader
            .read_hunks(&[ReadHunkRequest::new(chunk_id, 0, 0, 3)])
            .await;
        assert_eq!(responses[0].as_ref().unwrap().as_ref(), b"abc");

        backend.ban_node(replicas[2]);
        let responses = reader
            .read_hunks(&[ReadHunkRequest::new(chunk_id, 0, 0, 3)])
            .await;
        assert!(matches!(responses[0], Err(Error::DataUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_hunk_records_parsed() {
        let (ctx, _backend) = context(HunkStoreConfig::default());
        let mut writer = HunkChunkWriter::new(ErasureCodecId::None, &ctx.config.hunk_chunk_writer);
        let first = writer.add_hunk(b"first payload").unwrap();
        let second = writer.add_hunk(ALPHABET).unwrap();
        writer.close(&ctx).await.unwrap();
        let reader = HunkChunkReader::new(ctx).unwrap();

        let responses = reader
            .read_hunks(&[
                ReadHunkRequest::from_ref(&second),
                ReadHunkRequest::from_ref(&first),
            ])
            .await;
        assert_eq!(responses[0].as_ref().unwrap().as_ref(), ALPHABET);
        assert_eq!(responses[1].as_ref().unwrap().as_ref(), b"first payload");
    }

    #[tokio::test]
    async fn test_erasure_reconstruction_and_unavailability() {
        let (ctx, backend) = context(HunkStoreConfig::default());
        let codec: ErasureCodecId = "reed_solomon_6_3".parse().unwrap();
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let chunk_id = write_blob_chunk(&ctx, codec, Bytes::from(data.clone()))
            .await
            .unwrap();
        let parts = ctx.ledger.chunk_meta(chunk_id).unwrap().layout.nodes().to_vec();
        let reader = HunkChunkReader::new(ctx).unwrap();

        let request = ReadHunkRequest::new(chunk_id, 0, 300, 900);
        let direct = reader.read_hunks(std::slice::from_ref(&request)).await;
        assert_eq!(direct[0].as_ref().unwrap().as_ref(), &data[300..1200]);

        for index in [0, 1, 4] {
            backend.ban_node(parts[index]);
        }
        let rebuilt = reader.read_hunks(std::slice::from_ref(&request)).await;
        assert_eq!(rebuilt[0].as_ref().unwrap().as_ref(), &data[300..1200]);

        backend.ban_node(parts[8]);
        let lost = reader.read_hunks(std::slice::from_ref(&request)).await;
        match &lost[0] {
            Err(Error::DataUnavailable { missing, .. }) => {
                assert_eq!(missing.data, vec![0, 1, 4]);
                assert_eq!(missing.parity, vec![8]);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hedged_replica_read() {
        let mut config = HunkStoreConfig::default();
        config.hunk_chunk_reader.fragment_read_hedging_delay_ms = Some(10);
        config.hunk_chunk_reader.hedging_manager = Some(hunkstore_common::HedgingManagerConfig {
            max_backup_request_ratio: 1.0,
        });
        let (ctx, backend) = context(config);
        let chunk_id = write_blob_chunk(&ctx, ErasureCodecId::None, Bytes::from_static(ALPHABET))
            .await
            .unwrap();
        let replicas = ctx.ledger.chunk_meta(chunk_id).unwrap().layout.nodes().to_vec();
        backend.set_latency(replicas[0], std::time::Duration::from_secs(10));
        let reader = HunkChunkReader::new(ctx).unwrap();

        let started = tokio::time::Instant::now();
        let responses = reader
            .read_hunks(&[ReadHunkRequest::new(chunk_id, 0, 0, 26)])
            .await;
        assert_eq!(responses[0].as_ref().unwrap().as_ref(), ALPHABET);
        assert!(started.elapsed() < std::time::Duration::from_secs(1));

        let counters = reader.hedging_counters().unwrap();
        assert_eq!(counters.primary_request_count, 1);
        assert_eq!(counters.backup_request_count, 1);
    }
}
