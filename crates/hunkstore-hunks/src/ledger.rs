//! Hunk reference ledger
//!
//! The ledger is the single owner of chunk metadata and of every reference
//! count. Chunks are keyed by opaque [`ChunkId`]s; nothing holds pointers to
//! other chunks.
//!
//! A chunk's `ref_counter` is the number of tablets holding it plus, for hunk
//! chunks, the number of live store chunks whose `hunk_chunk_refs` name it.
//! A store chunk is live while at least one tablet holds a view of it, so the
//! store-to-hunk references are taken on the first attach of a store chunk
//! and released on its last detach. All count changes go through
//! [`LedgerTransaction`]s, which are validated as a whole and then applied
//! under one lock.
//!
//! Chunks that reach zero references and have no owning nodes are reported
//! to the garbage collector once a grace period has passed. Chunks written
//! by flush and compaction are registered pinned: they are not garbage until
//! their first attach, or until the writer gives up on them and unpins them.

use crate::chunk::{ChunkKind, ChunkLayout, ChunkMeta, ChunkState, HunkChunkRef};
use hunkstore_common::{Checksum, ChunkId, Error, Result, TabletId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Ledger lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedgerLifecycle {
    Running,
    /// No new chunks or attachments are accepted; removals continue
    Draining,
}

#[derive(Debug)]
struct ChunkRecord {
    meta: Arc<ChunkMeta>,
    state: ChunkState,
    hunk_chunk_refs: Vec<HunkChunkRef>,
    tablets: HashSet<TabletId>,
    store_referrers: HashSet<ChunkId>,
    owning_nodes: BTreeSet<String>,
    unreferenced_since: Option<Instant>,
    pinned: bool,
    removing: bool,
}

impl ChunkRecord {
    fn ref_counter(&self) -> usize {
        self.tablets.len() + self.store_referrers.len()
    }

    fn is_unreferenced(&self) -> bool {
        !self.pinned && self.ref_counter() == 0 && self.owning_nodes.is_empty()
    }

    fn refresh_unreferenced(&mut self, now: Instant) {
        if self.is_unreferenced() {
            self.unreferenced_since.get_or_insert(now);
        } else {
            self.unreferenced_since = None;
        }
    }
}

/// A single change to reference state
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerOp {
    Attach { tablet: TabletId, chunk: ChunkId },
    Detach { tablet: TabletId, chunk: ChunkId },
    AddOwningNode { chunk: ChunkId, node: String },
    RemoveOwningNode { chunk: ChunkId, node: String },
}

/// A batch of reference changes applied atomically
#[derive(Clone, Debug, Default)]
pub struct LedgerTransaction {
    ops: Vec<LedgerOp>,
}

impl LedgerTransaction {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, tablet: TabletId, chunk: ChunkId) -> &mut Self {
        self.ops.push(LedgerOp::Attach { tablet, chunk });
        self
    }

    pub fn detach(&mut self, tablet: TabletId, chunk: ChunkId) -> &mut Self {
        self.ops.push(LedgerOp::Detach { tablet, chunk });
        self
    }

    pub fn add_owning_node(&mut self, chunk: ChunkId, node: impl Into<String>) -> &mut Self {
        self.ops.push(LedgerOp::AddOwningNode {
            chunk,
            node: node.into(),
        });
        self
    }

    pub fn remove_owning_node(&mut self, chunk: ChunkId, node: impl Into<String>) -> &mut Self {
        self.ops.push(LedgerOp::RemoveOwningNode {
            chunk,
            node: node.into(),
        });
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn ops(&self) -> &[LedgerOp] {
        &self.ops
    }
}

/// Snapshot of a chunk's attributes
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkAttributes {
    pub chunk_id: ChunkId,
    pub kind: ChunkKind,
    pub state: ChunkState,
    pub erasure_codec: hunkstore_common::ErasureCodecId,
    pub ref_counter: usize,
    pub tablet_count: usize,
    pub store_ref_count: usize,
    pub owning_nodes: Vec<String>,
    pub hunk_chunk_refs: Vec<HunkChunkRef>,
    pub hunk_count: u64,
    pub total_hunk_length: u64,
    pub uncompressed_data_size: u64,
    pub compressed_data_size: u64,
    pub block_count: usize,
}

/// Aggregate hunk statistics of a table or tablet
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HunkStatistics {
    pub hunk_chunk_count: usize,
    pub store_chunk_count: usize,
    pub hunk_count: u64,
    pub referenced_hunk_count: u64,
    pub total_hunk_length: u64,
    pub total_referenced_hunk_length: u64,
}

/// Per-tablet view of one hunk chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HunkChunkInfo {
    pub chunk_id: ChunkId,
    pub hunk_count: u64,
    pub total_hunk_length: u64,
    /// Hunks pointed at by the tablet's store chunks
    pub referenced_hunk_count: u64,
    pub referenced_total_hunk_length: u64,
    /// Number of the tablet's store chunks referencing this chunk
    pub store_ref_count: usize,
    /// No store chunk of the tablet references this chunk
    pub dangling: bool,
}

impl HunkChunkInfo {
    /// Fraction of the chunk's payload bytes no longer referenced
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn garbage_ratio(&self) -> f64 {
        if self.total_hunk_length == 0 {
            return 0.0;
        }
        1.0 - self.referenced_total_hunk_length as f64 / self.total_hunk_length as f64
    }
}

#[derive(Debug)]
struct LedgerState {
    lifecycle: LedgerLifecycle,
    chunks: HashMap<ChunkId, ChunkRecord>,
}

/// Process-wide chunk and reference-count service
#[derive(Debug)]
pub struct HunkLedger {
    state: Mutex<LedgerState>,
}

impl Default for HunkLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl HunkLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                lifecycle: LedgerLifecycle::Running,
                chunks: HashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn lifecycle(&self) -> LedgerLifecycle {
        self.state.lock().lifecycle
    }

    /// Stop accepting new chunks and attachments
    pub fn begin_drain(&self) {
        self.state.lock().lifecycle = LedgerLifecycle::Draining;
    }

    fn ensure_running(state: &LedgerState) -> Result<()> {
        match state.lifecycle {
            LedgerLifecycle::Running => Ok(()),
            LedgerLifecycle::Draining => Err(Error::InvalidState("ledger is draining".into())),
        }
    }

    /// Register a new chunk
    ///
    /// `hunk_chunk_refs` must be empty for hunk chunks and name registered
    /// hunk chunks for store chunks. The chunk starts unreferenced.
    pub fn register_chunk(
        &self,
        meta: ChunkMeta,
        state: ChunkState,
        hunk_chunk_refs: Vec<HunkChunkRef>,
    ) -> Result<()> {
        self.insert_chunk(meta, state, hunk_chunk_refs, false)
    }

    /// Register a chunk that is about to be attached
    ///
    /// A pinned chunk is never a garbage candidate. The pin is dropped by the
    /// first attach or owning node, or by [`Self::unpin_chunk`].
    pub fn register_pinned_chunk(
        &self,
        meta: ChunkMeta,
        state: ChunkState,
        hunk_chunk_refs: Vec<HunkChunkRef>,
    ) -> Result<()> {
        self.insert_chunk(meta, state, hunk_chunk_refs, true)
    }

    fn insert_chunk(
        &self,
        meta: ChunkMeta,
        state: ChunkState,
        hunk_chunk_refs: Vec<HunkChunkRef>,
        pinned: bool,
    ) -> Result<()> {
        let mut guard = self.state.lock();
        Self::ensure_running(&guard)?;

        if guard.chunks.contains_key(&meta.id) {
            return Err(Error::InvalidState(format!(
                "chunk {} is already registered",
                meta.id
            )));
        }
        if meta.kind == ChunkKind::Hunk && !hunk_chunk_refs.is_empty() {
            return Err(Error::invalid_argument(
                "hunk chunks cannot reference other hunk chunks",
            ));
        }
        for hunk_ref in &hunk_chunk_refs {
            match guard.chunks.get(&hunk_ref.chunk_id) {
                Some(target) if target.meta.kind == ChunkKind::Hunk && !target.removing => {}
                _ => return Err(Error::InvalidChunkId(hunk_ref.chunk_id.to_string())),
            }
        }

        debug!(
            chunk_id = %meta.id,
            kind = ?meta.kind,
            hunk_count = meta.hunk_count,
            pinned,
            "Registered chunk"
        );
        guard.chunks.insert(
            meta.id,
            ChunkRecord {
                meta: Arc::new(meta),
                state,
                hunk_chunk_refs,
                tablets: HashSet::new(),
                store_referrers: HashSet::new(),
                owning_nodes: BTreeSet::new(),
                unreferenced_since: (!pinned).then(Instant::now),
                pinned,
                removing: false,
            },
        );
        Ok(())
    }

    /// Drop the pin of a chunk; chunks already attached are unaffected
    ///
    /// The grace period of an unreferenced chunk starts now.
    pub fn unpin_chunk(&self, chunk_id: ChunkId) {
        let mut guard = self.state.lock();
        if let Some(record) = guard.chunks.get_mut(&chunk_id)
            && record.pinned
        {
            record.pinned = false;
            record.refresh_unreferenced(Instant::now());
            debug!(chunk_id = %chunk_id, "Unpinned chunk");
        }
    }

    /// Append blocks to a chunk that is still being built
    pub fn append_blocks(
        &self,
        chunk_id: ChunkId,
        blocks: &[(u64, Checksum)],
        hunk_count: u64,
        total_hunk_length: u64,
    ) -> Result<()> {
        let mut guard = self.state.lock();
        let record = guard
            .chunks
            .get_mut(&chunk_id)
            .ok_or(Error::NoSuchChunk(chunk_id))?;
        if record.state != ChunkState::Building {
            return Err(Error::InvalidState(format!("chunk {chunk_id} is sealed")));
        }
        let meta = Arc::make_mut(&mut record.meta);
        for (size, checksum) in blocks {
            meta.block_sizes.push(*size);
            meta.block_checksums.push(*checksum);
            meta.uncompressed_data_size += size;
            meta.compressed_data_size += size;
        }
        meta.hunk_count += hunk_count;
        meta.total_hunk_length += total_hunk_length;
        Ok(())
    }

    /// Seal a chunk that is being built
    pub fn seal_chunk(&self, chunk_id: ChunkId) -> Result<()> {
        let mut guard = self.state.lock();
        let record = guard
            .chunks
            .get_mut(&chunk_id)
            .ok_or(Error::NoSuchChunk(chunk_id))?;
        record.state = ChunkState::Sealed;
        Ok(())
    }

    /// Replace the part layout of a sealed chunk (after repair)
    ///
    /// Building chunks are rejected: their writer keeps appending to the
    /// layout it placed.
    pub fn update_layout(&self, chunk_id: ChunkId, layout: ChunkLayout) -> Result<()> {
        let mut guard = self.state.lock();
        let record = guard
            .chunks
            .get_mut(&chunk_id)
            .ok_or(Error::NoSuchChunk(chunk_id))?;
        if record.state == ChunkState::Building {
            return Err(Error::InvalidState(format!(
                "chunk {chunk_id} is still being written"
            )));
        }
        Arc::make_mut(&mut record.meta).layout = layout;
        Ok(())
    }

    /// Metadata of a chunk
    #[must_use]
    pub fn chunk_meta(&self, chunk_id: ChunkId) -> Option<Arc<ChunkMeta>> {
        self.state
            .lock()
            .chunks
            .get(&chunk_id)
            .map(|r| Arc::clone(&r.meta))
    }

    /// Metadata of every registered chunk
    #[must_use]
    pub fn all_chunks(&self) -> Vec<Arc<ChunkMeta>> {
        self.state
            .lock()
            .chunks
            .values()
            .map(|r| Arc::clone(&r.meta))
            .collect()
    }

    /// Metadata of every sealed chunk
    #[must_use]
    pub fn sealed_chunks(&self) -> Vec<Arc<ChunkMeta>> {
        self.state
            .lock()
            .chunks
            .values()
            .filter(|r| r.state == ChunkState::Sealed)
            .map(|r| Arc::clone(&r.meta))
            .collect()
    }

    #[must_use]
    pub fn contains(&self, chunk_id: ChunkId) -> bool {
        self.state.lock().chunks.contains_key(&chunk_id)
    }

    /// Start a transaction; apply it with [`Self::commit`]
    #[must_use]
    pub fn begin(&self) -> LedgerTransaction {
        LedgerTransaction::new()
    }

    /// Attribute snapshot of a chunk
    pub fn chunk_attributes(&self, chunk_id: ChunkId) -> Result<ChunkAttributes> {
        let guard = self.state.lock();
        let record = guard
            .chunks
            .get(&chunk_id)
            .ok_or(Error::NoSuchChunk(chunk_id))?;
        let meta = &record.meta;
        Ok(ChunkAttributes {
            chunk_id,
            kind: meta.kind,
            state: record.state,
            erasure_codec: meta.erasure_codec,
            ref_counter: record.ref_counter(),
            tablet_count: record.tablets.len(),
            store_ref_count: record.store_referrers.len(),
            owning_nodes: record.owning_nodes.iter().cloned().collect(),
            hunk_chunk_refs: record.hunk_chunk_refs.clone(),
            hunk_count: meta.hunk_count,
            total_hunk_length: meta.total_hunk_length,
            uncompressed_data_size: meta.uncompressed_data_size,
            compressed_data_size: meta.compressed_data_size,
            block_count: meta.block_count(),
        })
    }

    /// Reference count of a chunk
    pub fn ref_counter(&self, chunk_id: ChunkId) -> Result<usize> {
        self.state
            .lock()
            .chunks
            .get(&chunk_id)
            .map(ChunkRecord::ref_counter)
            .ok_or(Error::NoSuchChunk(chunk_id))
    }

    /// Hunk chunk references of a store chunk
    pub fn hunk_chunk_refs(&self, chunk_id: ChunkId) -> Result<Vec<HunkChunkRef>> {
        self.state
            .lock()
            .chunks
            .get(&chunk_id)
            .map(|r| r.hunk_chunk_refs.clone())
            .ok_or(Error::NoSuchChunk(chunk_id))
    }

    /// Whether a store chunk is still held by at least one tablet
    #[must_use]
    pub fn is_live_store_chunk(&self, chunk_id: ChunkId) -> bool {
        self.state
            .lock()
            .chunks
            .get(&chunk_id)
            .is_some_and(|r| r.meta.kind == ChunkKind::Store && !r.tablets.is_empty())
    }

    /// Validate and apply a transaction atomically
    pub fn commit(&self, txn: &LedgerTransaction) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        Self::validate(state, txn)?;

        let now = Instant::now();
        let mut touched: HashSet<ChunkId> = HashSet::new();
        for op in &txn.ops {
            match op {
                LedgerOp::Attach { tablet, chunk } => {
                    let Some(record) = state.chunks.get_mut(chunk) else {
                        continue;
                    };
                    let was_live = !record.tablets.is_empty();
                    record.tablets.insert(*tablet);
                    record.pinned = false;
                    touched.insert(*chunk);
                    if record.meta.kind == ChunkKind::Store && !was_live {
                        let targets: Vec<ChunkId> =
                            record.hunk_chunk_refs.iter().map(|r| r.chunk_id).collect();
                        for target in targets {
                            if let Some(hunk) = state.chunks.get_mut(&target) {
                                hunk.store_referrers.insert(*chunk);
                                touched.insert(target);
                            }
                        }
                    }
                }
                LedgerOp::Detach { tablet, chunk } => {
                    let Some(record) = state.chunks.get_mut(chunk) else {
                        continue;
                    };
                    record.tablets.remove(tablet);
                    touched.insert(*chunk);
                    if record.meta.kind == ChunkKind::Store && record.tablets.is_empty() {
                        let targets: Vec<ChunkId> =
                            record.hunk_chunk_refs.iter().map(|r| r.chunk_id).collect();
                        for target in targets {
                            if let Some(hunk) = state.chunks.get_mut(&target) {
                                hunk.store_referrers.remove(chunk);
                                touched.insert(target);
                            }
                        }
                    }
                }
                LedgerOp::AddOwningNode { chunk, node } => {
                    if let Some(record) = state.chunks.get_mut(chunk) {
                        record.owning_nodes.insert(node.clone());
                        record.pinned = false;
                        touched.insert(*chunk);
                    }
                }
                LedgerOp::RemoveOwningNode { chunk, node } => {
                    if let Some(record) = state.chunks.get_mut(chunk) {
                        record.owning_nodes.remove(node);
                        touched.insert(*chunk);
                    }
                }
            }
        }

        for chunk_id in touched {
            if let Some(record) = state.chunks.get_mut(&chunk_id) {
                record.refresh_unreferenced(now);
            }
        }
        Ok(())
    }

    fn validate(state: &LedgerState, txn: &LedgerTransaction) -> Result<()> {
        let mut attached: HashMap<(TabletId, ChunkId), bool> = HashMap::new();
        let mut owning: HashMap<(ChunkId, &str), bool> = HashMap::new();

        for op in &txn.ops {
            match op {
                LedgerOp::Attach { tablet, chunk } => {
                    Self::ensure_running(state)?;
                    let record = state
                        .chunks
                        .get(chunk)
                        .ok_or_else(|| Error::InvalidChunkId(chunk.to_string()))?;
                    if record.removing {
                        return Err(Error::InvalidState(format!(
                            "chunk {chunk} is being removed"
                        )));
                    }
                    for target in &record.hunk_chunk_refs {
                        if state.chunks.get(&target.chunk_id).is_none_or(|t| t.removing) {
                            return Err(Error::InvalidState(format!(
                                "store chunk {chunk} references removed hunk chunk {}",
                                target.chunk_id
                            )));
                        }
                    }
                    let current = attached
                        .get(&(*tablet, *chunk))
                        .copied()
                        .unwrap_or_else(|| record.tablets.contains(tablet));
                    if current {
                        return Err(Error::InvalidState(format!(
                            "chunk {chunk} is already attached to tablet {tablet}"
                        )));
                    }
                    attached.insert((*tablet, *chunk), true);
                }
                LedgerOp::Detach { tablet, chunk } => {
                    let record = state
                        .chunks
                        .get(chunk)
                        .ok_or_else(|| Error::InvalidChunkId(chunk.to_string()))?;
                    let current = attached
                        .get(&(*tablet, *chunk))
                        .copied()
                        .unwrap_or_else(|| record.tablets.contains(tablet));
                    if !current {
                        return Err(Error::InvalidState(format!(
                            "chunk {chunk} is not attached to tablet {tablet}"
                        )));
                    }
                    attached.insert((*tablet, *chunk), false);
                }
                LedgerOp::AddOwningNode { chunk, node } => {
                    let record = state
                        .chunks
                        .get(chunk)
                        .ok_or_else(|| Error::InvalidChunkId(chunk.to_string()))?;
                    if record.removing {
                        return Err(Error::InvalidState(format!(
                            "chunk {chunk} is being removed"
                        )));
                    }
                    owning.insert((*chunk, node.as_str()), true);
                }
                LedgerOp::RemoveOwningNode { chunk, node } => {
                    let record = state
                        .chunks
                        .get(chunk)
                        .ok_or_else(|| Error::InvalidChunkId(chunk.to_string()))?;
                    let current = owning
                        .get(&(*chunk, node.as_str()))
                        .copied()
                        .unwrap_or_else(|| record.owning_nodes.contains(node));
                    if !current {
                        return Err(Error::InvalidState(format!(
                            "{node} does not own chunk {chunk}"
                        )));
                    }
                    owning.insert((*chunk, node.as_str()), false);
                }
            }
        }
        Ok(())
    }

    /// Owning nodes of a chunk
    pub fn owning_nodes(&self, chunk_id: ChunkId) -> Result<Vec<String>> {
        self.state
            .lock()
            .chunks
            .get(&chunk_id)
            .map(|r| r.owning_nodes.iter().cloned().collect())
            .ok_or(Error::NoSuchChunk(chunk_id))
    }

    /// Unreferenced, unowned sealed chunks whose grace period has elapsed
    #[must_use]
    pub fn garbage_candidates(&self, now: Instant, grace: Duration) -> Vec<ChunkId> {
        let guard = self.state.lock();
        let mut candidates: Vec<ChunkId> = guard
            .chunks
            .iter()
            .filter(|(_, r)| r.state == ChunkState::Sealed && !r.removing && r.is_unreferenced())
            .filter(|(_, r)| {
                r.unreferenced_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= grace)
            })
            .map(|(id, _)| *id)
            .collect();
        candidates.sort();
        candidates
    }

    /// Number of unreferenced, unowned chunks still awaiting removal
    #[must_use]
    pub fn pending_garbage_count(&self) -> usize {
        self.state
            .lock()
            .chunks
            .values()
            .filter(|r| r.is_unreferenced())
            .count()
    }

    /// Claim an unreferenced chunk for removal
    ///
    /// While claimed, the chunk cannot be attached or owned.
    pub fn begin_removal(&self, chunk_id: ChunkId) -> Result<Arc<ChunkMeta>> {
        let mut guard = self.state.lock();
        let record = guard
            .chunks
            .get_mut(&chunk_id)
            .ok_or(Error::NoSuchChunk(chunk_id))?;
        if !record.is_unreferenced() {
            return Err(Error::InvalidState(format!(
                "chunk {chunk_id} is in use ({} refs, {} owning nodes, pinned: {})",
                record.ref_counter(),
                record.owning_nodes.len(),
                record.pinned
            )));
        }
        record.removing = true;
        Ok(Arc::clone(&record.meta))
    }

    /// Release a removal claim after a failed deletion
    pub fn abort_removal(&self, chunk_id: ChunkId) {
        if let Some(record) = self.state.lock().chunks.get_mut(&chunk_id) {
            record.removing = false;
        }
    }

    /// Drop a claimed chunk from the ledger
    pub fn finish_removal(&self, chunk_id: ChunkId) -> Result<()> {
        let mut guard = self.state.lock();
        match guard.chunks.get(&chunk_id) {
            Some(record) if record.removing => {
                guard.chunks.remove(&chunk_id);
                debug!(chunk_id = %chunk_id, "Removed chunk from ledger");
                Ok(())
            }
            Some(_) => Err(Error::InvalidState(format!(
                "chunk {chunk_id} was not claimed for removal"
            ))),
            None => Err(Error::NoSuchChunk(chunk_id)),
        }
    }

    /// Per-hunk-chunk view relative to a set of store chunks
    #[must_use]
    pub fn hunk_chunk_info(&self, store_chunks: &[ChunkId], hunk_chunk: ChunkId) -> Option<HunkChunkInfo> {
        let guard = self.state.lock();
        Self::hunk_chunk_info_locked(&guard, store_chunks, hunk_chunk)
    }

    fn hunk_chunk_info_locked(
        state: &LedgerState,
        store_chunks: &[ChunkId],
        hunk_chunk: ChunkId,
    ) -> Option<HunkChunkInfo> {
        let record = state.chunks.get(&hunk_chunk)?;
        let mut referenced_hunk_count = 0;
        let mut referenced_total_hunk_length = 0;
        let mut store_ref_count = 0;

        let distinct: BTreeSet<&ChunkId> = store_chunks.iter().collect();
        for store in distinct {
            let Some(store_record) = state.chunks.get(store) else {
                continue;
            };
            for hunk_ref in &store_record.hunk_chunk_refs {
                if hunk_ref.chunk_id == hunk_chunk {
                    referenced_hunk_count += hunk_ref.hunk_count;
                    referenced_total_hunk_length += hunk_ref.total_hunk_length;
                    store_ref_count += 1;
                }
            }
        }

        Some(HunkChunkInfo {
            chunk_id: hunk_chunk,
            hunk_count: record.meta.hunk_count,
            total_hunk_length: record.meta.total_hunk_length,
            referenced_hunk_count: referenced_hunk_count.min(record.meta.hunk_count),
            referenced_total_hunk_length: referenced_total_hunk_length
                .min(record.meta.total_hunk_length),
            store_ref_count,
            dangling: store_ref_count == 0,
        })
    }

    /// Aggregate statistics over a set of store and hunk chunks
    #[must_use]
    pub fn statistics(&self, store_chunks: &[ChunkId], hunk_chunks: &[ChunkId]) -> HunkStatistics {
        let guard = self.state.lock();
        let distinct_stores: BTreeSet<ChunkId> = store_chunks.iter().copied().collect();
        let distinct_hunks: BTreeSet<ChunkId> = hunk_chunks.iter().copied().collect();
        let stores: Vec<ChunkId> = distinct_stores.into_iter().collect();

        let mut stats = HunkStatistics {
            store_chunk_count: stores.len(),
            ..HunkStatistics::default()
        };
        for hunk_chunk in distinct_hunks {
            if let Some(info) = Self::hunk_chunk_info_locked(&guard, &stores, hunk_chunk) {
                stats.hunk_chunk_count += 1;
                stats.hunk_count += info.hunk_count;
                stats.total_hunk_length += info.total_hunk_length;
                stats.referenced_hunk_count += info.referenced_hunk_count;
                stats.total_referenced_hunk_length += info.referenced_total_hunk_length;
            }
        }
        stats
    }
}
