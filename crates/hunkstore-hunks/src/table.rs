//! Sorted table driver
//!
//! A table is a list of tablets covering the whole int64 key space. Each
//! tablet buffers writes in a memtable; a flush classifies the buffered
//! values, writes externalized payloads into a new hunk chunk and the rows
//! into a new store chunk. Compaction merges a tablet's store chunks,
//! applies `min_data_ttl` and rewrites hunk chunks per the compaction
//! plan. Resharding splits or merges tablets; store chunks whose rows span
//! several new tablets are shared between them.
//!
//! Every change of a tablet's chunk set goes through a single ledger
//! transaction, so reference counts never observe a half-applied change.

use crate::chunk::{ChunkKind, ChunkState, HunkChunkRef};
use crate::compaction::CompactionRewriter;
use crate::context::StorageContext;
use crate::hunk_storage::HunkStorageLog;
use crate::ledger::{HunkChunkInfo, HunkStatistics};
use crate::lock_manager::HunkLockManager;
use crate::namespace::{Namespace, NodeKind};
use crate::reader::{HunkChunkReader, ReadHunkRequest};
use crate::rows::{Row, RowKind, StoredRow, encode_store_block, summarize_refs};
use crate::schema::TableSchema;
use crate::stats::{HunkValueCounters, ReaderStatistics, ValueSource};
use crate::value::{HunkRef, HunkValue, ValueClassifier};
use crate::writer::{HunkChunkWriter, write_sealed_chunk};
use bytes::Bytes;
use hunkstore_common::{ChunkId, Error, ErasureCodecId, Result, TabletId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Options fixed at table creation
#[derive(Clone, Debug, Default)]
pub struct TableOptions {
    /// Superseded and deleted versions younger than this survive compaction
    pub min_data_ttl: Duration,
    /// Set on the table node; inherited from ancestors when `None`
    pub hunk_erasure_codec: Option<ErasureCodecId>,
}

#[derive(Clone, Debug)]
struct StoreView {
    chunk_id: ChunkId,
    /// Sorted by key, then timestamp
    rows: Arc<Vec<StoredRow>>,
}

#[derive(Debug)]
struct Tablet {
    id: TabletId,
    /// Inclusive
    lower: Option<i64>,
    /// Exclusive
    upper: Option<i64>,
    memtable: Vec<StoredRow>,
    stores: Vec<StoreView>,
    hunk_chunks: BTreeSet<ChunkId>,
}

impl Tablet {
    fn new(lower: Option<i64>, upper: Option<i64>) -> Self {
        Self {
            id: TabletId::new(),
            lower,
            upper,
            memtable: Vec::new(),
            stores: Vec::new(),
            hunk_chunks: BTreeSet::new(),
        }
    }

    fn contains(&self, key: i64) -> bool {
        self.lower.is_none_or(|lower| key >= lower) && self.upper.is_none_or(|upper| key < upper)
    }

    /// Newest version of `key` and the store chunk holding it
    fn latest(&self, key: i64) -> Option<(&StoredRow, Option<ChunkId>)> {
        fn consider<'a>(
            best: &mut Option<(&'a StoredRow, Option<ChunkId>)>,
            row: &'a StoredRow,
            source: Option<ChunkId>,
        ) {
            if best.is_none_or(|(current, _)| row.timestamp > current.timestamp) {
                *best = Some((row, source));
            }
        }

        let mut best = None;
        for row in self.memtable.iter().filter(|row| row.key == key) {
            consider(&mut best, row, None);
        }
        for store in &self.stores {
            let start = store.rows.partition_point(|row| row.key < key);
            for row in store.rows[start..].iter().take_while(|row| row.key == key) {
                consider(&mut best, row, Some(store.chunk_id));
            }
        }
        best
    }

    fn keys(&self) -> BTreeSet<i64> {
        let mut keys: BTreeSet<i64> = self.memtable.iter().map(|row| row.key).collect();
        for store in &self.stores {
            keys.extend(
                store
                    .rows
                    .iter()
                    .map(|row| row.key)
                    .filter(|key| self.contains(*key)),
            );
        }
        keys
    }

    fn store_ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.stores.iter().map(|store| store.chunk_id)
    }

    /// Chunk set of the tablet, without the memtable
    fn snapshot(&self) -> Self {
        Self {
            id: self.id,
            lower: self.lower,
            upper: self.upper,
            memtable: Vec::new(),
            stores: self.stores.clone(),
            hunk_chunks: self.hunk_chunks.clone(),
        }
    }
}

/// Output of one tablet compaction, written but not yet committed
struct CompactedTablet {
    tablet_id: TabletId,
    old_stores: Vec<ChunkId>,
    old_hunk_chunks: BTreeSet<ChunkId>,
    new_store: Option<StoreView>,
    new_hunk_chunk: Option<ChunkId>,
    referenced: BTreeSet<ChunkId>,
    dropped_versions: usize,
    rewritten_hunk_chunks: usize,
    dropped_hunk_chunks: usize,
    inlined: u64,
}

impl CompactedTablet {
    /// Whether `tablet` still holds the chunks this compaction started from
    fn matches(&self, tablet: &Tablet) -> bool {
        tablet.store_ids().eq(self.old_stores.iter().copied())
            && tablet.hunk_chunks == self.old_hunk_chunks
    }

    fn new_chunks(&self) -> Vec<ChunkId> {
        self.new_store
            .iter()
            .map(|store| store.chunk_id)
            .chain(self.new_hunk_chunk)
            .collect()
    }

    fn conflict_chunk(&self) -> ChunkId {
        self.old_stores
            .first()
            .or_else(|| self.old_hunk_chunks.first())
            .copied()
            .unwrap_or_default()
    }
}

/// Keep the newest version of every key, plus versions younger than `ttl_ms`
///
/// `rows` must be sorted by key, then timestamp. A deleted key disappears
/// once its tombstone is older than `ttl_ms`.
fn merge_versions(rows: Vec<StoredRow>, now_ms: u64, ttl_ms: u64) -> Vec<StoredRow> {
    let flush_key = |versions: &mut Vec<StoredRow>, merged: &mut Vec<StoredRow>| {
        let mut kept = Vec::with_capacity(versions.len());
        for (age_rank, version) in versions.drain(..).rev().enumerate() {
            let expired = now_ms.saturating_sub(version.written_at_ms) >= ttl_ms;
            let keep = if age_rank == 0 {
                matches!(version.kind, RowKind::Write(_)) || !expired
            } else {
                !expired
            };
            if keep {
                kept.push(version);
            }
        }
        merged.extend(kept.into_iter().rev());
    };

    let mut merged = Vec::with_capacity(rows.len());
    let mut versions: Vec<StoredRow> = Vec::new();
    for row in rows {
        if versions.last().is_some_and(|last| last.key != row.key) {
            flush_key(&mut versions, &mut merged);
        }
        versions.push(row);
    }
    flush_key(&mut versions, &mut merged);
    merged
}

struct Found {
    key: i64,
    source: Option<ChunkId>,
    values: Vec<Option<HunkValue>>,
}

impl Found {
    fn from_latest(latest: Option<(&StoredRow, Option<ChunkId>)>) -> Option<Self> {
        match latest {
            Some((row, source)) => match &row.kind {
                RowKind::Write(values) => Some(Self {
                    key: row.key,
                    source,
                    values: values.clone(),
                }),
                RowKind::Delete => None,
            },
            None => None,
        }
    }
}

struct HunkStorageBinding {
    log: Arc<HunkStorageLog>,
    locks: Arc<HunkLockManager>,
}

struct TableState {
    schema: TableSchema,
    tablets: Vec<Tablet>,
    next_timestamp: u64,
    hunk_storage: Option<HunkStorageBinding>,
    locked_stores: BTreeSet<ChunkId>,
    removed: bool,
}

impl TableState {
    fn tablet_index(&self, key: i64) -> Result<usize> {
        self.tablets
            .iter()
            .position(|tablet| tablet.contains(key))
            .ok_or_else(|| Error::internal(format!("no tablet covers key {key}")))
    }

    fn store_ids(&self) -> Vec<ChunkId> {
        let ids: BTreeSet<ChunkId> = self.tablets.iter().flat_map(Tablet::store_ids).collect();
        ids.into_iter().collect()
    }

    fn hunk_chunk_ids(&self) -> Vec<ChunkId> {
        let ids: BTreeSet<ChunkId> = self
            .tablets
            .iter()
            .flat_map(|tablet| tablet.hunk_chunks.iter().copied())
            .collect();
        ids.into_iter().collect()
    }

    fn has_hunk_refs(&self) -> bool {
        self.tablets.iter().any(|tablet| {
            tablet.memtable.iter().any(|row| row.hunk_refs().next().is_some())
                || tablet
                    .stores
                    .iter()
                    .any(|store| store.rows.iter().any(|row| row.hunk_refs().next().is_some()))
        })
    }

    fn referenced_chunks(&self) -> BTreeSet<ChunkId> {
        let mut referenced: BTreeSet<ChunkId> = self.hunk_chunk_ids().into_iter().collect();
        for tablet in &self.tablets {
            referenced.extend(summarize_refs(&tablet.memtable).into_keys());
        }
        referenced
    }
}

/// A sorted table with hunk-separated values
pub struct Table {
    ctx: StorageContext,
    namespace: Arc<Namespace>,
    path: String,
    options: TableOptions,
    created_at: Instant,
    reader: HunkChunkReader,
    rewriter: CompactionRewriter,
    counters: HunkValueCounters,
    state: Mutex<TableState>,
}

impl Table {
    /// Create the table node at `path` and an empty table with one tablet
    pub fn create(
        ctx: StorageContext,
        namespace: Arc<Namespace>,
        path: impl Into<String>,
        schema: TableSchema,
        options: TableOptions,
    ) -> Result<Self> {
        let path = path.into();
        let reader = HunkChunkReader::new(ctx.clone())?;
        let rewriter = CompactionRewriter::new(ctx.config.compaction.clone())?;

        namespace.create(&path, NodeKind::Table)?;
        if let Some(codec) = options.hunk_erasure_codec {
            namespace.set_hunk_erasure_codec(&path, codec)?;
        }
        info!(path = %path, columns = schema.value_columns().len(), "Created table");

        Ok(Self {
            ctx,
            namespace,
            path,
            options,
            created_at: Instant::now(),
            reader,
            rewriter,
            counters: HunkValueCounters::new(),
            state: Mutex::new(TableState {
                schema,
                tablets: vec![Tablet::new(None, None)],
                next_timestamp: 1,
                hunk_storage: None,
                locked_stores: BTreeSet::new(),
                removed: false,
            }),
        })
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn schema(&self) -> TableSchema {
        self.state.lock().await.schema.clone()
    }

    #[must_use]
    pub const fn value_counters(&self) -> &HunkValueCounters {
        &self.counters
    }

    #[must_use]
    pub fn reader_statistics(&self) -> ReaderStatistics {
        self.reader.statistics()
    }

    fn ensure_live(&self, state: &TableState) -> Result<()> {
        if state.removed {
            return Err(Error::NoSuchTable(self.path.clone()));
        }
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.created_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Codec for new hunk chunks, as currently set on the table node
    pub fn hunk_erasure_codec(&self) -> Result<ErasureCodecId> {
        Ok(self
            .namespace
            .hunk_erasure_codec(&self.path)?
            .unwrap_or(ErasureCodecId::None))
    }

    /// Change the codec of hunk chunks written from now on
    pub fn set_hunk_erasure_codec(&self, codec: ErasureCodecId) -> Result<()> {
        self.namespace.set_hunk_erasure_codec(&self.path, codec)
    }

    /// Route externalized values through a hunk storage log from now on
    pub async fn set_hunk_storage(
        &self,
        log: Arc<HunkStorageLog>,
        locks: Arc<HunkLockManager>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_live(&state)?;
        info!(path = %self.path, hunk_storage = %log.path(), "Attached hunk storage");
        state.hunk_storage = Some(HunkStorageBinding { log, locks });
        Ok(())
    }

    /// Write rows into the memtables
    pub async fn insert_rows(&self, rows: Vec<Row>) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_live(&state)?;

        let column_count = state.schema.value_columns().len();
        if let Some(row) = rows.iter().find(|row| row.values.len() != column_count) {
            return Err(Error::schema_violation(format!(
                "row {} has {} values, table has {column_count} value columns",
                row.key,
                row.values.len()
            )));
        }

        let mut values: Vec<Vec<Option<HunkValue>>> = rows
            .iter()
            .map(|row| {
                row.values
                    .iter()
                    .map(|value| value.clone().map(HunkValue::Inline))
                    .collect()
            })
            .collect();
        if state.hunk_storage.is_some() {
            self.externalize_to_storage(&mut state, &mut values).await?;
        }

        let written_at_ms = self.now_ms();
        for (row, values) in rows.iter().zip(values) {
            let index = state.tablet_index(row.key)?;
            let timestamp = state.next_timestamp;
            state.next_timestamp += 1;
            state.tablets[index].memtable.push(StoredRow {
                key: row.key,
                timestamp,
                written_at_ms,
                kind: RowKind::Write(values),
            });
        }
        debug!(path = %self.path, row_count = rows.len(), "Inserted rows");
        Ok(())
    }

    async fn externalize_to_storage(
        &self,
        state: &mut TableState,
        values: &mut [Vec<Option<HunkValue>>],
    ) -> Result<()> {
        let Some(binding) = &state.hunk_storage else {
            return Ok(());
        };
        let classifier = ValueClassifier::new(&state.schema);

        let mut positions = Vec::new();
        let mut payloads = Vec::new();
        for (row_index, row) in values.iter().enumerate() {
            for (column, value) in row.iter().enumerate() {
                if let Some(HunkValue::Inline(bytes)) = value
                    && classifier.should_externalize(column, bytes.len())
                {
                    positions.push((row_index, column));
                    payloads.push(bytes.clone());
                }
            }
        }
        if payloads.is_empty() {
            return Ok(());
        }

        let refs = binding.log.append(&payloads).await?;
        let locks = Arc::clone(&binding.locks);
        for ((row_index, column), hunk_ref) in positions.into_iter().zip(&refs) {
            values[row_index][column] = Some(HunkValue::Ref(*hunk_ref));
        }
        for hunk_ref in refs {
            if state.locked_stores.insert(hunk_ref.chunk_id) {
                locks.lock(hunk_ref.chunk_id, &self.path)?;
            }
        }
        Ok(())
    }

    /// Write tombstones for `keys`
    pub async fn delete_rows(&self, keys: &[i64]) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_live(&state)?;

        let written_at_ms = self.now_ms();
        for key in keys {
            let index = state.tablet_index(*key)?;
            let timestamp = state.next_timestamp;
            state.next_timestamp += 1;
            state.tablets[index].memtable.push(StoredRow {
                key: *key,
                timestamp,
                written_at_ms,
                kind: RowKind::Delete,
            });
        }
        debug!(path = %self.path, row_count = keys.len(), "Deleted rows");
        Ok(())
    }

    /// Newest version of every key, `None` for missing or deleted keys
    pub async fn lookup_rows(&self, keys: &[i64]) -> Result<Vec<Option<Row>>> {
        let (columns, found) = {
            let state = self.state.lock().await;
            self.ensure_live(&state)?;
            let mut found = Vec::with_capacity(keys.len());
            for key in keys {
                let tablet = &state.tablets[state.tablet_index(*key)?];
                found.push(Found::from_latest(tablet.latest(*key)));
            }
            (Self::column_names(&state.schema), found)
        };
        self.materialize(&columns, found).await
    }

    /// Every live row in key order
    pub async fn select_rows(&self) -> Result<Vec<Row>> {
        let (columns, found) = {
            let state = self.state.lock().await;
            self.ensure_live(&state)?;
            let mut found = Vec::new();
            for tablet in &state.tablets {
                for key in tablet.keys() {
                    found.push(Found::from_latest(tablet.latest(key)));
                }
            }
            (Self::column_names(&state.schema), found)
        };
        Ok(self
            .materialize(&columns, found)
            .await?
            .into_iter()
            .flatten()
            .collect())
    }

    fn column_names(schema: &TableSchema) -> Vec<String> {
        schema
            .value_columns()
            .iter()
            .map(|column| column.name.clone())
            .collect()
    }

    async fn materialize(
        &self,
        columns: &[String],
        found: Vec<Option<Found>>,
    ) -> Result<Vec<Option<Row>>> {
        let mut pending: BTreeMap<Option<ChunkId>, Vec<(usize, usize, HunkRef)>> = BTreeMap::new();
        let mut rows: Vec<Option<Row>> = Vec::with_capacity(found.len());

        for (index, entry) in found.into_iter().enumerate() {
            let Some(entry) = entry else {
                rows.push(None);
                continue;
            };
            let mut values = Vec::with_capacity(entry.values.len());
            for (column, value) in entry.values.into_iter().enumerate() {
                if let (Some(value), Some(name)) = (&value, columns.get(column)) {
                    self.counters.record(ValueSource::Lookup, name, value);
                }
                values.push(match value {
                    Some(HunkValue::Inline(bytes)) => Some(bytes),
                    Some(HunkValue::Ref(hunk_ref)) => {
                        pending
                            .entry(entry.source)
                            .or_default()
                            .push((index, column, hunk_ref));
                        None
                    }
                    None => None,
                });
            }
            rows.push(Some(Row::new(entry.key, values)));
        }

        for (source, refs) in pending {
            let requests: Vec<ReadHunkRequest> = refs
                .iter()
                .map(|(_, _, hunk_ref)| ReadHunkRequest::from_ref(hunk_ref))
                .collect();
            let responses = match source {
                Some(store_id) => self.reader.read_hunks_for_store(store_id, &requests).await,
                None => self.reader.read_hunks(&requests).await,
            };
            for ((index, column, _), response) in refs.into_iter().zip(responses) {
                let payload: Bytes = response?;
                if let Some(Some(row)) = rows.get_mut(index) {
                    row.values[column] = Some(payload);
                }
            }
        }
        Ok(rows)
    }

    async fn write_store_chunk(&self, rows: &[StoredRow]) -> Result<ChunkId> {
        let mut hunk_chunk_refs = Vec::new();
        for (chunk_id, (hunk_count, total_hunk_length)) in summarize_refs(rows) {
            let meta = self
                .ctx
                .ledger
                .chunk_meta(chunk_id)
                .ok_or(Error::NoSuchChunk(chunk_id))?;
            hunk_chunk_refs.push(HunkChunkRef {
                chunk_id,
                hunk_count,
                total_hunk_length,
                erasure_codec: meta.erasure_codec,
            });
        }

        let block = encode_store_block(rows)?;
        let meta = write_sealed_chunk(
            &self.ctx,
            ChunkId::new(),
            ChunkKind::Store,
            ErasureCodecId::None,
            vec![block],
            rows.len() as u64,
            0,
        )
        .await?;
        let chunk_id = meta.id;
        self.ctx
            .ledger
            .register_pinned_chunk(meta, ChunkState::Sealed, hunk_chunk_refs)?;
        Ok(chunk_id)
    }

    /// Start the grace clock of chunks written for a change; attached ones are unaffected
    fn unpin_all(&self, chunk_ids: impl IntoIterator<Item = ChunkId>) {
        for chunk_id in chunk_ids {
            self.ctx.ledger.unpin_chunk(chunk_id);
        }
    }

    /// Write every non-empty memtable out as store and hunk chunks
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_live(&state)?;
        self.flush_locked(&mut state).await
    }

    async fn flush_locked(&self, state: &mut TableState) -> Result<()> {
        let codec = self.hunk_erasure_codec()?;
        let classifier = ValueClassifier::new(&state.schema);
        let columns = Self::column_names(&state.schema);

        for tablet in &mut state.tablets {
            if tablet.memtable.is_empty() {
                continue;
            }
            let mut rows = tablet.memtable.clone();
            rows.sort_by_key(|row| (row.key, row.timestamp));

            let mut writer = HunkChunkWriter::new(codec, &self.ctx.config.hunk_chunk_writer);
            for row in &mut rows {
                let RowKind::Write(values) = &mut row.kind else {
                    continue;
                };
                for (column, value) in values.iter_mut().enumerate() {
                    if let Some(HunkValue::Inline(bytes)) = value {
                        let bytes = std::mem::take(bytes);
                        *value = Some(classifier.classify(column, bytes, &mut writer)?);
                    }
                    if let (Some(value), Some(name)) = (value.as_ref(), columns.get(column)) {
                        self.counters.record(ValueSource::Flush, name, value);
                    }
                }
            }

            let mut live: BTreeSet<ChunkId> = BTreeSet::new();
            for existing in tablet.store_ids() {
                live.extend(
                    self.ctx
                        .ledger
                        .hunk_chunk_refs(existing)?
                        .iter()
                        .map(|r| r.chunk_id),
                );
            }

            let hunk_chunk = writer.close(&self.ctx).await?;
            let mut pinned: Vec<ChunkId> = hunk_chunk.iter().map(|c| c.chunk_id).collect();
            let store_id = match self.write_store_chunk(&rows).await {
                Ok(store_id) => store_id,
                Err(e) => {
                    self.unpin_all(pinned);
                    return Err(e);
                }
            };
            pinned.push(store_id);
            let referenced: BTreeSet<ChunkId> = summarize_refs(&rows).into_keys().collect();
            live.extend(referenced.iter().copied());

            let mut txn = self.ctx.ledger.begin();
            txn.attach(tablet.id, store_id);
            for chunk_id in referenced.difference(&tablet.hunk_chunks) {
                txn.attach(tablet.id, *chunk_id);
            }
            let dangling: Vec<ChunkId> = tablet.hunk_chunks.difference(&live).copied().collect();
            for chunk_id in &dangling {
                txn.detach(tablet.id, *chunk_id);
            }
            let committed = self.ctx.ledger.commit(&txn);
            self.unpin_all(pinned);
            committed?;

            info!(
                path = %self.path,
                tablet_id = %tablet.id,
                store_chunk_id = %store_id,
                hunk_chunk_id = ?hunk_chunk.map(|c| c.chunk_id),
                row_count = rows.len(),
                "Flushed tablet"
            );
            for chunk_id in &dangling {
                tablet.hunk_chunks.remove(chunk_id);
            }
            tablet.hunk_chunks.extend(referenced);
            tablet.stores.push(StoreView {
                chunk_id: store_id,
                rows: Arc::new(rows),
            });
            tablet.memtable.clear();
        }
        Ok(())
    }

    /// Merge every tablet's store chunks and rewrite hunk chunks as planned
    ///
    /// Tablets are snapshotted under the table lock and rewritten outside
    /// it. A tablet whose chunk set changed in the meantime is left alone and
    /// the call fails with `ConcurrentRewrite`.
    pub async fn compact(&self) -> Result<()> {
        let (snapshots, classifier, columns) = {
            let state = self.state.lock().await;
            self.ensure_live(&state)?;
            let snapshots: Vec<Tablet> = state.tablets.iter().map(Tablet::snapshot).collect();
            (
                snapshots,
                ValueClassifier::new(&state.schema),
                Self::column_names(&state.schema),
            )
        };
        let codec = self.hunk_erasure_codec()?;

        let mut compacted = Vec::with_capacity(snapshots.len());
        for snapshot in &snapshots {
            match self.compact_tablet(snapshot, &classifier, codec).await {
                Ok(Some(result)) => compacted.push(result),
                Ok(None) => {}
                Err(e) => {
                    for result in compacted {
                        self.unpin_all(result.new_chunks());
                    }
                    return Err(e);
                }
            }
        }

        let mut state = self.state.lock().await;
        if let Err(e) = self.ensure_live(&state) {
            for result in compacted {
                self.unpin_all(result.new_chunks());
            }
            return Err(e);
        }
        let mut conflict = None;
        for result in compacted {
            let tablet = state
                .tablets
                .iter_mut()
                .find(|tablet| tablet.id == result.tablet_id)
                .filter(|tablet| result.matches(tablet));
            match tablet {
                Some(tablet) => {
                    if let Err(e) = self.apply_compaction(tablet, result, &columns) {
                        conflict.get_or_insert(e);
                    }
                }
                None => {
                    debug!(tablet_id = %result.tablet_id, "Tablet changed during compaction");
                    conflict.get_or_insert(Error::ConcurrentRewrite(result.conflict_chunk()));
                    self.unpin_all(result.new_chunks());
                }
            }
        }
        self.release_unreferenced_stores(&mut state)?;
        conflict.map_or(Ok(()), Err)
    }

    async fn compact_tablet(
        &self,
        tablet: &Tablet,
        classifier: &ValueClassifier,
        codec: ErasureCodecId,
    ) -> Result<Option<CompactedTablet>> {
        let old_stores: Vec<ChunkId> = tablet.store_ids().collect();
        if tablet.stores.is_empty() {
            if tablet.hunk_chunks.is_empty() {
                return Ok(None);
            }
            return Ok(Some(CompactedTablet {
                tablet_id: tablet.id,
                old_stores,
                old_hunk_chunks: tablet.hunk_chunks.clone(),
                new_store: None,
                new_hunk_chunk: None,
                referenced: BTreeSet::new(),
                dropped_versions: 0,
                rewritten_hunk_chunks: 0,
                dropped_hunk_chunks: tablet.hunk_chunks.len(),
                inlined: 0,
            }));
        }

        let mut all_in_range = true;
        let mut rows = Vec::new();
        for store in &tablet.stores {
            for row in store.rows.iter() {
                if tablet.contains(row.key) {
                    rows.push(row.clone());
                } else {
                    all_in_range = false;
                }
            }
        }
        rows.sort_by_key(|row| (row.key, row.timestamp));
        let version_count = rows.len();
        let ttl_ms = u64::try_from(self.options.min_data_ttl.as_millis()).unwrap_or(u64::MAX);
        let merged = merge_versions(rows, self.now_ms(), ttl_ms);
        let dropped_versions = version_count - merged.len();

        let summary = summarize_refs(&merged);
        let infos: Vec<HunkChunkInfo> = tablet
            .hunk_chunks
            .iter()
            .filter_map(|chunk_id| {
                let meta = self.ctx.ledger.chunk_meta(*chunk_id)?;
                let (referenced_hunk_count, referenced_total_hunk_length) =
                    summary.get(chunk_id).copied().unwrap_or((0, 0));
                Some(HunkChunkInfo {
                    chunk_id: *chunk_id,
                    hunk_count: meta.hunk_count,
                    total_hunk_length: meta.total_hunk_length,
                    referenced_hunk_count,
                    referenced_total_hunk_length,
                    store_ref_count: usize::from(referenced_hunk_count > 0),
                    dangling: referenced_hunk_count == 0,
                })
            })
            .collect();
        let plan = self.rewriter.plan(&infos);

        let mut writer = HunkChunkWriter::new(codec, &self.ctx.config.hunk_chunk_writer);
        let outcome = self
            .rewriter
            .rewrite(&self.reader, classifier, &plan, &mut writer, merged)
            .await?;

        if tablet.stores.len() == 1
            && all_in_range
            && dropped_versions == 0
            && plan.dropped.is_empty()
            && !outcome.is_changed()
        {
            debug!(tablet_id = %tablet.id, "Tablet is already compact");
            return Ok(None);
        }

        let new_hunk_chunk = writer.close(&self.ctx).await?.map(|c| c.chunk_id);
        let new_store = if outcome.rows.is_empty() {
            None
        } else {
            match self.write_store_chunk(&outcome.rows).await {
                Ok(chunk_id) => Some(StoreView {
                    chunk_id,
                    rows: Arc::new(outcome.rows),
                }),
                Err(e) => {
                    self.unpin_all(new_hunk_chunk);
                    return Err(e);
                }
            }
        };
        let referenced: BTreeSet<ChunkId> = new_store
            .as_ref()
            .map(|store| summarize_refs(store.rows.as_slice()).into_keys().collect())
            .unwrap_or_default();

        Ok(Some(CompactedTablet {
            tablet_id: tablet.id,
            old_stores,
            old_hunk_chunks: tablet.hunk_chunks.clone(),
            new_store,
            new_hunk_chunk,
            referenced,
            dropped_versions,
            rewritten_hunk_chunks: plan.rewrite.len(),
            dropped_hunk_chunks: plan.dropped.len(),
            inlined: outcome.inlined_count,
        }))
    }

    fn apply_compaction(
        &self,
        tablet: &mut Tablet,
        compacted: CompactedTablet,
        columns: &[String],
    ) -> Result<()> {
        let mut txn = self.ctx.ledger.begin();
        for store_id in &compacted.old_stores {
            txn.detach(tablet.id, *store_id);
        }
        if let Some(store) = &compacted.new_store {
            txn.attach(tablet.id, store.chunk_id);
        }
        for chunk_id in compacted.referenced.difference(&tablet.hunk_chunks) {
            txn.attach(tablet.id, *chunk_id);
        }
        for chunk_id in tablet.hunk_chunks.difference(&compacted.referenced) {
            txn.detach(tablet.id, *chunk_id);
        }
        let committed = self.ctx.ledger.commit(&txn);
        self.unpin_all(compacted.new_chunks());
        committed?;

        if let Some(store) = &compacted.new_store {
            for row in store.rows.iter() {
                if let RowKind::Write(values) = &row.kind {
                    for (value, name) in values.iter().zip(columns) {
                        if let Some(value) = value {
                            self.counters.record(ValueSource::Compaction, name, value);
                        }
                    }
                }
            }
        }

        info!(
            tablet_id = %tablet.id,
            old_store_count = compacted.old_stores.len(),
            new_store_chunk_id = ?compacted.new_store.as_ref().map(|s| s.chunk_id),
            new_hunk_chunk_id = ?compacted.new_hunk_chunk,
            dropped_versions = compacted.dropped_versions,
            rewritten_hunk_chunks = compacted.rewritten_hunk_chunks,
            dropped_hunk_chunks = compacted.dropped_hunk_chunks,
            inlined = compacted.inlined,
            "Compacted tablet"
        );
        tablet.stores = compacted.new_store.into_iter().collect();
        tablet.hunk_chunks = compacted.referenced;
        Ok(())
    }

    /// Replace the tablets with ones split at `pivots`
    ///
    /// Memtables are flushed first. Store chunks are shared by every new
    /// tablet that covers some of their rows.
    pub async fn reshard(&self, pivots: &[i64]) -> Result<()> {
        if pivots.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(Error::invalid_argument("pivot keys must be strictly increasing"));
        }
        let mut state = self.state.lock().await;
        self.ensure_live(&state)?;
        self.flush_locked(&mut state).await?;

        let mut stores: BTreeMap<ChunkId, StoreView> = BTreeMap::new();
        for tablet in &state.tablets {
            for store in &tablet.stores {
                stores
                    .entry(store.chunk_id)
                    .or_insert_with(|| store.clone());
            }
        }

        let lowers = std::iter::once(None).chain(pivots.iter().copied().map(Some));
        let uppers = pivots
            .iter()
            .copied()
            .map(Some)
            .chain(std::iter::once(None));
        let mut tablets: Vec<Tablet> = lowers
            .zip(uppers)
            .map(|(lower, upper)| Tablet::new(lower, upper))
            .collect();

        let mut txn = self.ctx.ledger.begin();
        for old in &state.tablets {
            for store_id in old.store_ids() {
                txn.detach(old.id, store_id);
            }
            for chunk_id in &old.hunk_chunks {
                txn.detach(old.id, *chunk_id);
            }
        }
        for tablet in &mut tablets {
            for store in stores.values() {
                let in_range: Vec<&StoredRow> = store
                    .rows
                    .iter()
                    .filter(|row| tablet.contains(row.key))
                    .collect();
                if in_range.is_empty() {
                    continue;
                }
                tablet.hunk_chunks.extend(summarize_refs(in_range).into_keys());
                tablet.stores.push(store.clone());
                txn.attach(tablet.id, store.chunk_id);
            }
            for chunk_id in &tablet.hunk_chunks {
                txn.attach(tablet.id, *chunk_id);
            }
        }
        self.ctx.ledger.commit(&txn)?;

        info!(
            path = %self.path,
            old_tablet_count = state.tablets.len(),
            new_tablet_count = tablets.len(),
            "Resharded table"
        );
        state.tablets = tablets;
        self.release_unreferenced_stores(&mut state)
    }

    /// Replace the schema
    ///
    /// Dropping `max_inline_hunk_size` from a column is rejected while any
    /// hunk reference is still held by the table.
    pub async fn alter_schema(&self, schema: TableSchema) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_live(&state)?;
        state
            .schema
            .validate_alteration(&schema, state.has_hunk_refs())?;
        info!(path = %self.path, "Altered table schema");
        state.schema = schema;
        Ok(())
    }

    /// Detach every chunk and remove the table node
    pub async fn remove(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_live(&state)?;

        let mut txn = self.ctx.ledger.begin();
        for tablet in &state.tablets {
            for store_id in tablet.store_ids() {
                txn.detach(tablet.id, store_id);
            }
            for chunk_id in &tablet.hunk_chunks {
                txn.detach(tablet.id, *chunk_id);
            }
        }
        self.ctx.ledger.commit(&txn)?;

        state.tablets = vec![Tablet::new(None, None)];
        self.release_unreferenced_stores(&mut state)?;
        state.removed = true;
        self.namespace.remove(&self.path)?;
        info!(path = %self.path, "Removed table");
        Ok(())
    }

    fn release_unreferenced_stores(&self, state: &mut TableState) -> Result<()> {
        if state.locked_stores.is_empty() {
            return Ok(());
        }
        let referenced = state.referenced_chunks();
        let released: Vec<ChunkId> = state
            .locked_stores
            .difference(&referenced)
            .copied()
            .collect();
        let Some(binding) = &state.hunk_storage else {
            return Ok(());
        };
        for store_id in released {
            binding.locks.unlock(store_id, &self.path)?;
            state.locked_stores.remove(&store_id);
        }
        Ok(())
    }

    /// Hunk statistics over all tablets
    pub async fn hunk_statistics(&self) -> HunkStatistics {
        let state = self.state.lock().await;
        self.ctx
            .ledger
            .statistics(&state.store_ids(), &state.hunk_chunk_ids())
    }

    /// Per-chunk view of one hunk chunk of the table
    pub async fn hunk_chunk_info(&self, chunk_id: ChunkId) -> Option<HunkChunkInfo> {
        let state = self.state.lock().await;
        if !state.hunk_chunk_ids().contains(&chunk_id) {
            return None;
        }
        self.ctx.ledger.hunk_chunk_info(&state.store_ids(), chunk_id)
    }

    /// Distinct store chunks across tablets
    pub async fn store_chunk_ids(&self) -> Vec<ChunkId> {
        self.state.lock().await.store_ids()
    }

    /// Distinct hunk chunks across tablets
    pub async fn hunk_chunk_ids(&self) -> Vec<ChunkId> {
        self.state.lock().await.hunk_chunk_ids()
    }

    pub async fn tablet_ids(&self) -> Vec<TabletId> {
        self.state
            .lock()
            .await
            .tablets
            .iter()
            .map(|tablet| tablet.id)
            .collect()
    }
}
