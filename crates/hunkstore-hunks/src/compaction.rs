//! Hunk chunk selection and value rewriting during compaction
//!
//! A compaction first decides which hunk chunks of the tablet are worth
//! rewriting: chunks whose garbage ratio exceeds
//! `max_hunk_compaction_garbage_ratio`, and groups of at least two small
//! chunks (below `max_hunk_compaction_size`, smallest first, at most
//! `max_hunk_compaction_chunk_count`). Chunks no surviving row references
//! are dropped outright.
//!
//! Rewriting then walks the surviving rows. A reference whose payload now
//! fits under its column's threshold is read back and inlined. A reference
//! into a rewritten chunk is read back and appended to a fresh hunk chunk.
//! Inline values are never externalized here; a lowered threshold only
//! applies to values written afterwards.

use crate::ledger::HunkChunkInfo;
use crate::reader::{HunkChunkReader, ReadHunkRequest};
use crate::rows::{RowKind, StoredRow};
use crate::value::{HunkRef, HunkValue, ValueClassifier};
use crate::writer::HunkChunkWriter;
use bytes::Bytes;
use hunkstore_common::{ChunkId, Error, HunkCompactionConfig, Result};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Hunk chunks to rewrite and to drop
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionPlan {
    pub rewrite: BTreeSet<ChunkId>,
    pub dropped: BTreeSet<ChunkId>,
}

impl CompactionPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rewrite.is_empty() && self.dropped.is_empty()
    }
}

/// Rows after rewriting plus what changed
#[derive(Debug, Default)]
pub struct RewriteOutcome {
    pub rows: Vec<StoredRow>,
    pub inlined_count: u64,
    pub rewritten_count: u64,
}

impl RewriteOutcome {
    #[must_use]
    pub const fn is_changed(&self) -> bool {
        self.inlined_count > 0 || self.rewritten_count > 0
    }
}

/// Plans and performs hunk rewrites for one compaction
pub struct CompactionRewriter {
    config: HunkCompactionConfig,
}

impl CompactionRewriter {
    pub fn new(config: HunkCompactionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Choose the chunks to rewrite given their post-merge reference counts
    #[must_use]
    pub fn plan(&self, infos: &[HunkChunkInfo]) -> CompactionPlan {
        let mut plan = CompactionPlan::default();
        let mut small = Vec::new();

        for info in infos {
            if info.dangling || info.referenced_hunk_count == 0 {
                plan.dropped.insert(info.chunk_id);
                continue;
            }
            if info.garbage_ratio() > self.config.max_hunk_compaction_garbage_ratio {
                debug!(
                    chunk_id = %info.chunk_id,
                    garbage_ratio = info.garbage_ratio(),
                    "Hunk chunk exceeds garbage ratio"
                );
                plan.rewrite.insert(info.chunk_id);
                continue;
            }
            if info.total_hunk_length < self.config.max_hunk_compaction_size {
                small.push(info);
            }
        }

        small.sort_by_key(|info| (info.total_hunk_length, info.chunk_id));
        small.truncate(self.config.max_hunk_compaction_chunk_count);
        if small.len() >= 2 {
            debug!(chunk_count = small.len(), "Merging small hunk chunks");
            plan.rewrite.extend(small.iter().map(|info| info.chunk_id));
        }
        plan
    }

    /// Rewrite the values of `rows` according to `plan` and the current thresholds
    pub async fn rewrite(
        &self,
        reader: &HunkChunkReader,
        classifier: &ValueClassifier,
        plan: &CompactionPlan,
        writer: &mut HunkChunkWriter,
        rows: Vec<StoredRow>,
    ) -> Result<RewriteOutcome> {
        let must_read = |column: usize, hunk_ref: &HunkRef| {
            let length = usize::try_from(hunk_ref.length).unwrap_or(usize::MAX);
            ValueClassifier::is_inline(classifier.threshold(column), length)
                || plan.rewrite.contains(&hunk_ref.chunk_id)
        };

        let mut wanted: Vec<HunkRef> = Vec::new();
        for row in &rows {
            let RowKind::Write(values) = &row.kind else {
                continue;
            };
            for (column, value) in values.iter().enumerate() {
                if let Some(HunkValue::Ref(hunk_ref)) = value
                    && must_read(column, hunk_ref)
                {
                    wanted.push(*hunk_ref);
                }
            }
        }
        if wanted.is_empty() {
            return Ok(RewriteOutcome {
                rows,
                ..RewriteOutcome::default()
            });
        }
        wanted.sort_by_key(|r| (r.chunk_id, r.block_index, r.block_offset));
        wanted.dedup();

        let requests: Vec<ReadHunkRequest> = wanted.iter().map(ReadHunkRequest::from_ref).collect();
        let responses = reader.read_hunks(&requests).await;
        let mut payloads: HashMap<HunkRef, Bytes> = HashMap::with_capacity(wanted.len());
        for (hunk_ref, response) in wanted.into_iter().zip(responses) {
            payloads.insert(hunk_ref, response?);
        }

        let mut outcome = RewriteOutcome::default();
        let mut moved: HashMap<HunkRef, HunkRef> = HashMap::new();
        for mut row in rows {
            if let RowKind::Write(values) = &mut row.kind {
                for (column, value) in values.iter_mut().enumerate() {
                    let Some(HunkValue::Ref(hunk_ref)) = value else {
                        continue;
                    };
                    let hunk_ref = *hunk_ref;
                    if !must_read(column, &hunk_ref) {
                        continue;
                    }
                    let payload = payloads.get(&hunk_ref).cloned().ok_or_else(|| {
                        Error::internal(format!("hunk of chunk {} was not read", hunk_ref.chunk_id))
                    })?;

                    let length = usize::try_from(hunk_ref.length).unwrap_or(usize::MAX);
                    if ValueClassifier::is_inline(classifier.threshold(column), length) {
                        *value = Some(HunkValue::Inline(payload));
                        outcome.inlined_count += 1;
                    } else {
                        let new_ref = match moved.get(&hunk_ref) {
                            Some(new_ref) => *new_ref,
                            None => {
                                let new_ref = writer.add_hunk(&payload)?;
                                moved.insert(hunk_ref, new_ref);
                                new_ref
                            }
                        };
                        *value = Some(HunkValue::Ref(new_ref));
                        outcome.rewritten_count += 1;
                    }
                }
            }
            outcome.rows.push(row);
        }

        debug!(
            inlined = outcome.inlined_count,
            rewritten = outcome.rewritten_count,
            "Rewrote hunk values"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StorageContext;
    use crate::schema::{ColumnSchema, TableSchema};
    use hunkstore_common::{ErasureCodecId, HunkStoreConfig};
    use hunkstore_placement::ClusterTopology;

    fn info(total_hunk_length: u64, referenced_total_hunk_length: u64) -> HunkChunkInfo {
        HunkChunkInfo {
            chunk_id: ChunkId::new(),
            hunk_count: 10,
            total_hunk_length,
            referenced_hunk_count: u64::from(referenced_total_hunk_length > 0),
            referenced_total_hunk_length,
            store_ref_count: usize::from(referenced_total_hunk_length > 0),
            dangling: referenced_total_hunk_length == 0,
        }
    }

    fn rewriter(max_size: u64, max_count: usize) -> CompactionRewriter {
        CompactionRewriter::new(HunkCompactionConfig {
            max_hunk_compaction_garbage_ratio: 0.5,
            max_hunk_compaction_size: max_size,
            max_hunk_compaction_chunk_count: max_count,
        })
        .unwrap()
    }

    #[test]
    fn test_garbage_ratio_selects_chunk() {
        let garbage = info(100, 40);
        let healthy = info(100, 50);
        let plan = rewriter(1, 10).plan(&[garbage, healthy]);
        assert_eq!(plan.rewrite, BTreeSet::from([garbage.chunk_id]));
        assert!(plan.dropped.is_empty());
    }

    #[test]
    fn test_dangling_chunks_dropped() {
        let dangling = info(100, 0);
        let plan = rewriter(1, 10).plan(&[dangling]);
        assert_eq!(plan.dropped, BTreeSet::from([dangling.chunk_id]));
        assert!(plan.rewrite.is_empty());
    }

    #[test]
    fn test_small_chunks_merge_smallest_first() {
        let (a, b, c) = (info(30, 30), info(10, 10), info(20, 20));
        let plan = rewriter(100, 2).plan(&[a, b, c]);
        assert_eq!(plan.rewrite, BTreeSet::from([b.chunk_id, c.chunk_id]));

        let plan = rewriter(100, 2).plan(&[a]);
        assert!(plan.is_empty());

        let plan = rewriter(5, 2).plan(&[a, b, c]);
        assert!(plan.is_empty());
    }

    fn classifier(threshold: usize) -> ValueClassifier {
        ValueClassifier::new(
            &TableSchema::new(
                "key",
                vec![ColumnSchema::with_max_inline_hunk_size("value", threshold)],
            )
            .unwrap(),
        )
    }

    fn row(key: i64, value: HunkValue) -> StoredRow {
        StoredRow {
            key,
            timestamp: key.unsigned_abs(),
            written_at_ms: 0,
            kind: RowKind::Write(vec![Some(value)]),
        }
    }

    #[tokio::test]
    async fn test_rewrite_inlines_and_moves() {
        let (ctx, _backend) =
            StorageContext::in_memory(HunkStoreConfig::default(), ClusterTopology::with_nodes(4, 2))
                .unwrap();
        let mut old = HunkChunkWriter::new(ErasureCodecId::None, &ctx.config.hunk_chunk_writer);
        let short = old.add_hunk(b"0123456789abcdef").unwrap();
        let long = old.add_hunk(&[b'x'; 40]).unwrap();
        let old_id = old.chunk_id();
        old.close(&ctx).await.unwrap();

        let reader = HunkChunkReader::new(ctx.clone()).unwrap();
        let rows = vec![
            row(1, HunkValue::Ref(short)),
            row(2, HunkValue::Ref(long)),
            row(3, HunkValue::Inline(Bytes::from_static(b"inline value longer than twenty"))),
        ];
        let plan = CompactionPlan {
            rewrite: BTreeSet::from([old_id]),
            dropped: BTreeSet::new(),
        };

        let mut writer = HunkChunkWriter::new(ErasureCodecId::None, &ctx.config.hunk_chunk_writer);
        let outcome = rewriter(1, 10)
            .rewrite(&reader, &classifier(20), &plan, &mut writer, rows)
            .await
            .unwrap();

        assert_eq!(outcome.inlined_count, 1);
        assert_eq!(outcome.rewritten_count, 1);
        assert_eq!(writer.hunk_count(), 1);
        let RowKind::Write(values) = &outcome.rows[0].kind else {
            panic!("expected a write");
        };
        assert_eq!(
            values[0],
            Some(HunkValue::Inline(Bytes::from_static(b"0123456789abcdef")))
        );
        let RowKind::Write(values) = &outcome.rows[1].kind else {
            panic!("expected a write");
        };
        let moved = values[0].as_ref().and_then(HunkValue::hunk_ref).unwrap();
        assert_eq!(moved.chunk_id, writer.chunk_id());
        assert_eq!(moved.length, 40);
        let RowKind::Write(values) = &outcome.rows[2].kind else {
            panic!("expected a write");
        };
        assert!(matches!(values[0], Some(HunkValue::Inline(_))));
    }

    #[tokio::test]
    async fn test_rewrite_without_work_keeps_rows() {
        let (ctx, _backend) =
            StorageContext::in_memory(HunkStoreConfig::default(), ClusterTopology::with_nodes(4, 2))
                .unwrap();
        let reader = HunkChunkReader::new(ctx.clone()).unwrap();
        let hunk_ref = HunkRef {
            chunk_id: ChunkId::new(),
            block_index: 0,
            block_offset: 0,
            length: 40,
        };
        let rows = vec![row(1, HunkValue::Ref(hunk_ref))];
        let mut writer = HunkChunkWriter::new(ErasureCodecId::None, &ctx.config.hunk_chunk_writer);
        let outcome = rewriter(1, 10)
            .rewrite(&reader, &classifier(20), &CompactionPlan::default(), &mut writer, rows.clone())
            .await
            .unwrap();
        assert!(!outcome.is_changed());
        assert_eq!(outcome.rows, rows);
        assert!(writer.is_empty());
    }
}
