//! Row formats of sorted tables

use crate::value::{HunkRef, HunkValue};
use bytes::Bytes;
use hunkstore_common::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A client row: int64 key and one optional value per value column
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    pub key: i64,
    pub values: Vec<Option<Bytes>>,
}

impl Row {
    #[must_use]
    pub const fn new(key: i64, values: Vec<Option<Bytes>>) -> Self {
        Self { key, values }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowKind {
    Write(Vec<Option<HunkValue>>),
    Delete,
}

/// One version of a row as kept in memtables and store chunks
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRow {
    pub key: i64,
    /// Strictly increasing per table
    pub timestamp: u64,
    /// Milliseconds since the table was created
    pub written_at_ms: u64,
    pub kind: RowKind,
}

impl StoredRow {
    /// Hunk references held by the row
    pub fn hunk_refs(&self) -> impl Iterator<Item = &HunkRef> {
        let values: &[Option<HunkValue>] = match &self.kind {
            RowKind::Write(values) => values,
            RowKind::Delete => &[],
        };
        values
            .iter()
            .filter_map(|value| value.as_ref().and_then(HunkValue::hunk_ref))
    }
}

/// Serialize rows into a store chunk block
pub fn encode_store_block(rows: &[StoredRow]) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(rows)?))
}

/// Deserialize a store chunk block
pub fn decode_store_block(block: &[u8]) -> Result<Vec<StoredRow>> {
    Ok(bincode::deserialize(block)?)
}

/// Per-chunk `(hunk_count, total_hunk_length)` of the references held by `rows`
pub fn summarize_refs<'a>(rows: impl IntoIterator<Item = &'a StoredRow>) -> BTreeMap<hunkstore_common::ChunkId, (u64, u64)> {
    let mut summary = BTreeMap::new();
    for row in rows {
        for hunk_ref in row.hunk_refs() {
            let entry = summary.entry(hunk_ref.chunk_id).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += hunk_ref.length;
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use hunkstore_common::ChunkId;

    fn hunk_ref(chunk_id: ChunkId, length: u64) -> HunkRef {
        HunkRef {
            chunk_id,
            block_index: 0,
            block_offset: 0,
            length,
        }
    }

    #[test]
    fn test_store_block_encoding() {
        let chunk_id = ChunkId::new();
        let rows = vec![
            StoredRow {
                key: 1,
                timestamp: 10,
                written_at_ms: 0,
                kind: RowKind::Write(vec![
                    Some(HunkValue::Inline(Bytes::from_static(b"abc"))),
                    Some(HunkValue::Ref(hunk_ref(chunk_id, 26))),
                    None,
                ]),
            },
            StoredRow {
                key: 2,
                timestamp: 11,
                written_at_ms: 5,
                kind: RowKind::Delete,
            },
        ];
        let block = encode_store_block(&rows).unwrap();
        assert_eq!(decode_store_block(&block).unwrap(), rows);
        assert!(decode_store_block(b"\xff").is_err());
    }

    #[test]
    fn test_summarize_refs() {
        let (a, b) = (ChunkId::new(), ChunkId::new());
        let rows = vec![
            StoredRow {
                key: 1,
                timestamp: 1,
                written_at_ms: 0,
                kind: RowKind::Write(vec![
                    Some(HunkValue::Ref(hunk_ref(a, 26))),
                    Some(HunkValue::Ref(hunk_ref(b, 30))),
                ]),
            },
            StoredRow {
                key: 2,
                timestamp: 2,
                written_at_ms: 0,
                kind: RowKind::Write(vec![Some(HunkValue::Ref(hunk_ref(a, 26))), None]),
            },
        ];
        let summary = summarize_refs(&rows);
        assert_eq!(summary[&a], (2, 52));
        assert_eq!(summary[&b], (1, 30));
    }
}
