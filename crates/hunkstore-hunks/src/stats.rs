//! Value and read counters

use crate::value::HunkValue;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Operation that produced or consumed a column value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueSource {
    Flush,
    Compaction,
    Lookup,
}

/// Snapshot of one column's counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnValueCounts {
    pub inline_value_count: u64,
    pub ref_value_count: u64,
    pub inline_value_weight: u64,
    pub ref_value_weight: u64,
}

#[derive(Default)]
struct ColumnCells {
    inline_value_count: AtomicU64,
    ref_value_count: AtomicU64,
    inline_value_weight: AtomicU64,
    ref_value_weight: AtomicU64,
}

/// Per-column inline/ref value counters of a table
#[derive(Default)]
pub struct HunkValueCounters {
    columns: DashMap<(ValueSource, String), ColumnCells>,
}

impl HunkValueCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one value of `column`
    pub fn record(&self, source: ValueSource, column: &str, value: &HunkValue) {
        let cells = self
            .columns
            .entry((source, column.to_owned()))
            .or_default();
        match value {
            HunkValue::Inline(bytes) => {
                cells.inline_value_count.fetch_add(1, Ordering::Relaxed);
                cells
                    .inline_value_weight
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            }
            HunkValue::Ref(hunk_ref) => {
                cells.ref_value_count.fetch_add(1, Ordering::Relaxed);
                cells
                    .ref_value_weight
                    .fetch_add(hunk_ref.length, Ordering::Relaxed);
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self, source: ValueSource, column: &str) -> ColumnValueCounts {
        self.columns
            .get(&(source, column.to_owned()))
            .map(|cells| ColumnValueCounts {
                inline_value_count: cells.inline_value_count.load(Ordering::Relaxed),
                ref_value_count: cells.ref_value_count.load(Ordering::Relaxed),
                inline_value_weight: cells.inline_value_weight.load(Ordering::Relaxed),
                ref_value_weight: cells.ref_value_weight.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }
}

/// Snapshot of reader counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderStatistics {
    /// Fragment read calls sent to storage nodes
    pub backend_read_request_count: u64,
    /// Bytes received from storage nodes, reconstruction reads included
    pub data_bytes_transmitted: u64,
    /// Bytes returned to callers
    pub data_weight: u64,
}

#[derive(Default)]
pub(crate) struct ReaderCounters {
    backend_read_request_count: AtomicU64,
    data_bytes_transmitted: AtomicU64,
    data_weight: AtomicU64,
}

impl ReaderCounters {
    pub(crate) fn on_backend_read(&self, bytes: u64) {
        self.backend_read_request_count
            .fetch_add(1, Ordering::Relaxed);
        self.data_bytes_transmitted
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn on_response(&self, bytes: u64) {
        self.data_weight.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ReaderStatistics {
        ReaderStatistics {
            backend_read_request_count: self.backend_read_request_count.load(Ordering::Relaxed),
            data_bytes_transmitted: self.data_bytes_transmitted.load(Ordering::Relaxed),
            data_weight: self.data_weight.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::HunkRef;
    use bytes::Bytes;
    use hunkstore_common::ChunkId;

    #[test]
    fn test_value_counters_by_source() {
        let counters = HunkValueCounters::new();
        counters.record(
            ValueSource::Flush,
            "value",
            &HunkValue::Inline(Bytes::from_static(b"abc")),
        );
        counters.record(
            ValueSource::Flush,
            "value",
            &HunkValue::Ref(HunkRef {
                chunk_id: ChunkId::new(),
                block_index: 0,
                block_offset: 0,
                length: 26,
            }),
        );

        let flush = counters.snapshot(ValueSource::Flush, "value");
        assert_eq!(flush.inline_value_count, 1);
        assert_eq!(flush.ref_value_count, 1);
        assert_eq!(flush.inline_value_weight, 3);
        assert_eq!(flush.ref_value_weight, 26);
        assert_eq!(
            counters.snapshot(ValueSource::Lookup, "value"),
            ColumnValueCounts::default()
        );
    }

    #[test]
    fn test_reader_counters() {
        let counters = ReaderCounters::default();
        counters.on_backend_read(100);
        counters.on_backend_read(50);
        counters.on_response(26);
        let stats = counters.snapshot();
        assert_eq!(stats.backend_read_request_count, 2);
        assert_eq!(stats.data_bytes_transmitted, 150);
        assert_eq!(stats.data_weight, 26);
    }
}
