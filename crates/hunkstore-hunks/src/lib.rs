//! Hunkstore Hunks - Value separation for sorted tables
//!
//! This crate moves large column values out of primary rows into hunk
//! chunks, including:
//! - Per-column inline/externalize classification and hunk chunk writing
//! - Store-to-hunk reference accounting with transactional updates
//! - Batched hunk reads with replica failover, erasure reconstruction and
//!   hedged backup requests
//! - Garbage collection, store locks and log-backed hunk storage
//! - Compaction-time rewriting of hunk chunks
//! - A sorted table driver tying the pieces together

pub mod backend;
pub mod chunk;
pub mod compaction;
pub mod context;
pub mod gc;
pub mod hedging;
pub mod hunk_storage;
pub mod ledger;
pub mod lock_manager;
pub mod namespace;
pub mod reader;
pub mod repair;
pub mod rows;
pub mod schema;
pub mod stats;
pub mod table;
pub mod task;
pub mod value;
pub mod writer;

// Re-exports
pub use backend::{ChunkBackend, FragmentRange, MemoryChunkBackend, PartKey};
pub use chunk::{ChunkKind, ChunkLayout, ChunkMeta, ChunkState, HunkChunkRef};
pub use compaction::{CompactionPlan, CompactionRewriter, RewriteOutcome};
pub use context::StorageContext;
pub use gc::{GarbageCollector, SweepReport};
pub use hedging::{HedgedRequest, HedgingCounters, HedgingManager};
pub use hunk_storage::HunkStorageLog;
pub use ledger::{
    ChunkAttributes, HunkChunkInfo, HunkLedger, HunkStatistics, LedgerLifecycle, LedgerOp,
    LedgerTransaction,
};
pub use lock_manager::HunkLockManager;
pub use namespace::{Namespace, NodeKind, ROOT_PATH};
pub use reader::{HunkChunkReader, ReadHunkRequest};
pub use repair::{ChunkRepairer, ErasureHealth, RepairReport};
pub use rows::{Row, RowKind, StoredRow};
pub use schema::{ColumnSchema, TableSchema};
pub use stats::{ColumnValueCounts, HunkValueCounters, ReaderStatistics, ValueSource};
pub use table::{Table, TableOptions};
pub use task::BackgroundTask;
pub use value::{HUNK_HEADER_SIZE, HunkRef, HunkValue, ValueClassifier};
pub use writer::{HunkChunkWriter, JournalChunkWriter, write_blob_chunk, write_journal_chunk};
