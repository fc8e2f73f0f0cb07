//! Chunk garbage collector
//!
//! Each sweep removes chunks that have had `ref_counter == 0` and no owning
//! nodes for at least the removal grace period. A chunk is first claimed in
//! the ledger, then its parts are deleted, then its record is dropped. A
//! failed deletion releases the claim and is retried on the next sweep.

use crate::chunk::{ChunkLayout, ChunkMeta};
use crate::context::StorageContext;
use crate::task::BackgroundTask;
use crate::writer::part_key;
use futures::future::try_join_all;
use hunkstore_common::{ChunkId, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one sweep
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<ChunkId>,
    pub failed: Vec<ChunkId>,
}

/// Periodic deleter of unreferenced chunks
pub struct GarbageCollector {
    ctx: StorageContext,
    grace: Duration,
    period: Duration,
}

impl GarbageCollector {
    #[must_use]
    pub fn new(ctx: StorageContext) -> Self {
        let grace = ctx.config.gc.removal_grace_period();
        let period = ctx.config.gc.sweep_period();
        Self { ctx, grace, period }
    }

    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        self.grace
    }

    /// Remove every chunk whose grace period has elapsed
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for chunk_id in self
            .ctx
            .ledger
            .garbage_candidates(Instant::now(), self.grace)
        {
            let meta = match self.ctx.ledger.begin_removal(chunk_id) {
                Ok(meta) => meta,
                Err(e) => {
                    debug!(chunk_id = %chunk_id, "Skipping garbage candidate: {e}");
                    continue;
                }
            };

            match self.remove_parts(&meta).await {
                Ok(()) => match self.ctx.ledger.finish_removal(chunk_id) {
                    Ok(()) => report.removed.push(chunk_id),
                    Err(e) => {
                        warn!("Failed to drop chunk {chunk_id} from the ledger: {e}");
                        report.failed.push(chunk_id);
                    }
                },
                Err(e) => {
                    warn!("Failed to remove chunk {chunk_id}, will retry: {e}");
                    self.ctx.ledger.abort_removal(chunk_id);
                    report.failed.push(chunk_id);
                }
            }
        }

        if !report.removed.is_empty() || !report.failed.is_empty() {
            info!(
                "GC sweep removed {} chunks, {} failed",
                report.removed.len(),
                report.failed.len()
            );
        }
        report
    }

    async fn remove_parts(&self, meta: &ChunkMeta) -> Result<()> {
        let mut removals = Vec::with_capacity(meta.layout.nodes().len());
        match &meta.layout {
            ChunkLayout::Replicated { replicas } => {
                for node in replicas {
                    removals.push((*node, part_key(meta.id, 0)?));
                }
            }
            ChunkLayout::Erasure { parts } => {
                for (index, node) in parts.iter().enumerate() {
                    removals.push((*node, part_key(meta.id, index)?));
                }
            }
        }
        try_join_all(
            removals
                .into_iter()
                .map(|(node, key)| self.ctx.backend.remove_part(node, key)),
        )
        .await?;
        Ok(())
    }

    /// Run sweeps every `sweep_period` in the background
    pub fn start(self: &Arc<Self>) -> BackgroundTask {
        let gc = Arc::clone(self);
        BackgroundTask::spawn_periodic("garbage-collector", self.period, move || {
            let gc = Arc::clone(&gc);
            async move {
                gc.sweep().await;
            }
        })
    }

    /// Stop accepting new chunks, wait out the grace period and sweep once more
    ///
    /// Returns the final report; chunks still referenced or owned stay in place.
    pub async fn drain(&self) -> SweepReport {
        self.ctx.ledger.begin_drain();
        tokio::time::sleep(self.grace).await;
        let report = self.sweep().await;
        info!(
            "Ledger drained, {} unreferenced chunks left",
            self.ctx.ledger.pending_garbage_count()
        );
        report
    }
}
