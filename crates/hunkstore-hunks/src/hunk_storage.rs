//! Log-backed hunk storage
//!
//! A hunk storage log appends payloads to an active journal hunk chunk (its
//! "store"). The storage node itself is an owning node of every store it
//! created. Stores are rotated every `store_rotation_period`; a sealed store
//! stops being owned by the storage `store_removal_grace_period` after it
//! was sealed. Tables writing through the log lock the stores they
//! reference, so a sealed store lives as long as any table still needs it.

use crate::context::StorageContext;
use crate::ledger::LedgerTransaction;
use crate::task::BackgroundTask;
use crate::value::HunkRef;
use crate::writer::JournalChunkWriter;
use bytes::Bytes;
use hunkstore_common::{ChunkId, Error, ErasureCodecId, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug)]
struct SealedStore {
    chunk_id: ChunkId,
    sealed_at: Instant,
}

struct ActiveStore {
    writer: JournalChunkWriter,
    created_at: Instant,
}

/// Append-only hunk storage with periodic store rotation
pub struct HunkStorageLog {
    ctx: StorageContext,
    path: String,
    erasure_codec: ErasureCodecId,
    rotation_period: Duration,
    removal_grace_period: Duration,
    active: tokio::sync::Mutex<Option<ActiveStore>>,
    active_id: Mutex<Option<ChunkId>>,
    sealed: Mutex<Vec<SealedStore>>,
}

impl HunkStorageLog {
    /// Create the log at `path` with its first active store
    pub fn create(
        ctx: StorageContext,
        path: impl Into<String>,
        erasure_codec: ErasureCodecId,
    ) -> Result<Self> {
        let path = path.into();
        let writer = Self::open_store(&ctx, &path, erasure_codec)?;
        let chunk_id = writer.chunk_id();
        info!(chunk_id = %chunk_id, path = %path, "Created hunk storage");

        Ok(Self {
            rotation_period: ctx.config.hunk_storage.store_rotation_period(),
            removal_grace_period: ctx.config.hunk_storage.store_removal_grace_period(),
            ctx,
            path,
            erasure_codec,
            active: tokio::sync::Mutex::new(Some(ActiveStore {
                writer,
                created_at: Instant::now(),
            })),
            active_id: Mutex::new(Some(chunk_id)),
            sealed: Mutex::new(Vec::new()),
        })
    }

    fn open_store(
        ctx: &StorageContext,
        path: &str,
        erasure_codec: ErasureCodecId,
    ) -> Result<JournalChunkWriter> {
        let writer = JournalChunkWriter::create(ctx, erasure_codec)?;
        let mut txn = LedgerTransaction::new();
        txn.add_owning_node(writer.chunk_id(), path);
        ctx.ledger.commit(&txn)?;
        Ok(writer)
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Store receiving appends; `None` once unmounted
    #[must_use]
    pub fn active_store_id(&self) -> Option<ChunkId> {
        *self.active_id.lock()
    }

    /// Sealed stores still owned by the storage
    #[must_use]
    pub fn sealed_store_ids(&self) -> Vec<ChunkId> {
        self.sealed.lock().iter().map(|s| s.chunk_id).collect()
    }

    /// Append payloads to the active store as one block
    pub async fn append(&self, payloads: &[Bytes]) -> Result<Vec<HunkRef>> {
        let mut active = self.active.lock().await;
        let store = active
            .as_mut()
            .ok_or_else(|| Error::InvalidState(format!("hunk storage {} is unmounted", self.path)))?;
        let refs = store.writer.append_hunks(&self.ctx, payloads).await?;
        debug!(
            chunk_id = %store.writer.chunk_id(),
            hunk_count = refs.len(),
            "Appended hunks to hunk storage"
        );
        Ok(refs)
    }

    /// Seal the active store and open a new one
    pub async fn rotate(&self) -> Result<ChunkId> {
        let mut active = self.active.lock().await;
        let current = active
            .take()
            .ok_or_else(|| Error::InvalidState(format!("hunk storage {} is unmounted", self.path)))?;

        let writer = match Self::open_store(&self.ctx, &self.path, self.erasure_codec) {
            Ok(writer) => writer,
            Err(e) => {
                *active = Some(current);
                return Err(e);
            }
        };
        let new_id = writer.chunk_id();
        *active = Some(ActiveStore {
            writer,
            created_at: Instant::now(),
        });
        *self.active_id.lock() = Some(new_id);

        let old_id = current.writer.chunk_id();
        self.seal_store(current.writer)?;
        info!(path = %self.path, sealed = %old_id, active = %new_id, "Rotated hunk store");
        Ok(new_id)
    }

    fn seal_store(&self, writer: JournalChunkWriter) -> Result<()> {
        let chunk_id = writer.chunk_id();
        writer.seal(&self.ctx)?;
        self.sealed.lock().push(SealedStore {
            chunk_id,
            sealed_at: Instant::now(),
        });
        Ok(())
    }

    /// Give up ownership of stores sealed longer than the removal grace period
    pub fn sweep_sealed(&self) -> Vec<ChunkId> {
        let now = Instant::now();
        let mut sealed = self.sealed.lock();
        let mut released = Vec::new();

        sealed.retain(|store| {
            if now.saturating_duration_since(store.sealed_at) < self.removal_grace_period {
                return true;
            }
            let mut txn = LedgerTransaction::new();
            txn.remove_owning_node(store.chunk_id, self.path.as_str());
            match self.ctx.ledger.commit(&txn) {
                Ok(()) => {
                    debug!(chunk_id = %store.chunk_id, path = %self.path, "Released sealed hunk store");
                    released.push(store.chunk_id);
                    false
                }
                Err(e) => {
                    warn!("Failed to release hunk store {}: {e}", store.chunk_id);
                    true
                }
            }
        });
        released
    }

    /// Seal the active store and stop accepting appends
    pub async fn unmount(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        let Some(current) = active.take() else {
            return Ok(());
        };
        *self.active_id.lock() = None;
        self.seal_store(current.writer)?;
        info!(path = %self.path, "Unmounted hunk storage");
        Ok(())
    }

    async fn tick(&self) {
        let due = {
            let active = self.active.lock().await;
            active.as_ref().is_some_and(|store| {
                store.writer.block_count() > 0 && store.created_at.elapsed() >= self.rotation_period
            })
        };
        if due && let Err(e) = self.rotate().await {
            warn!("Failed to rotate hunk storage {}: {e}", self.path);
        }
        self.sweep_sealed();
    }

    /// Rotate and release stores in the background
    pub fn start(self: &Arc<Self>) -> BackgroundTask {
        let log = Arc::clone(self);
        let period = self.rotation_period.min(self.removal_grace_period);
        BackgroundTask::spawn_periodic("hunk-storage", period, move || {
            let log = Arc::clone(&log);
            async move {
                log.tick().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_manager::HunkLockManager;
    use crate::reader::{HunkChunkReader, ReadHunkRequest};
    use hunkstore_common::HunkStoreConfig;
    use hunkstore_placement::ClusterTopology;

    fn context() -> StorageContext {
        StorageContext::in_memory(HunkStoreConfig::default(), ClusterTopology::with_nodes(6, 3))
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let ctx = context();
        let log = HunkStorageLog::create(ctx.clone(), "//tmp/h", ErasureCodecId::None).unwrap();
        let first = log
            .append(&[Bytes::from_static(b"abc"), Bytes::from_static(b"defgh")])
            .await
            .unwrap();
        let second = log.append(&[Bytes::from_static(b"xyz")]).await.unwrap();
        assert_eq!(first[1].block_index, 0);
        assert_eq!(second[0].block_index, 1);

        let reader = HunkChunkReader::new(ctx).unwrap();
        let responses = reader
            .read_hunks(&[
                ReadHunkRequest::from_ref(&first[1]),
                ReadHunkRequest::from_ref(&second[0]),
            ])
            .await;
        assert_eq!(responses[0].as_ref().unwrap().as_ref(), b"defgh");
        assert_eq!(responses[1].as_ref().unwrap().as_ref(), b"xyz");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_releases_storage_ownership() {
        let ctx = context();
        let log = HunkStorageLog::create(ctx.clone(), "//tmp/h", ErasureCodecId::None).unwrap();
        let locks = HunkLockManager::new(ctx.clone());

        let store_id = log.active_store_id().unwrap();
        log.append(&[Bytes::from_static(b"payload")]).await.unwrap();
        locks.lock(store_id, "//tmp/t").unwrap();
        assert_eq!(
            ctx.ledger.owning_nodes(store_id).unwrap(),
            vec!["//tmp/h", "//tmp/t"]
        );

        let next = log.rotate().await.unwrap();
        assert_ne!(next, store_id);
        assert_eq!(log.sealed_store_ids(), vec![store_id]);
        assert!(log.sweep_sealed().is_empty());

        tokio::time::advance(ctx.config.hunk_storage.store_removal_grace_period()).await;
        assert_eq!(log.sweep_sealed(), vec![store_id]);
        assert_eq!(ctx.ledger.owning_nodes(store_id).unwrap(), vec!["//tmp/t"]);
    }

    #[tokio::test]
    async fn test_unmount_stops_appends() {
        let ctx = context();
        let log = HunkStorageLog::create(ctx, "//tmp/h", ErasureCodecId::None).unwrap();
        log.unmount().await.unwrap();
        assert!(log.active_store_id().is_none());
        assert!(log.append(&[Bytes::from_static(b"x")]).await.is_err());
        assert!(log.rotate().await.is_err());
        log.unmount().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_rotation() {
        let mut config = HunkStoreConfig::default();
        config.hunk_storage.store_rotation_period_ms = 1_000;
        config.hunk_storage.store_removal_grace_period_ms = 500;
        let ctx = StorageContext::in_memory(config, ClusterTopology::with_nodes(6, 3))
            .unwrap()
            .0;
        let log = Arc::new(HunkStorageLog::create(ctx.clone(), "//tmp/h", ErasureCodecId::None).unwrap());
        let first = log.active_store_id().unwrap();
        log.append(&[Bytes::from_static(b"payload")]).await.unwrap();

        let task = log.start();
        tokio::time::sleep(Duration::from_millis(2_600)).await;
        task.stop().await;

        assert_ne!(log.active_store_id(), Some(first));
        assert!(ctx.ledger.owning_nodes(first).unwrap().is_empty());
    }
}
