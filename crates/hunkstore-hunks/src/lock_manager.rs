//! Hunk store lock manager
//!
//! A table holding references into a hunk store locks it; the lock makes the
//! table one of the store's owning nodes. Releasing the last lock of an
//! owner does not drop ownership at once: the owning node is removed after
//! `hunk_store_extra_lifetime`, on the first unlock check that follows, so
//! readers that resolved a reference just before the release can finish.

use crate::context::StorageContext;
use crate::ledger::LedgerTransaction;
use crate::task::BackgroundTask;
use hunkstore_common::{ChunkId, Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct LockEntry {
    count: usize,
    release_at: Option<Instant>,
}

/// Owner-level locks on hunk stores
pub struct HunkLockManager {
    ctx: StorageContext,
    extra_lifetime: Duration,
    check_period: Duration,
    locks: Mutex<HashMap<(ChunkId, String), LockEntry>>,
}

impl HunkLockManager {
    #[must_use]
    pub fn new(ctx: StorageContext) -> Self {
        let extra_lifetime = ctx.config.hunk_lock_manager.hunk_store_extra_lifetime();
        let check_period = ctx.config.hunk_lock_manager.unlock_check_period();
        Self {
            ctx,
            extra_lifetime,
            check_period,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Take one lock on `store_id` for `owner`
    pub fn lock(&self, store_id: ChunkId, owner: &str) -> Result<()> {
        let mut locks = self.locks.lock();
        let key = (store_id, owner.to_owned());
        if let Some(entry) = locks.get_mut(&key) {
            entry.count += 1;
            entry.release_at = None;
            return Ok(());
        }

        let mut txn = LedgerTransaction::new();
        txn.add_owning_node(store_id, owner);
        self.ctx.ledger.commit(&txn)?;
        debug!(chunk_id = %store_id, owner, "Locked hunk store");
        locks.insert(
            key,
            LockEntry {
                count: 1,
                release_at: None,
            },
        );
        Ok(())
    }

    /// Drop one lock; the last one schedules the ownership release
    pub fn unlock(&self, store_id: ChunkId, owner: &str) -> Result<()> {
        let mut locks = self.locks.lock();
        let entry = locks
            .get_mut(&(store_id, owner.to_owned()))
            .filter(|entry| entry.count > 0)
            .ok_or_else(|| {
                Error::InvalidState(format!("{owner} holds no lock on hunk store {store_id}"))
            })?;

        entry.count -= 1;
        if entry.count == 0 {
            entry.release_at = Some(Instant::now() + self.extra_lifetime);
            debug!(chunk_id = %store_id, owner, "Scheduled hunk store unlock");
        }
        Ok(())
    }

    /// Number of locks `owner` holds on `store_id`
    #[must_use]
    pub fn lock_count(&self, store_id: ChunkId, owner: &str) -> usize {
        self.locks
            .lock()
            .get(&(store_id, owner.to_owned()))
            .map_or(0, |entry| entry.count)
    }

    /// Release ownership for every lock whose extra lifetime has passed
    pub fn check_unlocks(&self) -> Vec<(ChunkId, String)> {
        let now = Instant::now();
        let mut locks = self.locks.lock();
        let due: Vec<(ChunkId, String)> = locks
            .iter()
            .filter(|(_, entry)| entry.count == 0 && entry.release_at.is_some_and(|at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();

        let mut released = Vec::with_capacity(due.len());
        for key in due {
            let mut txn = LedgerTransaction::new();
            txn.remove_owning_node(key.0, key.1.as_str());
            match self.ctx.ledger.commit(&txn) {
                Ok(()) => {
                    info!(chunk_id = %key.0, owner = %key.1, "Unlocked hunk store");
                    locks.remove(&key);
                    released.push(key);
                }
                Err(e) => warn!("Failed to unlock hunk store {} for {}: {e}", key.0, key.1),
            }
        }
        released
    }

    /// Run unlock checks every `unlock_check_period`
    pub fn start(self: &Arc<Self>) -> BackgroundTask {
        let manager = Arc::clone(self);
        BackgroundTask::spawn_periodic("hunk-lock-manager", self.check_period, move || {
            let manager = Arc::clone(&manager);
            async move {
                manager.check_unlocks();
            }
        })
    }
}
