//! Hedged requests
//!
//! A hedged request sends a primary request and, if it has not completed
//! after a delay, a backup request. The first success wins and the loser is
//! canceled through its [`CancellationToken`] and aborted. Dropping a running
//! hedged request cancels and aborts both sides. A [`HedgingManager`] bounds
//! the share of backup requests.

use hunkstore_common::{Error, HedgingManagerConfig, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::debug;

/// Snapshot of hedging counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HedgingCounters {
    pub primary_request_count: u64,
    pub backup_request_count: u64,
}

/// Admission control for backup requests
///
/// A backup is admitted while `backup + 1 <= ratio * primary`, counted over
/// the manager's lifetime.
#[derive(Debug)]
pub struct HedgingManager {
    max_backup_request_ratio: f64,
    primary: AtomicU64,
    backup: AtomicU64,
}

impl HedgingManager {
    pub fn new(config: &HedgingManagerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            max_backup_request_ratio: config.max_backup_request_ratio,
            primary: AtomicU64::new(0),
            backup: AtomicU64::new(0),
        })
    }

    pub fn on_primary_request(&self) {
        self.primary.fetch_add(1, Ordering::Relaxed);
    }

    /// Reserve a backup request if the budget allows one
    #[allow(clippy::cast_precision_loss)]
    pub fn try_acquire_backup(&self) -> bool {
        let mut backup = self.backup.load(Ordering::Acquire);
        loop {
            let primary = self.primary.load(Ordering::Acquire);
            let budget = self.max_backup_request_ratio * primary as f64;
            if (backup + 1) as f64 > budget {
                return false;
            }
            match self.backup.compare_exchange_weak(
                backup,
                backup + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => backup = current,
            }
        }
    }

    #[must_use]
    pub fn counters(&self) -> HedgingCounters {
        HedgingCounters {
            primary_request_count: self.primary.load(Ordering::Relaxed),
            backup_request_count: self.backup.load(Ordering::Relaxed),
        }
    }
}

enum Finished<T> {
    Primary(Result<T>),
    Backup(Result<T>),
}

fn joined<T>(result: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    match result {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(Error::Canceled),
        Err(e) => Err(Error::internal(format!("hedged request task failed: {e}"))),
    }
}

async fn until_canceled<T>(
    token: CancellationToken,
    request: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(Error::Canceled),
        result = request => result,
    }
}

/// Runs one request with an optional delayed backup
#[derive(Clone, Debug, Default)]
pub struct HedgedRequest {
    manager: Option<Arc<HedgingManager>>,
    delay: Option<Duration>,
}

impl HedgedRequest {
    /// `delay == None` disables hedging; without a manager every backup is admitted
    #[must_use]
    pub const fn new(manager: Option<Arc<HedgingManager>>, delay: Option<Duration>) -> Self {
        Self { manager, delay }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.delay.is_some()
    }

    /// Run `primary`; after the delay, run `backup` too and keep the first success
    ///
    /// When one side fails the other is awaited. The returned error is the
    /// primary's when both fail.
    pub async fn run<T, P, B, BF>(&self, primary: P, backup: B) -> Result<T>
    where
        T: Send + 'static,
        P: Future<Output = Result<T>> + Send + 'static,
        B: FnOnce(CancellationToken) -> BF,
        BF: Future<Output = Result<T>> + Send + 'static,
    {
        if let Some(manager) = &self.manager {
            manager.on_primary_request();
        }
        let Some(delay) = self.delay else {
            return primary.await;
        };

        let token = CancellationToken::new();
        let _cancel_on_drop = token.clone().drop_guard();
        let mut primary = AbortOnDropHandle::new(tokio::spawn(until_canceled(
            token.child_token(),
            primary,
        )));

        tokio::select! {
            biased;
            result = &mut primary => return joined(result),
            () = tokio::time::sleep(delay) => {}
        }

        let admitted = self
            .manager
            .as_ref()
            .is_none_or(|manager| manager.try_acquire_backup());
        if !admitted {
            debug!("Backup request rejected by hedging budget");
            return joined(primary.await);
        }

        debug!(delay_ms = delay.as_millis(), "Sending backup request");
        let backup_token = token.child_token();
        let mut backup = AbortOnDropHandle::new(tokio::spawn(until_canceled(
            backup_token.clone(),
            backup(backup_token),
        )));

        let finished = tokio::select! {
            result = &mut primary => Finished::Primary(joined(result)),
            result = &mut backup => Finished::Backup(joined(result)),
        };
        let result = match finished {
            Finished::Primary(Ok(value)) | Finished::Backup(Ok(value)) => Ok(value),
            Finished::Primary(Err(primary_error)) => {
                joined((&mut backup).await).map_err(|_| primary_error)
            }
            Finished::Backup(Err(_)) => joined((&mut primary).await),
        };

        token.cancel();
        primary.abort();
        backup.abort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;

    fn manager(ratio: f64) -> Arc<HedgingManager> {
        Arc::new(
            HedgingManager::new(&HedgingManagerConfig {
                max_backup_request_ratio: ratio,
            })
            .unwrap(),
        )
    }

    async fn after(delay_ms: u64, value: u32) -> Result<u32> {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(value)
    }

    #[test]
    fn test_backup_budget() {
        let manager = manager(0.5);
        assert!(!manager.try_acquire_backup());
        manager.on_primary_request();
        manager.on_primary_request();
        assert!(manager.try_acquire_backup());
        assert!(!manager.try_acquire_backup());
        assert_eq!(
            manager.counters(),
            HedgingCounters {
                primary_request_count: 2,
                backup_request_count: 1,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_primary_sends_no_backup() {
        let manager = manager(1.0);
        let hedged = HedgedRequest::new(Some(Arc::clone(&manager)), Some(Duration::from_millis(50)));
        let value = hedged.run(after(10, 1), |_| after(0, 2)).await.unwrap();
        assert_eq!(value, 1);
        assert_eq!(manager.counters().backup_request_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_wins_and_primary_is_canceled() {
        let manager = manager(1.0);
        let hedged = HedgedRequest::new(Some(Arc::clone(&manager)), Some(Duration::from_millis(10)));
        let started = tokio::time::Instant::now();
        let value = hedged.run(after(1_000, 1), |_| after(5, 2)).await.unwrap();
        assert_eq!(value, 2);
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(manager.counters().backup_request_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_wins_and_backup_token_is_canceled() {
        let hedged = HedgedRequest::new(None, Some(Duration::from_millis(10)));
        let seen: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);

        let value = hedged
            .run(after(20, 1), move |token| {
                *slot.lock() = Some(token);
                after(1_000, 2)
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
        let token = seen.lock().take().unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted_waits_for_primary() {
        let manager = manager(0.1);
        let hedged = HedgedRequest::new(Some(Arc::clone(&manager)), Some(Duration::from_millis(10)));
        let value = hedged.run(after(100, 1), |_| after(0, 2)).await.unwrap();
        assert_eq!(value, 1);
        assert_eq!(manager.counters().backup_request_count, 0);
        assert_eq!(manager.counters().primary_request_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_primary_falls_back_to_backup() {
        let hedged = HedgedRequest::new(None, Some(Duration::from_millis(10)));
        let value = hedged
            .run(
                async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err(Error::storage("primary failed"))
                },
                |_| after(50, 2),
            )
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_run_stops_both_sides() {
        let hedged = HedgedRequest::new(None, Some(Duration::from_millis(10)));
        let primary_done = Arc::new(AtomicBool::new(false));
        let backup_done = Arc::new(AtomicBool::new(false));
        let seen: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));

        let primary = {
            let done = Arc::clone(&primary_done);
            async move {
                tokio::time::sleep(Duration::from_millis(1_000)).await;
                done.store(true, Ordering::SeqCst);
                Ok::<u32, Error>(1)
            }
        };
        let backup = {
            let done = Arc::clone(&backup_done);
            let slot = Arc::clone(&seen);
            move |token| {
                *slot.lock() = Some(token);
                async move {
                    tokio::time::sleep(Duration::from_millis(1_000)).await;
                    done.store(true, Ordering::SeqCst);
                    Ok::<u32, Error>(2)
                }
            }
        };

        let outcome =
            tokio::time::timeout(Duration::from_millis(50), hedged.run(primary, backup)).await;
        assert!(outcome.is_err());
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(!primary_done.load(Ordering::SeqCst));
        assert!(!backup_done.load(Ordering::SeqCst));
        assert!(seen.lock().take().unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn test_disabled_runs_primary_only() {
        let hedged = HedgedRequest::default();
        assert!(!hedged.is_enabled());
        let value = hedged.run(after(0, 7), |_| after(0, 8)).await.unwrap();
        assert_eq!(value, 7);
    }
}
