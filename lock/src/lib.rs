//! # Merx Lock
//!
//! Named, leased, fenced mutual exclusion across processes.
//!
//! Aggregates are exclusively owned by one process at a time; the lock keyed
//! on the aggregate id enforces it. The manager combines two layers:
//!
//! 1. a **local per-key mutex registry**: the in-process fast path, always
//!    acquired first;
//! 2. a **cluster [`store::LockStore`]**: one live holder per key across
//!    the whole cluster, with a lease and a monotonic fencing token.
//!
//! While the guarded future runs, a watchdog renews the lease at a third of
//! its duration. If renewal cannot be re-established within one full lease
//! the lock is considered lost: the guarded future is abandoned and its
//! result discarded.
//!
//! Callers acquiring multiple keys must use [`LockManager::with_locks`],
//! which sorts keys into a total order before acquiring; this is the
//! deadlock avoidance rule of the platform.
//!
//! # Example
//!
//! ```rust
//! use merx_core::config::LockConfig;
//! use merx_lock::{LockManager, store::InMemoryLockStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = LockManager::new(LockConfig::default(), Arc::new(InMemoryLockStore::new()));
//!
//! let value = manager
//!     .with_lock("product:42", |token| async move {
//!         // Exclusive per-key section; `token` fences downstream writes.
//!         token.value()
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod store;

use merx_core::config::LockConfig;
use merx_core::error::{Classify, ErrorKind};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use store::{FencingToken, LockStore, LockStoreError};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, oneshot};

/// Errors from lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// The wait budget elapsed before the key could be acquired.
    #[error("Failed to acquire lock '{key}' within {waited_ms}ms")]
    AcquisitionTimeout {
        /// The contended key.
        key: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The lease was lost while the guarded section was running; its result
    /// was discarded.
    #[error("Lock '{key}' lost during execution")]
    LostDuringExecution {
        /// The key whose lease was lost.
        key: String,
    },

    /// The lock store backend failed.
    #[error(transparent)]
    Store(#[from] LockStoreError),
}

impl Classify for LockError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::AcquisitionTimeout { .. } | Self::LostDuringExecution { .. } => {
                ErrorKind::TransientInfra
            }
            Self::Store(_) => ErrorKind::Fatal,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::AcquisitionTimeout { .. } => "LOCK_ACQUISITION_TIMEOUT",
            Self::LostDuringExecution { .. } => "LOCK_LOST",
            Self::Store(_) => "LOCK_STORE_FAILURE",
        }
    }
}

/// Polling interval while contending for the cluster store.
const CONTEND_INTERVAL: Duration = Duration::from_millis(20);

/// Distributed lock manager.
///
/// Cheap to clone is not needed; services hold it in an `Arc`.
pub struct LockManager {
    config: LockConfig,
    cluster: Arc<dyn LockStore>,
    local: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    holder_prefix: String,
    sequence: AtomicU64,
}

impl LockManager {
    /// Create a manager over the given cluster store.
    #[must_use]
    pub fn new(config: LockConfig, cluster: Arc<dyn LockStore>) -> Self {
        Self {
            config,
            cluster,
            local: Mutex::new(HashMap::new()),
            holder_prefix: format!("merx-{}", uuid::Uuid::new_v4()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Run `f` while holding the lock for `key`, using configured budgets.
    ///
    /// # Errors
    ///
    /// - [`LockError::AcquisitionTimeout`] if the key could not be acquired
    ///   within the wait budget (callers translate to 503 or retry).
    /// - [`LockError::LostDuringExecution`] if the lease could not be held;
    ///   `f`'s result is discarded.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, f: F) -> Result<T, LockError>
    where
        F: FnOnce(FencingToken) -> Fut,
        Fut: Future<Output = T> + Send,
        T: Send,
    {
        self.with_lock_budget(key, self.config.wait_budget(), self.config.lease(), f)
            .await
    }

    /// Run `f` while holding the lock for `key` with explicit budgets.
    ///
    /// # Errors
    ///
    /// See [`LockManager::with_lock`].
    pub async fn with_lock_budget<F, Fut, T>(
        &self,
        key: &str,
        wait_budget: Duration,
        lease: Duration,
        f: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce(FencingToken) -> Fut,
        Fut: Future<Output = T> + Send,
        T: Send,
    {
        let guard = self.acquire(key, wait_budget, lease).await?;
        let token = guard.token;

        if self.config.watchdog_enabled {
            let (lost_tx, lost_rx) = oneshot::channel();
            let watchdog = self.spawn_watchdog(guard.key.clone(), guard.holder.clone(), lease, lost_tx);
            let _abort = AbortOnDrop(watchdog);

            let result = tokio::select! {
                value = f(token) => Ok(value),
                _ = lost_rx => {
                    metrics::counter!("lock_lost_total").increment(1);
                    tracing::warn!(key = %guard.key, "Lease lost during execution, discarding result");
                    Err(LockError::LostDuringExecution { key: guard.key.clone() })
                }
            };

            guard.release(self.cluster.as_ref()).await;
            result
        } else {
            let value = f(token).await;
            guard.release(self.cluster.as_ref()).await;
            Ok(value)
        }
    }

    /// Run `f` while holding every key in `keys`.
    ///
    /// Keys are deduplicated and acquired in sorted order so two callers can
    /// never wait on each other in a cycle. Tokens are passed to `f` in the
    /// same sorted order.
    ///
    /// # Errors
    ///
    /// See [`LockManager::with_lock`]; on any failure every already-held key
    /// is released before the error returns.
    pub async fn with_locks<F, Fut, T>(&self, keys: &[String], f: F) -> Result<T, LockError>
    where
        F: FnOnce(Vec<FencingToken>) -> Fut,
        Fut: Future<Output = T> + Send,
        T: Send,
    {
        let mut sorted: Vec<&String> = keys.iter().collect();
        sorted.sort();
        sorted.dedup();

        let wait_budget = self.config.wait_budget();
        let lease = self.config.lease();

        let mut guards: Vec<Guard> = Vec::with_capacity(sorted.len());
        for key in sorted {
            match self.acquire(key, wait_budget, lease).await {
                Ok(guard) => guards.push(guard),
                Err(err) => {
                    for guard in guards.into_iter().rev() {
                        guard.release(self.cluster.as_ref()).await;
                    }
                    return Err(err);
                }
            }
        }

        let tokens = guards.iter().map(|g| g.token).collect();
        let value = f(tokens).await;

        for guard in guards.into_iter().rev() {
            guard.release(self.cluster.as_ref()).await;
        }
        Ok(value)
    }

    /// Acquire local mutex then cluster store, within the wait budget.
    async fn acquire(
        &self,
        key: &str,
        wait_budget: Duration,
        lease: Duration,
    ) -> Result<Guard, LockError> {
        let started = Instant::now();
        let deadline = started + wait_budget;
        let holder = format!(
            "{}-{}",
            self.holder_prefix,
            self.sequence.fetch_add(1, Ordering::Relaxed)
        );

        // Local fast path first. The tokio mutex queues waiters FIFO, which
        // is the in-process half of the fairness story.
        let local = self.local_entry(key).await;
        let local_guard = tokio::time::timeout_at(deadline.into(), local.lock_owned())
            .await
            .map_err(|_| {
                metrics::counter!("lock_timeouts_total").increment(1);
                LockError::AcquisitionTimeout {
                    key: key.to_string(),
                    waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                }
            })?;

        // Then the cluster store, polling until the deadline.
        loop {
            match self.cluster.try_acquire(key, &holder, lease).await? {
                Some(token) => {
                    metrics::counter!("lock_acquisitions_total").increment(1);
                    metrics::histogram!("lock_wait_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    tracing::debug!(key, %token, "Lock acquired");
                    return Ok(Guard {
                        key: key.to_string(),
                        holder,
                        token,
                        _local: local_guard,
                    });
                }
                None => {
                    if Instant::now() + CONTEND_INTERVAL >= deadline {
                        metrics::counter!("lock_timeouts_total").increment(1);
                        tracing::debug!(key, waited_ms = started.elapsed().as_millis(), "Lock wait budget exhausted");
                        return Err(LockError::AcquisitionTimeout {
                            key: key.to_string(),
                            waited_ms: u64::try_from(started.elapsed().as_millis())
                                .unwrap_or(u64::MAX),
                        });
                    }
                    let interval = if self.config.fair {
                        CONTEND_INTERVAL
                    } else {
                        // Jittered contention spreads competing waiters.
                        use rand::Rng;
                        CONTEND_INTERVAL.mul_f64(rand::thread_rng().gen_range(0.5..=1.5))
                    };
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    async fn local_entry(&self, key: &str) -> Arc<Mutex<()>> {
        let mut registry = self.local.lock().await;
        Arc::clone(
            registry
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Renew the lease at `lease/3`; signal loss once renewal has been
    /// failing for longer than one full lease.
    fn spawn_watchdog(
        &self,
        key: String,
        holder: String,
        lease: Duration,
        lost_tx: oneshot::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        let cluster = Arc::clone(&self.cluster);
        tokio::spawn(async move {
            let interval = lease / 3;
            let mut last_renewed = Instant::now();

            loop {
                tokio::time::sleep(interval).await;

                match cluster.renew(&key, &holder, lease).await {
                    Ok(true) => last_renewed = Instant::now(),
                    Ok(false) => {
                        tracing::warn!(key, "Lease no longer held, signalling loss");
                        let _ = lost_tx.send(());
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(key, error = %err, "Lease renewal failed");
                        if last_renewed.elapsed() > lease {
                            let _ = lost_tx.send(());
                            return;
                        }
                    }
                }
            }
        })
    }
}

/// A held key: cluster identity plus the local registry guard.
struct Guard {
    key: String,
    holder: String,
    token: FencingToken,
    _local: OwnedMutexGuard<()>,
}

impl Guard {
    async fn release(self, cluster: &dyn LockStore) {
        if let Err(err) = cluster.release(&self.key, &self.holder).await {
            // The lease will expire on its own; log and move on.
            tracing::warn!(key = %self.key, error = %err, "Lock release failed");
        }
    }
}

/// Aborts the watchdog task when the guarded section ends (or is cancelled).
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use crate::store::InMemoryLockStore;
    use std::pin::Pin;

    fn manager(config: LockConfig) -> LockManager {
        LockManager::new(config, Arc::new(InMemoryLockStore::new()))
    }

    #[tokio::test]
    async fn serializes_critical_sections_per_key() {
        let manager = Arc::new(manager(LockConfig::default()));
        let in_section = Arc::new(AtomicU64::new(0));
        let overlaps = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = Arc::clone(&manager);
            let in_section = Arc::clone(&in_section);
            let overlaps = Arc::clone(&overlaps);
            handles.push(tokio::spawn(async move {
                manager
                    .with_lock("product:1", |_| async {
                        if in_section.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        in_section.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn different_keys_run_in_parallel() {
        let manager = Arc::new(manager(LockConfig::default()));

        let a = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .with_lock("product:a", |_| async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    })
                    .await
                    .unwrap();
            })
        };
        let b = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .with_lock("product:b", |_| async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    })
                    .await
                    .unwrap();
            })
        };

        let started = Instant::now();
        a.await.unwrap();
        b.await.unwrap();
        // Both sections overlap, so the total is far below 100ms.
        assert!(started.elapsed() < Duration::from_millis(95));
    }

    #[tokio::test]
    async fn acquisition_times_out_within_budget() {
        let config = LockConfig {
            wait_ms: 50,
            ..LockConfig::default()
        };
        let manager = Arc::new(manager(config));

        let holder = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .with_lock("product:1", |_| async {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                    })
                    .await
                    .unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = manager.with_lock("product:1", |_| async { 1 }).await;
        assert!(matches!(result, Err(LockError::AcquisitionTimeout { .. })));

        holder.await.unwrap();
    }

    #[tokio::test]
    async fn fencing_tokens_increase_across_holders() {
        let manager = manager(LockConfig::default());

        let first = manager
            .with_lock("product:1", |token| async move { token })
            .await
            .unwrap();
        let second = manager
            .with_lock("product:1", |token| async move { token })
            .await
            .unwrap();

        assert!(second > first);
    }

    #[tokio::test]
    async fn multi_key_acquisition_sorts_and_never_deadlocks() {
        let manager = Arc::new(manager(LockConfig::default()));

        let forward = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                for _ in 0..20 {
                    manager
                        .with_locks(&["product:a".into(), "product:b".into()], |tokens| async move {
                            assert_eq!(tokens.len(), 2);
                        })
                        .await
                        .unwrap();
                }
            })
        };
        let backward = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                for _ in 0..20 {
                    manager
                        .with_locks(&["product:b".into(), "product:a".into()], |tokens| async move {
                            assert_eq!(tokens.len(), 2);
                        })
                        .await
                        .unwrap();
                }
            })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            forward.await.unwrap();
            backward.await.unwrap();
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn duplicate_keys_are_acquired_once() {
        let manager = manager(LockConfig::default());
        let tokens = manager
            .with_locks(
                &["product:a".into(), "product:a".into()],
                |tokens| async move { tokens },
            )
            .await
            .unwrap();
        assert_eq!(tokens.len(), 1);
    }

    /// A store whose renewals always report the lease as gone.
    struct RevokingStore {
        inner: InMemoryLockStore,
    }

    impl LockStore for RevokingStore {
        fn try_acquire(
            &self,
            key: &str,
            holder: &str,
            lease: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<Option<FencingToken>, LockStoreError>> + Send + '_>>
        {
            self.inner.try_acquire(key, holder, lease)
        }

        fn renew(
            &self,
            _key: &str,
            _holder: &str,
            _lease: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<bool, LockStoreError>> + Send + '_>> {
            Box::pin(async { Ok(false) })
        }

        fn release(
            &self,
            key: &str,
            holder: &str,
        ) -> Pin<Box<dyn Future<Output = Result<(), LockStoreError>> + Send + '_>> {
            self.inner.release(key, holder)
        }
    }

    #[tokio::test]
    async fn lost_lease_discards_result() {
        let config = LockConfig {
            lease_ms: 30,
            ..LockConfig::default()
        };
        let manager = LockManager::new(
            config,
            Arc::new(RevokingStore {
                inner: InMemoryLockStore::new(),
            }),
        );

        let result = manager
            .with_lock("product:1", |_| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                42
            })
            .await;

        assert!(matches!(result, Err(LockError::LostDuringExecution { .. })));
    }
}
