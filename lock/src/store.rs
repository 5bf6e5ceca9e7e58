//! Lock store backends.
//!
//! The [`LockStore`] trait is the cluster-wide half of the lock: one row per
//! key with a holder, a lease deadline and a fence counter. The in-memory
//! store here covers tests and single-node deployments; the Postgres store
//! lives in `merx-postgres`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

/// Opaque fencing token, monotonically increasing per key.
///
/// Downstream writes may carry the token so a stale holder's writes can be
/// rejected after its lease was reclaimed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FencingToken(u64);

impl FencingToken {
    /// Wrap a raw token value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw token value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FencingToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors from lock store backends.
#[derive(Error, Debug, Clone)]
pub enum LockStoreError {
    /// The backend is unreachable or failed the operation.
    #[error("Lock store unavailable: {0}")]
    Unavailable(String),
}

/// Cluster-wide lock state backend.
///
/// At most one live (unexpired) holder per key. Acquiring a key whose lease
/// expired reclaims it and bumps the fence counter, so the previous holder's
/// token becomes stale.
///
/// Boxed futures keep the trait dyn-compatible (`Arc<dyn LockStore>` is held
/// by the manager).
pub trait LockStore: Send + Sync {
    /// Try to acquire `key` for `holder` with the given lease.
    ///
    /// Returns `Some(token)` on success (including re-entry by the same
    /// holder), `None` if another live holder owns the key.
    ///
    /// # Errors
    ///
    /// Returns [`LockStoreError`] if the backend fails.
    fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<FencingToken>, LockStoreError>> + Send + '_>>;

    /// Extend the lease of a held key.
    ///
    /// Returns `false` if `holder` no longer owns the key (lease reclaimed).
    ///
    /// # Errors
    ///
    /// Returns [`LockStoreError`] if the backend fails.
    fn renew(
        &self,
        key: &str,
        holder: &str,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LockStoreError>> + Send + '_>>;

    /// Release a held key. Releasing a key the holder does not own is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LockStoreError`] if the backend fails.
    fn release(
        &self,
        key: &str,
        holder: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), LockStoreError>> + Send + '_>>;
}

#[derive(Debug)]
struct Entry {
    holder: String,
    expires_at: Instant,
    token: FencingToken,
}

/// In-memory lock store for tests and single-node deployments.
///
/// Fence counters survive release so tokens stay monotonic per key for the
/// lifetime of the process.
#[derive(Default)]
pub struct InMemoryLockStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    fences: HashMap<String, u64>,
}

impl InMemoryLockStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockStore for InMemoryLockStore {
    fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<FencingToken>, LockStoreError>> + Send + '_>> {
        let key = key.to_string();
        let holder = holder.to_string();
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let now = Instant::now();

            if let Some(entry) = state.entries.get_mut(&key) {
                if entry.holder == holder {
                    entry.expires_at = now + lease;
                    return Ok(Some(entry.token));
                }
                if entry.expires_at > now {
                    return Ok(None);
                }
                // Expired lease: fall through and reclaim.
            }

            let fence = state.fences.entry(key.clone()).or_insert(0);
            *fence += 1;
            let token = FencingToken::new(*fence);
            state.entries.insert(
                key,
                Entry {
                    holder,
                    expires_at: now + lease,
                    token,
                },
            );
            Ok(Some(token))
        })
    }

    fn renew(
        &self,
        key: &str,
        holder: &str,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LockStoreError>> + Send + '_>> {
        let key = key.to_string();
        let holder = holder.to_string();
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            match state.entries.get_mut(&key) {
                Some(entry) if entry.holder == holder && entry.expires_at > now => {
                    entry.expires_at = now + lease;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn release(
        &self,
        key: &str,
        holder: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), LockStoreError>> + Send + '_>> {
        let key = key.to_string();
        let holder = holder.to_string();
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state
                .entries
                .get(&key)
                .is_some_and(|entry| entry.holder == holder)
            {
                state.entries.remove(&key);
            }
            Ok(())
        })
    }
}
