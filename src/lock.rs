//! # Request Lock
//!
//! Lease-based de-duplication of expensive work across bot workers.
//!
//! A lock is a single key created with "set if absent, with TTL". The TTL is
//! what guarantees release when a worker dies mid-download; the price is that
//! a holder stalling past its lease silently loses exclusivity and a second
//! worker may start the same extraction. A rare duplicate download costs far
//! less than a key that never goes away.
//!
//! Failing to acquire is not an error: it means another worker is already on
//! it, and the caller should skip the duplicate work instead of retrying.
//!
//! Two independent namespaces exist:
//!
//! - [`LockScope::Extraction`]: metadata extraction, keyed by normalized query
//! - [`LockScope::DirectUrl`]: stream URL resolution, keyed by video id, with
//!   a much shorter lease

use std::{fmt, sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::cache::normalize_query;
use crate::store::{BestEffort, KeySpace, KvStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    Extraction,
    DirectUrl,
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockScope::Extraction => write!(f, "extraction"),
            LockScope::DirectUrl => write!(f, "direct-url"),
        }
    }
}

/// Advisory lease lock over the shared store.
#[derive(Clone)]
pub struct RequestLock {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    scope: LockScope,
    default_ttl: Duration,
}

impl RequestLock {
    pub fn extraction(store: Arc<dyn KvStore>, keys: KeySpace, default_ttl: Duration) -> Self {
        Self {
            store,
            keys,
            scope: LockScope::Extraction,
            default_ttl,
        }
    }

    pub fn direct_url(store: Arc<dyn KvStore>, keys: KeySpace, default_ttl: Duration) -> Self {
        Self {
            store,
            keys,
            scope: LockScope::DirectUrl,
            default_ttl,
        }
    }

    pub fn scope(&self) -> LockScope {
        self.scope
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn store_key(&self, key: &str) -> Option<String> {
        match self.scope {
            LockScope::Extraction => {
                let normalized = normalize_query(key);
                (!normalized.is_empty()).then(|| self.keys.extraction_lock(normalized.as_str()))
            }
            LockScope::DirectUrl => {
                let id = key.trim();
                (!id.is_empty()).then(|| self.keys.direct_url_lock(id))
            }
        }
    }

    /// Tries to take the lease for `ttl`.
    ///
    /// Returns `true` when this caller now holds it. An empty key has nothing
    /// to dedupe and is granted without touching the store. If the store is
    /// unreachable the lock is granted as well, so the request proceeds.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> bool {
        let Some(store_key) = self.store_key(key) else {
            return true;
        };

        match self.store.set_nx_ex(&store_key, "1", ttl).await {
            Ok(true) => {
                debug!("🔒 Lock {} adquirido: {}", self.scope, store_key);
                true
            }
            Ok(false) => {
                debug!("⏳ Lock {} ocupado por otro worker: {}", self.scope, store_key);
                false
            }
            Err(e) => {
                warn!("⚠️ Lock {} no disponible, continuando sin exclusión: {}", self.scope, e);
                true
            }
        }
    }

    pub async fn acquire_default(&self, key: &str) -> bool {
        self.acquire(key, self.default_ttl).await
    }

    /// Drops the lease. Idempotent: releasing an absent lock is fine.
    pub async fn release(&self, key: &str) {
        let Some(store_key) = self.store_key(key) else {
            return;
        };
        if self.store.del(&store_key).await.best_effort("liberación de lock").is_some() {
            debug!("🔓 Lock {} liberado: {}", self.scope, store_key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn extraction_lock() -> (Arc<MemoryStore>, RequestLock) {
        let store = Arc::new(MemoryStore::new());
        let lock = RequestLock::extraction(store.clone(), KeySpace::default(), Duration::from_secs(60));
        (store, lock)
    }

    #[tokio::test]
    async fn test_acquire_twice_then_release() {
        let (_, lock) = extraction_lock();
        assert!(lock.acquire("song-x", Duration::from_secs(60)).await);
        assert!(!lock.acquire("song-x", Duration::from_secs(60)).await);

        lock.release("song-x").await;
        assert!(lock.acquire("song-x", Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn test_lock_key_is_normalized() {
        let (_, lock) = extraction_lock();
        assert!(lock.acquire_default("Fairuz  Li Beirut").await);
        assert!(!lock.acquire_default("fairuz li beirut").await);
    }

    #[tokio::test]
    async fn test_empty_key_is_always_granted() {
        let (store, lock) = extraction_lock();
        assert!(lock.acquire("   ", Duration::from_secs(60)).await);
        assert!(lock.acquire("   ", Duration::from_secs(60)).await);
        assert!(store.is_empty());
        lock.release("   ").await;
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (_, lock) = extraction_lock();
        lock.release("never-taken").await;
        lock.release("never-taken").await;
        assert!(lock.acquire_default("never-taken").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_release() {
        let (_, lock) = extraction_lock();
        assert!(lock.acquire("crashed", Duration::from_secs(5)).await);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(lock.acquire("crashed", Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_namespaces_are_independent() {
        let store = Arc::new(MemoryStore::new());
        let extraction = RequestLock::extraction(store.clone(), KeySpace::default(), Duration::from_secs(60));
        let direct = RequestLock::direct_url(store.clone(), KeySpace::default(), Duration::from_secs(20));

        assert!(extraction.acquire_default("abc123def").await);
        assert!(direct.acquire_default("abc123def").await);
        assert!(!direct.acquire_default("abc123def").await);
    }

    #[tokio::test]
    async fn test_unreachable_store_grants_lock() {
        let (store, lock) = extraction_lock();
        store.set_available(false);
        assert!(lock.acquire_default("song-x").await);
        lock.release("song-x").await;
    }
}
