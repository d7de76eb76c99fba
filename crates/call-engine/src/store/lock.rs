//! Distributed lock over the shared store.
//!
//! Acquisition is `SET key token NX EX ttl`; release deletes the key only if
//! it still holds this lock's token, so a holder whose TTL already expired
//! cannot release a later holder's lock. Callers must not assume the lock
//! survives longer than its TTL: losing it means recovery may be retried
//! concurrently elsewhere, which every lock-guarded operation here tolerates.

use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use super::{SharedStore, StoreResult};

/// A held distributed lock. Dropping it without calling
/// [`release`](DistributedLock::release) lets the TTL expire it.
pub struct DistributedLock {
    store: Arc<dyn SharedStore>,
    key: String,
    token: String,
}

impl DistributedLock {
    /// Try to acquire `key` for `ttl_secs`. `None` means another holder has
    /// it — a normal outcome, not an error.
    pub async fn acquire(
        store: Arc<dyn SharedStore>,
        key: impl Into<String>,
        ttl_secs: u64,
    ) -> StoreResult<Option<Self>> {
        let key = key.into();
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        if store.set_nx_ex(&key, &token, ttl_secs).await? {
            Ok(Some(Self { store, key, token }))
        } else {
            debug!("lock {} held elsewhere", key);
            Ok(None)
        }
    }

    /// Release the lock if our token is still the current value.
    pub async fn release(self) -> StoreResult<bool> {
        self.store.del_if_value(&self.key, &self.token).await
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn second_acquire_fails_while_held() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let lock = DistributedLock::acquire(store.clone(), "lock:a", 30)
            .await
            .unwrap()
            .expect("first acquire");
        assert!(DistributedLock::acquire(store.clone(), "lock:a", 30)
            .await
            .unwrap()
            .is_none());
        assert!(lock.release().await.unwrap());
        assert!(DistributedLock::acquire(store, "lock:a", 30)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn release_refuses_foreign_token() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let stale = DistributedLock::acquire(store.clone(), "lock:b", 30)
            .await
            .unwrap()
            .unwrap();
        // Simulate TTL expiry followed by re-acquisition elsewhere.
        store.del("lock:b").await.unwrap();
        let current = DistributedLock::acquire(store.clone(), "lock:b", 30)
            .await
            .unwrap()
            .unwrap();
        assert!(!stale.release().await.unwrap());
        // The current holder is untouched and can still release.
        assert!(current.release().await.unwrap());
    }
}
