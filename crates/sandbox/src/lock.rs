//! Distributed lock port for serialising sandbox writers across processes.
//!
//! The backend is a deployment choice; the shipped [`LocalLockManager`]
//! covers single-host deployments and tests. Locks carry a TTL so a crashed
//! holder cannot wedge creation forever.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::SandboxResult;

/// Opaque handle proving lock ownership; released exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    pub token: String,
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to acquire `key`. With `blocking`, waits up to `timeout` polling
    /// for the holder to release or its TTL to lapse. Returns `None` when the
    /// lock could not be acquired in time.
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        blocking: bool,
        timeout: Duration,
    ) -> SandboxResult<Option<LockHandle>>;

    /// Release a previously acquired lock. Releasing a lock that has already
    /// lapsed is a no-op.
    async fn release(&self, handle: LockHandle) -> SandboxResult<()>;
}

struct LockEntry {
    token: String,
    expires_at: Instant,
}

/// In-process lock manager with TTL semantics.
#[derive(Default)]
pub struct LocalLockManager {
    locks: Arc<Mutex<HashMap<String, LockEntry>>>,
}

impl LocalLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_take(&self, key: &str, ttl: Duration) -> Option<LockHandle> {
        let mut locks = self.locks.lock();
        let now = Instant::now();
        match locks.get(key) {
            Some(entry) if entry.expires_at > now => None,
            _ => {
                let token = Uuid::new_v4().to_string();
                locks.insert(
                    key.to_string(),
                    LockEntry {
                        token: token.clone(),
                        expires_at: now + ttl,
                    },
                );
                Some(LockHandle {
                    key: key.to_string(),
                    token,
                })
            }
        }
    }
}

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[async_trait]
impl DistributedLock for LocalLockManager {
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        blocking: bool,
        timeout: Duration,
    ) -> SandboxResult<Option<LockHandle>> {
        if let Some(handle) = self.try_take(key, ttl) {
            return Ok(Some(handle));
        }
        if !blocking {
            return Ok(None);
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
            if let Some(handle) = self.try_take(key, ttl) {
                return Ok(Some(handle));
            }
        }
        Ok(None)
    }

    async fn release(&self, handle: LockHandle) -> SandboxResult<()> {
        let mut locks = self.locks.lock();
        if let Some(entry) = locks.get(&handle.key) {
            if entry.token == handle.token {
                locks.remove(&handle.key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(120);

    #[tokio::test]
    async fn acquire_then_release_then_reacquire() {
        let lock = LocalLockManager::new();
        let handle = lock
            .acquire("sandbox:create:p1", TTL, false, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        lock.release(handle).await.unwrap();
        assert!(
            lock.acquire("sandbox:create:p1", TTL, false, Duration::ZERO)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn second_nonblocking_acquire_fails_while_held() {
        let lock = LocalLockManager::new();
        let _held = lock
            .acquire("sandbox:create:p1", TTL, false, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert!(
            lock.acquire("sandbox:create:p1", TTL, false, Duration::ZERO)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let lock = LocalLockManager::new();
        let a = lock
            .acquire("sandbox:create:p1", TTL, false, Duration::ZERO)
            .await
            .unwrap();
        let b = lock
            .acquire("sandbox:create:p2", TTL, false, Duration::ZERO)
            .await
            .unwrap();
        assert!(a.is_some());
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn blocking_acquire_waits_for_release() {
        let lock = Arc::new(LocalLockManager::new());
        let handle = lock
            .acquire("k", TTL, false, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.acquire("k", TTL, true, Duration::from_secs(2)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        lock.release(handle).await.unwrap();

        let acquired = waiter.await.unwrap().unwrap();
        assert!(acquired.is_some(), "blocked waiter should win after release");
    }

    #[tokio::test]
    async fn expired_ttl_lets_a_new_holder_in() {
        let lock = LocalLockManager::new();
        let _stale = lock
            .acquire("k", Duration::from_millis(20), false, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(
            lock.acquire("k", TTL, false, Duration::ZERO)
                .await
                .unwrap()
                .is_some(),
            "lapsed lock must be reclaimable"
        );
    }

    #[tokio::test]
    async fn release_of_stale_handle_does_not_free_new_holder() {
        let lock = LocalLockManager::new();
        let stale = lock
            .acquire("k", Duration::from_millis(10), false, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _current = lock
            .acquire("k", TTL, false, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        // The stale holder releasing must not evict the new owner.
        lock.release(stale).await.unwrap();
        assert!(
            lock.acquire("k", TTL, false, Duration::ZERO)
                .await
                .unwrap()
                .is_none()
        );
    }
}
