use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Advisory lock covering operations that read or rewrite whole collections
/// (backup snapshots and restores). Per-record CRUD writes do not take it.
#[derive(Debug, Clone, Default)]
pub struct LiveDataLock {
    inner: Arc<Mutex<()>>,
}

/// Proof that the live-data lock is held. Only obtainable from
/// [`LiveDataLock`]; released on drop.
#[derive(Debug)]
pub struct LiveDataGuard {
    operation: &'static str,
    _guard: OwnedMutexGuard<()>,
}

impl LiveDataLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock.
    pub async fn acquire(&self, operation: &'static str) -> LiveDataGuard {
        let guard = self.inner.clone().lock_owned().await;
        debug!(operation, "live-data lock acquired");
        LiveDataGuard {
            operation,
            _guard: guard,
        }
    }

    /// Take the lock only if nobody holds it.
    pub fn try_acquire(&self, operation: &'static str) -> Option<LiveDataGuard> {
        let guard = self.inner.clone().try_lock_owned().ok()?;
        debug!(operation, "live-data lock acquired");
        Some(LiveDataGuard {
            operation,
            _guard: guard,
        })
    }
}

impl LiveDataGuard {
    /// Name of the operation holding the lock.
    pub fn operation(&self) -> &'static str {
        self.operation
    }
}

impl Drop for LiveDataGuard {
    fn drop(&mut self) {
        debug!(operation = self.operation, "live-data lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_is_excluded_until_release() {
        let lock = LiveDataLock::new();
        let guard = lock.acquire("backup").await;
        assert_eq!(guard.operation(), "backup");
        assert!(lock.try_acquire("restore").is_none());

        drop(guard);
        assert!(lock.try_acquire("restore").is_some());
    }

    #[tokio::test]
    async fn clones_share_the_same_lock() {
        let lock = LiveDataLock::new();
        let other = lock.clone();
        let _guard = lock.acquire("restore").await;
        assert!(other.try_acquire("backup").is_none());
    }
}
