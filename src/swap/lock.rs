//! Expiring per-record lease. Acquisition never waits: callers that lose the
//! race skip the side effect and let a later pass retry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct Lease {
    token: u64,
    expires_at: Instant,
}

/// Cloning yields a handle to the same lease.
#[derive(Debug, Clone, Default)]
pub struct SwapLock {
    lease: Arc<Mutex<Option<Lease>>>,
}

#[must_use = "the lease is released when the guard is dropped"]
#[derive(Debug)]
pub struct SwapLockGuard {
    lock: SwapLock,
    token: u64,
}

impl SwapLock {
    pub fn new() -> Self {
        Self::default()
    }

    // A lease is a plain value, so a panic elsewhere never leaves it torn.
    fn lease(&self) -> MutexGuard<'_, Option<Lease>> {
        self.lease.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the lease for `duration` unless someone holds an unexpired one.
    pub fn try_lock(&self, duration: Duration) -> Option<SwapLockGuard> {
        let mut lease = self.lease();
        let now = Instant::now();
        if let Some(current) = lease.as_ref()
            && current.expires_at > now
        {
            return None;
        }

        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        *lease = Some(Lease {
            token,
            expires_at: now + duration,
        });
        Some(SwapLockGuard {
            lock: self.clone(),
            token,
        })
    }

    pub fn is_locked(&self) -> bool {
        let lease = self.lease();
        lease
            .as_ref()
            .is_some_and(|current| current.expires_at > Instant::now())
    }
}

impl SwapLockGuard {
    /// False once the lease expired or was taken over.
    pub fn is_held(&self) -> bool {
        let lease = self.lock.lease();
        lease
            .as_ref()
            .is_some_and(|current| current.token == self.token && current.expires_at > Instant::now())
    }
}

impl Drop for SwapLockGuard {
    fn drop(&mut self) {
        let mut lease = self.lock.lease();
        if lease.as_ref().is_some_and(|current| current.token == self.token) {
            *lease = None;
        }
    }
}
