//! Ensures that at most one background refresh per cache key is running.
//!
//! Once a stale entry is served within its grace period, every request would otherwise trigger
//! its own refresh and thus flood the upstream. Therefore a refresh first has to acquire a
//! [Lease] for its key. Leases time out after [LEASE_TIMEOUT] so that a stuck or crashed refresh
//! doesn't block its key forever.
use fnv::FnvHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Determines how long a lease blocks its key at most.
pub const LEASE_TIMEOUT: Duration = Duration::from_secs(30);

struct LeaseInfo {
    id: u64,
    expires: Instant,
}

/// Keeps track of the keys being refreshed.
pub struct DownloadCoordinator {
    leases: Mutex<FnvHashMap<String, LeaseInfo>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl Default for DownloadCoordinator {
    fn default() -> Self {
        DownloadCoordinator::with_timeout(LEASE_TIMEOUT)
    }
}

impl DownloadCoordinator {
    /// Creates a coordinator whose leases expire after the given timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        DownloadCoordinator {
            leases: Mutex::new(FnvHashMap::default()),
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    fn leases(&self) -> MutexGuard<'_, FnvHashMap<String, LeaseInfo>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reserve(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut leases = self.leases();
        if let Some(existing) = leases.get(key) {
            if existing.expires > now {
                return None;
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = leases.insert(
            key.to_owned(),
            LeaseInfo {
                id,
                expires: now + self.timeout,
            },
        );

        Some(id)
    }

    /// Tries to reserve the given key.
    ///
    /// Returns **false** if there is already a lease for this key which hasn't expired yet.
    pub fn try_reserve(&self, key: &str) -> bool {
        self.reserve(key).is_some()
    }

    /// Releases the lease for the given key, no matter who acquired it.
    pub fn release(&self, key: &str) {
        let _ = self.leases().remove(key);
    }

    /// Reserves the given key and returns a guard which releases it once dropped.
    ///
    /// Dropping a guard only ever removes its own lease. If the lease timed out in the meantime
    /// and was granted to someone else, the newer lease is kept.
    pub fn lease(self: &Arc<Self>, key: &str) -> Option<Lease> {
        self.reserve(key).map(|id| Lease {
            coordinator: self.clone(),
            key: key.to_owned(),
            id,
        })
    }

    fn release_lease(&self, key: &str, id: u64) {
        let mut leases = self.leases();
        if leases.get(key).map(|lease| lease.id) == Some(id) {
            let _ = leases.remove(key);
        }
    }

    /// Returns the number of leases which haven't expired yet.
    pub fn active_leases(&self) -> usize {
        let now = Instant::now();
        self.leases()
            .values()
            .filter(|lease| lease.expires > now)
            .count()
    }
}

/// Represents an acquired lease which is released when dropped.
pub struct Lease {
    coordinator: Arc<DownloadCoordinator>,
    key: String,
    id: u64,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.coordinator.release_lease(&self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::downloads::DownloadCoordinator;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn only_one_lease_per_key_is_granted() {
        let coordinator = Arc::new(DownloadCoordinator::default());
        assert!(coordinator.try_reserve("a"));
        assert!(!coordinator.try_reserve("a"));
        assert!(coordinator.try_reserve("b"));
        coordinator.release("a");
        assert!(coordinator.try_reserve("a"));

        let lease = coordinator.lease("c").unwrap();
        assert!(coordinator.lease("c").is_none());
        drop(lease);
        assert!(coordinator.lease("c").is_some());
        assert_eq!(coordinator.active_leases(), 2);
    }

    #[test]
    fn expired_leases_are_replaced_but_never_released_by_their_old_owner() {
        let coordinator = Arc::new(DownloadCoordinator::with_timeout(Duration::from_millis(20)));
        let stale = coordinator.lease("a").unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(coordinator.active_leases(), 0);

        let fresh = coordinator.lease("a").unwrap();
        drop(stale);
        assert!(!coordinator.try_reserve("a"));
        drop(fresh);
        assert!(coordinator.try_reserve("a"));
    }

    #[test]
    fn leases_are_released_during_unwinding() {
        let coordinator = Arc::new(DownloadCoordinator::default());
        let cloned = coordinator.clone();
        let result = std::thread::spawn(move || {
            let _lease = cloned.lease("a").unwrap();
            panic!("refresh failed");
        })
        .join();

        assert!(result.is_err());
        assert!(coordinator.try_reserve("a"));
    }
}
