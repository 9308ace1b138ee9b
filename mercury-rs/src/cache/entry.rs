//! Contains the entries which are stored in the cache.
use crate::cache::response::CachedResponse;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Marks an entry which isn't linked into the eviction list.
pub(crate) const NOT_LINKED: usize = usize::MAX;

lazy_static::lazy_static! {
    /// Expiry timestamps are stored as signed milliseconds relative to this instant so that they
    /// fit into an atomic.
    static ref CLOCK_BASE: Instant = Instant::now();
}

fn to_millis(at: Instant) -> i64 {
    let base = *CLOCK_BASE;
    if at >= base {
        at.duration_since(base).as_millis() as i64
    } else {
        -(base.duration_since(at).as_millis() as i64)
    }
}

fn from_millis(millis: i64) -> Instant {
    let base = *CLOCK_BASE;
    if millis >= 0 {
        base + Duration::from_millis(millis as u64)
    } else {
        base.checked_sub(Duration::from_millis(millis.unsigned_abs()))
            .unwrap_or(base)
    }
}

/// Describes the state of an entry relative to a given point in time and grace period.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Freshness {
    /// The entry hasn't expired yet.
    Fresh,
    /// The entry has expired but is still within its grace period.
    Stale,
    /// The entry has expired and its grace period is over as well.
    Expired,
}

/// Represents a response stored in the cache along with its keys and expiry.
///
/// The response itself is immutable. Only the expiry can be changed (e.g. to keep serving stale
/// data while an upstream is failing). The list linkage is only ever touched by the cache worker.
pub struct CacheEntry {
    primary: String,
    secondary: String,
    response: Arc<CachedResponse>,
    size: usize,
    expires_at: AtomicI64,
    slot: AtomicUsize,
    removed: AtomicBool,
}

impl CacheEntry {
    /// Creates a new entry which expires at the given instant.
    pub fn new(
        primary: String,
        secondary: String,
        response: Arc<CachedResponse>,
        expires_at: Instant,
    ) -> Self {
        let size = response.size_estimate();
        CacheEntry {
            primary,
            secondary,
            response,
            size,
            expires_at: AtomicI64::new(to_millis(expires_at)),
            slot: AtomicUsize::new(NOT_LINKED),
            removed: AtomicBool::new(false),
        }
    }

    /// Returns the primary key.
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Returns the secondary key.
    pub fn secondary(&self) -> &str {
        &self.secondary
    }

    /// Returns the cached response.
    pub fn response(&self) -> &Arc<CachedResponse> {
        &self.response
    }

    /// Returns the number of bytes accounted for this entry.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the instant at which this entry becomes stale.
    pub fn expires(&self) -> Instant {
        from_millis(self.expires_at.load(Ordering::Acquire))
    }

    /// Changes the expiry of this entry.
    pub fn expire(&self, at: Instant) {
        self.expires_at.store(to_millis(at), Ordering::Release);
    }

    /// Determines the freshness of this entry at the given instant.
    pub fn freshness(&self, now: Instant, grace: Duration) -> Freshness {
        let expires = self.expires();
        if now < expires {
            return Freshness::Fresh;
        }

        match expires.checked_add(grace) {
            Some(limit) if now >= limit => Freshness::Expired,
            _ => Freshness::Stale,
        }
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot.load(Ordering::Relaxed)
    }

    pub(crate) fn set_slot(&self, slot: usize) {
        self.slot.store(slot, Ordering::Relaxed);
    }

    pub(crate) fn is_linked(&self) -> bool {
        self.slot() != NOT_LINKED
    }

    /// Determines if the entry has been removed from the store (deleted, replaced or evicted).
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("primary", &self.primary)
            .field("secondary", &self.secondary)
            .field("size", &self.size)
            .field("status", &self.response.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::entry::{CacheEntry, Freshness};
    use crate::cache::response::CachedResponse;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn freshness_respects_expiry_and_grace() {
        // Work with a point in the future so that we can safely subtract from it...
        let now = Instant::now() + Duration::from_secs(7200);
        let entry = CacheEntry::new(
            "a".to_owned(),
            "".to_owned(),
            Arc::new(CachedResponse::text(200, "a")),
            now + Duration::from_secs(10),
        );
        let grace = Duration::from_secs(30);

        assert_eq!(entry.freshness(now, grace), Freshness::Fresh);
        assert_eq!(
            entry.freshness(now + Duration::from_secs(20), grace),
            Freshness::Stale
        );
        assert_eq!(
            entry.freshness(now + Duration::from_secs(41), grace),
            Freshness::Expired
        );

        // Moving the expiry backwards turns the entry into an expired one...
        entry.expire(now - Duration::from_secs(3600));
        assert_eq!(entry.freshness(now, grace), Freshness::Expired);
        assert!(entry.expires() <= now - Duration::from_secs(3599));

        // A grace period beyond the range of Instant never ends...
        assert_eq!(entry.freshness(now, Duration::MAX), Freshness::Stale);
    }
}
