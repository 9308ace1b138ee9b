//! Provides the size constrained response cache of the gateway.
//!
//! The cache stores [CachedResponse]s under a two-level key. The **primary** key identifies the
//! resource (usually its path) and the **secondary** key its variant (e.g. the query string or a
//! header value the response varies on). All variants of a primary key can be dropped at once.
//!
//! Internally, the cache is composed of several parts:
//! * a [ShardedStore] which maps keys to entries. Lookups only acquire the read lock of a single
//!   shard and never wait for anything else.
//! * a [CacheWorker] which is the only one to modify the eviction order and the size accounting.
//!   All such modifications are sent as commands into its queue.
//! * a [DownloadCoordinator] which makes sure that only one background refresh per key is running.
//! * the [codec] which writes and reads snapshots, so that a restarted gateway doesn't start
//!   with a cold cache.
//!
//! # Stale data
//!
//! The cache itself doesn't decide whether an expired entry may still be served. It simply
//! returns whatever is stored and the [cache middleware](crate::middleware::cache) decides based
//! on the freshness of the entry (see [CacheEntry::freshness]). This permits to deliver stale
//! data while a single background task fetches an update ("grace") or to keep serving stale data
//! while an upstream is failing ("saint").
//!
//! # Examples
//!
//! ```
//! # use mercury::cache::Cache;
//! # use mercury::cache::response::CachedResponse;
//! # use std::time::Duration;
//! # #[tokio::main]
//! # async fn main() {
//! let cache = Cache::new(1024 * 1024);
//! let _ = cache.set("/index.html", "", CachedResponse::text(200, "Hello"), Duration::from_secs(60)).await;
//! assert_eq!(cache.get("/index.html", "").unwrap().response().body(), "Hello");
//! assert_eq!(cache.delete("/index.html", "").await, true);
//! # cache.stop().await;
//! # }
//! ```
use crate::cache::codec::read_snapshot;
use crate::cache::downloads::DownloadCoordinator;
use crate::cache::entry::CacheEntry;
use crate::cache::response::CachedResponse;
use crate::cache::store::ShardedStore;
use crate::cache::worker::{CacheStats, CacheWorker, Command, PersistRequest};
use rand::Rng;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

pub mod codec;
pub mod downloads;
pub mod entry;
pub mod list;
pub mod response;
pub mod store;
pub mod ttl;
pub mod worker;

/// Determines the range (in seconds) of the expiry given to entries loaded from a snapshot.
///
/// A snapshot doesn't carry any expiry. Therefore, loaded entries are considered valid for a
/// short random period so that they're not all refreshed at the same time.
pub const LOAD_EXPIRY_SECS: std::ops::RangeInclusive<u64> = 60..=180;

/// Represents a size constrained cache for HTTP responses.
pub struct Cache {
    store: Arc<ShardedStore>,
    queue: mpsc::Sender<Command>,
    max_size: AtomicUsize,
    size: Arc<AtomicUsize>,
    downloads: Arc<DownloadCoordinator>,
}

impl Cache {
    /// Creates a new cache which permits to store up to **max_size** bytes.
    ///
    /// Note that this spawns the worker of the cache and therefore has to be called within a
    /// tokio runtime.
    pub fn new(max_size: usize) -> Self {
        let store = Arc::new(ShardedStore::default());
        let size = Arc::new(AtomicUsize::new(0));
        let queue = CacheWorker::spawn(store.clone(), max_size, size.clone());

        Cache {
            store,
            queue,
            max_size: AtomicUsize::new(max_size),
            size,
            downloads: Arc::new(DownloadCoordinator::default()),
        }
    }

    async fn submit(&self, command: Command) {
        if self.queue.send(command).await.is_err() {
            log::debug!("Discarding a cache command as the worker has already been stopped.");
        }
    }

    /// Returns the entry stored for the given keys.
    ///
    /// This doesn't check whether the entry has expired. However, each hit promotes the entry
    /// so that it is less likely to be evicted. If the queue of the worker is full, the promotion
    /// is skipped.
    pub fn get(&self, primary: &str, secondary: &str) -> Option<Arc<CacheEntry>> {
        let entry = self.store.get(primary, secondary)?;
        let _ = self.queue.try_send(Command::Promote(entry.clone()));

        Some(entry)
    }

    /// Stores the given response for the given TTL.
    ///
    /// A TTL of zero means that the response must not be cached at all, in which case **None**
    /// is returned. The same happens for a TTL which exceeds the range of [Instant]. Otherwise the new entry is returned. An entry previously stored for the same
    /// keys is replaced.
    ///
    /// Note that this waits until the worker accepts the promotion of the new entry. This
    /// provides some backpressure in case the worker cannot keep up.
    pub async fn set(
        &self,
        primary: impl Into<String>,
        secondary: impl Into<String>,
        response: impl Into<Arc<CachedResponse>>,
        ttl: Duration,
    ) -> Option<Arc<CacheEntry>> {
        if ttl.is_zero() {
            return None;
        }
        let expires = match Instant::now().checked_add(ttl) {
            Some(expires) => expires,
            None => {
                log::warn!("Not caching a response with an unrepresentable TTL of {:?}.", ttl);
                return None;
            }
        };

        let entry = Arc::new(CacheEntry::new(
            primary.into(),
            secondary.into(),
            response.into(),
            expires,
        ));

        let displaced = self.store.set(entry.clone());
        self.submit(Command::Promote(entry.clone())).await;
        if let Some(displaced) = displaced {
            displaced.mark_removed();
            self.submit(Command::Delete(displaced)).await;
        }

        Some(entry)
    }

    /// Removes the entry for the given keys.
    ///
    /// Returns **true** if an entry was present.
    pub async fn delete(&self, primary: &str, secondary: &str) -> bool {
        match self.store.delete(primary, secondary) {
            Some(entry) => {
                entry.mark_removed();
                self.submit(Command::Delete(entry)).await;
                true
            }
            None => false,
        }
    }

    /// Removes all variants of the given primary key.
    ///
    /// Returns **true** if at least one entry was present.
    pub async fn delete_all(&self, primary: &str) -> bool {
        let entries = self.store.delete_all(primary);
        let found = !entries.is_empty();
        for entry in entries {
            entry.mark_removed();
            self.submit(Command::Delete(entry)).await;
        }

        found
    }

    /// Writes a snapshot of the most recently used entries into the given file.
    ///
    /// At most **count** entries are written and entries which expire within **cutoff** are
    /// skipped, as it isn't worth to restore them. Returns the number of written entries.
    pub async fn save(
        &self,
        path: impl AsRef<Path>,
        count: usize,
        cutoff: Duration,
    ) -> anyhow::Result<usize> {
        let (callback, result) = oneshot::channel();
        self.queue
            .send(Command::Persist(PersistRequest {
                path: path.as_ref().to_path_buf(),
                count,
                cutoff,
                result: callback,
            }))
            .await
            .map_err(|_| anyhow::anyhow!("The cache worker has already been stopped."))?;

        result
            .await
            .map_err(|_| anyhow::anyhow!("The cache worker didn't report a result."))?
    }

    /// Loads a snapshot written by [save](Cache::save).
    ///
    /// The snapshot is decoded completely before any entry is inserted. Therefore, a broken
    /// file leaves the cache untouched. Each loaded entry expires after a random period within
    /// [LOAD_EXPIRY_SECS]. Returns the number of loaded entries.
    ///
    /// A snapshot starts with the most recently used entry. Records are therefore inserted
    /// back to front, so that the recency order survives the restart.
    pub async fn load(&self, path: impl AsRef<Path>) -> anyhow::Result<usize> {
        let records = read_snapshot(path.as_ref()).await?;
        let count = records.len();
        for record in records.into_iter().rev() {
            let ttl = Duration::from_secs(rand::rng().random_range(LOAD_EXPIRY_SECS));
            let _ = self
                .set(record.primary, record.secondary, record.response, ttl)
                .await;
        }

        Ok(count)
    }

    /// Changes the maximal size of the cache.
    ///
    /// Note that shrinking the cache doesn't evict anything immediately. This happens once the
    /// next entry is inserted.
    pub async fn set_size(&self, max_size: usize) {
        self.max_size.store(max_size, Ordering::Relaxed);
        self.submit(Command::Resize(max_size)).await;
    }

    /// Returns the maximal size of the cache in bytes.
    pub fn get_size(&self) -> usize {
        self.max_size.load(Ordering::Relaxed)
    }

    /// Returns the currently allocated size in bytes as last reported by the worker.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Returns the number of stored entries.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Determines if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Obtains the current figures from the worker.
    pub async fn stats(&self) -> anyhow::Result<CacheStats> {
        let (callback, result) = oneshot::channel();
        self.queue
            .send(Command::Stats(callback))
            .await
            .map_err(|_| anyhow::anyhow!("The cache worker has already been stopped."))?;

        result
            .await
            .map_err(|_| anyhow::anyhow!("The cache worker didn't report its stats."))
    }

    /// Forces a GC pass and returns the number of evicted entries.
    pub async fn gc(&self) -> anyhow::Result<usize> {
        let (callback, result) = oneshot::channel();
        self.queue
            .send(Command::Collect(callback))
            .await
            .map_err(|_| anyhow::anyhow!("The cache worker has already been stopped."))?;

        result
            .await
            .map_err(|_| anyhow::anyhow!("The cache worker didn't complete the GC pass."))
    }

    /// Returns the coordinator used to limit background refreshes to one per key.
    pub fn downloads(&self) -> &Arc<DownloadCoordinator> {
        &self.downloads
    }

    /// Stops the worker of this cache.
    ///
    /// Entries can still be read afterwards, but the cache doesn't track nor evict anything
    /// anymore.
    pub async fn stop(&self) {
        let (callback, result) = oneshot::channel();
        if self.queue.send(Command::Stop(callback)).await.is_ok() {
            let _ = result.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::response::{CachedResponse, Headers};
    use crate::cache::Cache;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    const TTL: Duration = Duration::from_secs(3600);

    fn body(text: &str) -> CachedResponse {
        CachedResponse::plain(200, Headers::new(), text.to_owned())
    }

    #[test]
    fn set_then_get_returns_the_response() {
        crate::testing::test_async(async {
            let cache = Cache::new(1024 * 1024);
            let _ = cache
                .set("/a", "x=1", CachedResponse::text(404, "missing"), TTL)
                .await;

            let entry = cache.get("/a", "x=1").unwrap();
            assert_eq!(entry.response().status(), 404);
            assert_eq!(entry.response().body(), "missing");
            assert!(cache.get("/a", "x=2").is_none());
            assert!(cache.get("/b", "x=1").is_none());

            // A TTL of zero means "don't cache"...
            assert!(cache
                .set("/z", "", body("z"), Duration::ZERO)
                .await
                .is_none());
            assert!(cache.get("/z", "").is_none());
            cache.stop().await;
        });
    }

    #[test]
    fn sizes_are_accounted_per_entry() {
        crate::testing::test_async(async {
            let cache = Cache::new(1024 * 1024);
            let _ = cache.set("spice", "must", body("xxx"), TTL).await;
            assert_eq!(cache.stats().await.unwrap().size, 303);
            assert_eq!(cache.size(), 303);

            let _ = cache.set("spice", "must", body("x"), TTL).await;
            let stats = cache.stats().await.unwrap();
            assert_eq!(stats.size, 301);
            assert_eq!(stats.entries, 1);
            assert_eq!(cache.get("spice", "must").unwrap().response().body(), "x");

            assert!(cache.delete("spice", "must").await);
            assert_eq!(cache.stats().await.unwrap().size, 0);
            cache.stop().await;
        });
    }

    #[test]
    fn a_gc_pass_evicts_the_oldest_batch() {
        crate::testing::test_async(async {
            let cache = Cache::new(2_000_000);
            for i in 0..1500 {
                let key = i.to_string();
                let _ = cache.set(key.clone(), "", body(&key), TTL).await;
            }
            assert_eq!(cache.stats().await.unwrap().size, 454_890);

            assert_eq!(cache.gc().await.unwrap(), 1000);
            assert!(cache.get("999", "").is_none());
            assert!(cache.get("1000", "").is_some());
            assert!(cache.get("1499", "").is_some());

            let stats = cache.stats().await.unwrap();
            assert_eq!(stats.size, 152_000);
            assert_eq!(stats.entries, 500);
            assert_eq!(cache.len(), 500);
            cache.stop().await;
        });
    }

    #[test]
    fn least_recently_promoted_entries_are_evicted_first() {
        crate::testing::test_async(async {
            // Each entry accounts 301 bytes, so three fit but four don't...
            let cache = Cache::new(1000);
            let _ = cache.set("a", "", body("a"), TTL).await;
            let _ = cache.set("b", "", body("b"), TTL).await;
            let _ = cache.set("c", "", body("c"), TTL).await;

            // Promote "a" and make sure the worker has processed the promotion...
            assert!(cache.get("a", "").is_some());
            let _ = cache.stats().await.unwrap();

            let _ = cache.set("d", "", body("d"), TTL).await;
            let stats = cache.stats().await.unwrap();
            assert_eq!(stats.entries, 3);
            assert_eq!(stats.size, 903);
            assert!(cache.get("b", "").is_none());
            assert!(cache.get("a", "").is_some());
            assert!(cache.get("c", "").is_some());
            assert!(cache.get("d", "").is_some());

            // Shrinking takes effect with the next insert...
            cache.set_size(700).await;
            assert_eq!(cache.get_size(), 700);
            let _ = cache.set("e", "", body("e"), TTL).await;
            let stats = cache.stats().await.unwrap();
            assert_eq!(stats.entries, 2);
            assert!(cache.get("c", "").is_none());
            cache.stop().await;
        });
    }

    #[test]
    fn deleting_absent_keys_leaves_others_intact() {
        crate::testing::test_async(async {
            let cache = Cache::new(1024 * 1024);
            let _ = cache.set("/a", "1", body("1"), TTL).await;
            let _ = cache.set("/a", "2", body("2"), TTL).await;
            let _ = cache.set("/b", "", body("3"), TTL).await;

            assert!(!cache.delete("/a", "3").await);
            assert!(!cache.delete("/c", "").await);
            assert!(!cache.delete_all("/c").await);
            assert_eq!(cache.len(), 3);

            assert!(cache.delete_all("/a").await);
            assert!(!cache.delete_all("/a").await);
            assert!(cache.get("/a", "1").is_none());
            assert!(cache.get("/b", "").is_some());

            // Deleting twice is harmless...
            assert!(cache.delete("/b", "").await);
            assert!(!cache.delete("/b", "").await);

            let stats = cache.stats().await.unwrap();
            assert_eq!(stats.entries, 0);
            assert_eq!(stats.size, 0);
            cache.stop().await;
        });
    }

    #[test]
    fn snapshots_survive_a_restart() {
        crate::testing::test_async(async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("snapshots").join("cache.bin");

            let cache = Cache::new(1024 * 1024);
            let _ = cache.set("/a", "x=1", body("first"), TTL).await;
            let _ = cache
                .set("/b", "", CachedResponse::text(404, "second"), TTL)
                .await;
            // Entries expiring within the cutoff are skipped...
            let _ = cache
                .set("/c", "", body("short"), Duration::from_secs(5))
                .await;
            assert_eq!(
                cache.save(&path, 100, Duration::from_secs(30)).await.unwrap(),
                2
            );
            cache.stop().await;

            let restored = Cache::new(1024 * 1024);
            assert_eq!(restored.load(&path).await.unwrap(), 2);
            let entry = restored.get("/a", "x=1").unwrap();
            assert_eq!(entry.response().status(), 200);
            assert_eq!(entry.response().body(), "first");
            assert!(entry.expires() >= Instant::now() + Duration::from_secs(59));
            assert!(entry.expires() <= Instant::now() + Duration::from_secs(181));
            assert_eq!(restored.get("/b", "").unwrap().response().status(), 404);
            assert!(restored.get("/c", "").is_none());

            // Only the most recently used entries are written if a count is given...
            assert_eq!(
                restored.save(&path, 1, Duration::ZERO).await.unwrap(),
                1
            );
            restored.stop().await;
        });
    }

    #[test]
    fn loading_keeps_the_recency_order() {
        crate::testing::test_async(async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("cache.bin");

            let cache = Cache::new(1024 * 1024);
            let _ = cache.set("a", "", body("a"), TTL).await;
            let _ = cache.set("b", "", body("b"), TTL).await;
            let _ = cache.set("c", "", body("c"), TTL).await;
            assert!(cache.get("a", "").is_some());
            let _ = cache.stats().await.unwrap();
            assert_eq!(cache.save(&path, 100, Duration::ZERO).await.unwrap(), 3);
            cache.stop().await;

            // Only two entries fit, therefore the least recently used one has to go...
            let restored = Cache::new(700);
            assert_eq!(restored.load(&path).await.unwrap(), 3);
            assert!(restored.get("a", "").is_some());
            assert!(restored.get("c", "").is_some());
            assert!(restored.get("b", "").is_none());
            assert_eq!(restored.stats().await.unwrap().entries, 2);
            restored.stop().await;
        });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_keep_the_accounting_consistent() {
        const KEYS: usize = 16;
        const VARIANTS: usize = 3;

        let cache = Arc::new(Cache::new(100 * 1024 * 1024));
        let mut tasks = Vec::new();
        for task in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                for round in 0..500 {
                    let primary = ((task + round) % KEYS).to_string();
                    let secondary = (round % VARIANTS).to_string();
                    match round % 5 {
                        0 => {
                            let _ = cache.delete(&primary, &secondary).await;
                        }
                        1 if round % 50 == 1 => {
                            let _ = cache.delete_all(&primary).await;
                        }
                        _ => {
                            let text = "x".repeat(task * 10 + round % 7);
                            let _ = cache
                                .set(primary.clone(), secondary.clone(), body(&text), TTL)
                                .await;
                        }
                    }
                    let _ = cache.get(&primary, &secondary);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // The stats handshake is queued behind every command sent so far...
        let stats = cache.stats().await.unwrap();
        let mut expected_size = 0;
        let mut live_entries = 0;
        for primary in 0..KEYS {
            for secondary in 0..VARIANTS {
                if let Some(entry) = cache.get(&primary.to_string(), &secondary.to_string()) {
                    assert!(!entry.is_removed());
                    expected_size += entry.size();
                    live_entries += 1;
                }
            }
        }

        assert!(live_entries > 0);
        assert_eq!(stats.size, expected_size);
        assert_eq!(stats.entries, live_entries);
        assert_eq!(cache.len(), live_entries);
        cache.stop().await;
    }

    #[test]
    fn broken_snapshots_leave_the_cache_untouched() {
        crate::testing::test_async(async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("cache.bin");
            std::fs::write(&path, [2, 0, 0, 0, 1, 0, 0, 0, b'a']).unwrap();

            let cache = Cache::new(1024 * 1024);
            assert!(cache.load(&path).await.is_err());
            assert!(cache.load(dir.path().join("missing.bin")).await.is_err());
            assert!(cache.is_empty());
            cache.stop().await;
        });
    }
}
