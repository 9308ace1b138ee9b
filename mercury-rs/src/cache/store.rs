//! Provides the sharded two-level map which stores all cache entries.
//!
//! The key space is partitioned by the primary key into a fixed number of shards. Each shard is
//! guarded by its own **RwLock**, therefore lookups and updates of unrelated keys never contend
//! with each other. Within a shard, the primary key maps to all known variants (secondary keys).
use crate::cache::entry::CacheEntry;
use fnv::FnvHashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Specifies the default number of shards.
pub const DEFAULT_SHARDS: usize = 256;

type Variants = FnvHashMap<String, Arc<CacheEntry>>;

#[derive(Default)]
struct Shard {
    map: RwLock<FnvHashMap<String, Variants>>,
}

impl Shard {
    fn read(&self) -> RwLockReadGuard<'_, FnvHashMap<String, Variants>> {
        self.map.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FnvHashMap<String, Variants>> {
        self.map.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Computes the 32 bit FNV-1a hash of the given key.
///
/// Being stable across runs and platforms, this determines the shard of a primary key.
pub fn fnv32a(key: &str) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    key.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(PRIME)
    })
}

/// Maps (primary, secondary) keys to cache entries.
pub struct ShardedStore {
    shards: Vec<Shard>,
    mask: usize,
}

impl Default for ShardedStore {
    fn default() -> Self {
        ShardedStore::new(DEFAULT_SHARDS)
    }
}

impl ShardedStore {
    /// Creates a store with the given number of shards.
    ///
    /// # Panics
    /// Panics if the number of shards isn't a power of two.
    pub fn new(num_shards: usize) -> Self {
        assert!(
            num_shards.is_power_of_two(),
            "The number of shards must be a power of two!"
        );

        ShardedStore {
            shards: (0..num_shards).map(|_| Shard::default()).collect(),
            mask: num_shards - 1,
        }
    }

    fn shard(&self, primary: &str) -> &Shard {
        &self.shards[fnv32a(primary) as usize & self.mask]
    }

    /// Returns the entry for the given keys.
    pub fn get(&self, primary: &str, secondary: &str) -> Option<Arc<CacheEntry>> {
        self.shard(primary)
            .read()
            .get(primary)
            .and_then(|variants| variants.get(secondary))
            .cloned()
    }

    /// Stores the given entry and returns the one previously stored for the same keys.
    pub fn set(&self, entry: Arc<CacheEntry>) -> Option<Arc<CacheEntry>> {
        let mut map = self.shard(entry.primary()).write();
        match map.get_mut(entry.primary()) {
            Some(variants) => variants.insert(entry.secondary().to_owned(), entry),
            None => {
                let mut variants = Variants::default();
                let primary = entry.primary().to_owned();
                let _ = variants.insert(entry.secondary().to_owned(), entry);
                let _ = map.insert(primary, variants);
                None
            }
        }
    }

    /// Removes and returns the entry for the given keys.
    pub fn delete(&self, primary: &str, secondary: &str) -> Option<Arc<CacheEntry>> {
        let mut map = self.shard(primary).write();
        let variants = map.get_mut(primary)?;
        let removed = variants.remove(secondary);
        if variants.is_empty() {
            let _ = map.remove(primary);
        }

        removed
    }

    /// Removes and returns all variants of the given primary key.
    pub fn delete_all(&self, primary: &str) -> Vec<Arc<CacheEntry>> {
        self.shard(primary)
            .write()
            .remove(primary)
            .map(|variants| variants.into_values().collect())
            .unwrap_or_default()
    }

    /// Removes the given entry, but only if it is still the one stored for its keys.
    ///
    /// Returns **false** if the keys are unknown or were already taken over by another entry.
    pub fn remove_entry(&self, entry: &Arc<CacheEntry>) -> bool {
        let mut map = self.shard(entry.primary()).write();
        let variants = match map.get_mut(entry.primary()) {
            Some(variants) => variants,
            None => return false,
        };

        match variants.get(entry.secondary()) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                let _ = variants.remove(entry.secondary());
                if variants.is_empty() {
                    let _ = map.remove(entry.primary());
                }
                true
            }
            _ => false,
        }
    }

    /// Counts all entries in all shards.
    ///
    /// Note that this locks each shard once and is therefore intended for diagnostics only.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().values().map(|variants| variants.len()).sum::<usize>())
            .sum()
    }

    /// Determines if no entries are stored at all.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.read().is_empty())
    }
}
