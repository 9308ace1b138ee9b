//! Contains the actor which owns the eviction order and the size accounting of a cache.
//!
//! All operations which modify the [EvictionList] or the running size are sent as [Command] into
//! a single queue and are executed one after another by the worker task. Therefore, neither the
//! list nor the counters need any locking. The downside is that the order of the list is only
//! eventually consistent, as promotions are processed asynchronously.
//!
//! Once the running size exceeds the allowed maximum, a GC pass is executed which evicts entries
//! from the tail of the list until the cache fits again. A single pass evicts at most [GC_BATCH]
//! entries, so that the worker never stalls for too long. An explicit GC pass (see
//! [Command::Collect]) always evicts a full batch.
use crate::cache::codec::{write_snapshot, SnapshotRecord};
use crate::cache::entry::CacheEntry;
use crate::cache::list::EvictionList;
use crate::cache::store::ShardedStore;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Determines the maximal number of entries evicted by a single GC pass.
pub const GC_BATCH: usize = 1000;

/// Determines the capacity of the command queue of a worker.
pub const QUEUE_CAPACITY: usize = 1024;

/// Describes the parameters of a snapshot being written by the worker.
pub struct PersistRequest {
    /// The file to write.
    pub path: PathBuf,
    /// The maximal number of entries to write (most recently used first).
    pub count: usize,
    /// Entries which expire within this period are skipped.
    pub cutoff: Duration,
    /// Receives the number of written entries or the error which occurred.
    pub result: oneshot::Sender<anyhow::Result<usize>>,
}

/// Enumerates the commands understood by the worker.
pub enum Command {
    /// Moves the entry to the head of the eviction list (links it, if necessary).
    Promote(Arc<CacheEntry>),
    /// Unlinks the entry from the eviction list.
    Delete(Arc<CacheEntry>),
    /// Changes the maximal size of the cache.
    Resize(usize),
    /// Executes a GC pass and reports the number of evicted entries.
    Collect(oneshot::Sender<usize>),
    /// Reports the current figures of the cache.
    Stats(oneshot::Sender<CacheStats>),
    /// Writes a snapshot of the cache.
    Persist(PersistRequest),
    /// Terminates the worker.
    Stop(oneshot::Sender<()>),
}

/// Provides the figures of a cache as seen by its worker.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// The sum of the sizes of all tracked entries.
    pub size: usize,
    /// The maximal allowed size.
    pub max_size: usize,
    /// The number of tracked entries.
    pub entries: usize,
}

/// Owns the eviction list and the running size of a cache.
pub struct CacheWorker {
    store: Arc<ShardedStore>,
    list: EvictionList,
    size: usize,
    max_size: usize,
    published_size: Arc<AtomicUsize>,
}

impl CacheWorker {
    /// Starts a worker for the given store and returns the queue to send commands to.
    ///
    /// The running size is mirrored into **published_size** after each command so that it can be
    /// read without a round trip to the worker.
    pub fn spawn(
        store: Arc<ShardedStore>,
        max_size: usize,
        published_size: Arc<AtomicUsize>,
    ) -> mpsc::Sender<Command> {
        let (queue, commands) = mpsc::channel(QUEUE_CAPACITY);
        let worker = CacheWorker {
            store,
            list: EvictionList::new(),
            size: 0,
            max_size,
            published_size,
        };

        crate::spawn!(worker.run(commands));

        queue
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Promote(entry) => self.promote(entry),
                Command::Delete(entry) => self.delete(&entry),
                Command::Resize(max_size) => self.max_size = max_size,
                Command::Collect(callback) => {
                    let evicted = self.collect(0);
                    let _ = callback.send(evicted);
                }
                Command::Stats(callback) => {
                    let _ = callback.send(self.stats());
                }
                Command::Persist(request) => self.persist(request),
                Command::Stop(callback) => {
                    log::debug!("Stopping cache worker ({} entries tracked)...", self.list.len());
                    let _ = callback.send(());
                    return;
                }
            }

            self.published_size.store(self.size, Ordering::Relaxed);
        }
    }

    fn promote(&mut self, entry: Arc<CacheEntry>) {
        if entry.is_removed() {
            return;
        }

        if self.list.contains(&entry) {
            self.list.push_to_front(&entry);
            return;
        }

        self.size += entry.size();
        self.list.push_to_front(&entry);

        if self.size > self.max_size {
            let evicted = self.collect(self.max_size);
            log::debug!(
                "Cache exceeded its limit of {} bytes: {} entries evicted, {} bytes remaining.",
                self.max_size,
                evicted,
                self.size
            );
        }
    }

    fn delete(&mut self, entry: &Arc<CacheEntry>) {
        if self.list.remove(entry) {
            self.size -= entry.size();
        }
    }

    fn collect(&mut self, target_size: usize) -> usize {
        let mut evicted = 0;
        while evicted < GC_BATCH && self.size > target_size {
            let victim = match self.list.back() {
                Some(victim) => victim.clone(),
                None => break,
            };

            // A victim which has already been displaced is removed from the list only, as its
            // keys now belong to another entry...
            let _ = self.store.remove_entry(&victim);
            victim.mark_removed();
            self.delete(&victim);
            evicted += 1;
        }

        evicted
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.size,
            max_size: self.max_size,
            entries: self.list.len(),
        }
    }

    fn persist(&self, request: PersistRequest) {
        // A cutoff beyond the range of Instant leaves nothing worth persisting...
        let threshold = Instant::now().checked_add(request.cutoff);
        let records: Vec<SnapshotRecord> = self
            .list
            .iter()
            .filter(|entry| threshold.is_some_and(|threshold| entry.expires() > threshold))
            .take(request.count)
            .map(SnapshotRecord::from)
            .collect();

        // Encoding and writing happens in a detached task, so that the worker keeps processing
        // promotions meanwhile...
        crate::spawn!(async move {
            let count = records.len();
            let result = write_snapshot(&request.path, &records)
                .await
                .map(|_| count);
            if request.result.send(result).is_err() {
                log::debug!(
                    "Snapshot {} was written but nobody awaited the result.",
                    request.path.display()
                );
            }
        });
    }
}
