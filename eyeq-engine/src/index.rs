use std::{
    hash::{BuildHasher, BuildHasherDefault, Hash},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rustc_hash::FxHasher;

/// Default number of buckets of an index.
pub(crate) const DEFAULT_BUCKETS: usize = 256;

type Bucket<K, V> = ArcSwap<Vec<(K, Arc<V>)>>;

/// A hash-bucketed map with lock-free reads.
///
/// Every bucket is an immutable vector behind an [`ArcSwap`]. Writers build a new vector and swap
/// it in under the index's write lock; readers load a snapshot and never block. A reader holding a
/// snapshot keeps the entries it saw alive, so a removed entry is reclaimed only once the last
/// reader that could observe it is gone.
pub(crate) struct Index<K, V> {
    buckets: Box<[Bucket<K, V>]>,
    mask: usize,
    write: Mutex<()>,
    len: AtomicUsize,
    hasher: BuildHasherDefault<FxHasher>,
}

impl<K, V> std::fmt::Debug for Index<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("buckets", &self.buckets.len())
            .field("len", &self.len.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K, V> Default for Index<K, V>
where
    K: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new(DEFAULT_BUCKETS)
    }
}

impl<K, V> Index<K, V>
where
    K: Copy + Eq + Hash,
{
    /// Creates an index with `buckets` buckets, rounded up to a power of two.
    pub(crate) fn new(buckets: usize) -> Self {
        let count = buckets.max(1).next_power_of_two();
        let buckets = (0..count).map(|_| ArcSwap::from_pointee(Vec::new())).collect();

        Self {
            buckets,
            mask: count - 1,
            write: Mutex::new(()),
            len: AtomicUsize::new(0),
            hasher: BuildHasherDefault::default(),
        }
    }

    #[inline]
    fn bucket(&self, key: &K) -> &Bucket<K, V> {
        let hash = self.hasher.hash_one(key) as usize;
        &self.buckets[hash & self.mask]
    }

    /// Looks up `key` without blocking.
    pub(crate) fn get(&self, key: &K) -> Option<Arc<V>> {
        self.bucket(key)
            .load()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| Arc::clone(v))
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.bucket(key).load().iter().any(|(k, _)| k == key)
    }

    /// Returns the entry for `key`, creating it with `create` on a miss.
    ///
    /// Never blocks: if another writer holds the lock, or `create` declines, returns `None`.
    /// The lookup is repeated under the lock so racing creators publish only one entry.
    pub(crate) fn try_get_or_insert_with(
        &self,
        key: K,
        create: impl FnOnce() -> Option<Arc<V>>,
    ) -> Option<Arc<V>> {
        if let Some(value) = self.get(&key) {
            return Some(value);
        }

        let _guard = self.write.try_lock()?;
        if let Some(value) = self.get(&key) {
            return Some(value);
        }

        let value = create()?;
        self.publish(key, Arc::clone(&value));
        Some(value)
    }

    /// Inserts `value` unless `key` is present. Returns the existing entry on conflict.
    /// Blocks on the write lock; administrative paths only.
    pub(crate) fn insert(&self, key: K, value: Arc<V>) -> Result<(), Arc<V>> {
        let _guard = self.write.lock();
        if let Some(existing) = self.get(&key) {
            return Err(existing);
        }

        self.publish(key, value);
        Ok(())
    }

    fn publish(&self, key: K, value: Arc<V>) {
        let bucket = self.bucket(&key);
        let mut entries = Vec::clone(&bucket.load());
        entries.push((key, value));
        bucket.store(Arc::new(entries));
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Unlinks `key`. Readers that already loaded the bucket keep the entry alive until they drop
    /// their snapshot.
    pub(crate) fn remove(&self, key: &K) -> Option<Arc<V>> {
        let _guard = self.write.lock();
        let bucket = self.bucket(key);
        let current = bucket.load_full();
        let position = current.iter().position(|(k, _)| k == key)?;

        let mut entries = Vec::clone(&current);
        let (_, removed) = entries.swap_remove(position);
        bucket.store(Arc::new(entries));
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(removed)
    }

    /// Unlinks every entry and returns them.
    pub(crate) fn drain(&self) -> Vec<(K, Arc<V>)> {
        let _guard = self.write.lock();
        let mut drained = Vec::new();
        for bucket in self.buckets.iter() {
            let old = bucket.swap(Arc::new(Vec::new()));
            drained.extend(old.iter().map(|(k, v)| (*k, Arc::clone(v))));
        }

        self.len.store(0, Ordering::Relaxed);
        drained
    }

    /// A point-in-time copy of all entries.
    pub(crate) fn snapshot(&self) -> Vec<(K, Arc<V>)> {
        let mut entries = Vec::with_capacity(self.len());
        for bucket in self.buckets.iter() {
            entries.extend(bucket.load().iter().map(|(k, v)| (*k, Arc::clone(v))));
        }
        entries
    }

    pub(crate) fn values(&self) -> Vec<Arc<V>> {
        self.snapshot().into_iter().map(|(_, v)| v).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}
