use crossbeam_utils::CachePadded;

/// A fixed-size array of per-CPU shards.
///
/// Shard `i` is owned by worker `i` on the fast path. Any other worker that needs to touch it
/// (e.g. to drain a queue) must go through the shard's own synchronization, which the shard type
/// is responsible for providing.
///
/// CPU indices larger than the shard count wrap around, so callers can pass a raw worker id.
#[derive(Debug)]
pub struct PerCpu<T> {
    shards: Box<[CachePadded<T>]>,
}

impl<T> PerCpu<T> {
    /// Creates `count` shards (at least one), initialising each with `init(cpu)`.
    pub fn new(count: usize, mut init: impl FnMut(usize) -> T) -> Self {
        let shards = (0..count.max(1)).map(|cpu| CachePadded::new(init(cpu))).collect();
        Self { shards }
    }

    /// Returns the shard owned by `cpu`.
    #[inline]
    pub fn get(&self, cpu: usize) -> &T {
        &self.shards[cpu % self.shards.len()]
    }

    /// Maps a raw worker id onto a shard index.
    #[inline]
    pub fn index(&self, cpu: usize) -> usize {
        cpu % self.shards.len()
    }

    /// Returns the number of shards.
    #[inline]
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Always `false`: there is at least one shard.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Iterates over all shards in CPU order.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.shards.iter().map(|s| &**s)
    }
}

impl<T: Default> PerCpu<T> {
    /// Creates `count` default-initialised shards.
    pub fn with_default(count: usize) -> Self {
        Self::new(count, |_| T::default())
    }
}
