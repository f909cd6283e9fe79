//! Transmit classes and their per-destination state.

use std::{
    fmt,
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwapOption;
use eyeq_common::RateLimitedLog;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    index::Index,
    stats::{ClassStats, DestStats},
    ClassKey, Params, RateControllerState, RateLimiter, VirtualQueue,
};

static POOL_EXHAUSTED: RateLimitedLog = RateLimitedLog::new(5_000_000, 10);

/// The limiter and controller of one peer.
#[derive(Debug)]
pub struct PerDestState {
    peer: Ipv4Addr,
    rl: Arc<RateLimiter>,
    rc: RateControllerState,
}

impl PerDestState {
    pub const fn peer(&self) -> Ipv4Addr {
        self.peer
    }

    pub const fn rl(&self) -> &Arc<RateLimiter> {
        &self.rl
    }

    pub const fn rc(&self) -> &RateControllerState {
        &self.rc
    }

    /// Feeds one observation to the controller and propagates an accepted change to the limiter.
    pub fn on_receive(&self, marked: bool, cpu: usize, now: u64, params: &Params) -> bool {
        let changed = self.rc.on_receive(marked, cpu, now, params);
        if changed {
            self.rl.set_rate(self.rc.rfair(), now);
        } else {
            self.rl.note_feedback(now);
        }
        changed
    }

    pub fn stats(&self) -> DestStats {
        DestStats { peer: self.peer, rl: self.rl.stats(), rc: self.rc.stats() }
    }
}

type PoolEntry = (RateLimiter, RateControllerState);

/// A virtual queue associated with a class.
#[derive(Debug)]
pub(crate) struct Association<K> {
    pub(crate) key: K,
    pub(crate) vq: Arc<VirtualQueue>,
}

/// The unit of fairness on transmit.
///
/// Owns an aggregate limiter for traffic without a destination address (and, in hierarchical mode,
/// as the parent of every destination limiter), the index of per-destination state, and a pool of
/// preallocated entries so that a new destination never allocates on the packet path.
pub struct TxClass<K> {
    key: K,
    vq: ArcSwapOption<Association<K>>,
    agg: Arc<RateLimiter>,
    dests: Index<Ipv4Addr, PerDestState>,
    pool: Mutex<Vec<PoolEntry>>,
    refill_pending: AtomicBool,
    refill_tx: mpsc::UnboundedSender<K>,
    num_cpus: usize,
}

impl<K: fmt::Debug> fmt::Debug for TxClass<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxClass")
            .field("key", &self.key)
            .field("dests", &self.dests.len())
            .field("agg", &self.agg)
            .finish_non_exhaustive()
    }
}

impl<K: ClassKey> TxClass<K> {
    /// Creates a class with an empty pool. Refills are requested over `refill_tx`.
    pub fn new(
        key: K,
        now: u64,
        num_cpus: usize,
        params: &Params,
        refill_tx: mpsc::UnboundedSender<K>,
    ) -> Self {
        Self {
            key,
            vq: ArcSwapOption::empty(),
            agg: Arc::new(RateLimiter::new(params.max_tx_rate, num_cpus, now, None)),
            dests: Index::default(),
            pool: Mutex::new(Vec::new()),
            refill_pending: AtomicBool::new(false),
            refill_tx,
            num_cpus,
        }
    }

    pub const fn key(&self) -> K {
        self.key
    }

    /// The aggregate limiter.
    pub const fn agg(&self) -> &Arc<RateLimiter> {
        &self.agg
    }

    /// The associated virtual queue, if any.
    pub fn vq(&self) -> Option<Arc<VirtualQueue>> {
        self.vq.load().as_ref().map(|assoc| Arc::clone(&assoc.vq))
    }

    pub(crate) fn vq_key(&self) -> Option<K> {
        self.vq.load().as_ref().map(|assoc| assoc.key)
    }

    /// Associates `vq`, returning the previous association.
    pub(crate) fn set_vq(&self, key: K, vq: Arc<VirtualQueue>) -> Option<Arc<Association<K>>> {
        vq.acquire();
        let previous = self.vq.swap(Some(Arc::new(Association { key, vq })));
        if let Some(previous) = &previous {
            previous.vq.release();
        }
        previous
    }

    /// Drops the association, releasing the queue.
    pub(crate) fn clear_vq(&self) {
        if let Some(previous) = self.vq.swap(None) {
            previous.vq.release();
        }
    }

    pub fn num_dests(&self) -> usize {
        self.dests.len()
    }

    pub fn pool_free(&self) -> usize {
        self.pool.lock().len()
    }

    /// Looks up the state of `peer` without blocking.
    pub fn find_state(&self, peer: Ipv4Addr) -> Option<Arc<PerDestState>> {
        self.dests.get(&peer)
    }

    /// Looks up the state of `peer`, creating it from the pool on a miss.
    ///
    /// Never blocks nor allocates a limiter: returns `None` if the class is being written to
    /// concurrently or the pool is empty, in which case the packet bypasses isolation.
    pub fn find_or_create_state(&self, peer: Ipv4Addr, now: u64, params: &Params) -> Option<Arc<PerDestState>> {
        self.dests.try_get_or_insert_with(peer, || {
            let mut pool = self.pool.try_lock()?;
            let entry = pool.pop();
            let remaining = pool.len();
            drop(pool);

            if remaining <= params.prealloc_low_water {
                self.request_refill();
            }

            let Some((mut rl, mut rc)) = entry else {
                if POOL_EXHAUSTED.allow() {
                    warn!(class = %self.key, %peer, "Destination pool exhausted, passing packet through");
                }
                return None;
            };

            let parent = params.hierarchical.then(|| Arc::clone(&self.agg));
            rl.restart(params.rfair_initial, now, parent);
            rc.restart(now, params);

            Some(Arc::new(PerDestState { peer, rl: Arc::new(rl), rc }))
        })
    }

    fn request_refill(&self) {
        if !self.refill_pending.swap(true, Ordering::AcqRel) && self.refill_tx.send(self.key).is_err() {
            self.refill_pending.store(false, Ordering::Release);
        }
    }

    /// Tops the pool up to `prealloc_per_class` entries. Allocates outside the pool lock; slow path
    /// only. Returns the number of entries added.
    pub fn refill_pool(&self, now: u64, params: &Params) -> usize {
        let missing = params.prealloc_per_class.saturating_sub(self.pool_free());
        let fresh: Vec<PoolEntry> = (0..missing)
            .map(|_| {
                (
                    RateLimiter::new(params.rfair_initial, self.num_cpus, now, None).feedback_controlled(),
                    RateControllerState::new(now, self.num_cpus, params),
                )
            })
            .collect();

        let added = fresh.len();
        self.pool.lock().extend(fresh);
        self.refill_pending.store(false, Ordering::Release);

        debug!(class = %self.key, added, "refilled destination pool");
        added
    }

    /// Drops every queued packet of the class. Returns how many were dropped.
    pub(crate) fn flush(&self) -> usize {
        let dests: usize = self.dests.values().iter().map(|state| state.rl.flush()).sum();
        dests + self.agg.flush()
    }

    /// Unlinks every destination. Their limiters are freed once no reader holds them.
    pub(crate) fn clear(&self) -> usize {
        self.dests.drain().len()
    }

    pub fn stats(&self) -> ClassStats {
        let mut dests: Vec<_> = self.dests.values().iter().map(|state| state.stats()).collect();
        dests.sort_unstable_by_key(|d| d.peer);

        ClassStats {
            key: self.key.to_string(),
            vq: self.vq_key().map(|k| k.to_string()),
            agg: self.agg.stats(),
            dests,
            pool_free: self.pool_free(),
        }
    }
}
