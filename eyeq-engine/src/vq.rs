//! Receiver-side virtual queues.
//!
//! A virtual queue models the occupancy of a remote bottleneck for one class: received bytes fill
//! it, and it drains at the class's weighted share of `vq_drain_rate`. From the modelled backlog
//! and the ECN marks seen on the wire it derives the rate it advertises back to senders, and
//! decides when to send them feedback.

use std::{
    hash::Hash,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use eyeq_common::{micros_since, PerCpu};
use eyeq_wire::{Feedback, Packet};
use parking_lot::Mutex;
use tracing::trace;

use crate::{index::Index, rc::ALPHA_SHIFT, stats::VqStats, Datapath, Params};

const ALPHA_ONE: u64 = 1 << ALPHA_SHIFT;

/// `last_feedback` value of a queue that never sent feedback.
const NEVER: u64 = u64::MAX;

#[derive(Debug, Default)]
struct VqCpuStats {
    /// Received bytes not yet folded into the backlog.
    bytes_queued: AtomicU64,
    network_marked: AtomicU64,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    /// Packets since the last drain, for the marked fraction.
    rx_since_drain: AtomicU64,
    marked_since_drain: AtomicU64,
}

#[derive(Debug)]
struct VqInner {
    backlog: u64,
    tokens: u64,
    /// Marked fraction EWMA, scaled by `1 << ALPHA_SHIFT`.
    alpha: u64,
    /// Receive rate over the last drain interval, in Mbps.
    rx_rate: u64,
    last_update: u64,
}

/// Class-wide state shared by all virtual queues: the active weight and the token pool they
/// borrow from.
#[derive(Debug)]
pub struct VqShared {
    active_weight: AtomicU64,
    pool: Mutex<VqPool>,
    last_idle_check: AtomicU64,
}

#[derive(Debug)]
struct VqPool {
    tokens: u64,
    last_update: u64,
}

impl VqShared {
    pub fn new(now: u64) -> Self {
        Self {
            active_weight: AtomicU64::new(0),
            pool: Mutex::new(VqPool { tokens: 0, last_update: now }),
            last_idle_check: AtomicU64::new(now),
        }
    }

    /// Sum of the weights of all active queues.
    pub fn active_weight(&self) -> u64 {
        self.active_weight.load(Ordering::Relaxed)
    }

    pub fn pool_tokens(&self) -> u64 {
        self.pool.lock().tokens
    }

    /// Refills the pool at `vq_drain_rate` and hands out up to `want` bytes. Never blocks.
    fn borrow(&self, want: u64, now: u64, params: &Params) -> u64 {
        let Some(mut pool) = self.pool.try_lock() else {
            return 0;
        };

        let dt = micros_since(now, pool.last_update);
        pool.tokens = pool
            .tokens
            .saturating_add(params.vq_drain_rate.saturating_mul(dt) / 8)
            .min(params.burst_cap(params.vq_drain_rate));
        pool.last_update = now;

        let granted = want.min(pool.tokens);
        pool.tokens -= granted;
        granted
    }
}

/// A virtual queue.
#[derive(Debug)]
pub struct VirtualQueue {
    enabled: AtomicBool,
    active: AtomicBool,
    /// Static queues are never deactivated by idle detection.
    is_static: AtomicBool,
    weight: AtomicU64,
    /// Drain rate in Mbps: the weighted share of `vq_drain_rate`.
    rate: AtomicU64,
    /// Rate advertised to senders, in Mbps.
    feedback_rate: AtomicU64,
    backlog: AtomicU64,
    last_nonempty: AtomicU64,
    last_update: AtomicU64,
    last_feedback: AtomicU64,
    bytes_since_feedback: AtomicU64,
    /// Number of classes associated with this queue.
    refcount: AtomicUsize,
    inner: Mutex<VqInner>,
    stats: PerCpu<VqCpuStats>,
}

impl VirtualQueue {
    pub fn new(now: u64, num_cpus: usize, params: &Params) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            active: AtomicBool::new(false),
            is_static: AtomicBool::new(false),
            weight: AtomicU64::new(1),
            rate: AtomicU64::new(params.vq_drain_rate),
            feedback_rate: AtomicU64::new(params.vq_drain_rate),
            backlog: AtomicU64::new(0),
            last_nonempty: AtomicU64::new(now),
            last_update: AtomicU64::new(now),
            last_feedback: AtomicU64::new(NEVER),
            bytes_since_feedback: AtomicU64::new(0),
            refcount: AtomicUsize::new(0),
            inner: Mutex::new(VqInner {
                backlog: 0,
                tokens: 0,
                alpha: 0,
                rx_rate: 0,
                last_update: now,
            }),
            stats: PerCpu::with_default(num_cpus),
        }
    }

    #[inline]
    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn backlog(&self) -> u64 {
        self.backlog.load(Ordering::Relaxed)
    }

    pub fn weight(&self) -> u64 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// A disabled queue ignores received traffic, never reports congestion, and leaves the active
    /// weight until it is enabled and receives again.
    pub fn set_enabled(&self, enabled: bool, shared: &VqShared) {
        self.enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.deactivate(shared);
        }
    }

    pub fn set_static(&self, is_static: bool) {
        self.is_static.store(is_static, Ordering::Relaxed);
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Relaxed)
    }

    pub(crate) fn acquire(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn release(&self) {
        self.refcount.fetch_sub(1, Ordering::Relaxed);
    }

    /// Changes the weight, keeping the class-wide active weight consistent.
    pub fn set_weight(&self, weight: u64, shared: &VqShared) {
        let old = self.weight.swap(weight, Ordering::Relaxed);
        if self.is_active() {
            shared.active_weight.fetch_add(weight, Ordering::Relaxed);
            shared.active_weight.fetch_sub(old, Ordering::Relaxed);
        }
    }

    fn activate(&self, shared: &VqShared) {
        if !self.active.swap(true, Ordering::AcqRel) {
            shared.active_weight.fetch_add(self.weight(), Ordering::Relaxed);
        }
    }

    fn deactivate(&self, shared: &VqShared) {
        if self.active.swap(false, Ordering::AcqRel) {
            shared.active_weight.fetch_sub(self.weight(), Ordering::Relaxed);
        }
    }

    /// Accounts a received packet, then drains if the update interval has passed.
    pub fn enqueue(&self, packet: &Packet, cpu: usize, now: u64, shared: &VqShared, params: &Params) {
        let len = packet.len() as u64;
        let stats = self.stats.get(cpu);
        stats.rx_packets.fetch_add(1, Ordering::Relaxed);
        stats.rx_bytes.fetch_add(len, Ordering::Relaxed);
        stats.bytes_queued.fetch_add(len, Ordering::Relaxed);
        stats.rx_since_drain.fetch_add(1, Ordering::Relaxed);
        if packet.is_ce_marked() {
            stats.network_marked.fetch_add(1, Ordering::Relaxed);
            stats.marked_since_drain.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_since_feedback.fetch_add(len, Ordering::Relaxed);

        self.last_nonempty.store(now, Ordering::Relaxed);
        self.activate(shared);

        if micros_since(now, self.last_update.load(Ordering::Relaxed)) >= params.vq_update_interval_us {
            self.drain(now, shared, params);
        }
    }

    /// Folds received bytes into the backlog, recomputes the fair share and the advertised rate,
    /// and drains the backlog by the tokens available. Skipped if another context is draining.
    pub fn drain(&self, now: u64, shared: &VqShared, params: &Params) {
        let Some(mut inner) = self.inner.try_lock() else {
            return;
        };

        let dt = micros_since(now, inner.last_update);
        if dt == 0 {
            return;
        }

        let mut queued = 0;
        let mut rx = 0;
        let mut marked = 0;
        for stats in self.stats.iter() {
            queued += stats.bytes_queued.swap(0, Ordering::Relaxed);
            rx += stats.rx_since_drain.swap(0, Ordering::Relaxed);
            marked += stats.marked_since_drain.swap(0, Ordering::Relaxed);
        }

        inner.backlog = (inner.backlog + queued).min(params.vq_max_bytes);
        inner.rx_rate = queued.saturating_mul(8) / dt;
        if inner.backlog > 0 {
            self.last_nonempty.store(now, Ordering::Relaxed);
        }

        let weight = self.weight().max(1);
        let active_weight = shared.active_weight().max(weight);
        let rate = weighted_share(params.vq_drain_rate, weight, active_weight);
        self.rate.store(rate, Ordering::Relaxed);

        let frac = if rx > 0 { (marked << ALPHA_SHIFT) / rx } else { 0 };
        inner.alpha = (inner.alpha * 15 + frac.min(ALPHA_ONE)) / 16;

        let feedback_rate = if self.is_active() {
            advertised_rate(self.feedback_rate.load(Ordering::Relaxed), rate, inner.rx_rate, inner.alpha, params)
        } else {
            rate
        };
        self.feedback_rate.store(feedback_rate, Ordering::Relaxed);

        // Drain at our share, borrowing from the class pool only what the backlog still needs.
        let cap = params.burst_cap(rate);
        if inner.tokens < inner.backlog {
            let want = (rate.saturating_mul(dt) / 8).min(cap).min(inner.backlog - inner.tokens);
            inner.tokens = (inner.tokens + shared.borrow(want, now, params)).min(cap);
        }
        let drained = inner.backlog.min(inner.tokens);
        inner.backlog -= drained;
        inner.tokens -= drained;
        inner.last_update = now;

        self.backlog.store(inner.backlog, Ordering::Relaxed);
        self.last_update.store(now, Ordering::Relaxed);

        trace!(rate, rx_rate = inner.rx_rate, feedback_rate, backlog = inner.backlog, "vq drain");
    }

    /// The rate this queue advertises to senders. Below [`VirtualQueue::rate`] when the queue is
    /// congested.
    #[inline]
    pub fn over_limits(&self) -> u64 {
        self.feedback_rate.load(Ordering::Relaxed)
    }

    /// Returns `true` if senders should be told to slow down.
    pub fn is_congested(&self, params: &Params) -> bool {
        self.is_enabled() &&
            (self.over_limits() < self.rate() || self.backlog() > params.vq_mark_thresh_bytes)
    }

    /// Answers `trigger` with a feedback packet carrying `marked`, at most once per
    /// `feedback_interval_us`, or earlier once `feedback_interval_bytes` were received since the
    /// last one. Returns `true` if a packet was sent.
    pub fn generate_feedback(&self, marked: bool, trigger: &Packet, now: u64, dp: &Datapath) -> bool {
        let params = dp.params();
        let last = self.last_feedback.load(Ordering::Acquire);

        if !params.always_feedback && last != NEVER {
            let by_time = micros_since(now, last) >= params.feedback_interval_us;
            let by_bytes = params.feedback_interval_bytes > 0 &&
                self.bytes_since_feedback.load(Ordering::Relaxed) >= params.feedback_interval_bytes;
            if !by_time && !by_bytes {
                return false;
            }
        }

        if self
            .last_feedback
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.bytes_since_feedback.store(0, Ordering::Relaxed);

        match Feedback::reply_to(trigger, marked) {
            Ok(feedback) => dp.transmit(feedback.encode(params.feedback_ipproto)),
            Err(_) => false,
        }
    }

    pub fn stats(&self, key: String) -> VqStats {
        let inner = self.inner.lock();
        let mut stats = VqStats {
            key,
            enabled: self.is_enabled(),
            active: self.is_active(),
            is_static: self.is_static.load(Ordering::Relaxed),
            weight: self.weight(),
            rate: self.rate(),
            feedback_rate: self.over_limits(),
            rx_rate: inner.rx_rate,
            backlog: inner.backlog,
            tokens: inner.tokens,
            alpha: inner.alpha,
            refcount: self.refcount(),
            ..Default::default()
        };

        for cpu in self.stats.iter() {
            stats.rx_packets += cpu.rx_packets.load(Ordering::Relaxed);
            stats.rx_bytes += cpu.rx_bytes.load(Ordering::Relaxed);
            stats.network_marked += cpu.network_marked.load(Ordering::Relaxed);
        }

        stats
    }
}

/// Corrects the advertised rate by two independent terms applied to the same previous value:
/// an RCP-style factor `(3r - rx) / 2r` comparing the receive rate to the fair share, and an ECN
/// factor `1 - alpha / 2`. The result is clamped to `[min_rfair, rate]`.
fn advertised_rate(previous: u64, rate: u64, rx_rate: u64, alpha: u64, params: &Params) -> u64 {
    let rate = rate.max(1);
    let rcp_num = (3 * rate as u128).saturating_sub(rx_rate as u128);
    let rcp_den = 2 * rate as u128;
    let ecn_num = (2 * ALPHA_ONE - alpha.min(ALPHA_ONE)) as u128;
    let ecn_den = (2 * ALPHA_ONE) as u128;

    let corrected = previous as u128 * rcp_num * ecn_num / (rcp_den * ecn_den);
    (corrected.min(rate as u128) as u64).max(params.min_rfair)
}

/// `rate * weight / active_weight` without intermediate overflow. `weight` never exceeds
/// `active_weight`, so the result fits.
fn weighted_share(rate: u64, weight: u64, active_weight: u64) -> u64 {
    let share = u128::from(rate) * u128::from(weight) / u128::from(active_weight.max(1));
    share.min(u128::from(rate)) as u64
}

/// All virtual queues of an engine.
#[derive(Debug)]
pub struct VqSet<K> {
    index: Index<K, VirtualQueue>,
    shared: VqShared,
}

impl<K> VqSet<K>
where
    K: Copy + Eq + Hash,
{
    pub fn new(now: u64) -> Self {
        Self { index: Index::default(), shared: VqShared::new(now) }
    }

    pub const fn shared(&self) -> &VqShared {
        &self.shared
    }

    pub fn get(&self, key: &K) -> Option<Arc<VirtualQueue>> {
        self.index.get(key)
    }

    pub(crate) fn index(&self) -> &Index<K, VirtualQueue> {
        &self.index
    }

    /// Removes `key`, deactivating its queue first.
    pub(crate) fn remove(&self, key: &K) -> Option<Arc<VirtualQueue>> {
        let vq = self.index.remove(key)?;
        vq.deactivate(&self.shared);
        Some(vq)
    }

    /// Deactivates non-static queues that have been empty for `vq_idle_timeout_us`, removing their
    /// weight from the active weight. Runs at most once per `vq_idle_check_interval_us`.
    pub fn check_idle(&self, now: u64, params: &Params) -> usize {
        let last = self.shared.last_idle_check.load(Ordering::Relaxed);
        if micros_since(now, last) < params.vq_idle_check_interval_us ||
            self.shared
                .last_idle_check
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
        {
            return 0;
        }

        let mut deactivated = 0;
        for vq in self.index.values() {
            let idle = micros_since(now, vq.last_nonempty.load(Ordering::Relaxed));
            if vq.is_active() &&
                !vq.is_static.load(Ordering::Relaxed) &&
                vq.backlog() == 0 &&
                idle >= params.vq_idle_timeout_us
            {
                vq.deactivate(&self.shared);
                deactivated += 1;
            }
        }

        deactivated
    }

    /// Assigns every active queue its weighted share of `vq_drain_rate`. Returns the sum of the
    /// assigned rates.
    pub fn calculate_rates(&self, params: &Params) -> u64 {
        let queues = self.index.values();
        let active_weight = queues
            .iter()
            .filter(|vq| vq.is_active())
            .fold(0u64, |sum, vq| sum.saturating_add(vq.weight()));

        let mut total = 0;
        for vq in queues.iter().filter(|vq| vq.is_active()) {
            let rate = weighted_share(params.vq_drain_rate, vq.weight(), active_weight);
            vq.rate.store(rate, Ordering::Relaxed);
            total += rate;
        }

        total
    }
}
