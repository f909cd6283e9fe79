//! Hierarchical token-bucket rate limiter with per-CPU queues.
//!
//! Each limiter keeps a global token pool, refilled lazily at its rate, and one FIFO queue per
//! CPU. A queue holds a private token balance that it borrows from the pool in chunks, so the
//! common case of draining a queue only touches that CPU's shard. Queues that cannot borrow are
//! parked on their CPU's active list and retried by the deferred drain.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use eyeq_common::{micros_since, PerCpu, RateLimitedLog};
use eyeq_wire::{segment, Packet};
use parking_lot::Mutex;
use tracing::warn;

use crate::{stats::RlStats, Datapath, Params, Verdict};

static SEGMENT_FAILED: RateLimitedLog = RateLimitedLog::new(5_000_000, 10);

/// Global token pool of a limiter.
#[derive(Debug, Default)]
struct Bucket {
    total_tokens: u64,
    last_update: u64,
}

#[derive(Debug, Default)]
struct QueueInner {
    list: VecDeque<Packet>,
    bytes_enqueued: u64,
    tokens: u64,
    /// Size of the head packet, 0 when empty.
    first_pkt_size: u64,
    /// Number of outgoing packets that still have to carry the reflect flag.
    feedback_backlog: u64,
}

#[derive(Debug, Default)]
struct RlQueue {
    inner: Mutex<QueueInner>,
    /// Set while the queue sits on its CPU's active list.
    active: AtomicBool,
}

/// A token-bucket rate limiter.
pub struct RateLimiter {
    /// Rate in Mbps.
    rate: AtomicU64,
    bucket: Mutex<Bucket>,
    /// Copy of `bucket.last_update`, read without the lock to skip refills early.
    last_update: AtomicU64,
    last_rate_update: AtomicU64,
    last_enqueue: AtomicU64,
    /// Limiters driven by a rate controller are subject to the idle cap and the stall fail-safe.
    feedback_controlled: bool,
    queues: PerCpu<RlQueue>,
    parent: Option<Arc<RateLimiter>>,
    children: AtomicUsize,
    accum_xmit: AtomicU64,
    accum_enqueued: AtomicU64,
    dropped: AtomicU64,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate", &self.rate())
            .field("has_parent", &self.parent.is_some())
            .field("children", &self.children())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Creates a limiter at `rate` Mbps with `num_cpus` queues, optionally chained under `parent`.
    pub fn new(rate: u64, num_cpus: usize, now: u64, parent: Option<Arc<Self>>) -> Self {
        if let Some(parent) = &parent {
            parent.children.fetch_add(1, Ordering::Relaxed);
        }

        Self {
            rate: AtomicU64::new(rate),
            bucket: Mutex::new(Bucket { total_tokens: 0, last_update: now }),
            last_update: AtomicU64::new(now),
            last_rate_update: AtomicU64::new(now),
            last_enqueue: AtomicU64::new(now),
            feedback_controlled: false,
            queues: PerCpu::with_default(num_cpus),
            parent,
            children: AtomicUsize::new(0),
            accum_xmit: AtomicU64::new(0),
            accum_enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Marks the limiter as driven by a rate controller.
    pub fn feedback_controlled(mut self) -> Self {
        self.feedback_controlled = true;
        self
    }

    /// Resets a preallocated limiter for a new destination, chaining it under `parent`.
    pub(crate) fn restart(&mut self, rate: u64, now: u64, parent: Option<Arc<Self>>) {
        if let Some(old) = self.parent.take() {
            old.children.fetch_sub(1, Ordering::Relaxed);
        }
        if let Some(parent) = &parent {
            parent.children.fetch_add(1, Ordering::Relaxed);
        }
        self.parent = parent;

        *self.rate.get_mut() = rate;
        *self.bucket.get_mut() = Bucket { total_tokens: 0, last_update: now };
        *self.last_update.get_mut() = now;
        *self.last_rate_update.get_mut() = now;
        *self.last_enqueue.get_mut() = now;
    }

    #[inline]
    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    /// Sets a new rate, as decided by a rate controller.
    pub fn set_rate(&self, rate: u64, now: u64) {
        self.rate.store(rate, Ordering::Relaxed);
        self.last_rate_update.store(now, Ordering::Relaxed);
    }

    /// Records that the control loop is alive even though the rate did not change.
    pub fn note_feedback(&self, now: u64) {
        self.last_rate_update.store(now, Ordering::Relaxed);
    }

    pub fn parent(&self) -> Option<&Arc<Self>> {
        self.parent.as_ref()
    }

    /// Number of limiters chained under this one.
    pub fn children(&self) -> usize {
        self.children.load(Ordering::Relaxed)
    }

    /// Current global token balance.
    pub fn total_tokens(&self) -> u64 {
        self.bucket.lock().total_tokens
    }

    /// Token balance of the queue owned by `cpu`.
    pub fn queue_tokens(&self, cpu: usize) -> u64 {
        self.queues.get(cpu).inner.lock().tokens
    }

    /// Bytes waiting in all queues.
    pub fn queued_bytes(&self) -> u64 {
        self.queues.iter().map(|q| q.inner.lock().bytes_enqueued).sum()
    }

    /// Refills the global pool at `rate * elapsed_us / 8` bytes, clamped to the burst cap.
    ///
    /// Lazy and non-blocking: nothing happens before `rl_update_interval_us` has passed since the
    /// last refill, or when another CPU holds the pool.
    pub fn clock(&self, now: u64, params: &Params) {
        if micros_since(now, self.last_update.load(Ordering::Relaxed)) < params.rl_update_interval_us
        {
            return;
        }

        let Some(mut bucket) = self.bucket.try_lock() else {
            return;
        };

        let dt = micros_since(now, bucket.last_update);
        if dt < params.rl_update_interval_us {
            return;
        }

        let mut rate = self.rate();
        if self.feedback_controlled {
            let idle = micros_since(now, self.last_enqueue.load(Ordering::Relaxed));
            if idle > params.idle_timeout_us && rate > params.idle_rate {
                rate = params.idle_rate;
                self.rate.store(rate, Ordering::Relaxed);
            }

            let silent = micros_since(now, self.last_rate_update.load(Ordering::Relaxed));
            if silent > params.rfair_feedback_timeout_us {
                rate = (rate / 2).max(2);
                self.set_rate(rate, now);
            }
        }

        let refill = rate.saturating_mul(dt) / 8;
        bucket.total_tokens = bucket.total_tokens.saturating_add(refill).min(params.burst_cap(rate));
        bucket.last_update = now;
        self.last_update.store(now, Ordering::Relaxed);
    }

    /// Takes tokens from the global pool for a queue whose head packet is `first_pkt_size` bytes.
    ///
    /// Grants `max(singleq_burst, first_pkt_size)`, limited by what the pool holds, but only if
    /// the pool can cover the head packet. `None` means the queue must wait.
    fn borrow(&self, first_pkt_size: u64, params: &Params) -> Option<u64> {
        let mut bucket = self.bucket.try_lock()?;
        if bucket.total_tokens < first_pkt_size {
            return None;
        }

        let grant = params
            .singleq_burst(self.rate())
            .max(first_pkt_size)
            .min(bucket.total_tokens);
        bucket.total_tokens -= grant;
        Some(grant)
    }

    /// Tops up the queue of `cpu` from the global pool if it cannot pay for its head packet.
    /// Returns `true` if the queue has to wait for a refill.
    pub fn borrow_tokens(&self, cpu: usize, params: &Params) -> bool {
        let Some(mut q) = self.queues.get(cpu).inner.try_lock() else {
            return true;
        };

        if q.tokens >= q.first_pkt_size {
            return false;
        }

        match self.borrow(q.first_pkt_size, params) {
            Some(granted) => {
                q.tokens += granted;
                false
            }
            None => true,
        }
    }

    /// Enqueues `packet` on the queue of `cpu` and attempts to drain it.
    ///
    /// Offloaded frames are segmented first if the limiter is slow. Packets that would push the
    /// backlog past `max_queue_len_bytes` are trimmed to whole segments if at least one fits,
    /// otherwise dropped.
    pub fn enqueue(self: &Arc<Self>, packet: Packet, cpu: usize, now: u64, dp: &Datapath) -> Verdict {
        let params = dp.params();
        self.clock(now, &params);
        self.last_enqueue.store(now, Ordering::Relaxed);

        let admitted = if packet.gso_size().is_some() && self.rate() < params.segment_below_rate {
            let segments = match segment::segment(packet) {
                Ok(segments) => segments,
                Err(e) => {
                    if SEGMENT_FAILED.allow() {
                        warn!(error = %e, "Segmentation failed, dropping packet");
                    }
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return Verdict::Drop;
                }
            };

            let mut q = self.queues.get(cpu).inner.lock();
            let mut admitted = 0;
            for segment in segments {
                admitted += usize::from(self.admit(&mut q, segment, &params));
            }
            admitted
        } else {
            let mut q = self.queues.get(cpu).inner.lock();
            usize::from(self.admit(&mut q, packet, &params))
        };

        self.dequeue(cpu, now, dp);

        if admitted > 0 {
            Verdict::Success
        } else {
            Verdict::Drop
        }
    }

    fn admit(&self, q: &mut QueueInner, mut packet: Packet, params: &Params) -> bool {
        let cap = params.max_queue_len_bytes;
        if q.bytes_enqueued + packet.len() as u64 > cap {
            let room = cap.saturating_sub(q.bytes_enqueued);
            let fits = segment::min_segment_len(&packet).is_some_and(|min| min as u64 <= room);
            if !fits || segment::trim(&mut packet, room as usize).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        let len = packet.len() as u64;
        if q.list.is_empty() {
            q.first_pkt_size = len;
        }
        q.bytes_enqueued += len;
        q.list.push_back(packet);
        self.accum_enqueued.fetch_add(len, Ordering::Relaxed);
        true
    }

    /// Sends as many packets from the queue of `cpu` as its tokens pay for, borrowing from the
    /// pool first if the head packet is not covered. Packets go to the parent's queue of the same
    /// CPU if there is a parent, otherwise to the link.
    ///
    /// Gives up immediately if another context is draining the queue. A queue left non-empty is
    /// parked on the active list and the retry timer is armed.
    ///
    /// Returns the number of bytes sent.
    pub fn dequeue(self: &Arc<Self>, cpu: usize, now: u64, dp: &Datapath) -> u64 {
        let params = dp.params();
        let Some(mut q) = self.queues.get(cpu).inner.try_lock() else {
            return 0;
        };

        if q.list.is_empty() {
            return 0;
        }

        if q.tokens < q.first_pkt_size {
            if let Some(granted) = self.borrow(q.first_pkt_size, &params) {
                q.tokens += granted;
            }
        }

        let mut batch = Vec::new();
        let mut sum = 0;
        while let Some(len) = q.list.front().map(|p| p.len() as u64) {
            if sum + len > q.tokens {
                break;
            }

            let Some(mut packet) = q.list.pop_front() else {
                break;
            };
            if q.feedback_backlog > 0 {
                q.feedback_backlog -= 1;
                packet.set_reflect();
            }

            sum += len;
            batch.push(packet);
        }

        q.tokens -= sum;
        q.bytes_enqueued -= sum;
        q.first_pkt_size = q.list.front().map_or(0, |p| p.len() as u64);
        let waiting = !q.list.is_empty();

        // The batch leaves before the queue is released; concurrent drains keep it FIFO.
        if !batch.is_empty() {
            self.accum_xmit.fetch_add(sum, Ordering::Relaxed);
            match &self.parent {
                Some(parent) => parent.enqueue_batch(batch, cpu, now, &params),
                None => {
                    for packet in batch {
                        dp.transmit(packet);
                    }
                }
            }
        }
        drop(q);

        if waiting {
            dp.activate(self, cpu, now, &params);
        }

        if sum > 0 {
            if let Some(parent) = &self.parent {
                parent.dequeue(cpu, now, dp);
            }
        }

        sum
    }

    /// Appends packets drained from a child, which still holds its own queue. Queues are only
    /// ever locked child first.
    fn enqueue_batch(&self, batch: Vec<Packet>, cpu: usize, now: u64, params: &Params) {
        self.clock(now, params);
        self.last_enqueue.store(now, Ordering::Relaxed);

        let mut q = self.queues.get(cpu).inner.lock();
        for packet in batch {
            self.admit(&mut q, packet, params);
        }
    }

    /// Makes the next outgoing packet of the queue of `cpu` carry the reflect flag.
    pub fn add_feedback_backlog(&self, cpu: usize) {
        if let Some(mut q) = self.queues.get(cpu).inner.try_lock() {
            q.feedback_backlog += 1;
        }
    }

    /// Drops every queued packet. Returns how many were dropped.
    pub(crate) fn flush(&self) -> usize {
        self.queues
            .iter()
            .map(|queue| {
                let mut q = queue.inner.lock();
                let n = q.list.len();
                q.list.clear();
                q.bytes_enqueued = 0;
                q.first_pkt_size = 0;
                self.dropped.fetch_add(n as u64, Ordering::Relaxed);
                n
            })
            .sum()
    }

    /// Returns `true` if the queue of `cpu` was not already on the active list.
    pub(crate) fn mark_active(&self, cpu: usize) -> bool {
        !self.queues.get(cpu).active.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn mark_inactive(&self, cpu: usize) {
        self.queues.get(cpu).active.store(false, Ordering::Release);
    }

    pub fn stats(&self) -> RlStats {
        let mut stats = RlStats {
            rate: self.rate(),
            total_tokens: self.total_tokens(),
            children: self.children(),
            accum_xmit: self.accum_xmit.load(Ordering::Relaxed),
            accum_enqueued: self.accum_enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            ..Default::default()
        };

        for queue in self.queues.iter() {
            let q = queue.inner.lock();
            stats.queued_bytes += q.bytes_enqueued;
            stats.queued_packets += q.list.len();
            stats.queue_tokens += q.tokens;
            stats.active_queues += usize::from(queue.active.load(Ordering::Relaxed));
        }

        stats
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(parent) = &self.parent {
            parent.children.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
