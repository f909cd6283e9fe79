use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use arc_swap::{ArcSwap, Guard};
use eyeq_common::{Clock, PerCpu};
use eyeq_wire::{Packet, ETHERNET_HEADER_LEN};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::{rl::RateLimiter, Params};

/// Outcome of handing a packet to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The engine took ownership: the packet is queued or already sent.
    Success,
    /// The packet was discarded.
    Drop,
    /// The packet is forwarded unmodified on the normal path.
    Pass,
    /// The packet carried a broken IPv4 header. It is forwarded like [`Verdict::Pass`].
    Error,
}

/// The link refused a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Busy;

/// The device transmit primitive. A [`Busy`] packet is dropped; the engine does not retry.
pub trait Transmit: Send + Sync + 'static {
    fn transmit(&self, packet: Packet) -> Result<(), Busy>;
}

impl<F> Transmit for F
where
    F: Fn(Packet) -> Result<(), Busy> + Send + Sync + 'static,
{
    fn transmit(&self, packet: Packet) -> Result<(), Busy> {
        self(packet)
    }
}

impl Transmit for mpsc::UnboundedSender<Packet> {
    fn transmit(&self, packet: Packet) -> Result<(), Busy> {
        self.send(packet).map_err(|_| Busy)
    }
}

/// A bounded channel reports backpressure when full.
impl Transmit for mpsc::Sender<Packet> {
    fn transmit(&self, packet: Packet) -> Result<(), Busy> {
        self.try_send(packet).map_err(|_| Busy)
    }
}

/// Counters of the datapath itself.
#[derive(Debug, Default)]
pub struct DatapathStats {
    /// Packets handed to the link.
    tx_packets: AtomicU64,
    /// Bytes handed to the link.
    tx_bytes: AtomicU64,
    /// Packets the link refused.
    tx_busy: AtomicU64,
    /// Packets longer than the MTU, dropped before the link.
    tx_oversized: AtomicU64,
    /// Runs of the deferred drain.
    deferred_runs: AtomicU64,
}

impl DatapathStats {
    #[inline]
    pub fn tx_packets(&self) -> u64 {
        self.tx_packets.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn tx_busy(&self) -> u64 {
        self.tx_busy.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn tx_oversized(&self) -> u64 {
        self.tx_oversized.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn deferred_runs(&self) -> u64 {
        self.deferred_runs.load(Ordering::Relaxed)
    }
}

/// Per-CPU deferred work: the limiters waiting for tokens on this CPU, and the two wakeups that
/// connect the timer to the drain.
#[derive(Debug, Default)]
pub(crate) struct ControlBlock {
    active: Mutex<VecDeque<Arc<RateLimiter>>>,
    /// Armed timer deadline in clock microseconds. 0 when unarmed.
    deadline: AtomicU64,
    /// Wakes the timer task when a deadline is armed.
    timer: Notify,
    /// Wakes the drain task.
    tasklet: Notify,
}

/// State shared by everything on the packet path: the clock, the current tunables, the link, and
/// the per-CPU control blocks.
pub struct Datapath {
    clock: Clock,
    params: ArcSwap<Params>,
    link: Box<dyn Transmit>,
    blocks: PerCpu<ControlBlock>,
    shutdown: AtomicBool,
    stats: DatapathStats,
}

impl std::fmt::Debug for Datapath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datapath")
            .field("cpus", &self.blocks.len())
            .field("shutdown", &self.is_shutdown())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Datapath {
    /// Creates a datapath with one control block per configured CPU.
    pub fn new(params: Params, link: impl Transmit) -> Self {
        let blocks = PerCpu::with_default(params.num_cpus);

        Self {
            clock: Clock::new(),
            params: ArcSwap::from_pointee(params),
            link: Box::new(link),
            blocks,
            shutdown: AtomicBool::new(false),
            stats: DatapathStats::default(),
        }
    }

    /// Current time on the engine clock, in microseconds.
    #[inline]
    pub fn now(&self) -> u64 {
        self.clock.now_micros()
    }

    /// A snapshot of the current tunables.
    #[inline]
    pub fn params(&self) -> Guard<Arc<Params>> {
        self.params.load()
    }

    pub(crate) fn store_params(&self, params: Params) {
        self.params.store(Arc::new(params));
    }

    /// Number of per-CPU shards.
    #[inline]
    pub fn num_cpus(&self) -> usize {
        self.blocks.len()
    }

    pub const fn stats(&self) -> &DatapathStats {
        &self.stats
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Raises the shutdown flag and wakes all deferred tasks so they can observe it.
    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for block in self.blocks.iter() {
            block.deadline.store(0, Ordering::Relaxed);
            block.timer.notify_one();
            block.tasklet.notify_one();
        }
    }

    /// Empties every active list, dropping the references to waiting limiters.
    pub(crate) fn clear_active(&self) -> usize {
        self.blocks.iter().map(|block| block.active.lock().drain(..).count()).sum()
    }

    /// Hands a packet to the link. Packets that are not offloaded and do not fit the MTU are
    /// dropped.
    pub fn transmit(&self, packet: Packet) -> bool {
        let len = packet.len() as u64;
        let ip_len = len.saturating_sub(ETHERNET_HEADER_LEN as u64);
        if packet.gso_size().is_none() && ip_len > self.params().mtu {
            self.stats.tx_oversized.fetch_add(1, Ordering::Relaxed);
            trace!(len, "oversized packet dropped");
            return false;
        }

        match self.link.transmit(packet) {
            Ok(()) => {
                self.stats.tx_packets.fetch_add(1, Ordering::Relaxed);
                self.stats.tx_bytes.fetch_add(len, Ordering::Relaxed);
                true
            }
            Err(Busy) => {
                self.stats.tx_busy.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Puts `rl`'s queue for `cpu` on that CPU's active list (once) and arms the retry timer.
    pub(crate) fn activate(&self, rl: &Arc<RateLimiter>, cpu: usize, now: u64, params: &Params) {
        if rl.mark_active(cpu) {
            self.blocks.get(cpu).active.lock().push_back(Arc::clone(rl));
        }

        self.arm(cpu, now + params.tokenbucket_timeout_us.max(1));
    }

    /// Arms the timer of `cpu` for `at`, unless it is already armed earlier or the engine is
    /// shutting down.
    pub fn arm(&self, cpu: usize, at: u64) {
        if self.is_shutdown() {
            return;
        }

        let block = self.blocks.get(cpu);
        let mut current = block.deadline.load(Ordering::Acquire);
        loop {
            if current != 0 && current <= at {
                return;
            }

            match block.deadline.compare_exchange_weak(current, at, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        block.timer.notify_one();
    }

    /// Returns the armed deadline of `cpu`, if any.
    pub fn deadline(&self, cpu: usize) -> Option<u64> {
        match self.blocks.get(cpu).deadline.load(Ordering::Acquire) {
            0 => None,
            at => Some(at),
        }
    }

    /// Number of limiter queues waiting for tokens on `cpu`.
    pub fn pending(&self, cpu: usize) -> usize {
        self.blocks.get(cpu).active.lock().len()
    }

    /// The deferred drain of `cpu`: re-clocks and dequeues waiting limiters, at most
    /// `deferred_budget_packets` entries or twice the minimum burst in bytes per run. Re-arms the
    /// timer if work remains.
    ///
    /// Returns the number of bytes sent.
    pub fn run_deferred(&self, cpu: usize, now: u64) -> u64 {
        let params = self.params();
        let block = self.blocks.get(cpu);
        self.stats.deferred_runs.fetch_add(1, Ordering::Relaxed);

        let budget = block.active.lock().len().min(params.deferred_budget_packets.max(1));
        let byte_budget = 2 * params.min_burst_bytes;

        let mut sent = 0;
        for _ in 0..budget {
            if self.is_shutdown() || sent >= byte_budget {
                break;
            }

            let Some(rl) = block.active.lock().pop_front() else {
                break;
            };

            rl.mark_inactive(cpu);
            rl.clock(now, &params);
            sent += rl.dequeue(cpu, now, self);
        }

        let remaining = block.active.lock().len();
        trace!(cpu, sent, remaining, "deferred drain");
        if remaining > 0 {
            self.arm(cpu, now + params.tokenbucket_timeout_us.max(1));
        }

        sent
    }

    /// Timer half of the deferred work: sleeps until the armed deadline and signals the drain.
    /// Never drains anything itself.
    pub(crate) async fn run_timer(self: Arc<Self>, cpu: usize) {
        let block = self.blocks.get(cpu);
        loop {
            if self.is_shutdown() {
                break;
            }

            let at = block.deadline.load(Ordering::Acquire);
            if at == 0 {
                block.timer.notified().await;
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(self.clock.instant_at(at)) => {
                    if block
                        .deadline
                        .compare_exchange(at, 0, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        block.tasklet.notify_one();
                    }
                }
                // Re-armed earlier, or shutting down.
                _ = block.timer.notified() => {}
            }
        }

        debug!(cpu, "timer task stopped");
    }

    /// Drain half of the deferred work.
    pub(crate) async fn run_drain(self: Arc<Self>, cpu: usize) {
        let block = self.blocks.get(cpu);
        loop {
            block.tasklet.notified().await;
            if self.is_shutdown() {
                break;
            }

            self.run_deferred(cpu, self.now());
        }

        debug!(cpu, "drain task stopped");
    }
}
