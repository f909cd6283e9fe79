//! AIMD rate controller driven by ECN feedback.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use eyeq_common::{micros_since, PerCpu};
use parking_lot::Mutex;

use crate::{stats::RcStats, Params};

/// Fixed-point scale of `alpha`: 1.0 is `1 << ALPHA_SHIFT`.
pub const ALPHA_SHIFT: u32 = 10;
const ALPHA_ONE: u64 = 1 << ALPHA_SHIFT;

/// Recovery steps taken by bisection before switching to additive increase.
const MAX_RECOVERY_STEPS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcState {
    /// Bisecting back towards the rate before the last decrease.
    FastRecovery,
    AdditiveIncrease,
}

impl fmt::Display for RcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FastRecovery => f.write_str("fast_recovery"),
            Self::AdditiveIncrease => f.write_str("additive_increase"),
        }
    }
}

#[derive(Debug)]
struct RcInner {
    rfair_target: u64,
    /// Marked fraction, scaled by [`ALPHA_ONE`].
    alpha: u64,
    state: RcState,
    count: u32,
}

#[derive(Debug, Default)]
struct RcCounters {
    num_rx: AtomicU64,
    num_marked: AtomicU64,
}

/// Congestion state of one destination.
///
/// `rfair`, the fair-rate estimate in Mbps, can be read at any time without locking. Changes are
/// serialized by a lock that is only ever try-locked: a packet that loses the race simply does not
/// move the rate, and the next one will.
#[derive(Debug)]
pub struct RateControllerState {
    rfair: AtomicU64,
    inner: Mutex<RcInner>,
    last_change: AtomicU64,
    last_decrease: AtomicU64,
    last_feedback: AtomicU64,
    counters: PerCpu<RcCounters>,
}

impl RateControllerState {
    pub fn new(now: u64, num_cpus: usize, params: &Params) -> Self {
        Self {
            rfair: AtomicU64::new(params.rfair_initial),
            inner: Mutex::new(RcInner {
                rfair_target: params.rfair_initial,
                alpha: 0,
                state: RcState::AdditiveIncrease,
                count: 0,
            }),
            last_change: AtomicU64::new(now),
            last_decrease: AtomicU64::new(now),
            last_feedback: AtomicU64::new(now),
            counters: PerCpu::with_default(num_cpus),
        }
    }

    /// Resets a preallocated controller for a new destination.
    pub(crate) fn restart(&mut self, now: u64, params: &Params) {
        *self.rfair.get_mut() = params.rfair_initial;
        *self.inner.get_mut() = RcInner {
            rfair_target: params.rfair_initial,
            alpha: 0,
            state: RcState::AdditiveIncrease,
            count: 0,
        };
        *self.last_change.get_mut() = now;
        *self.last_decrease.get_mut() = now;
        *self.last_feedback.get_mut() = now;
    }

    /// Current fair-rate estimate in Mbps.
    #[inline]
    pub fn rfair(&self) -> u64 {
        self.rfair.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> RcState {
        self.inner.lock().state
    }

    /// Marked fraction EWMA, scaled by `1 << ALPHA_SHIFT`.
    pub fn alpha(&self) -> u64 {
        self.inner.lock().alpha
    }

    pub fn set_alpha(&self, alpha: u64) {
        self.inner.lock().alpha = alpha.min(ALPHA_ONE);
    }

    /// Time of the last feedback observed, in clock microseconds.
    pub fn last_feedback(&self) -> u64 {
        self.last_feedback.load(Ordering::Relaxed)
    }

    /// Reacts to one received packet from the destination. Returns `true` if `rfair` changed, in
    /// which case the caller propagates it to the destination's rate limiter.
    ///
    /// A mark decreases `rfair` multiplicatively by `alpha`, at most once per decrease interval,
    /// and enters fast recovery. Without marks, `rfair` moves halfway back to its pre-decrease
    /// value once per increase interval for up to five steps, then grows additively.
    pub fn on_receive(&self, marked: bool, cpu: usize, now: u64, params: &Params) -> bool {
        let counters = self.counters.get(cpu);
        counters.num_rx.fetch_add(1, Ordering::Relaxed);
        self.last_feedback.store(now, Ordering::Relaxed);

        if marked {
            counters.num_marked.fetch_add(1, Ordering::Relaxed);
            self.try_decrease(now, params)
        } else {
            self.try_increase(now, params)
        }
    }

    fn try_decrease(&self, now: u64, params: &Params) -> bool {
        let interval = params.rfair_decrease_interval_us;
        if micros_since(now, self.last_decrease.load(Ordering::Relaxed)) < interval {
            return false;
        }

        let Some(mut inner) = self.inner.try_lock() else {
            return false;
        };
        if micros_since(now, self.last_decrease.load(Ordering::Relaxed)) < interval {
            return false;
        }

        // The mark that triggered the decrease counts towards the fraction it is scaled by.
        self.fold_alpha(&mut inner);

        let mut rfair = self.idle_snap(&mut inner, now, params);
        let target = rfair;
        rfair = (rfair * (ALPHA_ONE - inner.alpha) >> ALPHA_SHIFT).max(params.min_rfair);

        inner.count = 0;
        inner.state = RcState::FastRecovery;
        inner.rfair_target = target;

        self.rfair.store(rfair, Ordering::Relaxed);
        self.last_decrease.store(now, Ordering::Relaxed);
        self.last_change.store(now, Ordering::Relaxed);
        true
    }

    fn try_increase(&self, now: u64, params: &Params) -> bool {
        let interval = params.rfair_increase_interval_us;
        if micros_since(now, self.last_change.load(Ordering::Relaxed)) < interval {
            return false;
        }

        let Some(mut inner) = self.inner.try_lock() else {
            return false;
        };
        if micros_since(now, self.last_change.load(Ordering::Relaxed)) < interval {
            return false;
        }

        let mut rfair = self.idle_snap(&mut inner, now, params);
        if inner.state == RcState::FastRecovery && inner.count < MAX_RECOVERY_STEPS {
            rfair = (rfair + inner.rfair_target) / 2;
            inner.count += 1;
        } else {
            inner.state = RcState::AdditiveIncrease;
            inner.count = 0;
            rfair = (rfair + params.rfair_increment).min(params.max_tx_rate);
            inner.rfair_target = rfair;
        }
        self.fold_alpha(&mut inner);

        self.rfair.store(rfair, Ordering::Relaxed);
        self.last_change.store(now, Ordering::Relaxed);
        true
    }

    /// After a long quiet period the previous estimate is stale; restart from the idle rate.
    fn idle_snap(&self, inner: &mut RcInner, now: u64, params: &Params) -> u64 {
        let rfair = self.rfair();
        let idle = micros_since(now, self.last_change.load(Ordering::Relaxed)) > params.idle_timeout_us;
        if idle && rfair > params.idle_rate {
            inner.rfair_target = params.idle_rate;
            return params.idle_rate;
        }
        rfair
    }

    /// Folds the per-CPU counters into `alpha` (EWMA with gain 1/32).
    fn fold_alpha(&self, inner: &mut RcInner) {
        let mut num_rx = 0;
        let mut num_marked = 0;
        for counters in self.counters.iter() {
            num_rx += counters.num_rx.swap(0, Ordering::Relaxed);
            num_marked += counters.num_marked.swap(0, Ordering::Relaxed);
        }

        let frac = if num_rx > 0 { (num_marked << ALPHA_SHIFT) / num_rx } else { 0 };
        inner.alpha = (inner.alpha * 31 + frac.min(ALPHA_ONE)) / 32;
    }

    pub fn stats(&self) -> RcStats {
        let inner = self.inner.lock();
        RcStats {
            rfair: self.rfair(),
            rfair_target: inner.rfair_target,
            alpha: inner.alpha,
            state: inner.state,
            count: inner.count,
            last_feedback: self.last_feedback(),
        }
    }
}
