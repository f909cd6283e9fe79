#![doc(issue_tracker_base_url = "https://github.com/chainbound/eyeq-rs/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

use std::time::Duration;

use tokio::time::Instant;

mod ratelimit;
pub use ratelimit::RateLimitedLog;

mod shard;
pub use shard::PerCpu;

/// A monotonic clock that reports microseconds elapsed since its creation.
///
/// Every timestamp on the packet path is a plain `u64` of microseconds taken from one of these,
/// which keeps the hot-path state atomics-friendly. The clock is backed by [`tokio::time::Instant`]
/// so that tests running with a paused runtime observe deterministic time.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    /// Creates a new clock anchored at the current instant.
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }

    /// Returns the microseconds elapsed since the clock was created.
    #[inline]
    pub fn now_micros(&self) -> u64 {
        Instant::now().saturating_duration_since(self.epoch).as_micros() as u64
    }

    /// Converts a clock reading back into an [`Instant`], e.g. to arm a timer.
    #[inline]
    pub fn instant_at(&self, micros: u64) -> Instant {
        self.epoch + Duration::from_micros(micros)
    }
}

/// Returns the number of microseconds between `earlier` and `now`, or 0 if the clock readings
/// are out of order (which can happen when two CPUs race on a shared timestamp).
#[inline]
pub const fn micros_since(now: u64, earlier: u64) -> u64 {
    now.saturating_sub(earlier)
}

#[allow(non_upper_case_globals)]
pub mod constants {
    pub const KiB: u64 = 1024;
    pub const MiB: u64 = 1024 * KiB;
    pub const GiB: u64 = 1024 * MiB;
}
