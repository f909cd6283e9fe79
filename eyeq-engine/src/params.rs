use std::str::FromStr;

use eyeq_common::constants::KiB;
use eyeq_wire::feedback::DEFAULT_FEEDBACK_IPPROTO;

use crate::{Error, Result};

/// A tunable that can be read and written through the name-keyed parameter table.
trait ParamValue: Sized {
    fn parse(value: &str) -> Option<Self>;
    fn to_raw(&self) -> u64;
}

macro_rules! int_param_value {
    ($($ty:ty),*) => {
        $(impl ParamValue for $ty {
            fn parse(value: &str) -> Option<Self> {
                <$ty>::from_str(value.trim()).ok()
            }

            fn to_raw(&self) -> u64 {
                *self as u64
            }
        })*
    };
}

int_param_value!(u8, u64, usize);

impl ParamValue for bool {
    fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        }
    }

    fn to_raw(&self) -> u64 {
        u64::from(*self)
    }
}

macro_rules! params {
    ($( $(#[doc = $doc:literal])* $name:ident : $ty:ty = $default:expr, )*) => {
        /// Engine tunables. Rates are in Mbps (bits per microsecond), intervals in microseconds
        /// and sizes in bytes.
        ///
        /// Every field doubles as a builder-style setter of the same name, and can be read or
        /// written by name through [`Params::get`] and [`Params::set`].
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct Params {
            $( $(#[doc = $doc])* pub $name: $ty, )*
        }

        impl Default for Params {
            fn default() -> Self {
                Self { $( $name: $default, )* }
            }
        }

        impl Params {
            /// Names of all tunables, in declaration order.
            pub const NAMES: &'static [&'static str] = &[$( stringify!($name), )*];

            $(
                $(#[doc = $doc])*
                pub fn $name(mut self, value: $ty) -> Self {
                    self.$name = value;
                    self
                }
            )*

            /// Returns the value of the tunable `name`. Booleans read as 0 or 1.
            pub fn get(&self, name: &str) -> Option<u64> {
                match name {
                    $( stringify!($name) => Some(ParamValue::to_raw(&self.$name)), )*
                    _ => None,
                }
            }

            /// Parses `value` into the tunable `name`. The parameters are validated as a whole
            /// afterwards; on error `self` may be left partially updated, so callers that need
            /// atomicity should update a clone.
            pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
                let invalid = || Error::InvalidParam { name: name.to_owned(), value: value.to_owned() };
                match name {
                    $( stringify!($name) => self.$name = ParamValue::parse(value).ok_or_else(invalid)?, )*
                    _ => return Err(Error::UnknownParam(name.to_owned())),
                }

                self.validate()
            }
        }
    };
}

params! {
    /// Master switch. When off, every packet passes through untouched.
    enabled: bool = true,
    /// Upper bound of any fair rate.
    max_tx_rate: u64 = 10_000,
    /// Rate at which virtual queues drain, shared among active queues by weight.
    vq_drain_rate: u64 = 9_000,
    /// Burst a token bucket may accumulate, expressed as time at its rate.
    max_burst_time_us: u64 = 1_000,
    /// Floor of the burst cap so that full-sized frames pass at low rates.
    min_burst_bytes: u64 = 16 * KiB,
    /// Minimum time between two refills of a rate limiter's global pool.
    rl_update_interval_us: u64 = 200,
    /// A per-CPU queue borrows at most `burst cap / burst_factor` at once.
    burst_factor: u64 = 8,
    /// Retry delay for a queue that could not borrow tokens.
    tokenbucket_timeout_us: u64 = 1_000,
    /// Backlog cap of a per-CPU rate limiter queue.
    max_queue_len_bytes: u64 = 512 * KiB,
    /// Backlog above which a virtual queue is considered congested.
    vq_mark_thresh_bytes: u64 = 1_000 * KiB,
    /// Backlog cap of a virtual queue.
    vq_max_bytes: u64 = 2_048 * KiB,
    /// Minimum time between two drains of a virtual queue.
    vq_update_interval_us: u64 = 100,
    /// How often idle virtual queues are looked for.
    vq_idle_check_interval_us: u64 = 10_000,
    /// Time a virtual queue must stay empty before it stops counting towards the active weight.
    vq_idle_timeout_us: u64 = 10_000,
    /// Fair rate of a new destination.
    rfair_initial: u64 = 100,
    min_rfair: u64 = 1,
    /// Additive increase step.
    rfair_increment: u64 = 10,
    rfair_decrease_interval_us: u64 = 5_000,
    rfair_increase_interval_us: u64 = 5_000,
    /// A feedback-controlled limiter that hears nothing for this long halves its rate.
    rfair_feedback_timeout_us: u64 = 1_000_000,
    /// Idle time after which rates are capped at `idle_rate`.
    idle_timeout_us: u64 = 100_000,
    idle_rate: u64 = 2_500,
    /// Minimum time between two feedback packets of one virtual queue.
    feedback_interval_us: u64 = 500,
    /// Received bytes that also trigger feedback. 0 disables the byte policy.
    feedback_interval_bytes: u64 = 0,
    /// IP protocol number of feedback packets.
    feedback_ipproto: u8 = DEFAULT_FEEDBACK_IPPROTO,
    /// Generate feedback packets from congested virtual queues.
    auto_generate_feedback: bool = true,
    /// Debugging aid: answer every received packet with feedback.
    always_feedback: bool = false,
    /// Chain per-destination limiters under their class aggregate.
    hierarchical: bool = false,
    /// Offloaded frames are segmented by limiters slower than this.
    segment_below_rate: u64 = 1_000,
    /// Preallocated destinations per class.
    prealloc_per_class: usize = 64,
    /// Free-list size that triggers a background refill.
    prealloc_low_water: usize = 10,
    /// Entries handled per run of the deferred drain.
    deferred_budget_packets: usize = 500,
    /// Largest IP packet the link accepts. Longer frames that are not offloaded are dropped.
    mtu: u64 = 1_500,
    /// Number of per-CPU shards. Fixed at engine creation.
    num_cpus: usize = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
}

impl Params {
    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let check = |ok: bool, name: &str, value: u64| {
            if ok {
                Ok(())
            } else {
                Err(Error::InvalidParam { name: name.to_owned(), value: value.to_string() })
            }
        };

        check(self.max_tx_rate > 0, "max_tx_rate", self.max_tx_rate)?;
        check(self.vq_drain_rate > 0, "vq_drain_rate", self.vq_drain_rate)?;
        check(self.burst_factor > 0, "burst_factor", self.burst_factor)?;
        check(self.min_rfair > 0, "min_rfair", self.min_rfair)?;
        check(self.min_rfair <= self.max_tx_rate, "min_rfair", self.min_rfair)?;
        check(self.num_cpus > 0, "num_cpus", self.num_cpus as u64)?;
        check(self.mtu > 0, "mtu", self.mtu)?;

        Ok(())
    }

    /// Iterates over `(name, value)` pairs of all tunables.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        Self::NAMES.iter().filter_map(move |name| self.get(name).map(|value| (*name, value)))
    }

    /// Burst cap of a token bucket running at `rate`.
    #[inline]
    pub fn burst_cap(&self, rate: u64) -> u64 {
        (rate.saturating_mul(self.max_burst_time_us) / 8).max(self.min_burst_bytes)
    }

    /// Largest amount a per-CPU queue borrows from its limiter at `rate`.
    #[inline]
    pub fn singleq_burst(&self, rate: u64) -> u64 {
        self.burst_cap(rate) / self.burst_factor.max(1)
    }
}
