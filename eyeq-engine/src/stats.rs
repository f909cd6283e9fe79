//! Point-in-time snapshots of engine state.

use std::{fmt, net::Ipv4Addr};

use crate::rc::RcState;

/// Snapshot of a [`RateLimiter`](crate::RateLimiter).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RlStats {
    /// Rate in Mbps.
    pub rate: u64,
    pub total_tokens: u64,
    pub children: usize,
    /// Bytes sent towards the link or the parent.
    pub accum_xmit: u64,
    /// Bytes admitted into the queues.
    pub accum_enqueued: u64,
    /// Packets dropped at admission or by a flush.
    pub dropped: u64,
    pub queued_bytes: u64,
    pub queued_packets: usize,
    /// Sum of the per-CPU token balances.
    pub queue_tokens: u64,
    /// Queues waiting on an active list.
    pub active_queues: usize,
}

/// Snapshot of a [`RateControllerState`](crate::RateControllerState).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcStats {
    pub rfair: u64,
    pub rfair_target: u64,
    pub alpha: u64,
    pub state: RcState,
    /// Fast recovery steps taken.
    pub count: u32,
    /// Time of the last packet received from the destination, in clock microseconds.
    pub last_feedback: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestStats {
    pub peer: Ipv4Addr,
    pub rl: RlStats,
    pub rc: RcStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassStats {
    pub key: String,
    /// Key of the associated virtual queue.
    pub vq: Option<String>,
    /// The aggregate limiter of the class.
    pub agg: RlStats,
    pub dests: Vec<DestStats>,
    /// Preallocated destination states left.
    pub pool_free: usize,
}

impl ClassStats {
    /// Bytes sent by the class: its aggregate limiter plus every non-hierarchical destination.
    pub fn tx_bytes(&self) -> u64 {
        let dests: u64 = self.dests.iter().map(|d| d.rl.accum_xmit).sum();
        if self.agg.children > 0 {
            self.agg.accum_xmit
        } else {
            self.agg.accum_xmit + dests
        }
    }
}

/// Snapshot of a [`VirtualQueue`](crate::VirtualQueue).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VqStats {
    pub key: String,
    pub enabled: bool,
    pub active: bool,
    pub is_static: bool,
    pub weight: u64,
    pub rate: u64,
    pub feedback_rate: u64,
    pub rx_rate: u64,
    pub backlog: u64,
    pub tokens: u64,
    pub alpha: u64,
    pub refcount: usize,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub network_marked: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub classes: Vec<ClassStats>,
    pub queues: Vec<VqStats>,
    /// Sum of the weights of the active queues.
    pub active_weight: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_busy: u64,
    pub tx_oversized: u64,
    pub deferred_runs: u64,
}

impl EngineStats {
    pub fn class(&self, key: &str) -> Option<&ClassStats> {
        self.classes.iter().find(|c| c.key == key)
    }

    pub fn queue(&self, key: &str) -> Option<&VqStats> {
        self.queues.iter().find(|q| q.key == key)
    }

    /// Renders per-class byte counters, one `tx,<class>,<bytes>` line per class and one
    /// `rx,<class>,<bytes>` line per virtual queue.
    pub fn csv(&self) -> Csv<'_> {
        Csv(self)
    }
}

pub struct Csv<'a>(&'a EngineStats);

impl fmt::Display for Csv<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for class in &self.0.classes {
            writeln!(f, "tx,{},{}", class.key, class.tx_bytes())?;
        }
        for queue in &self.0.queues {
            writeln!(f, "rx,{},{}", queue.key, queue.rx_bytes)?;
        }
        Ok(())
    }
}
