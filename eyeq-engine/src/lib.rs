//! Traffic isolation engine.
//!
//! Senders shape traffic per destination with hierarchical token buckets whose rates are set by
//! an AIMD controller. Receivers model the bottleneck of each class with a virtual queue and send
//! ECN-style feedback when it congests, closing the loop.
#![doc(issue_tracker_base_url = "https://github.com/chainbound/eyeq-rs/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod admin;
pub use admin::Command;

mod class;
pub use class::{ClassKey, DeviceKey, EtherSrcKey, IpKey, MarkKey};

mod datapath;
pub use datapath::{Busy, Datapath, DatapathStats, Transmit, Verdict};

mod dest;
pub use dest::{PerDestState, TxClass};

mod engine;
pub use engine::Engine;

mod error;
pub use error::{Error, Result};

mod index;

mod params;
pub use params::Params;

mod rc;
pub use rc::{RateControllerState, RcState, ALPHA_SHIFT};

mod rl;
pub use rl::RateLimiter;

pub mod stats;

mod vq;
pub use vq::{VirtualQueue, VqSet, VqShared};
