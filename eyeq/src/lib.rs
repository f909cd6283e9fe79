#![doc(issue_tracker_base_url = "https://github.com/chainbound/eyeq-rs/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use eyeq_common::{constants, Clock, PerCpu, RateLimitedLog};
pub use eyeq_engine::*;
pub use eyeq_wire::{ecn, feedback, packet::FrameBuilder, segment, Feedback, Packet};
