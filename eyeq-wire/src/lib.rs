#![doc(issue_tracker_base_url = "https://github.com/chainbound/eyeq-rs/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

use thiserror::Error;

pub mod ecn;
pub mod feedback;
pub mod packet;
pub mod segment;

pub use feedback::Feedback;
pub use packet::Packet;

/// Length of an Ethernet II header.
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Length of an IPv4 header without options.
pub const IPV4_HEADER_LEN: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),
    #[error("not an IPv4 frame")]
    NotIpv4,
    #[error("not a TCP segment (protocol {0})")]
    NotTcp(u8),
    #[error("TCP data offset {0} is below the minimum header")]
    InvalidDataOffset(u8),
    #[error("packet has no segment size")]
    NotGso,
    #[error("segment size {0} is invalid")]
    InvalidSegmentSize(u16),
    #[error("{0} bytes are not enough for a single segment")]
    TrimTooShort(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
