//! Explicit congestion notification bits of the IPv4 type-of-service byte.
//!
//! The two low-order bits carry the ECN codepoint. Bit 3 is borrowed as a "reflect" flag: a sender
//! whose rate limiter has pending feedback sets it on outgoing data so the peer learns about
//! congestion without a dedicated feedback packet.

/// Mask of the ECN codepoint.
pub const ECN_MASK: u8 = 0b11;

/// ECN-capable transport, set on every egress IPv4 packet.
pub const ECN_ECT0: u8 = 0b10;

/// Congestion experienced.
pub const ECN_CE: u8 = 0b11;

/// Piggy-backed feedback flag.
pub const REFLECT_MASK: u8 = 1 << 3;

/// Returns `true` if the type-of-service byte carries the congestion-experienced codepoint.
#[inline]
pub const fn is_ce(tos: u8) -> bool {
    tos & ECN_MASK == ECN_CE
}

/// Returns `true` if the reflect flag is set.
#[inline]
pub const fn is_reflected(tos: u8) -> bool {
    tos & REFLECT_MASK != 0
}
