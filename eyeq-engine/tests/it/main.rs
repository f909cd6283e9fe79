mod admin;
mod controller;
mod engine;
mod limiter;
mod queue;

/// Helper functions.
mod helpers {
    use std::net::Ipv4Addr;

    use eyeq_wire::{packet::FrameBuilder, Packet};
    use tokio::sync::mpsc;

    pub const SENDER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    pub const RECEIVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    /// An IPv4/UDP-sized frame of `len` bytes from `src` to `dst`.
    pub fn frame(src: Ipv4Addr, dst: Ipv4Addr, len: usize, id: u16) -> Packet {
        FrameBuilder::new().src_ip(src).dst_ip(dst).identification(id).build(17, &vec![0; len - 34])
    }

    pub fn drain(rx: &mut mpsc::UnboundedReceiver<Packet>) -> Vec<Packet> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }
}
