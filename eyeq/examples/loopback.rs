use std::{net::Ipv4Addr, time::Duration};

use eyeq::{Engine, FrameBuilder, IpKey, Params};
use tokio::sync::mpsc;

const SENDER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const RECEIVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

/// Two engines wired back to back: the receiver's virtual queue drains at 200 Mbps and its
/// feedback steers the sender's rate towards it.
#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    let (to_receiver, mut wire) = mpsc::unbounded_channel();
    let (to_sender, mut feedback) = mpsc::unbounded_channel();

    let sender = Engine::<IpKey>::new(Params::default().num_cpus(1).rfair_initial(1_000), to_receiver);
    let receiver = Engine::<IpKey>::new(Params::default().num_cpus(1).vq_drain_rate(200), to_sender);

    sender.install_class(IpKey(SENDER)).unwrap();
    receiver.install_queue(IpKey(RECEIVER)).unwrap();
    sender.start().unwrap();
    receiver.start().unwrap();

    let rx = receiver.clone();
    tokio::spawn(async move {
        while let Some(packet) = wire.recv().await {
            rx.rx(&packet, 0);
        }
    });

    let tx = sender.clone();
    tokio::spawn(async move {
        while let Some(packet) = feedback.recv().await {
            tx.rx(&packet, 0);
        }
    });

    let frame = FrameBuilder::new().src_ip(SENDER).dst_ip(RECEIVER).build(17, &[0; 1466]);
    let offer = sender.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_micros(100));
        loop {
            interval.tick().await;
            for _ in 0..4 {
                offer.tx(frame.clone(), 0);
            }
        }
    });

    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(250)).await;

        let class = sender.class(&IpKey(SENDER)).unwrap();
        if let Some(state) = class.find_state(RECEIVER) {
            let rc = state.rc().stats();
            tracing::info!(rfair = rc.rfair, state = %rc.state, alpha = rc.alpha, "sender");
        }
        if let Some(vq) = receiver.queue(&IpKey(RECEIVER)) {
            tracing::info!(rate = vq.rate(), feedback_rate = vq.over_limits(), backlog = vq.backlog(), "receiver");
        }
    }

    sender.shutdown();
    receiver.shutdown();
}
