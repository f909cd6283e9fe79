use std::{net::Ipv4Addr, time::Duration};

use eyeq_engine::{Engine, Error, IpKey, Params, Verdict};
use eyeq_wire::{feedback, Feedback, Packet};
use tokio::sync::mpsc;

use crate::helpers::{drain, frame, RECEIVER, SENDER};

fn engine(params: Params) -> (std::sync::Arc<Engine<IpKey>>, mpsc::UnboundedReceiver<Packet>) {
    let _ = tracing_subscriber::fmt::try_init();
    let (tx, rx) = mpsc::unbounded_channel();
    (Engine::new(params.num_cpus(1), tx), rx)
}

#[tokio::test(start_paused = true)]
async fn fair_share_follows_weights() {
    let (engine, _link) = engine(Params::default());

    let receivers = [(2, 1), (3, 2), (4, 5)];
    for (host, weight) in receivers {
        let key = IpKey(Ipv4Addr::new(10, 0, 0, host));
        engine.install_queue(key).unwrap();
        engine.set_queue_weight(key, weight).unwrap();
    }

    for (host, _) in receivers {
        let packet = frame(SENDER, Ipv4Addr::new(10, 0, 0, host), 1000, 0);
        assert_eq!(engine.rx(&packet, 0), Verdict::Pass);
    }

    let params = engine.params();
    let total = engine.queues().calculate_rates(&params);
    assert!(params.vq_drain_rate - total < receivers.len() as u64);

    let stats = engine.stats();
    assert_eq!(stats.active_weight, 8);
    let rates: Vec<_> = stats.queues.iter().map(|q| q.rate).collect();
    assert_eq!(rates, vec![1_125, 2_250, 5_625]);
}

#[tokio::test(start_paused = true)]
async fn feedback_is_rate_limited() {
    // A queue draining at 1 Mbps with any backlog counting as congestion.
    let params = Params::default().vq_drain_rate(1).vq_mark_thresh_bytes(0);
    let (engine, mut link) = engine(params);

    for id in 0..10 {
        engine.rx(&frame(SENDER, RECEIVER, 1000, id), 0);
    }
    assert!(drain(&mut link).is_empty());

    // Receive events every 10 us for 1 ms.
    tokio::time::advance(Duration::from_micros(200)).await;
    for id in 0..100 {
        engine.rx(&frame(SENDER, RECEIVER, 1000, id), 0);
        tokio::time::advance(Duration::from_micros(10)).await;
    }

    let sent = drain(&mut link);
    assert!(sent.iter().all(|p| feedback::is_feedback(p, feedback::DEFAULT_FEEDBACK_IPPROTO)));
    // At 200 us, 700 us and 1200 us at most.
    assert!((1..=3).contains(&sent.len()), "{} feedback packets", sent.len());

    let fb = Feedback::decode(&sent[0], feedback::DEFAULT_FEEDBACK_IPPROTO).unwrap();
    assert!(fb.is_marked());
    assert_eq!((fb.src_ip, fb.dst_ip), (RECEIVER, SENDER));

    let queue = engine.queue(&IpKey(RECEIVER)).unwrap();
    assert!(queue.is_congested(&engine.params()));
    assert_eq!(engine.stats().queue(&RECEIVER.to_string()).map(|q| q.rx_packets), Some(110));
}

#[tokio::test(start_paused = true)]
async fn always_feedback_answers_every_packet() {
    let (engine, mut link) = engine(Params::default().always_feedback(true));

    for id in 0..5 {
        engine.rx(&frame(SENDER, RECEIVER, 1000, id), 0);
    }

    let sent = drain(&mut link);
    assert_eq!(sent.len(), 5);
    let fb = Feedback::decode(&sent[0], feedback::DEFAULT_FEEDBACK_IPPROTO).unwrap();
    assert!(!fb.is_marked());
}

#[tokio::test(start_paused = true)]
async fn feedback_is_never_fed_back() {
    let (engine, mut link) = engine(Params::default().always_feedback(true));

    let fb = Feedback::reply_to(&frame(SENDER, RECEIVER, 1000, 0), true).unwrap();
    assert_eq!(engine.rx(&fb.encode(feedback::DEFAULT_FEEDBACK_IPPROTO), 0), Verdict::Drop);
    assert!(drain(&mut link).is_empty());
    assert!(engine.stats().queues.is_empty());
}

#[tokio::test(start_paused = true)]
async fn disabled_queue_is_silent() {
    let (engine, mut link) = engine(Params::default().always_feedback(true));
    let key = IpKey(RECEIVER);
    engine.install_queue(key).unwrap();
    engine.set_queue_enabled(key, false).unwrap();

    for id in 0..5 {
        assert_eq!(engine.rx(&frame(SENDER, RECEIVER, 1000, id), 0), Verdict::Pass);
    }
    assert!(drain(&mut link).is_empty());
    let queue = engine.stats().queue(&RECEIVER.to_string()).cloned().unwrap();
    assert_eq!((queue.enabled, queue.active, queue.rx_packets), (false, false, 0));

    engine.set_queue_enabled(key, true).unwrap();
    engine.rx(&frame(SENDER, RECEIVER, 1000, 5), 0);
    assert_eq!(drain(&mut link).len(), 1);
    assert_eq!(engine.stats().queue(&RECEIVER.to_string()).map(|q| q.rx_packets), Some(1));

    assert_eq!(
        engine.set_queue_enabled(IpKey(SENDER), false),
        Err(Error::UnknownQueue(SENDER.to_string()))
    );
}
