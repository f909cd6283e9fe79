use std::{
    sync::{Arc, Barrier},
    thread,
    time::Duration,
};

use bytes::BytesMut;
use eyeq_engine::{Engine, Error, IpKey, MarkKey, Params, Verdict};
use eyeq_wire::{ecn, feedback, packet::FrameBuilder, Feedback, Packet};
use tokio::sync::mpsc;

use crate::helpers::{drain, frame, RECEIVER, SENDER};

fn engine<K: eyeq_engine::ClassKey>(params: Params) -> (Arc<Engine<K>>, mpsc::UnboundedReceiver<Packet>) {
    let _ = tracing_subscriber::fmt::try_init();
    let (tx, rx) = mpsc::unbounded_channel();
    (Engine::new(params.num_cpus(1), tx), rx)
}

fn is_ect(packet: &Packet) -> bool {
    packet.tos().is_some_and(|tos| tos & ecn::ECN_MASK == ecn::ECN_ECT0)
}

#[tokio::test(start_paused = true)]
async fn tx_is_shaped_by_the_timer() {
    let (engine, mut link) = engine::<IpKey>(Params::default());
    engine.install_class(IpKey(SENDER)).unwrap();
    engine.start().unwrap();

    for id in 0..10 {
        assert_eq!(engine.tx(frame(SENDER, RECEIVER, 1000, id), 0), Verdict::Success);
    }
    // No tokens yet.
    assert!(drain(&mut link).is_empty());

    tokio::time::sleep(Duration::from_millis(20)).await;

    let sent = drain(&mut link);
    let ids: Vec<_> = sent.iter().map(|p| p.ipv4().unwrap().get_identification()).collect();
    assert_eq!(ids, (0..10).collect::<Vec<_>>());
    assert!(sent.iter().all(is_ect));

    let stats = engine.stats();
    assert_eq!(stats.tx_packets, 10);
    assert!(stats.deferred_runs > 0);
    assert_eq!(stats.class(&SENDER.to_string()).unwrap().tx_bytes(), 10_000);

    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn feedback_lowers_the_destination_rate() {
    let (engine, _link) = engine::<IpKey>(Params::default());
    let class = engine.install_class(IpKey(SENDER)).unwrap();

    engine.tx(frame(SENDER, RECEIVER, 1000, 0), 0);
    let state = class.find_state(RECEIVER).unwrap();
    state.rc().set_alpha(512);

    tokio::time::advance(Duration::from_millis(5)).await;
    let fb = Feedback::reply_to(&frame(SENDER, RECEIVER, 1000, 0), true).unwrap();
    assert_eq!(engine.rx(&fb.encode(feedback::DEFAULT_FEEDBACK_IPPROTO), 0), Verdict::Drop);

    assert_eq!(state.rc().rfair(), 48);
    assert_eq!(state.rl().rate(), 48);
}

#[tokio::test(start_paused = true)]
async fn reflected_data_counts_as_a_mark() {
    let (engine, _link) = engine::<IpKey>(Params::default());
    let class = engine.install_class(IpKey(SENDER)).unwrap();

    engine.tx(frame(SENDER, RECEIVER, 1000, 0), 0);
    let state = class.find_state(RECEIVER).unwrap();
    state.rc().set_alpha(512);

    tokio::time::advance(Duration::from_millis(5)).await;
    let mut data = frame(RECEIVER, SENDER, 1000, 0);
    assert!(data.set_reflect());
    assert_eq!(engine.rx(&data, 0), Verdict::Pass);

    assert_eq!(state.rl().rate(), 48);
}

#[tokio::test(start_paused = true)]
async fn hierarchical_destinations_share_the_aggregate() {
    let (engine, mut link) = engine::<IpKey>(Params::default().hierarchical(true));
    let class = engine.install_class(IpKey(SENDER)).unwrap();
    engine.start().unwrap();

    for host in 2..5 {
        let dst = std::net::Ipv4Addr::new(10, 0, 0, host);
        for id in 0..4 {
            assert_eq!(engine.tx(frame(SENDER, dst, 1000, id), 0), Verdict::Success);
        }
    }
    assert_eq!(class.agg().children(), 3);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(drain(&mut link).len(), 12);

    let stats = class.stats();
    assert_eq!(stats.agg.accum_xmit, 12_000);
    assert_eq!(stats.tx_bytes(), 12_000);
    assert_eq!(stats.dests.len(), 3);

    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn malformed_offloaded_frames_are_dropped() {
    let (engine, mut link) = engine::<IpKey>(Params::default());
    let class = engine.install_class(IpKey(SENDER)).unwrap();

    // A super-frame whose TCP data offset claims a header shorter than 20 bytes.
    let mut packet = FrameBuilder::new()
        .src_ip(SENDER)
        .dst_ip(RECEIVER)
        .build_tcp(0, 0x10, &[0u8; 100])
        .with_gso_size(1);
    packet.data_mut()[46] = 0;

    assert_eq!(engine.tx(packet, 0), Verdict::Drop);
    assert!(drain(&mut link).is_empty());

    let state = class.find_state(RECEIVER).unwrap();
    assert_eq!(state.rl().stats().dropped, 1);
    assert_eq!(state.rl().queued_bytes(), 0);

    // Well-formed traffic to the same peer is unaffected.
    assert_eq!(engine.tx(frame(SENDER, RECEIVER, 1000, 1), 0), Verdict::Success);
}

#[tokio::test(start_paused = true)]
async fn non_ip_traffic_uses_the_class_aggregate() {
    let (engine, mut link) = engine::<MarkKey>(Params::default());
    engine.start().unwrap();

    let packet = Packet::new(BytesMut::zeroed(100)).with_mark(7);
    assert_eq!(engine.tx(packet, 0), Verdict::Success);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(drain(&mut link).len(), 1);
    assert_eq!(engine.class(&MarkKey(7)).unwrap().agg().stats().accum_xmit, 100);

    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn new_classes_pass_until_the_pool_is_filled() {
    let (engine, mut link) = engine::<IpKey>(Params::default());
    engine.start().unwrap();

    // The class is created on the fly, without preallocated destinations.
    assert_eq!(engine.tx(frame(SENDER, RECEIVER, 1000, 0), 0), Verdict::Pass);
    assert_eq!(drain(&mut link).len(), 1);

    tokio::time::sleep(Duration::from_millis(1)).await;
    let class = engine.class(&IpKey(SENDER)).unwrap();
    assert_eq!(class.pool_free(), engine.params().prealloc_per_class);
    assert_eq!(engine.tx(frame(SENDER, RECEIVER, 1000, 1), 0), Verdict::Success);

    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn disabled_engine_passes_everything() {
    let (engine, mut link) = engine::<IpKey>(Params::default());
    engine.install_class(IpKey(SENDER)).unwrap();
    engine.set_param("enabled", "false").unwrap();

    assert_eq!(engine.tx(frame(SENDER, RECEIVER, 1000, 0), 0), Verdict::Pass);
    let sent = drain(&mut link);
    assert_eq!(sent.len(), 1);
    assert!(!is_ect(&sent[0]));

    assert_eq!(engine.rx(&frame(RECEIVER, SENDER, 1000, 0), 0), Verdict::Pass);
    assert!(engine.stats().queues.is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_and_passes() {
    let (engine, mut link) = engine::<IpKey>(Params::default());
    let class = engine.install_class(IpKey(SENDER)).unwrap();
    engine.start().unwrap();

    for id in 0..10 {
        engine.tx(frame(SENDER, RECEIVER, 1000, id), 0);
    }
    engine.shutdown();

    let state = class.find_state(RECEIVER).unwrap();
    assert_eq!(state.rl().queued_bytes(), 0);
    assert_eq!(state.rl().stats().dropped, 10);
    assert_eq!(engine.datapath().pending(0), 0);
    assert_eq!(engine.datapath().deadline(0), None);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(drain(&mut link).is_empty());

    assert_eq!(engine.tx(frame(SENDER, RECEIVER, 1000, 10), 0), Verdict::Pass);
    assert_eq!(drain(&mut link).len(), 1);
    assert_eq!(engine.start(), Err(Error::Shutdown));
}

#[test]
fn shutdown_racing_tx_never_drops() {
    const THREADS: usize = 4;
    const PACKETS: u16 = 200;

    let _ = tracing_subscriber::fmt::try_init();
    let (tx, mut link) = mpsc::unbounded_channel();
    let engine = Engine::<IpKey>::new(Params::default().num_cpus(THREADS), tx);
    let class = engine.install_class(IpKey(SENDER)).unwrap();
    let barrier = Barrier::new(THREADS + 1);

    let verdicts: Vec<Verdict> = thread::scope(|s| {
        let senders: Vec<_> = (0..THREADS)
            .map(|cpu| {
                let (engine, barrier) = (&engine, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    (0..PACKETS)
                        .map(|id| engine.tx(frame(SENDER, RECEIVER, 1000, id), cpu))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        barrier.wait();
        thread::sleep(Duration::from_micros(200));
        engine.shutdown();

        senders.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    // Every packet is queued, sent, or flushed; none is refused outright.
    assert!(!verdicts.contains(&Verdict::Drop));
    let rl = class.find_state(RECEIVER).unwrap().rl().stats();
    let sent = drain(&mut link).len() as u64;
    assert_eq!(sent + rl.dropped + rl.queued_packets as u64, THREADS as u64 * u64::from(PACKETS));
}

#[test]
fn malformed_ipv4_is_reported() {
    let (engine, mut link) = engine::<IpKey>(Params::default());
    engine.install_class(IpKey(SENDER)).unwrap();

    // IHL of four words.
    let mut packet = frame(SENDER, RECEIVER, 1000, 0);
    packet.data_mut()[14] = 0x44;

    assert_eq!(engine.rx(&packet, 0), Verdict::Error);
    assert_eq!(engine.tx(packet, 0), Verdict::Error);
    assert_eq!(drain(&mut link).len(), 1);
    assert!(engine.stats().queues.is_empty());
}

#[test]
fn start_requires_a_runtime() {
    let (engine, _link) = engine::<IpKey>(Params::default());
    assert_eq!(engine.start(), Err(Error::NoRuntime));
}
