use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use eyeq_engine::{Datapath, Params, RateLimiter, Verdict};
use tokio::sync::mpsc;

use crate::helpers::{drain, frame, RECEIVER, SENDER};

const CPU: usize = 0;
const SECOND: u64 = 1_000_000;

/// Offers 1500-byte packets every `gap` microseconds for one second to a 100 Mbps limiter,
/// running the deferred drain at every step. Returns the limiter, the verdicts and the link.
fn offer(gap: u64) -> (Arc<RateLimiter>, Datapath, Vec<Verdict>, mpsc::UnboundedReceiver<eyeq_wire::Packet>) {
    let _ = tracing_subscriber::fmt::try_init();

    let (tx, rx) = mpsc::unbounded_channel();
    let dp = Datapath::new(Params::default().num_cpus(1), tx);
    let rl = Arc::new(RateLimiter::new(100, 1, 0, None));
    let cap = dp.params().max_queue_len_bytes;

    let mut verdicts = Vec::new();
    let mut now = 0;
    let mut id = 0u16;
    while now < SECOND {
        verdicts.push(rl.enqueue(frame(SENDER, RECEIVER, 1500, id), CPU, now, &dp));
        dp.run_deferred(CPU, now);
        assert!(rl.queued_bytes() <= cap);

        id = id.wrapping_add(1);
        now += gap;
    }

    (rl, dp, verdicts, rx)
}

#[test]
fn below_cap_sends_everything() {
    // 1500 bytes every 240 us is 50 Mbps.
    let (rl, dp, verdicts, mut rx) = offer(240);
    assert!(verdicts.iter().all(|v| *v == Verdict::Success));

    let mut now = SECOND;
    while rl.queued_bytes() > 0 {
        now += 1_000;
        dp.run_deferred(CPU, now);
    }

    let sent = drain(&mut rx);
    assert_eq!(sent.len(), verdicts.len());
    assert_eq!(rl.stats().dropped, 0);

    // FIFO on a single queue.
    let ids: Vec<_> = sent.iter().map(|p| p.ipv4().unwrap().get_identification()).collect();
    let expected: Vec<_> = (0..verdicts.len()).map(|i| i as u16).collect();
    assert_eq!(ids, expected);
}

#[test]
fn above_cap_converges_to_the_rate() {
    // 1500 bytes every 60 us is 200 Mbps.
    let (rl, _dp, verdicts, mut rx) = offer(60);
    assert!(verdicts.contains(&Verdict::Drop));
    assert!(rl.stats().dropped > 0);

    let sent: u64 = drain(&mut rx).iter().map(|p| p.len() as u64).sum();
    let ideal = 100 * SECOND / 8;
    let burst = Params::default().burst_cap(100);
    assert!(sent <= ideal + burst, "sent {sent} bytes, ideal {ideal}");
    assert!(sent >= ideal * 95 / 100, "sent {sent} bytes, ideal {ideal}");
}

#[test]
fn queues_are_independent_per_cpu() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dp = Datapath::new(Params::default().num_cpus(2), tx);
    let params = dp.params();
    let rl = Arc::new(RateLimiter::new(1_000, 2, 0, None));
    rl.clock(1_000, &params);

    for id in 0..4 {
        rl.enqueue(frame(SENDER, RECEIVER, 1000, id), id as usize % 2, 1_000, &dp);
    }

    let stats = rl.stats();
    assert_eq!(stats.accum_enqueued, 4_000);
    assert_eq!(stats.accum_xmit + stats.queued_bytes, 4_000);
    assert!(drain(&mut rx).len() as u64 * 1000 == stats.accum_xmit);
}

#[test]
fn concurrent_enqueue_and_drain_account_every_byte() {
    const CPUS: usize = 4;
    const PACKETS: u16 = 300;

    let _ = tracing_subscriber::fmt::try_init();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dp = Datapath::new(Params::default().num_cpus(CPUS), tx);
    let rl = Arc::new(RateLimiter::new(1_000, CPUS, dp.now(), None));
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        // Deferred drains racing the enqueuers on every CPU.
        for _ in 0..2 {
            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    for cpu in 0..CPUS {
                        dp.run_deferred(cpu, dp.now());
                    }
                }
            });
        }

        let senders: Vec<_> = (0..CPUS)
            .map(|cpu| {
                let (rl, dp) = (&rl, &dp);
                s.spawn(move || {
                    for seq in 0..PACKETS {
                        let id = cpu as u16 * 1_000 + seq;
                        let packet = frame(SENDER, RECEIVER, 1000, id);
                        assert_eq!(rl.enqueue(packet, cpu, dp.now(), dp), Verdict::Success);
                        rl.dequeue(cpu, dp.now(), dp);
                    }
                })
            })
            .collect();

        for sender in senders {
            sender.join().unwrap();
        }
        done.store(true, Ordering::Release);
    });

    let stats = rl.stats();
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.accum_enqueued, CPUS as u64 * u64::from(PACKETS) * 1000);
    assert_eq!(stats.accum_enqueued, stats.accum_xmit + stats.queued_bytes);

    // Drain what is left.
    let params = dp.params();
    let mut now = dp.now();
    for _ in 0..10_000 {
        if rl.queued_bytes() == 0 {
            break;
        }
        now += params.rl_update_interval_us;
        rl.clock(now, &params);
        for cpu in 0..CPUS {
            rl.dequeue(cpu, now, &dp);
        }
    }

    let stats = rl.stats();
    assert_eq!(stats.queued_bytes, 0);
    assert_eq!(stats.accum_xmit, stats.accum_enqueued);

    // Every packet reached the link exactly once, each CPU's packets in the order they were
    // enqueued.
    let sent = drain(&mut rx);
    assert_eq!(sent.iter().map(|p| p.len() as u64).sum::<u64>(), stats.accum_xmit);
    let ids: Vec<_> = sent.iter().map(|p| p.ipv4().unwrap().get_identification()).collect();
    assert_eq!(ids.iter().collect::<BTreeSet<_>>().len(), ids.len());
    for cpu in 0..CPUS as u16 {
        let order: Vec<_> = ids.iter().filter(|id| **id / 1_000 == cpu).map(|id| id % 1_000).collect();
        assert_eq!(order, (0..PACKETS).collect::<Vec<_>>());
    }
}
