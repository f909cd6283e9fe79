use eyeq_engine::{Command, Engine, Error, IpKey, Params};
use tokio::sync::mpsc;

fn run(engine: &Engine<IpKey>, line: &str) -> Result<(), Error> {
    engine.execute(line.parse::<Command<IpKey>>()?)
}

#[test]
fn tool_session() {
    let _ = tracing_subscriber::fmt::try_init();
    let (tx, _rx) = mpsc::unbounded_channel();
    let engine = Engine::<IpKey>::new(Params::default().num_cpus(2), tx);

    run(&engine, "create_txc 10.0.0.1").unwrap();
    assert_eq!(run(&engine, "create_txc 10.0.0.1"), Err(Error::ClassExists("10.0.0.1".to_owned())));

    run(&engine, "create_vq 10.0.0.1").unwrap();
    assert_eq!(run(&engine, "create_vq 10.0.0.1"), Err(Error::QueueExists("10.0.0.1".to_owned())));

    assert_eq!(
        run(&engine, "associate txc 10.0.0.9 vq 10.0.0.1"),
        Err(Error::UnknownClass("10.0.0.9".to_owned()))
    );
    assert_eq!(
        run(&engine, "associate txc 10.0.0.1 vq 10.0.0.9"),
        Err(Error::UnknownQueue("10.0.0.9".to_owned()))
    );
    run(&engine, "associate txc 10.0.0.1 vq 10.0.0.1").unwrap();

    assert_eq!(run(&engine, "set_vq_weight 10.0.0.1 weight 0"), Err(Error::ZeroWeight));
    run(&engine, "set_vq_weight 10.0.0.1 weight 4").unwrap();

    let stats = engine.stats();
    let class = stats.class("10.0.0.1").unwrap();
    assert_eq!(class.vq.as_deref(), Some("10.0.0.1"));
    assert_eq!(class.pool_free, Params::default().prealloc_per_class);
    let queue = stats.queue("10.0.0.1").unwrap();
    assert_eq!((queue.weight, queue.refcount, queue.is_static), (4, 1, true));
    assert!(queue.enabled);

    run(&engine, "disable_vq 10.0.0.1").unwrap();
    assert_eq!(engine.stats().queue("10.0.0.1").map(|q| q.enabled), Some(false));
    run(&engine, "enable_vq 10.0.0.1").unwrap();
    assert_eq!(engine.stats().queue("10.0.0.1").map(|q| q.enabled), Some(true));
    assert_eq!(run(&engine, "enable_vq 10.0.0.9"), Err(Error::UnknownQueue("10.0.0.9".to_owned())));

    assert_eq!(
        run(&engine, "delete_vq 10.0.0.1"),
        Err(Error::QueueInUse("10.0.0.1".to_owned(), 1))
    );
    run(&engine, "delete_txc 10.0.0.1").unwrap();
    run(&engine, "delete_vq 10.0.0.1").unwrap();

    let stats = engine.stats();
    assert!(stats.classes.is_empty());
    assert!(stats.queues.is_empty());
}

#[test]
fn runtime_parameters() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let engine = Engine::<IpKey>::new(Params::default().num_cpus(2), tx);

    run(&engine, "set hierarchical 1").unwrap();
    run(&engine, "set feedback_interval_us 250").unwrap();
    assert!(engine.params().hierarchical);
    assert_eq!(engine.params().get("feedback_interval_us"), Some(250));

    assert_eq!(run(&engine, "set bogus 1"), Err(Error::UnknownParam("bogus".to_owned())));
    assert!(matches!(run(&engine, "set max_tx_rate fast"), Err(Error::InvalidParam { .. })));
    assert!(matches!(run(&engine, "set max_tx_rate 0"), Err(Error::InvalidParam { .. })));
    assert!(matches!(run(&engine, "set num_cpus 8"), Err(Error::InvalidParam { .. })));

    // Failed updates leave the current parameters untouched.
    assert_eq!(engine.params().max_tx_rate, 10_000);
    assert_eq!(engine.params().num_cpus, 2);
}
