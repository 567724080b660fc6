use super::*;

use std::{
    collections::HashMap,
    sync::{atomic::AtomicBool, Condvar},
};

use crate::{
    config::WaitStrategy,
    ctxt::ThreadLocalCtxt,
    level::Level,
    message::Message,
    policy::PolicyRegistry,
    setup,
    sink::{self, Sink},
    status::Buffer,
};

#[derive(Debug, Clone)]
struct Seen {
    message: String,
    sequence: Option<u64>,
    end_of_batch: bool,
    thread: ThreadId,
    producer: Option<u64>,
    index: Option<u64>,
    request: Option<String>,
}

#[derive(Clone, Default)]
struct Collect(Arc<Mutex<Vec<Seen>>>);

impl Collect {
    fn events(&self) -> Vec<Seen> {
        self.0.lock().unwrap().clone()
    }

    fn messages(&self) -> Vec<String> {
        self.events().into_iter().map(|evt| evt.message).collect()
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl Sink for Collect {
    fn dispatch(&self, evt: &EventEnvelope) {
        self.0.lock().unwrap().push(Seen {
            message: evt.message_text().to_owned(),
            sequence: evt.sequence(),
            end_of_batch: evt.is_end_of_batch(),
            thread: thread::current().id(),
            producer: evt.prop("producer").and_then(|v| v.to_u64()),
            index: evt.prop("index").and_then(|v| v.to_u64()),
            request: evt.ctxt().get("request").map(Into::into),
        });
    }
}

// Blocks the sink until released
#[derive(Clone, Default)]
struct Latch(Arc<(Mutex<(bool, bool)>, Condvar)>);

impl Latch {
    fn block(&self) {
        let (lock, cvar) = &*self.0;
        let mut state = lock.lock().unwrap();

        state.0 = true;
        cvar.notify_all();

        while !state.1 {
            state = cvar.wait(state).unwrap();
        }
    }

    fn wait_entered(&self) {
        let (lock, cvar) = &*self.0;
        let mut state = lock.lock().unwrap();

        while !state.0 {
            state = cvar.wait(state).unwrap();
        }
    }

    fn release(&self) {
        let (lock, cvar) = &*self.0;
        let mut state = lock.lock().unwrap();

        state.1 = true;
        cvar.notify_all();
    }
}

// Blocks on the first event it receives
#[derive(Clone, Default)]
struct BlockFirst {
    latch: Latch,
    first: Arc<AtomicBool>,
    inner: Collect,
}

impl Sink for BlockFirst {
    fn dispatch(&self, evt: &EventEnvelope) {
        if !self.first.swap(true, Ordering::SeqCst) {
            self.latch.block();
        }

        self.inner.dispatch(evt);
    }
}

struct Nested {
    logger: Logger,
    count: usize,
}

impl fmt::Display for Nested {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.count {
            self.logger.info(format!("nested {i}"));
        }

        f.write_str("outer")
    }
}

struct Fails;

impl fmt::Display for Fails {
    fn fmt(&self, _: &mut fmt::Formatter<'_>) -> fmt::Result {
        Err(fmt::Error)
    }
}

struct Panics;

impl fmt::Display for Panics {
    fn fmt(&self, _: &mut fmt::Formatter<'_>) -> fmt::Result {
        panic!("explicit panic in display")
    }
}

fn spawn(
    config: impl FnOnce(Config) -> Config,
    sink: impl Sink + Send + Sync + 'static,
) -> (Arc<Pipeline>, Arc<Buffer>) {
    let status = Arc::new(Buffer::new(1024));

    let pipeline = setup()
        .dispatch_to(sink)
        .map_config(config)
        .status_to(status.clone())
        .spawn();

    (Arc::new(pipeline), status)
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let start = Instant::now();

    while !condition() {
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "timed out waiting for a condition"
        );

        thread::sleep(Duration::from_millis(1));
    }
}

const STOP: Duration = Duration::from_secs(5);

#[test]
fn lifecycle() {
    let pipeline = setup().status_to(Arc::new(Buffer::new(8))).build();

    assert_eq!(State::Stopped, pipeline.state());
    assert!(pipeline.consumer_thread().is_none());

    pipeline.start().unwrap();

    assert_eq!(State::Running, pipeline.state());
    assert!(pipeline.consumer_thread().is_some());
    assert!(pipeline.start().is_err());

    assert!(pipeline.stop(STOP));
    assert_eq!(State::Stopped, pipeline.state());

    // Stopping is idempotent, but pipelines can't be restarted
    assert!(pipeline.stop(STOP));
    assert!(pipeline.start().is_err());
}

#[test]
fn stop_without_start() {
    let pipeline = setup().status_to(Arc::new(Buffer::new(8))).build();

    assert!(pipeline.stop(Duration::ZERO));
}

#[test]
fn per_producer_order_without_loss() {
    let collect = Collect::default();
    let (pipeline, _) = spawn(|config| config.with_capacity(16), collect.clone());

    let producers = (0..4u64)
        .map(|producer| {
            let logger = pipeline.logger(format!("producer{producer}"));

            thread::spawn(move || {
                for index in 0..500u64 {
                    let delivery = logger
                        .event(Level::Info)
                        .prop("producer", producer)
                        .prop("index", index)
                        .log("event");

                    assert_eq!(Delivery::Enqueued, delivery);
                }
            })
        })
        .collect::<Vec<_>>();

    for producer in producers {
        producer.join().unwrap();
    }

    assert!(pipeline.stop(STOP));

    let events = collect.events();
    assert_eq!(2000, events.len());

    let mut next = HashMap::new();
    for evt in &events {
        let expected = next.entry(evt.producer.unwrap()).or_insert(0);

        assert_eq!(*expected, evt.index.unwrap());
        *expected += 1;
    }

    // The consumer sees events in the order their slots were claimed
    let sequences = events
        .iter()
        .map(|evt| evt.sequence.unwrap())
        .collect::<Vec<_>>();

    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn stop_drains_queue() {
    let sink = BlockFirst::default();
    let (pipeline, _) = spawn(|config| config, sink.clone());
    let logger = pipeline.logger("test");

    logger.info("block");
    sink.latch.wait_entered();

    for i in 0..99 {
        logger.info(format!("event {i}"));
    }

    let release = thread::spawn({
        let latch = sink.latch.clone();

        move || {
            thread::sleep(Duration::from_millis(50));
            latch.release();
        }
    });

    assert!(pipeline.stop(STOP));
    release.join().unwrap();

    let events = sink.inner.events();

    assert_eq!(100, events.len());
    assert_eq!("block", events[0].message);
    assert!(events.last().unwrap().end_of_batch);
    assert_eq!(pipeline.metrics().dispatched(), 100);
}

#[test]
fn end_of_batch_only_when_caught_up() {
    let sink = BlockFirst::default();
    let (pipeline, _) = spawn(|config| config.with_batch_size(2), sink.clone());
    let logger = pipeline.logger("test");

    logger.info("block");
    sink.latch.wait_entered();

    for i in 0..6 {
        logger.info(format!("event {i}"));
    }

    sink.latch.release();
    assert!(pipeline.blocking_flush(STOP));

    let flags = sink
        .inner
        .events()
        .into_iter()
        .map(|evt| (evt.message, evt.end_of_batch))
        .collect::<Vec<_>>();

    // Every queued event was visible before the consumer resumed
    assert_eq!(
        vec![
            ("block".to_owned(), true),
            ("event 0".to_owned(), false),
            ("event 1".to_owned(), false),
            ("event 2".to_owned(), false),
            ("event 3".to_owned(), false),
            ("event 4".to_owned(), false),
            ("event 5".to_owned(), true),
        ],
        flags
    );

    assert!(pipeline.stop(STOP));
}

#[test]
fn stop_waits_for_blocked_producers() {
    for synchronize in [true, false] {
        let sink = BlockFirst::default();
        let (pipeline, _) = spawn(
            |config| {
                config
                    .with_capacity(2)
                    .with_synchronize_enqueue_when_full(synchronize)
            },
            sink.clone(),
        );
        let logger = pipeline.logger("test");

        logger.info("block");
        sink.latch.wait_entered();

        logger.info("a");
        logger.info("b");

        let blocked = thread::spawn({
            let logger = logger.clone();

            move || logger.info("blocked")
        });

        wait_until(|| pipeline.metrics().queue_full_enqueued() >= 1);

        let release = thread::spawn({
            let latch = sink.latch.clone();

            move || {
                thread::sleep(Duration::from_millis(50));
                latch.release();
            }
        });

        assert!(pipeline.stop(STOP), "synchronize: {synchronize}");
        release.join().unwrap();

        assert_eq!(Delivery::Enqueued, blocked.join().unwrap());
        assert_eq!(
            vec!["block", "a", "b", "blocked"],
            sink.inner.messages(),
            "synchronize: {synchronize}"
        );
    }
}

#[test]
fn every_wait_strategy_delivers() {
    for strategy in [
        WaitStrategy::Block,
        WaitStrategy::Timeout,
        WaitStrategy::Sleep,
        WaitStrategy::Yield,
        WaitStrategy::BusySpin,
    ] {
        let collect = Collect::default();
        let (pipeline, _) = spawn(
            |config| config.with_capacity(16).with_wait_strategy(strategy),
            collect.clone(),
        );
        let logger = pipeline.logger("test");

        for i in 0..100 {
            assert_eq!(Delivery::Enqueued, logger.info(format!("event {i}")));

            // Give the consumer a chance to go idle between some events
            if i % 25 == 0 {
                thread::sleep(Duration::from_millis(5));
            }
        }

        assert!(pipeline.blocking_flush(STOP), "{strategy}");
        assert_eq!(100, collect.len(), "{strategy}");

        assert!(pipeline.stop(STOP), "{strategy}");
        assert_eq!(State::Stopped, pipeline.state());
    }
}

#[test]
fn discard_below_threshold() {
    let sink = BlockFirst::default();
    let (pipeline, status) = spawn(
        |config| {
            config
                .with_capacity(2)
                .with_policy("discard")
                .with_discard_threshold(Level::Info)
        },
        sink.clone(),
    );
    let logger = pipeline.logger("test");

    assert_eq!("Discard", pipeline.policy_name());

    logger.info("block");
    sink.latch.wait_entered();

    let mut discarded = 0;
    for _ in 0..500 {
        if logger.debug("noise") == Delivery::Discarded {
            discarded += 1;
        }
    }

    sink.latch.release();
    assert!(pipeline.stop(STOP));

    // The consumer was blocked, so only the queue's capacity got through
    assert_eq!(498, discarded);
    assert_eq!(498, pipeline.discard_count());
    assert_eq!(498, pipeline.metrics().queue_full_discarded());
    assert_eq!(501, pipeline.discard_count() as usize + sink.inner.len());

    assert_eq!(1, status.count_containing("discarding events"));
    assert_eq!(1, status.count_containing("discarded 498 events"));
}

#[test]
fn nested_logging_on_consumer_is_out_of_order() {
    let collect = Collect::default();
    let (pipeline, status) = spawn(
        |config| config.with_capacity(2).with_format_eagerly(false),
        collect.clone(),
    );
    let logger = pipeline.logger("test");

    let delivery = logger.info(Message::deferred(Nested {
        logger: logger.clone(),
        count: 5,
    }));

    assert_eq!(Delivery::Enqueued, delivery);

    // Wait for the consumer to render the outer event before stopping
    assert!(pipeline.blocking_flush(STOP));
    assert!(pipeline.stop(STOP));

    // Two nested events fit in the queue; the rest jump ahead of it
    assert_eq!(
        vec!["nested 2", "nested 3", "nested 4", "outer", "nested 0", "nested 1"],
        collect.messages()
    );

    let consumer = pipeline.consumer_thread().unwrap();
    assert!(collect.events().iter().all(|evt| evt.thread == consumer));

    assert_eq!(3, pipeline.metrics().out_of_order());
    assert_eq!(3, status.count_containing("out of order to avoid deadlock"));
}

#[test]
fn nested_logging_on_producer_is_out_of_order() {
    let sink = BlockFirst::default();
    let (pipeline, status) = spawn(|config| config.with_capacity(2), sink.clone());
    let logger = pipeline.logger("test");

    logger.info("block");
    sink.latch.wait_entered();

    logger.info("a");
    logger.info("b");

    let release = thread::spawn({
        let pipeline = pipeline.clone();
        let latch = sink.latch.clone();

        move || {
            wait_until(|| pipeline.metrics().out_of_order() >= 3);
            latch.release();
        }
    });

    // Rendering happens on this thread, so nested events can't wait for the consumer
    let delivery = logger.info(Message::deferred(Nested {
        logger: logger.clone(),
        count: 3,
    }));

    release.join().unwrap();

    assert_eq!(Delivery::Enqueued, delivery);
    assert!(pipeline.stop(STOP));

    assert_eq!(
        vec!["nested 0", "nested 1", "nested 2", "block", "a", "b", "outer"],
        sink.inner.messages()
    );

    assert_eq!(3, pipeline.metrics().out_of_order());
    assert_eq!(3, status.count_containing("out of order to avoid deadlock"));
}

#[test]
fn context_is_frozen_at_capture() {
    let ctxt = ThreadLocalCtxt::new();
    let sink = BlockFirst::default();

    let pipeline = setup()
        .dispatch_to(sink.clone())
        .with_ctxt(ctxt)
        .status_to(Arc::new(Buffer::new(8)))
        .spawn();
    let pipeline = Arc::new(pipeline);
    let logger = pipeline.logger("test");

    ctxt.put("request", "1");
    logger.info("first");

    ctxt.put("request", "2");
    logger.info("second");

    ctxt.clear();
    sink.latch.release();

    assert!(pipeline.stop(STOP));

    assert_eq!(
        vec![Some("1".to_owned()), Some("2".to_owned())],
        sink.inner
            .events()
            .into_iter()
            .map(|evt| evt.request)
            .collect::<Vec<_>>()
    );
}

#[test]
fn sink_panics_are_contained() {
    let collect = Collect::default();
    let status = Arc::new(Buffer::new(8));

    let pipeline = setup()
        .dispatch_to(sink::from_fn(|_| panic!("explicit panic in sink")))
        .and_dispatch_to(collect.clone())
        .status_to(status.clone())
        .spawn();
    let pipeline = Arc::new(pipeline);
    let logger = pipeline.logger("test");

    for _ in 0..3 {
        logger.info("event");
    }

    assert!(pipeline.stop(STOP));

    assert_eq!(3, collect.len());
    assert_eq!(3, pipeline.metrics().sink_panicked());

    // Only the first panic from each sink is reported
    assert_eq!(1, status.count_containing("explicit panic in sink"));
}

#[test]
fn cancelled_wait_goes_to_error_sink() {
    let sink = BlockFirst::default();
    let errors = Collect::default();
    let status = Arc::new(Buffer::new(8));

    let pipeline = setup()
        .dispatch_to(sink.clone())
        .error_to(errors.clone())
        .map_config(|config| config.with_capacity(2))
        .status_to(status.clone())
        .spawn();
    let pipeline = Arc::new(pipeline);
    let logger = pipeline.logger("test");

    logger.info("block");
    sink.latch.wait_entered();

    logger.info("a");
    logger.info("b");

    let cancel = Cancel::new();

    let publisher = thread::spawn({
        let logger = logger.clone();
        let cancel = cancel.clone();

        move || logger.event(Level::Info).cancel(&cancel).log("cancelled")
    });

    thread::sleep(Duration::from_millis(50));
    cancel.cancel();

    assert_eq!(Delivery::Interrupted, publisher.join().unwrap());

    sink.latch.release();
    assert!(pipeline.stop(STOP));

    assert_eq!(vec!["cancelled"], errors.messages());
    assert_eq!(vec!["block", "a", "b"], sink.inner.messages());

    assert_eq!(1, pipeline.metrics().publish_interrupted());
    assert_eq!(1, status.count_containing("interrupted"));
}

#[test]
fn full_without_blocking() {
    let sink = BlockFirst::default();
    let (pipeline, status) = spawn(
        |config| config.with_capacity(2).with_blocking(false),
        sink.clone(),
    );
    let logger = pipeline.logger("test");

    logger.info("block");
    sink.latch.wait_entered();

    logger.info("a");
    logger.info("b");

    assert_eq!(Delivery::Dropped, logger.info("c"));
    assert_eq!(Delivery::Dropped, logger.info("d"));

    sink.latch.release();
    assert!(pipeline.stop(STOP));

    assert_eq!(vec!["block", "a", "b"], sink.inner.messages());
    assert_eq!(2, pipeline.metrics().dropped());
    assert_eq!(1, status.count_containing("dropped"));
}

#[test]
fn full_without_blocking_goes_to_error_sink() {
    let sink = BlockFirst::default();
    let errors = Collect::default();

    let pipeline = setup()
        .dispatch_to(sink.clone())
        .error_to(errors.clone())
        .map_config(|config| config.with_capacity(2).with_blocking(false))
        .status_to(Arc::new(Buffer::new(8)))
        .spawn();
    let pipeline = Arc::new(pipeline);
    let logger = pipeline.logger("test");

    logger.info("block");
    sink.latch.wait_entered();

    logger.info("a");
    logger.info("b");

    assert_eq!(Delivery::ErrorSink, logger.info("c"));

    let caller = thread::current().id();
    assert_eq!(caller, errors.events()[0].thread);

    sink.latch.release();
    assert!(pipeline.stop(STOP));

    assert_eq!(vec!["c"], errors.messages());
    assert_eq!(1, pipeline.metrics().routed_to_error_sink());
}

#[test]
fn synchronous_route_dispatches_on_caller() {
    struct AlwaysSync;

    impl QueueFullPolicy for AlwaysSync {
        fn route(&self, _: Option<ThreadId>, _: Level) -> EventRoute {
            EventRoute::Synchronous
        }

        fn name(&self) -> &str {
            "AlwaysSync"
        }
    }

    let mut policies = PolicyRegistry::new();
    policies.register("always-sync", |_| Ok(Box::new(AlwaysSync)));

    let sink = BlockFirst::default();

    let pipeline = setup()
        .dispatch_to(sink.clone())
        .with_policy_registry(policies)
        .map_config(|config| config.with_capacity(2).with_policy("always-sync"))
        .status_to(Arc::new(Buffer::new(8)))
        .spawn();
    let pipeline = Arc::new(pipeline);
    let logger = pipeline.logger("test");

    logger.info("block");
    sink.latch.wait_entered();

    logger.info("a");
    logger.info("b");

    assert_eq!(Delivery::Synchronous, logger.info("c"));

    let c = sink.inner.events().into_iter().next().unwrap();
    assert_eq!("c", c.message);
    assert_eq!(None, c.sequence);
    assert_eq!(thread::current().id(), c.thread);

    sink.latch.release();
    assert!(pipeline.stop(STOP));

    assert_eq!(vec!["c", "block", "a", "b"], sink.inner.messages());
    assert_eq!(1, pipeline.metrics().queue_full_synchronous());
}

#[test]
fn dispatch_while_stopped() {
    let collect = Collect::default();
    let status = Arc::new(Buffer::new(8));

    let pipeline = Arc::new(
        setup()
            .dispatch_to(collect.clone())
            .status_to(status)
            .build(),
    );
    let logger = pipeline.logger("test");

    assert_eq!(Delivery::Synchronous, logger.info("before"));

    pipeline.start().unwrap();
    assert_eq!(Delivery::Enqueued, logger.info("running"));

    assert!(pipeline.stop(STOP));
    assert_eq!(Delivery::Synchronous, logger.info("after"));

    let events = collect.events();

    assert_eq!(
        vec!["before", "running", "after"],
        events.iter().map(|evt| &*evt.message).collect::<Vec<_>>()
    );

    assert_eq!(thread::current().id(), events[2].thread);
    assert_eq!(None, events[2].sequence);
    assert!(events[1].sequence.is_some());

    assert_eq!(2, pipeline.metrics().dispatched_while_stopped());
}

#[test]
fn stop_times_out_then_completes() {
    let sink = BlockFirst::default();
    let (pipeline, status) = spawn(|config| config, sink.clone());
    let logger = pipeline.logger("test");

    logger.info("block");
    sink.latch.wait_entered();

    logger.info("queued");

    assert!(!pipeline.stop(Duration::from_millis(50)));
    assert_eq!(State::Draining, pipeline.state());
    assert_eq!(1, status.count_containing("timed out"));

    // New events bypass the queue while it drains
    assert_eq!(Delivery::Synchronous, logger.info("late"));

    sink.latch.release();

    assert!(pipeline.stop(STOP));
    assert_eq!(State::Stopped, pipeline.state());

    assert_eq!(vec!["late", "block", "queued"], sink.inner.messages());
}

#[test]
fn blocking_flush_waits_for_published_events() {
    let collect = Collect::default();
    let (pipeline, _) = spawn(|config| config, collect.clone());
    let logger = pipeline.logger("test");

    for _ in 0..50 {
        logger.info("event");
    }

    assert!(pipeline.blocking_flush(STOP));
    assert_eq!(50, collect.len());

    assert!(pipeline.is_running());
}

#[test]
fn blocking_flush_times_out() {
    let sink = BlockFirst::default();
    let (pipeline, _) = spawn(|config| config, sink.clone());
    let logger = pipeline.logger("test");

    logger.info("block");
    sink.latch.wait_entered();

    assert!(!pipeline.blocking_flush(Duration::from_millis(20)));

    sink.latch.release();

    assert!(pipeline.blocking_flush(STOP));
    assert_eq!(1, sink.inner.len());
}

#[test]
fn when_flushed_without_queue_is_immediate() {
    let pipeline = setup().status_to(Arc::new(Buffer::new(8))).build();

    let called = Arc::new(AtomicBool::new(false));

    pipeline.when_flushed({
        let called = called.clone();

        move || called.store(true, Ordering::SeqCst)
    });

    assert!(called.load(Ordering::SeqCst));
}

#[test]
fn eager_render_failure_is_rejected() {
    let collect = Collect::default();
    let (pipeline, status) = spawn(|config| config, collect.clone());
    let logger = pipeline.logger("test");

    assert_eq!(Delivery::Rejected, logger.info(Message::deferred(Fails)));

    assert!(pipeline.stop(STOP));

    assert_eq!(0, collect.len());
    assert_eq!(1, pipeline.metrics().capture_failed());
    assert_eq!(1, status.count_containing("failed to format"));
}

#[test]
fn deferred_render_failure_uses_fallback() {
    let collect = Collect::default();
    let (pipeline, _) = spawn(|config| config.with_format_eagerly(false), collect.clone());
    let logger = pipeline.logger("test");

    assert_eq!(Delivery::Enqueued, logger.info(Message::deferred(Panics)));

    assert!(pipeline.stop(STOP));

    let messages = collect.messages();

    assert_eq!(1, messages.len());
    assert!(messages[0].starts_with("<message unavailable"));
    assert!(messages[0].contains("explicit panic in display"));

    assert_eq!(1, pipeline.metrics().format_failed());
}

#[test]
fn drop_stops_pipeline() {
    let collect = Collect::default();

    {
        let (pipeline, _) = spawn(|config| config, collect.clone());
        let logger = pipeline.logger("test");

        for _ in 0..10 {
            logger.info("event");
        }
    }

    assert_eq!(10, collect.len());
}

#[test]
fn metrics_sample() {
    let sink = BlockFirst::default();
    let (pipeline, _) = spawn(|config| config.with_capacity(8), sink.clone());
    let logger = pipeline.logger("test");

    logger.info("block");
    sink.latch.wait_entered();

    logger.info("a");
    logger.info("b");

    let metrics = pipeline.metrics();

    assert_eq!(8, metrics.queue_capacity());
    assert_eq!(2, metrics.queue_length());

    let queue_length = metrics
        .sample()
        .into_iter()
        .find(|metric| metric.name() == "queue_length")
        .unwrap();

    assert_eq!(2, queue_length.value());

    sink.latch.release();
    assert!(pipeline.stop(STOP));

    assert_eq!(3, pipeline.metrics().dispatched());
}
