/*!
The [`Pipeline`] type.

A pipeline decouples the threads that log events from the sinks that receive them. Events are published into a bounded queue and dispatched by a single background consumer thread.

# Lifecycle

Pipelines move through the states of [`State`]:

```text
Stopped -> Starting -> Running -> Draining -> Stopped
```

While a pipeline isn't running, either because it hasn't been started or because it's been stopped, events are dispatched synchronously on the thread that logs them. No event is ever silently lost because of the state of the pipeline.

Stopping a pipeline waits for the background consumer to drain every event already in the queue, including those from producers that are part-way through publishing. Dropping a pipeline stops it using its configured shutdown timeout.

# When the queue is full

If an event finds the queue full, its route is decided by the pipeline's [`QueueFullPolicy`]. Events logged from the background consumer itself, or from within another logging call on the same thread, can't wait for space without risking a deadlock. They're dispatched synchronously instead, ahead of events still in the queue, and a warning is sent to the status channel.
*/

use std::{
    cell::Cell,
    fmt, mem,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant},
};

use emit_async_ring::{sync::Trigger, Cancel, Consumer, Producer, WaitError};

use crate::{
    config::Config,
    consumer,
    ctxt::ContextProvider,
    envelope::EventEnvelope,
    error::Error,
    internal_metrics::{InternalMetrics, PipelineMetrics},
    logger::Logger,
    policy::{EventRoute, QueueFullPolicy},
    sink::SinkControl,
    status::Status,
};

/**
The name given to background consumer threads.
*/
pub const CONSUMER_THREAD_NAME: &str = "emit_async_consumer";

pub(crate) enum Item {
    Event(EventEnvelope),
    Shutdown,
}

/**
The lifecycle state of a [`Pipeline`].
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /**
    The pipeline isn't running. Events are dispatched synchronously.
    */
    Stopped,
    /**
    The background consumer is being spawned.
    */
    Starting,
    /**
    Events are published to the queue and dispatched by the background consumer.
    */
    Running,
    /**
    The pipeline is stopping. New events are dispatched synchronously while the background consumer drains the queue.
    */
    Draining,
}

impl State {
    const fn to_u8(self) -> u8 {
        match self {
            State::Stopped => 0,
            State::Starting => 1,
            State::Running => 2,
            State::Draining => 3,
        }
    }

    const fn from_u8(state: u8) -> State {
        match state {
            1 => State::Starting,
            2 => State::Running,
            3 => State::Draining,
            _ => State::Stopped,
        }
    }
}

/**
What happened to a published event.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /**
    The event was published to the queue.
    */
    Enqueued,
    /**
    The event was dispatched to sinks on the calling thread.
    */
    Synchronous,
    /**
    The queue was full and the event was discarded by the queue-full policy.
    */
    Discarded,
    /**
    The queue was full and the event was dispatched to the error sink.
    */
    ErrorSink,
    /**
    The queue was full, there's no error sink, and the event was dropped.
    */
    Dropped,
    /**
    The message of the event couldn't be rendered, so it wasn't published.
    */
    Rejected,
    /**
    Waiting for space in the queue was cancelled.

    If the pipeline has an error sink, the event was dispatched to it.
    */
    Interrupted,
}

impl Delivery {
    /**
    Whether the event was received, or will be received, by the pipeline's sinks.
    */
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Enqueued | Delivery::Synchronous)
    }
}

/**
An asynchronous event pipeline.

Pipelines are created through [`crate::setup`].
*/
pub struct Pipeline {
    shared: Arc<Shared>,
    consumer: Mutex<Option<JoinHandle<Consumer<Item>>>>,
}

pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) sinks: Vec<SinkControl>,
    pub(crate) error_sink: Option<SinkControl>,
    pub(crate) policy: Box<dyn QueueFullPolicy>,
    pub(crate) ctxt: Box<dyn ContextProvider + Send + Sync>,
    pub(crate) status: Status,
    pub(crate) metrics: Arc<InternalMetrics>,
    pub(crate) in_flight: AtomicUsize,
    pub(crate) stop_requested: AtomicBool,
    state: AtomicU8,
    queue: OnceLock<Producer<Item>>,
    background: OnceLock<ThreadId>,
    enqueue_lock: Mutex<()>,
    watchers: Mutex<Watchers>,
    consumer_exited: Trigger,
    drop_reported: AtomicBool,
}

#[derive(Default)]
struct Watchers {
    flushed_through: u64,
    pending: Vec<(u64, Box<dyn FnOnce() + Send>)>,
}

impl Pipeline {
    pub(crate) fn new(
        config: Config,
        sinks: Vec<SinkControl>,
        error_sink: Option<SinkControl>,
        policy: Box<dyn QueueFullPolicy>,
        ctxt: Box<dyn ContextProvider + Send + Sync>,
        status: Status,
    ) -> Self {
        Pipeline {
            shared: Arc::new(Shared {
                config,
                sinks,
                error_sink,
                policy,
                ctxt,
                status,
                metrics: Arc::new(InternalMetrics::default()),
                in_flight: AtomicUsize::new(0),
                stop_requested: AtomicBool::new(false),
                state: AtomicU8::new(State::Stopped.to_u8()),
                queue: OnceLock::new(),
                background: OnceLock::new(),
                enqueue_lock: Mutex::new(()),
                watchers: Mutex::new(Watchers::default()),
                consumer_exited: Trigger::new(),
                drop_reported: AtomicBool::new(false),
            }),
            consumer: Mutex::new(None),
        }
    }

    /**
    Allocate the queue and spawn the background consumer.

    A pipeline can only be started once. If the consumer thread can't be spawned, the pipeline stays stopped and keeps dispatching events synchronously.
    */
    pub fn start(&self) -> Result<(), Error> {
        let shared = &self.shared;

        if shared.queue.get().is_some() || !shared.transition(State::Stopped, State::Starting) {
            return Err(Error::new("the pipeline has already been started"));
        }

        let (producer, queue) = match emit_async_ring::ring(shared.config.capacity()) {
            Ok(ring) => ring,
            Err(err) => {
                shared.set_state(State::Stopped);

                return Err(err.into());
            }
        };

        let spawn = thread::Builder::new()
            .name(CONSUMER_THREAD_NAME.into())
            .spawn({
                let shared = shared.clone();
                let exited = shared.consumer_exited.clone();

                move || {
                    let _exited = OnExit(exited);

                    consumer::run(shared, queue)
                }
            });

        match spawn {
            Ok(handle) => {
                let _ = shared.background.set(handle.thread().id());
                *lock(&self.consumer) = Some(handle);

                let _ = shared.queue.set(producer);
                shared.set_state(State::Running);

                Ok(())
            }
            Err(err) => {
                shared.set_state(State::Stopped);

                shared.metrics.spawn_failed.increment();
                shared.status.error(format_args!(
                    "failed to spawn the background consumer; events will be dispatched synchronously: {err}"
                ));

                Err(Error::new(err))
            }
        }
    }

    /**
    Stop the pipeline, waiting up to `timeout` for the queue to drain.

    New events are dispatched synchronously from the moment this method is called. Events already in the queue are dispatched by the background consumer, which is then joined. Any events left in the queue after that are dispatched on the calling thread.

    This method returns `true` if the pipeline stopped within the timeout. If it timed out, a warning is sent to the status channel and producers waiting for space stop waiting. The background consumer keeps draining the queue, and this method can be called again to wait for it.
    */
    pub fn stop(&self, timeout: Duration) -> bool {
        let shared = &*self.shared;

        let Some(queue) = shared.queue.get() else {
            return true;
        };

        if shared.transition(State::Running, State::Draining) {
            shared.stop_requested.store(true, Ordering::SeqCst);

            // Wake the consumer if it's parked; otherwise it'll see the stop request after its current batch
            if queue.is_empty() {
                let _ = queue.try_publish(Item::Shutdown);
            }
        }

        if shared.is_background() {
            shared.status.warn(
                "the pipeline can't be stopped from its own background consumer; it will keep draining",
            );

            return false;
        }

        if !shared.consumer_exited.wait_timeout(timeout) {
            shared.status.warn(format_args!(
                "timed out after {timeout:?} waiting for the queue to drain; {} events are still queued",
                queue.len()
            ));

            queue.close();

            return false;
        }

        self.finish_stop(queue);

        true
    }

    fn finish_stop(&self, queue: &Producer<Item>) {
        let shared = &*self.shared;

        // Another caller may have already joined the consumer
        let Some(handle) = lock(&self.consumer).take() else {
            return;
        };

        queue.close();

        match handle.join() {
            Ok(mut consumer) => {
                let mut residual = Vec::new();
                consumer.drain_into(&mut residual, usize::MAX);

                if !residual.is_empty() {
                    consumer::process_batch(shared, &mut residual, true);
                }
            }
            Err(_) => {
                shared
                    .status
                    .error("the background consumer panicked; queued events may have been lost");
            }
        }

        shared.flushed_through(u64::MAX);
        shared.set_state(State::Stopped);

        let discarded = shared.policy.discard_count();
        if discarded > 0 {
            shared.status.info(format_args!(
                "the {} queue-full policy discarded {discarded} events",
                shared.policy.name()
            ));
        }
    }

    /**
    Publish an event.

    The returned [`Delivery`] reports what happened to the event. This method never fails or panics because of a sink or a full queue.
    */
    pub fn publish(&self, evt: EventEnvelope) -> Delivery {
        self.publish_cancellable(evt, &Cancel::never())
    }

    /**
    Publish an event, giving up on waiting for space in the queue if `cancel` fires.

    If the wait is cancelled, the event is dispatched to the error sink if there is one, and [`Delivery::Interrupted`] is returned.
    */
    pub fn publish_cancellable(&self, mut evt: EventEnvelope, cancel: &Cancel) -> Delivery {
        let shared = &*self.shared;
        let depth = RecursionGuard::enter();

        let Some(queue) = shared.running_queue() else {
            return shared.dispatch_while_stopped(evt);
        };

        // The consumer won't exit while any producer is between here and publishing
        let in_flight = InFlight::enter(&shared.in_flight);

        if shared.state() != State::Running {
            drop(in_flight);

            return shared.dispatch_while_stopped(evt);
        }

        if shared.config.format_eagerly() {
            if let Err(err) = evt.message.render() {
                shared.metrics.capture_failed.increment();
                shared.status.error(format_args!(
                    "failed to format an event from `{}`, so it wasn't logged: {err}",
                    evt.logger()
                ));

                return Delivery::Rejected;
            }
        }

        if let Some(claim) = queue.try_claim() {
            evt.sequence = Some(claim.sequence());
            claim.publish(Item::Event(evt));

            return Delivery::Enqueued;
        }

        shared.queue_full(queue, evt, depth.depth(), cancel, in_flight)
    }

    /**
    Call `on_flushed` once every event published before this call has been dispatched.

    If the pipeline isn't running, `on_flushed` is called immediately.
    */
    pub fn when_flushed(&self, on_flushed: impl FnOnce() + Send + 'static) {
        let shared = &*self.shared;

        if let Some(queue) = shared.queue.get() {
            let target = queue.position();

            let mut watchers = lock(&shared.watchers);

            if watchers.flushed_through < target {
                watchers.pending.push((target, Box::new(on_flushed)));

                return;
            }
        }

        on_flushed();
    }

    /**
    Block for up to `timeout`, waiting for every event published before this call to be dispatched and for sinks to flush.

    This method returns `true` if the flush completed, and `false` if it timed out.
    */
    pub fn blocking_flush(&self, timeout: Duration) -> bool {
        let shared = &*self.shared;
        let start = Instant::now();

        // The consumer can't wait for itself
        if !shared.is_background() {
            let flushed = Trigger::new();

            self.when_flushed({
                let flushed = flushed.clone();

                move || flushed.trigger()
            });

            if !flushed.wait_timeout(timeout) {
                return false;
            }
        }

        let remaining = timeout.saturating_sub(start.elapsed());

        let mut flushed = true;
        for sink in shared.sinks.iter().chain(shared.error_sink.iter()) {
            flushed &= sink.blocking_flush_guarded(remaining);
        }

        flushed
    }

    /**
    Create a [`Logger`] that publishes to this pipeline.
    */
    pub fn logger(self: &Arc<Self>, name: impl Into<Arc<str>>) -> Logger {
        Logger::new(name, self.clone())
    }

    /**
    The current lifecycle state.
    */
    pub fn state(&self) -> State {
        self.shared.state()
    }

    /**
    Whether events are currently being published to the queue.
    */
    pub fn is_running(&self) -> bool {
        self.state() == State::Running
    }

    /**
    The configuration of the pipeline.
    */
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /**
    The context provider events are captured with.
    */
    pub fn ctxt(&self) -> &(dyn ContextProvider + Send + Sync) {
        &*self.shared.ctxt
    }

    /**
    The status channel of the pipeline.
    */
    pub fn status(&self) -> &Status {
        &self.shared.status
    }

    /**
    The name of the queue-full policy in use.
    */
    pub fn policy_name(&self) -> &str {
        self.shared.policy.name()
    }

    /**
    The number of events discarded by the queue-full policy.
    */
    pub fn discard_count(&self) -> u64 {
        self.shared.policy.discard_count()
    }

    /**
    The id of the background consumer thread, if it's been spawned.
    */
    pub fn consumer_thread(&self) -> Option<ThreadId> {
        self.shared.background.get().copied()
    }

    /**
    Get the metrics produced by the pipeline.
    */
    pub fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            queue: self.shared.queue.get().cloned(),
            metrics: self.shared.metrics.clone(),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop(self.shared.config.shutdown_timeout());
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state())
            .field("policy", &self.policy_name())
            .field("sinks", &self.shared.sinks.len())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl Shared {
    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: State) {
        self.state.store(state.to_u8(), Ordering::SeqCst);
    }

    fn transition(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn running_queue(&self) -> Option<&Producer<Item>> {
        if self.state() != State::Running {
            return None;
        }

        self.queue.get()
    }

    fn is_background(&self) -> bool {
        self.background.get() == Some(&thread::current().id())
    }

    fn queue_full(
        &self,
        queue: &Producer<Item>,
        evt: EventEnvelope,
        depth: usize,
        cancel: &Cancel,
        in_flight: InFlight,
    ) -> Delivery {
        let background = self.background.get().copied();

        // Waiting here could deadlock, so dispatch ahead of the queue
        if depth > 1 || self.is_background() {
            drop(in_flight);

            self.metrics.out_of_order.increment();
            self.status.warn(format_args!(
                "event logged out of order to avoid deadlock: the queue is full and `{}` logged from {}",
                evt.logger(),
                if depth > 1 {
                    "a nested logging call"
                } else {
                    "the background consumer"
                },
            ));

            self.dispatch_sync(evt);

            return Delivery::Synchronous;
        }

        match self.policy.route(background, evt.level()) {
            EventRoute::Discard => {
                self.metrics.queue_full_discarded.increment();

                Delivery::Discarded
            }
            EventRoute::Synchronous => {
                drop(in_flight);

                self.metrics.queue_full_synchronous.increment();
                self.dispatch_sync(evt);

                Delivery::Synchronous
            }
            EventRoute::Enqueue if !self.config.blocking() => {
                drop(in_flight);

                self.full_without_blocking(evt)
            }
            EventRoute::Enqueue => {
                self.metrics.queue_full_enqueued.increment();

                self.enqueue_blocking(queue, evt, cancel, in_flight)
            }
        }
    }

    fn enqueue_blocking(
        &self,
        queue: &Producer<Item>,
        mut evt: EventEnvelope,
        cancel: &Cancel,
        in_flight: InFlight,
    ) -> Delivery {
        let serialized = if self.config.synchronize_enqueue_when_full() {
            Some(lock(&self.enqueue_lock))
        } else {
            None
        };

        match queue.claim_blocking(cancel) {
            Ok(claim) => {
                evt.sequence = Some(claim.sequence());
                claim.publish(Item::Event(evt));

                Delivery::Enqueued
            }
            // The pipeline stopped while we were waiting
            Err(WaitError::Closed) => {
                drop(serialized);
                drop(in_flight);

                self.dispatch_while_stopped(evt)
            }
            Err(WaitError::Cancelled) => {
                drop(serialized);
                drop(in_flight);

                self.metrics.publish_interrupted.increment();
                self.status.warn(format_args!(
                    "interrupted while waiting for space in the queue; an event from `{}` was {}",
                    evt.logger(),
                    if self.error_sink.is_some() {
                        "sent to the error sink"
                    } else {
                        "not logged"
                    }
                ));

                self.dispatch_to_error_sink(evt);

                Delivery::Interrupted
            }
        }
    }

    fn full_without_blocking(&self, evt: EventEnvelope) -> Delivery {
        if self.error_sink.is_some() {
            self.metrics.routed_to_error_sink.increment();
            self.dispatch_to_error_sink(evt);

            return Delivery::ErrorSink;
        }

        self.metrics.dropped.increment();

        if !self.drop_reported.swap(true, Ordering::Relaxed) {
            self.status.warn(
                "the queue is full and the pipeline doesn't block, so events are being dropped",
            );
        }

        Delivery::Dropped
    }

    fn dispatch_to_error_sink(&self, mut evt: EventEnvelope) {
        let Some(ref error_sink) = self.error_sink else {
            return;
        };

        consumer::render(self, &mut evt);

        if let Err(panic) = error_sink.dispatch_guarded(&evt) {
            self.metrics.sink_panicked.increment();

            if error_sink.first_panic() {
                self.status.error(format_args!(
                    "error sink `{}` panicked and the event was lost: {panic}",
                    error_sink.name()
                ));
            }
        }
    }

    fn dispatch_while_stopped(&self, evt: EventEnvelope) -> Delivery {
        self.metrics.dispatched_while_stopped.increment();
        self.dispatch_sync(evt);

        Delivery::Synchronous
    }

    fn dispatch_sync(&self, mut evt: EventEnvelope) {
        consumer::render(self, &mut evt);
        consumer::dispatch(self, &evt);
    }

    pub(crate) fn flushed_through(&self, position: u64) {
        let ready = {
            let mut watchers = lock(&self.watchers);

            watchers.flushed_through = watchers.flushed_through.max(position);
            let through = watchers.flushed_through;

            let (ready, pending): (Vec<_>, Vec<_>) = mem::take(&mut watchers.pending)
                .into_iter()
                .partition(|(target, _)| *target <= through);

            watchers.pending = pending;

            ready
        };

        for (_, on_flushed) in ready {
            let _ = panic::catch_unwind(AssertUnwindSafe(on_flushed));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct OnExit(Trigger);

impl Drop for OnExit {
    fn drop(&mut self) {
        self.0.trigger();
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(in_flight: &'a AtomicUsize) -> Self {
        in_flight.fetch_add(1, Ordering::SeqCst);

        InFlight(in_flight)
    }
}

impl<'a> Drop for InFlight<'a> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

// Tracks how deeply logging calls are nested on the current thread
struct RecursionGuard(usize);

impl RecursionGuard {
    fn enter() -> Self {
        let depth = DEPTH.with(|depth| {
            let next = depth.get() + 1;
            depth.set(next);

            next
        });

        RecursionGuard(depth)
    }

    fn depth(&self) -> usize {
        self.0
    }
}

impl Drop for RecursionGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

#[cfg(test)]
mod tests;
