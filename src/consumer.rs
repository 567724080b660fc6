/*!
The background consumer.

The consumer runs on its own thread for the life of a [`crate::Pipeline`]. It drains batches of events from the queue, renders any deferred messages, and dispatches each event to the pipeline's sinks. When the queue is empty it waits according to the configured [`WaitStrategy`].

The consumer exits once a stop has been requested, the queue is empty, and no producer is part-way through publishing.
*/

use std::{
    hint,
    sync::{atomic::Ordering, Arc},
    thread,
    time::Duration,
};

use crossbeam_utils::Backoff;
use emit_async_ring::Consumer;

use crate::{
    config::WaitStrategy,
    envelope::EventEnvelope,
    pipeline::{Item, Shared},
};

const DRAINING_WAIT: Duration = Duration::from_millis(1);

// Blocking consumers still re-check the stop flag this often
const BLOCK_WAIT: Duration = Duration::from_secs(1);

const SLEEP_WAIT: Duration = Duration::from_micros(100);

pub(crate) fn run(shared: Arc<Shared>, mut queue: Consumer<Item>) -> Consumer<Item> {
    let batch_size = shared.config.batch_size();
    let idle_wait = shared.config.idle_wait();
    let wait_strategy = shared.config.wait_strategy();

    let backoff = Backoff::new();

    let mut batch = Vec::with_capacity(batch_size.min(queue.capacity()));
    let mut flushed = queue.position();

    loop {
        let drained = queue.drain_into(&mut batch, batch_size);

        if drained > 0 {
            let caught_up = !queue.is_ready();

            process_batch(&shared, &mut batch, caught_up);
        }

        // Abandoned claims advance the position without producing events
        let position = queue.position();
        if position != flushed {
            shared.flushed_through(position);
            flushed = position;
        }

        if drained > 0 {
            backoff.reset();
            continue;
        }

        if shared.stop_requested.load(Ordering::SeqCst) {
            if queue.is_empty() && shared.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }

            // A producer is part-way through publishing
            queue.wait_timeout(idle_wait.min(DRAINING_WAIT));
            continue;
        }

        idle(&mut queue, wait_strategy, idle_wait, &backoff);
    }

    // Every published event has been dispatched
    shared.flushed_through(u64::MAX);

    queue
}

fn idle(
    queue: &mut Consumer<Item>,
    strategy: WaitStrategy,
    idle_wait: Duration,
    backoff: &Backoff,
) {
    match strategy {
        WaitStrategy::Block => queue.wait_timeout(BLOCK_WAIT),
        WaitStrategy::Timeout => queue.wait_timeout(idle_wait),
        WaitStrategy::Sleep => {
            if backoff.is_completed() {
                thread::sleep(SLEEP_WAIT);
            } else {
                backoff.snooze();
            }
        }
        WaitStrategy::Yield => {
            if backoff.is_completed() {
                thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
        WaitStrategy::BusySpin => hint::spin_loop(),
    }
}

/**
Render and dispatch a drained batch.

The last event is flagged as the end of a batch only if `caught_up` is set, meaning nothing more was visible in the queue when the batch was drained.
*/
pub(crate) fn process_batch(shared: &Shared, batch: &mut Vec<Item>, caught_up: bool) {
    let last_event = batch
        .iter()
        .rposition(|item| matches!(item, Item::Event(_)))
        .filter(|_| caught_up);

    for (i, item) in batch.drain(..).enumerate() {
        match item {
            Item::Event(mut evt) => {
                evt.end_of_batch = Some(i) == last_event;

                render(shared, &mut evt);
                dispatch(shared, &evt);

                shared.metrics.dispatched.increment();
            }
            // The shutdown sentinel only exists to wake the consumer
            Item::Shutdown => (),
        }
    }

    shared.metrics.batches_processed.increment();
}

pub(crate) fn render(shared: &Shared, evt: &mut EventEnvelope) {
    if let Some(err) = evt.message.render_or_fallback() {
        shared.metrics.format_failed.increment();

        shared.status.error(format_args!(
            "failed to format an event from `{}`: {err}",
            evt.logger()
        ));
    }
}

pub(crate) fn dispatch(shared: &Shared, evt: &EventEnvelope) {
    for sink in &shared.sinks {
        if !sink.accepts(evt.level()) {
            continue;
        }

        if let Err(panic) = sink.dispatch_guarded(evt) {
            shared.metrics.sink_panicked.increment();

            if sink.first_panic() {
                shared.status.error(format_args!(
                    "sink `{}` panicked and the event was lost: {panic}",
                    sink.name()
                ));
            }
        }
    }
}
