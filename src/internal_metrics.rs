/*!
Internal metrics for pipelines.

Each pipeline counts how events were routed and what went wrong along the way. Counters are sampled through [`PipelineMetrics`], returned by [`crate::Pipeline::metrics`].
*/

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use emit_async_ring::Producer;

use crate::pipeline::Item;

macro_rules! metrics {
    (
        $pub_container:ty {
            $field:ident: $internal_container:ident {
                $(
                    $(#[$meta:meta])*
                    $metric:ident: $ty:ident -> $pub_ty:ident,
                )*
            }
        }
    ) => {
        #[derive(Default)]
        pub(crate) struct $internal_container {
            $(
                $(#[$meta])*
                pub(crate) $metric: $ty,
            )*
        }

        impl $internal_container {
            pub fn sample(&self) -> impl Iterator<Item = Metric> + 'static {
                let $internal_container { $($metric),* } = self;

                [$(
                    Metric {
                        name: stringify!($metric),
                        agg: <$ty>::AGG,
                        value: $metric.sample(),
                    },
                )*]
                .into_iter()
            }
        }

        impl $pub_container {
            $(
                $(#[$meta])*
                pub fn $metric(&self) -> $pub_ty {
                    self.$field.$metric.sample()
                }
            )*
        }
    };
}

#[derive(Default)]
pub(crate) struct Counter(AtomicUsize);

impl Counter {
    const AGG: &'static str = "count";

    pub fn increment(&self) {
        self.increment_by(1);
    }

    pub fn increment_by(&self, by: usize) {
        self.0.fetch_add(by, Ordering::Relaxed);
    }

    pub fn sample(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

metrics!(
    PipelineMetrics {
        metrics: InternalMetrics {
            /**
            An event was dispatched to sinks by the background consumer.
            */
            dispatched: Counter -> usize,
            /**
            The background consumer drained a batch of events.
            */
            batches_processed: Counter -> usize,
            /**
            The queue was full and the event waited for space.
            */
            queue_full_enqueued: Counter -> usize,
            /**
            The queue was full and the event was dispatched synchronously on the logging thread.
            */
            queue_full_synchronous: Counter -> usize,
            /**
            The queue was full and the event was discarded by the queue-full policy.
            */
            queue_full_discarded: Counter -> usize,
            /**
            The queue was full and the event was logged from the background consumer or a nested logging call.

            These events are dispatched synchronously, ahead of events still in the queue.
            */
            out_of_order: Counter -> usize,
            /**
            The queue was full, the pipeline doesn't block, and the event was dropped.
            */
            dropped: Counter -> usize,
            /**
            The queue was full, the pipeline doesn't block, and the event was sent to the error sink.
            */
            routed_to_error_sink: Counter -> usize,
            /**
            Waiting for space in the queue was interrupted.
            */
            publish_interrupted: Counter -> usize,
            /**
            Rendering a message on the logging thread failed, so the event was rejected.
            */
            capture_failed: Counter -> usize,
            /**
            Rendering a message on the background consumer failed, so a fallback was used.
            */
            format_failed: Counter -> usize,
            /**
            A sink panicked while receiving an event.
            */
            sink_panicked: Counter -> usize,
            /**
            An event was dispatched synchronously because the pipeline wasn't running.
            */
            dispatched_while_stopped: Counter -> usize,
            /**
            The background consumer thread couldn't be spawned.

            The pipeline dispatches all events synchronously when this happens.
            */
            spawn_failed: Counter -> usize,
        }
    }
);

/**
A single sampled metric.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metric {
    name: &'static str,
    agg: &'static str,
    value: usize,
}

impl Metric {
    /**
    The name of the metric.
    */
    pub fn name(&self) -> &'static str {
        self.name
    }

    /**
    How the metric is aggregated, like `count`.
    */
    pub fn agg(&self) -> &'static str {
        self.agg
    }

    /**
    The sampled value.
    */
    pub fn value(&self) -> usize {
        self.value
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.name, self.value)
    }
}

/**
Metrics produced by a [`crate::Pipeline`].
*/
#[derive(Clone)]
pub struct PipelineMetrics {
    pub(crate) queue: Option<Producer<Item>>,
    pub(crate) metrics: Arc<InternalMetrics>,
}

impl PipelineMetrics {
    /**
    The number of events currently in the queue.
    */
    pub fn queue_length(&self) -> usize {
        self.queue.as_ref().map(|queue| queue.len()).unwrap_or(0)
    }

    /**
    The number of events the queue can hold.
    */
    pub fn queue_capacity(&self) -> usize {
        self.queue.as_ref().map(|queue| queue.capacity()).unwrap_or(0)
    }

    /**
    Sample all metrics, including the current queue length.
    */
    pub fn sample(&self) -> Vec<Metric> {
        let mut sampled = self.metrics.sample().collect::<Vec<_>>();

        sampled.push(Metric {
            name: "queue_length",
            agg: "last",
            value: self.queue_length(),
        });

        sampled
    }
}
