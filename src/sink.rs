/*!
The [`Sink`] type.

Sinks are the receivers of finalized [`EventEnvelope`]s. A typical sink will format events and write them to some outside destination, like a file, a socket, or the console.

Sinks are called from the background consumer thread, or from the logging thread when an event is dispatched synchronously. They may be called from several threads at once and must not block indefinitely.
*/

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{envelope::EventEnvelope, level::Level, message};

/**
A destination for log events.
*/
pub trait Sink {
    /**
    Receive an event.

    By the time an event is dispatched its message has been rendered.
    */
    fn dispatch(&self, evt: &EventEnvelope);

    /**
    Block for up to `timeout`, waiting for all events dispatched up to this point to be fully processed.

    This method returns `true` if the flush completed, and `false` if it timed out.
    */
    fn blocking_flush(&self, timeout: Duration) -> bool {
        let _ = timeout;

        true
    }

    /**
    Dispatch events to both `self` and `other`.
    */
    fn and_to<U>(self, other: U) -> And<Self, U>
    where
        Self: Sized,
    {
        And {
            left: self,
            right: other,
        }
    }
}

impl<'a, T: Sink + ?Sized> Sink for &'a T {
    fn dispatch(&self, evt: &EventEnvelope) {
        (**self).dispatch(evt)
    }

    fn blocking_flush(&self, timeout: Duration) -> bool {
        (**self).blocking_flush(timeout)
    }
}

impl<'a, T: Sink + ?Sized + 'a> Sink for Box<T> {
    fn dispatch(&self, evt: &EventEnvelope) {
        (**self).dispatch(evt)
    }

    fn blocking_flush(&self, timeout: Duration) -> bool {
        (**self).blocking_flush(timeout)
    }
}

impl<'a, T: Sink + ?Sized + 'a> Sink for Arc<T> {
    fn dispatch(&self, evt: &EventEnvelope) {
        (**self).dispatch(evt)
    }

    fn blocking_flush(&self, timeout: Duration) -> bool {
        (**self).blocking_flush(timeout)
    }
}

impl<T: Sink> Sink for Option<T> {
    fn dispatch(&self, evt: &EventEnvelope) {
        match self {
            Some(target) => target.dispatch(evt),
            None => Empty.dispatch(evt),
        }
    }

    fn blocking_flush(&self, timeout: Duration) -> bool {
        match self {
            Some(target) => target.blocking_flush(timeout),
            None => Empty.blocking_flush(timeout),
        }
    }
}

/**
A [`Sink`] that discards everything.
*/
#[derive(Debug, Clone, Copy, Default)]
pub struct Empty;

impl Sink for Empty {
    fn dispatch(&self, _: &EventEnvelope) {}
}

/**
A [`Sink`] from a function.

This type can be created directly, or via [`from_fn`].
*/
pub struct FromFn<F>(F);

impl<F> FromFn<F> {
    /**
    Wrap the given sink function.
    */
    pub const fn new(sink: F) -> FromFn<F> {
        FromFn(sink)
    }
}

impl<F: Fn(&EventEnvelope)> Sink for FromFn<F> {
    fn dispatch(&self, evt: &EventEnvelope) {
        (self.0)(evt)
    }
}

/**
Create a [`Sink`] from a function.

The input function is assumed not to perform any background work that needs flushing.
*/
pub fn from_fn<F: Fn(&EventEnvelope)>(f: F) -> FromFn<F> {
    FromFn::new(f)
}

/**
A [`Sink`] that dispatches to two others.

This type is returned by [`Sink::and_to`].
*/
pub struct And<T, U> {
    left: T,
    right: U,
}

impl<T: Sink, U: Sink> Sink for And<T, U> {
    fn dispatch(&self, evt: &EventEnvelope) {
        self.left.dispatch(evt);
        self.right.dispatch(evt);
    }

    fn blocking_flush(&self, timeout: Duration) -> bool {
        // Give each side an equal share of the timeout
        let timeout = timeout / 2;

        let lhs = self.left.blocking_flush(timeout);
        let rhs = self.right.blocking_flush(timeout);

        lhs && rhs
    }
}

/**
A named [`Sink`] with an optional minimum level.

Pipelines dispatch each event to every sink control whose level filter accepts it.
*/
pub struct SinkControl {
    name: Arc<str>,
    min_level: Option<Level>,
    sink: Box<dyn Sink + Send + Sync>,
    panic_reported: AtomicBool,
}

impl SinkControl {
    /**
    Wrap a sink that accepts events at any level.
    */
    pub fn new(name: impl Into<Arc<str>>, sink: impl Sink + Send + Sync + 'static) -> Self {
        SinkControl {
            name: name.into(),
            min_level: None,
            sink: Box::new(sink),
            panic_reported: AtomicBool::new(false),
        }
    }

    /**
    Only dispatch events at `min_level` or more severe.
    */
    pub fn with_min_level(mut self, min_level: Level) -> Self {
        self.min_level = Some(min_level);
        self
    }

    /**
    The name of the sink.
    */
    pub fn name(&self) -> &str {
        &self.name
    }

    /**
    The minimum level of events dispatched to the sink, if any.
    */
    pub fn min_level(&self) -> Option<Level> {
        self.min_level
    }

    /**
    Whether the sink accepts events at the given level.
    */
    pub fn accepts(&self, level: Level) -> bool {
        self.min_level.map(|min| level >= min).unwrap_or(true)
    }

    /**
    Dispatch an event to the sink, containing any panic it raises.

    If the sink panics, the panic message is returned.
    */
    pub(crate) fn dispatch_guarded(&self, evt: &EventEnvelope) -> Result<(), String> {
        panic::catch_unwind(AssertUnwindSafe(|| self.sink.dispatch(evt)))
            .map_err(|payload| message::panic_message(&*payload).to_owned())
    }

    // Only the first panic from each sink is reported
    pub(crate) fn first_panic(&self) -> bool {
        !self.panic_reported.swap(true, Ordering::Relaxed)
    }

    pub(crate) fn blocking_flush_guarded(&self, timeout: Duration) -> bool {
        panic::catch_unwind(AssertUnwindSafe(|| self.sink.blocking_flush(timeout)))
            .unwrap_or(false)
    }
}
