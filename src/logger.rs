/*!
The [`Logger`] type.

A logger is a named handle to a [`Pipeline`]. Loggers are cheap to clone and can be shared freely between threads.

```
use std::time::Duration;

use emit_async::{Level, Logger};

let pipeline = std::sync::Arc::new(emit_async::setup().spawn());
let logger = pipeline.logger("app::orders");

logger.info("processing an order");

logger
    .event(Level::Warn)
    .marker("billing")
    .prop("order_id", 42)
    .log("order is overdue");

pipeline.stop(Duration::from_secs(5));
```
*/

use std::{error::Error, fmt, panic::Location, sync::Arc};

use emit_async_ring::Cancel;
use value_bag::{OwnedValueBag, ValueBag};

use crate::{
    envelope::{EventEnvelope, Marker},
    level::Level,
    message::Message,
    pipeline::{Delivery, Pipeline},
};

/**
A named source of events.
*/
#[derive(Clone)]
pub struct Logger {
    name: Arc<str>,
    pipeline: Arc<Pipeline>,
}

impl Logger {
    /**
    Create a logger that publishes to `pipeline`.
    */
    pub fn new(name: impl Into<Arc<str>>, pipeline: Arc<Pipeline>) -> Self {
        Logger {
            name: name.into(),
            pipeline,
        }
    }

    /**
    The name of the logger.
    */
    pub fn name(&self) -> &str {
        &self.name
    }

    /**
    The pipeline the logger publishes to.
    */
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /**
    Log an event at the given level.
    */
    #[track_caller]
    pub fn log(&self, level: Level, message: impl Into<Message>) -> Delivery {
        self.event(level).log(message)
    }

    /**
    Log an event at [`Level::Trace`].
    */
    #[track_caller]
    pub fn trace(&self, message: impl Into<Message>) -> Delivery {
        self.log(Level::Trace, message)
    }

    /**
    Log an event at [`Level::Debug`].
    */
    #[track_caller]
    pub fn debug(&self, message: impl Into<Message>) -> Delivery {
        self.log(Level::Debug, message)
    }

    /**
    Log an event at [`Level::Info`].
    */
    #[track_caller]
    pub fn info(&self, message: impl Into<Message>) -> Delivery {
        self.log(Level::Info, message)
    }

    /**
    Log an event at [`Level::Warn`].
    */
    #[track_caller]
    pub fn warn(&self, message: impl Into<Message>) -> Delivery {
        self.log(Level::Warn, message)
    }

    /**
    Log an event at [`Level::Error`].
    */
    #[track_caller]
    pub fn error(&self, message: impl Into<Message>) -> Delivery {
        self.log(Level::Error, message)
    }

    /**
    Log an event at [`Level::Fatal`].
    */
    #[track_caller]
    pub fn fatal(&self, message: impl Into<Message>) -> Delivery {
        self.log(Level::Fatal, message)
    }

    /**
    Start building an event at the given level.

    The event is captured when [`EventBuilder::log`] is called.
    */
    #[track_caller]
    pub fn event(&self, level: Level) -> EventBuilder<'_> {
        EventBuilder {
            logger: self,
            level,
            location: Location::caller(),
            marker: None,
            props: Vec::new(),
            thrown: None,
            cancel: None,
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").field("name", &self.name).finish()
    }
}

/**
A builder for an event with a marker, properties, or an error.

This type is returned by [`Logger::event`].
*/
#[must_use = "call `.log()` to log the event"]
pub struct EventBuilder<'a> {
    logger: &'a Logger,
    level: Level,
    location: &'static Location<'static>,
    marker: Option<Marker>,
    props: Vec<(Arc<str>, OwnedValueBag)>,
    thrown: Option<&'a (dyn Error + 'static)>,
    cancel: Option<&'a Cancel>,
}

impl<'a> EventBuilder<'a> {
    /**
    Attach a marker to the event.
    */
    pub fn marker(mut self, marker: impl Into<Marker>) -> Self {
        self.marker = Some(marker.into());
        self
    }

    /**
    Attach a structured property to the event.
    */
    pub fn prop<'v>(mut self, key: impl Into<Arc<str>>, value: impl Into<ValueBag<'v>>) -> Self {
        self.props.push((key.into(), value.into().to_owned()));
        self
    }

    /**
    Attach an error to the event.
    */
    pub fn thrown(mut self, err: &'a (dyn Error + 'static)) -> Self {
        self.thrown = Some(err);
        self
    }

    /**
    Stop waiting for space in the queue if `cancel` fires.
    */
    pub fn cancel(mut self, cancel: &'a Cancel) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /**
    Capture the event and publish it.
    */
    pub fn log(self, message: impl Into<Message>) -> Delivery {
        let pipeline = &self.logger.pipeline;

        let mut evt = EventEnvelope::capture(
            self.logger.name.clone(),
            self.level,
            message,
            pipeline.ctxt(),
        );

        if pipeline.config().include_location() {
            evt = evt.with_location(self.location);
        }

        if let Some(marker) = self.marker {
            evt = evt.with_marker(marker);
        }

        if let Some(err) = self.thrown {
            evt = evt.with_thrown(err);
        }

        evt.props.extend(self.props);

        match self.cancel {
            Some(cancel) => pipeline.publish_cancellable(evt, cancel),
            None => pipeline.publish(evt),
        }
    }
}
