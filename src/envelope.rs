/*!
The [`EventEnvelope`] type.

An envelope carries everything about a single log event from the thread that logged it to the sinks that receive it. Envelopes are built on the producing thread, moved into a ring buffer slot, and moved back out by the background consumer. Once an envelope has been published, the producer no longer owns it, so it can't be changed underneath the consumer.
*/

use std::{
    cell::OnceCell,
    error, fmt,
    panic::Location,
    sync::{Arc, LazyLock},
    thread::{self, ThreadId},
    time::{Instant, SystemTime},
};

use value_bag::{OwnedValueBag, ValueBag};

use crate::{
    ctxt::{ContextProvider, ContextSnapshot},
    level::Level,
    message::Message,
};

/**
A single log event.
*/
pub struct EventEnvelope {
    pub(crate) sequence: Option<u64>,
    pub(crate) end_of_batch: bool,
    logger: Arc<str>,
    level: Level,
    pub(crate) message: Message,
    marker: Option<Marker>,
    ctxt: ContextSnapshot,
    thread: ThreadInfo,
    timestamp: SystemTime,
    nanos: u64,
    location: Option<&'static Location<'static>>,
    thrown: Option<Thrown>,
    pub(crate) props: Vec<(Arc<str>, OwnedValueBag)>,
}

impl EventEnvelope {
    /**
    Capture a new event on the calling thread.

    The current time and thread are recorded, along with a snapshot of the context in `ctxt`.
    */
    pub fn capture(
        logger: impl Into<Arc<str>>,
        level: Level,
        message: impl Into<Message>,
        ctxt: &(impl ContextProvider + ?Sized),
    ) -> Self {
        EventEnvelope {
            sequence: None,
            end_of_batch: false,
            logger: logger.into(),
            level,
            message: message.into(),
            marker: None,
            ctxt: ctxt.snapshot(),
            thread: ThreadInfo::current(),
            timestamp: SystemTime::now(),
            nanos: monotonic_nanos(),
            location: None,
            thrown: None,
            props: Vec::new(),
        }
    }

    /**
    Attach a marker to the event.
    */
    pub fn with_marker(mut self, marker: impl Into<Marker>) -> Self {
        self.marker = Some(marker.into());
        self
    }

    /**
    Attach a structured property to the event.

    The value is converted into an owned representation so it can be sent to the background consumer.
    */
    pub fn with_prop<'v>(mut self, key: impl Into<Arc<str>>, value: impl Into<ValueBag<'v>>) -> Self {
        self.props.push((key.into(), value.into().to_owned()));
        self
    }

    /**
    Attach an error to the event.

    The message of the error and each of its sources are captured as text.
    */
    pub fn with_thrown(mut self, err: &(dyn error::Error + 'static)) -> Self {
        self.thrown = Some(Thrown::capture(err));
        self
    }

    /**
    Attach the source location the event was logged from.
    */
    pub fn with_location(mut self, location: &'static Location<'static>) -> Self {
        self.location = Some(location);
        self
    }

    /**
    The sequence number assigned when the event was published to the queue.

    Events that were dispatched without passing through the queue don't have a sequence number.
    */
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /**
    Whether this event was the last one in a batch drained by the background consumer.

    Sinks can use this flag to decide when to flush any buffered output.
    */
    pub fn is_end_of_batch(&self) -> bool {
        self.end_of_batch
    }

    /**
    The name of the logger the event was logged through.
    */
    pub fn logger(&self) -> &str {
        &self.logger
    }

    /**
    The severity of the event.
    */
    pub fn level(&self) -> Level {
        self.level
    }

    /**
    The message of the event.

    By the time an event reaches a sink, its message has been rendered.
    */
    pub fn message(&self) -> &Message {
        &self.message
    }

    /**
    The rendered message text.

    If the message hasn't been rendered, this method returns an empty string.
    */
    pub fn message_text(&self) -> &str {
        self.message.as_text().unwrap_or("")
    }

    /**
    The marker attached to the event, if any.
    */
    pub fn marker(&self) -> Option<&Marker> {
        self.marker.as_ref()
    }

    /**
    The context captured when the event was logged.
    */
    pub fn ctxt(&self) -> &ContextSnapshot {
        &self.ctxt
    }

    /**
    The thread the event was logged on.
    */
    pub fn thread(&self) -> &ThreadInfo {
        &self.thread
    }

    /**
    The wall-clock time the event was logged at.
    */
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /**
    A monotonic timestamp in nanoseconds.

    Monotonic timestamps are only comparable between events logged by the same process.
    */
    pub fn nanos(&self) -> u64 {
        self.nanos
    }

    /**
    The source location the event was logged from, if it was captured.
    */
    pub fn location(&self) -> Option<&'static Location<'static>> {
        self.location
    }

    /**
    The error attached to the event, if any.
    */
    pub fn thrown(&self) -> Option<&Thrown> {
        self.thrown.as_ref()
    }

    /**
    Iterate over the structured properties of the event, in the order they were attached.
    */
    pub fn props(&self) -> impl Iterator<Item = (&str, ValueBag<'_>)> {
        self.props.iter().map(|(k, v)| (&**k, v.by_ref()))
    }

    /**
    Get the value of a structured property.

    If the same key was attached more than once, the first value is returned.
    */
    pub fn prop(&self, key: &str) -> Option<ValueBag<'_>> {
        self.props
            .iter()
            .find(|(k, _)| &**k == key)
            .map(|(_, v)| v.by_ref())
    }
}

impl fmt::Debug for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEnvelope")
            .field("sequence", &self.sequence)
            .field("logger", &self.logger)
            .field("level", &self.level)
            .field("message", &self.message)
            .field("marker", &self.marker)
            .field("ctxt", &self.ctxt)
            .field("thread", &self.thread)
            .field("timestamp", &self.timestamp)
            .field("location", &self.location)
            .field("thrown", &self.thrown)
            .field("end_of_batch", &self.end_of_batch)
            .finish_non_exhaustive()
    }
}

/**
A named tag that can be attached to events.
*/
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Marker(Arc<str>);

impl Marker {
    /**
    Create a marker with the given name.
    */
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Marker(name.into())
    }

    /**
    The name of the marker.
    */
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl<'a> From<&'a str> for Marker {
    fn from(name: &'a str) -> Self {
        Marker::new(name)
    }
}

impl From<String> for Marker {
    fn from(name: String) -> Self {
        Marker::new(name)
    }
}

impl fmt::Debug for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/**
The thread an event was logged on.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    id: ThreadId,
    name: Option<Arc<str>>,
}

impl ThreadInfo {
    /**
    Get the info for the calling thread.
    */
    pub fn current() -> Self {
        thread_local! {
            static CURRENT: OnceCell<ThreadInfo> = const { OnceCell::new() };
        }

        CURRENT.with(|current| {
            current
                .get_or_init(|| {
                    let thread = thread::current();

                    ThreadInfo {
                        id: thread.id(),
                        name: thread.name().map(Into::into),
                    }
                })
                .clone()
        })
    }

    /**
    The id of the thread.
    */
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /**
    The name of the thread, if it has one.
    */
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/**
An error captured on an event.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thrown {
    message: String,
    sources: Vec<String>,
}

impl Thrown {
    fn capture(err: &(dyn error::Error + 'static)) -> Self {
        let mut sources = Vec::new();

        let mut source = err.source();
        while let Some(err) = source {
            sources.push(err.to_string());
            source = err.source();
        }

        Thrown {
            message: err.to_string(),
            sources,
        }
    }

    /**
    The message of the error.
    */
    pub fn message(&self) -> &str {
        &self.message
    }

    /**
    The messages of the error's sources, from the nearest to the root cause.
    */
    pub fn sources(&self) -> &[String] {
        &self.sources
    }
}

impl fmt::Display for Thrown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;

        for source in &self.sources {
            write!(f, ": {source}")?;
        }

        Ok(())
    }
}

static ANCHOR: LazyLock<Instant> = LazyLock::new(Instant::now);

fn monotonic_nanos() -> u64 {
    ANCHOR.elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::ctxt::{Empty, ThreadLocalCtxt};

    #[derive(Debug)]
    struct Outer(Inner);

    #[derive(Debug)]
    struct Inner;

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("outer")
        }
    }

    impl fmt::Display for Inner {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("inner")
        }
    }

    impl error::Error for Outer {
        fn source(&self) -> Option<&(dyn error::Error + 'static)> {
            Some(&self.0)
        }
    }

    impl error::Error for Inner {}

    #[test]
    fn capture() {
        let evt = EventEnvelope::capture("app", Level::Warn, "hello", &Empty)
            .with_marker("AUDIT")
            .with_prop("count", 42)
            .with_prop("user", "alice")
            .with_thrown(&Outer(Inner))
            .with_location(Location::caller());

        assert_eq!(None, evt.sequence());
        assert!(!evt.is_end_of_batch());
        assert_eq!("app", evt.logger());
        assert_eq!(Level::Warn, evt.level());
        assert_eq!("hello", evt.message_text());
        assert_eq!("AUDIT", evt.marker().unwrap().name());
        assert_eq!(thread::current().id(), evt.thread().id());
        assert!(evt.location().is_some());

        assert_eq!(Some(42), evt.prop("count").and_then(|v| v.to_i64()));
        assert_eq!(
            Some("alice".to_owned()),
            evt.prop("user").map(|v| v.to_string())
        );
        assert_eq!(
            vec!["count", "user"],
            evt.props().map(|(k, _)| k).collect::<Vec<_>>()
        );

        let thrown = evt.thrown().unwrap();
        assert_eq!("outer", thrown.message());
        assert_eq!(&["inner".to_owned()], thrown.sources());
        assert_eq!("outer: inner", thrown.to_string());
    }

    #[test]
    fn capture_snapshots_ctxt() {
        let ctxt = ThreadLocalCtxt::new();

        ctxt.put("request", "1");

        let evt = EventEnvelope::capture("app", Level::Info, "hello", &ctxt);

        ctxt.put("request", "2");

        assert_eq!(Some("1"), evt.ctxt().get("request"));
    }

    #[test]
    fn monotonic_timestamps() {
        let a = EventEnvelope::capture("app", Level::Info, "a", &Empty);
        let b = EventEnvelope::capture("app", Level::Info, "b", &Empty);

        assert!(b.nanos() >= a.nanos());
    }

    #[test]
    fn thread_name() {
        thread::Builder::new()
            .name("named".into())
            .spawn(|| {
                let evt = EventEnvelope::capture("app", Level::Info, "a", &Empty);

                assert_eq!(Some("named"), evt.thread().name());
            })
            .unwrap()
            .join()
            .unwrap();
    }
}
