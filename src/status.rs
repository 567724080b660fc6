/*!
Diagnostics about pipelines themselves.

Problems inside a pipeline, like a sink panicking or an event being logged out of order, can't be reported through the pipeline itself. They're sent to a separate status channel instead. Each [`crate::Pipeline`] has a [`Status`] that fans messages out to any number of [`StatusListener`]s.

By default, status messages are kept in the process-wide [`global`] buffer and forwarded to the [`log`] crate under the `emit_async` target.
*/

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, LazyLock, Mutex},
    time::SystemTime,
};

use crate::level::Level;

/**
The target status messages are forwarded to the `log` crate with.
*/
pub const LOG_TARGET: &str = "emit_async";

const GLOBAL_CAPACITY: usize = 256;

static GLOBAL: LazyLock<Buffer> = LazyLock::new(|| Buffer::new(GLOBAL_CAPACITY));

/**
The process-wide buffer of recent status messages.
*/
pub fn global() -> &'static Buffer {
    &GLOBAL
}

/**
A single status message.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusData {
    level: Level,
    message: String,
    timestamp: SystemTime,
}

impl StatusData {
    /**
    Create a status message.
    */
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        StatusData {
            level,
            message: message.into(),
            timestamp: SystemTime::now(),
        }
    }

    /**
    The severity of the message.
    */
    pub fn level(&self) -> Level {
        self.level
    }

    /**
    The text of the message.
    */
    pub fn message(&self) -> &str {
        &self.message
    }

    /**
    The time the message was produced.
    */
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

impl fmt::Display for StatusData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.level, self.message)
    }
}

/**
A receiver of status messages.
*/
pub trait StatusListener: Send + Sync {
    /**
    Receive a status message.
    */
    fn status(&self, data: &StatusData);
}

impl<T: StatusListener + ?Sized> StatusListener for Arc<T> {
    fn status(&self, data: &StatusData) {
        (**self).status(data)
    }
}

impl<T: StatusListener + ?Sized> StatusListener for &'static T {
    fn status(&self, data: &StatusData) {
        (**self).status(data)
    }
}

/**
A [`StatusListener`] that keeps the most recent messages in memory.
*/
#[derive(Debug)]
pub struct Buffer {
    max_entries: usize,
    entries: Mutex<VecDeque<StatusData>>,
}

impl Buffer {
    /**
    Create a buffer that keeps up to `max_entries` messages.

    Once the buffer is full, the oldest messages are discarded.
    */
    pub fn new(max_entries: usize) -> Self {
        Buffer {
            max_entries,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /**
    Get a copy of the messages currently in the buffer, from oldest to newest.
    */
    pub fn entries(&self) -> Vec<StatusData> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    /**
    Count the messages in the buffer whose text contains `pattern`.
    */
    pub fn count_containing(&self, pattern: &str) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.message.contains(pattern))
            .count()
    }

    /**
    Remove all messages from the buffer.
    */
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

impl StatusListener for Buffer {
    fn status(&self, data: &StatusData) {
        if self.max_entries == 0 {
            return;
        }

        let mut entries = self.entries.lock().unwrap();

        while entries.len() >= self.max_entries {
            entries.pop_front();
        }

        entries.push_back(data.clone());
    }
}

/**
A [`StatusListener`] that forwards messages to the [`log`] crate.
*/
#[derive(Debug, Clone, Copy, Default)]
pub struct LogForwarder;

impl StatusListener for LogForwarder {
    fn status(&self, data: &StatusData) {
        log::log!(target: LOG_TARGET, data.level.to_log(), "{}", data.message);
    }
}

/**
The status channel of a pipeline.
*/
#[derive(Clone)]
pub struct Status {
    listeners: Vec<Arc<dyn StatusListener>>,
}

impl Default for Status {
    fn default() -> Self {
        Status::new()
            .with(global())
            .with(LogForwarder)
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Status {
    /**
    Create a status channel without any listeners.
    */
    pub fn new() -> Self {
        Status {
            listeners: Vec::new(),
        }
    }

    /**
    Add a listener to the channel.
    */
    pub fn with(mut self, listener: impl StatusListener + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /**
    Send a message to all listeners.
    */
    pub fn emit(&self, level: Level, message: impl fmt::Display) {
        let data = StatusData::new(level, message.to_string());

        for listener in &self.listeners {
            listener.status(&data);
        }
    }

    pub(crate) fn warn(&self, message: impl fmt::Display) {
        self.emit(Level::Warn, message)
    }

    pub(crate) fn error(&self, message: impl fmt::Display) {
        self.emit(Level::Error, message)
    }

    pub(crate) fn info(&self, message: impl fmt::Display) {
        self.emit(Level::Info, message)
    }
}
