/*!
Configuration for pipelines.

A [`Config`] can be built in code, read from `EMIT_ASYNC_*` environment variables with [`Config::from_env`], or, with the `serde` feature, deserialized from a [`RawConfig`].

Configuration read from the environment or deserialized is treated as declarative: capacities below [`MIN_CAPACITY`] are raised to it, and capacities that aren't a power of two are rounded up. Capacities above [`MAX_CAPACITY`] and other invalid values are reported to the status channel and their defaults are used instead.

| Variable | Default |
| -------- | ------- |
| `EMIT_ASYNC_CAPACITY` | `4096` |
| `EMIT_ASYNC_QUEUE_FULL_POLICY` | `Default` |
| `EMIT_ASYNC_DISCARD_THRESHOLD` | `info` |
| `EMIT_ASYNC_FORMAT_EAGERLY` | `true` |
| `EMIT_ASYNC_SHUTDOWN_TIMEOUT_MS` | `5000` |
| `EMIT_ASYNC_BATCH_SIZE` | `256` |
| `EMIT_ASYNC_IDLE_WAIT_MS` | `500` |
| `EMIT_ASYNC_INCLUDE_LOCATION` | `false` |
| `EMIT_ASYNC_BLOCKING` | `true` |
| `EMIT_ASYNC_SYNCHRONIZE_ENQUEUE` | `true` |
| `EMIT_ASYNC_WAIT_STRATEGY` | `Timeout` |
*/

use std::{env, fmt, str::FromStr, time::Duration};

use crate::{level::Level, status::Status};

/**
The default number of events the queue can hold.
*/
pub const DEFAULT_CAPACITY: usize = 4096;

/**
The smallest capacity accepted from declarative configuration.
*/
pub const MIN_CAPACITY: usize = 128;

/**
The largest capacity a queue can have.
*/
pub const MAX_CAPACITY: usize = 1 << 30;

const EMIT_ASYNC_CAPACITY: &str = "EMIT_ASYNC_CAPACITY";
const EMIT_ASYNC_QUEUE_FULL_POLICY: &str = "EMIT_ASYNC_QUEUE_FULL_POLICY";
const EMIT_ASYNC_DISCARD_THRESHOLD: &str = "EMIT_ASYNC_DISCARD_THRESHOLD";
const EMIT_ASYNC_FORMAT_EAGERLY: &str = "EMIT_ASYNC_FORMAT_EAGERLY";
const EMIT_ASYNC_SHUTDOWN_TIMEOUT_MS: &str = "EMIT_ASYNC_SHUTDOWN_TIMEOUT_MS";
const EMIT_ASYNC_BATCH_SIZE: &str = "EMIT_ASYNC_BATCH_SIZE";
const EMIT_ASYNC_IDLE_WAIT_MS: &str = "EMIT_ASYNC_IDLE_WAIT_MS";
const EMIT_ASYNC_INCLUDE_LOCATION: &str = "EMIT_ASYNC_INCLUDE_LOCATION";
const EMIT_ASYNC_BLOCKING: &str = "EMIT_ASYNC_BLOCKING";
const EMIT_ASYNC_SYNCHRONIZE_ENQUEUE: &str = "EMIT_ASYNC_SYNCHRONIZE_ENQUEUE";
const EMIT_ASYNC_WAIT_STRATEGY: &str = "EMIT_ASYNC_WAIT_STRATEGY";

/**
Configuration for a [`crate::Pipeline`].
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    capacity: usize,
    policy: String,
    discard_threshold: Level,
    format_eagerly: bool,
    shutdown_timeout: Duration,
    batch_size: usize,
    idle_wait: Duration,
    include_location: bool,
    blocking: bool,
    synchronize_enqueue_when_full: bool,
    wait_strategy: WaitStrategy,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            capacity: DEFAULT_CAPACITY,
            policy: "Default".to_owned(),
            discard_threshold: Level::Info,
            format_eagerly: true,
            shutdown_timeout: Duration::from_secs(5),
            batch_size: 256,
            idle_wait: Duration::from_millis(500),
            include_location: false,
            blocking: true,
            synchronize_enqueue_when_full: true,
            wait_strategy: WaitStrategy::Timeout,
        }
    }
}

impl Config {
    /**
    Create a configuration with default values.
    */
    pub fn new() -> Self {
        Self::default()
    }

    /**
    Create a configuration from `EMIT_ASYNC_*` environment variables.

    Missing variables use their defaults. Invalid variables are reported to the process-wide status channel and also use their defaults.
    */
    pub fn from_env() -> Self {
        Self::from_env_vars(env::vars(), &Status::default())
    }

    pub(crate) fn from_env_vars<K: AsRef<str>, V: AsRef<str>>(
        env: impl Iterator<Item = (K, V)>,
        status: &Status,
    ) -> Self {
        let mut config = Config::default();

        for (k, v) in env {
            let k = k.as_ref();
            let v = v.as_ref().trim();

            if k.eq_ignore_ascii_case(EMIT_ASYNC_CAPACITY) {
                if let Some(capacity) =
                    number(k, v, status).and_then(|capacity| declared_capacity(capacity, status))
                {
                    config.capacity = capacity;
                }
                continue;
            }

            if k.eq_ignore_ascii_case(EMIT_ASYNC_QUEUE_FULL_POLICY) {
                if !v.is_empty() {
                    config.policy = v.to_owned();
                }
                continue;
            }

            if k.eq_ignore_ascii_case(EMIT_ASYNC_DISCARD_THRESHOLD) {
                match v.parse() {
                    Ok(level) => config.discard_threshold = level,
                    Err(err) => status.warn(format_args!("failed to parse {k}: {err}")),
                }
                continue;
            }

            if k.eq_ignore_ascii_case(EMIT_ASYNC_FORMAT_EAGERLY) {
                if let Some(v) = flag(k, v, status) {
                    config.format_eagerly = v;
                }
                continue;
            }

            if k.eq_ignore_ascii_case(EMIT_ASYNC_SHUTDOWN_TIMEOUT_MS) {
                if let Some(ms) = number(k, v, status) {
                    config.shutdown_timeout = Duration::from_millis(ms as u64);
                }
                continue;
            }

            if k.eq_ignore_ascii_case(EMIT_ASYNC_BATCH_SIZE) {
                match number(k, v, status) {
                    Some(0) => status.warn(format_args!("{k} must be greater than 0")),
                    Some(batch_size) => config.batch_size = batch_size,
                    None => (),
                }
                continue;
            }

            if k.eq_ignore_ascii_case(EMIT_ASYNC_IDLE_WAIT_MS) {
                if let Some(ms) = number(k, v, status) {
                    config.idle_wait = Duration::from_millis(ms as u64);
                }
                continue;
            }

            if k.eq_ignore_ascii_case(EMIT_ASYNC_INCLUDE_LOCATION) {
                if let Some(v) = flag(k, v, status) {
                    config.include_location = v;
                }
                continue;
            }

            if k.eq_ignore_ascii_case(EMIT_ASYNC_BLOCKING) {
                if let Some(v) = flag(k, v, status) {
                    config.blocking = v;
                }
                continue;
            }

            if k.eq_ignore_ascii_case(EMIT_ASYNC_SYNCHRONIZE_ENQUEUE) {
                if let Some(v) = flag(k, v, status) {
                    config.synchronize_enqueue_when_full = v;
                }
                continue;
            }

            if k.eq_ignore_ascii_case(EMIT_ASYNC_WAIT_STRATEGY) {
                match v.parse() {
                    Ok(wait_strategy) => config.wait_strategy = wait_strategy,
                    Err(err) => status.warn(format_args!("failed to parse {k}: {err}")),
                }
                continue;
            }
        }

        config
    }

    /**
    Set the number of events the queue can hold.

    The capacity is rounded up to the next power of two, and clamped between `2` and [`MAX_CAPACITY`]. Unlike declarative configuration, capacities below [`MIN_CAPACITY`] are accepted.
    */
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.clamp(2, MAX_CAPACITY).next_power_of_two();
        self
    }

    /**
    Set the name of the queue-full policy to create from the [`crate::policy::PolicyRegistry`].
    */
    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = policy.into();
        self
    }

    /**
    Set the level below which the discarding policy drops events.
    */
    pub fn with_discard_threshold(mut self, discard_threshold: Level) -> Self {
        self.discard_threshold = discard_threshold;
        self
    }

    /**
    Set whether deferred messages are rendered on the logging thread before they're enqueued.
    */
    pub fn with_format_eagerly(mut self, format_eagerly: bool) -> Self {
        self.format_eagerly = format_eagerly;
        self
    }

    /**
    Set the maximum time to wait for the queue to drain when the pipeline stops.
    */
    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /**
    Set the maximum number of events the background consumer drains at once.

    The batch size is at least `1`.
    */
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /**
    Set the maximum time the background consumer parks while the queue is empty.
    */
    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    /**
    Set whether the source location of log calls is captured.
    */
    pub fn with_include_location(mut self, include_location: bool) -> Self {
        self.include_location = include_location;
        self
    }

    /**
    Set whether producers may wait for space when the queue is full.

    When `false`, events that find the queue full are sent to the error sink, or dropped if there isn't one.
    */
    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /**
    Set whether producers waiting for space are serialized through a single lock.
    */
    pub fn with_synchronize_enqueue_when_full(mut self, synchronize: bool) -> Self {
        self.synchronize_enqueue_when_full = synchronize;
        self
    }

    /**
    Set how the background consumer waits while the queue is empty.
    */
    pub fn with_wait_strategy(mut self, wait_strategy: WaitStrategy) -> Self {
        self.wait_strategy = wait_strategy;
        self
    }

    /**
    The number of events the queue can hold.
    */
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /**
    The name of the queue-full policy.
    */
    pub fn policy(&self) -> &str {
        &self.policy
    }

    /**
    The level below which the discarding policy drops events.
    */
    pub fn discard_threshold(&self) -> Level {
        self.discard_threshold
    }

    /**
    Whether deferred messages are rendered on the logging thread.
    */
    pub fn format_eagerly(&self) -> bool {
        self.format_eagerly
    }

    /**
    The maximum time to wait for the queue to drain when the pipeline stops.
    */
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /**
    The maximum number of events the background consumer drains at once.
    */
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /**
    The maximum time the background consumer parks while the queue is empty.
    */
    pub fn idle_wait(&self) -> Duration {
        self.idle_wait
    }

    /**
    Whether the source location of log calls is captured.
    */
    pub fn include_location(&self) -> bool {
        self.include_location
    }

    /**
    Whether producers may wait for space when the queue is full.
    */
    pub fn blocking(&self) -> bool {
        self.blocking
    }

    /**
    Whether producers waiting for space are serialized through a single lock.
    */
    pub fn synchronize_enqueue_when_full(&self) -> bool {
        self.synchronize_enqueue_when_full
    }

    /**
    How the background consumer waits while the queue is empty.
    */
    pub fn wait_strategy(&self) -> WaitStrategy {
        self.wait_strategy
    }
}

/**
How the background consumer waits for events while the queue is empty.

The default is [`WaitStrategy::Timeout`]. Strategies that don't park trade CPU time for lower latency between an event being published and dispatched.

# Parsing

Strategies parse from their names, ignoring case, so `timeout`, `Timeout` and `TIMEOUT` are all [`WaitStrategy::Timeout`]. [`WaitStrategy::BusySpin`] also parses from `busy_spin` and `busy-spin`.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WaitStrategy {
    /**
    Park until an event is published.
    */
    Block,
    /**
    Park until an event is published, or the configured idle wait elapses.
    */
    #[default]
    Timeout,
    /**
    Spin, then yield, then sleep for short intervals.
    */
    Sleep,
    /**
    Spin, then yield the thread.
    */
    Yield,
    /**
    Spin without ever yielding the thread.
    */
    BusySpin,
}

impl WaitStrategy {
    /**
    Get the canonical name of the strategy.
    */
    pub const fn as_str(&self) -> &'static str {
        match self {
            WaitStrategy::Block => "Block",
            WaitStrategy::Timeout => "Timeout",
            WaitStrategy::Sleep => "Sleep",
            WaitStrategy::Yield => "Yield",
            WaitStrategy::BusySpin => "BusySpin",
        }
    }
}

impl fmt::Display for WaitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WaitStrategy {
    type Err = ParseWaitStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        for strategy in [
            WaitStrategy::Block,
            WaitStrategy::Timeout,
            WaitStrategy::Sleep,
            WaitStrategy::Yield,
            WaitStrategy::BusySpin,
        ] {
            if s.eq_ignore_ascii_case(strategy.as_str()) {
                return Ok(strategy);
            }
        }

        if s.eq_ignore_ascii_case("busy_spin") || s.eq_ignore_ascii_case("busy-spin") {
            return Ok(WaitStrategy::BusySpin);
        }

        Err(ParseWaitStrategyError {})
    }
}

/**
An error attempting to parse a [`WaitStrategy`] from text.
*/
#[derive(Debug)]
pub struct ParseWaitStrategyError {}

impl fmt::Display for ParseWaitStrategyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "the input was not a valid wait strategy; expected one of Block, Timeout, Sleep, Yield or BusySpin"
        )
    }
}

impl std::error::Error for ParseWaitStrategyError {}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for WaitStrategy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = WaitStrategy;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a wait strategy like `Timeout` or `Block`")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(Visitor)
    }
}

fn declared_capacity(capacity: usize, status: &Status) -> Option<usize> {
    if capacity > MAX_CAPACITY {
        status.warn(format_args!(
            "queue capacity {capacity} is above the maximum of {MAX_CAPACITY}; keeping the default"
        ));

        return None;
    }

    if capacity < MIN_CAPACITY {
        status.warn(format_args!(
            "queue capacity {capacity} is below the minimum; using {MIN_CAPACITY}"
        ));

        return Some(MIN_CAPACITY);
    }

    if !capacity.is_power_of_two() {
        let rounded = capacity.next_power_of_two();

        status.warn(format_args!(
            "queue capacity {capacity} is not a power of two; using {rounded}"
        ));

        return Some(rounded);
    }

    Some(capacity)
}

fn number(k: &str, v: &str, status: &Status) -> Option<usize> {
    match v.parse() {
        Ok(v) => Some(v),
        Err(err) => {
            status.warn(format_args!("failed to parse {k}: {err}"));

            None
        }
    }
}

fn flag(k: &str, v: &str, status: &Status) -> Option<bool> {
    for t in ["true", "1", "yes", "on"] {
        if v.eq_ignore_ascii_case(t) {
            return Some(true);
        }
    }

    for f in ["false", "0", "no", "off"] {
        if v.eq_ignore_ascii_case(f) {
            return Some(false);
        }
    }

    status.warn(format_args!("failed to parse {k}: {v} is not a valid flag"));

    None
}

#[cfg(feature = "serde")]
mod raw {
    use super::*;

    use serde::Deserialize;

    use crate::error::Error;

    /**
    Declarative configuration for a [`crate::Pipeline`].

    Any missing fields use their defaults.
    */
    #[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    pub struct RawConfig {
        /**
        The number of events the queue can hold.
        */
        pub capacity: Option<usize>,
        /**
        The name of the queue-full policy.
        */
        pub queue_full_policy: Option<String>,
        /**
        The level below which the discarding policy drops events.
        */
        pub discard_threshold: Option<Level>,
        /**
        Whether deferred messages are rendered on the logging thread.
        */
        pub format_eagerly: Option<bool>,
        /**
        The maximum time to wait for the queue to drain when the pipeline stops, in milliseconds.
        */
        pub shutdown_timeout_ms: Option<u64>,
        /**
        The maximum number of events the background consumer drains at once.
        */
        pub batch_size: Option<usize>,
        /**
        The maximum time the background consumer parks while the queue is empty, in milliseconds.
        */
        pub idle_wait_ms: Option<u64>,
        /**
        Whether the source location of log calls is captured.
        */
        pub include_location: Option<bool>,
        /**
        Whether producers may wait for space when the queue is full.
        */
        pub blocking: Option<bool>,
        /**
        Whether producers waiting for space are serialized through a single lock.
        */
        pub synchronize_enqueue_when_full: Option<bool>,
        /**
        How the background consumer waits while the queue is empty.
        */
        pub wait_strategy: Option<WaitStrategy>,
    }

    impl Config {
        /**
        Validate declarative configuration.

        Capacity adjustments are reported to the process-wide status channel.
        */
        pub fn from_raw(raw: RawConfig) -> Result<Self, Error> {
            Self::from_raw_with(raw, &Status::default())
        }

        pub(crate) fn from_raw_with(raw: RawConfig, status: &Status) -> Result<Self, Error> {
            let mut config = Config::default();

            if let Some(capacity) = raw
                .capacity
                .and_then(|capacity| declared_capacity(capacity, status))
            {
                config.capacity = capacity;
            }

            if let Some(policy) = raw.queue_full_policy {
                if policy.trim().is_empty() {
                    return Err(Error::new("the queue-full policy name must not be empty"));
                }

                config.policy = policy;
            }

            if let Some(discard_threshold) = raw.discard_threshold {
                config.discard_threshold = discard_threshold;
            }

            if let Some(format_eagerly) = raw.format_eagerly {
                config.format_eagerly = format_eagerly;
            }

            if let Some(ms) = raw.shutdown_timeout_ms {
                config.shutdown_timeout = Duration::from_millis(ms);
            }

            if let Some(batch_size) = raw.batch_size {
                if batch_size == 0 {
                    return Err(Error::new("the batch size must be greater than 0"));
                }

                config.batch_size = batch_size;
            }

            if let Some(ms) = raw.idle_wait_ms {
                config.idle_wait = Duration::from_millis(ms);
            }

            if let Some(include_location) = raw.include_location {
                config.include_location = include_location;
            }

            if let Some(blocking) = raw.blocking {
                config.blocking = blocking;
            }

            if let Some(synchronize) = raw.synchronize_enqueue_when_full {
                config.synchronize_enqueue_when_full = synchronize;
            }

            if let Some(wait_strategy) = raw.wait_strategy {
                config.wait_strategy = wait_strategy;
            }

            Ok(config)
        }
    }
}

#[cfg(feature = "serde")]
pub use self::raw::*;
