/*!
Asynchronous event delivery for structured logging.

This library moves log events off the threads that produce them. Events are captured into an [`EventEnvelope`] on the logging thread, published into a bounded ring buffer, and dispatched to [`sink::Sink`]s by a single background consumer thread.

```
use std::{sync::Arc, time::Duration};

use emit_async::Level;

let pipeline = Arc::new(
    emit_async::setup()
        .dispatch_to(emit_async::sink::from_fn(|evt| {
            println!("[{}] {}: {}", evt.level(), evt.logger(), evt.message_text());
        }))
        .spawn(),
);

let logger = pipeline.logger("app");

logger.info("starting up");
logger.event(Level::Warn).prop("retries", 3).log("connection is flaky");

// Stopping drains everything that's already been logged
pipeline.stop(Duration::from_secs(5));
```

# What happens when the queue is full

The queue has a fixed capacity. When a producer finds it full, a [`policy::QueueFullPolicy`] decides whether the event waits for space, is dispatched synchronously on the logging thread, or is discarded. See [`pipeline`] for the details, including how deadlocks are avoided when sinks log.

# Diagnostics

Problems inside the pipeline are never reported through the pipeline itself. They go to a [`status::Status`] channel, which by default keeps recent messages in [`status::global`] and forwards them to the `log` crate.
*/

#![deny(missing_docs)]

mod consumer;

pub mod config;
pub mod ctxt;
pub mod envelope;
pub mod error;
pub mod internal_metrics;
pub mod level;
pub mod logger;
pub mod message;
pub mod pipeline;
pub mod policy;
pub mod registry;
pub mod setup;
pub mod sink;
pub mod status;

#[cfg(feature = "tokio")]
pub mod tokio;

pub use emit_async_ring::Cancel;

pub use self::{
    config::Config,
    envelope::EventEnvelope,
    error::Error,
    level::Level,
    logger::Logger,
    message::Message,
    pipeline::{Delivery, Pipeline, State},
    setup::{setup, Setup},
};
