/*!
The [`Setup`] type.

Pipelines are configured through a [`Setup`] builder, returned by [`crate::setup`]. Once configured, a pipeline can be spawned directly with [`Setup::spawn`], or shared through the process-wide [`crate::registry::context`] with [`Setup::init`]:

```
use std::time::Duration;

let pipeline = emit_async::setup()
    .dispatch_to(emit_async::sink::from_fn(|evt| println!("{}", evt.message_text())))
    .map_config(|config| config.with_capacity(256))
    .spawn();

pipeline.publish(emit_async::EventEnvelope::capture(
    "app",
    emit_async::Level::Info,
    "hello",
    pipeline.ctxt(),
));

pipeline.stop(Duration::from_secs(5));
```

Setting up a pipeline never fails. If a policy can't be created, or the background consumer can't be spawned, a message is sent to the status channel and the pipeline falls back to something that still delivers events.
*/

use std::sync::Arc;

use crate::{
    config::Config,
    ctxt::{ContextProvider, ThreadLocalCtxt},
    level::Level,
    pipeline::Pipeline,
    policy::{PolicyConfig, PolicyRegistry},
    registry::{self, Handle},
    sink::{Sink, SinkControl},
    status::{Status, StatusListener},
};

/**
Configure a [`Pipeline`] with sinks, a context provider, and a queue-full policy.
*/
pub fn setup() -> Setup {
    Setup::default()
}

/**
A configuration builder for a [`Pipeline`].
*/
#[must_use = "call `.spawn()` or `.init()` to finish setup"]
pub struct Setup {
    sinks: Vec<SinkControl>,
    error_sink: Option<SinkControl>,
    ctxt: Box<dyn ContextProvider + Send + Sync>,
    policies: PolicyRegistry,
    status: Option<Status>,
    config: Config,
}

impl Default for Setup {
    fn default() -> Self {
        Self::new()
    }
}

impl Setup {
    /**
    Create a new builder with no sinks, the shared [`ThreadLocalCtxt`], the built-in policies, and the default [`Config`].
    */
    pub fn new() -> Self {
        Setup {
            sinks: Vec::new(),
            error_sink: None,
            ctxt: Box::new(ThreadLocalCtxt::shared()),
            policies: PolicyRegistry::new(),
            status: None,
            config: Config::default(),
        }
    }

    /**
    Set the [`Sink`] that will receive events, replacing any others.
    */
    pub fn dispatch_to(mut self, sink: impl Sink + Send + Sync + 'static) -> Self {
        self.sinks.clear();
        self.and_dispatch_to(sink)
    }

    /**
    Add a [`Sink`] that will also receive events.
    */
    pub fn and_dispatch_to(self, sink: impl Sink + Send + Sync + 'static) -> Self {
        let name = format!("sink{}", self.sinks.len());

        self.and_dispatch_to_control(SinkControl::new(name, sink))
    }

    /**
    Add a [`Sink`] that will receive events at `min_level` or more severe.
    */
    pub fn and_dispatch_at(
        self,
        name: impl Into<Arc<str>>,
        min_level: Level,
        sink: impl Sink + Send + Sync + 'static,
    ) -> Self {
        self.and_dispatch_to_control(SinkControl::new(name, sink).with_min_level(min_level))
    }

    /**
    Add a named [`SinkControl`] that will also receive events.
    */
    pub fn and_dispatch_to_control(mut self, control: SinkControl) -> Self {
        self.sinks.push(control);
        self
    }

    /**
    Set the [`Sink`] that receives events the pipeline couldn't queue.

    Events go to the error sink when the queue is full and the pipeline doesn't block, or when waiting for space is cancelled.
    */
    pub fn error_to(mut self, sink: impl Sink + Send + Sync + 'static) -> Self {
        self.error_sink = Some(SinkControl::new("error", sink));
        self
    }

    /**
    Set the [`ContextProvider`] events are captured with.
    */
    pub fn with_ctxt(mut self, ctxt: impl ContextProvider + Send + Sync + 'static) -> Self {
        self.ctxt = Box::new(ctxt);
        self
    }

    /**
    Set the [`PolicyRegistry`] the queue-full policy is created from.
    */
    pub fn with_policy_registry(mut self, policies: PolicyRegistry) -> Self {
        self.policies = policies;
        self
    }

    /**
    Send status messages to the given listener, replacing the default ones.

    By default, status messages go to [`crate::status::global`] and the `log` crate.
    */
    pub fn status_to(mut self, listener: impl StatusListener + 'static) -> Self {
        self.status = Some(Status::new().with(listener));
        self
    }

    /**
    Send status messages to the given listener as well.
    */
    pub fn and_status_to(mut self, listener: impl StatusListener + 'static) -> Self {
        self.status = Some(self.status.take().unwrap_or_default().with(listener));
        self
    }

    /**
    Set the [`Config`] of the pipeline.
    */
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /**
    Map the current [`Config`] into a new value.
    */
    pub fn map_config(mut self, map: impl FnOnce(Config) -> Config) -> Self {
        self.config = map(self.config);
        self
    }

    /**
    Build the pipeline without starting it.

    Until [`Pipeline::start`] is called, events are dispatched synchronously.
    */
    pub fn build(self) -> Pipeline {
        let status = self.status.unwrap_or_default();

        let policy = self.policies.create(
            self.config.policy(),
            &PolicyConfig::new(self.config.discard_threshold(), status.clone()),
        );

        Pipeline::new(
            self.config,
            self.sinks,
            self.error_sink,
            policy,
            self.ctxt,
            status,
        )
    }

    /**
    Build the pipeline and start its background consumer.

    If the consumer can't be started, the failure is sent to the status channel and the pipeline dispatches events synchronously.
    */
    pub fn spawn(self) -> Pipeline {
        let pipeline = self.build();

        // Failures have already been reported to the status channel
        let _ = pipeline.start();

        pipeline
    }

    /**
    Spawn the pipeline and register it under `name` in the process-wide [`crate::registry::context`].

    If a pipeline is already registered under `name`, this builder is discarded and a new handle to the existing pipeline is returned. The pipeline is stopped when the last handle to it is dropped.
    */
    pub fn init(self, name: impl Into<Arc<str>>) -> Handle<Pipeline> {
        registry::context().acquire(name, || self.spawn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use crate::{envelope::EventEnvelope, sink, status::Buffer};

    #[test]
    fn build_does_not_start() {
        let pipeline = setup().status_to(Arc::new(Buffer::new(8))).build();

        assert!(!pipeline.is_running());
        assert!(pipeline.stop(Duration::ZERO));
    }

    #[test]
    fn dispatch_to_replaces_sinks() {
        let replaced = Arc::new(AtomicUsize::new(0));
        let kept = Arc::new(AtomicUsize::new(0));

        let pipeline = setup()
            .dispatch_to(sink::from_fn({
                let replaced = replaced.clone();
                move |_| {
                    replaced.fetch_add(1, Ordering::Relaxed);
                }
            }))
            .dispatch_to(sink::from_fn({
                let kept = kept.clone();
                move |_| {
                    kept.fetch_add(1, Ordering::Relaxed);
                }
            }))
            .status_to(Arc::new(Buffer::new(8)))
            .build();

        pipeline.publish(EventEnvelope::capture(
            "test",
            Level::Info,
            "event",
            pipeline.ctxt(),
        ));

        assert_eq!(0, replaced.load(Ordering::Relaxed));
        assert_eq!(1, kept.load(Ordering::Relaxed));
    }

    #[test]
    fn and_dispatch_at_filters_levels() {
        let all = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let pipeline = setup()
            .dispatch_to(sink::from_fn({
                let all = all.clone();
                move |_| {
                    all.fetch_add(1, Ordering::Relaxed);
                }
            }))
            .and_dispatch_at(
                "errors",
                Level::Error,
                sink::from_fn({
                    let errors = errors.clone();
                    move |_| {
                        errors.fetch_add(1, Ordering::Relaxed);
                    }
                }),
            )
            .status_to(Arc::new(Buffer::new(8)))
            .spawn();

        for level in [Level::Debug, Level::Info, Level::Error, Level::Fatal] {
            pipeline.publish(EventEnvelope::capture("test", level, "event", pipeline.ctxt()));
        }

        assert!(pipeline.stop(Duration::from_secs(5)));

        assert_eq!(4, all.load(Ordering::Relaxed));
        assert_eq!(2, errors.load(Ordering::Relaxed));
    }

    #[test]
    fn unknown_policy_falls_back() {
        let status = Arc::new(Buffer::new(8));

        let pipeline = setup()
            .map_config(|config| config.with_policy("com.example.Missing"))
            .status_to(status.clone())
            .build();

        assert_eq!("Default", pipeline.policy_name());
        assert_eq!(1, status.count_containing("com.example.Missing"));
    }

    #[test]
    fn and_status_to_keeps_listeners() {
        let first = Arc::new(Buffer::new(8));
        let second = Arc::new(Buffer::new(8));

        let _ = setup()
            .status_to(first.clone())
            .and_status_to(second.clone())
            .map_config(|config| config.with_policy("missing"))
            .build();

        assert_eq!(1, first.count_containing("missing"));
        assert_eq!(1, second.count_containing("missing"));
    }
}
