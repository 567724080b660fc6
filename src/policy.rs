/*!
Deciding what to do with an event when the queue is full.

When a producer finds the queue full, the pipeline asks its [`QueueFullPolicy`] for an [`EventRoute`]:

- [`EventRoute::Enqueue`]: wait for space in the queue.
- [`EventRoute::Synchronous`]: dispatch the event on the logging thread, bypassing the queue.
- [`EventRoute::Discard`]: drop the event.

Policies are created by name through a [`PolicyRegistry`], so they can be selected from configuration. Names that aren't registered, or policies that fail to build, fall back to [`DefaultPolicy`].
*/

use std::{
    collections::HashMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
};

use crate::{error::Error, level::Level, message, status::Status};

/**
Where an event should go when the queue is full.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRoute {
    /**
    Wait for space in the queue.
    */
    Enqueue,
    /**
    Dispatch the event on the calling thread.
    */
    Synchronous,
    /**
    Drop the event.
    */
    Discard,
}

/**
A decision about where events go when the queue is full.
*/
pub trait QueueFullPolicy: Send + Sync {
    /**
    Route an event at `level` logged on the calling thread.

    `background` is the id of the background consumer thread, if it's running.
    */
    fn route(&self, background: Option<ThreadId>, level: Level) -> EventRoute;

    /**
    The number of events this policy has discarded.
    */
    fn discard_count(&self) -> u64 {
        0
    }

    /**
    The name of the policy.
    */
    fn name(&self) -> &str;
}

impl<P: QueueFullPolicy + ?Sized> QueueFullPolicy for Box<P> {
    fn route(&self, background: Option<ThreadId>, level: Level) -> EventRoute {
        (**self).route(background, level)
    }

    fn discard_count(&self) -> u64 {
        (**self).discard_count()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

fn is_background(background: Option<ThreadId>) -> bool {
    background == Some(thread::current().id())
}

/**
The default policy.

Events wait for space in the queue, unless they're logged from the background consumer itself. Waiting there would deadlock, so those events are dispatched synchronously instead.
*/
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl QueueFullPolicy for DefaultPolicy {
    fn route(&self, background: Option<ThreadId>, _: Level) -> EventRoute {
        if is_background(background) {
            EventRoute::Synchronous
        } else {
            EventRoute::Enqueue
        }
    }

    fn name(&self) -> &str {
        "Default"
    }
}

/**
A policy that discards events below a threshold level.

Events strictly less severe than the threshold are discarded. Other events are routed the same way as [`DefaultPolicy`]. A warning is sent to the status channel the first time an event is discarded.
*/
pub struct DiscardingPolicy {
    threshold: Level,
    discarded: AtomicU64,
    warned: AtomicBool,
    status: Option<Status>,
}

impl DiscardingPolicy {
    /**
    Create a policy that discards events less severe than `threshold`.
    */
    pub fn new(threshold: Level) -> Self {
        DiscardingPolicy {
            threshold,
            discarded: AtomicU64::new(0),
            warned: AtomicBool::new(false),
            status: None,
        }
    }

    /**
    Report the first discarded event to the given status channel.
    */
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    /**
    The threshold level.
    */
    pub fn threshold(&self) -> Level {
        self.threshold
    }
}

impl fmt::Debug for DiscardingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscardingPolicy")
            .field("threshold", &self.threshold)
            .field("discarded", &self.discard_count())
            .finish()
    }
}

impl QueueFullPolicy for DiscardingPolicy {
    fn route(&self, background: Option<ThreadId>, level: Level) -> EventRoute {
        if level < self.threshold {
            self.discarded.fetch_add(1, Ordering::Relaxed);

            if !self.warned.swap(true, Ordering::Relaxed) {
                if let Some(ref status) = self.status {
                    status.warn(format_args!(
                        "the queue is full; discarding events less severe than {}",
                        self.threshold
                    ));
                }
            }

            return EventRoute::Discard;
        }

        DefaultPolicy.route(background, level)
    }

    fn discard_count(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    fn name(&self) -> &str {
        "Discard"
    }
}

/**
The configuration passed to policy factories.
*/
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    discard_threshold: Level,
    status: Status,
}

impl PolicyConfig {
    /**
    Create a policy configuration.
    */
    pub fn new(discard_threshold: Level, status: Status) -> Self {
        PolicyConfig {
            discard_threshold,
            status,
        }
    }

    /**
    The level below which discarding policies drop events.
    */
    pub fn discard_threshold(&self) -> Level {
        self.discard_threshold
    }

    /**
    The status channel of the pipeline the policy is being created for.
    */
    pub fn status(&self) -> &Status {
        &self.status
    }
}

type PolicyFactory =
    Arc<dyn Fn(&PolicyConfig) -> Result<Box<dyn QueueFullPolicy>, Error> + Send + Sync>;

/**
A set of named [`QueueFullPolicy`] factories.

Names are matched ignoring case. The default registry contains:

- `default`: [`DefaultPolicy`].
- `discard` or `discarding`: [`DiscardingPolicy`], using [`PolicyConfig::discard_threshold`].
*/
#[derive(Clone)]
pub struct PolicyRegistry {
    factories: HashMap<String, PolicyFactory>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        let mut registry = PolicyRegistry::empty();

        registry
            .register("default", |_| Ok(Box::new(DefaultPolicy)))
            .register("discard", discarding)
            .register("discarding", discarding);

        registry
    }
}

fn discarding(config: &PolicyConfig) -> Result<Box<dyn QueueFullPolicy>, Error> {
    Ok(Box::new(
        DiscardingPolicy::new(config.discard_threshold()).with_status(config.status().clone()),
    ))
}

impl fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys = self.factories.keys().collect::<Vec<_>>();
        keys.sort();

        f.debug_struct("PolicyRegistry")
            .field("keys", &keys)
            .finish()
    }
}

impl PolicyRegistry {
    /**
    Create a registry with the built-in policies.
    */
    pub fn new() -> Self {
        Self::default()
    }

    /**
    Create a registry without any policies.

    Creating a policy from an empty registry always falls back to [`DefaultPolicy`].
    */
    pub fn empty() -> Self {
        PolicyRegistry {
            factories: HashMap::new(),
        }
    }

    /**
    Register a policy factory under a name.

    Registering a name that's already present replaces its factory.
    */
    pub fn register(
        &mut self,
        name: impl AsRef<str>,
        factory: impl Fn(&PolicyConfig) -> Result<Box<dyn QueueFullPolicy>, Error>
            + Send
            + Sync
            + 'static,
    ) -> &mut Self {
        self.factories
            .insert(name.as_ref().to_ascii_lowercase(), Arc::new(factory));

        self
    }

    /**
    Whether a factory is registered under the given name.
    */
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_ascii_lowercase())
    }

    /**
    Create the policy registered under `name`.

    If there's no policy with that name, or its factory fails or panics, a warning is sent to the status channel in `config` and a [`DefaultPolicy`] is returned.
    */
    pub fn create(&self, name: &str, config: &PolicyConfig) -> Box<dyn QueueFullPolicy> {
        let Some(factory) = self.factories.get(&name.trim().to_ascii_lowercase()) else {
            config.status().warn(format_args!(
                "no queue-full policy named `{name}`; falling back to Default"
            ));

            return Box::new(DefaultPolicy);
        };

        match panic::catch_unwind(AssertUnwindSafe(|| factory(config))) {
            Ok(Ok(policy)) => policy,
            Ok(Err(err)) => {
                config.status().warn(format_args!(
                    "failed to create queue-full policy `{name}`: {err}; falling back to Default"
                ));

                Box::new(DefaultPolicy)
            }
            Err(payload) => {
                config.status().warn(format_args!(
                    "queue-full policy `{name}` panicked while being created: {}; falling back to Default",
                    message::panic_message(&*payload)
                ));

                Box::new(DefaultPolicy)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use quickcheck_macros::quickcheck;

    use crate::status::Buffer;

    fn config(status: &Arc<Buffer>) -> PolicyConfig {
        PolicyConfig::new(Level::Info, Status::new().with(status.clone()))
    }

    #[test]
    fn default_routes_by_thread() {
        let this = thread::current().id();
        let other = thread::spawn(|| thread::current().id()).join().unwrap();

        assert_eq!(
            EventRoute::Synchronous,
            DefaultPolicy.route(Some(this), Level::Info)
        );
        assert_eq!(
            EventRoute::Enqueue,
            DefaultPolicy.route(Some(other), Level::Info)
        );
        assert_eq!(EventRoute::Enqueue, DefaultPolicy.route(None, Level::Info));
    }

    #[test]
    fn discarding_below_threshold() {
        let status = Arc::new(Buffer::new(8));

        let policy = DiscardingPolicy::new(Level::Info)
            .with_status(Status::new().with(status.clone()));

        assert_eq!(EventRoute::Discard, policy.route(None, Level::Debug));
        assert_eq!(EventRoute::Discard, policy.route(None, Level::Trace));
        assert_eq!(EventRoute::Enqueue, policy.route(None, Level::Info));
        assert_eq!(EventRoute::Enqueue, policy.route(None, Level::Error));

        let this = thread::current().id();
        assert_eq!(
            EventRoute::Synchronous,
            policy.route(Some(this), Level::Warn)
        );

        assert_eq!(2, policy.discard_count());

        // Only the first discard is reported
        assert_eq!(1, status.count_containing("discarding events"));
    }

    #[quickcheck]
    fn discard_count_matches_levels(levels: Vec<u8>, threshold: u8) -> bool {
        const LEVELS: [Level; 6] = [
            Level::Trace,
            Level::Debug,
            Level::Info,
            Level::Warn,
            Level::Error,
            Level::Fatal,
        ];

        let level = |n: u8| LEVELS[n as usize % LEVELS.len()];
        let threshold = level(threshold);

        let policy = DiscardingPolicy::new(threshold);

        let mut expected = 0;
        for &n in &levels {
            let route = policy.route(None, level(n));

            if level(n) < threshold {
                expected += 1;

                if route != EventRoute::Discard {
                    return false;
                }
            }
        }

        policy.discard_count() == expected
    }

    #[test]
    fn registry_is_case_insensitive() {
        let status = Arc::new(Buffer::new(8));
        let registry = PolicyRegistry::new();

        assert_eq!("Default", registry.create("DEFAULT", &config(&status)).name());
        assert_eq!("Discard", registry.create("Discard", &config(&status)).name());
        assert_eq!(
            "Discard",
            registry.create("discarding", &config(&status)).name()
        );

        assert!(status.entries().is_empty());
    }

    #[test]
    fn registry_unknown_falls_back() {
        let status = Arc::new(Buffer::new(8));
        let registry = PolicyRegistry::new();

        let policy = registry.create("com.example.Missing", &config(&status));

        assert_eq!("Default", policy.name());
        assert_eq!(1, status.count_containing("com.example.Missing"));
    }

    #[test]
    fn registry_failing_factory_falls_back() {
        let status = Arc::new(Buffer::new(8));
        let mut registry = PolicyRegistry::new();

        registry.register("broken", |_| Err(Error::new("explicit failure")));

        let policy = registry.create("broken", &config(&status));

        assert_eq!("Default", policy.name());
        assert_eq!(1, status.count_containing("explicit failure"));
    }

    #[test]
    fn registry_panicking_factory_falls_back() {
        let status = Arc::new(Buffer::new(8));
        let mut registry = PolicyRegistry::new();

        registry.register("explodes", |_| panic!("explicit panic in factory"));

        let policy = registry.create("explodes", &config(&status));

        assert_eq!("Default", policy.name());
        assert_eq!(1, status.count_containing("explicit panic in factory"));
    }

    #[test]
    fn registry_custom_policy() {
        struct AlwaysSync;

        impl QueueFullPolicy for AlwaysSync {
            fn route(&self, _: Option<ThreadId>, _: Level) -> EventRoute {
                EventRoute::Synchronous
            }

            fn name(&self) -> &str {
                "AlwaysSync"
            }
        }

        let status = Arc::new(Buffer::new(8));
        let mut registry = PolicyRegistry::empty();

        registry.register("always-sync", |_| Ok(Box::new(AlwaysSync)));

        assert!(registry.contains("Always-Sync"));

        let policy = registry.create("always-sync", &config(&status));

        assert_eq!(EventRoute::Synchronous, policy.route(None, Level::Info));
    }
}
