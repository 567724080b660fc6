/*!
Named, reference-counted resources.

A [`Registry`] hands out [`Handle`]s to values created on first use. Each handle keeps its value registered. When the last handle to a value is dropped, the value is removed from the registry and [`Release::release`] is called on it.

The process-wide [`context`] holds the pipelines created by [`crate::Setup::init`].
*/

use std::{
    collections::HashMap,
    fmt,
    ops::Deref,
    sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::pipeline::Pipeline;

/**
A value that needs to be released when it's no longer registered.
*/
pub trait Release {
    /**
    Release the value.

    This method is called once, after the value has been removed from its registry.
    */
    fn release(&self);
}

impl Release for Pipeline {
    fn release(&self) {
        self.stop(self.config().shutdown_timeout());
    }
}

/**
The process-wide registry of pipelines.
*/
pub fn context() -> &'static Registry<Pipeline> {
    static CONTEXT: LazyLock<Registry<Pipeline>> = LazyLock::new(Registry::new);

    &CONTEXT
}

/**
A set of named values with reference-counted [`Handle`]s.
*/
pub struct Registry<T> {
    entries: Arc<Mutex<HashMap<Arc<str>, Entry<T>>>>,
}

struct Entry<T> {
    value: Arc<T>,
    handles: usize,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Registry {
            entries: Default::default(),
        }
    }
}

impl<T> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = lock(&self.entries);

        let mut names = entries.keys().collect::<Vec<_>>();
        names.sort();

        f.debug_struct("Registry").field("names", &names).finish()
    }
}

impl<T: Release> Registry<T> {
    /**
    Create an empty registry.
    */
    pub fn new() -> Self {
        Self::default()
    }

    /**
    Get a handle to the value registered under `name`, creating it with `create` if there isn't one.

    `create` is called while the registry is locked, so concurrent callers always share a single value.
    */
    pub fn acquire(&self, name: impl Into<Arc<str>>, create: impl FnOnce() -> T) -> Handle<T> {
        let name = name.into();
        let mut entries = lock(&self.entries);

        let entry = entries.entry(name.clone()).or_insert_with(|| Entry {
            value: Arc::new(create()),
            handles: 0,
        });

        entry.handles += 1;

        Handle {
            name,
            value: entry.value.clone(),
            entries: self.entries.clone(),
        }
    }

    /**
    Get a new handle to the value registered under `name`, if there is one.
    */
    pub fn get(&self, name: &str) -> Option<Handle<T>> {
        let mut entries = lock(&self.entries);

        let name = entries.get_key_value(name)?.0.clone();

        let entry = entries.get_mut(&name)?;
        entry.handles += 1;

        Some(Handle {
            name,
            value: entry.value.clone(),
            entries: self.entries.clone(),
        })
    }

    /**
    Whether a value is registered under `name`.
    */
    pub fn contains(&self, name: &str) -> bool {
        lock(&self.entries).contains_key(name)
    }

    /**
    The number of registered values.
    */
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /**
    Whether the registry is empty.
    */
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/**
A handle to a value in a [`Registry`].

The value stays registered while any handle to it is alive.
*/
pub struct Handle<T: Release> {
    name: Arc<str>,
    value: Arc<T>,
    entries: Arc<Mutex<HashMap<Arc<str>, Entry<T>>>>,
}

impl<T: Release> Handle<T> {
    /**
    The name the value is registered under.
    */
    pub fn name(&self) -> &str {
        &self.name
    }

    /**
    Get a shared reference to the value.

    The returned value can outlive the handle, but it will still be released when the last handle is dropped.
    */
    pub fn shared(&self) -> Arc<T> {
        self.value.clone()
    }
}

impl Handle<Pipeline> {
    /**
    Flush the pipeline, waiting up to `timeout`.
    */
    pub fn blocking_flush(&self, timeout: Duration) -> bool {
        self.value.blocking_flush(timeout)
    }
}

impl<T: Release> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Release> Clone for Handle<T> {
    fn clone(&self) -> Self {
        if let Some(entry) = lock(&self.entries).get_mut(&self.name) {
            entry.handles += 1;
        }

        Handle {
            name: self.name.clone(),
            value: self.value.clone(),
            entries: self.entries.clone(),
        }
    }
}

impl<T: Release> Drop for Handle<T> {
    fn drop(&mut self) {
        let released = {
            let mut entries = lock(&self.entries);

            match entries.get_mut(&self.name) {
                Some(entry) if Arc::ptr_eq(&entry.value, &self.value) => {
                    entry.handles -= 1;

                    if entry.handles == 0 {
                        entries.remove(&self.name)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        // Release outside the lock so the value can use the registry
        if let Some(entry) = released {
            entry.value.release();
        }
    }
}

impl<T: Release + fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.name)
            .field("value", &self.value)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::{setup, status::Buffer};

    #[derive(Default)]
    struct Counted(Arc<AtomicUsize>);

    impl Release for Counted {
        fn release(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn last_handle_releases() {
        let released = Arc::new(AtomicUsize::new(0));
        let registry = Registry::new();

        let a = registry.acquire("a", || Counted(released.clone()));
        let b = registry.acquire("a", || panic!("the value is already registered"));
        let c = b.clone();

        assert_eq!(1, registry.len());

        drop(a);
        drop(b);

        assert!(registry.contains("a"));
        assert_eq!(0, released.load(Ordering::SeqCst));

        drop(c);

        assert!(registry.is_empty());
        assert_eq!(1, released.load(Ordering::SeqCst));
    }

    #[test]
    fn get_existing() {
        let released = Arc::new(AtomicUsize::new(0));
        let registry = Registry::new();

        assert!(registry.get("a").is_none());

        let a = registry.acquire("a", || Counted(released.clone()));
        let again = registry.get("a").unwrap();

        assert_eq!("a", again.name());
        assert!(Arc::ptr_eq(&a.shared(), &again.shared()));

        drop(a);
        drop(again);

        assert_eq!(1, released.load(Ordering::SeqCst));
    }

    #[test]
    fn reacquire_after_release() {
        let released = Arc::new(AtomicUsize::new(0));
        let registry = Registry::new();

        drop(registry.acquire("a", || Counted(released.clone())));
        drop(registry.acquire("a", || Counted(released.clone())));

        assert_eq!(2, released.load(Ordering::SeqCst));
    }

    #[test]
    fn context_stops_pipeline_on_release() {
        let handle = setup()
            .status_to(Arc::new(Buffer::new(8)))
            .init("context_stops_pipeline_on_release");

        let pipeline = handle.shared();

        assert!(pipeline.is_running());
        assert!(context().contains("context_stops_pipeline_on_release"));

        drop(handle);

        assert!(!context().contains("context_stops_pipeline_on_release"));
        assert!(!pipeline.is_running());
    }
}
