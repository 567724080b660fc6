/*!
Ambient context that's captured into events.

A [`ContextProvider`] produces an immutable [`ContextSnapshot`] each time an event is captured. The snapshot is shared with the background consumer, so it must never observe changes made by the producing thread after the event was logged.

[`ThreadLocalCtxt`] is the default provider. It stores a map of properties and a stack of values in thread local storage. Frames are copy-on-write: a snapshot holds a reference to the frame at the time of capture, and any later change on the producing thread clones the frame before modifying it.
*/

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    fmt, mem,
    sync::{Arc, Mutex},
};

/**
A source of context for events.
*/
pub trait ContextProvider {
    /**
    Take an immutable snapshot of the current context.
    */
    fn snapshot(&self) -> ContextSnapshot;
}

impl<'a, C: ContextProvider + ?Sized> ContextProvider for &'a C {
    fn snapshot(&self) -> ContextSnapshot {
        (**self).snapshot()
    }
}

impl<C: ContextProvider + ?Sized> ContextProvider for Box<C> {
    fn snapshot(&self) -> ContextSnapshot {
        (**self).snapshot()
    }
}

impl<C: ContextProvider + ?Sized> ContextProvider for Arc<C> {
    fn snapshot(&self) -> ContextSnapshot {
        (**self).snapshot()
    }
}

/**
A [`ContextProvider`] that never has any context.
*/
#[derive(Debug, Clone, Copy, Default)]
pub struct Empty;

impl ContextProvider for Empty {
    fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot::empty()
    }
}

/**
An immutable view of context at the time an event was captured.
*/
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ContextSnapshot {
    map: Option<Arc<BTreeMap<String, String>>>,
    stack: Option<Arc<Vec<String>>>,
}

impl ContextSnapshot {
    /**
    A snapshot without any context.
    */
    pub const fn empty() -> Self {
        ContextSnapshot {
            map: None,
            stack: None,
        }
    }

    /**
    Create a snapshot from a map of properties and a stack of values.
    */
    pub fn new(
        map: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
        stack: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let map = map
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect::<BTreeMap<_, _>>();
        let stack = stack.into_iter().map(Into::into).collect::<Vec<_>>();

        ContextSnapshot {
            map: if map.is_empty() {
                None
            } else {
                Some(Arc::new(map))
            },
            stack: if stack.is_empty() {
                None
            } else {
                Some(Arc::new(stack))
            },
        }
    }

    /**
    Get the value of a property.
    */
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map
            .as_ref()
            .and_then(|map| map.get(key))
            .map(|v| &**v)
    }

    /**
    Iterate over the properties in key order.
    */
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map
            .iter()
            .flat_map(|map| map.iter())
            .map(|(k, v)| (&**k, &**v))
    }

    /**
    The stack of values, from the bottom up.
    */
    pub fn stack(&self) -> &[String] {
        self.stack.as_ref().map(|stack| &***stack).unwrap_or(&[])
    }

    /**
    Whether the snapshot has no properties or stack values.
    */
    pub fn is_empty(&self) -> bool {
        self.map.as_ref().map(|map| map.is_empty()).unwrap_or(true)
            && self.stack.as_ref().map(|s| s.is_empty()).unwrap_or(true)
    }
}

impl fmt::Debug for ContextSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSnapshot")
            .field("map", &self.iter().collect::<BTreeMap<_, _>>())
            .field("stack", &self.stack())
            .finish()
    }
}

/**
A [`ContextProvider`] that stores context in thread local storage.
*/
#[derive(Debug, Clone, Copy)]
pub struct ThreadLocalCtxt {
    id: usize,
}

impl Default for ThreadLocalCtxt {
    fn default() -> Self {
        Self::shared()
    }
}

impl ThreadLocalCtxt {
    /**
    Create a new thread local store with fully isolated storage.
    */
    pub fn new() -> Self {
        ThreadLocalCtxt { id: ctxt_id() }
    }

    /**
    Create a new thread local store sharing the same storage as any other [`ThreadLocalCtxt::shared`].
    */
    pub const fn shared() -> Self {
        ThreadLocalCtxt { id: 0 }
    }

    /**
    Set a property on the current thread.
    */
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        with_frame(self.id, |frame| {
            frame.map_mut().insert(key.into(), value.into());
        })
    }

    /**
    Remove a property from the current thread, returning its value.
    */
    pub fn remove(&self, key: &str) -> Option<String> {
        with_frame(self.id, |frame| {
            if frame.map.as_ref()?.contains_key(key) {
                frame.map_mut().remove(key)
            } else {
                None
            }
        })
    }

    /**
    Remove all properties and stack values from the current thread.
    */
    pub fn clear(&self) {
        with_frame(self.id, |frame| {
            *frame = Frame::default();
        })
    }

    /**
    Push a value onto the current thread's stack.
    */
    pub fn push(&self, value: impl Into<String>) {
        with_frame(self.id, |frame| frame.stack_mut().push(value.into()))
    }

    /**
    Pop the most recently pushed value off the current thread's stack.
    */
    pub fn pop(&self) -> Option<String> {
        with_frame(self.id, |frame| {
            if frame.stack.as_ref()?.is_empty() {
                None
            } else {
                frame.stack_mut().pop()
            }
        })
    }

    /**
    Set properties on the current thread until the returned [`Scope`] is dropped.

    When the scope is dropped, the context of the thread is restored to what it was before the scope was entered.
    */
    pub fn scope<K: Into<String>, V: Into<String>>(
        &self,
        props: impl IntoIterator<Item = (K, V)>,
    ) -> Scope {
        let mut frame = current(self.id);

        let mut props = props.into_iter().peekable();
        if props.peek().is_some() {
            let map = frame.map_mut();

            for (k, v) in props {
                map.insert(k.into(), v.into());
            }
        }

        swap(self.id, &mut frame);

        Scope {
            id: self.id,
            previous: frame,
        }
    }
}

impl ContextProvider for ThreadLocalCtxt {
    fn snapshot(&self) -> ContextSnapshot {
        let frame = current(self.id);

        ContextSnapshot {
            map: frame.map,
            stack: frame.stack,
        }
    }
}

/**
A guard returned by [`ThreadLocalCtxt::scope`].

Scopes must be dropped on the same thread they were created on, in the reverse order they were created in.
*/
#[must_use = "the scope is exited when this value is dropped"]
pub struct Scope {
    id: usize,
    previous: Frame,
}

impl Drop for Scope {
    fn drop(&mut self) {
        swap(self.id, &mut self.previous);
    }
}

#[derive(Clone, Default)]
struct Frame {
    map: Option<Arc<BTreeMap<String, String>>>,
    stack: Option<Arc<Vec<String>>>,
}

impl Frame {
    // Snapshots share the frame's maps, so they're cloned before being changed
    fn map_mut(&mut self) -> &mut BTreeMap<String, String> {
        Arc::make_mut(self.map.get_or_insert_with(Default::default))
    }

    fn stack_mut(&mut self) -> &mut Vec<String> {
        Arc::make_mut(self.stack.get_or_insert_with(Default::default))
    }
}

// Start this id from 1 so it doesn't intersect with the `shared` variant
static NEXT_CTXT_ID: Mutex<usize> = Mutex::new(1);

fn ctxt_id() -> usize {
    let mut next_id = NEXT_CTXT_ID.lock().unwrap();
    let id = *next_id;
    *next_id = id.wrapping_add(1);

    id
}

thread_local! {
    static ACTIVE: RefCell<HashMap<usize, Frame>> = RefCell::new(HashMap::new());
}

fn current(id: usize) -> Frame {
    ACTIVE.with(|active| active.borrow().get(&id).cloned().unwrap_or_default())
}

fn with_frame<R>(id: usize, f: impl FnOnce(&mut Frame) -> R) -> R {
    ACTIVE.with(|active| f(active.borrow_mut().entry(id).or_default()))
}

fn swap(id: usize, incoming: &mut Frame) {
    ACTIVE.with(|active| {
        let mut active = active.borrow_mut();

        let current = active.entry(id).or_default();

        mem::swap(current, incoming);
    })
}
