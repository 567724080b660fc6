/*!
A bounded ring buffer for handing events from application threads to a single background consumer.

This library implements a fixed-capacity channel with the following properties:

- **Lock-free claims:** Any number of [`Producer`]s can claim slots concurrently. Each claim is a compare-and-swap on a shared tail counter, so every producer receives a distinct, monotonically increasing sequence number.
- **Ordered drains:** The single [`Consumer`] drains published slots in sequence order. A slot that has been claimed but not yet published holds back the slots after it, so the consumer never observes a gap or reads a half-written slot.
- **Pre-allocated slots:** Storage for every slot is allocated up-front. Values are moved into a slot on publish and moved back out on drain.
- **Backpressure:** A full buffer can either be reported to the caller with [`Producer::try_publish`], or waited out with [`Producer::publish_blocking`]. Blocked producers park until the consumer releases slots, the buffer is closed, or their [`Cancel`] token fires.

The capacity of a buffer must be a power of two so slot indexes can be computed with a mask.
*/

#![deny(missing_docs)]

use std::{
    cell::UnsafeCell,
    error, fmt,
    sync::{
        atomic::{self, AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_utils::{
    sync::{Parker, Unparker},
    Backoff, CachePadded,
};

pub mod sync;

use sync::Notify;

// Producers waiting for space re-check their cancellation token at least this often
const PARK_SLICE: Duration = Duration::from_millis(10);

/**
Create a [`Producer`] and [`Consumer`] pair over a ring buffer with room for `capacity` values.

The `capacity` must be a power of two, and at least `2`.
*/
pub fn ring<T>(capacity: usize) -> Result<(Producer<T>, Consumer<T>), CapacityError> {
    if capacity < 2 || !capacity.is_power_of_two() {
        return Err(CapacityError { capacity });
    }

    let parker = Parker::new();

    let slots = (0..capacity)
        .map(|i| Slot {
            sequence: AtomicUsize::new(i),
            value: UnsafeCell::new(None),
        })
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let ring = Arc::new(Ring {
        slots,
        mask: capacity - 1,
        capacity,
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
        closed: AtomicBool::new(false),
        consumer_parked: AtomicBool::new(false),
        consumer_unparker: parker.unparker().clone(),
        space: Notify::new(),
        space_waiters: AtomicUsize::new(0),
    });

    Ok((
        Producer { ring: ring.clone() },
        Consumer { ring, parker },
    ))
}

struct Ring<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    capacity: usize,
    // The next position the consumer will read; only the consumer writes it
    head: CachePadded<AtomicUsize>,
    // The next position a producer will claim
    tail: CachePadded<AtomicUsize>,
    closed: AtomicBool,
    consumer_parked: AtomicBool,
    consumer_unparker: Unparker,
    space: Notify,
    space_waiters: AtomicUsize,
}

/*
The sequence of a slot encodes its state for a given position `p`, where `p & mask` is the slot index:

- `p`: free; a producer may claim it.
- `p` with `tail > p`: claimed; the producer is writing its value.
- `p + 1`: ready; the consumer may take its value.
- `p + capacity`: consumed; free for position `p + capacity` on the next lap.
*/
struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<Option<T>>,
}

// SAFETY: Access to slot values is coordinated through their sequences.
// A value is only written by the producer holding the claim for its position,
// and only read by the consumer after that producer has published it
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    fn slot(&self, position: usize) -> &Slot<T> {
        &self.slots[position & self.mask]
    }

    fn len(&self) -> usize {
        // Load the head first; the tail can only be ahead of it
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);

        tail.wrapping_sub(head).min(self.capacity)
    }

    fn wake_consumer(&self) {
        // Pairs with the fence in `Consumer::wait_timeout`
        atomic::fence(Ordering::SeqCst);

        if self.consumer_parked.load(Ordering::Relaxed) {
            self.consumer_unparker.unpark();
        }
    }

    fn wake_producers(&self) {
        atomic::fence(Ordering::SeqCst);

        if self.space_waiters.load(Ordering::Relaxed) > 0 {
            self.space.notify_all();
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        self.space.notify_all();
        self.consumer_unparker.unpark();
    }
}

/**
The publishing half of a ring buffer.

Producers can be cloned and shared freely between threads.
*/
pub struct Producer<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Producer {
            ring: self.ring.clone(),
        }
    }
}

impl<T> Producer<T> {
    /**
    Try claim the next free slot in the buffer.

    If the buffer is full this method returns `None`. Otherwise the returned [`Claim`] owns the slot until it's published. A claim that's dropped without being published is released as an empty entry that the consumer skips over.

    The consumer can't drain past a claimed slot until it's released, so claims should be published promptly.
    */
    pub fn try_claim(&self) -> Option<Claim<'_, T>> {
        let ring = &*self.ring;
        let backoff = Backoff::new();

        let mut tail = ring.tail.load(Ordering::Relaxed);

        loop {
            let slot = ring.slot(tail);
            let sequence = slot.sequence.load(Ordering::Acquire);

            let lag = sequence.wrapping_sub(tail) as isize;

            if lag == 0 {
                match ring.tail.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        return Some(Claim {
                            ring,
                            position: tail,
                            committed: false,
                        })
                    }
                    Err(current) => {
                        tail = current;
                        backoff.spin();
                    }
                }
            } else if lag < 0 {
                // The slot still belongs to the previous lap
                // Only report full if our view of the tail isn't stale
                atomic::fence(Ordering::SeqCst);

                let head = ring.head.load(Ordering::Relaxed);

                if head.wrapping_add(ring.capacity) == tail {
                    return None;
                }

                backoff.spin();
                tail = ring.tail.load(Ordering::Relaxed);
            } else {
                // Another producer claimed this position first
                backoff.snooze();
                tail = ring.tail.load(Ordering::Relaxed);
            }
        }
    }

    /**
    Try publish a value into the buffer without waiting.

    On success, this method returns the sequence number assigned to the value. If the buffer is full, the value is handed back in [`Full`].
    */
    pub fn try_publish(&self, value: T) -> Result<u64, Full<T>> {
        match self.try_claim() {
            Some(claim) => Ok(claim.publish(value)),
            None => Err(Full(value)),
        }
    }

    /**
    Claim the next free slot in the buffer, waiting for one if it's currently full.

    The wait ends early if the buffer is closed or `cancel` fires. When cancelled, one final attempt is made to claim a slot before giving up.
    */
    pub fn claim_blocking(&self, cancel: &Cancel) -> Result<Claim<'_, T>, WaitError> {
        let ring = &*self.ring;
        let backoff = Backoff::new();

        loop {
            if let Some(claim) = self.try_claim() {
                return Ok(claim);
            }

            if ring.closed.load(Ordering::Acquire) {
                return Err(WaitError::Closed);
            }

            if cancel.is_cancelled() {
                return self.try_claim().ok_or(WaitError::Cancelled);
            }

            // Spin for a little while before parking
            if !backoff.is_completed() {
                ring.wake_consumer();
                backoff.snooze();
                continue;
            }

            let generation = ring.space.generation();
            ring.space_waiters.fetch_add(1, Ordering::SeqCst);

            // NOTE: The consumer may have released slots between our last attempt
            // and registering as a waiter without notifying us
            if let Some(claim) = self.try_claim() {
                ring.space_waiters.fetch_sub(1, Ordering::SeqCst);
                return Ok(claim);
            }

            ring.wake_consumer();
            ring.space.wait_timeout(generation, PARK_SLICE);

            ring.space_waiters.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /**
    Publish a value into the buffer, waiting for a free slot if it's currently full.

    The wait ends early if the buffer is closed or `cancel` fires. In either case the value is handed back in the returned [`PublishError`], so the caller always knows whether it was published.
    */
    pub fn publish_blocking(&self, value: T, cancel: &Cancel) -> Result<u64, PublishError<T>> {
        match self.claim_blocking(cancel) {
            Ok(claim) => Ok(claim.publish(value)),
            Err(WaitError::Closed) => Err(PublishError::Closed(value)),
            Err(WaitError::Cancelled) => Err(PublishError::Cancelled(value)),
        }
    }

    /**
    Close the buffer.

    Producers blocked in [`Producer::publish_blocking`] return [`PublishError::Closed`] and the consumer is woken. Values already published can still be drained. Closing doesn't prevent further calls to [`Producer::try_publish`]; it's up to callers to stop producing.
    */
    pub fn close(&self) {
        self.ring.close();
    }

    /**
    Whether [`Producer::close`] has been called.
    */
    pub fn is_closed(&self) -> bool {
        self.ring.closed.load(Ordering::Acquire)
    }

    /**
    The total number of slots in the buffer.
    */
    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    /**
    The number of slots currently claimed or holding values.
    */
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /**
    Whether the buffer is currently empty.
    */
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /**
    The number of slots currently free.

    This value is read without locking, so it may already be stale by the time it's observed.
    */
    pub fn remaining_capacity(&self) -> usize {
        self.ring.capacity - self.ring.len()
    }

    /**
    The total number of slots ever claimed.

    This is the sequence number the next claim will receive.
    */
    pub fn position(&self) -> u64 {
        self.ring.tail.load(Ordering::Acquire) as u64
    }
}

/**
A claimed slot in a ring buffer.

Claims are returned by [`Producer::try_claim`]. Call [`Claim::publish`] to move a value into the slot and make it visible to the consumer.
*/
pub struct Claim<'a, T> {
    ring: &'a Ring<T>,
    position: usize,
    committed: bool,
}

impl<'a, T> Claim<'a, T> {
    /**
    The sequence number of the claimed slot.
    */
    pub fn sequence(&self) -> u64 {
        self.position as u64
    }

    /**
    Move a value into the slot and make it visible to the consumer.
    */
    pub fn publish(mut self, value: T) -> u64 {
        self.commit(Some(value));

        self.position as u64
    }

    fn commit(&mut self, value: Option<T>) {
        let slot = self.ring.slot(self.position);

        // SAFETY: This claim is the only writer of the slot for its position,
        // and the consumer won't read it until the sequence below is stored
        unsafe {
            *slot.value.get() = value;
        }

        slot.sequence
            .store(self.position.wrapping_add(1), Ordering::Release);

        self.committed = true;

        self.ring.wake_consumer();
    }
}

impl<'a, T> Drop for Claim<'a, T> {
    fn drop(&mut self) {
        if !self.committed {
            self.commit(None);
        }
    }
}

/**
The draining half of a ring buffer.

There's only ever a single consumer for a given buffer. It can be moved between threads, but not shared.
*/
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
    parker: Parker,
}

impl<T> Consumer<T> {
    /**
    Drain up to `max` published values into `buf`, in sequence order.

    This method returns the number of values drained. It stops at the first slot that hasn't been published yet, even if later slots have been.
    */
    pub fn drain_into(&mut self, buf: &mut Vec<T>, max: usize) -> usize {
        let ring = &*self.ring;

        let mut head = ring.head.load(Ordering::Relaxed);
        let mut drained = 0;
        let mut released = false;

        while drained < max {
            let slot = ring.slot(head);

            if slot.sequence.load(Ordering::Acquire) != head.wrapping_add(1) {
                break;
            }

            // SAFETY: The slot was published for this position and
            // no producer can claim it again until we advance its sequence
            let value = unsafe { (*slot.value.get()).take() };

            slot.sequence
                .store(head.wrapping_add(ring.capacity), Ordering::Release);

            head = head.wrapping_add(1);
            ring.head.store(head, Ordering::Release);

            released = true;

            // Abandoned claims release their slot without a value
            if let Some(value) = value {
                buf.push(value);
                drained += 1;
            }
        }

        if released {
            ring.wake_producers();
        }

        drained
    }

    /**
    Drain up to `max` published values, in sequence order.
    */
    pub fn drain_batch(&mut self, max: usize) -> Vec<T> {
        let mut batch = Vec::with_capacity(max.min(self.ring.len()));

        self.drain_into(&mut batch, max);

        batch
    }

    /**
    Park the calling thread until a value is published, the buffer is closed, or `timeout` elapses.

    This method may return spuriously.
    */
    pub fn wait_timeout(&mut self, timeout: Duration) {
        let ring = &*self.ring;

        ring.consumer_parked.store(true, Ordering::SeqCst);

        // Pairs with the fence in `Ring::wake_consumer`
        atomic::fence(Ordering::SeqCst);

        if !self.is_ready() && !ring.closed.load(Ordering::Relaxed) {
            self.parker.park_timeout(timeout);
        }

        ring.consumer_parked.store(false, Ordering::Relaxed);
    }

    /**
    Whether the next slot has been published and can be drained.
    */
    pub fn is_ready(&self) -> bool {
        let ring = &*self.ring;

        let head = ring.head.load(Ordering::Relaxed);

        ring.slot(head).sequence.load(Ordering::Acquire) == head.wrapping_add(1)
    }

    /**
    Whether the buffer has been closed.
    */
    pub fn is_closed(&self) -> bool {
        self.ring.closed.load(Ordering::Acquire)
    }

    /**
    The total number of slots in the buffer.
    */
    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    /**
    The number of slots currently claimed or holding values.
    */
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /**
    Whether the buffer is currently empty.
    */
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /**
    The number of slots currently free.
    */
    pub fn remaining_capacity(&self) -> usize {
        self.ring.capacity - self.ring.len()
    }

    /**
    The total number of slots ever drained, including abandoned claims.

    Every value published with a sequence lower than this position has been drained.
    */
    pub fn position(&self) -> u64 {
        self.ring.head.load(Ordering::Acquire) as u64
    }
}

/**
A token that can interrupt a producer waiting in [`Producer::publish_blocking`].
*/
#[derive(Clone, Default)]
pub struct Cancel(Option<Arc<AtomicBool>>);

impl Cancel {
    /**
    Create a new token that can be cancelled.
    */
    pub fn new() -> Self {
        Cancel(Some(Arc::new(AtomicBool::new(false))))
    }

    /**
    A token that never fires.

    This method doesn't allocate.
    */
    pub const fn never() -> Self {
        Cancel(None)
    }

    /**
    Fire the token.

    Any producer waiting on it will stop waiting within a short interval.
    */
    pub fn cancel(&self) {
        if let Some(ref cancelled) = self.0 {
            cancelled.store(true, Ordering::Release);
        }
    }

    /**
    Whether the token has fired.
    */
    pub fn is_cancelled(&self) -> bool {
        self.0
            .as_ref()
            .map(|cancelled| cancelled.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

impl fmt::Debug for Cancel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancel")
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

/**
The buffer was full, so the value couldn't be published.
*/
pub struct Full<T>(pub T);

impl<T> Full<T> {
    /**
    Get back the value that couldn't be published.
    */
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Full(..)")
    }
}

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the ring buffer is full")
    }
}

impl<T> error::Error for Full<T> {}

/**
An error waiting to publish a value with [`Producer::publish_blocking`].

The value that couldn't be published is carried by each variant.
*/
pub enum PublishError<T> {
    /**
    The buffer was closed while waiting.
    */
    Closed(T),
    /**
    The [`Cancel`] token fired while waiting.
    */
    Cancelled(T),
}

impl<T> PublishError<T> {
    /**
    Get back the value that couldn't be published.
    */
    pub fn into_inner(self) -> T {
        match self {
            PublishError::Closed(value) | PublishError::Cancelled(value) => value,
        }
    }
}

impl<T> fmt::Debug for PublishError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::Closed(_) => f.write_str("Closed(..)"),
            PublishError::Cancelled(_) => f.write_str("Cancelled(..)"),
        }
    }
}

impl<T> fmt::Display for PublishError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::Closed(_) => f.write_str("the ring buffer was closed"),
            PublishError::Cancelled(_) => {
                f.write_str("cancelled while waiting for space in the ring buffer")
            }
        }
    }
}

impl<T> error::Error for PublishError<T> {}

/**
An error waiting for a slot with [`Producer::claim_blocking`].
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /**
    The buffer was closed while waiting.
    */
    Closed,
    /**
    The [`Cancel`] token fired while waiting.
    */
    Cancelled,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Closed => f.write_str("the ring buffer was closed"),
            WaitError::Cancelled => {
                f.write_str("cancelled while waiting for space in the ring buffer")
            }
        }
    }
}

impl error::Error for WaitError {}

/**
An invalid capacity was given to [`ring`].
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityError {
    capacity: usize,
}

impl CapacityError {
    /**
    The capacity that was rejected.
    */
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Display for CapacityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ring buffer capacity must be a power of two of at least 2, but got {}",
            self.capacity
        )
    }
}

impl error::Error for CapacityError {}
