/*!
Blocking primitives for waiting on a ring buffer from synchronous code.
*/

use std::{
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

/**
A one-shot signal that threads can wait on with a timeout.

Once triggered, a trigger stays triggered. Clones share the same signal.
*/
#[derive(Clone)]
pub struct Trigger(Arc<(Mutex<bool>, Condvar)>);

impl Default for Trigger {
    fn default() -> Self {
        Trigger::new()
    }
}

impl Trigger {
    /**
    Create a new, untriggered signal.
    */
    pub fn new() -> Self {
        Trigger(Arc::new((Mutex::new(false), Condvar::new())))
    }

    /**
    Fire the signal, waking all waiters.
    */
    pub fn trigger(&self) {
        *(self.0).0.lock().unwrap() = true;
        (self.0).1.notify_all();
    }

    /**
    Whether the signal has fired.
    */
    pub fn is_triggered(&self) -> bool {
        *(self.0).0.lock().unwrap()
    }

    /**
    Wait for the signal to fire.

    This method returns `true` if the signal fired before `timeout` elapsed.
    */
    pub fn wait_timeout(&self, mut timeout: Duration) -> bool {
        let mut triggered = (self.0).0.lock().unwrap();

        loop {
            // The signal may have fired before we started waiting
            if *triggered {
                return true;
            }

            if timeout == Duration::ZERO {
                return false;
            }

            let now = Instant::now();
            match (self.0).1.wait_timeout(triggered, timeout).unwrap() {
                (guard, r) if !r.timed_out() => {
                    triggered = guard;

                    // Spurious wakeups count against the remaining timeout
                    timeout = match timeout.checked_sub(now.elapsed()) {
                        Some(timeout) => timeout,
                        None => return *triggered,
                    };
                }
                (guard, _) => return *guard,
            }
        }
    }
}

/*
A generation counter that producers park on while waiting for space.

Waiters read the generation, re-check their condition, then wait for it to change.
A notification between the read and the wait bumps the generation, so it isn't lost.
*/
pub(crate) struct Notify {
    generation: Mutex<u64>,
    cvar: Condvar,
}

impl Notify {
    pub(crate) fn new() -> Self {
        Notify {
            generation: Mutex::new(0),
            cvar: Condvar::new(),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        *self.generation.lock().unwrap()
    }

    pub(crate) fn notify_all(&self) {
        let mut generation = self.generation.lock().unwrap();
        *generation = generation.wrapping_add(1);

        self.cvar.notify_all();
    }

    pub(crate) fn wait_timeout(&self, seen: u64, timeout: Duration) {
        let generation = self.generation.lock().unwrap();

        let _ = self
            .cvar
            .wait_timeout_while(generation, timeout, |generation| *generation == seen)
            .unwrap();
    }
}
