//! `LockedBox`: a single-slot concurrent object
//!
//! The box holds at most one value. `put` waits for the slot to be empty and
//! `get` waits for it to be full, so producers and consumers rendezvous through the
//! box without losing or duplicating values. `set`, `content` and `remove` are
//! plain locked operations that never wait on the slot.

use std::fmt;

use crate::runtime::monitor::{Monitor, MonitorStats};

/// Single-slot concurrent box
pub struct LockedBox<T> {
    slot: Monitor<Option<T>>,
}

impl<T: Send + 'static> LockedBox<T> {
    /// Create a box, optionally seeded with a value
    pub fn new(initial: Option<T>) -> Self {
        Self {
            slot: Monitor::named("locked_box", initial),
        }
    }

    /// Create an empty box
    pub fn empty() -> Self {
        Self::new(None)
    }

    /// Queued: wait until the box is empty, then store `value`
    pub fn put(&self, value: T) {
        self.slot.queued(Option::is_none, move |slot| *slot = Some(value));
    }

    /// Locked: store `value` unconditionally, returning whatever it replaced
    pub fn set(&self, value: T) -> Option<T> {
        self.slot.locked(move |slot| slot.replace(value))
    }

    /// Locked: take the current value, leaving the box empty
    pub fn remove(&self) -> Option<T> {
        // Only borrow mutably when there is something to take, so an empty
        // remove does not trigger a waiter re-scan.
        let mut guard = self.slot.enter_locked();
        if guard.is_some() {
            guard.take()
        } else {
            None
        }
    }

    /// Queued: wait until the box holds a value, then take it
    pub fn get(&self) -> T {
        loop {
            // Granted only while the slot is full, so the first pass always returns.
            if let Some(value) = self.slot.queued(Option::is_some, Option::take) {
                return value;
            }
        }
    }

    /// Number of `put`/`get` calls currently waiting
    pub fn pending_waiters(&self) -> usize {
        self.slot.pending_waiters()
    }

    /// Counters of the underlying monitor
    pub fn stats(&self) -> MonitorStats {
        self.slot.stats()
    }
}

impl<T: Clone + Send + 'static> LockedBox<T> {
    /// Locked: copy of the current value, if any
    pub fn content(&self) -> Option<T> {
        self.slot.inspect(Clone::clone)
    }
}

impl<T: Send + 'static> Default for LockedBox<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> fmt::Debug for LockedBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LockedBox")
            .field("pending_waiters", &self.slot.pending_waiters())
            .finish()
    }
}
