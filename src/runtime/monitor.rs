//! Concurrent object monitor
//!
//! A [`Monitor`] owns the state of one concurrent object and mediates every access:
//!
//! - **locked** operations get exclusive access, one at a time;
//! - **queued** operations additionally wait until a caller-supplied predicate over the
//!   state holds, re-checked under exclusion;
//! - **plain** operations need no mediation because the caller owns the monitor
//!   outright ([`Monitor::get_mut`], [`Monitor::into_inner`]).
//!
//! Exclusion is an explicit token (`held`). When a guard that mutated the state is
//! released, pending waiters are re-scanned oldest first and the token is handed
//! directly to the first one whose predicate now holds, so a satisfied waiter cannot
//! be overtaken by a later locker and never observes a state in which its predicate
//! is false.
//!
//! A waiter that receives the token by hand-off re-scans on release even if it only
//! read the state, so several waiters satisfied by one change are resumed one after
//! another in arrival order.
//!
//! A panicking predicate never wedges the monitor: the token is released and the
//! panic resumes in the queued operation that supplied the predicate.
//!
//! A queued operation whose predicate never becomes true waits forever; liveness is
//! the caller's responsibility.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;

use crate::runtime::scheduler::Scheduler;

/// How an operation accesses a concurrent object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// No mediation; only available through unique ownership
    Plain,
    /// Exclusive access
    Locked,
    /// Exclusive access once a predicate over the state holds
    Queued,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Capability::Plain => write!(f, "plain"),
            Capability::Locked => write!(f, "locked"),
            Capability::Queued => write!(f, "queued"),
        }
    }
}

enum Grant {
    Waiting,
    Granted,
    /// The waiter's own predicate panicked during a re-scan
    Failed(Box<dyn Any + Send>),
}

/// A suspended queued operation
///
/// Created when a queued operation finds its predicate false; resumed when a
/// releasing operation grants it the exclusion token.
pub struct Waiter {
    ticket: u64,
    grant: Mutex<Grant>,
    signal: Condvar,
}

impl Waiter {
    fn new(ticket: u64) -> Self {
        Self {
            ticket,
            grant: Mutex::new(Grant::Waiting),
            signal: Condvar::new(),
        }
    }

    /// Arrival order among this monitor's waiters
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// True once the token has been handed to this waiter
    pub fn is_granted(&self) -> bool {
        matches!(*self.grant.lock(), Grant::Granted)
    }

    pub(crate) fn block(&self) {
        let mut grant = self.grant.lock();
        while matches!(*grant, Grant::Waiting) {
            self.signal.wait(&mut grant);
        }
    }

    pub(crate) fn wake(&self) {
        self.resolve(Grant::Granted);
    }

    fn fail(&self, payload: Box<dyn Any + Send>) {
        self.resolve(Grant::Failed(payload));
    }

    fn resolve(&self, outcome: Grant) {
        let mut grant = self.grant.lock();
        *grant = outcome;
        self.signal.notify_one();
    }

    fn take_failure(&self) -> Option<Box<dyn Any + Send>> {
        let mut grant = self.grant.lock();
        match mem::replace(&mut *grant, Grant::Granted) {
            Grant::Failed(payload) => Some(payload),
            other => {
                *grant = other;
                None
            }
        }
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("ticket", &self.ticket)
            .field("granted", &self.is_granted())
            .finish()
    }
}

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send>;

struct Pending<T> {
    waiter: Arc<Waiter>,
    predicate: Predicate<T>,
}

struct Control<T> {
    held: bool,
    next_ticket: u64,
    waiters: VecDeque<Pending<T>>,
}

/// Counters for one monitor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorStats {
    /// Locked operations entered
    pub locked_entries: usize,
    /// Queued operations entered
    pub queued_entries: usize,
    /// Queued operations that had to wait
    pub waits: usize,
    /// Waiters resumed by a token hand-off
    pub grants: usize,
}

#[derive(Default)]
struct Counters {
    locked_entries: AtomicUsize,
    queued_entries: AtomicUsize,
    waits: AtomicUsize,
    grants: AtomicUsize,
}

/// Monitor around the state of one concurrent object
pub struct Monitor<T> {
    name: Option<String>,
    state: Mutex<T>,
    control: Mutex<Control<T>>,
    entry: Condvar,
    counters: Counters,
}

impl<T> Monitor<T> {
    /// Create a monitor owning `state`
    pub fn new(state: T) -> Self {
        Self {
            name: None,
            state: Mutex::new(state),
            control: Mutex::new(Control {
                held: false,
                next_ticket: 0,
                waiters: VecDeque::new(),
            }),
            entry: Condvar::new(),
            counters: Counters::default(),
        }
    }

    /// Create a named monitor; the name shows up in trace events
    pub fn named(name: impl Into<String>, state: T) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(state)
        }
    }

    /// Optional diagnostic name
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Enter a locked operation; blocks until no other operation holds the token.
    /// The token is released when the guard drops.
    pub fn enter_locked(&self) -> MonitorGuard<'_, T> {
        self.counters.locked_entries.fetch_add(1, Ordering::Relaxed);
        self.acquire_token();
        MonitorGuard {
            monitor: self,
            state: self.state.lock(),
            capability: Capability::Locked,
            dirty: false,
            handed_off: false,
        }
    }

    /// Enter a queued operation: once the token is held, `predicate` is checked
    /// against the state. If it holds the guard is returned at once; otherwise the
    /// token is released and the caller parks until a later mutation satisfies it.
    pub fn enter_queued<P>(&self, predicate: P) -> MonitorGuard<'_, T>
    where
        P: Fn(&T) -> bool + Send + 'static,
    {
        self.counters.queued_entries.fetch_add(1, Ordering::Relaxed);
        self.acquire_token();
        let state = self.state.lock();
        match panic::catch_unwind(AssertUnwindSafe(|| predicate(&state))) {
            Ok(true) => {
                return MonitorGuard {
                    monitor: self,
                    state,
                    capability: Capability::Queued,
                    dirty: false,
                    handed_off: false,
                };
            }
            Ok(false) => {}
            Err(payload) => {
                self.release(&state, false);
                drop(state);
                panic::resume_unwind(payload);
            }
        }

        let waiter = {
            let mut control = self.control.lock();
            let ticket = control.next_ticket;
            control.next_ticket += 1;
            let waiter = Arc::new(Waiter::new(ticket));
            control.waiters.push_back(Pending {
                waiter: Arc::clone(&waiter),
                predicate: Box::new(predicate),
            });
            // Nothing changed, so no other waiter can have become satisfiable.
            control.held = false;
            self.entry.notify_one();
            waiter
        };
        drop(state);

        self.counters.waits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(monitor = ?self.name, ticket = waiter.ticket(), "queued operation waiting");
        Scheduler::park(&waiter);
        if let Some(payload) = waiter.take_failure() {
            panic::resume_unwind(payload);
        }

        // The token was handed over with the predicate true and the state untouched since.
        MonitorGuard {
            monitor: self,
            state: self.state.lock(),
            capability: Capability::Queued,
            dirty: false,
            handed_off: true,
        }
    }

    /// Run `body` as a locked operation
    pub fn locked<R>(&self, body: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.enter_locked();
        body(&mut guard)
    }

    /// Run a read-only locked operation. Waiters are not re-scanned afterwards.
    pub fn inspect<R>(&self, body: impl FnOnce(&T) -> R) -> R {
        let guard = self.enter_locked();
        body(&guard)
    }

    /// Run `body` as a queued operation gated by `predicate`
    pub fn queued<P, R>(&self, predicate: P, body: impl FnOnce(&mut T) -> R) -> R
    where
        P: Fn(&T) -> bool + Send + 'static,
    {
        let mut guard = self.enter_queued(predicate);
        body(&mut guard)
    }

    /// Re-check every pending waiter against the current state. Needed only when
    /// the state changed through interior mutability the guards could not see.
    pub fn wake_all(&self) {
        let mut guard = self.enter_locked();
        guard.mark_changed();
    }

    /// Number of queued operations currently waiting
    pub fn pending_waiters(&self) -> usize {
        self.control.lock().waiters.len()
    }

    /// Counter snapshot
    pub fn stats(&self) -> MonitorStats {
        MonitorStats {
            locked_entries: self.counters.locked_entries.load(Ordering::Relaxed),
            queued_entries: self.counters.queued_entries.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
            grants: self.counters.grants.load(Ordering::Relaxed),
        }
    }

    /// Plain access through unique ownership
    pub fn get_mut(&mut self) -> &mut T {
        self.state.get_mut()
    }

    /// Consume the monitor and return its state
    pub fn into_inner(self) -> T {
        self.state.into_inner()
    }

    fn acquire_token(&self) {
        let mut control = self.control.lock();
        while control.held {
            self.entry.wait(&mut control);
        }
        control.held = true;
    }

    /// Give up the token. `state` is still locked by the releasing guard, so the
    /// waiter predicates see exactly the state the operation left behind.
    fn release(&self, state: &T, rescan: bool) {
        let mut control = self.control.lock();
        if rescan {
            let mut pos = 0;
            while pos < control.waiters.len() {
                let check = panic::catch_unwind(AssertUnwindSafe(|| (control.waiters[pos].predicate)(state)));
                match check {
                    Ok(false) => pos += 1,
                    Ok(true) => {
                        if let Some(pending) = control.waiters.remove(pos) {
                            drop(control);
                            self.counters.grants.fetch_add(1, Ordering::Relaxed);
                            tracing::trace!(monitor = ?self.name, ticket = pending.waiter.ticket(), "granting waiter");
                            Scheduler::unpark(&pending.waiter);
                            return;
                        }
                    }
                    Err(payload) => {
                        if let Some(pending) = control.waiters.remove(pos) {
                            tracing::warn!(monitor = ?self.name, ticket = pending.waiter.ticket(), "queued predicate panicked");
                            pending.waiter.fail(payload);
                        }
                    }
                }
            }
        }
        control.held = false;
        self.entry.notify_one();
    }
}

impl<T: Default> Default for Monitor<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for Monitor<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("name", &self.name)
            .field("pending_waiters", &self.pending_waiters())
            .finish()
    }
}

/// Exclusive access to a monitor's state for the duration of one operation
pub struct MonitorGuard<'a, T> {
    monitor: &'a Monitor<T>,
    state: MutexGuard<'a, T>,
    capability: Capability,
    dirty: bool,
    /// Token arrived by hand-off; other waiters may be satisfied by the same change
    handed_off: bool,
}

impl<T> MonitorGuard<'_, T> {
    /// Capability this guard was entered with
    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// Force a waiter re-scan on release even if the state was not borrowed mutably
    pub fn mark_changed(&mut self) {
        self.dirty = true;
    }
}

impl<T> Deref for MonitorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.state
    }
}

impl<T> DerefMut for MonitorGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.dirty = true;
        &mut self.state
    }
}

impl<T> Drop for MonitorGuard<'_, T> {
    fn drop(&mut self) {
        self.monitor.release(&self.state, self.dirty || self.handed_off);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_locked_counter() {
        let monitor = Arc::new(Monitor::new(0i64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let monitor = Arc::clone(&monitor);
                thread::spawn(move || {
                    for _ in 0..250 {
                        monitor.locked(|n| *n += 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(monitor.inspect(|n| *n), 2000);
    }

    #[test]
    fn test_queued_waits_for_predicate() {
        let monitor = Arc::new(Monitor::named("threshold", 0i64));
        let waiter = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || monitor.queued(|n| *n >= 3, |n| *n))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(monitor.pending_waiters(), 1);
        for _ in 0..3 {
            monitor.locked(|n| *n += 1);
        }
        assert_eq!(waiter.join().unwrap(), 3);
        assert_eq!(monitor.pending_waiters(), 0);
        let stats = monitor.stats();
        assert_eq!(stats.waits, 1);
        assert_eq!(stats.grants, 1);
    }

    #[test]
    fn test_read_only_access_does_not_rescan() {
        let monitor = Monitor::new(vec![1, 2, 3]);
        let guard = monitor.enter_locked();
        assert_eq!(guard.capability(), Capability::Locked);
        assert_eq!(guard.len(), 3);
        assert!(!guard.dirty);
    }

    #[test]
    fn test_fifo_among_satisfied_waiters() {
        let monitor = Arc::new(Monitor::new(Vec::<u64>::new()));
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for id in 0..4u64 {
            let worker = Arc::clone(&monitor);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                worker.queued(|v| !v.is_empty(), |v| {
                    v.pop();
                    order.lock().push(id);
                });
            }));
            // Stagger arrivals so tickets follow `id`.
            while monitor.pending_waiters() < (id + 1) as usize {
                thread::sleep(Duration::from_millis(1));
            }
        }
        for _ in 0..4 {
            monitor.locked(|v| v.push(1));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_one_change_resumes_every_satisfied_reader() {
        let monitor = Arc::new(Monitor::new(0i64));
        let readers: Vec<_> = (0..2)
            .map(|_| {
                let monitor = Arc::clone(&monitor);
                thread::spawn(move || {
                    let guard = monitor.enter_queued(|n| *n >= 3);
                    *guard
                })
            })
            .collect();
        while monitor.pending_waiters() < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        monitor.locked(|n| *n = 3);
        for r in readers {
            assert_eq!(r.join().unwrap(), 3);
        }
        assert_eq!(monitor.pending_waiters(), 0);
        assert_eq!(monitor.stats().grants, 2);
    }

    #[test]
    fn test_panicking_predicate_releases_token() {
        let monitor = Arc::new(Monitor::new(0i64));
        let entrant = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || monitor.queued(|n| if *n == 0 { panic!("bad predicate") } else { true }, |n| *n))
        };
        assert!(entrant.join().is_err());
        monitor.locked(|n| *n += 1);
        assert_eq!(monitor.inspect(|n| *n), 1);
    }

    #[test]
    fn test_predicate_panicking_during_rescan_fails_its_waiter() {
        let monitor = Arc::new(Monitor::new(0i64));
        let waiter = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || {
                monitor.queued(
                    |n| match *n {
                        0 => false,
                        _ => panic!("rescan blew up"),
                    },
                    |n| *n,
                )
            })
        };
        while monitor.pending_waiters() < 1 {
            thread::sleep(Duration::from_millis(1));
        }
        monitor.locked(|n| *n = 5);
        assert!(waiter.join().is_err());
        assert_eq!(monitor.pending_waiters(), 0);
        assert_eq!(monitor.locked(|n| *n), 5);
    }

    #[test]
    fn test_plain_access() {
        let mut monitor = Monitor::new(String::from("a"));
        monitor.get_mut().push('b');
        assert_eq!(monitor.into_inner(), "ab");
    }
}
