//! Integration tests for concurrent objects
//!
//! These tests drive `Monitor` and `LockedBox` from many task units at once and
//! check that nothing is lost, duplicated, or run without exclusion.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parasol::runtime::Capability;
use parasol::{LockedBox, LoopConfig, LoopControl, LoopMode, Monitor, ParallelLoop, Scheduler, SchedulerConfig};

fn pool(workers: usize) -> Scheduler {
    Scheduler::new(SchedulerConfig::with_workers(workers))
}

fn wait_for_waiters<T>(monitor: &Monitor<T>, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while monitor.pending_waiters() < count {
        assert!(Instant::now() < deadline, "waiters never queued");
        thread::sleep(Duration::from_millis(1));
    }
}

// =============================================================================
// Locked_Box Scenario
// =============================================================================

#[test]
fn test_locked_box_scenario() {
    let sched = pool(4);
    let slot = Arc::new(LockedBox::<i64>::empty());

    let gets: Vec<_> = (0..29)
        .map(|_| {
            let slot = Arc::clone(&slot);
            sched.submit(move || Ok(slot.get()))
        })
        .collect();
    let puts: Vec<_> = (30..100)
        .map(|i| {
            let slot = Arc::clone(&slot);
            sched.submit(move || {
                slot.put(i);
                Ok(())
            })
        })
        .collect();

    let received = sched.join_all(gets).unwrap();
    assert_eq!(received.len(), 29);
    let mut seen = BTreeSet::new();
    for value in &received {
        assert!((30..100).contains(value));
        assert!(seen.insert(*value), "value {} handed out twice", value);
    }

    // 41 values remain: one in the box, the rest held by waiting producers.
    // Each remove empties the box and hands it to the oldest waiting put.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut remaining = Vec::new();
    while remaining.len() < 41 {
        assert!(Instant::now() < deadline, "only {} leftovers surfaced", remaining.len());
        let Some(peek) = slot.content() else {
            thread::yield_now();
            continue;
        };
        // Producers only fill an empty box, so the peeked value is still there
        assert_eq!(slot.remove(), Some(peek));
        assert!(seen.insert(peek), "value {} observed twice", peek);
        remaining.push(peek);
    }
    sched.join_all(puts).unwrap();

    assert_eq!(remaining.len(), 41);
    assert_eq!(seen, (30..100).collect::<BTreeSet<_>>());
    assert_eq!(slot.remove(), None);
    assert_eq!(slot.content(), None);
    assert_eq!(slot.pending_waiters(), 0);
    assert!(sched.stats().parks > 0);
}

#[test]
fn test_put_then_get_never_loses_values() {
    let sched = pool(3);
    let slot = Arc::new(LockedBox::<usize>::empty());
    let driver = ParallelLoop::with_config(sched, LoopConfig::per_iteration());
    let taken = driver
        .map(
            0..=49,
            {
                let slot = Arc::clone(&slot);
                move |i| {
                    slot.put(i as usize);
                    Ok(slot.get())
                }
            },
            LoopMode::Concurrent,
        )
        .unwrap();
    let unique: BTreeSet<_> = taken.iter().copied().collect();
    assert_eq!(unique, (0..50).collect::<BTreeSet<_>>());
    assert_eq!(slot.content(), None);
}

#[test]
fn test_get_blocks_until_put_from_task() {
    let sched = pool(2);
    let slot = Arc::new(LockedBox::<i64>::empty());
    let getter = {
        let slot = Arc::clone(&slot);
        sched.submit(move || Ok(slot.get()))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!getter.is_finished());
    slot.put(42);
    assert_eq!(sched.join(getter), Ok(42));
    assert_eq!(slot.content(), None);
}

// =============================================================================
// Monitor Exclusion
// =============================================================================

#[test]
fn test_at_most_one_critical_section() {
    let sched = pool(4);
    let monitor = Arc::new(Monitor::new(0u64));
    let active = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(AtomicUsize::new(0));

    let outcome = ParallelLoop::new(sched)
        .run(
            1..=400,
            {
                let monitor = Arc::clone(&monitor);
                let active = Arc::clone(&active);
                let overlap = Arc::clone(&overlap);
                move |i| {
                    let body = |count: &mut u64| {
                        if active.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlap.fetch_add(1, Ordering::SeqCst);
                        }
                        *count += 1;
                        active.fetch_sub(1, Ordering::SeqCst);
                    };
                    if i % 2 == 0 {
                        monitor.locked(body);
                    } else {
                        monitor.queued(|_| true, body);
                    }
                    Ok(LoopControl::Continue)
                }
            },
            LoopMode::Concurrent,
        )
        .unwrap();

    assert_eq!(outcome.iterations(), 400);
    assert_eq!(overlap.load(Ordering::SeqCst), 0);
    let stats = monitor.stats();
    assert_eq!(stats.locked_entries, 200);
    assert_eq!(stats.queued_entries, 200);
    assert_eq!(monitor.inspect(|c| *c), 400);
}

#[test]
fn test_queued_waits_for_threshold() {
    let sched = pool(2);
    let monitor = Arc::new(Monitor::named("threshold", 0i64));
    let waiter = {
        let monitor = Arc::clone(&monitor);
        sched.submit(move || Ok(monitor.queued(|n| *n >= 3, |n| *n)))
    };
    for _ in 0..3 {
        thread::sleep(Duration::from_millis(10));
        monitor.locked(|n| *n += 1);
    }
    assert_eq!(sched.join(waiter), Ok(3));
    assert_eq!(monitor.pending_waiters(), 0);
}

#[test]
fn test_wake_all_rechecks_after_interior_change() {
    let sched = pool(2);
    let monitor = Arc::new(Monitor::new(Arc::new(AtomicBool::new(false))));
    let waiter = {
        let monitor = Arc::clone(&monitor);
        sched.submit(move || Ok(monitor.queued(|ready| ready.load(Ordering::SeqCst), |_| 7)))
    };
    wait_for_waiters(&monitor, 1);

    // The flag flips behind the monitor's back; no guard marks the state changed
    let flag = monitor.inspect(Arc::clone);
    flag.store(true, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());
    assert_eq!(monitor.pending_waiters(), 1);

    monitor.wake_all();
    assert_eq!(sched.join(waiter), Ok(7));
    assert_eq!(monitor.pending_waiters(), 0);
}

#[test]
fn test_one_update_satisfies_several_waiters() {
    let sched = pool(2);
    let monitor = Arc::new(Monitor::named("gate", 0i64));
    let readers: Vec<_> = (1..=3)
        .map(|threshold| {
            let monitor = Arc::clone(&monitor);
            sched.submit(move || Ok(monitor.queued(move |n| *n >= threshold, |n| *n)))
        })
        .collect();
    let writer = {
        let monitor = Arc::clone(&monitor);
        sched.submit(move || {
            Ok(monitor.queued(
                |n| *n >= 2,
                |n| {
                    *n += 1;
                    *n
                },
            ))
        })
    };
    wait_for_waiters(&monitor, 4);

    monitor.locked(|n| *n = 10);

    let read = sched.join_all(readers).unwrap();
    assert!(read.iter().all(|v| (10..=11).contains(v)), "readers saw {:?}", read);
    assert_eq!(sched.join(writer), Ok(11));
    assert_eq!(monitor.pending_waiters(), 0);
    assert_eq!(monitor.inspect(|n| *n), 11);
    assert_eq!(monitor.stats().grants, 4);
}

#[test]
fn test_guard_reports_capability() {
    let monitor = Monitor::new(vec![1, 2, 3]);
    {
        let guard = monitor.enter_locked();
        assert_eq!(guard.capability(), Capability::Locked);
        assert_eq!(guard.len(), 3);
    }
    {
        let mut guard = monitor.enter_queued(|v: &Vec<i32>| !v.is_empty());
        assert_eq!(guard.capability(), Capability::Queued);
        guard.push(4);
    }
    assert_eq!(monitor.into_inner(), vec![1, 2, 3, 4]);
}
