//! Integration tests for the work-stealing scheduler

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parasol::runtime::TaskState;
use parasol::{Error, LockedBox, Scheduler, SchedulerConfig};

fn pool(workers: usize) -> Scheduler {
    Scheduler::new(SchedulerConfig::with_workers(workers))
}

// =============================================================================
// Join
// =============================================================================

#[test]
fn test_deep_nesting_on_two_workers() {
    fn sum(sched: &Scheduler, lo: u64, hi: u64) -> parasol::Result<u64> {
        if hi - lo <= 16 {
            return Ok((lo..hi).sum());
        }
        let mid = lo + (hi - lo) / 2;
        let inner = sched.clone();
        let right = sched.submit(move || sum(&inner, mid, hi));
        let left = sum(sched, lo, mid)?;
        Ok(left + sched.join(right)?)
    }

    let sched = pool(2);
    let outer = sched.clone();
    let handle = sched.submit(move || sum(&outer, 0, 10_000));
    assert_eq!(sched.join(handle), Ok(49_995_000));
    assert!(sched.stats().tasks_submitted > 500);
}

#[test]
fn test_handle_state_transitions() {
    let sched = pool(1);
    let release = Arc::new(AtomicBool::new(false));
    let gate = Arc::clone(&release);
    let handle = sched.submit(move || {
        while !gate.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        Ok("done")
    });
    assert_ne!(handle.state(), TaskState::Completed);
    release.store(true, Ordering::SeqCst);
    assert_eq!(sched.join(handle), Ok("done"));
}

#[test]
fn test_panic_is_captured() {
    let sched = pool(2);
    let handle = sched.submit::<(), _>(|| panic!("worker exploded"));
    match sched.join(handle) {
        Err(Error::TaskPanicked { message, .. }) => assert!(message.contains("worker exploded")),
        other => panic!("expected a captured panic, got {:?}", other),
    }
    // The pool survives the panic.
    assert_eq!(sched.join(sched.submit(|| Ok(1))), Ok(1));
}

#[test]
fn test_join_all_waits_for_every_task() {
    let sched = pool(2);
    let finished = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..10)
        .map(|i| {
            let finished = Arc::clone(&finished);
            sched.submit(move || {
                thread::sleep(Duration::from_millis(2));
                finished.fetch_add(1, Ordering::SeqCst);
                if i == 0 {
                    Err(Error::user("task 0 failed"))
                } else {
                    Ok(i)
                }
            })
        })
        .collect();
    assert_eq!(sched.join_all(handles), Err(Error::user("task 0 failed")));
    assert_eq!(finished.load(Ordering::SeqCst), 10);
}

#[test]
fn test_join_is_not_buried_under_a_parked_task() {
    // The get is queued behind the compute on the same worker; joining the compute
    // must not start the get, which would park until the put that follows the join.
    let sched = pool(1);
    let slot = Arc::new(LockedBox::<i64>::empty());
    let inner = sched.clone();
    let outer = sched.submit(move || {
        let compute = inner.submit(|| Ok((1..=100).sum::<i64>()));
        let getter = {
            let slot = Arc::clone(&slot);
            inner.submit(move || Ok(slot.get()))
        };
        let total = inner.join(compute)?;
        slot.put(42);
        Ok(total + inner.join(getter)?)
    });

    let mut waited = 0;
    while !outer.is_finished() && waited < 2000 {
        thread::sleep(Duration::from_millis(10));
        waited += 10;
    }
    assert!(outer.is_finished(), "outer task still blocked after 2s");
    assert_eq!(sched.join(outer), Ok(5092));
}

// =============================================================================
// Parking and Spare Workers
// =============================================================================

#[test]
fn test_parked_worker_is_compensated() {
    // One worker: the getter parks it, so the putter can only run on a spare.
    let sched = pool(1);
    let slot = Arc::new(LockedBox::<u32>::empty());
    let getter = {
        let slot = Arc::clone(&slot);
        sched.submit(move || Ok(slot.get()))
    };
    thread::sleep(Duration::from_millis(20));
    let putter = {
        let slot = Arc::clone(&slot);
        sched.submit(move || {
            slot.put(7);
            Ok(())
        })
    };
    assert_eq!(sched.join(putter), Ok(()));
    assert_eq!(sched.join(getter), Ok(7));

    let stats = sched.stats();
    assert!(stats.parks >= 1);
    assert!(stats.spares_spawned >= 1);
}

#[test]
fn test_spares_retire_when_idle() {
    let mut config = SchedulerConfig::with_workers(1);
    config.idle_timeout_ms = 10;
    let sched = Scheduler::new(config);
    let slot = Arc::new(LockedBox::<u32>::empty());
    let getters: Vec<_> = (0..4)
        .map(|_| {
            let slot = Arc::clone(&slot);
            sched.submit(move || Ok(slot.get()))
        })
        .collect();
    thread::sleep(Duration::from_millis(50));
    for i in 0..4 {
        slot.put(i);
    }
    let mut values = sched.join_all(getters).unwrap();
    values.sort_unstable();
    assert_eq!(values, vec![0, 1, 2, 3]);

    let mut live = sched.stats().live_workers;
    for _ in 0..200 {
        if live <= 1 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
        live = sched.stats().live_workers;
    }
    assert_eq!(live, 1);
}

// =============================================================================
// Scopes and Lifecycle
// =============================================================================

#[test]
fn test_scope_cancellation_reaches_siblings() {
    let sched = pool(2);
    let result = sched.scope(|scope| {
        let token = scope.cancellation().clone();
        scope.spawn(|| -> parasol::Result<()> { Err(Error::user("stop")) });
        scope.spawn(move || {
            for _ in 0..1000 {
                token.checkpoint()?;
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        });
        Ok(())
    });
    assert_eq!(result, Err(Error::user("stop")));
}

#[test]
fn test_global_scheduler_is_shared() {
    let a = Scheduler::global();
    let b = Scheduler::global();
    assert!(std::ptr::eq(a, b));
    assert!(a.worker_count() >= 1);
    assert_eq!(a.join(a.submit(|| Ok(5))), Ok(5));
}

#[test]
fn test_task_holding_a_clone_keeps_pool_alive() {
    let sched = pool(2);
    let inner = sched.clone();
    let handle = sched.submit(move || Ok(inner.in_worker()));
    assert_eq!(sched.join(handle), Ok(true));
    assert!(!sched.in_worker());
}
