//! Fork-join primitives
//!
//! Independent operands are evaluated as separate task units and joined before the
//! combining step. Nothing orders the operands relative to each other: side
//! effects in different operands may happen in any order, or at the same time.
//! The only shared mutable state they may touch safely is a
//! [`Monitor`](crate::runtime::Monitor), which keeps that unordered but free of
//! data races.

use crate::error::{Error, Result};
use crate::runtime::Scheduler;

/// Deferred computation submitted as a task unit
pub type Thunk<T> = Box<dyn FnOnce() -> Result<T> + Send + 'static>;

/// Evaluate `left` and `right` in parallel and combine their values.
///
/// `right` is forked as a task unit while `left` runs on the calling task unit;
/// both are always joined, even when one fails, and the left failure is
/// reported first.
pub fn fork_join<A, B, R, FA, FB, C>(scheduler: &Scheduler, left: FA, right: FB, combine: C) -> Result<R>
where
    B: Send + 'static,
    FA: FnOnce() -> Result<A>,
    FB: FnOnce() -> Result<B> + Send + 'static,
    C: FnOnce(A, B) -> Result<R>,
{
    let forked = scheduler.submit(right);
    let left = left();
    let right = scheduler.join(forked);
    combine(left?, right?)
}

/// Evaluate a list of operands in parallel; values come back in operand order.
pub fn fork_join_all<T>(scheduler: &Scheduler, mut thunks: Vec<Thunk<T>>) -> Result<Vec<T>>
where
    T: Send + 'static,
{
    if thunks.len() <= 1 {
        return thunks.pop().map(|t| t()).transpose().map(|v| v.into_iter().collect());
    }

    let first = thunks.remove(0);
    let forked: Vec<_> = thunks.into_iter().map(|t| scheduler.submit(t)).collect();
    let head = first();
    let tail = scheduler.join_all(forked);

    match (head, tail) {
        (Ok(head), Ok(tail)) => {
            let mut values = Vec::with_capacity(tail.len() + 1);
            values.push(head);
            values.extend(tail);
            Ok(values)
        }
        // A cancelled head usually means a sibling failed for real
        (Err(e), Err(sibling)) if e.is_cancellation() => Err(sibling),
        (Err(e), _) | (Ok(_), Err(e)) => Err(e),
    }
}

/// Short-circuit `and then`: `right` runs only when `left` is true
pub fn and_then<L, R>(left: L, right: R) -> Result<bool>
where
    L: FnOnce() -> Result<bool>,
    R: FnOnce() -> Result<bool>,
{
    if !left()? {
        return Ok(false);
    }
    right()
}

/// Short-circuit `or else`: `right` runs only when `left` is false
pub fn or_else<L, R>(left: L, right: R) -> Result<bool>
where
    L: FnOnce() -> Result<bool>,
    R: FnOnce() -> Result<bool>,
{
    if left()? {
        return Ok(true);
    }
    right()
}

/// Non-short-circuit `and`: both operands are evaluated, in parallel
pub fn parallel_and<L, R>(scheduler: &Scheduler, left: L, right: R) -> Result<bool>
where
    L: FnOnce() -> Result<bool>,
    R: FnOnce() -> Result<bool> + Send + 'static,
{
    fork_join(scheduler, left, right, |a, b| Ok(a && b))
}

/// Non-short-circuit `or`: both operands are evaluated, in parallel
pub fn parallel_or<L, R>(scheduler: &Scheduler, left: L, right: R) -> Result<bool>
where
    L: FnOnce() -> Result<bool>,
    R: FnOnce() -> Result<bool> + Send + 'static,
{
    fork_join(scheduler, left, right, |a, b| Ok(a || b))
}

/// Evaluate the thunks in parallel and fail with `Error::UserError` if any value is false.
/// Handy for checking several independent conditions at once.
pub fn all_hold(scheduler: &Scheduler, checks: Vec<(String, Thunk<bool>)>) -> Result<()> {
    let (names, thunks): (Vec<_>, Vec<_>) = checks.into_iter().unzip();
    let results = fork_join_all(scheduler, thunks)?;
    match names.into_iter().zip(results).find(|(_, ok)| !ok) {
        Some((name, _)) => Err(Error::user(format!("check failed: {}", name))),
        None => Ok(()),
    }
}
