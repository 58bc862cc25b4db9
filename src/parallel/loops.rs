//! Parallel loop driver
//!
//! `concurrent` loops split their range into chunks that run as independent task
//! units. `forward` and `reverse` loops run every iteration in index order on a
//! single task unit, so their side effects are totally ordered.

use std::fmt;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::parallel::fork_join::{fork_join_all, Thunk};
use crate::runtime::{CancellationToken, Scheduler, TaskHandle};

/// Upper bound on task units a `concurrent` loop submits per worker
const MAX_CHUNKS_PER_WORKER: i128 = 4096;

/// Iteration order of a loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    /// Iterations in any order, in parallel
    Concurrent,
    /// Strictly increasing index order
    Forward,
    /// Strictly decreasing index order
    Reverse,
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoopMode::Concurrent => write!(f, "concurrent"),
            LoopMode::Forward => write!(f, "forward"),
            LoopMode::Reverse => write!(f, "reverse"),
        }
    }
}

/// Lifecycle of a loop run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Submitted, not yet started
    Pending,
    /// Iterations executing
    Running,
    /// Every iteration finished or was cancelled, and the result has been taken
    Joined,
}

impl LoopState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LoopState::Pending,
            1 => LoopState::Running,
            _ => LoopState::Joined,
        }
    }
}

/// What a loop body asks the driver to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    /// Keep iterating
    Continue,
    /// `exit loop`
    Exit,
}

/// How a loop finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Every iteration ran
    Completed {
        /// Iterations executed
        iterations: u64,
    },
    /// A body returned [`LoopControl::Exit`]
    Exited {
        /// Iterations executed, including the exiting one
        iterations: u64,
    },
}

impl LoopOutcome {
    /// Iterations executed
    pub fn iterations(&self) -> u64 {
        match self {
            LoopOutcome::Completed { iterations } | LoopOutcome::Exited { iterations } => *iterations,
        }
    }

    /// True if the loop was left early
    pub fn exited(&self) -> bool {
        matches!(self, LoopOutcome::Exited { .. })
    }
}

/// Chunking for `concurrent` loops
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Chunks per worker when no grain is given
    pub chunks_per_worker: usize,
    /// Fixed number of iterations per chunk; overrides `chunks_per_worker`.
    /// Widened on ranges longer than 4096 chunks per worker.
    pub grain: Option<usize>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            chunks_per_worker: 1,
            grain: None,
        }
    }
}

impl LoopConfig {
    /// One task unit per iteration
    pub fn per_iteration() -> Self {
        Self {
            grain: Some(1),
            ..Default::default()
        }
    }
}

type Body = Arc<dyn Fn(i64) -> Result<LoopControl> + Send + Sync>;

/// Runs loops on a scheduler
#[derive(Clone, Debug)]
pub struct ParallelLoop {
    scheduler: Scheduler,
    config: LoopConfig,
}

impl Default for ParallelLoop {
    fn default() -> Self {
        Self::new(Scheduler::global().clone())
    }
}

/// A loop that has been started with [`ParallelLoop::spawn`]
pub struct LoopHandle {
    state: Arc<AtomicU8>,
    task: TaskHandle<LoopOutcome>,
    scheduler: Scheduler,
}

impl LoopHandle {
    /// Current lifecycle state
    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Wait for the loop; the first iteration failure is re-raised here
    pub fn join(self) -> Result<LoopOutcome> {
        let outcome = self.scheduler.join(self.task);
        self.state.store(2, Ordering::Release);
        outcome
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LoopHandle").field("state", &self.state()).finish()
    }
}

impl ParallelLoop {
    /// Driver with the default chunking
    pub fn new(scheduler: Scheduler) -> Self {
        Self::with_config(scheduler, LoopConfig::default())
    }

    /// Driver with explicit chunking
    pub fn with_config(scheduler: Scheduler, config: LoopConfig) -> Self {
        Self { scheduler, config }
    }

    /// Chunking in use
    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Run `body` for every index in `range` and block until the loop is joined.
    ///
    /// In `concurrent` mode a failing iteration cancels the iterations that have
    /// not started yet; the failure is returned once the started ones finish.
    pub fn run<F>(&self, range: RangeInclusive<i64>, body: F, mode: LoopMode) -> Result<LoopOutcome>
    where
        F: Fn(i64) -> Result<LoopControl> + Send + Sync + 'static,
    {
        self.spawn(range, body, mode).join()
    }

    /// Start a loop without waiting for it
    pub fn spawn<F>(&self, range: RangeInclusive<i64>, body: F, mode: LoopMode) -> LoopHandle
    where
        F: Fn(i64) -> Result<LoopControl> + Send + Sync + 'static,
    {
        let state = Arc::new(AtomicU8::new(0));
        let driver = self.clone();
        let body: Body = Arc::new(body);
        let running = Arc::clone(&state);
        let task = self.scheduler.submit(move || {
            running.store(1, Ordering::Release);
            driver.drive(range, body, mode)
        });
        LoopHandle {
            state,
            task,
            scheduler: self.scheduler.clone(),
        }
    }

    /// Evaluate `f` for every index and collect the values in index order
    pub fn map<T, F>(&self, range: RangeInclusive<i64>, f: F, mode: LoopMode) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(i64) -> Result<T> + Send + Sync + 'static,
    {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let f = Arc::new(f);
        match mode {
            LoopMode::Concurrent => {
                let token = CancellationToken::new();
                let thunks: Vec<Thunk<Vec<T>>> = self
                    .chunks(&range)
                    .into_iter()
                    .map(|(lo, hi)| {
                        let f = Arc::clone(&f);
                        let token = token.clone();
                        Box::new(move || {
                            let mut out = Vec::new();
                            for i in lo..=hi {
                                token.checkpoint()?;
                                match f(i) {
                                    Ok(v) => out.push(v),
                                    Err(e) => {
                                        token.cancel();
                                        return Err(e);
                                    }
                                }
                            }
                            Ok(out)
                        }) as Thunk<Vec<T>>
                    })
                    .collect();
                Ok(fork_join_all(&self.scheduler, thunks)?.into_iter().flatten().collect())
            }
            LoopMode::Forward | LoopMode::Reverse => {
                let handle = self.scheduler.submit(move || {
                    let mut out = Vec::new();
                    if mode == LoopMode::Reverse {
                        for i in range.rev() {
                            out.push(f(i)?);
                        }
                        out.reverse();
                    } else {
                        for i in range {
                            out.push(f(i)?);
                        }
                    }
                    Ok(out)
                });
                self.scheduler.join(handle)
            }
        }
    }

    fn drive(&self, range: RangeInclusive<i64>, body: Body, mode: LoopMode) -> Result<LoopOutcome> {
        if range.is_empty() {
            return Ok(LoopOutcome::Completed { iterations: 0 });
        }
        tracing::debug!(%mode, start = *range.start(), end = *range.end(), "loop started");
        match mode {
            LoopMode::Concurrent => self.drive_concurrent(range, body),
            LoopMode::Forward => drive_serial(range, &body),
            LoopMode::Reverse => drive_serial(range.rev(), &body),
        }
    }

    fn drive_concurrent(&self, range: RangeInclusive<i64>, body: Body) -> Result<LoopOutcome> {
        let executed = Arc::new(AtomicU64::new(0));
        let exited = Arc::new(AtomicBool::new(false));
        let chunks = self.chunks(&range);
        tracing::trace!(chunks = chunks.len(), "concurrent loop partitioned");

        let joined = self.scheduler.scope(|scope| {
            for (lo, hi) in chunks {
                let token = scope.cancellation().clone();
                let body = Arc::clone(&body);
                let executed = Arc::clone(&executed);
                let exited = Arc::clone(&exited);
                scope.spawn(move || {
                    for i in lo..=hi {
                        if token.is_cancelled() {
                            tracing::trace!(index = i, "chunk observed cancellation");
                            return Ok(());
                        }
                        let control = body(i)?;
                        executed.fetch_add(1, Ordering::Relaxed);
                        if control == LoopControl::Exit {
                            exited.store(true, Ordering::Release);
                            token.cancel();
                            return Ok(());
                        }
                    }
                    Ok(())
                });
            }
            Ok(())
        });

        if let Err(err) = joined {
            tracing::debug!(error = %err, "concurrent loop failed");
            return Err(err);
        }
        let iterations = executed.load(Ordering::Acquire);
        if exited.load(Ordering::Acquire) {
            Ok(LoopOutcome::Exited { iterations })
        } else {
            Ok(LoopOutcome::Completed { iterations })
        }
    }

    /// Split a non-empty range into inclusive `(lo, hi)` chunks.
    ///
    /// At most `MAX_CHUNKS_PER_WORKER` chunks per worker are produced; a grain too
    /// small for the range is widened to fit.
    fn chunks(&self, range: &RangeInclusive<i64>) -> Vec<(i64, i64)> {
        let (start, end) = (*range.start() as i128, *range.end() as i128);
        let total = end - start + 1;
        let limit = self.scheduler.worker_count().max(1) as i128 * MAX_CHUNKS_PER_WORKER;
        let grain = match self.config.grain {
            Some(g) => g.max(1) as i128,
            None => {
                let parts = self.scheduler.worker_count() as i128 * self.config.chunks_per_worker.max(1) as i128;
                (total + parts - 1) / parts
            }
        };
        let grain = grain.max((total + limit - 1) / limit);
        let mut chunks = Vec::with_capacity(((total + grain - 1) / grain) as usize);
        let mut lo = start;
        while lo <= end {
            let hi = (lo + grain - 1).min(end);
            chunks.push((lo as i64, hi as i64));
            lo = hi + 1;
        }
        chunks
    }
}

fn drive_serial(indices: impl Iterator<Item = i64>, body: &Body) -> Result<LoopOutcome> {
    let mut iterations = 0;
    for i in indices {
        let control = body(i)?;
        iterations += 1;
        if control == LoopControl::Exit {
            return Ok(LoopOutcome::Exited { iterations });
        }
    }
    Ok(LoopOutcome::Completed { iterations })
}
