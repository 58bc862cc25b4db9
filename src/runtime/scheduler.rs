//! # Work-Stealing Scheduler
//!
//! Runs task units on a bounded pool of worker threads. Each worker owns a LIFO
//! deque; tasks submitted from outside the pool go through a global injector, and
//! idle workers steal from their peers.
//!
//! Two properties matter to the rest of the runtime:
//!
//! - **Joining never shrinks the pool.** A joiner first claims the joined task and
//!   runs it itself if no worker has started it yet. If it is already running
//!   elsewhere, the joining worker waits while a spare takes its place, so other
//!   ready task units keep running and nested fork-join and nested `concurrent`
//!   loops scale with the pool. A joiner never runs unrelated tasks on top of its
//!   own stack, so a task that parks cannot bury a finished join beneath it.
//! - **Parking compensates.** When a worker blocks in a monitor wait, the pool starts
//!   a spare worker so the number of runnable workers stays at the target. Spares
//!   retire once they sit idle while the pool is back at full strength.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::runtime::cancel::CancellationToken;
use crate::runtime::monitor::Waiter;
use crate::runtime::task::{task_unit, Job, TaskHandle, TaskSlot};

/// Configuration for a scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Target number of runnable workers (default: num_cpus)
    pub worker_threads: usize,
    /// Upper bound on extra workers started while others are parked
    pub max_spare_workers: usize,
    /// How long an idle worker sleeps before re-checking, and how long a spare
    /// must be idle before it retires
    pub idle_timeout_ms: u64,
    /// Prefix for worker thread names
    pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get().max(1),
            max_spare_workers: 256,
            idle_timeout_ms: 100,
            thread_name_prefix: "parasol-worker".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Default configuration with an explicit worker count
    pub fn with_workers(worker_threads: usize) -> Self {
        Self {
            worker_threads: worker_threads.max(1),
            ..Default::default()
        }
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.max(1))
    }
}

/// Point-in-time scheduler counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Task units submitted
    pub tasks_submitted: usize,
    /// Task units executed to completion
    pub tasks_executed: usize,
    /// Task units a worker took from a peer's deque
    pub tasks_stolen: usize,
    /// Task units run by their joiner because no worker had claimed them yet
    pub tasks_inlined: usize,
    /// Times a worker blocked in a monitor wait or on a join
    pub parks: usize,
    /// Spare workers started to compensate for parked ones
    pub spares_spawned: usize,
    /// Workers currently alive
    pub live_workers: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicUsize,
    executed: AtomicUsize,
    stolen: AtomicUsize,
    inlined: AtomicUsize,
    parks: AtomicUsize,
    spares_spawned: AtomicUsize,
}

struct Shared {
    config: SchedulerConfig,
    injector: Injector<Job>,
    stealers: RwLock<Vec<(usize, Stealer<Job>)>>,
    /// Number of workers asleep on `wakeup`
    sleepers: Mutex<usize>,
    wakeup: Condvar,
    started: AtomicBool,
    start_lock: Mutex<()>,
    shutdown: AtomicBool,
    live_workers: AtomicUsize,
    parked_workers: AtomicUsize,
    spare_workers: AtomicUsize,
    next_worker_id: AtomicUsize,
    threads: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
}

/// Per-thread view of the pool, present only on worker threads
struct WorkerContext {
    shared: Arc<Shared>,
    id: usize,
    local: Worker<Job>,
    spare: bool,
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Rc<WorkerContext>>> = const { RefCell::new(None) };
}

fn current_worker() -> Option<Rc<WorkerContext>> {
    CURRENT_WORKER.with(|cell| cell.borrow().clone())
}

impl Shared {
    fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            injector: Injector::new(),
            stealers: RwLock::new(Vec::new()),
            sleepers: Mutex::new(0),
            wakeup: Condvar::new(),
            started: AtomicBool::new(false),
            start_lock: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            live_workers: AtomicUsize::new(0),
            parked_workers: AtomicUsize::new(0),
            spare_workers: AtomicUsize::new(0),
            next_worker_id: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Start the core workers on first use
    fn ensure_started(self: &Arc<Self>) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.start_lock.lock();
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        for _ in 0..self.config.worker_threads.max(1) {
            if let Err(err) = self.spawn_worker(false) {
                if self.live_workers.load(Ordering::Acquire) == 0 {
                    return Err(err);
                }
                tracing::warn!(error = %err, "scheduler running below its worker target");
                break;
            }
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, spare: bool) -> Result<()> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let local = Worker::new_lifo();
        self.stealers.write().push((id, local.stealer()));
        self.live_workers.fetch_add(1, Ordering::AcqRel);
        if spare {
            self.spare_workers.fetch_add(1, Ordering::AcqRel);
        }

        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.config.thread_name_prefix, id))
            .spawn(move || {
                let ctx = Rc::new(WorkerContext {
                    shared,
                    id,
                    local,
                    spare,
                });
                CURRENT_WORKER.with(|cell| *cell.borrow_mut() = Some(Rc::clone(&ctx)));
                worker_loop(&ctx);
                CURRENT_WORKER.with(|cell| cell.borrow_mut().take());
            });

        match spawned {
            Ok(handle) => {
                let mut threads = self.threads.lock();
                threads.retain(|h| !h.is_finished());
                threads.push(handle);
                tracing::debug!(worker = id, spare, "worker started");
                Ok(())
            }
            Err(e) => {
                self.stealers.write().retain(|(sid, _)| *sid != id);
                self.live_workers.fetch_sub(1, Ordering::AcqRel);
                if spare {
                    self.spare_workers.fetch_sub(1, Ordering::AcqRel);
                }
                Err(Error::WorkerSpawnFailed(e.to_string()))
            }
        }
    }

    fn push(&self, job: Job) {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        match current_worker() {
            Some(ctx) if std::ptr::eq(Arc::as_ptr(&ctx.shared), self) => ctx.local.push(job),
            _ => self.injector.push(job),
        }
        self.notify_one();
    }

    fn notify_one(&self) {
        let sleepers = self.sleepers.lock();
        if *sleepers > 0 {
            self.wakeup.notify_one();
        }
    }

    /// Local deque first, then the injector, then peers
    fn find_task(&self, ctx: &WorkerContext) -> Option<Job> {
        if let Some(job) = ctx.local.pop() {
            return Some(job);
        }
        std::iter::repeat_with(|| {
            self.injector
                .steal_batch_and_pop(&ctx.local)
                .or_else(|| self.steal_from_peers(ctx.id))
        })
        .find(|s| !s.is_retry())
        .and_then(|s| s.success())
    }

    fn steal_from_peers(&self, own_id: usize) -> Steal<Job> {
        let stolen: Steal<Job> = self
            .stealers
            .read()
            .iter()
            .filter(|(id, _)| *id != own_id)
            .map(|(_, stealer)| stealer.steal())
            .collect();
        if let Steal::Success(job) = &stolen {
            self.counters.stolen.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(worker = own_id, task = %job.id, "stole task");
        }
        stolen
    }

    fn run_job(&self, job: Job) {
        if job.execute() {
            self.counters.executed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Sleep until notified or the idle timeout elapses. Returns false on timeout.
    fn sleep(&self) -> bool {
        let mut sleepers = self.sleepers.lock();
        if !self.injector.is_empty() || self.is_shutdown() {
            return true;
        }
        *sleepers += 1;
        let timed_out = self
            .wakeup
            .wait_for(&mut sleepers, self.config.idle_timeout())
            .timed_out();
        *sleepers -= 1;
        !timed_out
    }

    /// Spares leave once the pool has enough runnable workers without them
    fn try_retire(&self, ctx: &WorkerContext) -> bool {
        if !ctx.spare {
            return false;
        }
        let live = self.live_workers.load(Ordering::Acquire);
        let parked = self.parked_workers.load(Ordering::Acquire);
        if live.saturating_sub(parked) <= self.config.worker_threads {
            return false;
        }
        self.retire(ctx);
        true
    }

    fn retire(&self, ctx: &WorkerContext) {
        self.stealers.write().retain(|(id, _)| *id != ctx.id);
        while let Some(job) = ctx.local.pop() {
            self.injector.push(job);
        }
        self.live_workers.fetch_sub(1, Ordering::AcqRel);
        if ctx.spare {
            self.spare_workers.fetch_sub(1, Ordering::AcqRel);
        }
        tracing::debug!(worker = ctx.id, spare = ctx.spare, "worker stopped");
    }

    /// Called by a worker about to block outside the scheduler's control
    fn begin_blocking(self: &Arc<Self>) {
        self.counters.parks.fetch_add(1, Ordering::Relaxed);
        let parked = self.parked_workers.fetch_add(1, Ordering::AcqRel) + 1;
        let live = self.live_workers.load(Ordering::Acquire);
        if live.saturating_sub(parked) >= self.config.worker_threads || self.is_shutdown() {
            return;
        }
        if self.spare_workers.load(Ordering::Acquire) >= self.config.max_spare_workers {
            tracing::warn!(
                parked,
                limit = self.config.max_spare_workers,
                "spare worker limit reached; pool is running degraded"
            );
            return;
        }
        match self.spawn_worker(true) {
            Ok(()) => {
                self.counters.spares_spawned.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => tracing::warn!(error = %err, "could not start spare worker"),
        }
    }

    fn end_blocking(&self) {
        self.parked_workers.fetch_sub(1, Ordering::AcqRel);
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _sleepers = self.sleepers.lock();
            self.wakeup.notify_all();
        }
        let me = thread::current().id();
        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
        tracing::debug!("scheduler shut down");
    }

    fn stats(&self) -> SchedulerStats {
        let c = &self.counters;
        SchedulerStats {
            tasks_submitted: c.submitted.load(Ordering::Relaxed),
            tasks_executed: c.executed.load(Ordering::Relaxed),
            tasks_stolen: c.stolen.load(Ordering::Relaxed),
            tasks_inlined: c.inlined.load(Ordering::Relaxed),
            parks: c.parks.load(Ordering::Relaxed),
            spares_spawned: c.spares_spawned.load(Ordering::Relaxed),
            live_workers: self.live_workers.load(Ordering::Relaxed),
        }
    }
}

fn worker_loop(ctx: &WorkerContext) {
    let shared = &ctx.shared;
    let backoff = Backoff::new();

    loop {
        if let Some(job) = shared.find_task(ctx) {
            shared.run_job(job);
            backoff.reset();
            continue;
        }
        if shared.is_shutdown() {
            shared.retire(ctx);
            return;
        }
        if !backoff.is_completed() {
            backoff.snooze();
            continue;
        }
        if !shared.sleep() && shared.try_retire(ctx) {
            return;
        }
        backoff.reset();
    }
}

/// Owns the pool; dropping the last clone of a [`Scheduler`] shuts it down
struct Owner {
    shared: Arc<Shared>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// Work-stealing scheduler for task units
///
/// Cheap to clone; task bodies that fork further capture a clone. Workers start on
/// first submission.
#[derive(Clone)]
pub struct Scheduler {
    owner: Arc<Owner>,
}

lazy_static::lazy_static! {
    /// Process-wide scheduler sized from the host parallelism hint
    static ref GLOBAL: Scheduler = Scheduler::new(SchedulerConfig::default());
}

impl Scheduler {
    /// Create a scheduler; no threads are started until work is submitted
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            owner: Arc::new(Owner {
                shared: Arc::new(Shared::new(config)),
            }),
        }
    }

    /// The process-wide default scheduler
    pub fn global() -> &'static Scheduler {
        &GLOBAL
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.owner.shared
    }

    /// Configuration this scheduler was built with
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared().config
    }

    /// Target number of runnable workers
    pub fn worker_count(&self) -> usize {
        self.shared().config.worker_threads.max(1)
    }

    /// True when the calling thread is one of this scheduler's workers
    pub fn in_worker(&self) -> bool {
        current_worker().is_some_and(|ctx| Arc::ptr_eq(&ctx.shared, self.shared()))
    }

    /// Submit a task unit. Failures, including a scheduler that cannot run it,
    /// surface when the handle is joined.
    pub fn submit<T, F>(&self, thunk: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let shared = self.shared();
        if shared.is_shutdown() {
            return failed_handle(Error::SchedulerShutdown);
        }
        if let Err(err) = shared.ensure_started() {
            return failed_handle(err);
        }
        let (job, slot, id) = task_unit(thunk);
        tracing::trace!(task = %id, "submitted");
        shared.push(job);
        TaskHandle { id, slot }
    }

    /// Wait for a task unit and take its result.
    ///
    /// A task no worker has started yet is run right here. Otherwise the caller
    /// blocks; on a worker thread the pool starts a spare for the duration.
    pub fn join<T>(&self, handle: TaskHandle<T>) -> Result<T> {
        if !handle.is_finished() {
            if handle.slot.try_run() {
                let shared = self.shared();
                shared.counters.inlined.fetch_add(1, Ordering::Relaxed);
                shared.counters.executed.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(task = %handle.id, "joined task run inline");
            } else {
                wait_running(&handle.slot);
            }
        }
        handle.take_result()
    }

    /// Join every handle in order; all are waited for even after a failure so no
    /// task outlives the call. The first non-cancellation failure wins.
    pub fn join_all<T>(&self, handles: Vec<TaskHandle<T>>) -> Result<Vec<T>> {
        let mut values = Vec::with_capacity(handles.len());
        let mut failure: Option<Error> = None;
        for handle in handles {
            match self.join(handle) {
                Ok(v) => values.push(v),
                Err(e) => record_failure(&mut failure, e),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(values),
        }
    }

    /// Run `body` with a [`TaskScope`]; every task spawned in the scope is joined
    /// before this returns, and the first failure among them is re-raised here.
    pub fn scope<R, F>(&self, body: F) -> Result<R>
    where
        F: FnOnce(&mut TaskScope<'_>) -> Result<R>,
    {
        let mut scope = TaskScope {
            scheduler: self,
            token: CancellationToken::new(),
            handles: Vec::new(),
        };
        let result = body(&mut scope);
        if result.is_err() {
            scope.token.cancel();
        }
        let joined = scope.join_remaining();
        match (result, joined) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
            (Ok(v), Ok(())) => Ok(v),
        }
    }

    /// Block the current thread on `waiter` until it is granted. When the caller
    /// is a worker of any scheduler, that pool is compensated while it waits.
    pub fn park(waiter: &Waiter) {
        tracing::trace!(ticket = waiter.ticket(), "parking");
        compensated(|| waiter.block());
    }

    /// Resume a parked waiter
    pub fn unpark(waiter: &Waiter) {
        waiter.wake();
    }

    /// Snapshot of the scheduler's counters
    pub fn stats(&self) -> SchedulerStats {
        self.shared().stats()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", self.config())
            .field("stats", &self.stats())
            .finish()
    }
}

fn failed_handle<T>(err: Error) -> TaskHandle<T>
where
    T: Send + 'static,
{
    let (job, slot, id) = task_unit(move || Err(err));
    job.execute();
    TaskHandle { id, slot }
}

/// Run `block` with the current worker counted as parked, so its pool can start a
/// spare in its place. Off-pool callers just run it.
fn compensated<R>(block: impl FnOnce() -> R) -> R {
    match current_worker() {
        Some(ctx) => {
            ctx.shared.begin_blocking();
            let out = block();
            ctx.shared.end_blocking();
            out
        }
        None => block(),
    }
}

/// Wait for a task some other thread is running. Short tasks finish within the
/// spin; longer ones are waited out with the pool compensated.
fn wait_running<T>(slot: &TaskSlot<T>) {
    let backoff = Backoff::new();
    while !backoff.is_completed() {
        if slot.is_complete() {
            return;
        }
        backoff.snooze();
    }
    if !slot.is_complete() {
        compensated(|| slot.wait());
    }
}

fn record_failure(slot: &mut Option<Error>, err: Error) {
    match slot {
        None => *slot = Some(err),
        Some(existing) if existing.is_cancellation() && !err.is_cancellation() => *slot = Some(err),
        Some(_) => {}
    }
}

type Joiner<'s> = Box<dyn FnOnce(&Scheduler) -> Result<()> + 's>;

/// Structured task spawning; see [`Scheduler::scope`]
pub struct TaskScope<'s> {
    scheduler: &'s Scheduler,
    token: CancellationToken,
    handles: Vec<Joiner<'s>>,
}

impl<'s> TaskScope<'s> {
    /// Spawn a task unit owned by this scope. A failure raises the scope's
    /// cancellation token so siblings can stop at their next checkpoint.
    pub fn spawn<T, F>(&mut self, thunk: F)
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let token = self.token.clone();
        let handle = self.scheduler.submit(move || {
            let outcome = thunk();
            if outcome.is_err() {
                token.cancel();
            }
            outcome
        });
        self.handles
            .push(Box::new(move |sched: &Scheduler| sched.join(handle).map(|_| ())));
    }

    /// Cancellation token shared by every task in the scope
    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    /// Scheduler the scope submits to
    pub fn scheduler(&self) -> &Scheduler {
        self.scheduler
    }

    /// Number of spawned tasks not yet joined
    pub fn pending(&self) -> usize {
        self.handles.len()
    }

    fn join_remaining(&mut self) -> Result<()> {
        let mut failure = None;
        for joiner in self.handles.drain(..) {
            if let Err(e) = joiner(self.scheduler) {
                record_failure(&mut failure, e);
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
