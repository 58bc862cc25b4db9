//! # Parasol - Concurrent Objects and Implicit Parallelism
//!
//! A runtime for a concurrent-object programming model: independent operands are
//! evaluated in parallel, loops run `concurrent`, `forward` or `reverse`, and shared
//! mutable state lives in monitors that offer `locked` and `queued` operations.
//!
//! ## Features
//!
//! - **Work-stealing scheduler** - A join runs the joined task inline when no worker
//!   has claimed it yet; otherwise a spare worker covers the wait, so nested
//!   parallelism does not idle the pool
//! - **Fork-join evaluation** - Binary operators, lists and call arguments fork their
//!   operands; `and then` / `or else` short-circuit
//! - **Parallel loops** - Chunked `concurrent` loops with cooperative cancellation
//! - **Monitors** - Mutual exclusion plus condition waits with FIFO handoff
//!
//! ## Quick Start
//!
//! ```rust
//! use parasol::{Evaluator, Expr, Scheduler, SchedulerConfig, Value};
//!
//! # fn main() -> parasol::Result<()> {
//! let evaluator = Evaluator::new(Scheduler::new(SchedulerConfig::with_workers(2)));
//!
//! // Both operands are thunks, so they run as separate task units
//! let expr = Expr::add(
//!     Expr::thunk(|| Ok(Value::Int(40))),
//!     Expr::thunk(|| Ok(Value::Int(2))),
//! );
//! assert_eq!(evaluator.eval(&expr)?, Value::Int(42));
//! # Ok(())
//! # }
//! ```
//!
//! ### Concurrent Objects
//!
//! ```rust
//! use std::sync::Arc;
//! use parasol::{LockedBox, LoopControl, LoopMode, ParallelLoop};
//!
//! # fn main() -> parasol::Result<()> {
//! let slot = Arc::new(LockedBox::<i64>::empty());
//! let producer = Arc::clone(&slot);
//!
//! ParallelLoop::default().run(
//!     1..=1,
//!     move |i| {
//!         producer.put(i * 10);
//!         Ok(LoopControl::Continue)
//!     },
//!     LoopMode::Forward,
//! )?;
//!
//! // `get` waits until the box holds a value, then empties it
//! assert_eq!(slot.get(), 10);
//! assert_eq!(slot.content(), None);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Expr / ParallelLoop → fork_join → Scheduler (work stealing) ← Monitor park/unpark
//! ```
//!
//! - [`Scheduler`] - Work-stealing pool of task units
//! - [`Monitor`] - `locked` and `queued` access to shared state
//! - [`Evaluator`] - Parallel expression evaluation
//! - [`ParallelLoop`] - Loop driver
//!
//! ## Caveats
//!
//! Forking or joining while holding a monitor guard can deadlock when the joined
//! work needs the same monitor. Release the guard first.

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod error;
pub mod parallel;
pub mod runtime;

// Re-export main types
pub use error::{Error, ErrorSeverity, Result};
pub use parallel::{
    fork_join, fork_join_all, BinaryOp, Evaluator, Expr, Function, LoopConfig, LoopControl, LoopMode,
    LoopOutcome, ParallelLoop,
};
pub use runtime::{
    CancellationToken, Capability, LockedBox, Monitor, MonitorGuard, Scheduler, SchedulerConfig,
    SchedulerStats, TaskHandle, TaskId, TaskScope, Value,
};
