//! Parallel evaluation for parasol
//!
//! Fork-join over independent operands, expression trees that fork implicitly, and
//! the `concurrent`/`forward`/`reverse` loop driver.

pub mod expr;
pub mod fork_join;
pub mod loops;

pub use expr::{BinaryOp, Evaluator, Expr, Function};
pub use fork_join::{all_hold, and_then, fork_join, fork_join_all, or_else, parallel_and, parallel_or, Thunk};
pub use loops::{LoopConfig, LoopControl, LoopHandle, LoopMode, LoopOutcome, LoopState, ParallelLoop};
