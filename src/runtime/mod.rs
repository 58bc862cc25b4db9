//! Runtime core: task units, the work-stealing scheduler, and concurrent-object monitors

pub mod cancel;
pub mod locked_box;
pub mod monitor;
pub mod scheduler;
pub mod task;
mod value;

pub use cancel::CancellationToken;
pub use locked_box::LockedBox;
pub use monitor::{Capability, Monitor, MonitorGuard, MonitorStats, Waiter};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStats, TaskScope};
pub use task::{TaskHandle, TaskId, TaskState};
pub use value::Value;
