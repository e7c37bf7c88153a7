//! Cooperative, priority-lane task scheduling.
//!
//! Callers queue work on a lane and get back a [`Task`] handle whose result can be
//! awaited; each lane's [`TaskQueue`] decides when, in what order and within what
//! budget the work runs. Everything here is single threaded: the host calls
//! `flush` from its event loop and polls async task futures through the
//! [`Scheduler`]'s local executor.

pub mod config;
pub mod error;
pub mod queue;
pub mod scheduler;
pub mod task;

pub use config::{ConfigError, LaneConfig, SchedulerConfig};
pub use error::{CallbackError, TaskAbort, TaskError};
pub use queue::{FlushBudget, TaskQueue};
pub use scheduler::Scheduler;
pub use task::{AsyncMode, QueueTaskOptions, Task, TaskId, TaskResult, TaskReturn, TaskStatus};
pub use tock_platform::{Host, ManualHost, SystemHost, TaskQueuePriority};
