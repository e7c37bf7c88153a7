use serde::{Deserialize, Serialize};
use std::fmt;

/// The lanes work can be queued on, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskQueuePriority {
    /// Runs before anything else, e.g. promise-like continuations and signal propagation.
    Microtask,
    /// DOM writes for the next frame.
    Render,
    /// Regular deferred work.
    Macrotask,
    /// Layout reads after the frame has been rendered.
    PostRender,
    /// Work that only runs when nothing else is due.
    Idle,
}

impl TaskQueuePriority {
    pub const ALL: [TaskQueuePriority; 5] = [
        TaskQueuePriority::Microtask,
        TaskQueuePriority::Render,
        TaskQueuePriority::Macrotask,
        TaskQueuePriority::PostRender,
        TaskQueuePriority::Idle,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TaskQueuePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskQueuePriority::Microtask => "microtask",
            TaskQueuePriority::Render => "render",
            TaskQueuePriority::Macrotask => "macrotask",
            TaskQueuePriority::PostRender => "post-render",
            TaskQueuePriority::Idle => "idle",
        };
        f.write_str(name)
    }
}
