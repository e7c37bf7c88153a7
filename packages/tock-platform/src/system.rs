use crate::{Host, TaskQueuePriority};
use std::cell::Cell;
use std::time::Instant;

/// Host backed by the process' monotonic clock.
///
/// Flush requests are recorded as a bitmask; the embedding event loop calls
/// [`SystemHost::take_requested`] once per frame and flushes the returned lanes.
pub struct SystemHost {
    origin: Instant,
    requested: Cell<u8>,
}

impl SystemHost {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            requested: Cell::new(0),
        }
    }

    pub fn is_flush_requested(&self, priority: TaskQueuePriority) -> bool {
        self.requested.get() & (1 << priority.index()) != 0
    }

    /// Drain the set of lanes that asked to be flushed, highest priority first.
    pub fn take_requested(&self) -> Vec<TaskQueuePriority> {
        let mask = self.requested.replace(0);
        TaskQueuePriority::ALL
            .into_iter()
            .filter(|p| mask & (1 << p.index()) != 0)
            .collect()
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for SystemHost {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }

    fn request_flush(&self, priority: TaskQueuePriority) {
        tracing::debug!("Flush requested for {} lane", priority);
        self.requested
            .set(self.requested.get() | (1 << priority.index()));
    }

    fn cancel_flush(&self, priority: TaskQueuePriority) {
        tracing::debug!("Flush canceled for {} lane", priority);
        self.requested
            .set(self.requested.get() & !(1 << priority.index()));
    }
}
