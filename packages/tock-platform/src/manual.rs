use crate::{Host, TaskQueuePriority};
use std::cell::Cell;

/// A host whose clock only moves when told to.
/// Used for deterministic tests and for embedders that own their own frame clock.
#[derive(Default)]
pub struct ManualHost {
    time: Cell<f64>,
    requests: [Cell<usize>; 5],
    cancels: [Cell<usize>; 5],
    outstanding: Cell<u8>,
}

impl ManualHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(time: f64) -> Self {
        let host = Self::default();
        host.time.set(time);
        host
    }

    pub fn set_time(&self, time: f64) {
        self.time.set(time);
    }

    pub fn advance(&self, ms: f64) {
        self.time.set(self.time.get() + ms);
    }

    /// Whether a flush request for the lane is outstanding (requested and not canceled).
    pub fn is_flush_requested(&self, priority: TaskQueuePriority) -> bool {
        self.outstanding.get() & (1 << priority.index()) != 0
    }

    pub fn request_count(&self, priority: TaskQueuePriority) -> usize {
        self.requests[priority.index()].get()
    }

    pub fn cancel_count(&self, priority: TaskQueuePriority) -> usize {
        self.cancels[priority.index()].get()
    }
}

impl Host for ManualHost {
    fn now(&self) -> f64 {
        self.time.get()
    }

    fn request_flush(&self, priority: TaskQueuePriority) {
        let count = &self.requests[priority.index()];
        count.set(count.get() + 1);
        self.outstanding
            .set(self.outstanding.get() | (1 << priority.index()));
    }

    fn cancel_flush(&self, priority: TaskQueuePriority) {
        let count = &self.cancels[priority.index()];
        count.set(count.get() + 1);
        self.outstanding
            .set(self.outstanding.get() & !(1 << priority.index()));
    }
}
