pub mod manual;
pub mod priority;
pub mod system;

use std::rc::Rc;

/// The host a scheduler runs inside of.
/// This allows Tock to be driven by any event loop (winit, a browser frame callback,
/// a test harness) as long as it provides a clock and calls `flush` when asked.
pub trait Host {
    /// Get the current time in milliseconds (monotonic).
    fn now(&self) -> f64;

    /// Ask the tick source to flush the given lane soon.
    /// Called once when a lane goes from idle to having work.
    fn request_flush(&self, priority: TaskQueuePriority);

    /// Withdraw a previous flush request because the lane has nothing left to run.
    fn cancel_flush(&self, priority: TaskQueuePriority);
}

impl<H: Host + ?Sized> Host for Rc<H> {
    fn now(&self) -> f64 {
        (**self).now()
    }

    fn request_flush(&self, priority: TaskQueuePriority) {
        (**self).request_flush(priority)
    }

    fn cancel_flush(&self, priority: TaskQueuePriority) {
        (**self).cancel_flush(priority)
    }
}

pub use manual::ManualHost;
pub use priority::TaskQueuePriority;
pub use system::SystemHost;
