use crate::task::{TaskId, TaskStatus};
use std::fmt;
use std::rc::Rc;
use thiserror::Error;
use tock_platform::TaskQueuePriority;

/// Identity of a task whose work was abandoned, handed to everyone awaiting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskAbort {
    pub id: TaskId,
    pub priority: TaskQueuePriority,
}

impl fmt::Display for TaskAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} on the {} lane", self.id, self.priority)
    }
}

/// A failure raised by user code inside a task callback.
///
/// Cheap to clone so the same failure can reach every awaiter of a task.
#[derive(Clone)]
pub struct CallbackError(Rc<anyhow::Error>);

impl CallbackError {
    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self(Rc::new(anyhow::Error::msg(message)))
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for CallbackError {
    fn from(err: anyhow::Error) -> Self {
        Self(Rc::new(err))
    }
}

impl fmt::Debug for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for CallbackError {}

#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// `run()` was called out of state-machine order. A programming error.
    #[error("cannot run task {id} in {status} state")]
    InvalidState { id: TaskId, status: TaskStatus },

    #[error("{0} was canceled")]
    Aborted(TaskAbort),

    #[error("task {id} failed: {source}")]
    Callback {
        id: TaskId,
        #[source]
        source: CallbackError,
    },

    /// A task tried to read its own result while running; it could never settle.
    #[error("awaiting task {0} from within itself would deadlock")]
    Deadlock(TaskId),
}

impl TaskError {
    pub fn is_abort(&self) -> bool {
        matches!(self, TaskError::Aborted(_))
    }

    pub fn abort(&self) -> Option<TaskAbort> {
        match self {
            TaskError::Aborted(abort) => Some(*abort),
            _ => None,
        }
    }
}
