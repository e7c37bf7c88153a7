use crate::error::{CallbackError, TaskAbort, TaskError};
use crate::queue::{TaskKey, TaskQueue};
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use tock_platform::TaskQueuePriority;

/// Process-wide task identity. Survives pooling: a reused task keeps its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Canceled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// How the completion of a callback is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AsyncMode {
    /// The callback finishes when it returns. Returning a future is an error.
    Sync,
    /// The callback finishes when its future resolves, even if it returned a ready value.
    Async,
    /// Decided per run by what the callback returned.
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueTaskOptions {
    /// Milliseconds between queueing (or re-arming) and the task becoming due.
    pub delay: f64,
    pub preempt: bool,
    pub persistent: bool,
    pub reusable: bool,
    pub async_mode: AsyncMode,
}

impl Default for QueueTaskOptions {
    fn default() -> Self {
        Self {
            delay: 0.0,
            preempt: false,
            persistent: false,
            reusable: true,
            async_mode: AsyncMode::Auto,
        }
    }
}

impl QueueTaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, delay: f64) -> Self {
        self.delay = delay;
        self
    }

    pub fn preempt(mut self) -> Self {
        self.preempt = true;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn reusable(mut self, reusable: bool) -> Self {
        self.reusable = reusable;
        self
    }

    pub fn async_mode(mut self, async_mode: AsyncMode) -> Self {
        self.async_mode = async_mode;
        self
    }
}

/// What a callback hands back: a value now, or a future that produces one later.
pub enum TaskReturn<T> {
    Ready(anyhow::Result<T>),
    Pending(LocalBoxFuture<'static, anyhow::Result<T>>),
}

impl<T> TaskReturn<T> {
    pub fn ready(value: T) -> Self {
        TaskReturn::Ready(Ok(value))
    }

    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        TaskReturn::Ready(Err(err.into()))
    }

    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + 'static,
    {
        TaskReturn::Pending(future.boxed_local())
    }

    pub fn is_awaitable(&self) -> bool {
        matches!(self, TaskReturn::Pending(_))
    }
}

impl<T> From<anyhow::Result<T>> for TaskReturn<T> {
    fn from(result: anyhow::Result<T>) -> Self {
        TaskReturn::Ready(result)
    }
}

// Tasks of every value type share one queue, so values travel type-erased and
// are downcast again by the typed handle.
pub(crate) type Value = Rc<dyn Any>;
pub(crate) type Outcome = Result<Value, TaskError>;

pub(crate) enum Erased {
    Ready(Result<Value, CallbackError>),
    Pending(LocalBoxFuture<'static, Result<Value, CallbackError>>),
}

pub(crate) type Callback = Box<dyn FnMut(f64) -> Erased>;

pub(crate) fn erase<T: 'static>(mut callback: impl FnMut(f64) -> TaskReturn<T> + 'static) -> Callback {
    Box::new(move |elapsed| match callback(elapsed) {
        TaskReturn::Ready(result) => Erased::Ready(
            result
                .map(|value| Rc::new(value) as Value)
                .map_err(CallbackError::from),
        ),
        TaskReturn::Pending(future) => Erased::Pending(
            future
                .map(|result| {
                    result
                        .map(|value| Rc::new(value) as Value)
                        .map_err(CallbackError::from)
                })
                .boxed_local(),
        ),
    })
}

#[derive(Default)]
pub(crate) struct Waiters {
    outcome: Option<Outcome>,
    wakers: SmallVec<[Waker; 1]>,
}

impl Waiters {
    fn resolve(&mut self, outcome: Outcome) {
        self.outcome = Some(outcome);
        for waker in self.wakers.drain(..) {
            waker.wake();
        }
    }
}

/// The exposed result of one run, created only when somebody asks for it.
pub(crate) enum Deferred {
    NotRequested,
    Pending(Rc<RefCell<Waiters>>),
    Settled(Outcome),
}

/// State shared between a queue slot and the handles of its current borrower.
///
/// A pooled slot gets a fresh core on reuse whenever an old handle still holds
/// this one, so stale handles keep observing their own run.
pub(crate) struct TaskCore {
    pub(crate) id: TaskId,
    pub(crate) status: Cell<TaskStatus>,
    /// Live `Task` handles reading this core.
    pub(crate) handles: Cell<usize>,
    deferred: RefCell<Deferred>,
}

impl TaskCore {
    pub(crate) fn new(id: TaskId) -> Self {
        Self {
            id,
            status: Cell::new(TaskStatus::Pending),
            handles: Cell::new(0),
            deferred: RefCell::new(Deferred::NotRequested),
        }
    }

    pub(crate) fn reset(&self) {
        self.status.set(TaskStatus::Pending);
        self.deferred.replace(Deferred::NotRequested);
    }

    /// Drops the kept result of a finished run. Handed back so the caller
    /// decides where the value is dropped.
    pub(crate) fn release(&self) -> Deferred {
        self.deferred.replace(Deferred::NotRequested)
    }

    /// Delivers `outcome` to whoever awaits the current run and returns whether anyone did.
    /// Terminal outcomes are kept so later readers get them without a new deferred.
    pub(crate) fn settle(&self, outcome: Outcome, terminal: bool) -> bool {
        let next = if terminal {
            Deferred::Settled(outcome.clone())
        } else {
            Deferred::NotRequested
        };
        match self.deferred.replace(next) {
            Deferred::Pending(waiters) => {
                waiters.borrow_mut().resolve(outcome);
                true
            }
            _ => false,
        }
    }

    fn result<T>(&self, priority: TaskQueuePriority) -> Result<TaskResult<T>, TaskError> {
        let status = self.status.get();
        if status == TaskStatus::Running {
            return Err(TaskError::Deadlock(self.id));
        }

        let mut deferred = self.deferred.borrow_mut();
        let state = match &*deferred {
            Deferred::Pending(waiters) => ResultState::Waiting(waiters.clone()),
            Deferred::Settled(outcome) => ResultState::Settled(outcome.clone()),
            // terminal cores are always settled; treat a bare one as abandoned
            Deferred::NotRequested if status.is_terminal() => {
                ResultState::Settled(Err(TaskError::Aborted(TaskAbort {
                    id: self.id,
                    priority,
                })))
            }
            Deferred::NotRequested => {
                let waiters = Rc::new(RefCell::new(Waiters::default()));
                *deferred = Deferred::Pending(waiters.clone());
                ResultState::Waiting(waiters)
            }
        };

        Ok(TaskResult {
            state,
            _marker: PhantomData,
        })
    }
}

enum ResultState {
    Waiting(Rc<RefCell<Waiters>>),
    Settled(Outcome),
}

/// Awaitable outcome of a single run of a task.
pub struct TaskResult<T> {
    state: ResultState,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TaskResult<T> {
    pub fn is_settled(&self) -> bool {
        match &self.state {
            ResultState::Waiting(waiters) => waiters.borrow().outcome.is_some(),
            ResultState::Settled(_) => true,
        }
    }
}

impl<T: Clone + 'static> Future for TaskResult<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = match &self.state {
            ResultState::Settled(outcome) => outcome.clone(),
            ResultState::Waiting(waiters) => {
                let mut waiters = waiters.borrow_mut();
                match &waiters.outcome {
                    Some(outcome) => outcome.clone(),
                    None => {
                        if !waiters.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                            waiters.wakers.push(cx.waker().clone());
                        }
                        return Poll::Pending;
                    }
                }
            }
        };

        Poll::Ready(outcome.map(|value| {
            value
                .downcast_ref::<T>()
                .cloned()
                .expect("task value always has the type of its handle")
        }))
    }
}

/// Caller-side handle to queued work.
pub struct Task<T> {
    key: TaskKey,
    core: Rc<TaskCore>,
    queue: TaskQueue,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + 'static> Task<T> {
    pub(crate) fn new(key: TaskKey, core: Rc<TaskCore>, queue: TaskQueue) -> Self {
        core.handles.set(core.handles.get() + 1);
        Self {
            key,
            core,
            queue,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> TaskId {
        self.core.id
    }

    pub fn status(&self) -> TaskStatus {
        self.core.status.get()
    }

    pub fn priority(&self) -> TaskQueuePriority {
        self.queue.priority()
    }

    /// The awaitable outcome of the current run.
    ///
    /// Fails with [`TaskError::Deadlock`] when read while the task is running,
    /// since a task can never await its own completion.
    pub fn result(&self) -> Result<TaskResult<T>, TaskError> {
        self.core.result(self.queue.priority())
    }

    pub fn run(&self) -> Result<(), TaskError> {
        self.queue.run_task(self.key, Some(&self.core))
    }

    pub fn cancel(&self) -> bool {
        self.queue.cancel_task(self.key, &self.core)
    }

    /// Whether the task will re-arm after its current or next run.
    pub fn is_persistent(&self) -> bool {
        self.queue.is_persistent(self.key, &self.core)
    }
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        self.core.handles.set(self.core.handles.get() + 1);
        Self {
            key: self.key,
            core: self.core.clone(),
            queue: self.queue.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        let handles = self.core.handles.get() - 1;
        self.core.handles.set(handles);
        // the last reader of a finished run is gone
        if handles == 0 && self.core.status.get().is_terminal() {
            drop(self.core.release());
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.core.id)
            .field("status", &self.core.status.get())
            .finish()
    }
}
