use crate::error::{CallbackError, TaskAbort, TaskError};
use crate::scheduler::next_task_id;
use crate::task::{
    AsyncMode, Callback, Erased, QueueTaskOptions, Task, TaskCore, TaskId, TaskReturn, TaskStatus,
    Value, erase,
};
use futures::FutureExt;
use futures::executor::LocalSpawner;
use futures::future::{self, LocalBoxFuture};
use futures::task::LocalSpawnExt;
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use tock_platform::{Host, TaskQueuePriority};

new_key_type! {
    pub struct TaskKey;
}

/// Limits on how much work one flush may do.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushBudget {
    pub max_tasks: Option<usize>,
    /// Milliseconds of host time after the flush began past which no task is started.
    pub time_slice: Option<f64>,
}

impl FlushBudget {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn tasks(max_tasks: usize) -> Self {
        Self {
            max_tasks: Some(max_tasks),
            time_slice: None,
        }
    }

    pub fn time_slice(ms: f64) -> Self {
        Self {
            max_tasks: None,
            time_slice: Some(ms),
        }
    }

    fn is_exhausted(&self, ran: usize, elapsed: f64) -> bool {
        self.max_tasks.is_some_and(|max| ran >= max)
            || self.time_slice.is_some_and(|slice| elapsed >= slice)
    }
}

struct TaskSlot {
    created_time: f64,
    queue_time: f64,
    preempt: bool,
    persistent: bool,
    async_mode: AsyncMode,
    reusable: bool,
    callback: Option<Callback>,
    prev: Option<TaskKey>,
    next: Option<TaskKey>,
    linked: bool,
    // flush pass in which a persistent task was re-armed; 0 when queued normally
    armed_in: u64,
    core: Rc<TaskCore>,
}

impl TaskSlot {
    fn new(id: TaskId, time: f64, options: &QueueTaskOptions, callback: Callback) -> Self {
        Self {
            created_time: time,
            queue_time: time + options.delay,
            preempt: options.preempt,
            persistent: options.persistent,
            async_mode: options.async_mode,
            reusable: options.reusable,
            callback: Some(callback),
            prev: None,
            next: None,
            linked: false,
            armed_in: 0,
            core: Rc::new(TaskCore::new(id)),
        }
    }

    /// Re-arms a persistent task, keeping its original delay so the cadence does not
    /// drift with callback execution time.
    fn reset(&mut self, time: f64) {
        tracing::trace!("Task {} reset at {}", self.core.id, time);
        let delay = self.queue_time - self.created_time;
        self.created_time = time;
        self.queue_time = time + delay;
        self.core.reset();
    }

    fn reuse(&mut self, time: f64, options: &QueueTaskOptions, callback: Callback) {
        tracing::trace!("Task {} reused", self.core.id);
        let id = self.core.id;
        match Rc::get_mut(&mut self.core) {
            Some(core) => core.reset(),
            // an old handle still looks at the previous run
            None => self.core = Rc::new(TaskCore::new(id)),
        }
        self.created_time = time;
        self.queue_time = time + options.delay;
        self.preempt = options.preempt;
        self.persistent = options.persistent;
        self.async_mode = options.async_mode;
        self.callback = Some(callback);
        self.prev = None;
        self.next = None;
        self.linked = false;
        self.armed_in = 0;
    }

    /// Strips links and the callback. The callback is handed back so the caller
    /// can drop it outside of any queue borrow.
    fn dispose(&mut self) -> Option<Callback> {
        tracing::trace!("Task {} dispose", self.core.id);
        self.prev = None;
        self.next = None;
        self.linked = false;
        self.callback.take()
    }
}

#[derive(Default)]
struct QueueState {
    tasks: SlotMap<TaskKey, TaskSlot>,
    head: Option<TaskKey>,
    tail: Option<TaskKey>,
    len: usize,
    pool: Vec<TaskKey>,
    pending_async: usize,
    flush_requested: bool,
    flushing: bool,
    flush_seq: u64,
    unhandled: Vec<TaskError>,
}

impl QueueState {
    /// Links `key` in due order. Linear search; per-lane depth stays small in
    /// practice, and removal and pop-front remain O(1).
    fn insert(&mut self, key: TaskKey) {
        let (queue_time, preempt) = {
            let slot = &self.tasks[key];
            (slot.queue_time, slot.preempt)
        };

        let mut cursor = self.head;
        while let Some(current) = cursor {
            let node = &self.tasks[current];
            if node.queue_time > queue_time
                || (preempt && !node.preempt && node.queue_time == queue_time)
            {
                break;
            }
            cursor = node.next;
        }

        let prev = match cursor {
            Some(next) => self.tasks[next].prev,
            None => self.tail,
        };

        {
            let slot = &mut self.tasks[key];
            slot.prev = prev;
            slot.next = cursor;
            slot.linked = true;
        }
        match prev {
            Some(prev) => self.tasks[prev].next = Some(key),
            None => self.head = Some(key),
        }
        match cursor {
            Some(next) => self.tasks[next].prev = Some(key),
            None => self.tail = Some(key),
        }
        self.len += 1;
    }

    fn unlink(&mut self, key: TaskKey) -> bool {
        let (prev, next) = match self.tasks.get_mut(key) {
            Some(slot) if slot.linked => {
                slot.linked = false;
                (slot.prev.take(), slot.next.take())
            }
            _ => return false,
        };
        match prev {
            Some(prev) => self.tasks[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.tasks[next].prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
        true
    }

    /// First task due at `now`, skipping tasks re-armed during the current pass.
    fn next_due(&self, now: f64, seq: u64) -> Option<TaskKey> {
        let mut cursor = self.head;
        while let Some(key) = cursor {
            let slot = &self.tasks[key];
            if slot.queue_time > now {
                return None;
            }
            if slot.armed_in != seq {
                return Some(key);
            }
            cursor = slot.next;
        }
        None
    }

    fn owns(&self, key: TaskKey, core: &Rc<TaskCore>) -> bool {
        self.tasks
            .get(key)
            .is_some_and(|slot| Rc::ptr_eq(&slot.core, core))
    }
}

/// Clears the flushing flag when a pass ends, including by a panicking callback.
struct FlushGuard<'a>(&'a RefCell<QueueState>);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.0.try_borrow_mut() {
            state.flushing = false;
        }
    }
}

struct QueueInner {
    priority: TaskQueuePriority,
    host: Rc<dyn Host>,
    spawner: LocalSpawner,
    budget: Cell<FlushBudget>,
    state: RefCell<QueueState>,
}

/// Due-ordered work for one priority lane.
///
/// Cheap to clone; clones share the same queue. Not thread safe: every call must
/// come from the thread that drives the scheduler.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Rc<QueueInner>,
}

impl TaskQueue {
    pub fn new(priority: TaskQueuePriority, host: Rc<dyn Host>, spawner: LocalSpawner) -> Self {
        Self {
            inner: Rc::new(QueueInner {
                priority,
                host,
                spawner,
                budget: Cell::new(FlushBudget::unbounded()),
                state: RefCell::new(QueueState::default()),
            }),
        }
    }

    pub fn priority(&self) -> TaskQueuePriority {
        self.inner.priority
    }

    pub fn now(&self) -> f64 {
        self.inner.host.now()
    }

    /// Number of queued (pending) tasks.
    pub fn len(&self) -> usize {
        self.inner.state.borrow().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// No queued work and no async task still waiting on its future.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.borrow();
        state.len == 0 && state.pending_async == 0
    }

    /// Whether the earliest queued task is due at `now`.
    pub fn has_due(&self, now: f64) -> bool {
        let state = self.inner.state.borrow();
        state.head.is_some_and(|key| state.tasks[key].queue_time <= now)
    }

    pub fn pending_async(&self) -> usize {
        self.inner.state.borrow().pending_async
    }

    pub fn pool_len(&self) -> usize {
        self.inner.state.borrow().pool.len()
    }

    pub fn is_pooled(&self, id: TaskId) -> bool {
        let state = self.inner.state.borrow();
        state
            .pool
            .iter()
            .any(|&key| state.tasks[key].core.id == id)
    }

    pub fn budget(&self) -> FlushBudget {
        self.inner.budget.get()
    }

    /// Budget applied by [`TaskQueue::flush`].
    pub fn set_budget(&self, budget: FlushBudget) {
        self.inner.budget.set(budget);
    }

    /// Failures of async tasks nobody was awaiting.
    pub fn take_unhandled_errors(&self) -> Vec<TaskError> {
        std::mem::take(&mut self.inner.state.borrow_mut().unhandled)
    }

    pub fn queue_task<T, F>(&self, mut callback: F, options: QueueTaskOptions) -> Task<T>
    where
        T: Clone + 'static,
        F: FnMut(f64) -> anyhow::Result<T> + 'static,
    {
        self.queue_task_with(move |elapsed| TaskReturn::Ready(callback(elapsed)), options)
    }

    pub fn queue_async_task<T, F, Fut>(&self, mut callback: F, options: QueueTaskOptions) -> Task<T>
    where
        T: Clone + 'static,
        F: FnMut(f64) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<T>> + 'static,
    {
        self.queue_task_with(move |elapsed| TaskReturn::future(callback(elapsed)), options)
    }

    /// Queues a callback that decides per run whether it completes now or later.
    pub fn queue_task_with<T, F>(&self, callback: F, options: QueueTaskOptions) -> Task<T>
    where
        T: Clone + 'static,
        F: FnMut(f64) -> TaskReturn<T> + 'static,
    {
        let callback = erase(callback);
        let time = self.inner.host.now();

        let (key, core) = {
            let mut state = self.inner.state.borrow_mut();
            let pooled = if options.reusable { state.pool.pop() } else { None };
            let key = match pooled {
                Some(key) => {
                    state.tasks[key].reuse(time, &options, callback);
                    key
                }
                None => {
                    let id = next_task_id();
                    state.tasks.insert(TaskSlot::new(id, time, &options, callback))
                }
            };
            state.insert(key);
            (key, state.tasks[key].core.clone())
        };

        tracing::trace!(
            "Task {} queued on {} lane (delay {}, preempt {}, persistent {})",
            core.id,
            self.inner.priority,
            options.delay,
            options.preempt,
            options.persistent
        );

        self.request_flush();
        Task::new(key, core, self.clone())
    }

    /// Runs due tasks with the queue's configured budget.
    pub fn flush(&self, now: Option<f64>) -> Result<usize, TaskError> {
        self.flush_within(now, self.inner.budget.get())
    }

    /// Runs every task due at `now` (host time if omitted), earliest first, until the
    /// queue is empty, the next task is not yet due, or `budget` runs out.
    ///
    /// Returns how many tasks ran. An unobserved synchronous callback failure stops
    /// the pass and is returned; tasks not yet run stay queued.
    pub fn flush_within(&self, now: Option<f64>, budget: FlushBudget) -> Result<usize, TaskError> {
        let started = self.inner.host.now();
        let now = now.unwrap_or(started);
        let seq = {
            let mut state = self.inner.state.borrow_mut();
            if state.flushing {
                tracing::debug!("Nested flush of {} lane ignored", self.inner.priority);
                return Ok(0);
            }
            state.flushing = true;
            state.flush_requested = false;
            state.flush_seq += 1;
            state.flush_seq
        };
        let guard = FlushGuard(&self.inner.state);

        let mut ran = 0;
        let result = loop {
            if budget.is_exhausted(ran, self.inner.host.now() - started) {
                break Ok(());
            }
            let next = self.inner.state.borrow().next_due(now, seq);
            let Some(key) = next else {
                break Ok(());
            };
            if let Err(err) = self.run_task(key, None) {
                break Err(err);
            }
            ran += 1;
        };

        drop(guard);
        let remaining = self.inner.state.borrow().len;

        tracing::debug!(
            "Flushed {} lane: {} ran, {} remaining",
            self.inner.priority,
            ran,
            remaining
        );

        if remaining > 0 {
            self.request_flush();
        }

        result.map(|()| ran)
    }

    /// Stops the host from driving this queue; used once nothing is left to run.
    pub fn cancel(&self) {
        let requested = std::mem::replace(&mut self.inner.state.borrow_mut().flush_requested, false);
        if requested {
            tracing::debug!("Canceling flush of {} lane", self.inner.priority);
            self.inner.host.cancel_flush(self.inner.priority);
        }
    }

    fn request_flush(&self) {
        let request = {
            let mut state = self.inner.state.borrow_mut();
            if state.flush_requested || state.flushing || state.len == 0 {
                false
            } else {
                state.flush_requested = true;
                true
            }
        };
        if request {
            self.inner.host.request_flush(self.inner.priority);
        }
    }

    fn remove(&self, key: TaskKey) {
        let now_empty = {
            let mut state = self.inner.state.borrow_mut();
            // a running flush already withdrew its request
            state.unlink(key) && state.len == 0 && !state.flushing
        };
        if now_empty {
            self.cancel();
        }
    }

    /// Runs the task in `key`. When called through a handle, `expected` is that
    /// handle's core and a stale handle fails instead of running someone else's work.
    pub(crate) fn run_task(&self, key: TaskKey, expected: Option<&Rc<TaskCore>>) -> Result<(), TaskError> {
        let (core, mut callback, was_persistent, created_time, async_mode) = {
            let mut state = self.inner.state.borrow_mut();
            if let Some(expected) = expected {
                if !state.owns(key, expected) {
                    return Err(TaskError::InvalidState {
                        id: expected.id,
                        status: expected.status.get(),
                    });
                }
            }

            let slot = &mut state.tasks[key];
            let core = slot.core.clone();
            let status = core.status.get();
            let callback = match slot.callback.take() {
                Some(callback) if status == TaskStatus::Pending => callback,
                taken => {
                    slot.callback = taken;
                    tracing::trace!("Task {} run refused in {} state", core.id, status);
                    return Err(TaskError::InvalidState { id: core.id, status });
                }
            };
            let fields = (slot.persistent, slot.created_time, slot.async_mode);

            core.status.set(TaskStatus::Running);
            (core, callback, fields.0, fields.1, fields.2)
        };
        self.remove(key);

        tracing::trace!("Task {} run", core.id);
        let returned = callback(self.inner.host.now() - created_time);

        // give the callback back so a persistent task can re-arm with it
        self.inner.state.borrow_mut().tasks[key].callback = Some(callback);

        match (async_mode, returned) {
            (AsyncMode::Sync, Erased::Pending(_)) => {
                let err = CallbackError::msg("synchronous task returned a future");
                self.complete(key, &core, Err(err), was_persistent)
            }
            (AsyncMode::Async, Erased::Ready(result)) => {
                self.run_async(key, core, future::ready(result).boxed_local(), was_persistent)
            }
            (_, Erased::Pending(future)) => self.run_async(key, core, future, was_persistent),
            (_, Erased::Ready(result)) => self.complete(key, &core, result, was_persistent),
        }
    }

    fn run_async(
        &self,
        key: TaskKey,
        core: Rc<TaskCore>,
        future: LocalBoxFuture<'static, Result<Value, CallbackError>>,
        was_persistent: bool,
    ) -> Result<(), TaskError> {
        self.inner.state.borrow_mut().pending_async += 1;

        let queue = self.clone();
        let task_core = core.clone();
        let completion = async move {
            let result = future.await;
            queue.complete_async(key, &task_core, result, was_persistent);
        };

        if let Err(err) = self.inner.spawner.spawn_local(completion) {
            tracing::warn!("Task {} could not be spawned: {}", core.id, err);
            self.inner.state.borrow_mut().pending_async -= 1;
            let err = CallbackError::msg(format!("executor unavailable: {err}"));
            return self.complete(key, &core, Err(err), was_persistent);
        }
        Ok(())
    }

    fn complete_async(
        &self,
        key: TaskKey,
        core: &Rc<TaskCore>,
        result: Result<Value, CallbackError>,
        was_persistent: bool,
    ) {
        self.inner.state.borrow_mut().pending_async -= 1;

        if let Err(err) = self.complete(key, core, result, was_persistent) {
            tracing::error!("Unobserved failure in async task {}: {}", core.id, err);
            self.inner.state.borrow_mut().unhandled.push(err);
        }
    }

    /// The completion edge of a run: settle the result, then re-arm or terminate.
    ///
    /// Returns the failure when nobody was awaiting it.
    fn complete(
        &self,
        key: TaskKey,
        core: &Rc<TaskCore>,
        result: Result<Value, CallbackError>,
        was_persistent: bool,
    ) -> Result<(), TaskError> {
        let id = core.id;
        let outcome = result.map_err(|source| TaskError::Callback { id, source });
        let failed = outcome.is_err();
        let still_persistent = self.inner.state.borrow().tasks[key].persistent;

        let observed = if still_persistent && !failed {
            let observed = core.settle(outcome.clone(), false);
            self.rearm(key);
            observed
        } else if was_persistent || still_persistent {
            // persistent tasks never complete; a stopped or failed loop ends canceled
            core.status.set(TaskStatus::Canceled);
            let delivered = if failed {
                outcome.clone()
            } else {
                Err(TaskError::Aborted(TaskAbort {
                    id,
                    priority: self.inner.priority,
                }))
            };
            let observed = core.settle(delivered, true);
            self.retire(key);
            observed
        } else {
            core.status.set(TaskStatus::Completed);
            let observed = core.settle(outcome.clone(), true);
            self.retire(key);
            observed
        };

        tracing::trace!("Task {} finished run as {}", id, core.status.get());

        match outcome {
            Err(err) if !observed => Err(err),
            _ => Ok(()),
        }
    }

    fn rearm(&self, key: TaskKey) {
        let time = self.inner.host.now();
        {
            let mut state = self.inner.state.borrow_mut();
            let armed_in = if state.flushing { state.flush_seq } else { 0 };
            let slot = &mut state.tasks[key];
            slot.reset(time);
            slot.armed_in = armed_in;
            state.insert(key);
        }
        self.request_flush();
    }

    /// Disposes the slot and parks it in the pool, or frees it when not reusable.
    fn retire(&self, key: TaskKey) {
        let (callback, released, freed) = {
            let mut state = self.inner.state.borrow_mut();
            let slot = &mut state.tasks[key];
            let callback = slot.dispose();
            if slot.reusable {
                // without handles nobody can read this core again
                let released = (slot.core.handles.get() == 0).then(|| slot.core.release());
                state.pool.push(key);
                (callback, released, None)
            } else {
                (callback, None, state.tasks.remove(key))
            }
        };
        // user closures and values may hold handles into this queue; drop them unborrowed
        drop(callback);
        drop(released);
        drop(freed);
    }

    pub(crate) fn cancel_task(&self, key: TaskKey, core: &Rc<TaskCore>) -> bool {
        match core.status.get() {
            TaskStatus::Pending => {
                if !self.inner.state.borrow().owns(key, core) {
                    return false;
                }
                tracing::trace!("Task {} canceled while pending", core.id);
                self.remove(key);
                core.status.set(TaskStatus::Canceled);
                core.settle(
                    Err(TaskError::Aborted(TaskAbort {
                        id: core.id,
                        priority: self.inner.priority,
                    })),
                    true,
                );
                self.retire(key);
                true
            }
            TaskStatus::Running => {
                let mut state = self.inner.state.borrow_mut();
                if !state.owns(key, core) {
                    return false;
                }
                let slot = &mut state.tasks[key];
                if slot.persistent {
                    tracing::trace!("Task {} stops after its current run", core.id);
                    slot.persistent = false;
                    true
                } else {
                    false
                }
            }
            TaskStatus::Completed | TaskStatus::Canceled => false,
        }
    }

    pub(crate) fn is_persistent(&self, key: TaskKey, core: &Rc<TaskCore>) -> bool {
        let state = self.inner.state.borrow();
        state.owns(key, core) && state.tasks[key].persistent
    }
}
