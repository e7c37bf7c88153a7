use crate::config::SchedulerConfig;
use crate::error::TaskError;
use crate::queue::TaskQueue;
use crate::task::{QueueTaskOptions, Task, TaskId, TaskReturn};
use futures::executor::LocalPool;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use tock_platform::{Host, TaskQueuePriority};

/// Source of task ids for the whole process. Starts at 1 and only ever grows;
/// pooled tasks keep the id they were first given.
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_task_id() -> TaskId {
    TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
}

/// One task queue per priority lane plus the local executor that drives async
/// task futures. All the state machine work lives in the queues.
pub struct Scheduler {
    host: Rc<dyn Host>,
    executor: RefCell<LocalPool>,
    queues: Vec<TaskQueue>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(host: impl Host + 'static) -> Self {
        Self::with_config(host, SchedulerConfig::default())
    }

    pub fn with_config(host: impl Host + 'static, config: SchedulerConfig) -> Self {
        let host: Rc<dyn Host> = Rc::new(host);
        let executor = LocalPool::new();
        let spawner = executor.spawner();

        let queues = TaskQueuePriority::ALL
            .into_iter()
            .map(|priority| {
                let queue = TaskQueue::new(priority, host.clone(), spawner.clone());
                queue.set_budget(config.lanes.get(priority).budget());
                queue
            })
            .collect();

        tracing::debug!("Scheduler created with config {:?}", config);

        Self {
            host,
            executor: RefCell::new(executor),
            queues,
            config,
        }
    }

    pub fn now(&self) -> f64 {
        self.host.now()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn queue(&self, priority: TaskQueuePriority) -> &TaskQueue {
        &self.queues[priority.index()]
    }

    pub fn queue_task<T, F>(
        &self,
        priority: TaskQueuePriority,
        callback: F,
        options: QueueTaskOptions,
    ) -> Task<T>
    where
        T: Clone + 'static,
        F: FnMut(f64) -> anyhow::Result<T> + 'static,
    {
        self.queue(priority).queue_task(callback, options)
    }

    pub fn queue_async_task<T, F, Fut>(
        &self,
        priority: TaskQueuePriority,
        callback: F,
        options: QueueTaskOptions,
    ) -> Task<T>
    where
        T: Clone + 'static,
        F: FnMut(f64) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<T>> + 'static,
    {
        self.queue(priority).queue_async_task(callback, options)
    }

    pub fn queue_task_with<T, F>(
        &self,
        priority: TaskQueuePriority,
        callback: F,
        options: QueueTaskOptions,
    ) -> Task<T>
    where
        T: Clone + 'static,
        F: FnMut(f64) -> TaskReturn<T> + 'static,
    {
        self.queue(priority).queue_task_with(callback, options)
    }

    pub fn queue_microtask<T, F>(&self, callback: F) -> Task<T>
    where
        T: Clone + 'static,
        F: FnMut(f64) -> anyhow::Result<T> + 'static,
    {
        self.queue_task(TaskQueuePriority::Microtask, callback, self.config.defaults)
    }

    pub fn queue_render_task<T, F>(&self, callback: F) -> Task<T>
    where
        T: Clone + 'static,
        F: FnMut(f64) -> anyhow::Result<T> + 'static,
    {
        self.queue_task(TaskQueuePriority::Render, callback, self.config.defaults)
    }

    pub fn queue_macrotask<T, F>(&self, callback: F) -> Task<T>
    where
        T: Clone + 'static,
        F: FnMut(f64) -> anyhow::Result<T> + 'static,
    {
        self.queue_task(TaskQueuePriority::Macrotask, callback, self.config.defaults)
    }

    pub fn queue_post_render_task<T, F>(&self, callback: F) -> Task<T>
    where
        T: Clone + 'static,
        F: FnMut(f64) -> anyhow::Result<T> + 'static,
    {
        self.queue_task(TaskQueuePriority::PostRender, callback, self.config.defaults)
    }

    pub fn queue_idle_task<T, F>(&self, callback: F) -> Task<T>
    where
        T: Clone + 'static,
        F: FnMut(f64) -> anyhow::Result<T> + 'static,
    {
        self.queue_task(TaskQueuePriority::Idle, callback, self.config.defaults)
    }

    pub fn flush(&self, priority: TaskQueuePriority) -> Result<usize, TaskError> {
        self.queue(priority).flush(None)
    }

    /// Flushes every lane once, highest priority first.
    pub fn flush_all(&self) -> Result<usize, TaskError> {
        let mut ran = 0;
        for queue in &self.queues {
            ran += queue.flush(None)?;
        }
        Ok(ran)
    }

    /// Polls async task futures until none of them can make progress.
    pub fn run_until_stalled(&self) {
        match self.executor.try_borrow_mut() {
            Ok(mut executor) => executor.run_until_stalled(),
            Err(_) => tracing::warn!("run_until_stalled called from inside the executor; ignored"),
        }
    }

    /// Alternates `flush_all` and executor turns until nothing is due and no async
    /// task can progress. Returns whether every lane ended idle; delayed tasks and
    /// futures waiting on outside events leave it `false`.
    pub fn run_until_idle(&self) -> Result<bool, TaskError> {
        for _ in 0..self.config.max_drain_rounds {
            let ran = self.flush_all()?;
            let pending_before = self.pending_async();
            self.run_until_stalled();
            if ran == 0 && self.pending_async() == pending_before && !self.has_due_work() {
                break;
            }
        }
        Ok(self.is_idle())
    }

    pub fn is_idle(&self) -> bool {
        self.queues.iter().all(TaskQueue::is_idle)
    }

    pub fn pending_async(&self) -> usize {
        self.queues.iter().map(TaskQueue::pending_async).sum()
    }

    pub fn take_unhandled_errors(&self) -> Vec<TaskError> {
        self.queues
            .iter()
            .flat_map(TaskQueue::take_unhandled_errors)
            .collect()
    }

    fn has_due_work(&self) -> bool {
        let now = self.host.now();
        self.queues.iter().any(|queue| queue.has_due(now))
    }
}
