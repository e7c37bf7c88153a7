use futures::FutureExt;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tock_scheduler::{ManualHost, QueueTaskOptions, Scheduler, TaskQueuePriority, TaskStatus};

const LANE: TaskQueuePriority = TaskQueuePriority::PostRender;

#[test]
fn test_completed_reusable_task_is_pooled_and_reused() {
    let scheduler = Scheduler::new(ManualHost::new());
    let queue = scheduler.queue(LANE);

    let first = scheduler.queue_post_render_task(|_| Ok(()));
    let first_id = first.id();
    drop(first);

    scheduler.flush(LANE).unwrap();
    assert!(queue.is_pooled(first_id));
    assert_eq!(queue.pool_len(), 1);

    let second = scheduler.queue_post_render_task(|_| Ok(()));
    assert_eq!(second.id(), first_id);
    assert_eq!(queue.pool_len(), 0);
    assert_eq!(second.status(), TaskStatus::Pending);
}

#[test]
fn test_non_reusable_task_is_not_pooled() {
    let scheduler = Scheduler::new(ManualHost::new());
    let queue = scheduler.queue(LANE);
    let options = QueueTaskOptions::new().reusable(false);

    let first = scheduler.queue_task(LANE, |_| Ok(()), options);
    scheduler.flush(LANE).unwrap();

    assert_eq!(queue.pool_len(), 0);
    assert!(!queue.is_pooled(first.id()));

    let second = scheduler.queue_task(LANE, |_| Ok(()), options);
    assert_ne!(second.id(), first.id());
}

#[test]
fn test_stale_handle_never_observes_new_run() {
    let scheduler = Scheduler::new(ManualHost::new());

    let old = scheduler.queue_post_render_task(|_| Ok("first"));
    let old_result = old.result().unwrap();
    scheduler.flush(LANE).unwrap();

    let new = scheduler.queue_post_render_task(|_| Ok("second"));
    assert_eq!(new.id(), old.id());

    // the old borrower can neither see nor touch the new run
    assert_eq!(old.status(), TaskStatus::Completed);
    assert!(!old.cancel());
    assert!(old.run().is_err());
    assert_eq!(new.status(), TaskStatus::Pending);

    let new_result = new.result().unwrap();
    scheduler.flush(LANE).unwrap();

    assert_eq!(old_result.now_or_never().unwrap().unwrap(), "first");
    assert_eq!(old.result().unwrap().now_or_never().unwrap().unwrap(), "first");
    assert_eq!(new_result.now_or_never().unwrap().unwrap(), "second");
}

#[test]
fn test_canceled_reusable_task_returns_to_pool() {
    let scheduler = Scheduler::new(ManualHost::new());
    let queue = scheduler.queue(LANE);

    let task = scheduler.queue_post_render_task(|_| Ok(()));
    assert!(task.cancel());

    assert!(queue.is_pooled(task.id()));

    let next = scheduler.queue_post_render_task(|_| Ok(1));
    assert_eq!(next.id(), task.id());
    assert_eq!(task.status(), TaskStatus::Canceled);
}

static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

struct Tracker;
impl Drop for Tracker {
    fn drop(&mut self) {
        DROP_COUNT.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_pooled_task_releases_callback_captures() {
    let scheduler = Scheduler::new(ManualHost::new());

    let tracker = Tracker;
    let task = scheduler.queue_post_render_task(move |_| {
        let _keep = &tracker;
        Ok(())
    });

    assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 0);
    scheduler.flush(LANE).unwrap();

    // disposed on completion even though the slot is parked in the pool
    assert!(scheduler.queue(LANE).is_pooled(task.id()));
    assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 1);
}

static VALUE_DROPS: AtomicUsize = AtomicUsize::new(0);

struct Payload;
impl Drop for Payload {
    fn drop(&mut self) {
        VALUE_DROPS.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_pooled_task_releases_its_result_value() {
    let scheduler = Scheduler::new(ManualHost::new());

    // an unobserved run: nothing but the pooled slot could hold the value
    let task = scheduler.queue_post_render_task(|_| Ok(Rc::new(Payload)));
    let id = task.id();
    drop(task);
    scheduler.flush(LANE).unwrap();

    assert!(scheduler.queue(LANE).is_pooled(id));
    assert_eq!(VALUE_DROPS.load(Ordering::SeqCst), 1);

    // a live handle keeps its own run's result while the slot sits in the pool
    let kept = scheduler.queue_post_render_task(|_| Ok(Rc::new(Payload)));
    scheduler.flush(LANE).unwrap();

    assert!(scheduler.queue(LANE).is_pooled(kept.id()));
    let value = kept.result().unwrap().now_or_never().unwrap().unwrap();
    drop(value);
    assert_eq!(VALUE_DROPS.load(Ordering::SeqCst), 1);

    // and releases it with the last handle
    drop(kept);
    assert_eq!(VALUE_DROPS.load(Ordering::SeqCst), 2);
}
