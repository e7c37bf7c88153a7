use std::cell::RefCell;
use std::rc::Rc;
use tock_scheduler::{ManualHost, QueueTaskOptions, Scheduler, TaskQueuePriority};

type Log = Rc<RefCell<Vec<&'static str>>>;

fn push(log: &Log, name: &'static str) -> impl FnMut(f64) -> anyhow::Result<()> + 'static {
    let log = log.clone();
    move |_| {
        log.borrow_mut().push(name);
        Ok(())
    }
}

#[test]
fn test_execution_order_across_lanes() {
    let scheduler = Scheduler::new(ManualHost::new());
    let log: Log = Rc::new(RefCell::new(Vec::new()));

    // Schedule tasks in mixed order
    scheduler.queue_post_render_task(push(&log, "post-render"));
    scheduler.queue_render_task(push(&log, "render"));
    scheduler.queue_idle_task(push(&log, "idle"));
    scheduler.queue_microtask(push(&log, "microtask"));

    scheduler.flush_all().unwrap();

    // Verify order: Microtask -> Render -> PostRender -> Idle
    let expected = vec!["microtask", "render", "post-render", "idle"];
    assert_eq!(*log.borrow(), expected);
}

#[test]
fn test_distinct_delays_run_in_due_order() {
    let scheduler = Scheduler::new(ManualHost::new());
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let lane = TaskQueuePriority::Macrotask;

    scheduler.queue_task(lane, push(&log, "30"), QueueTaskOptions::new().delay(30.0));
    scheduler.queue_task(lane, push(&log, "10"), QueueTaskOptions::new().delay(10.0));
    scheduler.queue_task(lane, push(&log, "20"), QueueTaskOptions::new().delay(20.0));
    scheduler.queue_task(lane, push(&log, "0"), QueueTaskOptions::new());

    // Only what is due at t=15 runs
    let ran = scheduler.queue(lane).flush(Some(15.0)).unwrap();
    assert_eq!(ran, 2);
    assert_eq!(*log.borrow(), vec!["0", "10"]);
    assert_eq!(scheduler.queue(lane).len(), 2);

    scheduler.queue(lane).flush(Some(100.0)).unwrap();
    assert_eq!(*log.borrow(), vec!["0", "10", "20", "30"]);
    assert!(scheduler.queue(lane).is_empty());
}

#[test]
fn test_preempt_runs_ahead_of_equally_due_task() {
    let scheduler = Scheduler::new(ManualHost::new());
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let lane = TaskQueuePriority::Render;

    scheduler.queue_task(lane, push(&log, "A"), QueueTaskOptions::new());
    scheduler.queue_task(lane, push(&log, "B"), QueueTaskOptions::new().preempt());

    scheduler.flush(lane).unwrap();

    assert_eq!(*log.borrow(), vec!["B", "A"]);
}

#[test]
fn test_preempt_does_not_jump_earlier_due_work() {
    let scheduler = Scheduler::new(ManualHost::new());
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let lane = TaskQueuePriority::Render;

    scheduler.queue_task(lane, push(&log, "early"), QueueTaskOptions::new());
    scheduler.queue_task(lane, push(&log, "late-preempt"), QueueTaskOptions::new().delay(5.0).preempt());
    scheduler.queue_task(lane, push(&log, "late"), QueueTaskOptions::new().delay(5.0));

    scheduler.queue(lane).flush(Some(10.0)).unwrap();

    assert_eq!(*log.borrow(), vec!["early", "late-preempt", "late"]);
}

#[test]
fn test_equal_due_tasks_keep_arrival_order() {
    let scheduler = Scheduler::new(ManualHost::new());
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let lane = TaskQueuePriority::Macrotask;

    scheduler.queue_task(lane, push(&log, "n1"), QueueTaskOptions::new());
    scheduler.queue_task(lane, push(&log, "p1"), QueueTaskOptions::new().preempt());
    scheduler.queue_task(lane, push(&log, "n2"), QueueTaskOptions::new());
    scheduler.queue_task(lane, push(&log, "p2"), QueueTaskOptions::new().preempt());

    scheduler.flush(lane).unwrap();

    assert_eq!(*log.borrow(), vec!["p1", "p2", "n1", "n2"]);
}

#[test]
fn test_microtask_chaining() {
    // Microtasks queued by microtasks run in the same flush
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let scheduler = Rc::new(Scheduler::new(ManualHost::new()));

    {
        let log = log.clone();
        let sch = scheduler.clone();
        scheduler.queue_microtask(move |_| {
            log.borrow_mut().push("task1");

            // Schedule another
            sch.queue_microtask(push(&log, "task2"));
            Ok(())
        });
    }

    let ran = scheduler.flush(TaskQueuePriority::Microtask).unwrap();

    assert_eq!(ran, 2);
    assert_eq!(*log.borrow(), vec!["task1", "task2"]);
}
