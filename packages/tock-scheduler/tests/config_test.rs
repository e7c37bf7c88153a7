use tock_scheduler::{
    AsyncMode, ConfigError, FlushBudget, ManualHost, Scheduler, SchedulerConfig, TaskQueuePriority,
};

#[test]
fn test_config_from_json() {
    let config = SchedulerConfig::from_json(
        r#"{
            "lanes": {
                "render": { "max_tasks_per_flush": 2 },
                "post-render": { "max_flush_ms": 4.0 }
            },
            "defaults": { "reusable": false, "async_mode": "async" }
        }"#,
    )
    .unwrap();

    assert_eq!(config.lanes.render.max_tasks_per_flush, Some(2));
    assert_eq!(config.lanes.post_render.max_flush_ms, Some(4.0));
    assert_eq!(config.lanes.macrotask.budget(), FlushBudget::unbounded());
    assert!(!config.defaults.reusable);
    assert_eq!(config.defaults.async_mode, AsyncMode::Async);
    assert_eq!(config.defaults.delay, 0.0);
    assert_eq!(config.max_drain_rounds, 1000);
}

#[test]
fn test_empty_config_is_default() {
    assert_eq!(
        SchedulerConfig::from_json("{}").unwrap(),
        SchedulerConfig::default()
    );
}

#[test]
fn test_lane_budget_limits_flush() {
    let config = SchedulerConfig::from_json(r#"{ "lanes": { "render": { "max_tasks_per_flush": 2 } } }"#)
        .unwrap();
    let scheduler = Scheduler::with_config(ManualHost::new(), config);

    for _ in 0..5 {
        scheduler.queue_render_task(|_| Ok(()));
    }

    assert_eq!(scheduler.flush(TaskQueuePriority::Render).unwrap(), 2);
    assert_eq!(scheduler.queue(TaskQueuePriority::Render).len(), 3);

    // other lanes are unaffected
    for _ in 0..5 {
        scheduler.queue_macrotask(|_| Ok(()));
    }
    assert_eq!(scheduler.flush(TaskQueuePriority::Macrotask).unwrap(), 5);
}

#[test]
fn test_default_options_apply_to_shorthands() {
    let config = SchedulerConfig::from_json(r#"{ "defaults": { "reusable": false } }"#).unwrap();
    let scheduler = Scheduler::with_config(ManualHost::new(), config);
    let lane = TaskQueuePriority::Microtask;

    let task = scheduler.queue_microtask(|_| Ok(()));
    scheduler.flush(lane).unwrap();

    assert!(!scheduler.queue(lane).is_pooled(task.id()));
    assert_eq!(scheduler.queue(lane).pool_len(), 0);
}

#[test]
fn test_invalid_config() {
    let err = SchedulerConfig::from_json(r#"{ "lanes": [] }"#).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));

    let err = SchedulerConfig::from_json(r#"{ "defaults": { "async_mode": "eventually" } }"#)
        .unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));

    let err = SchedulerConfig::from_json(r#"{ "defaults": { "delay": -5.0 } }"#).unwrap_err();
    assert!(matches!(err, ConfigError::NegativeDelay(d) if d == -5.0));
}
