use crate::queue::FlushBudget;
use crate::task::QueueTaskOptions;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tock_platform::TaskQueuePriority;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid scheduler config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("negative default delay {0}")]
    NegativeDelay(f64),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneConfig {
    /// Upper bound on tasks started by one `flush()` of the lane.
    pub max_tasks_per_flush: Option<usize>,
    /// Milliseconds of host time one `flush()` may spend before it stops starting tasks.
    pub max_flush_ms: Option<f64>,
}

impl LaneConfig {
    pub fn budget(&self) -> FlushBudget {
        FlushBudget {
            max_tasks: self.max_tasks_per_flush,
            time_slice: self.max_flush_ms,
        }
    }
}

/// Scheduler settings, usually loaded from the host application's JSON config.
///
/// ```json
/// { "lanes": { "render": { "max_tasks_per_flush": 64 } }, "defaults": { "reusable": false } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub lanes: Lanes,
    /// Options used by the per-lane shorthands such as `queue_render_task`.
    pub defaults: QueueTaskOptions,
    /// Rounds of flush + executor turns `run_until_idle` tries before giving up.
    pub max_drain_rounds: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Lanes {
    pub microtask: LaneConfig,
    pub render: LaneConfig,
    pub macrotask: LaneConfig,
    pub post_render: LaneConfig,
    pub idle: LaneConfig,
}

impl Lanes {
    pub fn get(&self, priority: TaskQueuePriority) -> &LaneConfig {
        match priority {
            TaskQueuePriority::Microtask => &self.microtask,
            TaskQueuePriority::Render => &self.render,
            TaskQueuePriority::Macrotask => &self.macrotask,
            TaskQueuePriority::PostRender => &self.post_render,
            TaskQueuePriority::Idle => &self.idle,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lanes: Lanes::default(),
            defaults: QueueTaskOptions::default(),
            max_drain_rounds: 1000,
        }
    }
}

impl SchedulerConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SchedulerConfig = serde_json::from_str(json)?;
        if config.defaults.delay < 0.0 {
            return Err(ConfigError::NegativeDelay(config.defaults.delay));
        }
        Ok(config)
    }
}
