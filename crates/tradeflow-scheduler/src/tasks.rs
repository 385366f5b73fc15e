//! Task definitions: the core data model for scheduled work.
//!
//! A task is split in two: the [`TaskDefinition`] holds code (handler and
//! condition) and never leaves the process, while the [`TaskRuntime`] holds
//! status and counters and is what gets persisted, inside a [`TaskRecord`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tradeflow_core::{Result, TradeflowError};

use crate::context::TaskContext;
use crate::cron::CronSchedule;

/// Boxed future returned by a task handler.
pub type TaskFuture = BoxFuture<'static, anyhow::Result<serde_json::Value>>;

/// The task body.
pub type TaskHandler<C> = Arc<dyn Fn(TaskContext<C>) -> TaskFuture + Send + Sync>;

/// Predicate over the shared context, evaluated at fire time.
pub type Condition<C> = Arc<dyn Fn(&C) -> bool + Send + Sync>;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How/when the task triggers.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Run every period, first tick one period after arming.
    Interval(Duration),
    /// Run at each instant matching a cron expression.
    Cron(CronSchedule),
    /// Only `run_on_start` or an explicit trigger fires it.
    Manual,
}

impl Schedule {
    pub fn interval(every: Duration) -> Result<Self> {
        let schedule = Self::Interval(every);
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn cron(expression: &str) -> Result<Self> {
        Ok(Self::Cron(CronSchedule::parse(expression)?))
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Interval(every) if every.is_zero() => Err(TradeflowError::Schedule(
                "interval must be greater than zero".into(),
            )),
            // Both clocks must be able to represent one period from now.
            Self::Interval(every)
                if std::time::Instant::now().checked_add(*every).is_none()
                    || chrono::Duration::from_std(*every)
                        .ok()
                        .and_then(|d| Utc::now().checked_add_signed(d))
                        .is_none() =>
            {
                Err(TradeflowError::Schedule(format!(
                    "interval of {}s is out of range",
                    every.as_secs()
                )))
            }
            _ => Ok(()),
        }
    }

    /// Next fire time after `now`, if the schedule is recurring.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval(every) => chrono::Duration::from_std(*every)
                .ok()
                .and_then(|d| now.checked_add_signed(d)),
            Self::Cron(cron) => cron.next_after(now),
            Self::Manual => None,
        }
    }

    pub fn spec(&self) -> ScheduleSpec {
        match self {
            Self::Interval(every) => ScheduleSpec::Interval {
                every_ms: every.as_millis() as u64,
            },
            Self::Cron(cron) => ScheduleSpec::Cron {
                expression: cron.expression().to_string(),
            },
            Self::Manual => ScheduleSpec::Manual,
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interval(every) => write!(f, "every {}ms", every.as_millis()),
            Self::Cron(cron) => write!(f, "cron '{cron}'"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Serialized form of a [`Schedule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    Interval { every_ms: u64 },
    Cron { expression: String },
    Manual,
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Error,
    Completed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Mutable runtime record. Only the scheduler writes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRuntime {
    pub status: TaskStatus,
    pub execution_count: u64,
    pub last_execution_time: Option<DateTime<Utc>>,
    pub next_execution_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_result: Option<serde_json::Value>,
    /// Wall time of the last finished attempt.
    #[serde(default)]
    pub last_duration_ms: Option<u64>,
}

/// Serializable view of a task: schedule-derived fields plus runtime record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub schedule: ScheduleSpec,
    pub run_on_start: bool,
    pub priority: i32,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: Option<u64>,
    pub enabled: bool,
    #[serde(flatten)]
    pub runtime: TaskRuntime,
}

/// A schedulable unit of work: identity, policy and code.
pub struct TaskDefinition<C> {
    id: String,
    schedule: Schedule,
    run_on_start: bool,
    condition: Option<Condition<C>>,
    priority: i32,
    max_retries: u32,
    retry_delay: Duration,
    timeout: Option<Duration>,
    enabled: bool,
    remove_on_success: bool,
    handler: TaskHandler<C>,
}

impl<C> Clone for TaskDefinition<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            schedule: self.schedule.clone(),
            run_on_start: self.run_on_start,
            condition: self.condition.clone(),
            priority: self.priority,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            timeout: self.timeout,
            enabled: self.enabled,
            remove_on_success: self.remove_on_success,
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<C> std::fmt::Debug for TaskDefinition<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("id", &self.id)
            .field("schedule", &self.schedule)
            .field("run_on_start", &self.run_on_start)
            .field("has_condition", &self.condition.is_some())
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl<C: Send + Sync + 'static> TaskDefinition<C> {
    pub fn new<F, Fut>(id: impl Into<String>, schedule: Schedule, handler: F) -> Self
    where
        F: Fn(TaskContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            id: id.into(),
            schedule,
            run_on_start: false,
            condition: None,
            priority: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            timeout: None,
            enabled: true,
            remove_on_success: false,
            handler: Arc::new(move |ctx| -> TaskFuture { Box::pin(handler(ctx)) }),
        }
    }

    /// Create a recurring interval task.
    pub fn interval<F, Fut>(id: impl Into<String>, every: Duration, handler: F) -> Result<Self>
    where
        F: Fn(TaskContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        Ok(Self::new(id, Schedule::interval(every)?, handler))
    }

    /// Create a cron-scheduled task.
    pub fn cron<F, Fut>(id: impl Into<String>, expression: &str, handler: F) -> Result<Self>
    where
        F: Fn(TaskContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        Ok(Self::new(id, Schedule::cron(expression)?, handler))
    }

    /// Create a task that only fires on `run_on_start` or an explicit trigger.
    pub fn manual<F, Fut>(id: impl Into<String>, handler: F) -> Self
    where
        F: Fn(TaskContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        Self::new(id, Schedule::Manual, handler)
    }

    /// Skip firings while `condition` is false for the current context.
    pub fn with_condition(mut self, condition: impl Fn(&C) -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }
}

impl<C> TaskDefinition<C> {
    pub fn run_on_start(mut self, run_on_start: bool) -> Self {
        self.run_on_start = run_on_start;
        self
    }

    /// Tie-break for queued attempts; higher runs first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Remove the task after its first successful invocation.
    pub fn remove_on_success(mut self, remove: bool) -> Self {
        self.remove_on_success = remove;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn runs_on_start(&self) -> bool {
        self.run_on_start
    }

    pub fn condition(&self) -> Option<&Condition<C>> {
        self.condition.as_ref()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn removes_on_success(&self) -> bool {
        self.remove_on_success
    }

    pub fn handler(&self) -> &TaskHandler<C> {
        &self.handler
    }

    /// The task's own timeout, or `default` when it has none.
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }

    /// Serializable view of this definition combined with its runtime record.
    pub fn record(&self, runtime: &TaskRuntime) -> TaskRecord {
        TaskRecord {
            id: self.id.clone(),
            schedule: self.schedule.spec(),
            run_on_start: self.run_on_start,
            priority: self.priority,
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay.as_millis() as u64,
            timeout_ms: self.timeout.map(|t| t.as_millis() as u64),
            enabled: self.enabled,
            runtime: runtime.clone(),
        }
    }
}
