//! Scheduler engine: arms timers and turns firings into bounded executions.
//!
//! Every armed task gets its own trigger loop (a tokio task holding only a
//! `Weak` back-reference). A firing runs the admission pipeline
//! (enabled → concurrency → condition → single-flight) and, once a slot is
//! reserved, spawns the body separately so triggers never wait on task code.
//! The state mutex is never held across a task body or a condition.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tradeflow_core::{OverflowPolicy, Result, SchedulerConfig, TradeflowError};

use crate::context::{SharedContext, TaskContext};
use crate::events::{DropReason, EventBus, OrchestratorEvent};
use crate::lanes::{Enqueue, QueueStats, WorkQueue};
use crate::registry::TaskRegistry;
use crate::tasks::{Schedule, TaskDefinition, TaskHandler, TaskRecord, TaskStatus};

/// What caused an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Timer,
    Queued,
    Manual,
    /// Retry after failure; only valid for the registration it was scheduled for.
    Retry { epoch: u64 },
}

/// Everything an execution needs once its slot is reserved.
struct PreparedRun<C> {
    task_id: String,
    run_id: String,
    epoch: u64,
    handler: TaskHandler<C>,
    timeout: Duration,
    ctx: TaskContext<C>,
}

struct SchedulerState<C> {
    registry: TaskRegistry<C>,
    /// Armed trigger loops by task id.
    triggers: HashMap<String, JoinHandle<()>>,
    /// Ids with an invocation in flight.
    running: HashSet<String>,
    queue: WorkQueue,
    /// Per-task pause markers.
    paused: HashSet<String>,
    /// Registration generation per id; stale runs and retries compare against it.
    epochs: HashMap<String, u64>,
    next_epoch: u64,
    /// False before start, while suspended and after shutdown.
    active: bool,
}

impl<C> SchedulerState<C> {
    /// Epoch of a task allowed to fire right now.
    fn admissible(&self, task_id: &str) -> Option<u64> {
        if !self.active || self.paused.contains(task_id) {
            return None;
        }
        let entry = self.registry.get(task_id)?;
        if !entry.definition.is_enabled() {
            return None;
        }
        self.epochs.get(task_id).copied()
    }

    fn refresh_next(&mut self, task_id: &str) {
        if let Some(entry) = self.registry.get_mut(task_id) {
            entry.runtime.next_execution_time = entry.definition.schedule().next_after(Utc::now());
        }
    }

    /// Apply the overflow policy to an attempt that found every slot busy.
    fn overflow(&mut self, task_id: &str, policy: OverflowPolicy) -> OrchestratorEvent {
        let dropped = |reason| OrchestratorEvent::TaskDropped {
            task_id: task_id.to_string(),
            reason,
        };
        if self.running.contains(task_id) {
            return dropped(DropReason::AlreadyRunning);
        }
        match policy {
            OverflowPolicy::Drop => dropped(DropReason::ConcurrencyLimit),
            OverflowPolicy::Queue => {
                let priority = self
                    .registry
                    .get(task_id)
                    .map(|e| e.definition.priority())
                    .unwrap_or_default();
                match self.queue.push(task_id, priority) {
                    Enqueue::Queued(queued) => OrchestratorEvent::TaskQueued {
                        task_id: task_id.to_string(),
                        queued,
                    },
                    Enqueue::Full => dropped(DropReason::QueueFull),
                    Enqueue::Duplicate => dropped(DropReason::AlreadyQueued),
                }
            }
        }
    }

    fn disarm(&mut self, task_id: &str) {
        if let Some(handle) = self.triggers.remove(task_id) {
            handle.abort();
        }
        self.queue.remove(task_id);
    }

    fn disarm_all(&mut self) {
        for (_, handle) in self.triggers.drain() {
            handle.abort();
        }
        self.queue.clear();
    }

    fn remove(&mut self, task_id: &str) -> bool {
        self.disarm(task_id);
        self.paused.remove(task_id);
        self.epochs.remove(task_id);
        self.registry.remove(task_id).is_some()
    }
}

impl<C> Drop for SchedulerState<C> {
    fn drop(&mut self) {
        for handle in self.triggers.values() {
            handle.abort();
        }
    }
}

struct Inner<C> {
    state: Mutex<SchedulerState<C>>,
    context: SharedContext<C>,
    events: Arc<EventBus>,
    config: SchedulerConfig,
}

impl<C: Send + Sync + 'static> Inner<C> {
    /// Arm the trigger loop for one task, replacing any previous one.
    fn arm(self: &Arc<Self>, st: &mut SchedulerState<C>, task_id: &str) {
        let Some(entry) = st.registry.get_mut(task_id) else {
            return;
        };
        let schedule = entry.definition.schedule().clone();
        let run_on_start = entry.definition.runs_on_start();
        let now = Utc::now();
        entry.runtime.next_execution_time = if run_on_start {
            Some(now)
        } else {
            schedule.next_after(now)
        };
        if entry.runtime.status == TaskStatus::Paused {
            entry.runtime.status = TaskStatus::Idle;
        }

        if let Some(old) = st.triggers.remove(task_id) {
            old.abort();
        }
        if matches!(schedule, Schedule::Manual) && !run_on_start {
            return;
        }

        let handle = tokio::spawn(trigger_loop(
            Arc::downgrade(self),
            task_id.to_string(),
            schedule,
            run_on_start,
        ));
        st.triggers.insert(task_id.to_string(), handle);
    }

    fn spawn_attempt(self: &Arc<Self>, task_id: String, trigger: Trigger, delay: Option<Duration>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(inner) = weak.upgrade() {
                inner.attempt(&task_id, trigger).await;
            }
        });
    }

    /// Run the admission pipeline for one firing and spawn the body if admitted.
    async fn attempt(self: &Arc<Self>, task_id: &str, trigger: Trigger) {
        let limit = self.config.concurrency_limit();
        let policy = self.config.overflow;

        let condition = {
            let mut st = self.state.lock().await;
            let Some(epoch) = st.admissible(task_id) else {
                return;
            };
            if matches!(trigger, Trigger::Retry { epoch: expected } if expected != epoch) {
                return;
            }
            if st.running.len() >= limit {
                let event = st.overflow(task_id, policy);
                st.refresh_next(task_id);
                drop(st);
                self.report_overflow(event);
                return;
            }
            match trigger {
                Trigger::Retry { .. } => None,
                _ => st
                    .registry
                    .get(task_id)
                    .and_then(|e| e.definition.condition().cloned()),
            }
        };

        if let Some(condition) = condition {
            let passed = {
                let guard = self.context.read().await;
                condition(&*guard)
            };
            if !passed {
                self.state.lock().await.refresh_next(task_id);
                tracing::debug!("⏭️ Task '{}' skipped: condition not met", task_id);
                self.events.emit(OrchestratorEvent::TaskSkipped {
                    task_id: task_id.to_string(),
                });
                return;
            }
        }

        let run = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            let Some(epoch) = st.admissible(task_id) else {
                return;
            };
            if st.running.contains(task_id) {
                st.refresh_next(task_id);
                drop(guard);
                self.report_overflow(OrchestratorEvent::TaskDropped {
                    task_id: task_id.to_string(),
                    reason: DropReason::AlreadyRunning,
                });
                return;
            }
            if st.running.len() >= limit {
                let event = st.overflow(task_id, policy);
                st.refresh_next(task_id);
                drop(guard);
                self.report_overflow(event);
                return;
            }
            let Some(entry) = st.registry.get_mut(task_id) else {
                return;
            };

            let now = Utc::now();
            entry.runtime.status = TaskStatus::Running;
            entry.runtime.execution_count += 1;
            entry.runtime.last_execution_time = Some(now);
            entry.runtime.next_execution_time = entry.definition.schedule().next_after(now);

            let run = PreparedRun {
                task_id: task_id.to_string(),
                run_id: uuid::Uuid::new_v4().to_string(),
                epoch,
                handler: Arc::clone(entry.definition.handler()),
                timeout: entry.definition.effective_timeout(self.config.default_timeout()),
                ctx: TaskContext {
                    context: self.context.clone(),
                    task_id: task_id.to_string(),
                    execution_count: entry.runtime.execution_count,
                    last_execution_time: entry.runtime.last_execution_time,
                    next_execution_time: entry.runtime.next_execution_time,
                },
            };
            st.running.insert(task_id.to_string());
            st.queue.remove(task_id);
            run
        };

        tracing::debug!(
            "🚀 Task '{}' started (run #{}, {:?})",
            run.task_id,
            run.ctx.execution_count,
            trigger
        );
        self.events.emit(OrchestratorEvent::TaskStarted {
            task_id: run.task_id.clone(),
            run_id: run.run_id.clone(),
            execution_count: run.ctx.execution_count,
        });
        tokio::spawn(Arc::clone(self).execute(run));
    }

    fn report_overflow(&self, event: OrchestratorEvent) {
        if let OrchestratorEvent::TaskDropped { task_id, reason } = &event {
            match reason {
                DropReason::AlreadyRunning | DropReason::AlreadyQueued => {
                    tracing::debug!("↩️ Task '{}' dropped: {}", task_id, reason)
                }
                _ => tracing::warn!("⚠️ Task '{}' dropped: {}", task_id, reason),
            }
        }
        self.events.emit(event);
    }

    /// Run the body under its timeout, then record the outcome.
    async fn execute(self: Arc<Self>, run: PreparedRun<C>) {
        let PreparedRun {
            task_id,
            run_id,
            epoch,
            handler,
            timeout,
            ctx,
        } = run;

        let started = Instant::now();
        let mut handle = tokio::spawn(handler(ctx));
        let outcome = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(TradeflowError::task(&task_id, format!("{e:#}"))),
            Ok(Err(e)) if e.is_panic() => Err(TradeflowError::task(&task_id, "task panicked")),
            Ok(Err(_)) => Err(TradeflowError::task(&task_id, "task was cancelled")),
            Err(_) => {
                handle.abort();
                Err(TradeflowError::Timeout {
                    task_id: task_id.clone(),
                    after_ms: timeout.as_millis() as u64,
                })
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        self.complete(task_id, run_id, epoch, outcome, duration_ms).await;
    }

    async fn complete(
        self: &Arc<Self>,
        task_id: String,
        run_id: String,
        epoch: u64,
        outcome: Result<serde_json::Value>,
        duration_ms: u64,
    ) {
        let limit = self.config.concurrency_limit();

        let (retry, removed, drained) = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            st.running.remove(&task_id);
            let held = !st.active || st.paused.contains(&task_id);

            let mut retry = None;
            let mut remove = false;
            let current = st.epochs.get(&task_id) == Some(&epoch);
            if let Some(entry) = st.registry.get_mut(&task_id).filter(|_| current) {
                let runtime = &mut entry.runtime;
                runtime.last_duration_ms = Some(duration_ms);
                runtime.next_execution_time = if held {
                    None
                } else {
                    entry.definition.schedule().next_after(Utc::now())
                };
                match &outcome {
                    Ok(value) => {
                        runtime.status = if held { TaskStatus::Paused } else { TaskStatus::Completed };
                        runtime.last_result = Some(value.clone());
                        remove = entry.definition.removes_on_success();
                    }
                    Err(e) => {
                        runtime.status = if held { TaskStatus::Paused } else { TaskStatus::Error };
                        runtime.last_error = Some(e.to_string());
                        if !held
                            && runtime.execution_count < u64::from(entry.definition.max_retries())
                        {
                            retry = Some(entry.definition.retry_delay());
                        }
                    }
                }
            }
            if remove {
                st.remove(&task_id);
            }

            let free = limit.saturating_sub(st.running.len());
            let drained: Vec<String> = (0..free)
                .map_while(|_| st.queue.pop())
                .map(|a| a.task_id)
                .collect();
            (retry, remove, drained)
        };

        match outcome {
            Ok(result) => {
                tracing::info!("✅ Task '{}' completed in {}ms", task_id, duration_ms);
                self.events.emit(OrchestratorEvent::TaskCompleted {
                    task_id: task_id.clone(),
                    run_id,
                    result,
                    duration_ms,
                });
            }
            Err(e) => {
                tracing::warn!(
                    "⚠️ Task '{}' failed: {}{}",
                    task_id,
                    e,
                    if retry.is_some() { " (retry scheduled)" } else { "" }
                );
                self.events.emit(OrchestratorEvent::TaskFailed {
                    task_id: task_id.clone(),
                    run_id,
                    error: e.to_string(),
                    timed_out: e.is_timeout(),
                    will_retry: retry.is_some(),
                });
            }
        }

        if removed {
            tracing::info!("🗑️ One-time task '{}' removed after success", task_id);
        }
        if let Some(delay) = retry {
            self.spawn_attempt(task_id, Trigger::Retry { epoch }, Some(delay));
        }
        for id in drained {
            self.spawn_attempt(id, Trigger::Queued, None);
        }
    }
}

/// Sleep according to the schedule and fire until the scheduler is gone
/// or this loop is aborted.
async fn trigger_loop<C: Send + Sync + 'static>(
    weak: Weak<Inner<C>>,
    task_id: String,
    schedule: Schedule,
    run_on_start: bool,
) {
    if run_on_start {
        tokio::task::yield_now().await;
        if !fire(&weak, &task_id).await {
            return;
        }
    }

    match schedule {
        Schedule::Interval(every) => {
            let Some(first) = Instant::now().checked_add(every) else {
                tracing::warn!("⚠️ Interval for task '{}' is out of range", task_id);
                return;
            };
            let mut ticker = tokio::time::interval_at(first, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !fire(&weak, &task_id).await {
                    return;
                }
            }
        }
        Schedule::Cron(cron) => {
            let mut last_fired: Option<DateTime<Utc>> = None;
            loop {
                let now = Utc::now();
                let from = last_fired.map_or(now, |last| last.max(now));
                let Some(next) = cron.next_after(from) else {
                    tracing::warn!("⚠️ Cron '{}' for task '{}' has no future match", cron, task_id);
                    return;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                last_fired = Some(next);
                if !fire(&weak, &task_id).await {
                    return;
                }
            }
        }
        Schedule::Manual => {}
    }
}

async fn fire<C: Send + Sync + 'static>(weak: &Weak<Inner<C>>, task_id: &str) -> bool {
    match weak.upgrade() {
        Some(inner) => {
            inner.attempt(task_id, Trigger::Timer).await;
            true
        }
        None => false,
    }
}

/// The scheduler: owns tasks, timers, slots and pause markers.
pub struct Scheduler<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for Scheduler<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Send + Sync + 'static> Scheduler<C> {
    pub fn new(config: SchedulerConfig, context: SharedContext<C>, events: Arc<EventBus>) -> Self {
        let state = SchedulerState {
            registry: TaskRegistry::new(),
            triggers: HashMap::new(),
            running: HashSet::new(),
            queue: WorkQueue::new(config.queue_capacity),
            paused: HashSet::new(),
            epochs: HashMap::new(),
            next_epoch: 0,
            active: false,
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                context,
                events,
                config,
            }),
        }
    }

    pub fn context(&self) -> &SharedContext<C> {
        &self.inner.context
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Register (or replace) a task. Arms it immediately if the scheduler is running.
    pub async fn add_task(&self, definition: TaskDefinition<C>) -> Result<()> {
        definition.schedule().validate()?;
        let task_id = definition.id().to_string();
        let schedule = definition.schedule().to_string();

        let mut guard = self.inner.state.lock().await;
        let st = &mut *guard;
        st.disarm(&task_id);
        st.paused.remove(&task_id);
        if st.registry.add(definition).is_some() {
            tracing::debug!("♻️ Task '{}' replaced; runtime record reset", task_id);
        }
        st.next_epoch += 1;
        st.epochs.insert(task_id.clone(), st.next_epoch);
        if st.active {
            self.inner.arm(st, &task_id);
        }
        tracing::info!("📅 Task added: '{}' ({})", task_id, schedule);
        Ok(())
    }

    /// Remove a task and cancel its timer. In-flight runs finish but are not recorded.
    pub async fn remove_task(&self, task_id: &str) -> bool {
        let removed = self.inner.state.lock().await.remove(task_id);
        if removed {
            tracing::info!("🗑️ Task removed: '{}'", task_id);
        }
        removed
    }

    pub async fn pause_task(&self, task_id: &str) -> Result<()> {
        let mut guard = self.inner.state.lock().await;
        let st = &mut *guard;
        let entry = st
            .registry
            .get_mut(task_id)
            .ok_or_else(|| TradeflowError::TaskNotFound(task_id.to_string()))?;
        if entry.runtime.status != TaskStatus::Running {
            entry.runtime.status = TaskStatus::Paused;
        }
        entry.runtime.next_execution_time = None;
        st.paused.insert(task_id.to_string());
        st.disarm(task_id);
        tracing::info!("⏸️ Task paused: '{}'", task_id);
        Ok(())
    }

    /// Clear the pause marker and re-arm from now.
    pub async fn resume_task(&self, task_id: &str) -> Result<()> {
        let mut guard = self.inner.state.lock().await;
        let st = &mut *guard;
        if !st.registry.contains(task_id) {
            return Err(TradeflowError::TaskNotFound(task_id.to_string()));
        }
        st.paused.remove(task_id);
        if st.active {
            self.inner.arm(st, task_id);
        }
        tracing::info!("▶️ Task resumed: '{}'", task_id);
        Ok(())
    }

    /// Fire a task now through the normal admission pipeline.
    pub async fn trigger(&self, task_id: &str) -> Result<()> {
        {
            let st = self.inner.state.lock().await;
            if !st.registry.contains(task_id) {
                return Err(TradeflowError::TaskNotFound(task_id.to_string()));
            }
            if !st.active {
                return Err(TradeflowError::InvalidState(format!(
                    "cannot run '{task_id}': scheduler is not running"
                )));
            }
        }
        self.inner.attempt(task_id, Trigger::Manual).await;
        Ok(())
    }

    /// Arm every task that is not individually paused.
    pub async fn start(&self) {
        let mut guard = self.inner.state.lock().await;
        let st = &mut *guard;
        if st.active {
            return;
        }
        st.active = true;
        if st.registry.is_empty() {
            tracing::warn!("⚠️ Scheduler started with no tasks registered");
        }
        for task_id in st.registry.ids() {
            if !st.paused.contains(&task_id) {
                self.inner.arm(st, &task_id);
            }
        }
        tracing::info!(
            "⏰ Scheduler started ({} tasks, max {} concurrent)",
            st.registry.len(),
            self.inner.config.concurrency_limit()
        );
    }

    /// Disarm everything. In-flight runs continue to completion or timeout.
    pub async fn suspend(&self) {
        let mut guard = self.inner.state.lock().await;
        let st = &mut *guard;
        st.active = false;
        st.disarm_all();
        for entry in st.registry.entries_mut() {
            if entry.runtime.status != TaskStatus::Running {
                entry.runtime.status = TaskStatus::Paused;
            }
            entry.runtime.next_execution_time = None;
        }
        tracing::info!("⏸️ Scheduler suspended");
    }

    /// Cancel every schedule and forget queued attempts.
    pub async fn shutdown(&self) {
        let mut guard = self.inner.state.lock().await;
        let st = &mut *guard;
        st.active = false;
        st.disarm_all();
        for entry in st.registry.entries_mut() {
            entry.runtime.next_execution_time = None;
        }
        tracing::info!("🛑 Scheduler shut down");
    }

    /// Overwrite a registered task's runtime record with a persisted one.
    /// Returns false when no definition with that id is registered.
    pub async fn restore_runtime(&self, record: &TaskRecord) -> bool {
        let mut st = self.inner.state.lock().await;
        let Some(entry) = st.registry.get_mut(&record.id) else {
            return false;
        };
        entry.runtime = record.runtime.clone();
        if entry.runtime.status == TaskStatus::Running {
            entry.runtime.status = TaskStatus::Idle;
        }
        true
    }

    /// Apply persisted per-task pause markers; unknown ids are ignored.
    pub async fn mark_paused(&self, task_ids: &[String]) {
        let mut guard = self.inner.state.lock().await;
        let st = &mut *guard;
        for task_id in task_ids {
            let Some(entry) = st.registry.get_mut(task_id) else {
                continue;
            };
            if entry.runtime.status != TaskStatus::Running {
                entry.runtime.status = TaskStatus::Paused;
            }
            entry.runtime.next_execution_time = None;
            st.paused.insert(task_id.clone());
            st.disarm(task_id);
        }
    }

    pub async fn get_task(&self, task_id: &str) -> Option<TaskRecord> {
        let st = self.inner.state.lock().await;
        st.registry.get(task_id).map(|e| e.record())
    }

    pub async fn list_tasks(&self) -> Vec<TaskRecord> {
        self.inner.state.lock().await.registry.list()
    }

    pub async fn contains(&self, task_id: &str) -> bool {
        self.inner.state.lock().await.registry.contains(task_id)
    }

    pub async fn paused_tasks(&self) -> Vec<String> {
        let st = self.inner.state.lock().await;
        let mut ids: Vec<String> = st.paused.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn running_count(&self) -> usize {
        self.inner.state.lock().await.running.len()
    }

    pub async fn queued_count(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.inner.state.lock().await.queue.stats()
    }
}
