//! Orchestrator: the public facade over scheduler, context, events and state.
//!
//! ## Lifecycle
//! ```text
//! Created ──initialize──▶ Idle ──start──▶ Running ◀──start── Paused
//!                                            └──────pause──────▶┘
//! any non-terminal ──stop──▶ Stopped
//! ```
//! Snapshots are written after every state-changing call (except while still
//! `Created`, so an unrestored snapshot is never overwritten) and after every
//! task outcome, by a background worker listening on the event bus.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tradeflow_core::{Result, SchedulerConfig, TradeflowConfig, TradeflowError};

use crate::context::{SharedContext, TaskContext};
use crate::engine::Scheduler;
use crate::events::{EventBus, OrchestratorEvent, RecordedEvent};
use crate::persistence::{MemoryStateStore, OrchestratorState, StateStore, open_store};
use crate::tasks::{Schedule, TaskDefinition, TaskRecord};

/// Bounds every orchestrator context satisfies.
pub trait OrchestratorContext: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> OrchestratorContext for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorStatus {
    Created,
    Idle,
    Running,
    Paused,
    Stopped,
}

impl std::fmt::Display for OrchestratorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

struct Lifecycle {
    status: OrchestratorStatus,
    start_time: Option<DateTime<Utc>>,
    pause_time: Option<DateTime<Utc>>,
    resume_time: Option<DateTime<Utc>>,
}

struct Shared<C> {
    name: String,
    scheduler: Scheduler<C>,
    events: Arc<EventBus>,
    store: Arc<dyn StateStore>,
    persist: bool,
    lifecycle: Mutex<Lifecycle>,
    /// Serializes snapshot writes.
    save_lock: Mutex<()>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<C: OrchestratorContext> Shared<C> {
    async fn status(&self) -> OrchestratorStatus {
        self.lifecycle.lock().await.status
    }

    async fn snapshot(&self) -> OrchestratorState<C> {
        let (is_paused, start_time, pause_time, resume_time) = {
            let lc = self.lifecycle.lock().await;
            (
                lc.status == OrchestratorStatus::Paused,
                lc.start_time,
                lc.pause_time,
                lc.resume_time,
            )
        };
        OrchestratorState {
            name: self.name.clone(),
            context: self.scheduler.context().snapshot().await,
            is_paused,
            paused_tasks: self.scheduler.paused_tasks().await,
            start_time,
            pause_time,
            resume_time,
            saved_at: Utc::now(),
            tasks: self.scheduler.list_tasks().await,
        }
    }

    /// Write a snapshot. Failures are reported on the event bus and returned.
    async fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        // Checked under the lock: `stop` clears the snapshot while holding it.
        if self.status().await == OrchestratorStatus::Stopped {
            return Err(TradeflowError::InvalidState(format!(
                "orchestrator '{}' is stopped; nothing to save",
                self.name
            )));
        }
        if !self.persist {
            return Ok(());
        }
        let result = match self.snapshot().await.erase() {
            Ok(state) => self.store.save_state(&state).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            tracing::warn!("⚠️ [{}] State save failed: {}", self.name, e);
            self.events.emit(OrchestratorEvent::Error {
                message: e.to_string(),
            });
        }
        result
    }

    /// Implicit save after a state change; errors are already on the bus.
    async fn save_quietly(&self) {
        match self.status().await {
            OrchestratorStatus::Created | OrchestratorStatus::Stopped => {}
            _ => {
                let _ = self.save().await;
            }
        }
    }

    async fn ensure_usable(&self) -> Result<()> {
        if self.status().await == OrchestratorStatus::Stopped {
            return Err(TradeflowError::InvalidState(format!(
                "orchestrator '{}' is stopped",
                self.name
            )));
        }
        Ok(())
    }

    fn ensure_worker(self: &Arc<Self>) {
        if !self.persist {
            return;
        }
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_none() {
            *worker = Some(tokio::spawn(persist_on_outcome(
                Arc::downgrade(self),
                self.events.subscribe(),
            )));
        }
    }

    fn stop_worker(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = worker.take() {
            handle.abort();
        }
    }
}

impl<C> Drop for Shared<C> {
    fn drop(&mut self) {
        let worker = self.worker.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = worker.take() {
            handle.abort();
        }
    }
}

/// Save after every completed or failed attempt.
async fn persist_on_outcome<C: OrchestratorContext>(
    weak: Weak<Shared<C>>,
    mut rx: broadcast::Receiver<OrchestratorEvent>,
) {
    use broadcast::error::RecvError;
    loop {
        let save = match rx.recv().await {
            Ok(event) => event.is_task_outcome(),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("⚠️ State worker lagged by {} events", skipped);
                true
            }
            Err(RecvError::Closed) => return,
        };
        if !save {
            continue;
        }
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let _ = shared.save().await;
    }
}

/// Task orchestrator over a shared context of type `C`.
pub struct Orchestrator<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for Orchestrator<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: OrchestratorContext> Orchestrator<C> {
    pub fn new(name: impl Into<String>, context: C, config: &SchedulerConfig, store: Arc<dyn StateStore>) -> Self {
        Self::assemble(name.into(), context, config.clone(), store, true)
    }

    pub fn builder(name: impl Into<String>) -> OrchestratorBuilder<C> {
        OrchestratorBuilder {
            name: name.into(),
            context: None,
            config: SchedulerConfig::default(),
            store: None,
            persist: true,
        }
    }

    /// Orchestrator named, tuned and backed as `config` says.
    pub fn from_config(config: &TradeflowConfig, context: C) -> Result<Self> {
        let store = open_store(&config.state, &config.name)?;
        Ok(Self::assemble(
            config.name.clone(),
            context,
            config.scheduler.clone(),
            store,
            config.state.enabled,
        ))
    }

    fn assemble(
        name: String,
        context: C,
        config: SchedulerConfig,
        store: Arc<dyn StateStore>,
        persist: bool,
    ) -> Self {
        let events = Arc::new(EventBus::new(config.event_capacity));
        let scheduler = Scheduler::new(config, SharedContext::new(context), Arc::clone(&events));
        Self {
            shared: Arc::new(Shared {
                name,
                scheduler,
                events,
                store,
                persist,
                lifecycle: Mutex::new(Lifecycle {
                    status: OrchestratorStatus::Created,
                    start_time: None,
                    pause_time: None,
                    resume_time: None,
                }),
                save_lock: Mutex::new(()),
                worker: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    // ─── Tasks ────────────────────────────────────────────

    /// Register or replace a task. Malformed schedules are rejected here.
    pub async fn add_task(&self, definition: TaskDefinition<C>) -> Result<()> {
        self.shared.ensure_usable().await?;
        self.shared.scheduler.add_task(definition).await?;
        self.shared.save_quietly().await;
        Ok(())
    }

    pub async fn add_interval<F, Fut>(&self, id: impl Into<String>, every: Duration, handler: F) -> Result<()>
    where
        F: Fn(TaskContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        self.add_task(TaskDefinition::interval(id, every, handler)?).await
    }

    pub async fn add_cron<F, Fut>(&self, id: impl Into<String>, expression: &str, handler: F) -> Result<()>
    where
        F: Fn(TaskContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        self.add_task(TaskDefinition::cron(id, expression, handler)?).await
    }

    /// Run once as soon as the scheduler runs, then remove itself on success.
    pub async fn add_one_time<F, Fut>(&self, id: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(TaskContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        let task = TaskDefinition::new(id, Schedule::Manual, handler)
            .run_on_start(true)
            .remove_on_success(true);
        self.add_task(task).await
    }

    /// Interval task that only runs while `condition` holds for the context.
    pub async fn add_conditional<P, F, Fut>(
        &self,
        id: impl Into<String>,
        every: Duration,
        condition: P,
        handler: F,
    ) -> Result<()>
    where
        P: Fn(&C) -> bool + Send + Sync + 'static,
        F: Fn(TaskContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        let task = TaskDefinition::interval(id, every, handler)?.with_condition(condition);
        self.add_task(task).await
    }

    pub async fn remove_task(&self, task_id: &str) -> Result<bool> {
        self.shared.ensure_usable().await?;
        let removed = self.shared.scheduler.remove_task(task_id).await;
        if removed {
            self.shared.save_quietly().await;
        }
        Ok(removed)
    }

    pub async fn pause_task(&self, task_id: &str) -> Result<()> {
        self.shared.ensure_usable().await?;
        self.shared.scheduler.pause_task(task_id).await?;
        self.shared.save_quietly().await;
        Ok(())
    }

    pub async fn resume_task(&self, task_id: &str) -> Result<()> {
        self.shared.ensure_usable().await?;
        self.shared.scheduler.resume_task(task_id).await?;
        self.shared.save_quietly().await;
        Ok(())
    }

    /// Fire a task immediately, subject to the usual admission rules.
    pub async fn run_task_now(&self, task_id: &str) -> Result<()> {
        self.shared.ensure_usable().await?;
        self.shared.scheduler.trigger(task_id).await
    }

    // ─── Lifecycle ────────────────────────────────────────

    /// Restore a prior snapshot. Register task definitions first: only
    /// records with a matching id are restored. A snapshot that cannot be
    /// loaded is reported as an `Error` event and the orchestrator starts fresh.
    pub async fn initialize(&self) -> Result<()> {
        let mut lc = self.shared.lifecycle.lock().await;
        if lc.status != OrchestratorStatus::Created {
            return Err(TradeflowError::InvalidState(format!(
                "initialize is only valid once (orchestrator is {})",
                lc.status
            )));
        }

        // An unreadable snapshot degrades to a fresh start; the next save replaces it.
        let snapshot = match self.load().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(
                    "⚠️ [{}] State load failed, starting fresh: {}",
                    self.shared.name,
                    e
                );
                self.shared.events.emit(OrchestratorEvent::Error {
                    message: e.to_string(),
                });
                None
            }
        };

        let (mut restored, mut dropped) = (0, 0);
        match snapshot {
            Some(state) => {
                self.shared.scheduler.context().replace(state.context).await;
                for record in &state.tasks {
                    if self.shared.scheduler.restore_runtime(record).await {
                        restored += 1;
                    } else {
                        dropped += 1;
                        tracing::warn!(
                            "⚠️ [{}] Persisted task '{}' has no registered definition; dropped",
                            self.shared.name,
                            record.id
                        );
                    }
                }
                self.shared.scheduler.mark_paused(&state.paused_tasks).await;
                lc.start_time = state.start_time;
                lc.pause_time = state.pause_time;
                lc.resume_time = state.resume_time;
                lc.status = if state.is_paused {
                    OrchestratorStatus::Paused
                } else {
                    OrchestratorStatus::Idle
                };
                tracing::info!(
                    "📂 [{}] State restored from {} ({} tasks, {} dropped)",
                    self.shared.name,
                    state.saved_at,
                    restored,
                    dropped
                );
            }
            None => {
                lc.status = OrchestratorStatus::Idle;
                tracing::info!("📂 [{}] No prior state; starting fresh", self.shared.name);
            }
        }
        drop(lc);

        self.shared
            .events
            .emit(OrchestratorEvent::StateRestored { restored, dropped });
        Ok(())
    }

    async fn load(&self) -> Result<Option<OrchestratorState<C>>> {
        if !self.shared.persist {
            return Ok(None);
        }
        self.shared
            .store
            .load_state()
            .await?
            .map(|snapshot| snapshot.typed())
            .transpose()
    }

    pub async fn start(&self) -> Result<()> {
        {
            let mut lc = self.shared.lifecycle.lock().await;
            match lc.status {
                OrchestratorStatus::Idle | OrchestratorStatus::Paused => {}
                other => {
                    return Err(TradeflowError::InvalidState(format!("cannot start from {other}")));
                }
            }
            let now = Utc::now();
            if lc.start_time.is_none() {
                lc.start_time = Some(now);
            } else {
                lc.resume_time = Some(now);
            }
            lc.status = OrchestratorStatus::Running;
            self.shared.ensure_worker();
            self.shared.scheduler.start().await;
        }
        tracing::info!("🚀 [{}] Orchestrator started", self.shared.name);
        self.shared.save_quietly().await;
        self.shared.events.emit(OrchestratorEvent::Started);
        Ok(())
    }

    /// Suspend every schedule. In-flight tasks run to completion.
    pub async fn pause(&self) -> Result<()> {
        {
            let mut lc = self.shared.lifecycle.lock().await;
            if lc.status != OrchestratorStatus::Running {
                return Err(TradeflowError::InvalidState(format!("cannot pause from {}", lc.status)));
            }
            self.shared.scheduler.suspend().await;
            lc.pause_time = Some(Utc::now());
            lc.status = OrchestratorStatus::Paused;
        }
        tracing::info!("⏸️ [{}] Orchestrator paused", self.shared.name);
        self.shared.save_quietly().await;
        self.shared.events.emit(OrchestratorEvent::Paused);
        Ok(())
    }

    /// Cancel everything and delete the persisted snapshot. Terminal.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut lc = self.shared.lifecycle.lock().await;
            if lc.status == OrchestratorStatus::Stopped {
                return Err(TradeflowError::InvalidState("already stopped".into()));
            }
            self.shared.stop_worker();
            self.shared.scheduler.shutdown().await;
            lc.status = OrchestratorStatus::Stopped;
        }

        let cleared = if self.shared.persist {
            let _guard = self.shared.save_lock.lock().await;
            self.shared.store.clear_state().await
        } else {
            Ok(())
        };
        if let Err(e) = &cleared {
            tracing::warn!("⚠️ [{}] State clear failed: {}", self.shared.name, e);
            self.shared.events.emit(OrchestratorEvent::Error {
                message: e.to_string(),
            });
        }
        tracing::info!("🛑 [{}] Orchestrator stopped", self.shared.name);
        self.shared.events.emit(OrchestratorEvent::Stopped);
        cleared
    }

    /// Write a snapshot now.
    pub async fn save(&self) -> Result<()> {
        self.shared.save().await
    }

    // ─── Context ──────────────────────────────────────────

    pub fn context(&self) -> &SharedContext<C> {
        self.shared.scheduler.context()
    }

    pub async fn get_context(&self) -> C {
        self.context().snapshot().await
    }

    pub async fn set_context(&self, context: C) -> Result<()> {
        self.shared.ensure_usable().await?;
        self.context().replace(context).await;
        self.shared.save_quietly().await;
        Ok(())
    }

    /// Mutate the context in place.
    pub async fn update_context<R>(&self, f: impl FnOnce(&mut C) -> R) -> Result<R> {
        self.shared.ensure_usable().await?;
        let out = self.context().update(f).await;
        self.shared.save_quietly().await;
        Ok(out)
    }

    /// Overlay the top-level keys of `patch` onto the context's JSON form.
    pub async fn merge_context(&self, patch: serde_json::Value) -> Result<()> {
        self.shared.ensure_usable().await?;
        let serde_json::Value::Object(patch) = patch else {
            return Err(TradeflowError::InvalidState(
                "context patch must be a JSON object".into(),
            ));
        };
        {
            let mut guard = self.context().write().await;
            let mut current = serde_json::to_value(&*guard)?;
            let Some(fields) = current.as_object_mut() else {
                return Err(TradeflowError::InvalidState(
                    "context does not serialize to a JSON object".into(),
                ));
            };
            fields.extend(patch);
            *guard = serde_json::from_value(current)?;
        }
        self.shared.save_quietly().await;
        Ok(())
    }

    // ─── Introspection ────────────────────────────────────

    pub async fn get_state(&self) -> OrchestratorState<C> {
        self.shared.snapshot().await
    }

    pub async fn get_tasks(&self) -> Vec<TaskRecord> {
        self.shared.scheduler.list_tasks().await
    }

    pub async fn get_task(&self, task_id: &str) -> Option<TaskRecord> {
        self.shared.scheduler.get_task(task_id).await
    }

    pub async fn status(&self) -> OrchestratorStatus {
        self.shared.status().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.shared.events.subscribe()
    }

    pub fn recent_events(&self) -> Vec<RecordedEvent> {
        self.shared.events.history()
    }

    pub fn scheduler(&self) -> &Scheduler<C> {
        &self.shared.scheduler
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder<C> {
    name: String,
    context: Option<C>,
    config: SchedulerConfig,
    store: Option<Arc<dyn StateStore>>,
    persist: bool,
}

impl<C: OrchestratorContext> OrchestratorBuilder<C> {
    pub fn context(mut self, context: C) -> Self {
        self.context = Some(context);
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to an in-memory store.
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn build(self) -> Result<Orchestrator<C>> {
        let context = self
            .context
            .ok_or_else(|| TradeflowError::Config(format!("orchestrator '{}' needs a context", self.name)))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStateStore::new()));
        Ok(Orchestrator::assemble(
            self.name,
            context,
            self.config,
            store,
            self.persist,
        ))
    }
}
