//! # Tradeflow Scheduler
//!
//! In-process task orchestration for polling-style trading automation.
//! Tasks are async closures over a shared, typed context; runtime state
//! survives restarts through a pluggable snapshot store.
//!
//! ## Design Principles
//! - Tokio timers only: an idle orchestrator costs nothing
//! - Bounded concurrency, per-task timeouts, bounded retries
//! - One invocation per task id at a time
//! - Code never persisted: handlers are re-registered, records restored
//!
//! ## Architecture
//! ```text
//! Orchestrator<C>
//!   ├── SharedContext<C>  (RwLock, handed to every run)
//!   ├── Scheduler
//!   │     ├── IntervalTask: every 30s      → "Poll P2P orders"
//!   │     ├── CronTask:     "0 8 * * *"    → "Daily digest"
//!   │     ├── OneTimeTask:  run on start   → "Warm caches"
//!   │     └── on fire → enabled? → slot free? → condition? → single-flight?
//!   │                      └── busy → WorkQueue (priority, FIFO) or drop
//!   ├── EventBus (broadcast + last 100 events)
//!   └── StateStore
//!         ├── File   (<name>.state.json, atomic rename)
//!         ├── SQLite (orchestrator_state table)
//!         └── Memory
//! ```

pub mod context;
pub mod cron;
pub mod engine;
pub mod events;
pub mod lanes;
pub mod orchestrator;
pub mod persistence;
pub mod registry;
pub mod tasks;

pub use context::{SharedContext, TaskContext};
pub use cron::CronSchedule;
pub use engine::Scheduler;
pub use events::{DropReason, EventBus, OrchestratorEvent, RecordedEvent};
pub use lanes::{OverflowPolicy, QueueStats, WorkQueue};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorContext, OrchestratorStatus};
pub use persistence::{
    FileStateStore, MemoryStateStore, OrchestratorState, SqliteStateStore, StateSnapshot, StateStore,
    open_store,
};
pub use registry::TaskRegistry;
pub use tasks::{Schedule, ScheduleSpec, TaskDefinition, TaskRecord, TaskRuntime, TaskStatus};
