//! End-to-end orchestrator scenarios, mostly on a paused tokio clock.
//! Cron and file-store scenarios run on the real clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::sleep;
use tradeflow_core::{OverflowPolicy, Result, SchedulerConfig, TradeflowError};
use tradeflow_scheduler::{
    FileStateStore, MemoryStateStore, Orchestrator, OrchestratorEvent, OrchestratorStatus, StateSnapshot,
    StateStore, TaskDefinition, TaskStatus,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Desk {
    open: bool,
    orders: u32,
}

fn desk(store: Arc<dyn StateStore>, config: SchedulerConfig) -> Orchestrator<Desk> {
    Orchestrator::builder("desk")
        .context(Desk::default())
        .config(config)
        .store(store)
        .build()
        .unwrap()
}

async fn running(config: SchedulerConfig) -> Orchestrator<Desk> {
    let orch = desk(Arc::new(MemoryStateStore::new()), config);
    orch.initialize().await.unwrap();
    orch.start().await.unwrap();
    orch
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

macro_rules! counting {
    ($hits:expr) => {{
        let hits = Arc::clone(&$hits);
        move |_ctx: tradeflow_scheduler::TaskContext<Desk>| {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        }
    }};
}

fn events(orch: &Orchestrator<Desk>) -> Vec<OrchestratorEvent> {
    orch.recent_events().into_iter().map(|r| r.event).collect()
}

fn errors(orch: &Orchestrator<Desk>) -> usize {
    events(orch)
        .iter()
        .filter(|e| matches!(e, OrchestratorEvent::Error { .. }))
        .count()
}

/// Store whose disk is gone: every call fails.
struct UnavailableStore;

#[async_trait]
impl StateStore for UnavailableStore {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn save_state(&self, _state: &StateSnapshot) -> Result<()> {
        Err(TradeflowError::Persistence("disk unavailable".into()))
    }

    async fn load_state(&self) -> Result<Option<StateSnapshot>> {
        Err(TradeflowError::Persistence("disk unavailable".into()))
    }

    async fn clear_state(&self) -> Result<()> {
        Err(TradeflowError::Persistence("disk unavailable".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn failing_interval_task_retries_then_reports_error() {
    let orch = running(SchedulerConfig::default()).await;
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let task = TaskDefinition::interval("flaky", ms(100), move |_ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(anyhow::anyhow!("exchange unavailable")) }
    })
    .unwrap()
    .with_max_retries(2)
    .with_retry_delay(ms(20));
    orch.add_task(task).await.unwrap();

    sleep(ms(350)).await;

    let record = orch.get_task("flaky").await.unwrap();
    assert!(record.runtime.execution_count >= 3);
    assert_eq!(hits.load(Ordering::SeqCst) as u64, record.runtime.execution_count);
    assert_eq!(record.runtime.status, TaskStatus::Error);
    assert!(record.runtime.last_error.unwrap().contains("exchange unavailable"));

    let retries: Vec<bool> = events(&orch)
        .into_iter()
        .filter_map(|e| match e {
            OrchestratorEvent::TaskFailed { will_retry, .. } => Some(will_retry),
            _ => None,
        })
        .collect();
    assert!(retries[0]);
    assert!(!retries[1]);
}

#[tokio::test(start_paused = true)]
async fn concurrency_bound_is_never_exceeded() {
    let orch = running(SchedulerConfig {
        max_concurrent_tasks: 1,
        ..SchedulerConfig::default()
    })
    .await;

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    for id in ["alpha", "beta"] {
        let (current, peak, runs) = (Arc::clone(&current), Arc::clone(&peak), Arc::clone(&runs));
        orch.add_interval(id, ms(50), move |_ctx| {
            let (current, peak, runs) = (Arc::clone(&current), Arc::clone(&peak), Arc::clone(&runs));
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(ms(30)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        })
        .await
        .unwrap();
    }

    sleep(ms(500)).await;

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(runs.load(Ordering::SeqCst) >= 4);
    assert!(orch.get_task("alpha").await.unwrap().runtime.execution_count > 0);
    assert!(orch.get_task("beta").await.unwrap().runtime.execution_count > 0);
}

#[tokio::test(start_paused = true)]
async fn drop_policy_reports_instead_of_queueing() {
    let orch = running(SchedulerConfig {
        max_concurrent_tasks: 1,
        overflow: OverflowPolicy::Drop,
        ..SchedulerConfig::default()
    })
    .await;
    orch.add_task(TaskDefinition::manual("long", |_ctx| async {
        sleep(ms(100)).await;
        Ok(json!(null))
    }))
    .await
    .unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    orch.add_task(TaskDefinition::manual("short", counting!(hits))).await.unwrap();

    orch.run_task_now("long").await.unwrap();
    orch.run_task_now("short").await.unwrap();
    sleep(ms(200)).await;

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(events(&orch).iter().any(|e| matches!(
        e,
        OrchestratorEvent::TaskDropped { task_id, .. } if task_id == "short"
    )));
}

#[tokio::test(start_paused = true)]
async fn timeout_yields_exactly_one_failure() {
    let orch = running(SchedulerConfig::default()).await;
    let finished = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&finished);
    let task = TaskDefinition::manual("stuck", move |_ctx| {
        let flag = Arc::clone(&flag);
        async move {
            sleep(Duration::from_secs(5)).await;
            flag.fetch_add(1, Ordering::SeqCst);
            Ok(json!("late"))
        }
    })
    .timeout(ms(50))
    .with_max_retries(0);
    orch.add_task(task).await.unwrap();

    orch.run_task_now("stuck").await.unwrap();
    sleep(Duration::from_secs(10)).await;

    let outcomes: Vec<OrchestratorEvent> = events(&orch)
        .into_iter()
        .filter(|e| e.is_task_outcome())
        .collect();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        outcomes[0],
        OrchestratorEvent::TaskFailed { timed_out: true, will_retry: false, .. }
    ));
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    let record = orch.get_task("stuck").await.unwrap();
    assert_eq!(record.runtime.status, TaskStatus::Error);
    assert!(record.runtime.last_error.unwrap().contains("timed out after 50ms"));
}

#[tokio::test(start_paused = true)]
async fn false_condition_skips_invocation() {
    let orch = running(SchedulerConfig::default()).await;
    let hits = Arc::new(AtomicUsize::new(0));
    orch.add_conditional("poll-orders", ms(10), |desk: &Desk| desk.open, counting!(hits))
        .await
        .unwrap();

    sleep(ms(105)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(orch.get_task("poll-orders").await.unwrap().runtime.execution_count, 0);
    assert!(events(&orch)
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::TaskSkipped { .. })));

    orch.update_context(|desk| desk.open = true).await.unwrap();
    sleep(ms(30)).await;
    assert!(hits.load(Ordering::SeqCst) >= 2);
}

#[tokio::test(start_paused = true)]
async fn removing_a_task_cancels_its_timer() {
    let orch = running(SchedulerConfig::default()).await;
    let hits = Arc::new(AtomicUsize::new(0));
    orch.add_interval("heartbeat", ms(50), counting!(hits)).await.unwrap();

    sleep(ms(120)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    assert!(orch.remove_task("heartbeat").await.unwrap());
    assert!(!orch.remove_task("heartbeat").await.unwrap());
    sleep(ms(500)).await;

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(orch.get_task("heartbeat").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn one_time_task_removes_itself() {
    let orch = running(SchedulerConfig::default()).await;
    let hits = Arc::new(AtomicUsize::new(0));
    orch.add_one_time("warm-cache", counting!(hits)).await.unwrap();

    sleep(ms(10)).await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(orch.get_task("warm-cache").await.is_none());
    assert!(events(&orch).iter().any(|e| matches!(
        e,
        OrchestratorEvent::TaskCompleted { task_id, .. } if task_id == "warm-cache"
    )));
}

#[tokio::test(start_paused = true)]
async fn failed_one_time_task_stays_registered() {
    let orch = running(SchedulerConfig::default()).await;
    orch.add_task(
        TaskDefinition::manual("seed", |_ctx| async { Err(anyhow::anyhow!("no seed data")) })
            .run_on_start(true)
            .remove_on_success(true)
            .with_max_retries(0),
    )
    .await
    .unwrap();

    sleep(ms(10)).await;
    let record = orch.get_task("seed").await.unwrap();
    assert_eq!(record.runtime.status, TaskStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn pause_and_resume_stop_and_restart_firing() {
    let orch = running(SchedulerConfig::default()).await;
    let hits = Arc::new(AtomicUsize::new(0));
    orch.add_interval("tick", ms(100), counting!(hits)).await.unwrap();

    sleep(ms(250)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    orch.pause().await.unwrap();
    assert_eq!(orch.status().await, OrchestratorStatus::Paused);
    assert_eq!(orch.get_task("tick").await.unwrap().runtime.status, TaskStatus::Paused);
    sleep(ms(500)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    orch.start().await.unwrap();
    sleep(ms(250)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn paused_task_survives_global_resume() {
    let orch = running(SchedulerConfig::default()).await;
    let hits = Arc::new(AtomicUsize::new(0));
    orch.add_interval("digest", ms(100), counting!(hits)).await.unwrap();

    orch.pause_task("digest").await.unwrap();
    orch.pause().await.unwrap();
    orch.start().await.unwrap();
    sleep(ms(350)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(orch.get_state().await.paused_tasks, vec!["digest".to_string()]);

    orch.resume_task("digest").await.unwrap();
    sleep(ms(150)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(orch.pause_task("missing").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn outcomes_are_persisted_by_the_worker() {
    let store = Arc::new(MemoryStateStore::new());
    let orch = desk(store.clone(), SchedulerConfig::default());
    orch.initialize().await.unwrap();
    orch.start().await.unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    orch.add_interval("heartbeat", ms(100), counting!(hits)).await.unwrap();

    sleep(ms(150)).await;

    let saved = store.load_state().await.unwrap().unwrap();
    let record = saved.tasks.iter().find(|t| t.id == "heartbeat").unwrap();
    assert_eq!(record.runtime.execution_count, 1);
    assert_eq!(record.runtime.status, TaskStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn initialize_restores_known_tasks_and_drops_unknown() {
    let store = Arc::new(MemoryStateStore::new());
    let first = desk(store.clone(), SchedulerConfig::default());
    first.initialize().await.unwrap();
    first.start().await.unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    first.add_interval("poll", ms(100), counting!(hits)).await.unwrap();
    first.add_interval("legacy", ms(100), counting!(hits)).await.unwrap();
    first.pause_task("legacy").await.unwrap();
    first
        .set_context(Desk {
            open: true,
            orders: 11,
        })
        .await
        .unwrap();
    sleep(ms(350)).await;
    first.pause().await.unwrap();
    let polled = first.get_task("poll").await.unwrap().runtime.execution_count;
    assert_eq!(polled, 3);
    drop(first);

    let second = desk(store.clone(), SchedulerConfig::default());
    let restarted = Arc::new(AtomicUsize::new(0));
    second.add_interval("poll", ms(100), counting!(restarted)).await.unwrap();
    second.initialize().await.unwrap();

    assert_eq!(second.status().await, OrchestratorStatus::Paused);
    assert_eq!(second.get_context().await, Desk { open: true, orders: 11 });
    let record = second.get_task("poll").await.unwrap();
    assert_eq!(record.runtime.execution_count, polled);
    assert!(second.get_task("legacy").await.is_none());
    assert!(events(&second).contains(&OrchestratorEvent::StateRestored {
        restored: 1,
        dropped: 1,
    }));

    second.start().await.unwrap();
    sleep(ms(150)).await;
    assert_eq!(restarted.load(Ordering::SeqCst), 1);
    assert_eq!(
        second.get_task("poll").await.unwrap().runtime.execution_count,
        polled + 1
    );
}

#[tokio::test]
async fn file_store_snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::for_orchestrator(dir.path(), "desk"));

    let first = desk(Arc::clone(&store), SchedulerConfig::default());
    first.add_task(TaskDefinition::manual("noop", |_ctx| async { Ok(json!(1)) })).await.unwrap();
    first.initialize().await.unwrap();
    first.merge_context(json!({"orders": 4})).await.unwrap();
    first.save().await.unwrap();
    assert!(dir.path().join("desk.state.json").exists());

    let second = desk(Arc::clone(&store), SchedulerConfig::default());
    second.add_task(TaskDefinition::manual("noop", |_ctx| async { Ok(json!(1)) })).await.unwrap();
    second.initialize().await.unwrap();
    assert_eq!(second.get_context().await.orders, 4);
    assert_eq!(second.status().await, OrchestratorStatus::Idle);

    second.stop().await.unwrap();
    assert!(!dir.path().join("desk.state.json").exists());
}

#[tokio::test]
async fn corrupt_snapshot_falls_back_to_fresh_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("desk.state.json");
    std::fs::write(&path, "{not json").unwrap();
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::for_orchestrator(dir.path(), "desk"));

    let orch = desk(Arc::clone(&store), SchedulerConfig::default());
    orch.initialize().await.unwrap();
    assert_eq!(orch.status().await, OrchestratorStatus::Idle);
    assert_eq!(orch.get_context().await, Desk::default());
    assert_eq!(errors(&orch), 1);

    orch.start().await.unwrap();
    assert_eq!(orch.status().await, OrchestratorStatus::Running);
    let saved = store.load_state().await.unwrap().unwrap();
    assert_eq!(saved.name, "desk");
    orch.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unavailable_store_degrades_durability_not_scheduling() {
    let orch = desk(Arc::new(UnavailableStore), SchedulerConfig::default());
    orch.initialize().await.unwrap();
    assert_eq!(errors(&orch), 1);

    orch.start().await.unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    orch.add_interval("heartbeat", ms(100), counting!(hits)).await.unwrap();
    sleep(ms(350)).await;

    assert_eq!(hits.load(Ordering::SeqCst), 3);
    let record = orch.get_task("heartbeat").await.unwrap();
    assert_eq!(record.runtime.status, TaskStatus::Completed);
    assert!(errors(&orch) >= 4);
    assert!(matches!(orch.save().await, Err(TradeflowError::Persistence(_))));

    assert!(orch.stop().await.is_err());
    assert_eq!(orch.status().await, OrchestratorStatus::Stopped);
}

#[tokio::test]
async fn every_second_cron_fires_once_per_second() {
    let orch = running(SchedulerConfig::default()).await;
    let hits = Arc::new(AtomicUsize::new(0));
    orch.add_cron("ticker", "* * * * * *", counting!(hits)).await.unwrap();
    let armed = orch.get_task("ticker").await.unwrap();
    assert!(armed.runtime.next_execution_time.unwrap() > Utc::now() - chrono::Duration::seconds(1));

    sleep(ms(2600)).await;

    let fired = hits.load(Ordering::SeqCst);
    assert!((2..=3).contains(&fired), "fired {fired} times");
    let record = orch.get_task("ticker").await.unwrap();
    assert_eq!(record.runtime.execution_count, fired as u64);
    let last = record.runtime.last_execution_time.unwrap();
    assert!(record.runtime.next_execution_time.unwrap() > last);
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn impossible_cron_never_fires() {
    let orch = running(SchedulerConfig::default()).await;
    let hits = Arc::new(AtomicUsize::new(0));
    orch.add_cron("leap-day-30", "0 0 30 2 *", counting!(hits)).await.unwrap();

    sleep(ms(300)).await;

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    let record = orch.get_task("leap-day-30").await.unwrap();
    assert!(record.runtime.next_execution_time.is_none());
    assert_eq!(record.runtime.execution_count, 0);
    orch.stop().await.unwrap();
}
