//! Orchestrator state persistence: snapshot model and pluggable stores.
//!
//! A snapshot carries the context, pause markers, lifecycle timestamps and
//! every task's [`TaskRecord`]. Handlers and conditions are code and are
//! never written; they come back from re-registration on startup.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tradeflow_core::{Result, StateBackend, StateConfig, TradeflowError};

use crate::tasks::TaskRecord;

/// Serializable orchestrator state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorState<C> {
    pub name: String,
    pub context: C,
    pub is_paused: bool,
    #[serde(default)]
    pub paused_tasks: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub pause_time: Option<DateTime<Utc>>,
    pub resume_time: Option<DateTime<Utc>>,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
}

/// Type-erased snapshot as stores see it.
pub type StateSnapshot = OrchestratorState<serde_json::Value>;

impl<C: Serialize> OrchestratorState<C> {
    pub fn erase(&self) -> Result<StateSnapshot> {
        Ok(OrchestratorState {
            name: self.name.clone(),
            context: serde_json::to_value(&self.context)
                .map_err(|e| TradeflowError::Persistence(format!("serialize context: {e}")))?,
            is_paused: self.is_paused,
            paused_tasks: self.paused_tasks.clone(),
            start_time: self.start_time,
            pause_time: self.pause_time,
            resume_time: self.resume_time,
            saved_at: self.saved_at,
            tasks: self.tasks.clone(),
        })
    }
}

impl StateSnapshot {
    /// Recover the typed context.
    pub fn typed<C: serde::de::DeserializeOwned>(self) -> Result<OrchestratorState<C>> {
        let context = serde_json::from_value(self.context)
            .map_err(|e| TradeflowError::Persistence(format!("restore context: {e}")))?;
        Ok(OrchestratorState {
            name: self.name,
            context,
            is_paused: self.is_paused,
            paused_tasks: self.paused_tasks,
            start_time: self.start_time,
            pause_time: self.pause_time,
            resume_time: self.resume_time,
            saved_at: self.saved_at,
            tasks: self.tasks,
        })
    }
}

/// Where snapshots live.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    async fn save_state(&self, state: &StateSnapshot) -> Result<()>;

    /// `None` when nothing has been saved yet.
    async fn load_state(&self) -> Result<Option<StateSnapshot>>;

    /// Delete the snapshot. Missing is fine.
    async fn clear_state(&self) -> Result<()>;
}

fn persistence(what: &str, e: impl std::fmt::Display) -> TradeflowError {
    TradeflowError::Persistence(format!("{what}: {e}"))
}

// ─── File ─────────────────────────────────────────────────

/// JSON file store. Writes go to a temp file first, then rename.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `dir/<name>.state.json`
    pub fn for_orchestrator(dir: impl AsRef<Path>, name: &str) -> Self {
        Self::new(dir.as_ref().join(format!("{name}.state.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn save_state(&self, state: &StateSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| persistence("create state dir", e))?;
        }
        let json = serde_json::to_vec_pretty(state).map_err(|e| persistence("serialize state", e))?;
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| persistence("write state", e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| persistence("replace state", e))?;
        tracing::debug!("💾 State saved: {}", self.path.display());
        Ok(())
    }

    async fn load_state(&self) -> Result<Option<StateSnapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(persistence("read state", e)),
        };
        let state = serde_json::from_slice(&bytes).map_err(|e| persistence("parse state", e))?;
        Ok(Some(state))
    }

    async fn clear_state(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(persistence("delete state", e)),
        }
    }
}

// ─── SQLite ───────────────────────────────────────────────

/// SQLite store: one row per orchestrator name.
pub struct SqliteStateStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
    key: String,
}

impl SqliteStateStore {
    /// Open or create the database at `path` and bind to orchestrator `name`.
    pub fn open(path: &Path, name: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| persistence("create state dir", e))?;
        }
        let conn = rusqlite::Connection::open(path).map_err(|e| persistence("DB open", e))?;
        Self::with_connection(conn, name)
    }

    pub fn in_memory(name: &str) -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(|e| persistence("DB open", e))?;
        Self::with_connection(conn, name)
    }

    fn with_connection(conn: rusqlite::Connection, name: &str) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS orchestrator_state (
                name TEXT PRIMARY KEY,
                snapshot TEXT NOT NULL,     -- JSON StateSnapshot
                saved_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| persistence("Migration", e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            key: name.to_string(),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection, &str) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let key = self.key.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&conn, &key)
        })
        .await
        .map_err(|e| persistence("DB worker", e))?
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn save_state(&self, state: &StateSnapshot) -> Result<()> {
        let json = serde_json::to_string(state).map_err(|e| persistence("serialize state", e))?;
        let saved_at = state.saved_at.to_rfc3339();
        self.with_conn(move |conn, key| {
            conn.execute(
                "INSERT OR REPLACE INTO orchestrator_state (name, snapshot, saved_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![key, json, saved_at],
            )
            .map_err(|e| persistence("save state", e))?;
            Ok(())
        })
        .await
    }

    async fn load_state(&self) -> Result<Option<StateSnapshot>> {
        let json: Option<String> = self
            .with_conn(|conn, key| {
                let mut stmt = conn
                    .prepare("SELECT snapshot FROM orchestrator_state WHERE name = ?1")
                    .map_err(|e| persistence("load state", e))?;
                let mut rows = stmt
                    .query_map(rusqlite::params![key], |row| row.get::<_, String>(0))
                    .map_err(|e| persistence("load state", e))?;
                rows.next()
                    .transpose()
                    .map_err(|e| persistence("load state", e))
            })
            .await?;
        json.map(|s| serde_json::from_str(&s).map_err(|e| persistence("parse state", e)))
            .transpose()
    }

    async fn clear_state(&self) -> Result<()> {
        self.with_conn(|conn, key| {
            conn.execute(
                "DELETE FROM orchestrator_state WHERE name = ?1",
                rusqlite::params![key],
            )
            .map_err(|e| persistence("delete state", e))?;
            Ok(())
        })
        .await
    }
}

// ─── Memory ───────────────────────────────────────────────

/// In-process store; contents die with the process.
#[derive(Default)]
pub struct MemoryStateStore {
    slot: Mutex<Option<StateSnapshot>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn save_state(&self, state: &StateSnapshot) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        Ok(())
    }

    async fn load_state(&self) -> Result<Option<StateSnapshot>> {
        Ok(self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn clear_state(&self) -> Result<()> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }
}

/// Build the configured backend for orchestrator `name`.
pub fn open_store(config: &StateConfig, name: &str) -> Result<Arc<dyn StateStore>> {
    let dir = config.resolved_dir();
    let store: Arc<dyn StateStore> = match config.backend {
        StateBackend::File => Arc::new(FileStateStore::for_orchestrator(&dir, name)),
        StateBackend::Sqlite => Arc::new(SqliteStateStore::open(&dir.join("state.db"), name)?),
        StateBackend::Memory => Arc::new(MemoryStateStore::new()),
    };
    tracing::debug!("💾 State store: {} ({})", store.name(), dir.display());
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{ScheduleSpec, TaskRuntime, TaskStatus};

    fn record(id: &str, status: TaskStatus, count: u64) -> TaskRecord {
        TaskRecord {
            id: id.into(),
            schedule: ScheduleSpec::Interval { every_ms: 100 },
            run_on_start: false,
            priority: 0,
            max_retries: 3,
            retry_delay_ms: 1000,
            timeout_ms: None,
            enabled: true,
            runtime: TaskRuntime {
                status,
                execution_count: count,
                last_execution_time: Some(Utc::now()),
                ..TaskRuntime::default()
            },
        }
    }

    fn snapshot() -> StateSnapshot {
        OrchestratorState {
            name: "desk".into(),
            context: serde_json::json!({"orders": 3, "symbol": "USDT"}),
            is_paused: true,
            paused_tasks: vec!["digest".into()],
            start_time: Some(Utc::now()),
            pause_time: Some(Utc::now()),
            resume_time: None,
            saved_at: Utc::now(),
            tasks: vec![record("poll", TaskStatus::Error, 4), record("digest", TaskStatus::Paused, 0)],
        }
    }

    async fn roundtrip(store: &dyn StateStore) {
        assert!(store.load_state().await.unwrap().is_none());
        let state = snapshot();
        store.save_state(&state).await.unwrap();
        assert_eq!(store.load_state().await.unwrap(), Some(state));

        store.clear_state().await.unwrap();
        assert!(store.load_state().await.unwrap().is_none());
        store.clear_state().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::for_orchestrator(dir.path().join("nested"), "desk");
        assert!(store.path().ends_with("nested/desk.state.json"));
        roundtrip(&store).await;
    }

    #[tokio::test]
    async fn test_file_store_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::for_orchestrator(dir.path(), "desk");
        store.save_state(&snapshot()).await.unwrap();
        assert!(store.path().exists());
        assert!(!store.tmp_path().exists());
    }

    #[tokio::test]
    async fn test_file_store_corrupt_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::for_orchestrator(dir.path(), "desk");
        std::fs::write(store.path(), "{not json").unwrap();
        let err = store.load_state().await.unwrap_err();
        assert!(matches!(err, TradeflowError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_sqlite_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStateStore::open(&dir.path().join("state.db"), "desk").unwrap();
        roundtrip(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_rows_are_keyed_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let a = SqliteStateStore::open(&path, "a").unwrap();
        let b = SqliteStateStore::open(&path, "b").unwrap();
        a.save_state(&snapshot()).await.unwrap();
        assert!(b.load_state().await.unwrap().is_none());
        assert!(a.load_state().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        roundtrip(&MemoryStateStore::new()).await;
    }

    #[test]
    fn test_typed_context_roundtrip() {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct Desk {
            orders: u32,
            symbol: String,
        }
        let typed: OrchestratorState<Desk> = snapshot().typed().unwrap();
        assert_eq!(typed.context, Desk { orders: 3, symbol: "USDT".into() });
        let erased = typed.erase().unwrap();
        assert_eq!(erased.context["orders"], 3);
        assert_eq!(erased.tasks.len(), 2);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let json = serde_json::to_value(snapshot()).unwrap();
        assert_eq!(json["is_paused"], true);
        assert_eq!(json["tasks"][0]["status"], "error");
        assert_eq!(json["tasks"][0]["schedule"]["every_ms"], 100);
        assert!(json["saved_at"].is_string());
    }
}
