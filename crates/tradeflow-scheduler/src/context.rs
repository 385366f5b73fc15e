//! Shared context handed to every task invocation.
//!
//! The value is owned by the orchestrator and lives as long as it does. Every
//! accessor is a scoped lock, so a single read or write is never torn. Tasks
//! that need a multi-step transaction across awaits should hold one
//! `write()` guard for the whole step.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Cloneable handle to the orchestrator's shared context.
pub struct SharedContext<C> {
    inner: Arc<RwLock<C>>,
}

impl<C> Clone for SharedContext<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> SharedContext<C> {
    pub fn new(value: C) -> Self {
        Self {
            inner: Arc::new(RwLock::new(value)),
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, C> {
        self.inner.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, C> {
        self.inner.write().await
    }

    /// Mutate the context under the write lock.
    pub async fn update<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        let mut guard = self.inner.write().await;
        f(&mut guard)
    }

    /// Swap the whole value, returning the previous one.
    pub async fn replace(&self, value: C) -> C {
        let mut guard = self.inner.write().await;
        std::mem::replace(&mut *guard, value)
    }
}

impl<C: Clone> SharedContext<C> {
    pub async fn snapshot(&self) -> C {
        self.inner.read().await.clone()
    }
}

/// What a task body receives on each invocation.
pub struct TaskContext<C> {
    pub context: SharedContext<C>,
    pub task_id: String,
    /// Count including this invocation.
    pub execution_count: u64,
    pub last_execution_time: Option<DateTime<Utc>>,
    pub next_execution_time: Option<DateTime<Utc>>,
}
