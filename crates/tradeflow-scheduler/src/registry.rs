//! Task registry: storage and lookup for definitions and runtime records.
//! No scheduling behavior lives here; the engine owns timers.

use std::collections::HashMap;

use crate::tasks::{TaskDefinition, TaskRecord, TaskRuntime};

/// A registered task: its definition plus its mutable runtime record.
pub struct TaskEntry<C> {
    pub definition: TaskDefinition<C>,
    pub runtime: TaskRuntime,
}

impl<C> TaskEntry<C> {
    pub fn record(&self) -> TaskRecord {
        self.definition.record(&self.runtime)
    }
}

pub struct TaskRegistry<C> {
    tasks: HashMap<String, TaskEntry<C>>,
}

impl<C> TaskRegistry<C> {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Register a task. An existing id is overwritten and its runtime record
    /// reset to idle; the previous record is returned.
    pub fn add(&mut self, definition: TaskDefinition<C>) -> Option<TaskRuntime> {
        let id = definition.id().to_string();
        let entry = TaskEntry {
            definition,
            runtime: TaskRuntime::default(),
        };
        self.tasks.insert(id, entry).map(|old| old.runtime)
    }

    pub fn remove(&mut self, id: &str) -> Option<TaskEntry<C>> {
        self.tasks.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&TaskEntry<C>> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TaskEntry<C>> {
        self.tasks.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    /// All tasks as records, sorted by id.
    pub fn list(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self.tasks.values().map(TaskEntry::record).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut TaskEntry<C>> {
        self.tasks.values_mut()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl<C> Default for TaskRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
