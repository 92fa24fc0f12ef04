use crate::config::Config;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// The next lifecycle transition a task is queued to undergo.
/// Set by the controller, cleared by the worker once consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum PendingAction {
    #[default]
    None,
    Resize,
    Import,
    Cancel,
    Restart,
    Remove,
}

/// Processing status. Mutated only by the worker, except for the initial
/// value set at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    #[default]
    Queued,
    Running,
    Failed,
    Completed,
    Canceled,
}

/// A task bundles a set of input images destined for the processing
/// pipeline and tracks them through a small lifecycle state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub pending_action: PendingAction,
    #[serde(default)]
    pub status: TaskStatus,
    /// True while the task is still accepting uploads. A partial task is
    /// never handed to the worker.
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub images_count: usize,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub available_assets: BTreeSet<String>,
    #[serde(default)]
    pub options: serde_json::Value,
    #[serde(default)]
    pub resize_to: Option<i32>,
    #[serde(default)]
    pub import_url: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub console: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(project_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            name: None,
            pending_action: PendingAction::None,
            status: TaskStatus::Queued,
            partial: false,
            images_count: 0,
            size_bytes: 0,
            last_error: None,
            available_assets: BTreeSet::new(),
            options: serde_json::Value::Null,
            resize_to: None,
            import_url: None,
            public: false,
            console: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Sets the next pending action. Every transition clears the previous
    /// error; cancel/restart/remove additionally force the task out of the
    /// partial state so the worker will pick it up.
    pub fn set_pending_action(&mut self, action: PendingAction) {
        self.pending_action = action;
        self.last_error = None;
        if matches!(
            action,
            PendingAction::Cancel | PendingAction::Restart | PendingAction::Remove
        ) {
            self.partial = false;
        }
    }

    /// Console output starting at `line`, the way clients poll progress.
    pub fn output(&self, line: usize) -> String {
        if line >= self.console.len() {
            return String::new();
        }
        self.console[line..].join("\n")
    }

    /// An independent copy with a fresh identity. Runtime state that
    /// belongs to the processing pipeline (status, console, errors) is
    /// reset; the copy is a no-op until committed.
    pub fn duplicate_record(&self) -> Task {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4();
        copy.name = self.name.as_ref().map(|n| format!("Copy of {}", n));
        copy.pending_action = PendingAction::None;
        copy.status = TaskStatus::Queued;
        copy.last_error = None;
        copy.console = Vec::new();
        copy.created_at = Utc::now();
        copy
    }
}

/// Recomputed counters for a task's on-disk input set.
pub fn scan_images(cfg: &Config, task_id: &Uuid) -> (usize, u64) {
    let dir = cfg.images_dir(task_id);
    let mut count = 0usize;
    let mut bytes = 0u64;
    if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries.flatten() {
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    count += 1;
                    bytes += meta.len();
                }
            }
        }
    }
    (count, bytes)
}

/// In-memory task registry. Holds the entity and its invariants only; all
/// I/O lives in the ingestor, retriever and worker.
pub struct TaskStore {
    tasks: DashMap<Uuid, Task>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    pub fn from_tasks(tasks: Vec<Task>) -> Self {
        let store = Self::new();
        for t in tasks {
            store.tasks.insert(t.id, t);
        }
        store
    }

    pub fn insert(&self, task: Task) -> Uuid {
        let id = task.id;
        self.tasks.insert(id, task);
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<Task> {
        self.tasks.get(id).map(|t| t.clone())
    }

    /// Looks a task up within its project scope; a task id from another
    /// project behaves exactly like a missing one.
    pub fn get_scoped(&self, project_id: &str, id: &Uuid) -> Option<Task> {
        self.tasks
            .get(id)
            .filter(|t| t.project_id == project_id)
            .map(|t| t.clone())
    }

    pub fn remove(&self, id: &Uuid) -> Option<Task> {
        self.tasks.remove(id).map(|(_, t)| t)
    }

    pub fn list(&self, project_id: &str) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| t.project_id == project_id)
            .map(|t| t.clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn all(&self) -> Vec<Task> {
        self.tasks.iter().map(|t| t.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Applies `f` to the task under the map's shard lock.
    pub fn update<F, R>(&self, id: &Uuid, f: F) -> Option<R>
    where
        F: FnOnce(&mut Task) -> R,
    {
        self.tasks.get_mut(id).map(|mut t| f(&mut t))
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedStore = Arc<TaskStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_action_clears_last_error() {
        let mut t = Task::new("p1");
        t.last_error = Some("boom".into());
        t.set_pending_action(PendingAction::Resize);
        assert_eq!(t.pending_action, PendingAction::Resize);
        assert!(t.last_error.is_none());
    }

    #[test]
    fn cancel_clears_partial() {
        let mut t = Task::new("p1");
        t.partial = true;
        t.set_pending_action(PendingAction::Cancel);
        assert!(!t.partial);
    }

    #[test]
    fn scoped_lookup_hides_foreign_projects() {
        let store = TaskStore::new();
        let id = store.insert(Task::new("p1"));
        assert!(store.get_scoped("p1", &id).is_some());
        assert!(store.get_scoped("p2", &id).is_none());
    }

    #[test]
    fn output_respects_line_offset() {
        let mut t = Task::new("p1");
        t.console = vec!["a".into(), "b".into(), "c".into()];
        assert_eq!(t.output(0), "a\nb\nc");
        assert_eq!(t.output(2), "c");
        assert_eq!(t.output(10), "");
    }

    #[test]
    fn duplicate_resets_runtime_state() {
        let mut t = Task::new("p1");
        t.name = Some("survey".into());
        t.status = TaskStatus::Completed;
        t.console = vec!["done".into()];
        t.available_assets.insert("orthophoto".into());
        let copy = t.duplicate_record();
        assert_ne!(copy.id, t.id);
        assert_eq!(copy.name.as_deref(), Some("Copy of survey"));
        assert_eq!(copy.status, TaskStatus::Queued);
        assert!(copy.console.is_empty());
        assert!(copy.available_assets.contains("orthophoto"));
    }
}
