//! Folds observed workspace events into local repository and task maps.
//!
//! Application is idempotent and tolerant of duplicates: every event replaces
//! whole records by id, so replaying a window after reconnect converges on the
//! same state. The projector trusts the stream's cursor order and does not
//! re-check it. Each effective call fires the dirty hook exactly once.
//!
//! The snapshot-diff path ([`ObservedEventProjector::apply_snapshot_diff`]) is
//! built on the same upsert/delete primitives as the event path.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{
    protocol::ObservedEvent,
    records::{RepositoryRecord, TaskRecord},
};

pub type DirtyHook = Box<dyn FnMut() + Send>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceSnapshot {
    pub repositories: BTreeMap<String, RepositoryRecord>,
    pub tasks: BTreeMap<String, TaskRecord>,
}

impl WorkspaceSnapshot {
    pub fn from_records(
        repositories: impl IntoIterator<Item = RepositoryRecord>,
        tasks: impl IntoIterator<Item = TaskRecord>,
    ) -> Self {
        Self {
            repositories: repositories
                .into_iter()
                .map(|repo| (repo.repository_id.clone(), repo))
                .collect(),
            tasks: tasks
                .into_iter()
                .map(|task| (task.task_id.clone(), task))
                .collect(),
        }
    }
}

/// Index lists describing how to move from one snapshot to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub changed: bool,
    pub removed_task_ids: Vec<String>,
    pub upserted_repository_ids: Vec<String>,
    pub upserted_task_ids: Vec<String>,
}

/// Compute the diff that turns `before` into `after`. Repositories are never
/// removed, only archived.
pub fn diff_snapshots(before: &WorkspaceSnapshot, after: &WorkspaceSnapshot) -> SnapshotDiff {
    let removed_task_ids: Vec<String> = before
        .tasks
        .keys()
        .filter(|id| !after.tasks.contains_key(*id))
        .cloned()
        .collect();
    let upserted_repository_ids: Vec<String> = after
        .repositories
        .iter()
        .filter(|(id, repo)| before.repositories.get(*id) != Some(*repo))
        .map(|(id, _)| id.clone())
        .collect();
    let upserted_task_ids: Vec<String> = after
        .tasks
        .iter()
        .filter(|(id, task)| before.tasks.get(*id) != Some(*task))
        .map(|(id, _)| id.clone())
        .collect();

    SnapshotDiff {
        changed: !removed_task_ids.is_empty()
            || !upserted_repository_ids.is_empty()
            || !upserted_task_ids.is_empty(),
        removed_task_ids,
        upserted_repository_ids,
        upserted_task_ids,
    }
}

pub struct ObservedEventProjector {
    repositories: BTreeMap<String, RepositoryRecord>,
    tasks: BTreeMap<String, TaskRecord>,
    selected_repository_id: Option<String>,
    selected_task_id: Option<String>,
    on_dirty: DirtyHook,
}

impl std::fmt::Debug for ObservedEventProjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservedEventProjector")
            .field("repositories", &self.repositories.len())
            .field("tasks", &self.tasks.len())
            .field("selected_repository_id", &self.selected_repository_id)
            .field("selected_task_id", &self.selected_task_id)
            .finish()
    }
}

impl Default for ObservedEventProjector {
    fn default() -> Self {
        Self::new(Box::new(|| {}))
    }
}

impl ObservedEventProjector {
    pub fn new(on_dirty: DirtyHook) -> Self {
        Self {
            repositories: BTreeMap::new(),
            tasks: BTreeMap::new(),
            selected_repository_id: None,
            selected_task_id: None,
            on_dirty,
        }
    }

    pub fn repositories(&self) -> &BTreeMap<String, RepositoryRecord> {
        &self.repositories
    }

    pub fn tasks(&self) -> &BTreeMap<String, TaskRecord> {
        &self.tasks
    }

    pub fn repository(&self, repository_id: &str) -> Option<&RepositoryRecord> {
        self.repositories.get(repository_id)
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskRecord> {
        self.tasks.get(task_id)
    }

    pub fn selected_repository_id(&self) -> Option<&str> {
        self.selected_repository_id.as_deref()
    }

    pub fn selected_task_id(&self) -> Option<&str> {
        self.selected_task_id.as_deref()
    }

    pub fn snapshot(&self) -> WorkspaceSnapshot {
        WorkspaceSnapshot {
            repositories: self.repositories.clone(),
            tasks: self.tasks.clone(),
        }
    }

    /// Tasks of the selected repository in display order.
    pub fn visible_tasks(&self) -> Vec<&TaskRecord> {
        let mut tasks: Vec<&TaskRecord> = self
            .tasks
            .values()
            .filter(|task| task.repository_id == self.selected_repository_id)
            .collect();
        tasks.sort_by(|a, b| {
            a.order_index
                .cmp(&b.order_index)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        tasks
    }

    pub fn select_repository(&mut self, repository_id: &str) -> bool {
        match self.repositories.get(repository_id) {
            Some(repo) if !repo.is_archived() => {
                self.selected_repository_id = Some(repository_id.to_string());
                self.selected_task_id = None;
                self.resync_task_selection();
                (self.on_dirty)();
                true
            }
            _ => false,
        }
    }

    pub fn select_task(&mut self, task_id: &str) -> bool {
        if !self.visible_tasks().iter().any(|task| task.task_id == task_id) {
            return false;
        }
        self.selected_task_id = Some(task_id.to_string());
        (self.on_dirty)();
        true
    }

    /// Apply one wire event. Returns whether local state changed.
    pub fn apply_event(&mut self, event: &Value) -> bool {
        let changed = self.apply_quiet(event);
        if changed {
            (self.on_dirty)();
        }
        changed
    }

    /// Apply several events, firing the dirty hook at most once. Returns how
    /// many events had an effect.
    pub fn apply_batch<'a>(&mut self, events: impl IntoIterator<Item = &'a Value>) -> usize {
        let applied = events
            .into_iter()
            .filter(|event| self.apply_quiet(event))
            .count();
        if applied > 0 {
            (self.on_dirty)();
        }
        applied
    }

    /// Replace all local state with `snapshot`.
    pub fn load_snapshot(&mut self, snapshot: WorkspaceSnapshot) {
        self.repositories = snapshot.repositories;
        self.tasks = snapshot.tasks;
        self.resync_repository_selection();
        (self.on_dirty)();
    }

    /// Apply a precomputed diff against `snapshot`. Ids listed in the diff but
    /// missing from the snapshot are skipped.
    pub fn apply_snapshot_diff(&mut self, snapshot: &WorkspaceSnapshot, diff: &SnapshotDiff) {
        if !diff.changed {
            return;
        }
        for task_id in &diff.removed_task_ids {
            self.tasks.remove(task_id);
        }
        for repository_id in &diff.upserted_repository_ids {
            if let Some(repo) = snapshot.repositories.get(repository_id) {
                self.upsert_repository(repo.clone());
            }
        }
        for task_id in &diff.upserted_task_ids {
            if let Some(task) = snapshot.tasks.get(task_id) {
                self.upsert_task(task.clone());
            }
        }
        self.resync_repository_selection();
        (self.on_dirty)();
    }

    fn apply_quiet(&mut self, event: &Value) -> bool {
        let Some(event) = ObservedEvent::from_value(event) else {
            tracing::trace!(target = "agent_mux::projector", "skipping malformed observed event");
            return false;
        };

        match event {
            ObservedEvent::RepositoryUpserted { repository }
            | ObservedEvent::RepositoryUpdated { repository } => {
                let Some(repo) = RepositoryRecord::parse(&repository) else {
                    return false;
                };
                self.upsert_repository(repo);
                self.resync_repository_selection();
                true
            }
            ObservedEvent::RepositoryArchived { repository_id, ts } => {
                let Some(repo) = self.repositories.get_mut(&repository_id) else {
                    return false;
                };
                repo.archived_at = Some(ts);
                self.resync_repository_selection();
                true
            }
            ObservedEvent::TaskCreated { task } | ObservedEvent::TaskUpdated { task } => {
                let Some(task) = TaskRecord::parse(&task) else {
                    return false;
                };
                self.upsert_task(task);
                self.resync_task_selection();
                true
            }
            ObservedEvent::TaskDeleted { task_id } => {
                if self.tasks.remove(&task_id).is_none() {
                    return false;
                }
                self.resync_task_selection();
                true
            }
            ObservedEvent::TaskReordered { tasks } => {
                let parsed: Vec<TaskRecord> = tasks.iter().filter_map(TaskRecord::parse).collect();
                if parsed.is_empty() {
                    return false;
                }
                for task in parsed {
                    self.upsert_task(task);
                }
                self.resync_task_selection();
                true
            }
            ObservedEvent::Unknown => false,
        }
    }

    fn upsert_repository(&mut self, repo: RepositoryRecord) {
        self.repositories.insert(repo.repository_id.clone(), repo);
    }

    fn upsert_task(&mut self, task: TaskRecord) {
        self.tasks.insert(task.task_id.clone(), task);
    }

    /// Keep the repository selection on a live, non-archived repository.
    fn resync_repository_selection(&mut self) {
        let still_valid = self
            .selected_repository_id
            .as_ref()
            .and_then(|id| self.repositories.get(id))
            .is_some_and(|repo| !repo.is_archived());
        if !still_valid {
            self.selected_repository_id = self
                .repositories
                .values()
                .find(|repo| !repo.is_archived())
                .map(|repo| repo.repository_id.clone());
            self.selected_task_id = None;
        }
        self.resync_task_selection();
    }

    fn resync_task_selection(&mut self) {
        let visible = self.visible_tasks();
        let still_valid = self
            .selected_task_id
            .as_ref()
            .is_some_and(|id| visible.iter().any(|task| &task.task_id == id));
        if still_valid {
            return;
        }
        let first = visible.first().map(|task| task.task_id.clone());
        self.selected_task_id = first;
    }
}
