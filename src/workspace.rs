//! Server-side source of truth for repositories and tasks.
//!
//! Every accepted mutation publishes the matching observed event while the
//! store lock is held, so a snapshot's cursor always corresponds exactly to
//! the state it carries.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error::WorkspaceError,
    limiter::{run_bounded, BatchReport},
    projector::WorkspaceSnapshot,
    protocol::ObservedEvent,
    records::{RepositoryRecord, TaskRecord},
    subscriptions::SubscriptionManager,
    types::{Cursor, WorkspaceKey},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum WorkspaceMutation {
    UpsertRepository {
        repository: RepositoryRecord,
    },
    #[serde(rename_all = "camelCase")]
    ArchiveRepository {
        repository_id: String,
        #[serde(default)]
        ts: Option<String>,
    },
    CreateTask {
        task: TaskRecord,
    },
    UpdateTask {
        task: TaskRecord,
    },
    #[serde(rename_all = "camelCase")]
    DeleteTask {
        task_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ReorderTasks {
        task_ids: Vec<String>,
    },
}

/// Snapshot as sent over the wire, tagged with the log cursor it reflects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    pub cursor: Cursor,
    pub repositories: Vec<RepositoryRecord>,
    pub tasks: Vec<TaskRecord>,
}

impl SnapshotPayload {
    pub fn into_snapshot(self) -> (Cursor, WorkspaceSnapshot) {
        (
            self.cursor,
            WorkspaceSnapshot::from_records(self.repositories, self.tasks),
        )
    }
}

#[derive(Default)]
struct StoreState {
    repositories: BTreeMap<String, RepositoryRecord>,
    tasks: BTreeMap<String, TaskRecord>,
}

pub struct WorkspaceStore {
    key: WorkspaceKey,
    events: Arc<SubscriptionManager>,
    state: Mutex<StoreState>,
}

fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl WorkspaceStore {
    pub fn new(key: WorkspaceKey, events: Arc<SubscriptionManager>) -> Self {
        Self {
            key,
            events,
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn key(&self) -> &WorkspaceKey {
        &self.key
    }

    pub fn snapshot(&self) -> SnapshotPayload {
        let state = self.state.lock();
        SnapshotPayload {
            cursor: self.events.current_cursor(&self.key),
            repositories: state.repositories.values().cloned().collect(),
            tasks: state.tasks.values().cloned().collect(),
        }
    }

    pub fn repositories(&self) -> Vec<RepositoryRecord> {
        self.state.lock().repositories.values().cloned().collect()
    }

    /// Validate and apply one mutation, publishing its observed event. Returns
    /// the event's cursor.
    pub fn apply(&self, mutation: WorkspaceMutation) -> Result<Cursor, WorkspaceError> {
        let mut state = self.state.lock();
        let event = match mutation {
            WorkspaceMutation::UpsertRepository { mut repository } => {
                if repository.repository_id.is_empty() {
                    return Err(WorkspaceError::InvalidRecord("repositoryId is empty".into()));
                }
                let existing = state.repositories.get(&repository.repository_id);
                if repository.created_at.is_none() {
                    repository.created_at = existing
                        .and_then(|repo| repo.created_at.clone())
                        .or_else(|| Some(now_ts()));
                }
                let event = if existing.is_some() {
                    ObservedEvent::RepositoryUpdated {
                        repository: to_json(&repository),
                    }
                } else {
                    ObservedEvent::RepositoryUpserted {
                        repository: to_json(&repository),
                    }
                };
                state
                    .repositories
                    .insert(repository.repository_id.clone(), repository);
                event
            }
            WorkspaceMutation::ArchiveRepository { repository_id, ts } => {
                let repo = state
                    .repositories
                    .get_mut(&repository_id)
                    .ok_or_else(|| WorkspaceError::UnknownRepository(repository_id.clone()))?;
                let ts = ts.unwrap_or_else(now_ts);
                repo.archived_at = Some(ts.clone());
                ObservedEvent::RepositoryArchived { repository_id, ts }
            }
            WorkspaceMutation::CreateTask { task } => {
                let task = validate_task(&state, task)?;
                state.tasks.insert(task.task_id.clone(), task.clone());
                ObservedEvent::TaskCreated { task: to_json(&task) }
            }
            WorkspaceMutation::UpdateTask { task } => {
                if !state.tasks.contains_key(&task.task_id) {
                    return Err(WorkspaceError::UnknownTask(task.task_id));
                }
                let task = validate_task(&state, task)?;
                state.tasks.insert(task.task_id.clone(), task.clone());
                ObservedEvent::TaskUpdated { task: to_json(&task) }
            }
            WorkspaceMutation::DeleteTask { task_id } => {
                if state.tasks.remove(&task_id).is_none() {
                    return Err(WorkspaceError::UnknownTask(task_id));
                }
                ObservedEvent::TaskDeleted { task_id }
            }
            WorkspaceMutation::ReorderTasks { task_ids } => {
                if let Some(missing) = task_ids.iter().find(|id| !state.tasks.contains_key(*id)) {
                    return Err(WorkspaceError::UnknownTask(missing.clone()));
                }
                let ts = now_ts();
                let mut reordered = Vec::with_capacity(task_ids.len());
                for (index, task_id) in task_ids.iter().enumerate() {
                    if let Some(task) = state.tasks.get_mut(task_id) {
                        task.order_index = index as i64;
                        task.updated_at = Some(ts.clone());
                        reordered.push(to_json(&*task));
                    }
                }
                ObservedEvent::TaskReordered { tasks: reordered }
            }
        };

        let cursor = self.events.publish(&self.key, event.to_value());
        drop(state);
        Ok(cursor)
    }

    /// Apply a batch with at most `limit` mutations in flight. Sparse entries
    /// are skipped and a rejected mutation does not stop the rest.
    pub async fn apply_mutations(
        self: &Arc<Self>,
        batch: Vec<Option<WorkspaceMutation>>,
        limit: usize,
    ) -> BatchReport {
        let store = self.clone();
        let report = run_bounded(batch, limit, move |mutation| {
            let store = store.clone();
            async move { store.apply(mutation).map(|_| ()) }
        })
        .await;
        tracing::debug!(
            target = "agent_mux::workspace",
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            "mutation batch applied"
        );
        report
    }
}

fn validate_task(state: &StoreState, mut task: TaskRecord) -> Result<TaskRecord, WorkspaceError> {
    if task.task_id.is_empty() {
        return Err(WorkspaceError::InvalidRecord("taskId is empty".into()));
    }
    if let Some(repository_id) = &task.repository_id {
        if !state.repositories.contains_key(repository_id) {
            return Err(WorkspaceError::UnknownRepository(repository_id.clone()));
        }
    }
    task.updated_at = Some(now_ts());
    Ok(task)
}

fn to_json<T: Serialize>(record: &T) -> serde_json::Value {
    serde_json::to_value(record).unwrap_or(serde_json::Value::Null)
}
