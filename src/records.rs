//! Repository and task records shared by the workspace store and projector.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryRecord {
    pub repository_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(default)]
    pub archived_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl RepositoryRecord {
    pub fn new(repository_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            repository_id: repository_id.into(),
            name: name.into(),
            remote_url: None,
            default_branch: None,
            local_path: None,
            archived_at: None,
            created_at: None,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// Parse a wire payload. Returns `None` for anything that is not a
    /// well-formed record with a non-empty id.
    pub fn parse(value: &Value) -> Option<Self> {
        let record = Self::deserialize(value).ok()?;
        (!record.repository_id.is_empty()).then_some(record)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    #[default]
    Draft,
    Ready,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub order_index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl TaskRecord {
    pub fn new(task_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            repository_id: None,
            title: title.into(),
            body: String::new(),
            status: TaskStatus::Draft,
            order_index: 0,
            updated_at: None,
        }
    }

    pub fn in_repository(mut self, repository_id: impl Into<String>) -> Self {
        self.repository_id = Some(repository_id.into());
        self
    }

    pub fn parse(value: &Value) -> Option<Self> {
        let record = Self::deserialize(value).ok()?;
        (!record.task_id.is_empty()).then_some(record)
    }
}
