use serde::{Deserialize, Serialize};

/// Position in an ordered byte or event stream. `0` means "before the first entry".
pub type Cursor = u64;

pub type AttachmentId = u64;

pub type SubscriptionId = String;

/// Who is subscribing and to which logical stream.
///
/// Without a `conversation_id` the scope names the workspace's observed-event
/// stream; with one it names a single session's output bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamScope {
    pub tenant_id: String,
    pub user_id: String,
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl StreamScope {
    pub fn workspace(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        workspace_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            workspace_id: workspace_id.into(),
            conversation_id: None,
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Observed events are shared by every user of a workspace, so the user id
    /// is not part of the stream key.
    pub fn workspace_key(&self) -> WorkspaceKey {
        WorkspaceKey {
            tenant_id: self.tenant_id.clone(),
            workspace_id: self.workspace_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkspaceKey {
    pub tenant_id: String,
    pub workspace_id: String,
}

/// How a backing process ended. `code` follows shell conventions, so a
/// signal-terminated child reports `128 + signo` when no signal name is known.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionExit {
    pub code: Option<i32>,
    pub signal: Option<String>,
}
