use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{TabId, WorkspaceId};

/// A git working-tree checkout paired with its agent/session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    pub root: PathBuf,
}

impl Workspace {
    /// Backend sessions belonging to this workspace are named
    /// `<workspace-id>-<tab-name>`; the prefix is the workspace namespace.
    pub fn session_namespace(&self) -> String {
        format!("{}-", self.id.as_str())
    }

    pub fn session_name(&self, tab_name: &str) -> String {
        format!("{}-{}", self.id.as_str(), tab_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabStatus {
    Running,
    Detached,
    Stopped,
}

impl TabStatus {
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

/// One attachable terminal session bound to a workspace.
///
/// `status` is `Running` only while the last status-sync confirmed the
/// underlying backend session alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTab {
    pub id: TabId,
    pub display_name: String,
    pub workspace_id: WorkspaceId,
    pub backend_session: String,
    pub status: TabStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl SessionTab {
    /// A record adopted from a backend session discovered out of band.
    pub fn adopted(
        workspace_id: WorkspaceId,
        backend_session: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let backend_session = backend_session.into();
        let display_name = backend_session
            .strip_prefix(&format!("{}-", workspace_id.as_str()))
            .unwrap_or(backend_session.as_str())
            .to_owned();
        Self {
            id: TabId::new(backend_session.clone()),
            display_name,
            workspace_id,
            backend_session,
            status: TabStatus::Running,
            started_at: now,
            stopped_at: None,
            exit_code: None,
        }
    }
}
