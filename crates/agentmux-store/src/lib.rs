//! Local-file persistence for per-workspace session state.
//!
//! One JSON document per workspace, written atomically (temp file + rename)
//! so a crash mid-write never corrupts the previous snapshot. Only field
//! semantics are contractual; the byte layout is not.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use agentmux_protocol::ids::WorkspaceId;
use agentmux_protocol::session::{SessionTab, Workspace};

const WORKSPACE_FILE_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session store io error: {0}")]
    Io(String),
    #[error("session store codec error: {0}")]
    Codec(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The persisted document for one workspace. The Local-Save Marker is
/// deliberately not part of it; markers are in-memory state of the writing
/// instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    pub workspace: Workspace,
    pub sessions: Vec<SessionTab>,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn workspace_path(&self, workspace_id: &WorkspaceId) -> PathBuf {
        self.root
            .join(format!("{}.{WORKSPACE_FILE_EXTENSION}", workspace_id.as_str()))
    }

    pub fn save(&self, snapshot: &WorkspaceSnapshot) -> StoreResult<()> {
        std::fs::create_dir_all(&self.root)
            .map_err(|error| StoreError::Io(format!("create {}: {error}", self.root.display())))?;

        let path = self.workspace_path(&snapshot.workspace.id);
        let body = serde_json::to_vec_pretty(snapshot).map_err(|error| {
            StoreError::Codec(format!(
                "encode workspace {}: {error}",
                snapshot.workspace.id.as_str()
            ))
        })?;

        let tmp_path = path.with_extension("json.tmp");
        {
            let mut tmp = std::fs::File::create(&tmp_path).map_err(|error| {
                StoreError::Io(format!("create {}: {error}", tmp_path.display()))
            })?;
            tmp.write_all(&body).map_err(|error| {
                StoreError::Io(format!("write {}: {error}", tmp_path.display()))
            })?;
        }
        std::fs::rename(&tmp_path, &path).map_err(|error| {
            StoreError::Io(format!("rename into {}: {error}", path.display()))
        })?;

        tracing::debug!(
            workspace = snapshot.workspace.id.as_str(),
            sessions = snapshot.sessions.len(),
            "persisted workspace session state"
        );
        Ok(())
    }

    pub fn load(&self, workspace_id: &WorkspaceId) -> StoreResult<Option<WorkspaceSnapshot>> {
        let path = self.workspace_path(workspace_id);
        let body = match std::fs::read(&path) {
            Ok(body) => body,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(StoreError::Io(format!("read {}: {error}", path.display())))
            }
        };
        let snapshot = serde_json::from_slice(&body).map_err(|error| {
            StoreError::Codec(format!("decode {}: {error}", path.display()))
        })?;
        Ok(Some(snapshot))
    }

    /// Every workspace id with a persisted document, including workspaces no
    /// longer open; orphan GC relies on this to recognize namespaces that
    /// belonged to this application.
    pub fn list_workspace_ids(&self) -> StoreResult<Vec<WorkspaceId>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(StoreError::Io(format!(
                    "read dir {}: {error}",
                    self.root.display()
                )))
            }
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|error| StoreError::Io(format!("read dir entry: {error}")))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(WORKSPACE_FILE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(WorkspaceId::new(stem));
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn remove(&self, workspace_id: &WorkspaceId) -> StoreResult<()> {
        let path = self.workspace_path(workspace_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(StoreError::Io(format!(
                "remove {}: {error}",
                path.display()
            ))),
        }
    }
}
