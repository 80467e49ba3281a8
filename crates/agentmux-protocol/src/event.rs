use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::backend::SessionProbe;
use crate::ids::{TabId, WorkspaceId};

/// Delivery lane for an [`AppEvent`], decided at enqueue time from the
/// event's kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePriority {
    Critical,
    Normal,
}

/// A background fault surfaced to the UI shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    /// Originating worker or command label.
    pub source: String,
    pub detail: String,
}

/// A tracked session observed dead by a status-sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStoppedEvent {
    pub workspace_id: WorkspaceId,
    pub backend_session: String,
    pub exit_code: Option<i32>,
}

/// An explicit user action against a tab, delivered through the pump so the
/// single consumer applies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabAction {
    Launch {
        workspace_id: WorkspaceId,
        tab_name: String,
        command: Option<String>,
    },
    Close {
        workspace_id: WorkspaceId,
        tab_id: TabId,
    },
    Detach {
        workspace_id: WorkspaceId,
        tab_id: TabId,
    },
    Reattach {
        workspace_id: WorkspaceId,
        tab_id: TabId,
    },
}

/// A backend session adopted during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredSession {
    pub workspace_id: WorkspaceId,
    pub backend_session: String,
}

/// Liveness observed for one known session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbedSession {
    pub backend_session: String,
    pub probe: SessionProbe,
}

/// A per-workspace failure recorded without aborting the rest of the pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSyncError {
    pub workspace_id: WorkspaceId,
    pub detail: String,
}

/// Outcome of the external half of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionSyncReport {
    pub token: u64,
    /// The availability probe failed; nothing else in the report is set.
    pub backend_unavailable: bool,
    pub discovered: Vec<DiscoveredSession>,
    pub probed: Vec<ProbedSession>,
    pub orphans_killed: Vec<String>,
    pub stale_killed: Vec<String>,
    pub workspace_errors: Vec<WorkspaceSyncError>,
    pub stale_sweep_ran: bool,
}

/// Every message that crosses the pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// Background fault, always critical.
    Error(ErrorEvent),
    /// Session observed stopped, always critical.
    SessionStopped(SessionStoppedEvent),
    /// Raw terminal output from a live session reader.
    SessionOutput {
        backend_session: String,
        bytes: Vec<u8>,
    },
    /// A scheduled reconciliation tick carrying the token active when it was
    /// issued.
    SyncTick { token: u64 },
    /// Result of a completed sync pass.
    SyncReport(SessionSyncReport),
    /// The persistence debounce window elapsed.
    FlushDirty,
    /// Filesystem watcher notification.
    PathChanged { path: PathBuf },
    /// User-triggered tab mutation.
    Action(TabAction),
}

impl AppEvent {
    /// Errors and session-stopped notifications must never be starved by a
    /// flood of terminal output.
    pub fn priority(&self) -> MessagePriority {
        match self {
            Self::Error(_) | Self::SessionStopped(_) => MessagePriority::Critical,
            _ => MessagePriority::Normal,
        }
    }
}
