use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BackendResult;

/// One attachable session as reported by the backend's listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSession {
    pub name: String,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Liveness observed for a single session.
///
/// `exit_code` is populated only when the backend can report a dead pane's
/// exit status; absence does not imply a clean exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProbe {
    pub alive: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// The terminal-session backend consumed by the reconciliation core.
///
/// Every operation is an external-process invocation subject to a bounded
/// timeout; implementations fail with binary-not-found, session-not-found,
/// or timeout rather than hanging.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn spawn_session(
        &self,
        name: &str,
        workdir: &Path,
        command: Option<&str>,
    ) -> BackendResult<()>;

    async fn kill_session(&self, name: &str) -> BackendResult<()>;

    /// Detach every client currently attached to `name`.
    async fn detach_session(&self, name: &str) -> BackendResult<()>;

    /// The argv an interactive shell should exec to attach; attaching itself
    /// is the UI shell's concern.
    fn attach_command(&self, name: &str) -> Vec<String>;

    /// Sessions whose name starts with `prefix`, with last-activity
    /// timestamps when the backend reports them.
    async fn list_sessions(&self, prefix: &str) -> BackendResult<Vec<BackendSession>>;

    async fn probe_session(&self, name: &str) -> BackendResult<SessionProbe>;

    async fn health_check(&self) -> BackendResult<()>;
}
