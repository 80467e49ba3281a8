use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use agentmux_protocol::backend::{BackendSession, SessionBackend};
use agentmux_protocol::event::{
    DiscoveredSession, ProbedSession, SessionSyncReport, WorkspaceSyncError,
};
use agentmux_protocol::ids::WorkspaceId;
use agentmux_protocol::session::Workspace;

/// One session the model already tracks, as captured when the pass was
/// scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownSession {
    pub workspace_id: WorkspaceId,
    pub backend_session: String,
}

/// Immutable input to one sync pass: the consumer snapshots its state so the
/// pass can run in the background without touching shared data.
#[derive(Debug, Clone)]
pub struct SyncSnapshot {
    pub token: u64,
    pub probe_availability: bool,
    pub workspaces: Vec<Workspace>,
    pub known_sessions: Vec<KnownSession>,
    pub persisted_workspace_ids: Vec<WorkspaceId>,
    pub run_stale_sweep: bool,
    pub session_retention: Duration,
    pub now: DateTime<Utc>,
}

/// The external half of a reconciliation tick: discovery, status probes,
/// orphan GC and the optional stale sweep.
///
/// Each backend call is individually time-bounded by the backend
/// implementation; a failure on one workspace is recorded in the report and
/// never aborts the pass for the others.
pub async fn run_sync_pass(
    backend: Arc<dyn SessionBackend>,
    snapshot: SyncSnapshot,
) -> SessionSyncReport {
    let mut report = SessionSyncReport {
        token: snapshot.token,
        ..SessionSyncReport::default()
    };

    if snapshot.probe_availability {
        if let Err(error) = backend.health_check().await {
            tracing::warn!(error = %error, "session backend unavailable");
            report.backend_unavailable = true;
            return report;
        }
    }

    let known_names: BTreeSet<&str> = snapshot
        .known_sessions
        .iter()
        .map(|known| known.backend_session.as_str())
        .collect();

    // Discovery, one workspace at a time; listings are kept for the stale
    // sweep so it reuses the same ground truth.
    let mut listings: BTreeMap<WorkspaceId, Vec<BackendSession>> = BTreeMap::new();
    for workspace in &snapshot.workspaces {
        match backend.list_sessions(&workspace.session_namespace()).await {
            Ok(sessions) => {
                for session in &sessions {
                    if !known_names.contains(session.name.as_str()) {
                        report.discovered.push(DiscoveredSession {
                            workspace_id: workspace.id.clone(),
                            backend_session: session.name.clone(),
                        });
                    }
                }
                listings.insert(workspace.id.clone(), sessions);
            }
            Err(error) => {
                tracing::warn!(
                    workspace = workspace.id.as_str(),
                    error = %error,
                    "session discovery failed"
                );
                report.workspace_errors.push(WorkspaceSyncError {
                    workspace_id: workspace.id.clone(),
                    detail: error.to_string(),
                });
            }
        }
    }

    // Status sync for every known session.
    for known in &snapshot.known_sessions {
        match backend.probe_session(&known.backend_session).await {
            Ok(probe) => report.probed.push(ProbedSession {
                backend_session: known.backend_session.clone(),
                probe,
            }),
            Err(error) => {
                tracing::warn!(
                    session = known.backend_session.as_str(),
                    error = %error,
                    "session status probe failed"
                );
                report.workspace_errors.push(WorkspaceSyncError {
                    workspace_id: known.workspace_id.clone(),
                    detail: error.to_string(),
                });
            }
        }
    }

    // Orphan GC: namespaces persisted by this application but no longer
    // backed by an active workspace.
    let active: BTreeSet<&WorkspaceId> = snapshot.workspaces.iter().map(|ws| &ws.id).collect();
    for persisted_id in &snapshot.persisted_workspace_ids {
        if active.contains(persisted_id) {
            continue;
        }
        let namespace = format!("{}-", persisted_id.as_str());
        match backend.list_sessions(&namespace).await {
            Ok(sessions) => {
                for session in sessions {
                    match backend.kill_session(&session.name).await {
                        Ok(()) => {
                            tracing::info!(
                                session = session.name.as_str(),
                                workspace = persisted_id.as_str(),
                                "terminated orphaned session"
                            );
                            report.orphans_killed.push(session.name);
                        }
                        Err(error) => report.workspace_errors.push(WorkspaceSyncError {
                            workspace_id: persisted_id.clone(),
                            detail: error.to_string(),
                        }),
                    }
                }
            }
            Err(error) => report.workspace_errors.push(WorkspaceSyncError {
                workspace_id: persisted_id.clone(),
                detail: error.to_string(),
            }),
        }
    }

    // Stale sweep: lower-frequency removal of sessions idle past retention.
    if snapshot.run_stale_sweep {
        report.stale_sweep_ran = true;
        let cutoff = snapshot.now
            - chrono::Duration::from_std(snapshot.session_retention)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
        for (workspace_id, sessions) in &listings {
            for session in sessions {
                let Some(activity) = session.last_activity else {
                    continue;
                };
                if activity >= cutoff {
                    continue;
                }
                match backend.kill_session(&session.name).await {
                    Ok(()) => {
                        tracing::info!(
                            session = session.name.as_str(),
                            workspace = workspace_id.as_str(),
                            "terminated idle session past retention"
                        );
                        report.stale_killed.push(session.name.clone());
                    }
                    Err(error) => report.workspace_errors.push(WorkspaceSyncError {
                        workspace_id: workspace_id.clone(),
                        detail: error.to_string(),
                    }),
                }
            }
        }
    }

    report
}
