use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;

use agentmux_backend_tmux::{TmuxBackendConfig, TmuxSessionBackend};
use agentmux_config::AgentmuxConfig;
use agentmux_protocol::event::{AppEvent, ErrorEvent};
use agentmux_protocol::ids::WorkspaceId;
use agentmux_protocol::session::Workspace;
use agentmux_pump::{MessagePump, PumpConfig};
use agentmux_reconcile::{Reconciler, ReconcilerConfig};
use agentmux_store::SessionStore;
use agentmux_supervisor::{RestartPolicy, WorkerError, WorkerOptions, WorkerSupervisor};

use crate::runtime::AppRuntime;
use crate::watcher::watch_state_dir;

const WATCHER_BACKOFF: Duration = Duration::from_secs(1);
const PUMP_BACKOFF: Duration = Duration::from_millis(200);

pub struct App {
    pub supervisor: Arc<WorkerSupervisor>,
    pub pump: Arc<MessagePump>,
    pub runtime: AppRuntime,
}

/// Wires the core together: store, backend, pump, supervised workers, and
/// the reconciler, then enqueues the first sync tick.
pub fn build(config: &AgentmuxConfig) -> Result<App> {
    let data_dir = config.data_dir();
    let state_dir = data_dir.join("workspaces");
    let store = SessionStore::new(&state_dir);

    let backend = Arc::new(TmuxSessionBackend::new(TmuxBackendConfig {
        binary: PathBuf::from(config.tmux.binary.as_str()),
        call_timeout: config.tmux.call_timeout(),
    }));

    let pump = Arc::new(MessagePump::new(PumpConfig {
        critical_lane_capacity: config.pump.critical_lane_capacity,
        normal_lane_capacity: config.pump.normal_lane_capacity,
    }));
    let (sender, receiver) = mpsc::unbounded_channel();
    pump.set_message_sender(sender)
        .map_err(|error| anyhow::anyhow!("{error}"))?;

    let supervisor = Arc::new(WorkerSupervisor::new());

    // Worker-fatal outcomes become critical error events for the shell.
    {
        let pump = Arc::clone(&pump);
        supervisor.set_error_handler(Arc::new(move |worker, error| {
            pump.enqueue(AppEvent::Error(ErrorEvent {
                source: worker.to_owned(),
                detail: error.to_string(),
            }));
        }));
    }

    {
        let pump = Arc::clone(&pump);
        supervisor.start(
            "message-pump",
            WorkerOptions {
                policy: RestartPolicy::Always,
                backoff: PUMP_BACKOFF,
            },
            move |shutdown| {
                let pump = Arc::clone(&pump);
                async move {
                    pump.run(shutdown)
                        .await
                        .map_err(|error| WorkerError::Failed(error.to_string()))
                }
            },
        );
    }

    {
        let pump = Arc::clone(&pump);
        let watch_root = state_dir.clone();
        supervisor.start(
            "state-watcher",
            WorkerOptions {
                policy: RestartPolicy::Always,
                backoff: WATCHER_BACKOFF,
            },
            move |shutdown| {
                watch_state_dir(watch_root.clone(), Arc::clone(&pump), shutdown)
            },
        );
    }

    let workspaces: Vec<Workspace> = config
        .workspaces
        .iter()
        .map(|workspace| Workspace {
            id: WorkspaceId::new(workspace.id.as_str()),
            name: workspace.name.clone(),
            root: workspace.root.clone(),
        })
        .collect();

    let mut reconciler = Reconciler::new(
        ReconcilerConfig::from(&config.sync),
        backend,
        store,
        Arc::clone(&pump),
        workspaces,
    );
    match reconciler.load_persisted() {
        Ok(loaded) => {
            if loaded > 0 {
                tracing::info!(sessions = loaded, "rehydrated persisted session records");
            }
        }
        Err(error) => {
            tracing::warn!(error = %error, "failed to load persisted session state");
        }
    }

    // Immediate first tick; the handler reschedules every following one.
    pump.enqueue(AppEvent::SyncTick {
        token: reconciler.current_token(),
    });

    let runtime = AppRuntime::new(reconciler, receiver, supervisor.shutdown_token());
    Ok(App {
        supervisor,
        pump,
        runtime,
    })
}
