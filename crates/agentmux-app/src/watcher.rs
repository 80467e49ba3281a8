use std::path::PathBuf;
use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio_util::sync::CancellationToken;

use agentmux_protocol::event::AppEvent;
use agentmux_pump::MessagePump;
use agentmux_supervisor::WorkerError;

/// Supervised run function of the "state-watcher" worker: bridges filesystem
/// notifications on the persisted-state directory into the pump.
///
/// Errors (watch root missing, watcher backend failure) surface to the
/// supervisor, which relaunches after backoff instead of spinning on a
/// vanished watch root.
pub async fn watch_state_dir(
    root: PathBuf,
    pump: Arc<MessagePump>,
    shutdown: CancellationToken,
) -> Result<(), WorkerError> {
    std::fs::create_dir_all(&root).map_err(|error| {
        WorkerError::Failed(format!("create state dir {}: {error}", root.display()))
    })?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |result: notify::Result<notify::Event>| {
            if let Ok(event) = result {
                for path in event.paths {
                    let _ = tx.send(path);
                }
            }
        },
        notify::Config::default(),
    )
    .map_err(|error| WorkerError::Failed(format!("create state watcher: {error}")))?;

    watcher
        .watch(&root, RecursiveMode::NonRecursive)
        .map_err(|error| {
            WorkerError::Failed(format!("watch {}: {error}", root.display()))
        })?;
    tracing::debug!(root = %root.display(), "state watcher running");

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return Ok(()),
            changed = rx.recv() => match changed {
                Some(path) => pump.enqueue(AppEvent::PathChanged { path }),
                None => {
                    return Err(WorkerError::Failed(
                        "state watcher channel closed".to_owned(),
                    ))
                }
            }
        }
    }
}
