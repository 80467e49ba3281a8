use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use agentmux_protocol::event::AppEvent;
use agentmux_reconcile::Reconciler;

/// The single consumer loop: the only owner of mutable application state.
///
/// Every background-origin event arrives here through the pump; the
/// reconciler handles the ones it owns, the rest are shell-facing
/// notifications (rendering is out of this core's scope, so they are
/// logged).
pub struct AppRuntime {
    reconciler: Reconciler,
    receiver: UnboundedReceiver<AppEvent>,
    shutdown: CancellationToken,
}

impl AppRuntime {
    pub fn new(
        reconciler: Reconciler,
        receiver: UnboundedReceiver<AppEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            reconciler,
            receiver,
            shutdown,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub async fn run(&mut self) {
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return,
                event = self.receiver.recv() => {
                    let Some(event) = event else { return };
                    if let Some(unhandled) = self.reconciler.handle_event(event) {
                        Self::notify_shell(unhandled);
                    }
                }
            }
        }
    }

    fn notify_shell(event: AppEvent) {
        match event {
            AppEvent::Error(error) => {
                tracing::error!(
                    source = error.source.as_str(),
                    detail = error.detail.as_str(),
                    "background error"
                );
            }
            AppEvent::SessionStopped(stopped) => {
                tracing::warn!(
                    workspace = stopped.workspace_id.as_str(),
                    session = stopped.backend_session.as_str(),
                    exit_code = stopped.exit_code,
                    "session stopped"
                );
            }
            AppEvent::SessionOutput { backend_session, bytes } => {
                tracing::trace!(
                    session = backend_session.as_str(),
                    bytes = bytes.len(),
                    "session output"
                );
            }
            _ => {}
        }
    }
}
