use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;

use agentmux_protocol::event::{AppEvent, ErrorEvent};
use agentmux_pump::MessagePump;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("{0}")]
    Failed(String),
}

pub type CommandFuture = Pin<Box<dyn Future<Output = Result<(), CommandError>> + Send>>;

/// Runs a one-shot asynchronous operation so that an internal fault (error
/// return or panic) is caught and converted into a `Critical` error event,
/// never a process crash.
///
/// The operation executes on its own task; a panic surfaces here as a join
/// error (the process-wide panic hook has already logged the backtrace).
pub fn spawn_command<F>(
    pump: Arc<MessagePump>,
    label: impl Into<String>,
    future: F,
) -> JoinHandle<()>
where
    F: Future<Output = Result<(), CommandError>> + Send + 'static,
{
    let label = label.into();
    tokio::spawn(async move {
        let run = tokio::spawn(future);
        match run.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::error!(command = label.as_str(), error = %error, "command failed");
                pump.enqueue(AppEvent::Error(ErrorEvent {
                    source: label,
                    detail: error.to_string(),
                }));
            }
            Err(join_error) if join_error.is_panic() => {
                let detail = panic_detail(join_error);
                tracing::error!(command = label.as_str(), detail = detail.as_str(), "command panicked");
                pump.enqueue(AppEvent::Error(ErrorEvent {
                    source: label,
                    detail,
                }));
            }
            Err(_) => {}
        }
    })
}

/// Batch variant: runs every present entry, skipping empty ones, so a fault
/// in one command does not prevent the others from completing.
pub fn spawn_command_batch(
    pump: &Arc<MessagePump>,
    commands: impl IntoIterator<Item = Option<(String, CommandFuture)>>,
) -> Vec<JoinHandle<()>> {
    commands
        .into_iter()
        .flatten()
        .map(|(label, future)| spawn_command(Arc::clone(pump), label, future))
        .collect()
}

fn panic_detail(join_error: tokio::task::JoinError) -> String {
    let payload = join_error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic: unknown payload".to_owned()
    }
}
