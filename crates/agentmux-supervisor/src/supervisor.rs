use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_WORKER_BACKOFF: Duration = Duration::from_secs(1);
/// Bound on how long `stop` waits for a worker to observe cancellation.
pub const STOP_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("{0}")]
    Failed(String),
    #[error("worker panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    #[default]
    Never,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    pub policy: RestartPolicy,
    pub backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            policy: RestartPolicy::Never,
            backoff: DEFAULT_WORKER_BACKOFF,
        }
    }
}

/// Explicit per-worker lifecycle state, observable by tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Backoff,
    Exited,
}

pub type WorkerErrorHandler = Arc<dyn Fn(&str, &WorkerError) + Send + Sync>;

struct WorkerEntry {
    state: Arc<Mutex<WorkerState>>,
    driver: Option<JoinHandle<()>>,
}

/// Owns a named set of long-running background tasks and restarts them per
/// policy.
///
/// Errors never surface to the `start` caller; they are routed to the single
/// installed error handler. Shutdown is one shared cancellation signal: a
/// worker that exits while it is raised is terminal regardless of policy and
/// never reaches the handler.
pub struct WorkerSupervisor {
    shutdown: CancellationToken,
    error_handler: Arc<RwLock<Option<WorkerErrorHandler>>>,
    workers: Mutex<HashMap<String, WorkerEntry>>,
}

impl Default for WorkerSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerSupervisor {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            error_handler: Arc::new(RwLock::new(None)),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// The shared cancellation signal handed to every worker run.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn set_error_handler(&self, handler: WorkerErrorHandler) {
        let mut slot = self
            .error_handler
            .write()
            .expect("supervisor error handler lock poisoned");
        *slot = Some(handler);
    }

    /// Registers and launches a background task under `name`.
    ///
    /// `run_fn` is invoked once per launch with the shared cancellation
    /// token and must observe it at its next suspension point. Panics:
    /// worker names are unique; registering a duplicate is a programming
    /// error.
    pub fn start<F, Fut>(&self, name: &str, options: WorkerOptions, run_fn: F)
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
    {
        let mut workers = self.workers.lock().expect("supervisor worker lock poisoned");
        assert!(
            !workers.contains_key(name),
            "duplicate supervised worker name: {name}"
        );

        let state = Arc::new(Mutex::new(WorkerState::Running));
        let driver = tokio::spawn(drive_worker(
            name.to_owned(),
            options,
            run_fn,
            self.shutdown.clone(),
            Arc::clone(&self.error_handler),
            Arc::clone(&state),
        ));
        workers.insert(
            name.to_owned(),
            WorkerEntry {
                state,
                driver: Some(driver),
            },
        );
    }

    pub fn worker_state(&self, name: &str) -> Option<WorkerState> {
        let workers = self.workers.lock().expect("supervisor worker lock poisoned");
        workers
            .get(name)
            .map(|entry| *entry.state.lock().expect("worker state lock poisoned"))
    }

    /// Signals cancellation to every worker and waits, bounded, for exit.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let drivers: Vec<(String, JoinHandle<()>)> = {
            let mut workers = self.workers.lock().expect("supervisor worker lock poisoned");
            workers
                .iter_mut()
                .filter_map(|(name, entry)| {
                    entry.driver.take().map(|driver| (name.clone(), driver))
                })
                .collect()
        };

        for (name, driver) in drivers {
            if tokio::time::timeout(STOP_WAIT_TIMEOUT, driver).await.is_err() {
                tracing::warn!(worker = name.as_str(), "worker did not stop in time");
            }
        }
    }
}

async fn drive_worker<F, Fut>(
    name: String,
    options: WorkerOptions,
    run_fn: F,
    shutdown: CancellationToken,
    error_handler: Arc<RwLock<Option<WorkerErrorHandler>>>,
    state: Arc<Mutex<WorkerState>>,
) where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
{
    loop {
        set_state(&state, WorkerState::Running);
        // Each run executes on its own task so a panic is contained there
        // and observed here as a join error.
        let run = tokio::spawn(run_fn(shutdown.clone()));
        let outcome = match run.await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => {
                Err(WorkerError::Panicked(panic_message(join_error)))
            }
            Err(_) => Ok(()),
        };

        if shutdown.is_cancelled() {
            // Graceful shutdown, not failure: terminal regardless of policy.
            set_state(&state, WorkerState::Exited);
            return;
        }

        match &outcome {
            Ok(()) => {
                tracing::info!(worker = name.as_str(), "supervised worker exited");
            }
            Err(error) => {
                tracing::error!(worker = name.as_str(), error = %error, "supervised worker failed");
                let handler = {
                    let slot = error_handler
                        .read()
                        .expect("supervisor error handler lock poisoned");
                    slot.clone()
                };
                if let Some(handler) = handler {
                    handler(name.as_str(), error);
                }
            }
        }

        match options.policy {
            RestartPolicy::Never => {
                set_state(&state, WorkerState::Exited);
                return;
            }
            RestartPolicy::Always => {
                set_state(&state, WorkerState::Backoff);
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => {
                        set_state(&state, WorkerState::Exited);
                        return;
                    }
                    () = tokio::time::sleep(options.backoff) => {}
                }
            }
        }
    }
}

fn set_state(state: &Arc<Mutex<WorkerState>>, next: WorkerState) {
    *state.lock().expect("worker state lock poisoned") = next;
}

fn panic_message(join_error: JoinError) -> String {
    let payload = join_error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
