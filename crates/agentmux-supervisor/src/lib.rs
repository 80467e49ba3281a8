//! Supervision of long-running background tasks and panic-safe wrapping of
//! one-shot commands.

pub mod command;
pub mod supervisor;

pub use command::{spawn_command, spawn_command_batch, CommandError, CommandFuture};
pub use supervisor::{
    RestartPolicy, WorkerError, WorkerErrorHandler, WorkerOptions, WorkerState, WorkerSupervisor,
    DEFAULT_WORKER_BACKOFF, STOP_WAIT_TIMEOUT,
};
