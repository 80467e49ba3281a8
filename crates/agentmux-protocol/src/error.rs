use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("session backend binary not found: {0}")]
    BinaryNotFound(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session backend call timed out: {0}")]
    Timeout(String),
    #[error("session backend process error: {0}")]
    Process(String),
    #[error("session backend protocol error: {0}")]
    Protocol(String),
}

pub type BackendResult<T> = Result<T, BackendError>;
