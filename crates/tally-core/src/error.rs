use thiserror::Error;

use crate::task::{CategoryId, TaskId};

/// Failure of a call to the auth provider or the table service.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("{message} (HTTP {status})")]
    Service { status: u16, message: String },

    #[error("{0}")]
    Rejected(String),

    #[error("not signed in")]
    Unauthenticated,

    #[error("the service returned no rows")]
    NoRows,

    #[error("malformed payload: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("simulated failure of {0}")]
    Injected(&'static str),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Transport(err.to_string())
    }
}

/// An action refused before anything was sent to the backend. State is left
/// untouched whenever one of these is returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Task text cannot be empty")]
    Blank,

    #[error("Task text must be longer than 3 characters")]
    TooShort,

    #[error("Please enter email and password")]
    MissingCredentials,

    #[error("Sign in to manage tasks")]
    SignedOut,

    #[error("no task with id {0}")]
    UnknownTask(TaskId),

    #[error("no category with id {0}")]
    UnknownCategory(CategoryId),

    #[error("no task is being edited")]
    NotEditing,

    #[error("no failed change with number {0}")]
    UnknownSync(u64),
}

#[derive(Debug, Error)]
pub enum KvError {
    #[error("key/value file i/o failed")]
    Io(#[from] std::io::Error),

    #[error("key/value file is not valid json")]
    Json(#[from] serde_json::Error),

    #[error("failed to persist key/value file: {0}")]
    Persist(String),
}
