use std::fmt;

use serde::Serialize;

/// Closed taxonomy of everything that can go wrong for the worker.
///
/// `InvalidInput`, `OutOfMemory` and `Unknown` are scoped to a single job and
/// always end in an error envelope. `Fatal` only ever comes out of model
/// loading, before any job exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    OutOfMemory,
    Unknown,
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::OutOfMemory => "out_of_memory",
            ErrorKind::Unknown => "unknown",
            ErrorKind::Fatal => "fatal",
        })
    }
}

/// A job-scoped failure: the kind plus the message the caller will see.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }
}

/// Faults raised by a [`crate::ModelEngine`] while generating.
///
/// Memory exhaustion gets its own variant so the classifier never has to look
/// at message text.
#[derive(Debug, thiserror::Error)]
pub enum EngineFault {
    #[error("device memory exhausted")]
    OutOfMemory,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("model engine failed to load: {0:#}")]
    Fatal(anyhow::Error),
    #[error("cannot start the lifecycle from state {0}")]
    AlreadyStarted(crate::LifecycleState),
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::Fatal(_) | LifecycleError::AlreadyStarted(_) => ErrorKind::Fatal,
        }
    }
}
