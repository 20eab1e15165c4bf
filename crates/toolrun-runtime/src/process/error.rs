//! Scheduler error taxonomy.

use crate::container::RuntimeError;

use super::identity::ProcessId;
use super::models::ProcessStatus;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Container engine failure, propagated as classified by the adapter.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("nothing to dequeue: wait queue is empty")]
    QueueEmpty,
    #[error("queue full: {running} of {limit} processes running")]
    QueueFull { running: usize, limit: usize },
    /// An event or internal transition named a process with no record.
    #[error("unknown process: {0}")]
    UnknownProcess(ProcessId),
    #[error("process not found: {0}")]
    NotFound(ProcessId),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("process {process_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        process_id: ProcessId,
        from: ProcessStatus,
        to: ProcessStatus,
    },
    #[error("lock unavailable for {0}")]
    LockUnavailable(String),
    #[error("store error: {0}")]
    Store(String),
}

impl ProcessError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Runtime(e) => e.code(),
            Self::QueueEmpty => "QUEUE_EMPTY",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::UnknownProcess(_) => "UNKNOWN_PROCESS",
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::InvalidTransition { .. } | Self::LockUnavailable(_) => "CONFLICT",
            Self::Store(_) => "INTERNAL",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Runtime(e) => e.http_status(),
            Self::QueueEmpty | Self::UnknownProcess(_) | Self::NotFound(_) => 404,
            Self::QueueFull { .. } => 429,
            Self::BadRequest(_) => 400,
            Self::InvalidTransition { .. } | Self::LockUnavailable(_) => 409,
            Self::Store(_) => 500,
        }
    }
}
