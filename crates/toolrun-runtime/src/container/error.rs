//! Container engine error taxonomy.
//!
//! Every engine call is normalized into [RuntimeError] exactly once, inside the
//! adapter. Callers above the adapter only ever see these variants.

use serde::Serialize;

/// Refinement of a `CONFLICT` answer, chosen by the operation that received it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    /// Kill or stop of a container that is not running.
    NotRunning,
    /// Removal of a container that is still running.
    InUse,
    /// Creation with a name that another container already holds.
    NameInUse,
    Other,
}

/// Container engine operation that produced an error; used to refine conflicts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeOperation {
    Ping,
    CreateContainer,
    StartContainer,
    StopContainer,
    KillContainer,
    RemoveContainer,
    InspectContainer,
    ListImages,
    InspectImage,
    Events,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("not modified: {0}")]
    NotModified(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict ({kind:?}): {message}")]
    Conflict { kind: ConflictKind, message: String },
    /// The engine refused the connection or could not be reached.
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("container runtime error: {0}")]
    Internal(String),
}

impl RuntimeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotModified(_) => "NOT_MODIFIED",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::Unavailable(_) => "RUNTIME_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// HTTP-equivalent status for transports that expose these errors.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotModified(_) => 304,
            Self::BadRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict { .. } => 409,
            Self::Unavailable(_) => 503,
            Self::Internal(_) => 500,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_not_running(&self) -> bool {
        matches!(
            self,
            Self::Conflict {
                kind: ConflictKind::NotRunning,
                ..
            }
        )
    }

    /// Classify an engine HTTP answer.
    pub fn from_status(operation: RuntimeOperation, status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            304 => Self::NotModified(message),
            400 => Self::BadRequest(message),
            404 => Self::NotFound(message),
            409 => Self::Conflict {
                kind: classify_conflict(operation, &message),
                message,
            },
            _ => Self::Internal(format!("status {status}: {message}")),
        }
    }

    /// Classify a transport failure. Refused or failed connections mean the
    /// engine is down; anything else is unclassified.
    pub fn from_transport(operation: RuntimeOperation, err: &reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            return Self::Unavailable(format!("{operation:?}: {err}"));
        }
        if let Some(status) = err.status() {
            return Self::from_status(operation, status.as_u16(), err.to_string());
        }
        Self::Internal(format!("{operation:?}: {err}"))
    }
}

fn classify_conflict(operation: RuntimeOperation, message: &str) -> ConflictKind {
    let lower = message.to_ascii_lowercase();
    match operation {
        RuntimeOperation::KillContainer | RuntimeOperation::StopContainer
            if lower.contains("not running") =>
        {
            ConflictKind::NotRunning
        }
        RuntimeOperation::KillContainer | RuntimeOperation::StopContainer => ConflictKind::Other,
        RuntimeOperation::RemoveContainer => ConflictKind::InUse,
        RuntimeOperation::CreateContainer if lower.contains("already in use") => {
            ConflictKind::NameInUse
        }
        _ if lower.contains("not running") => ConflictKind::NotRunning,
        _ => ConflictKind::Other,
    }
}
