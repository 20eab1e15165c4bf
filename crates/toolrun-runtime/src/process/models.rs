//! Process domain models.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::identity::{ContainerId, ProcessId};

/// Lifecycle status of a process. `Aborted` and `Finished` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    Created,
    Waiting,
    Running,
    Aborted,
    Finished,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::Aborted => "ABORTED",
            Self::Finished => "FINISHED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Aborted | Self::Finished)
    }

    /// Edges of the process state machine. `Running -> Running` is the
    /// idempotent start confirmation.
    pub fn can_transition_to(&self, next: ProcessStatus) -> bool {
        use ProcessStatus::*;
        matches!(
            (self, next),
            (Created, Waiting)
                | (Created, Aborted)
                | (Waiting, Running)
                | (Waiting, Aborted)
                | (Running, Running)
                | (Running, Finished)
                | (Running, Aborted)
        )
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATED" => Ok(Self::Created),
            "WAITING" => Ok(Self::Waiting),
            "RUNNING" => Ok(Self::Running),
            "ABORTED" => Ok(Self::Aborted),
            "FINISHED" => Ok(Self::Finished),
            other => Err(format!("unknown process status '{other}'")),
        }
    }
}

/// Request to create a process around one tool image.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpec {
    /// Explicit id; derived from the request content when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ProcessId>,
    /// Tool image id or reference.
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    /// Engine-specific container body overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_params: Option<Map<String, Value>>,
}

impl ProcessSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<ProcessId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_requester(mut self, requester_id: impl Into<String>) -> Self {
        self.requester_id = Some(requester_id.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = Some(args.into_iter().map(Into::into).collect());
        self
    }
}

/// Persistent record of one process. Optional fields are omitted from the
/// serialized form when unset, so field projection sees them as absent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub id: ProcessId,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_params: Option<Map<String, Value>>,
    pub container_id: ContainerId,
    pub status: ProcessStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProcessRecord {
    pub fn from_spec(
        id: ProcessId,
        spec: ProcessSpec,
        container_id: ContainerId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            image: spec.image,
            version: spec.version,
            requester_id: spec.requester_id,
            comment: spec.comment,
            args: spec.args,
            env: spec.env,
            engine_params: spec.engine_params,
            container_id,
            status: ProcessStatus::Created,
            created_at,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Result of enqueueing: 1-based position counted from the next process to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResult {
    pub position: usize,
    pub wait_queue_length: usize,
}

/// Outcome of a dequeue attempt when queue conditions are returned as data.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessExecutionResult {
    Started { process: ProcessRecord },
    QueueEmpty,
    QueueFull { running: usize, limit: usize },
}

impl ProcessExecutionResult {
    pub fn started(&self) -> Option<&ProcessRecord> {
        match self {
            Self::Started { process } => Some(process),
            _ => None,
        }
    }
}

/// Outcome of the combined create + enqueue + dequeue operation.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    /// Accepted and started right away.
    Started { process: ProcessRecord },
    /// Accepted and waiting for capacity.
    Pending {
        process: ProcessRecord,
        queue: EnqueueResult,
    },
}

impl RunOutcome {
    pub fn process(&self) -> &ProcessRecord {
        match self {
            Self::Started { process } | Self::Pending { process, .. } => process,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started { .. })
    }
}

/// Snapshot of queue accounting. `max_waiting` is advisory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub waiting: usize,
    pub running: usize,
    pub finished: usize,
    pub max_running: usize,
    pub max_waiting: usize,
}

impl QueueStatus {
    pub fn wait_queue_saturated(&self) -> bool {
        self.waiting >= self.max_waiting
    }
}
