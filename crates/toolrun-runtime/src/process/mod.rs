//! Process scheduling: records, queues, leases and the lifecycle state machine.

pub mod dispatch;
pub mod error;
pub mod identity;
pub mod lease;
pub mod memory_repository;
pub mod models;
pub mod publisher;
pub mod query;
#[cfg(feature = "redis-store")]
pub mod redis_repository;
pub mod repository;
pub mod scheduler;

pub use dispatch::{event_channel, ProcessEvent, ProcessEventHandler, ProcessEventKind};
pub use error::ProcessError;
pub use identity::{derive_process_id, ContainerId, ProcessId};
pub use lease::{LeaseConfig, ProcessLease, ProcessLocks};
pub use memory_repository::InMemoryProcessRepository;
pub use models::{
    EnqueueResult, ProcessExecutionResult, ProcessRecord, ProcessSpec, ProcessStatus,
    QueueStatus, RunOutcome,
};
pub use publisher::{BroadcastPublisher, StatePublisher, STATE_CHANNEL};
#[cfg(feature = "redis-store")]
pub use publisher::RedisPublisher;
pub use query::{ProcessQuery, SortOrder};
#[cfg(feature = "redis-store")]
pub use redis_repository::RedisProcessRepository;
pub use repository::ProcessRepository;
pub use scheduler::{ProcessScheduler, SchedulerConfig};
