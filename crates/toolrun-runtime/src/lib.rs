//! Container process scheduler.
//!
//! Runs containerized tools as managed processes: a FIFO wait list gated by a
//! system-wide concurrency limit, a lifecycle state machine driven by the
//! container engine's event feed, and per-process lease locks over a shared
//! store so several scheduler instances can cooperate.
//!
//! - [container]: engine adapter, image selection and the event feed.
//! - [process]: records, store backends, leases, the scheduler and event dispatch.
//! - [timers]: cancellable deferred tasks.
//! - [config]: environment configuration and startup health checks.

pub mod config;
pub mod container;
pub mod process;
pub mod timers;

pub use config::{RuntimeConfig, StoreBackend};
pub use container::{ContainerRuntime, DockerClient, RuntimeError, RuntimeEventConsumer};
pub use process::{ProcessError, ProcessScheduler, ProcessSpec, ProcessStatus, SchedulerConfig};
