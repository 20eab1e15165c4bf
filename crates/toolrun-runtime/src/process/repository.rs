//! Storage façade for process records, queues and the lease lock primitive.

use std::time::Duration;

use async_trait::async_trait;

use super::error::ProcessError;
use super::identity::ProcessId;
use super::models::ProcessRecord;

/// Shared process store contract used by the scheduler and the event consumer.
///
/// Each method is atomic on its own key. Nothing here serializes a
/// read-modify-write of a record; callers do that through
/// [crate::process::lease::ProcessLocks].
/// - The wait list is FIFO: `push_waiting` appends behind every waiting id and
///   `pop_waiting` returns the oldest one.
/// - `claim_running_slot` is the admission primitive: it adds the id to the
///   running set only while the set holds fewer than `limit` members, checked
///   and applied atomically so concurrent dequeues never overshoot the limit.
/// - `try_acquire_lock` succeeds only when no unexpired lease exists for the
///   resource; `release_lock` removes the lease only when `token` still owns it.
#[async_trait]
pub trait ProcessRepository: Send + Sync {
    async fn get_process(&self, id: &str) -> Result<Option<ProcessRecord>, ProcessError>;

    async fn put_process(&self, record: &ProcessRecord) -> Result<(), ProcessError>;

    /// Store `record` only when no record with its id exists yet; returns
    /// false, leaving the existing record untouched, otherwise.
    async fn insert_process(&self, record: &ProcessRecord) -> Result<bool, ProcessError>;

    async fn list_processes(&self) -> Result<Vec<ProcessRecord>, ProcessError>;

    /// Append to the wait list; returns the new length.
    async fn push_waiting(&self, id: &str) -> Result<usize, ProcessError>;

    /// Put a popped id back at the head of the line.
    async fn requeue_front(&self, id: &str) -> Result<(), ProcessError>;

    async fn pop_waiting(&self) -> Result<Option<ProcessId>, ProcessError>;

    /// Remove every occurrence of `id`; returns true if any was removed.
    async fn remove_waiting(&self, id: &str) -> Result<bool, ProcessError>;

    async fn waiting_len(&self) -> Result<usize, ProcessError>;

    /// Ids in dequeue order, oldest first.
    async fn waiting_ids(&self) -> Result<Vec<ProcessId>, ProcessError>;

    /// Returns true when `id` holds a running slot after the call.
    async fn claim_running_slot(&self, id: &str, limit: usize) -> Result<bool, ProcessError>;

    async fn add_running(&self, id: &str) -> Result<bool, ProcessError>;

    async fn remove_running(&self, id: &str) -> Result<bool, ProcessError>;

    async fn running_len(&self) -> Result<usize, ProcessError>;

    async fn is_running(&self, id: &str) -> Result<bool, ProcessError>;

    async fn add_finished(&self, id: &str) -> Result<bool, ProcessError>;

    async fn is_finished(&self, id: &str) -> Result<bool, ProcessError>;

    async fn finished_len(&self) -> Result<usize, ProcessError>;

    async fn set_container_process(
        &self,
        container_id: &str,
        process_id: &str,
    ) -> Result<(), ProcessError>;

    async fn get_container_process(
        &self,
        container_id: &str,
    ) -> Result<Option<ProcessId>, ProcessError>;

    async fn remove_container_process(&self, container_id: &str) -> Result<bool, ProcessError>;

    async fn try_acquire_lock(
        &self,
        resource: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, ProcessError>;

    async fn release_lock(&self, resource: &str, token: &str) -> Result<bool, ProcessError>;

    /// Store liveness for startup health checks.
    async fn ping(&self) -> Result<(), ProcessError> {
        Ok(())
    }
}
