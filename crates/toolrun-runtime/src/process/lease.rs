//! Per-process lease locks.
//!
//! Every read-modify-write of a process record runs while holding the lease for
//! that process id. Leases are short and expire on their own, so a crashed
//! holder never blocks a record for longer than the TTL.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::error::ProcessError;
use super::repository::ProcessRepository;

/// Lease behavior tuning knobs.
#[derive(Clone, Debug)]
pub struct LeaseConfig {
    pub lock_ttl: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_millis(100),
            max_attempts: 20,
            retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(100),
        }
    }
}

/// A held lease. Hand it back through [ProcessLocks::release].
#[derive(Debug)]
pub struct ProcessLease {
    resource: String,
    token: String,
    acquired_at: Instant,
    ttl: Duration,
}

impl ProcessLease {
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

#[derive(Clone)]
pub struct ProcessLocks {
    repository: Arc<dyn ProcessRepository>,
    config: LeaseConfig,
}

impl ProcessLocks {
    pub fn new(repository: Arc<dyn ProcessRepository>, config: LeaseConfig) -> Self {
        Self { repository, config }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    fn resource_for(process_id: &str) -> String {
        format!("process:{process_id}")
    }

    /// Acquire the lease for `process_id`, retrying with doubling backoff.
    pub async fn acquire(&self, process_id: &str) -> Result<ProcessLease, ProcessError> {
        let resource = Self::resource_for(process_id);
        let token = uuid::Uuid::new_v4().to_string();
        let mut delay = self.config.retry_delay;

        for attempt in 1..=self.config.max_attempts.max(1) {
            if self
                .repository
                .try_acquire_lock(&resource, &token, self.config.lock_ttl)
                .await?
            {
                return Ok(ProcessLease {
                    resource,
                    token,
                    acquired_at: Instant::now(),
                    ttl: self.config.lock_ttl,
                });
            }
            if attempt < self.config.max_attempts {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.config.max_retry_delay);
            }
        }

        log::warn!(
            "process_lock_unavailable resource={} attempts={}",
            resource,
            self.config.max_attempts
        );
        Err(ProcessError::LockUnavailable(resource))
    }

    pub async fn release(&self, lease: ProcessLease) -> Result<(), ProcessError> {
        let released = self
            .repository
            .release_lock(&lease.resource, &lease.token)
            .await?;
        if !released {
            log::warn!(
                "process_lock_lost resource={} held_ms={} ttl_ms={}",
                lease.resource,
                lease.acquired_at.elapsed().as_millis(),
                lease.ttl.as_millis()
            );
        }
        Ok(())
    }
}
