//! In-memory process store for a single scheduler instance.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::error::ProcessError;
use super::identity::{ContainerId, ProcessId};
use super::models::ProcessRecord;
use super::repository::ProcessRepository;

#[derive(Default)]
struct State {
    processes: HashMap<ProcessId, ProcessRecord>,
    /// Front is the next id to dequeue.
    waiting: VecDeque<ProcessId>,
    running: HashSet<ProcessId>,
    finished: HashSet<ProcessId>,
    containers: HashMap<ContainerId, ProcessId>,
    locks: HashMap<String, (String, Instant)>,
}

/// Process store kept in process memory. Every primitive runs under one mutex,
/// which gives the per-key atomicity the Redis backend gets from the server.
#[derive(Default)]
pub struct InMemoryProcessRepository {
    state: Mutex<State>,
}

impl InMemoryProcessRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, ProcessError> {
        self.state
            .lock()
            .map_err(|e| ProcessError::Store(e.to_string()))
    }
}

#[async_trait]
impl ProcessRepository for InMemoryProcessRepository {
    async fn get_process(&self, id: &str) -> Result<Option<ProcessRecord>, ProcessError> {
        Ok(self.state()?.processes.get(id).cloned())
    }

    async fn put_process(&self, record: &ProcessRecord) -> Result<(), ProcessError> {
        self.state()?
            .processes
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn insert_process(&self, record: &ProcessRecord) -> Result<bool, ProcessError> {
        let mut state = self.state()?;
        match state.processes.entry(record.id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(true)
            }
        }
    }

    async fn list_processes(&self) -> Result<Vec<ProcessRecord>, ProcessError> {
        let state = self.state()?;
        let mut records: Vec<ProcessRecord> = state.processes.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn push_waiting(&self, id: &str) -> Result<usize, ProcessError> {
        let mut state = self.state()?;
        state.waiting.push_back(id.to_string());
        Ok(state.waiting.len())
    }

    async fn requeue_front(&self, id: &str) -> Result<(), ProcessError> {
        self.state()?.waiting.push_front(id.to_string());
        Ok(())
    }

    async fn pop_waiting(&self) -> Result<Option<ProcessId>, ProcessError> {
        Ok(self.state()?.waiting.pop_front())
    }

    async fn remove_waiting(&self, id: &str) -> Result<bool, ProcessError> {
        let mut state = self.state()?;
        let before = state.waiting.len();
        state.waiting.retain(|waiting| waiting != id);
        Ok(state.waiting.len() != before)
    }

    async fn waiting_len(&self) -> Result<usize, ProcessError> {
        Ok(self.state()?.waiting.len())
    }

    async fn waiting_ids(&self) -> Result<Vec<ProcessId>, ProcessError> {
        Ok(self.state()?.waiting.iter().cloned().collect())
    }

    async fn claim_running_slot(&self, id: &str, limit: usize) -> Result<bool, ProcessError> {
        let mut state = self.state()?;
        if state.running.contains(id) {
            return Ok(true);
        }
        if state.running.len() >= limit {
            return Ok(false);
        }
        state.running.insert(id.to_string());
        Ok(true)
    }

    async fn add_running(&self, id: &str) -> Result<bool, ProcessError> {
        Ok(self.state()?.running.insert(id.to_string()))
    }

    async fn remove_running(&self, id: &str) -> Result<bool, ProcessError> {
        Ok(self.state()?.running.remove(id))
    }

    async fn running_len(&self) -> Result<usize, ProcessError> {
        Ok(self.state()?.running.len())
    }

    async fn is_running(&self, id: &str) -> Result<bool, ProcessError> {
        Ok(self.state()?.running.contains(id))
    }

    async fn add_finished(&self, id: &str) -> Result<bool, ProcessError> {
        Ok(self.state()?.finished.insert(id.to_string()))
    }

    async fn is_finished(&self, id: &str) -> Result<bool, ProcessError> {
        Ok(self.state()?.finished.contains(id))
    }

    async fn finished_len(&self) -> Result<usize, ProcessError> {
        Ok(self.state()?.finished.len())
    }

    async fn set_container_process(
        &self,
        container_id: &str,
        process_id: &str,
    ) -> Result<(), ProcessError> {
        self.state()?
            .containers
            .insert(container_id.to_string(), process_id.to_string());
        Ok(())
    }

    async fn get_container_process(
        &self,
        container_id: &str,
    ) -> Result<Option<ProcessId>, ProcessError> {
        Ok(self.state()?.containers.get(container_id).cloned())
    }

    async fn remove_container_process(&self, container_id: &str) -> Result<bool, ProcessError> {
        Ok(self.state()?.containers.remove(container_id).is_some())
    }

    async fn try_acquire_lock(
        &self,
        resource: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, ProcessError> {
        let mut state = self.state()?;
        let now = Instant::now();
        if let Some((_, expires_at)) = state.locks.get(resource) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        state
            .locks
            .insert(resource.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_lock(&self, resource: &str, token: &str) -> Result<bool, ProcessError> {
        let mut state = self.state()?;
        match state.locks.get(resource) {
            Some((owner, _)) if owner == token => {
                state.locks.remove(resource);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
