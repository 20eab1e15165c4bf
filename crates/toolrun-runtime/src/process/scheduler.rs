//! Process scheduler: admission control, the state machine and cascade.
//!
//! Every record mutation runs under the process lease from [ProcessLocks].
//! Engine calls that can take long (container start, graceful stop) run outside
//! the lease. The running set is reserved through
//! [ProcessRepository::claim_running_slot] before a container is started, so
//! concurrent dequeues on any number of instances never overshoot the limit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::container::{
    ContainerRuntime, ContainerSpec, ImageInfo, ImageListOptions, ImageSummary, RuntimeError,
    PROCESS_LABEL,
};
use crate::timers::DeferredTasks;

use super::dispatch::{run_dispatcher, ProcessEvent, ProcessEventHandler, ProcessEventKind};
use super::error::ProcessError;
use super::identity::derive_process_id;
use super::lease::{LeaseConfig, ProcessLocks};
use super::models::{
    EnqueueResult, ProcessExecutionResult, ProcessRecord, ProcessSpec, ProcessStatus,
    QueueStatus, RunOutcome,
};
use super::publisher::StatePublisher;
use super::query::{parse_fields, project, run_query, ProcessQuery};
use super::repository::ProcessRepository;

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Concurrency limit across every scheduler sharing the store.
    pub max_running: usize,
    /// Advisory wait-queue size; reported, never enforced.
    pub max_waiting: usize,
    /// Delay between a terminal event and dropping the container index entry.
    pub finalize_delay: Duration,
    pub remove_finished_containers: bool,
    pub lease: LeaseConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_running: 4,
            max_waiting: 100,
            finalize_delay: Duration::from_secs(5),
            remove_finished_containers: true,
            lease: LeaseConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct ProcessScheduler {
    runtime: Arc<dyn ContainerRuntime>,
    repository: Arc<dyn ProcessRepository>,
    publisher: Arc<dyn StatePublisher>,
    locks: ProcessLocks,
    cleanup: DeferredTasks,
    config: SchedulerConfig,
}

/// Whether a failed candidate stops the dequeue loop or is skipped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DequeueMode {
    Direct,
    Cascade,
}

impl ProcessScheduler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        repository: Arc<dyn ProcessRepository>,
        publisher: Arc<dyn StatePublisher>,
        config: SchedulerConfig,
    ) -> Self {
        let locks = ProcessLocks::new(Arc::clone(&repository), config.lease.clone());
        Self {
            runtime,
            repository,
            publisher,
            locks,
            cleanup: DeferredTasks::new(),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn ProcessRepository> {
        &self.repository
    }

    /// Pending delayed cleanups, keyed by process id.
    pub fn pending_cleanups(&self) -> &DeferredTasks {
        &self.cleanup
    }

    /// Engine and store liveness.
    pub async fn health_check(&self) -> Result<(), ProcessError> {
        self.runtime.ping().await?;
        self.repository.ping().await
    }

    pub async fn create_process(&self, spec: ProcessSpec) -> Result<ProcessRecord, ProcessError> {
        let created_at = Utc::now();
        let id = match &spec.id {
            Some(id) => id.clone(),
            None => derive_process_id(
                &spec.image,
                spec.version.as_deref(),
                spec.requester_id.as_deref(),
                created_at,
            ),
        };
        if self.repository.get_process(&id).await?.is_some() {
            return Err(ProcessError::BadRequest(format!(
                "process {id} already exists"
            )));
        }

        let container_spec = ContainerSpec {
            image: spec.image.clone(),
            name: None,
            args: spec.args.clone(),
            env: spec.env.clone(),
            labels: Default::default(),
            overrides: spec.engine_params.clone(),
        }
        .with_label(PROCESS_LABEL, id.as_str());
        let container_id = self.runtime.create_container(&container_spec).await?;

        let record = ProcessRecord::from_spec(id, spec, container_id, created_at);
        if !self.repository.insert_process(&record).await? {
            // Lost a race for the same explicit id; the winner owns the id.
            log::warn!(
                "process_create_conflict process_id={} container_id={}",
                record.id,
                record.container_id
            );
            if let Err(e) = self.runtime.remove_container(&record.container_id).await {
                log::warn!(
                    "orphan_container_remove_failed container_id={} code={} error={}",
                    record.container_id,
                    e.code(),
                    e
                );
            }
            return Err(ProcessError::BadRequest(format!(
                "process {} already exists",
                record.id
            )));
        }
        self.repository
            .set_container_process(&record.container_id, &record.id)
            .await?;

        log::info!(
            "process_created process_id={} container_id={} image={}",
            record.id,
            record.container_id,
            record.image
        );
        self.publisher.publish(&record.id, record.status).await;
        Ok(record)
    }

    pub async fn enqueue_process(&self, process_id: &str) -> Result<EnqueueResult, ProcessError> {
        let lease = self.locks.acquire(process_id).await?;
        let result = self.enqueue_locked(process_id).await;
        self.locks.release(lease).await?;
        let queued = result?;

        log::info!(
            "process_enqueue process_id={} position={}",
            process_id,
            queued.position
        );
        if queued.wait_queue_length > self.config.max_waiting {
            log::warn!(
                "wait_queue_over_advisory_limit length={} max_waiting={}",
                queued.wait_queue_length,
                self.config.max_waiting
            );
        }
        self.publisher
            .publish(process_id, ProcessStatus::Waiting)
            .await;
        Ok(queued)
    }

    async fn enqueue_locked(&self, process_id: &str) -> Result<EnqueueResult, ProcessError> {
        let mut record = self.require(process_id).await?;
        check_transition(&record, ProcessStatus::Waiting)?;
        record.status = ProcessStatus::Waiting;
        self.repository.put_process(&record).await?;
        let length = self.repository.push_waiting(process_id).await?;
        Ok(EnqueueResult {
            position: length,
            wait_queue_length: length,
        })
    }

    /// Start the oldest eligible waiting process. With `strict`, queue
    /// conditions are errors instead of data.
    pub async fn dequeue_process(
        &self,
        strict: bool,
    ) -> Result<ProcessExecutionResult, ProcessError> {
        let result = self.dequeue_next(DequeueMode::Direct).await?;
        if !strict {
            return Ok(result);
        }
        match result {
            ProcessExecutionResult::QueueEmpty => Err(ProcessError::QueueEmpty),
            ProcessExecutionResult::QueueFull { running, limit } => {
                Err(ProcessError::QueueFull { running, limit })
            }
            started => Ok(started),
        }
    }

    async fn dequeue_next(&self, mode: DequeueMode) -> Result<ProcessExecutionResult, ProcessError> {
        let limit = self.config.max_running;
        let running = self.repository.running_len().await?;
        if running >= limit {
            return Ok(ProcessExecutionResult::QueueFull { running, limit });
        }

        // Bounded by the candidates present now; late arrivals wait for the next attempt.
        let budget = self.repository.waiting_len().await? + 1;
        for _ in 0..budget {
            let Some(process_id) = self.repository.pop_waiting().await? else {
                return Ok(ProcessExecutionResult::QueueEmpty);
            };
            let record = match self.repository.get_process(&process_id).await? {
                Some(record) if record.status == ProcessStatus::Waiting => record,
                Some(record) => {
                    log::warn!(
                        "dequeue_skip_stale process_id={} status={}",
                        process_id,
                        record.status
                    );
                    continue;
                }
                None => {
                    log::warn!("dequeue_skip_unknown process_id={}", process_id);
                    continue;
                }
            };

            match self.runtime.inspect_container(&record.container_id).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    log::warn!(
                        "dequeue_skip_missing_container process_id={} container_id={}",
                        process_id,
                        record.container_id
                    );
                    self.abandon_candidate(&process_id, &ProcessError::from(e))
                        .await;
                    continue;
                }
                Err(e) => {
                    self.requeue_candidate(&process_id).await?;
                    return Err(e.into());
                }
            }

            if !self
                .repository
                .claim_running_slot(&process_id, limit)
                .await?
            {
                self.requeue_candidate(&process_id).await?;
                let running = self.repository.running_len().await?;
                return Ok(ProcessExecutionResult::QueueFull { running, limit });
            }

            match self.execute(&record).await {
                Ok(process) => return Ok(ProcessExecutionResult::Started { process }),
                Err(e) => {
                    self.abandon_candidate(&process_id, &e).await;
                    if mode == DequeueMode::Direct {
                        // The freed slot still belongs to whoever waits behind.
                        self.spawn_cascade();
                        return Err(e);
                    }
                }
            }
        }

        log::debug!("dequeue_budget_exhausted budget={}", budget);
        Ok(ProcessExecutionResult::QueueEmpty)
    }

    /// Put a popped candidate back at the head unless it left WAITING meanwhile.
    async fn requeue_candidate(&self, process_id: &str) -> Result<(), ProcessError> {
        let lease = self.locks.acquire(process_id).await?;
        let result = self.requeue_locked(process_id).await;
        self.locks.release(lease).await?;
        result
    }

    async fn requeue_locked(&self, process_id: &str) -> Result<(), ProcessError> {
        match self.repository.get_process(process_id).await? {
            Some(record) if record.status == ProcessStatus::Waiting => {
                self.repository.requeue_front(process_id).await
            }
            Some(record) => {
                log::debug!(
                    "dequeue_requeue_skipped process_id={} status={}",
                    process_id,
                    record.status
                );
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Mark the record running, then start its container.
    async fn execute(&self, record: &ProcessRecord) -> Result<ProcessRecord, ProcessError> {
        let lease = self.locks.acquire(&record.id).await?;
        let marked = self.mark_running_locked(&record.id).await;
        self.locks.release(lease).await?;
        let process = marked?;

        self.runtime.start_container(&process.container_id).await?;
        log::info!(
            "process_started process_id={} container_id={}",
            process.id,
            process.container_id
        );
        self.publisher
            .publish(&process.id, ProcessStatus::Running)
            .await;
        Ok(process)
    }

    async fn mark_running_locked(&self, process_id: &str) -> Result<ProcessRecord, ProcessError> {
        let mut record = self.require(process_id).await?;
        if record.status != ProcessStatus::Waiting {
            return Err(ProcessError::InvalidTransition {
                process_id: process_id.to_string(),
                from: record.status,
                to: ProcessStatus::Running,
            });
        }
        record.status = ProcessStatus::Running;
        record.started_at = Some(Utc::now());
        self.repository.put_process(&record).await?;
        Ok(record)
    }

    /// Finalize a popped candidate that could not run and release any slot it holds.
    async fn abandon_candidate(&self, process_id: &str, cause: &ProcessError) {
        log::warn!(
            "process_candidate_abandoned process_id={} code={} error={}",
            process_id,
            cause.code(),
            cause
        );
        if let Err(e) = self.repository.remove_running(process_id).await {
            log::error!("release_running_slot_failed process_id={} error={}", process_id, e);
        }
        match self.finalize(process_id, ProcessStatus::Aborted).await {
            Ok((record, true)) => {
                self.notify_final(&record, false).await;
                self.schedule_cleanup(&record);
            }
            Ok((_, false)) => {}
            Err(e) => log::error!(
                "process_finalize_failed process_id={} code={} error={}",
                process_id,
                e.code(),
                e
            ),
        }
    }

    /// Move a non-terminal process to `outcome` (or ABORTED when `outcome` is not
    /// reachable). Returns the record and whether anything changed.
    async fn finalize(
        &self,
        process_id: &str,
        outcome: ProcessStatus,
    ) -> Result<(ProcessRecord, bool), ProcessError> {
        let lease = self.locks.acquire(process_id).await?;
        let result = self.finalize_locked(process_id, outcome).await;
        self.locks.release(lease).await?;
        if let Ok((record, _)) = &result {
            self.runtime.release_container(&record.container_id);
        }
        result
    }

    async fn finalize_locked(
        &self,
        process_id: &str,
        outcome: ProcessStatus,
    ) -> Result<(ProcessRecord, bool), ProcessError> {
        let mut record = self
            .repository
            .get_process(process_id)
            .await?
            .ok_or_else(|| ProcessError::UnknownProcess(process_id.to_string()))?;
        if record.status.is_terminal() {
            log::debug!(
                "process_already_final process_id={} status={}",
                process_id,
                record.status
            );
            return Ok((record, false));
        }

        let previous = record.status;
        record.status = if previous.can_transition_to(outcome) {
            outcome
        } else {
            ProcessStatus::Aborted
        };
        record.finished_at = Some(Utc::now());
        self.repository.put_process(&record).await?;

        if previous == ProcessStatus::Waiting {
            self.repository.remove_waiting(process_id).await?;
        }
        self.repository.remove_running(process_id).await?;
        self.repository.add_finished(process_id).await?;
        Ok((record, true))
    }

    /// Publish a fresh terminal state and, with `cascade`, try the next waiting process.
    async fn notify_final(&self, record: &ProcessRecord, cascade: bool) {
        log::info!(
            "process_finalized process_id={} status={}",
            record.id,
            record.status
        );
        self.publisher.publish(&record.id, record.status).await;
        if cascade {
            self.spawn_cascade();
        }
    }

    fn spawn_cascade(&self) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.cascade().await;
        });
    }

    async fn cascade(&self) {
        match self.dequeue_next(DequeueMode::Cascade).await {
            Ok(ProcessExecutionResult::Started { process }) => {
                log::info!("cascade_started process_id={}", process.id)
            }
            Ok(ProcessExecutionResult::QueueEmpty) => log::debug!("cascade_idle reason=empty"),
            Ok(ProcessExecutionResult::QueueFull { running, limit }) => log::debug!(
                "cascade_idle reason=full running={} limit={}",
                running,
                limit
            ),
            Err(e) => log::warn!("cascade_failed code={} error={}", e.code(), e),
        }
    }

    /// After the finalize delay, drop the index entry and optionally the container.
    fn schedule_cleanup(&self, record: &ProcessRecord) {
        let scheduler = self.clone();
        let process_id = record.id.clone();
        let container_id = record.container_id.clone();
        self.cleanup
            .schedule(record.id.as_str(), self.config.finalize_delay, async move {
                scheduler.cleanup_now(&process_id, &container_id).await;
            });
    }

    async fn cleanup_now(&self, process_id: &str, container_id: &str) {
        self.cleanup.cancel(process_id);
        if let Err(e) = self.repository.remove_container_process(container_id).await {
            log::warn!(
                "container_index_drop_failed process_id={} container_id={} error={}",
                process_id,
                container_id,
                e
            );
        }
        if !self.config.remove_finished_containers {
            return;
        }
        match self.runtime.remove_container(container_id).await {
            Ok(()) => log::debug!(
                "process_container_removed process_id={} container_id={}",
                process_id,
                container_id
            ),
            Err(e) if e.is_not_found() => {}
            Err(e) => log::warn!(
                "process_container_remove_failed process_id={} container_id={} code={} error={}",
                process_id,
                container_id,
                e.code(),
                e
            ),
        }
    }

    /// Stop a process. Queued processes abort right away; running ones get a
    /// graceful stop and finalize when the engine reports the exit.
    pub async fn stop_process(&self, process_id: &str) -> Result<ProcessRecord, ProcessError> {
        let record = self.require(process_id).await?;
        match record.status {
            ProcessStatus::Aborted | ProcessStatus::Finished => {
                log::debug!(
                    "process_stop_noop process_id={} status={}",
                    process_id,
                    record.status
                );
                Ok(record)
            }
            ProcessStatus::Created | ProcessStatus::Waiting => {
                let (record, changed) = self.finalize(process_id, ProcessStatus::Aborted).await?;
                if changed {
                    self.notify_final(&record, true).await;
                    self.cleanup_now(&record.id, &record.container_id).await;
                }
                Ok(record)
            }
            ProcessStatus::Running => {
                match self.runtime.stop_container(&record.container_id).await {
                    Ok(()) => {}
                    Err(RuntimeError::NotModified(_)) => {}
                    Err(e) if e.is_not_running() => {}
                    Err(e) if e.is_not_found() => {
                        // No event will ever arrive for a vanished container.
                        let (record, changed) =
                            self.finalize(process_id, ProcessStatus::Aborted).await?;
                        if changed {
                            self.notify_final(&record, true).await;
                            self.cleanup_now(&record.id, &record.container_id).await;
                        }
                        return Ok(record);
                    }
                    Err(e) => return Err(e.into()),
                }
                log::info!(
                    "process_stop_requested process_id={} container_id={}",
                    process_id,
                    record.container_id
                );
                Ok(record)
            }
        }
    }

    /// Create, enqueue and try to start in one call.
    ///
    /// Once enqueued the process is accepted: a full queue, or a dequeue failure
    /// on an older candidate, still yields [RunOutcome::Pending]. Only a failure
    /// that left this process terminal is returned as an error.
    pub async fn run_process_post(&self, spec: ProcessSpec) -> Result<RunOutcome, ProcessError> {
        let record = self.create_process(spec).await?;
        let queue = self.enqueue_process(&record.id).await?;
        let dequeued = self.dequeue_process(false).await;
        if let Ok(ProcessExecutionResult::Started { process }) = &dequeued {
            if process.id == record.id {
                return Ok(RunOutcome::Started {
                    process: process.clone(),
                });
            }
        }

        let process = self
            .repository
            .get_process(&record.id)
            .await?
            .unwrap_or(record);
        if let Err(e) = dequeued {
            if process.status.is_terminal() {
                return Err(e);
            }
            log::warn!(
                "run_process_post_dequeue_failed process_id={} code={} error={}",
                process.id,
                e.code(),
                e
            );
        }
        if process.status == ProcessStatus::Running {
            return Ok(RunOutcome::Started { process });
        }
        Ok(RunOutcome::Pending { process, queue })
    }

    pub async fn get_process_info(
        &self,
        process_id: &str,
        fields: Option<&str>,
    ) -> Result<Value, ProcessError> {
        let record = self.require(process_id).await?;
        project(&record, parse_fields(fields).as_deref())
    }

    pub async fn get_all_process_info(
        &self,
        query: &ProcessQuery,
    ) -> Result<Vec<Value>, ProcessError> {
        let records = self.repository.list_processes().await?;
        run_query(records, query)
    }

    pub async fn queue_status(&self) -> Result<QueueStatus, ProcessError> {
        Ok(QueueStatus {
            waiting: self.repository.waiting_len().await?,
            running: self.repository.running_len().await?,
            finished: self.repository.finished_len().await?,
            max_running: self.config.max_running,
            max_waiting: self.config.max_waiting,
        })
    }

    pub async fn list_images(
        &self,
        options: &ImageListOptions,
    ) -> Result<Vec<ImageSummary>, ProcessError> {
        Ok(self.runtime.list_images(options).await?)
    }

    pub async fn get_image(&self, image_id: &str) -> Result<ImageInfo, ProcessError> {
        Ok(self.runtime.get_image(image_id).await?)
    }

    /// Feed `receiver` into this scheduler until every sender is dropped.
    pub fn spawn_event_loop(&self, receiver: mpsc::Receiver<ProcessEvent>) -> JoinHandle<u64> {
        tokio::spawn(run_dispatcher(Arc::new(self.clone()), receiver))
    }

    async fn require(&self, process_id: &str) -> Result<ProcessRecord, ProcessError> {
        self.repository
            .get_process(process_id)
            .await?
            .ok_or_else(|| ProcessError::NotFound(process_id.to_string()))
    }

    async fn on_container_started(&self, event: &ProcessEvent) -> Result<(), ProcessError> {
        let lease = self.locks.acquire(&event.process_id).await?;
        let result = self.confirm_started_locked(&event.process_id).await;
        self.locks.release(lease).await?;
        result
    }

    async fn confirm_started_locked(&self, process_id: &str) -> Result<(), ProcessError> {
        let mut record = self
            .repository
            .get_process(process_id)
            .await?
            .ok_or_else(|| ProcessError::UnknownProcess(process_id.to_string()))?;
        if record.status != ProcessStatus::Running {
            log::debug!(
                "container_start_ignored process_id={} status={}",
                process_id,
                record.status
            );
            return Ok(());
        }
        if record.started_at.is_none() {
            record.started_at = Some(Utc::now());
            self.repository.put_process(&record).await?;
        }
        self.repository.add_running(process_id).await?;
        Ok(())
    }

    async fn on_container_exit(
        &self,
        event: &ProcessEvent,
        outcome: ProcessStatus,
    ) -> Result<(), ProcessError> {
        let (record, changed) = self.finalize(&event.process_id, outcome).await?;
        if !changed {
            log::debug!(
                "process_event_noop process_id={} event={} status={}",
                record.id,
                event.kind.as_str(),
                record.status
            );
            return Ok(());
        }
        if let Some(code) = event.exit_code {
            log::debug!("process_exit_code process_id={} exit_code={}", record.id, code);
        }
        self.notify_final(&record, true).await;
        self.schedule_cleanup(&record);
        Ok(())
    }

    async fn on_container_destroyed(&self, event: &ProcessEvent) -> Result<(), ProcessError> {
        let (record, changed) = self
            .finalize(&event.process_id, ProcessStatus::Aborted)
            .await?;
        // The container is already gone; only the index entry remains.
        self.cleanup.cancel(&record.id);
        self.repository
            .remove_container_process(&event.container_id)
            .await?;
        if changed {
            self.notify_final(&record, true).await;
        }
        Ok(())
    }
}

fn check_transition(record: &ProcessRecord, to: ProcessStatus) -> Result<(), ProcessError> {
    if record.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(ProcessError::InvalidTransition {
            process_id: record.id.clone(),
            from: record.status,
            to,
        })
    }
}

#[async_trait]
impl ProcessEventHandler for ProcessScheduler {
    async fn handle_event(&self, event: ProcessEvent) -> Result<(), ProcessError> {
        match event.kind {
            ProcessEventKind::ContainerStarted => self.on_container_started(&event).await,
            ProcessEventKind::ContainerDied => {
                self.on_container_exit(&event, ProcessStatus::Finished).await
            }
            ProcessEventKind::ContainerKilled => {
                self.on_container_exit(&event, ProcessStatus::Aborted).await
            }
            ProcessEventKind::ContainerDestroyed => self.on_container_destroyed(&event).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use futures::future::join_all;

    use super::*;
    use crate::container::{ContainerInfo, ContainerState};
    use crate::process::memory_repository::InMemoryProcessRepository;
    use crate::process::publisher::BroadcastPublisher;

    #[derive(Default)]
    struct FakeState {
        next_id: u64,
        containers: HashMap<String, &'static str>,
        fail_start: HashSet<String>,
        started: Vec<String>,
        stopped: Vec<String>,
        removed: Vec<String>,
        released: Vec<String>,
    }

    #[derive(Default)]
    struct FakeRuntime {
        state: Mutex<FakeState>,
    }

    impl FakeRuntime {
        fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
            self.state.lock().expect("fake runtime lock")
        }

        fn vanish(&self, container_id: &str) {
            self.state().containers.remove(container_id);
        }

        fn fail_start(&self, container_id: &str) {
            self.state().fail_start.insert(container_id.to_string());
        }

        fn missing(id: &str) -> RuntimeError {
            RuntimeError::NotFound(format!("No such container: {id}"))
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn ping(&self) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn create_container(&self, _spec: &ContainerSpec) -> Result<String, RuntimeError> {
            // Let concurrent callers interleave here, as a real engine round trip would.
            tokio::task::yield_now().await;
            let mut state = self.state();
            state.next_id += 1;
            let id = format!("c{}", state.next_id);
            state.containers.insert(id.clone(), "created");
            Ok(id)
        }

        async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
            let mut state = self.state();
            if state.fail_start.contains(id) {
                return Err(RuntimeError::Internal("start refused".into()));
            }
            match state.containers.get_mut(id) {
                Some(status) => *status = "running",
                None => return Err(Self::missing(id)),
            }
            state.started.push(id.to_string());
            Ok(())
        }

        async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
            let mut state = self.state();
            match state.containers.get_mut(id) {
                Some(status) if *status == "running" => *status = "exited",
                Some(_) => return Err(RuntimeError::NotModified("already stopped".into())),
                None => return Err(Self::missing(id)),
            }
            state.stopped.push(id.to_string());
            Ok(())
        }

        async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
            self.stop_container(id).await
        }

        async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
            let mut state = self.state();
            if state.containers.remove(id).is_none() {
                return Err(Self::missing(id));
            }
            state.removed.push(id.to_string());
            Ok(())
        }

        async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
            let state = self.state();
            let status = state.containers.get(id).ok_or_else(|| Self::missing(id))?;
            Ok(ContainerInfo {
                id: id.to_string(),
                state: ContainerState {
                    status: status.to_string(),
                    running: *status == "running",
                    ..ContainerState::default()
                },
                ..ContainerInfo::default()
            })
        }

        async fn list_images(
            &self,
            _options: &ImageListOptions,
        ) -> Result<Vec<ImageSummary>, RuntimeError> {
            Ok(Vec::new())
        }

        async fn get_image(&self, id: &str) -> Result<ImageInfo, RuntimeError> {
            Err(RuntimeError::NotFound(format!("No such image: {id}")))
        }

        fn release_container(&self, id: &str) {
            self.state().released.push(id.to_string());
        }
    }

    struct Harness {
        scheduler: ProcessScheduler,
        runtime: Arc<FakeRuntime>,
        repository: Arc<InMemoryProcessRepository>,
        publisher: Arc<BroadcastPublisher>,
    }

    fn harness(max_running: usize) -> Harness {
        harness_with(SchedulerConfig {
            max_running,
            finalize_delay: Duration::from_millis(20),
            ..SchedulerConfig::default()
        })
    }

    fn harness_with(config: SchedulerConfig) -> Harness {
        let runtime = Arc::new(FakeRuntime::default());
        let repository = Arc::new(InMemoryProcessRepository::new());
        let publisher = Arc::new(BroadcastPublisher::new(64));
        let scheduler =
            ProcessScheduler::new(runtime.clone(), repository.clone(), publisher.clone(), config);
        Harness {
            scheduler,
            runtime,
            repository,
            publisher,
        }
    }

    impl Harness {
        async fn queued(&self, id: &str) -> ProcessRecord {
            let record = self
                .scheduler
                .create_process(ProcessSpec::new("tool/foo").with_id(id))
                .await
                .expect("create");
            self.scheduler.enqueue_process(id).await.expect("enqueue");
            record
        }

        async fn status(&self, id: &str) -> ProcessStatus {
            self.repository
                .get_process(id)
                .await
                .expect("get")
                .expect("record")
                .status
        }

        async fn wait_for(&self, id: &str, status: ProcessStatus) {
            for _ in 0..100 {
                if self.status(id).await == status {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("{id} never reached {status}");
        }

        async fn event(&self, id: &str, kind: ProcessEventKind) {
            let record = self
                .repository
                .get_process(id)
                .await
                .expect("get")
                .expect("record");
            self.scheduler
                .handle_event(ProcessEvent::new(id, record.container_id, kind))
                .await
                .expect("handle event");
        }
    }

    #[tokio::test]
    async fn limit_one_cascades_to_next_waiting_process() {
        let h = harness(1);
        h.queued("a").await;
        h.queued("b").await;

        let started = h.scheduler.dequeue_process(true).await.expect("dequeue");
        assert_eq!(started.started().map(|p| p.id.as_str()), Some("a"));
        assert_eq!(h.status("b").await, ProcessStatus::Waiting);
        assert!(matches!(
            h.scheduler.dequeue_process(true).await,
            Err(ProcessError::QueueFull { running: 1, limit: 1 })
        ));

        h.event("a", ProcessEventKind::ContainerDied).await;
        assert_eq!(h.status("a").await, ProcessStatus::Finished);
        h.wait_for("b", ProcessStatus::Running).await;
        assert_eq!(h.repository.running_len().await.expect("len"), 1);
        assert!(h.repository.is_finished("a").await.expect("finished"));
    }

    #[tokio::test]
    async fn dequeue_is_fifo() {
        let h = harness(3);
        for id in ["a", "b", "c"] {
            h.queued(id).await;
        }
        let mut order = Vec::new();
        for _ in 0..3 {
            let result = h.scheduler.dequeue_process(true).await.expect("dequeue");
            order.push(result.started().expect("started").id.clone());
        }
        assert_eq!(order, ["a", "b", "c"]);
        assert!(matches!(
            h.scheduler.dequeue_process(false).await,
            Ok(ProcessExecutionResult::QueueFull { .. })
        ));
    }

    #[tokio::test]
    async fn empty_queue_is_distinct_from_full_queue() {
        let h = harness(2);
        assert!(matches!(
            h.scheduler.dequeue_process(true).await,
            Err(ProcessError::QueueEmpty)
        ));
        assert_eq!(
            h.scheduler.dequeue_process(false).await.expect("data"),
            ProcessExecutionResult::QueueEmpty
        );
    }

    #[tokio::test]
    async fn dequeue_skips_candidates_whose_container_vanished() {
        let h = harness(2);
        let a = h.queued("a").await;
        h.queued("b").await;
        h.runtime.vanish(&a.container_id);

        let result = h.scheduler.dequeue_process(true).await.expect("dequeue");
        assert_eq!(result.started().map(|p| p.id.as_str()), Some("b"));
        assert_eq!(h.status("a").await, ProcessStatus::Aborted);
        assert!(!h.repository.is_running("a").await.expect("running"));
        assert!(h.repository.is_finished("a").await.expect("finished"));
    }

    #[tokio::test]
    async fn start_failure_during_cascade_aborts_candidate_and_continues() {
        let h = harness(1);
        h.queued("a").await;
        let b = h.queued("b").await;
        h.queued("c").await;
        h.runtime.fail_start(&b.container_id);

        h.scheduler.dequeue_process(true).await.expect("dequeue a");
        h.event("a", ProcessEventKind::ContainerDied).await;

        h.wait_for("c", ProcessStatus::Running).await;
        assert_eq!(h.status("b").await, ProcessStatus::Aborted);
        assert!(!h.repository.is_running("b").await.expect("running"));
        assert_eq!(h.repository.running_len().await.expect("len"), 1);
    }

    #[tokio::test]
    async fn direct_dequeue_reports_start_failure_and_releases_slot() {
        let h = harness(1);
        let a = h.queued("a").await;
        h.runtime.fail_start(&a.container_id);

        let err = h.scheduler.dequeue_process(true).await.expect_err("start fails");
        assert_eq!(err.code(), "INTERNAL");
        assert_eq!(h.status("a").await, ProcessStatus::Aborted);
        assert_eq!(h.repository.running_len().await.expect("len"), 0);
    }

    #[tokio::test]
    async fn direct_start_failure_still_cascades_to_next_waiter() {
        let h = harness(1);
        let a = h.queued("a").await;
        h.queued("b").await;
        h.runtime.fail_start(&a.container_id);

        let err = h.scheduler.dequeue_process(true).await.expect_err("start fails");
        assert_eq!(err.code(), "INTERNAL");
        assert_eq!(h.status("a").await, ProcessStatus::Aborted);

        h.wait_for("b", ProcessStatus::Running).await;
        assert_eq!(h.repository.running_len().await.expect("len"), 1);
        assert_eq!(h.repository.waiting_len().await.expect("len"), 0);
    }

    #[tokio::test]
    async fn requeue_skips_candidate_that_left_waiting() {
        let h = harness(1);
        h.queued("a").await;
        assert_eq!(
            h.repository.pop_waiting().await.expect("pop").as_deref(),
            Some("a")
        );
        h.scheduler.stop_process("a").await.expect("stop");
        h.scheduler.requeue_candidate("a").await.expect("requeue");
        assert!(h.repository.waiting_ids().await.expect("ids").is_empty());

        h.queued("b").await;
        h.repository.pop_waiting().await.expect("pop");
        h.scheduler.requeue_candidate("b").await.expect("requeue");
        assert_eq!(h.repository.waiting_ids().await.expect("ids"), ["b"]);
    }

    #[tokio::test]
    async fn concurrent_dequeues_never_exceed_limit() {
        let h = harness(2);
        for id in ["a", "b", "c", "d", "e"] {
            h.queued(id).await;
        }
        let results = join_all((0..5).map(|_| h.scheduler.dequeue_process(false))).await;
        let started = results
            .iter()
            .filter(|r| matches!(r, Ok(ProcessExecutionResult::Started { .. })))
            .count();
        assert_eq!(started, 2);
        assert_eq!(h.repository.running_len().await.expect("len"), 2);
        assert_eq!(h.repository.waiting_len().await.expect("len"), 3);
    }

    #[tokio::test]
    async fn stop_waiting_process_aborts_and_leaves_queue() {
        let h = harness(1);
        let a = h.queued("a").await;
        let stopped = h.scheduler.stop_process("a").await.expect("stop");
        assert_eq!(stopped.status, ProcessStatus::Aborted);
        assert!(h.repository.waiting_ids().await.expect("ids").is_empty());
        assert_eq!(
            h.repository
                .get_container_process(&a.container_id)
                .await
                .expect("lookup"),
            None
        );
        assert!(h.runtime.state().removed.contains(&a.container_id));
    }

    #[tokio::test]
    async fn stop_terminal_process_is_noop() {
        let h = harness(1);
        h.queued("a").await;
        let aborted = h.scheduler.stop_process("a").await.expect("stop");
        let again = h.scheduler.stop_process("a").await.expect("stop again");
        assert_eq!(aborted, again);
    }

    #[tokio::test]
    async fn stop_running_process_waits_for_engine_confirmation() {
        let h = harness(1);
        let a = h.queued("a").await;
        h.scheduler.dequeue_process(true).await.expect("dequeue");

        let record = h.scheduler.stop_process("a").await.expect("stop");
        assert_eq!(record.status, ProcessStatus::Running);
        assert_eq!(h.runtime.state().stopped, [a.container_id.clone()]);

        h.event("a", ProcessEventKind::ContainerKilled).await;
        assert_eq!(h.status("a").await, ProcessStatus::Aborted);
    }

    #[tokio::test]
    async fn kill_after_die_changes_nothing() {
        let h = harness(1);
        h.queued("a").await;
        h.scheduler.dequeue_process(true).await.expect("dequeue");
        h.event("a", ProcessEventKind::ContainerDied).await;
        let finished = h.repository.get_process("a").await.expect("get");

        h.event("a", ProcessEventKind::ContainerKilled).await;
        assert_eq!(h.repository.get_process("a").await.expect("get"), finished);
        assert_eq!(h.status("a").await, ProcessStatus::Finished);
    }

    #[tokio::test]
    async fn started_event_is_idempotent() {
        let h = harness(1);
        h.queued("a").await;
        h.scheduler.dequeue_process(true).await.expect("dequeue");
        let before = h.repository.get_process("a").await.expect("get");
        h.event("a", ProcessEventKind::ContainerStarted).await;
        h.event("a", ProcessEventKind::ContainerStarted).await;
        assert_eq!(h.repository.get_process("a").await.expect("get"), before);
        assert_eq!(h.repository.running_len().await.expect("len"), 1);
    }

    #[tokio::test]
    async fn destroy_drops_index_immediately_and_cancels_cleanup() {
        let h = harness(1);
        let a = h.queued("a").await;
        h.scheduler.dequeue_process(true).await.expect("dequeue");
        h.event("a", ProcessEventKind::ContainerDied).await;
        assert!(h.scheduler.pending_cleanups().is_pending("a"));

        h.event("a", ProcessEventKind::ContainerDestroyed).await;
        assert!(!h.scheduler.pending_cleanups().is_pending("a"));
        assert_eq!(
            h.repository
                .get_container_process(&a.container_id)
                .await
                .expect("lookup"),
            None
        );
        assert_eq!(h.status("a").await, ProcessStatus::Finished);
    }

    #[tokio::test]
    async fn destroy_of_waiting_process_aborts_it() {
        let h = harness(1);
        h.queued("a").await;
        h.event("a", ProcessEventKind::ContainerDestroyed).await;
        assert_eq!(h.status("a").await, ProcessStatus::Aborted);
        assert!(h.repository.waiting_ids().await.expect("ids").is_empty());
    }

    #[tokio::test]
    async fn delayed_cleanup_drops_index_and_removes_container() {
        let h = harness(1);
        let a = h.queued("a").await;
        h.scheduler.dequeue_process(true).await.expect("dequeue");
        h.event("a", ProcessEventKind::ContainerDied).await;
        assert_eq!(
            h.repository
                .get_container_process(&a.container_id)
                .await
                .expect("lookup")
                .as_deref(),
            Some("a")
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(
            h.repository
                .get_container_process(&a.container_id)
                .await
                .expect("lookup"),
            None
        );
        assert!(h.runtime.state().removed.contains(&a.container_id));
        assert_eq!(h.scheduler.pending_cleanups().pending_count(), 0);
    }

    #[tokio::test]
    async fn run_process_post_reports_started_then_pending() {
        let h = harness(1);
        let first = h
            .scheduler
            .run_process_post(ProcessSpec::new("tool/foo").with_id("a"))
            .await
            .expect("run a");
        assert!(first.is_started());

        let second = h
            .scheduler
            .run_process_post(ProcessSpec::new("tool/foo").with_id("b"))
            .await
            .expect("run b");
        match second {
            RunOutcome::Pending { process, queue } => {
                assert_eq!(process.status, ProcessStatus::Waiting);
                assert_eq!(queue.position, 1);
            }
            other => panic!("expected pending, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_process_post_accepts_despite_older_candidate_failure() {
        let h = harness(1);
        let a = h.queued("a").await;
        h.runtime.fail_start(&a.container_id);

        let outcome = h
            .scheduler
            .run_process_post(ProcessSpec::new("tool/foo").with_id("n"))
            .await
            .expect("accepted");
        assert_eq!(outcome.process().id, "n");
        assert_eq!(h.status("a").await, ProcessStatus::Aborted);
        h.wait_for("n", ProcessStatus::Running).await;
    }

    #[tokio::test]
    async fn run_process_post_returns_own_start_failure() {
        let h = harness(1);
        // First container the fake engine hands out.
        h.runtime.fail_start("c1");
        let err = h
            .scheduler
            .run_process_post(ProcessSpec::new("tool/foo").with_id("n"))
            .await
            .expect_err("own start fails");
        assert_eq!(err.code(), "INTERNAL");
        assert_eq!(h.status("n").await, ProcessStatus::Aborted);
    }

    #[tokio::test]
    async fn finalization_disarms_runtime_safety_net() {
        let h = harness_with(SchedulerConfig {
            max_running: 1,
            finalize_delay: Duration::from_millis(10),
            remove_finished_containers: false,
            ..SchedulerConfig::default()
        });
        let a = h.queued("a").await;
        h.scheduler.dequeue_process(true).await.expect("dequeue");
        h.event("a", ProcessEventKind::ContainerDied).await;
        assert_eq!(h.runtime.state().released, [a.container_id.clone()]);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(h.runtime.state().removed.is_empty());

        let b = h.queued("b").await;
        h.event("b", ProcessEventKind::ContainerDestroyed).await;
        assert!(h.runtime.state().released.contains(&b.container_id));
    }

    #[tokio::test]
    async fn concurrent_creates_with_same_id_keep_one_container() {
        let h = harness(1);
        let (first, second) = futures::future::join(
            h.scheduler
                .create_process(ProcessSpec::new("tool/foo").with_id("a")),
            h.scheduler
                .create_process(ProcessSpec::new("tool/foo").with_id("a")),
        )
        .await;

        let (winner, loser) = match (first, second) {
            (Ok(record), Err(e)) | (Err(e), Ok(record)) => (record, e),
            other => panic!("expected exactly one create to win, got {other:?}"),
        };
        assert_eq!(loser.code(), "BAD_REQUEST");

        let stored = h.repository.get_process("a").await.expect("get").expect("record");
        assert_eq!(stored.container_id, winner.container_id);
        assert_eq!(
            h.repository
                .get_container_process(&winner.container_id)
                .await
                .expect("lookup")
                .as_deref(),
            Some("a")
        );
        let removed = h.runtime.state().removed.clone();
        assert_eq!(removed.len(), 1);
        assert_ne!(removed[0], winner.container_id);
        assert_eq!(
            h.repository.get_container_process(&removed[0]).await.expect("lookup"),
            None
        );
    }

    #[tokio::test]
    async fn enqueue_reports_position_and_rejects_double_enqueue() {
        let h = harness(1);
        h.scheduler
            .create_process(ProcessSpec::new("tool/foo").with_id("a"))
            .await
            .expect("create");
        h.queued("b").await;
        let queued = h.scheduler.enqueue_process("a").await.expect("enqueue");
        assert_eq!(queued.position, 2);
        assert_eq!(queued.wait_queue_length, 2);

        let err = h.scheduler.enqueue_process("a").await.expect_err("twice");
        assert_eq!(err.code(), "CONFLICT");
        assert_eq!(
            h.scheduler
                .enqueue_process("ghost")
                .await
                .expect_err("unknown")
                .code(),
            "NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn duplicate_explicit_id_is_rejected() {
        let h = harness(1);
        h.queued("a").await;
        let err = h
            .scheduler
            .create_process(ProcessSpec::new("tool/foo").with_id("a"))
            .await
            .expect_err("duplicate");
        assert_eq!(err.code(), "BAD_REQUEST");
    }

    #[tokio::test]
    async fn derived_ids_differ_between_submissions() {
        let h = harness(1);
        let spec = ProcessSpec::new("tool/foo").with_requester("alice");
        let first = h.scheduler.create_process(spec.clone()).await.expect("first");
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = h.scheduler.create_process(spec).await.expect("second");
        assert_ne!(first.id, second.id);
        assert_eq!(first.id.len(), 64);
    }

    #[tokio::test]
    async fn process_info_projection_and_listing() {
        let h = harness(1);
        let a = h.queued("a").await;
        let info = h
            .scheduler
            .get_process_info("a", Some("status,containerId"))
            .await
            .expect("info");
        assert_eq!(
            info,
            serde_json::json!({"status": "WAITING", "containerId": a.container_id})
        );
        assert_eq!(
            h.scheduler
                .get_process_info("missing", None)
                .await
                .expect_err("missing")
                .code(),
            "NOT_FOUND"
        );

        let err = h
            .scheduler
            .get_all_process_info(&ProcessQuery::new().sorted_by("bogusField", "asc"))
            .await
            .expect_err("bad sort");
        assert_eq!(err.code(), "BAD_REQUEST");
        let all = h
            .scheduler
            .get_all_process_info(&ProcessQuery::new().with_status("WAITING"))
            .await
            .expect("list");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn every_transition_is_published() {
        let h = harness(1);
        let mut rx = h.publisher.subscribe();
        h.queued("a").await;
        h.scheduler.dequeue_process(true).await.expect("dequeue");
        h.event("a", ProcessEventKind::ContainerDied).await;

        let mut messages = Vec::new();
        for _ in 0..4 {
            messages.push(rx.recv().await.expect("message"));
        }
        assert_eq!(messages, ["a:CREATED", "a:WAITING", "a:RUNNING", "a:FINISHED"]);
    }

    #[tokio::test]
    async fn queue_status_reports_advisory_saturation() {
        let h = harness(1);
        let status = h.scheduler.queue_status().await.expect("status");
        assert_eq!(status.max_running, 1);
        assert!(!status.wait_queue_saturated());
        h.queued("a").await;
        assert_eq!(h.scheduler.queue_status().await.expect("status").waiting, 1);
    }

    #[tokio::test]
    async fn image_calls_pass_engine_errors_through() {
        let h = harness(1);
        assert!(h
            .scheduler
            .list_images(&ImageListOptions::default())
            .await
            .expect("list")
            .is_empty());
        let err = h.scheduler.get_image("nope").await.expect_err("missing");
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
