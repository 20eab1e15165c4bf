//! Typed process events and their dispatch.
//!
//! Events for the same process are handled one after another in arrival order.
//! Events for different processes are handled concurrently, and ingestion never
//! waits for a handler to finish.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::ProcessError;
use super::identity::{ContainerId, ProcessId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessEventKind {
    ContainerStarted,
    ContainerDied,
    ContainerKilled,
    ContainerDestroyed,
}

impl ProcessEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContainerStarted => "container-started",
            Self::ContainerDied => "container-died",
            Self::ContainerKilled => "container-killed",
            Self::ContainerDestroyed => "container-destroyed",
        }
    }
}

/// Runtime observation correlated to the process that owns the container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessEvent {
    pub process_id: ProcessId,
    pub container_id: ContainerId,
    pub kind: ProcessEventKind,
    /// Exit code reported with `die` events.
    pub exit_code: Option<i64>,
}

impl ProcessEvent {
    pub fn new(
        process_id: impl Into<ProcessId>,
        container_id: impl Into<ContainerId>,
        kind: ProcessEventKind,
    ) -> Self {
        Self {
            process_id: process_id.into(),
            container_id: container_id.into(),
            kind,
            exit_code: None,
        }
    }
}

#[async_trait]
pub trait ProcessEventHandler: Send + Sync + 'static {
    async fn handle_event(&self, event: ProcessEvent) -> Result<(), ProcessError>;
}

pub fn event_channel(
    capacity: usize,
) -> (mpsc::Sender<ProcessEvent>, mpsc::Receiver<ProcessEvent>) {
    mpsc::channel(capacity.max(1))
}

/// Drain `receiver` into `handler` until every sender is dropped. Returns the
/// number of events received.
pub async fn run_dispatcher<H>(handler: Arc<H>, mut receiver: mpsc::Receiver<ProcessEvent>) -> u64
where
    H: ProcessEventHandler,
{
    let mut in_flight: HashMap<ProcessId, JoinHandle<()>> = HashMap::new();
    let mut received = 0u64;

    while let Some(event) = receiver.recv().await {
        received += 1;
        in_flight.retain(|_, handle| !handle.is_finished());
        let previous = in_flight.remove(&event.process_id);
        let process_id = event.process_id.clone();
        let handler = Arc::clone(&handler);

        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                // Only ordering matters here; a panicked predecessor was already reported.
                let _ = previous.await;
            }
            let process_id = event.process_id.clone();
            let kind = event.kind;
            if let Err(e) = handler.handle_event(event).await {
                log::warn!(
                    "process_event_failed process_id={} event={} code={} error={}",
                    process_id,
                    kind.as_str(),
                    e.code(),
                    e
                );
            }
        });
        in_flight.insert(process_id, handle);
    }

    for (_, handle) in in_flight {
        let _ = handle.await;
    }
    log::info!("process_event_loop_stopped received={}", received);
    received
}
