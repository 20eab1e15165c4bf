//! Runtime event feed.
//!
//! The engine's `/events` body is an endless sequence of JSON records, not one
//! document. [JsonRecordDecoder] splits it incrementally; a malformed record is
//! reported and skipped up to the next newline without ending the stream.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::process::dispatch::{ProcessEvent, ProcessEventKind};
use crate::process::repository::ProcessRepository;

use super::client::{check_status, DockerClient};
use super::error::{RuntimeError, RuntimeOperation};
use super::models::RuntimeEventRecord;

/// Incremental decoder for concatenated JSON values.
#[derive(Debug, Default)]
pub struct JsonRecordDecoder {
    buf: Vec<u8>,
    skipping: bool,
}

impl JsonRecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every value completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Value, serde_json::Error>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            if self.skipping {
                match self.buf.iter().position(|b| *b == b'\n') {
                    Some(pos) => {
                        self.buf.drain(..=pos);
                        self.skipping = false;
                    }
                    None => {
                        self.buf.clear();
                        break;
                    }
                }
            }

            let start = self
                .buf
                .iter()
                .position(|b| !b.is_ascii_whitespace())
                .unwrap_or(self.buf.len());
            self.buf.drain(..start);
            if self.buf.is_empty() {
                break;
            }

            let (next, consumed) = {
                let mut values = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
                let next = values.next();
                (next, values.byte_offset())
            };
            match next {
                Some(Ok(value)) => {
                    self.buf.drain(..consumed);
                    out.push(Ok(value));
                }
                // Incomplete record; wait for more bytes.
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => {
                    out.push(Err(e));
                    self.skipping = true;
                }
                None => break,
            }
        }
        out
    }

    /// Bytes held back waiting for the rest of a record.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Container lifecycle actions the scheduler cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeEventKind {
    Create,
    Start,
    Die,
    Kill,
    Destroy,
}

impl RuntimeEventKind {
    /// Parses `action`, ignoring any `: detail` suffix.
    pub fn from_action(action: &str) -> Option<Self> {
        let verb = action.split(':').next().unwrap_or(action).trim();
        match verb {
            "create" => Some(Self::Create),
            "start" => Some(Self::Start),
            "die" => Some(Self::Die),
            "kill" => Some(Self::Kill),
            "destroy" => Some(Self::Destroy),
            _ => None,
        }
    }

    /// `create` carries no state change.
    pub fn process_event(&self) -> Option<ProcessEventKind> {
        match self {
            Self::Create => None,
            Self::Start => Some(ProcessEventKind::ContainerStarted),
            Self::Die => Some(ProcessEventKind::ContainerDied),
            Self::Kill => Some(ProcessEventKind::ContainerKilled),
            Self::Destroy => Some(ProcessEventKind::ContainerDestroyed),
        }
    }
}

type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>;

/// Decoded view over one open `/events` response.
pub struct RuntimeEventStream {
    body: ChunkStream,
    decoder: JsonRecordDecoder,
    ready: VecDeque<RuntimeEventRecord>,
    malformed: u64,
}

impl RuntimeEventStream {
    fn new(body: ChunkStream) -> Self {
        Self {
            body,
            decoder: JsonRecordDecoder::new(),
            ready: VecDeque::new(),
            malformed: 0,
        }
    }

    /// Next decoded record; `None` once the engine closes the stream.
    pub async fn next_record(&mut self) -> Option<Result<RuntimeEventRecord, RuntimeError>> {
        loop {
            if let Some(record) = self.ready.pop_front() {
                return Some(Ok(record));
            }
            let chunk = match self.body.next().await? {
                Ok(chunk) => chunk,
                Err(e) => {
                    return Some(Err(RuntimeError::Unavailable(format!(
                        "event stream interrupted: {e}"
                    ))))
                }
            };
            for decoded in self.decoder.push(&chunk) {
                match decoded.and_then(serde_json::from_value::<RuntimeEventRecord>) {
                    Ok(record) => self.ready.push_back(record),
                    Err(e) => {
                        self.malformed += 1;
                        log::warn!("runtime_event_malformed error={}", e);
                    }
                }
            }
        }
    }

    /// Records dropped because they could not be decoded.
    pub fn malformed(&self) -> u64 {
        self.malformed
    }
}

impl DockerClient {
    /// Open the engine event feed, filtered to container events.
    pub async fn events(&self) -> Result<RuntimeEventStream, RuntimeError> {
        let filters = serde_json::json!({ "type": ["container"] }).to_string();
        let response = self
            .stream_request("/events")
            .query(&[("filters", filters)])
            .send()
            .await
            .map_err(|e| RuntimeError::from_transport(RuntimeOperation::Events, &e))?;
        let response = check_status(RuntimeOperation::Events, response).await?;
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()));
        Ok(RuntimeEventStream::new(Box::pin(body)))
    }
}

/// Counters reported when the feed ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub decoded: u64,
    pub dispatched: u64,
    pub ignored: u64,
    pub malformed: u64,
}

/// Correlates container events to processes and forwards them to the scheduler.
///
/// Connection loss ends [RuntimeEventConsumer::run]; reconnecting is left to
/// whoever owns the consumer.
pub struct RuntimeEventConsumer {
    client: DockerClient,
    repository: Arc<dyn ProcessRepository>,
    sink: mpsc::Sender<ProcessEvent>,
}

impl RuntimeEventConsumer {
    pub fn new(
        client: DockerClient,
        repository: Arc<dyn ProcessRepository>,
        sink: mpsc::Sender<ProcessEvent>,
    ) -> Self {
        Self {
            client,
            repository,
            sink,
        }
    }

    pub async fn run(&self) -> Result<ConsumerStats, RuntimeError> {
        let mut stream = self.client.events().await?;
        log::info!("runtime_event_stream_open");
        let mut stats = ConsumerStats::default();

        while let Some(next) = stream.next_record().await {
            let record = match next {
                Ok(record) => record,
                Err(e) => {
                    stats.malformed = stream.malformed();
                    log::warn!("runtime_event_stream_lost error={}", e);
                    return Err(e);
                }
            };
            stats.decoded += 1;
            match self.route(&record).await? {
                Routed::Dispatched => stats.dispatched += 1,
                Routed::Ignored => stats.ignored += 1,
                Routed::Logged => {}
            }
        }

        stats.malformed = stream.malformed();
        log::info!(
            "runtime_event_stream_closed decoded={} dispatched={} ignored={} malformed={}",
            stats.decoded,
            stats.dispatched,
            stats.ignored,
            stats.malformed
        );
        Ok(stats)
    }

    async fn route(&self, record: &RuntimeEventRecord) -> Result<Routed, RuntimeError> {
        if record.kind != "container" {
            return Ok(Routed::Ignored);
        }
        let (Some(kind), Some(container_id)) = (
            RuntimeEventKind::from_action(&record.action),
            record.container_id(),
        ) else {
            return Ok(Routed::Ignored);
        };

        let process_id = match self.repository.get_container_process(container_id).await {
            Ok(Some(process_id)) => process_id,
            // Not one of ours.
            Ok(None) => return Ok(Routed::Ignored),
            Err(e) => {
                log::warn!(
                    "runtime_event_lookup_failed container_id={} action={} error={}",
                    container_id,
                    record.action,
                    e
                );
                return Ok(Routed::Ignored);
            }
        };

        let Some(event_kind) = kind.process_event() else {
            log::info!(
                "container_created process_id={} container_id={}",
                process_id,
                container_id
            );
            return Ok(Routed::Logged);
        };

        let mut event = ProcessEvent::new(process_id, container_id, event_kind);
        event.exit_code = record
            .actor
            .attributes
            .get("exitCode")
            .and_then(|code| code.parse().ok());
        log::debug!(
            "runtime_event process_id={} container_id={} event={}",
            event.process_id,
            event.container_id,
            event_kind.as_str()
        );
        self.sink
            .send(event)
            .await
            .map_err(|_| RuntimeError::Internal("process event channel closed".into()))?;
        Ok(Routed::Dispatched)
    }
}

enum Routed {
    Dispatched,
    Ignored,
    Logged,
}
