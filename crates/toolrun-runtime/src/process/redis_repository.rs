//! Redis-backed process store shared by every scheduler instance.
//!
//! Layout under `{prefix}`:
//! - `{prefix}:processes` hash of process id to JSON record
//! - `{prefix}:containers` hash of container id to process id
//! - `{prefix}:queue:waiting` list; new ids enter on the left, the oldest leaves on the right
//! - `{prefix}:running`, `{prefix}:finished` sets
//! - `{prefix}:lock:{resource}` lease keys with a PX expiry

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};

use super::error::ProcessError;
use super::identity::ProcessId;
use super::models::ProcessRecord;
use super::repository::ProcessRepository;

const CLAIM_SLOT_SCRIPT: &str = r#"
if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then
  return 1
end
if redis.call('SCARD', KEYS[1]) < tonumber(ARGV[2]) then
  redis.call('SADD', KEYS[1], ARGV[1])
  return 1
end
return 0
"#;

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

fn store_error(e: RedisError) -> ProcessError {
    ProcessError::Store(e.to_string())
}

#[derive(Clone)]
pub struct RedisProcessRepository {
    connection: ConnectionManager,
    prefix: String,
    claim_slot: Script,
    release_lock: Script,
}

impl RedisProcessRepository {
    pub fn new(connection: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
            claim_slot: Script::new(CLAIM_SLOT_SCRIPT),
            release_lock: Script::new(RELEASE_LOCK_SCRIPT),
        }
    }

    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, ProcessError> {
        let client = redis::Client::open(url).map_err(store_error)?;
        let connection = ConnectionManager::new(client).await.map_err(store_error)?;
        Ok(Self::new(connection, prefix))
    }

    /// Shared connection, e.g. for a [crate::process::publisher::RedisPublisher].
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn processes_key(&self) -> String {
        self.key("processes")
    }

    fn containers_key(&self) -> String {
        self.key("containers")
    }

    fn waiting_key(&self) -> String {
        self.key("queue:waiting")
    }

    fn running_key(&self) -> String {
        self.key("running")
    }

    fn finished_key(&self) -> String {
        self.key("finished")
    }

    fn lock_key(&self, resource: &str) -> String {
        self.key(&format!("lock:{resource}"))
    }

    fn decode(id: &str, raw: &str) -> Result<ProcessRecord, ProcessError> {
        serde_json::from_str(raw)
            .map_err(|e| ProcessError::Store(format!("decode process {id}: {e}")))
    }
}

#[async_trait]
impl ProcessRepository for RedisProcessRepository {
    async fn get_process(&self, id: &str) -> Result<Option<ProcessRecord>, ProcessError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn
            .hget(self.processes_key(), id)
            .await
            .map_err(store_error)?;
        raw.map(|raw| Self::decode(id, &raw)).transpose()
    }

    async fn put_process(&self, record: &ProcessRecord) -> Result<(), ProcessError> {
        let raw = serde_json::to_string(record)
            .map_err(|e| ProcessError::Store(format!("encode process {}: {e}", record.id)))?;
        let mut conn = self.connection.clone();
        let _: i64 = conn
            .hset(self.processes_key(), &record.id, raw)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn insert_process(&self, record: &ProcessRecord) -> Result<bool, ProcessError> {
        let raw = serde_json::to_string(record)
            .map_err(|e| ProcessError::Store(format!("encode process {}: {e}", record.id)))?;
        let mut conn = self.connection.clone();
        conn.hset_nx(self.processes_key(), &record.id, raw)
            .await
            .map_err(store_error)
    }

    async fn list_processes(&self) -> Result<Vec<ProcessRecord>, ProcessError> {
        let mut conn = self.connection.clone();
        let raw: Vec<String> = conn.hvals(self.processes_key()).await.map_err(store_error)?;
        let mut records = raw
            .iter()
            .map(|raw| Self::decode("<list>", raw))
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn push_waiting(&self, id: &str) -> Result<usize, ProcessError> {
        let mut conn = self.connection.clone();
        let length: usize = conn
            .lpush(self.waiting_key(), id)
            .await
            .map_err(store_error)?;
        Ok(length)
    }

    async fn requeue_front(&self, id: &str) -> Result<(), ProcessError> {
        let mut conn = self.connection.clone();
        let _: usize = conn
            .rpush(self.waiting_key(), id)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn pop_waiting(&self) -> Result<Option<ProcessId>, ProcessError> {
        let mut conn = self.connection.clone();
        let id: Option<String> = conn
            .rpop(self.waiting_key(), None)
            .await
            .map_err(store_error)?;
        Ok(id)
    }

    async fn remove_waiting(&self, id: &str) -> Result<bool, ProcessError> {
        let mut conn = self.connection.clone();
        let removed: i64 = conn
            .lrem(self.waiting_key(), 0, id)
            .await
            .map_err(store_error)?;
        Ok(removed > 0)
    }

    async fn waiting_len(&self) -> Result<usize, ProcessError> {
        let mut conn = self.connection.clone();
        let length: usize = conn.llen(self.waiting_key()).await.map_err(store_error)?;
        Ok(length)
    }

    async fn waiting_ids(&self) -> Result<Vec<ProcessId>, ProcessError> {
        let mut conn = self.connection.clone();
        let mut ids: Vec<String> = conn
            .lrange(self.waiting_key(), 0, -1)
            .await
            .map_err(store_error)?;
        // Stored newest-first.
        ids.reverse();
        Ok(ids)
    }

    async fn claim_running_slot(&self, id: &str, limit: usize) -> Result<bool, ProcessError> {
        let mut conn = self.connection.clone();
        let claimed: i64 = self
            .claim_slot
            .key(self.running_key())
            .arg(id)
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(claimed == 1)
    }

    async fn add_running(&self, id: &str) -> Result<bool, ProcessError> {
        let mut conn = self.connection.clone();
        let added: i64 = conn
            .sadd(self.running_key(), id)
            .await
            .map_err(store_error)?;
        Ok(added > 0)
    }

    async fn remove_running(&self, id: &str) -> Result<bool, ProcessError> {
        let mut conn = self.connection.clone();
        let removed: i64 = conn
            .srem(self.running_key(), id)
            .await
            .map_err(store_error)?;
        Ok(removed > 0)
    }

    async fn running_len(&self) -> Result<usize, ProcessError> {
        let mut conn = self.connection.clone();
        let length: usize = conn.scard(self.running_key()).await.map_err(store_error)?;
        Ok(length)
    }

    async fn is_running(&self, id: &str) -> Result<bool, ProcessError> {
        let mut conn = self.connection.clone();
        let member: bool = conn
            .sismember(self.running_key(), id)
            .await
            .map_err(store_error)?;
        Ok(member)
    }

    async fn add_finished(&self, id: &str) -> Result<bool, ProcessError> {
        let mut conn = self.connection.clone();
        let added: i64 = conn
            .sadd(self.finished_key(), id)
            .await
            .map_err(store_error)?;
        Ok(added > 0)
    }

    async fn is_finished(&self, id: &str) -> Result<bool, ProcessError> {
        let mut conn = self.connection.clone();
        let member: bool = conn
            .sismember(self.finished_key(), id)
            .await
            .map_err(store_error)?;
        Ok(member)
    }

    async fn finished_len(&self) -> Result<usize, ProcessError> {
        let mut conn = self.connection.clone();
        let length: usize = conn.scard(self.finished_key()).await.map_err(store_error)?;
        Ok(length)
    }

    async fn set_container_process(
        &self,
        container_id: &str,
        process_id: &str,
    ) -> Result<(), ProcessError> {
        let mut conn = self.connection.clone();
        let _: i64 = conn
            .hset(self.containers_key(), container_id, process_id)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn get_container_process(
        &self,
        container_id: &str,
    ) -> Result<Option<ProcessId>, ProcessError> {
        let mut conn = self.connection.clone();
        let id: Option<String> = conn
            .hget(self.containers_key(), container_id)
            .await
            .map_err(store_error)?;
        Ok(id)
    }

    async fn remove_container_process(&self, container_id: &str) -> Result<bool, ProcessError> {
        let mut conn = self.connection.clone();
        let removed: i64 = conn
            .hdel(self.containers_key(), container_id)
            .await
            .map_err(store_error)?;
        Ok(removed > 0)
    }

    async fn try_acquire_lock(
        &self,
        resource: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, ProcessError> {
        let mut conn = self.connection.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(resource))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(reply.is_some())
    }

    async fn release_lock(&self, resource: &str, token: &str) -> Result<bool, ProcessError> {
        let mut conn = self.connection.clone();
        let released: i64 = self
            .release_lock
            .key(self.lock_key(resource))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(released == 1)
    }

    async fn ping(&self) -> Result<(), ProcessError> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        if pong != "PONG" {
            return Err(ProcessError::Store(format!("unexpected PING reply: {pong}")));
        }
        Ok(())
    }
}
