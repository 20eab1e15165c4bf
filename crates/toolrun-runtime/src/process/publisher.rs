//! Process state broadcast for external observers.
//!
//! Publishing is fire-and-forget: no delivery guarantee and no backpressure.
//! The scheduler never consumes its own messages.

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::models::ProcessStatus;

/// Default channel name for state messages.
pub const STATE_CHANNEL: &str = "process-status";

/// Compact `"<id>:<STATUS>"` wire form.
pub fn format_state_message(process_id: &str, status: ProcessStatus) -> String {
    format!("{process_id}:{status}")
}

/// Inverse of [format_state_message]; splits on the last `:`.
pub fn parse_state_message(message: &str) -> Option<(String, ProcessStatus)> {
    let (id, status) = message.rsplit_once(':')?;
    Some((id.to_string(), status.parse().ok()?))
}

#[async_trait]
pub trait StatePublisher: Send + Sync {
    /// Never fails; delivery problems are logged.
    async fn publish(&self, process_id: &str, status: ProcessStatus);
}

/// In-process publisher over a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<String>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl StatePublisher for BroadcastPublisher {
    async fn publish(&self, process_id: &str, status: ProcessStatus) {
        let message = format_state_message(process_id, status);
        // No subscribers is not an error.
        let _ = self.sender.send(message);
        log::debug!("process_state_published process_id={} status={}", process_id, status);
    }
}

#[cfg(feature = "redis-store")]
pub use redis_publisher::RedisPublisher;

#[cfg(feature = "redis-store")]
mod redis_publisher {
    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;

    use super::{format_state_message, StatePublisher};
    use crate::process::models::ProcessStatus;

    /// Publishes on a Redis pub/sub channel shared by every scheduler instance.
    #[derive(Clone)]
    pub struct RedisPublisher {
        connection: ConnectionManager,
        channel: String,
    }

    impl RedisPublisher {
        pub fn new(connection: ConnectionManager, channel: impl Into<String>) -> Self {
            Self {
                connection,
                channel: channel.into(),
            }
        }

        pub fn channel(&self) -> &str {
            &self.channel
        }
    }

    #[async_trait]
    impl StatePublisher for RedisPublisher {
        async fn publish(&self, process_id: &str, status: ProcessStatus) {
            let message = format_state_message(process_id, status);
            let mut connection = self.connection.clone();
            let result: redis::RedisResult<i64> =
                connection.publish(&self.channel, &message).await;
            if let Err(e) = result {
                log::warn!(
                    "process_state_publish_failed channel={} message={} error={}",
                    self.channel,
                    message,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_compact_messages() {
        let publisher = BroadcastPublisher::new(8);
        let mut rx = publisher.subscribe();
        publisher.publish("abc", ProcessStatus::Waiting).await;
        publisher.publish("abc", ProcessStatus::Running).await;

        assert_eq!(rx.recv().await.expect("first"), "abc:WAITING");
        assert_eq!(rx.recv().await.expect("second"), "abc:RUNNING");
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_silent() {
        let publisher = BroadcastPublisher::default();
        publisher.publish("abc", ProcessStatus::Created).await;
    }

    #[test]
    fn message_parse_inverts_format() {
        let message = format_state_message("p-1", ProcessStatus::Aborted);
        assert_eq!(
            parse_state_message(&message),
            Some(("p-1".to_string(), ProcessStatus::Aborted))
        );
        assert_eq!(parse_state_message("garbage"), None);
    }
}
