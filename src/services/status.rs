//! Authoritative status channel: worker → status stream → status consumer.

use async_trait::async_trait;
use redis::streams::StreamReadReply;
use tracing::debug;

use crate::models::status::StatusUpdate;
use crate::services::queue::QueueError;
use crate::services::topology::Topology;

/// Durable, at-least-once publisher of project state transitions.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(&self, update: &StatusUpdate) -> Result<(), QueueError>;
}

/// A status message read by one consumer, pending until acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusDelivery {
    pub message_id: String,
    pub payload: String,
}

impl StatusDelivery {
    pub fn update(&self) -> Result<StatusUpdate, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// Redis Streams implementation of both ends of the status queue.
#[derive(Clone)]
pub struct StatusChannel {
    client: redis::Client,
    topology: Topology,
}

impl StatusChannel {
    pub fn new(client: redis::Client, topology: Topology) -> Self {
        Self { client, topology }
    }

    fn group(&self) -> Result<&str, QueueError> {
        self.topology
            .status
            .group
            .as_deref()
            .ok_or_else(|| QueueError::TopologyMissing("status queue has no consumer group".to_string()))
    }

    /// Next message for `consumer`.
    ///
    /// Entries this consumer read but never acknowledged come first, so an
    /// unapplied message is retried before anything newer.
    pub async fn read_next(&self, consumer: &str, block_ms: u64) -> Result<Option<StatusDelivery>, QueueError> {
        if let Some(pending) = self.read_group(consumer, "0", None).await? {
            debug!(message_id = %pending.message_id, "Retrying unacknowledged status message");
            return Ok(Some(pending));
        }
        self.read_group(consumer, ">", Some(block_ms)).await
    }

    async fn read_group(
        &self,
        consumer: &str,
        start: &str,
        block_ms: Option<u64>,
    ) -> Result<Option<StatusDelivery>, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(self.group()?).arg(consumer).arg("COUNT").arg(1);
        if let Some(block_ms) = block_ms {
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS").arg(&self.topology.status.key).arg(start);

        let reply: Option<StreamReadReply> = cmd.query_async(&mut conn).await?;
        Ok(reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|stream| stream.ids)
            .next()
            .map(|entry| StatusDelivery {
                payload: entry.get::<String>("payload").unwrap_or_default(),
                message_id: entry.id,
            }))
    }

    pub async fn ack(&self, delivery: &StatusDelivery) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.topology.status.key)
            .arg(self.group()?)
            .arg(&delivery.message_id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.topology.status.key)
            .arg(&delivery.message_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StatusPublisher for StatusChannel {
    async fn publish(&self, update: &StatusUpdate) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(update)?;

        let message_id: String = redis::cmd("XADD")
            .arg(&self.topology.status.key)
            .arg("*")
            .arg("payload")
            .arg(&payload)
            .arg("persistent")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        debug!(
            project_id = update.project_id,
            status = %update.status,
            message_id = %message_id,
            "Published status update"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::status::AuthoritativeStatus;

    #[test]
    fn test_delivery_decodes_update() {
        let delivery = StatusDelivery {
            message_id: "1-0".to_string(),
            payload: r#"{"ProjectId":4,"Status":"Failed","ErrorMessage":"Mapper failed","OutputModelPath":null,"Timestamp":"2025-05-04T12:30:00Z"}"#
                .to_string(),
        };
        let update = delivery.update().unwrap();
        assert_eq!(update.project_id, 4);
        assert_eq!(update.status, AuthoritativeStatus::Failed);
        assert_eq!(update.error_message.as_deref(), Some("Mapper failed"));
    }

    #[test]
    fn test_unknown_status_is_undecodable() {
        let delivery = StatusDelivery {
            message_id: "1-0".to_string(),
            payload: r#"{"ProjectId":4,"Status":"Paused","ErrorMessage":null,"OutputModelPath":null,"Timestamp":"2025-05-04T12:30:00Z"}"#
                .to_string(),
        };
        assert!(delivery.update().is_err());
    }
}
