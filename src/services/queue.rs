use std::time::Duration;

use redis::streams::{StreamClaimReply, StreamId, StreamInfoGroupsReply, StreamPendingCountReply, StreamReadReply};
use redis::AsyncCommands;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::models::status::JobMessage;
use crate::services::failure::FailureKind;
use crate::services::topology::Topology;

/// A job delivered to one consumer, pending until settled.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDelivery {
    pub message_id: String,
    /// Raw JSON payload, `{"ProjectId": n}` when well-formed.
    pub payload: String,
    /// 1-based delivery attempt.
    pub attempt: u32,
}

impl JobDelivery {
    pub fn job(&self) -> Result<JobMessage, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }

    fn from_entry(entry: &StreamId, redelivered: u32) -> Self {
        let attempt = entry.get::<u32>("attempt").unwrap_or(1).max(1);
        Self {
            message_id: entry.id.clone(),
            payload: entry.get::<String>("payload").unwrap_or_default(),
            attempt: attempt + redelivered,
        }
    }
}

/// Snapshot of broker-side queue state for the stats endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    /// Entries in the work stream (queued plus in flight).
    pub queued: u64,
    /// Delivered but not yet settled.
    pub in_flight: u64,
    pub consumers: u64,
    pub dead_lettered: u64,
    /// Authoritative status messages not yet applied.
    pub status_backlog: u64,
}

/// Durable work queue on Redis Streams with retry and dead-lettering.
#[derive(Clone)]
pub struct JobQueue {
    client: redis::Client,
    topology: Topology,
}

impl JobQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self::with_client(client, Topology::default()))
    }

    pub fn with_client(client: redis::Client, topology: Topology) -> Self {
        Self { client, topology }
    }

    pub fn client(&self) -> &redis::Client {
        &self.client
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    fn group(&self) -> Result<&str, QueueError> {
        self.topology
            .work
            .group
            .as_deref()
            .ok_or_else(|| QueueError::TopologyMissing("work queue has no consumer group".to_string()))
    }

    /// Publish a job for `project_id`. Returns the broker message id.
    pub async fn enqueue(&self, project_id: i64) -> Result<String, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(&JobMessage { project_id })?;

        let message_id: String = redis::cmd("XADD")
            .arg(&self.topology.work.key)
            .arg("*")
            .arg("payload")
            .arg(&payload)
            .arg("attempt")
            .arg(1)
            .arg("persistent")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        info!(project_id, message_id = %message_id, "Enqueued reconstruction job");
        Ok(message_id)
    }

    /// Read at most one new delivery for `consumer`, blocking up to `block_ms`.
    pub async fn consume(&self, consumer: &str, block_ms: u64) -> Result<Option<JobDelivery>, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(self.group()?)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.topology.work.key)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let delivery = reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|stream| stream.ids)
            .next()
            .map(|entry| JobDelivery::from_entry(&entry, 0));

        if let Some(delivery) = &delivery {
            debug!(
                message_id = %delivery.message_id,
                attempt = delivery.attempt,
                consumer,
                "Received delivery"
            );
        }
        Ok(delivery)
    }

    /// Positive acknowledgement: the entry is removed for good.
    pub async fn ack(&self, delivery: &JobDelivery) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.topology.work.key)
            .arg(self.group()?)
            .arg(&delivery.message_id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.topology.work.key)
            .arg(&delivery.message_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        debug!(message_id = %delivery.message_id, "Acknowledged delivery");
        Ok(())
    }

    /// Negative acknowledgement with requeue: re-publish with the next attempt number.
    pub async fn requeue(&self, delivery: &JobDelivery) -> Result<String, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let (message_id,): (String,) = redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(&self.topology.work.key)
            .arg("*")
            .arg("payload")
            .arg(&delivery.payload)
            .arg("attempt")
            .arg(delivery.attempt + 1)
            .arg("persistent")
            .arg(1)
            .cmd("XACK")
            .arg(&self.topology.work.key)
            .arg(self.group()?)
            .arg(&delivery.message_id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.topology.work.key)
            .arg(&delivery.message_id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        info!(
            message_id = %delivery.message_id,
            requeued_as = %message_id,
            next_attempt = delivery.attempt + 1,
            "Requeued delivery"
        );
        Ok(message_id)
    }

    /// Reject without requeue: route the entry through the dead-letter exchange.
    pub async fn dead_letter(&self, delivery: &JobDelivery, reason: &str) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let failed_queue = self.topology.resolve_dead_letter_queue(&mut conn).await?;

        redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(&failed_queue)
            .arg("*")
            .arg("payload")
            .arg(&delivery.payload)
            .arg("attempt")
            .arg(delivery.attempt)
            .arg("reason")
            .arg(reason)
            .arg("original_id")
            .arg(&delivery.message_id)
            .ignore()
            .cmd("XACK")
            .arg(&self.topology.work.key)
            .arg(self.group()?)
            .arg(&delivery.message_id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.topology.work.key)
            .arg(&delivery.message_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        warn!(
            message_id = %delivery.message_id,
            attempt = delivery.attempt,
            dead_letter_queue = %failed_queue,
            reason,
            "Dead-lettered delivery"
        );
        Ok(())
    }

    /// Take over one entry left pending longer than `min_idle` by another consumer.
    ///
    /// The returned attempt counts every delivery the entry has already had.
    pub async fn claim_stale(&self, consumer: &str, min_idle: Duration) -> Result<Option<JobDelivery>, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let min_idle_ms = min_idle.as_millis() as u64;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.topology.work.key)
            .arg(self.group()?)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(10)
            .query_async(&mut conn)
            .await?;

        for entry in pending.ids {
            let claimed: StreamClaimReply = redis::cmd("XCLAIM")
                .arg(&self.topology.work.key)
                .arg(self.group()?)
                .arg(consumer)
                .arg(min_idle_ms)
                .arg(&entry.id)
                .query_async(&mut conn)
                .await?;

            // Another worker may have claimed it first.
            if let Some(stream_entry) = claimed.ids.first() {
                let delivery = JobDelivery::from_entry(stream_entry, entry.times_delivered as u32);
                info!(
                    message_id = %delivery.message_id,
                    previous_consumer = %entry.consumer,
                    attempt = delivery.attempt,
                    "Reclaimed stale delivery"
                );
                return Ok(Some(delivery));
            }
        }
        Ok(None)
    }

    /// Entries in the work stream.
    pub async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let depth: u64 = conn.xlen(&self.topology.work.key).await?;
        Ok(depth)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let group = self.group()?;

        let queued: u64 = conn.xlen(&self.topology.work.key).await?;
        let dead_lettered: u64 = conn.xlen(&self.topology.failed.key).await?;
        let status_backlog: u64 = conn.xlen(&self.topology.status.key).await?;

        let groups: StreamInfoGroupsReply = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(&self.topology.work.key)
            .query_async(&mut conn)
            .await?;
        let (in_flight, consumers) = groups
            .groups
            .iter()
            .find(|info| info.name == group)
            .map(|info| (info.pending as u64, info.consumers as u64))
            .unwrap_or_default();

        Ok(QueueStats {
            queued,
            in_flight,
            consumers,
            dead_lettered,
            status_backlog,
        })
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Broker topology missing: {0}")]
    TopologyMissing(String),
}

impl QueueError {
    /// Classification used when a broker error fails a job.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Redis(e) if e.is_timeout() => FailureKind::Timeout,
            Self::Redis(e) if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() => {
                FailureKind::Network
            }
            Self::Redis(_) | Self::TopologyMissing(_) => FailureKind::Unclassified,
            Self::Serialize(_) => FailureKind::InvalidInput,
        }
    }
}
