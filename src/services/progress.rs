//! Verbose progress channel feeding the live dashboard.
//!
//! Loss-tolerant: the stream is capped, nothing is acknowledged, and a failed
//! publish never affects the job that produced it.

use async_trait::async_trait;
use redis::streams::StreamReadReply;
use tracing::warn;

use crate::models::status::VerboseStatus;
use crate::services::queue::QueueError;
use crate::services::topology::{Topology, VERBOSE_MAX_LEN};

/// Best-effort progress sink.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, status: VerboseStatus);
}

/// Events read from the verbose stream and the cursor to resume from.
#[derive(Debug, Default)]
pub struct ProgressBatch {
    pub last_id: Option<String>,
    pub events: Vec<VerboseStatus>,
}

#[derive(Clone)]
pub struct ProgressChannel {
    client: redis::Client,
    topology: Topology,
}

impl ProgressChannel {
    pub fn new(client: redis::Client, topology: Topology) -> Self {
        Self { client, topology }
    }

    pub async fn publish(&self, status: &VerboseStatus) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(status)?;
        let max_len = self.topology.verbose.max_len.unwrap_or(VERBOSE_MAX_LEN);

        redis::cmd("XADD")
            .arg(&self.topology.verbose.key)
            .arg("MAXLEN")
            .arg("~")
            .arg(max_len)
            .arg("*")
            .arg("payload")
            .arg(&payload)
            .arg("persistent")
            .arg(0)
            .query_async::<String>(&mut conn)
            .await?;
        Ok(())
    }

    /// Read events after `last_id` (`$` for only new ones), blocking up to `block_ms`.
    pub async fn read_after(&self, last_id: &str, block_ms: u64, count: usize) -> Result<ProgressBatch, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let reply: Option<StreamReadReply> = redis::cmd("XREAD")
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.topology.verbose.key)
            .arg(last_id)
            .query_async(&mut conn)
            .await?;

        let mut batch = ProgressBatch::default();
        for entry in reply.into_iter().flat_map(|reply| reply.keys).flat_map(|stream| stream.ids) {
            let payload = entry.get::<String>("payload").unwrap_or_default();
            match serde_json::from_str::<VerboseStatus>(&payload) {
                Ok(event) => batch.events.push(event),
                Err(e) => warn!(message_id = %entry.id, error = %e, "Skipping undecodable progress event"),
            }
            batch.last_id = Some(entry.id);
        }
        Ok(batch)
    }
}

#[async_trait]
impl ProgressReporter for ProgressChannel {
    async fn report(&self, status: VerboseStatus) {
        if let Err(e) = self.publish(&status).await {
            warn!(
                project_id = status.project_id,
                worker_id = %status.worker_id,
                error = %e,
                "Failed to publish progress event"
            );
        }
    }
}
