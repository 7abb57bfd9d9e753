//! Broker topology for the reconstruction pipeline.
//!
//! Every logical queue is a Redis Stream. Queues that need acknowledgement
//! own a consumer group; the dead-letter exchange is a stored binding from a
//! routing key to the failed-jobs stream, resolved on every reject.
//!
//! Declaration is idempotent: existing groups (`BUSYGROUP`) are left alone and
//! the property hashes are rewritten with identical values.

use std::time::Duration;

use redis::AsyncCommands;
use tracing::{debug, info};

use crate::services::queue::QueueError;

pub const WORK_QUEUE: &str = "photogrammetry:jobs";
pub const WORK_GROUP: &str = "photogrammetry:workers";
pub const FAILED_QUEUE: &str = "photogrammetry:failed";
pub const FAILED_GROUP: &str = "photogrammetry:failed-inspectors";
pub const STATUS_QUEUE: &str = "photogrammetry:status";
pub const STATUS_GROUP: &str = "photogrammetry:status-consumers";
pub const VERBOSE_QUEUE: &str = "photogrammetry:status-verbose";
pub const DEAD_LETTER_EXCHANGE: &str = "photogrammetry-dlx";
pub const DEAD_LETTER_ROUTING_KEY: &str = "failed";

/// Work items are reclaimed from silent consumers after this long.
pub const CONSUMER_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Approximate cap on the verbose stream; older progress events are dropped.
pub const VERBOSE_MAX_LEN: usize = 10_000;

/// Properties of a single declared queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDeclaration {
    pub key: String,
    pub group: Option<String>,
    pub consumer_timeout: Option<Duration>,
    /// Route rejected entries through the dead-letter exchange.
    pub dead_letter: bool,
    /// Entries are written for durable delivery (false: best-effort, capped).
    pub persistent: bool,
    pub max_len: Option<usize>,
}

/// The full set of queues and the dead-letter exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub work: QueueDeclaration,
    pub failed: QueueDeclaration,
    pub status: QueueDeclaration,
    pub verbose: QueueDeclaration,
    pub dead_letter_exchange: String,
    pub dead_letter_routing_key: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            work: QueueDeclaration {
                key: WORK_QUEUE.to_string(),
                group: Some(WORK_GROUP.to_string()),
                consumer_timeout: Some(CONSUMER_TIMEOUT),
                dead_letter: true,
                persistent: true,
                max_len: None,
            },
            failed: QueueDeclaration {
                key: FAILED_QUEUE.to_string(),
                group: Some(FAILED_GROUP.to_string()),
                consumer_timeout: None,
                dead_letter: false,
                persistent: true,
                max_len: None,
            },
            status: QueueDeclaration {
                key: STATUS_QUEUE.to_string(),
                group: Some(STATUS_GROUP.to_string()),
                consumer_timeout: None,
                dead_letter: false,
                persistent: true,
                max_len: None,
            },
            verbose: QueueDeclaration {
                key: VERBOSE_QUEUE.to_string(),
                group: None,
                consumer_timeout: None,
                dead_letter: false,
                persistent: false,
                max_len: Some(VERBOSE_MAX_LEN),
            },
            dead_letter_exchange: DEAD_LETTER_EXCHANGE.to_string(),
            dead_letter_routing_key: DEAD_LETTER_ROUTING_KEY.to_string(),
        }
    }
}

impl Topology {
    /// Work queue with a custom consumer timeout.
    pub fn with_consumer_timeout(mut self, timeout: Duration) -> Self {
        self.work.consumer_timeout = Some(timeout);
        self
    }

    pub fn exchange_key(&self) -> String {
        format!("photogrammetry:exchange:{}", self.dead_letter_exchange)
    }

    /// Hash mapping routing keys to queue keys for the dead-letter exchange.
    pub fn bindings_key(&self) -> String {
        format!("{}:bindings", self.exchange_key())
    }

    pub fn properties_key(queue: &QueueDeclaration) -> String {
        format!("photogrammetry:queue:{}", queue.key)
    }

    pub fn queues(&self) -> [&QueueDeclaration; 4] {
        [&self.work, &self.failed, &self.status, &self.verbose]
    }

    /// Stored description of a queue, mirroring broker queue arguments.
    pub fn queue_properties(&self, queue: &QueueDeclaration) -> Vec<(&'static str, String)> {
        let mut props = vec![
            ("durable", "1".to_string()),
            ("exclusive", "0".to_string()),
            ("auto_delete", "0".to_string()),
            ("persistent", if queue.persistent { "1" } else { "0" }.to_string()),
        ];
        if let Some(group) = &queue.group {
            props.push(("consumer_group", group.clone()));
        }
        if let Some(timeout) = queue.consumer_timeout {
            props.push(("consumer_timeout_ms", timeout.as_millis().to_string()));
        }
        if queue.dead_letter {
            props.push(("dead_letter_exchange", self.dead_letter_exchange.clone()));
            props.push(("dead_letter_routing_key", self.dead_letter_routing_key.clone()));
        }
        if let Some(max_len) = queue.max_len {
            props.push(("max_len", max_len.to_string()));
        }
        props
    }

    /// Declare every queue, consumer group and the dead-letter binding.
    pub async fn declare(&self, client: &redis::Client) -> Result<(), QueueError> {
        let mut conn = client.get_multiplexed_async_connection().await?;

        conn.hset_multiple::<_, _, _, ()>(
            self.exchange_key(),
            &[("type", "direct"), ("durable", "1")],
        )
        .await?;
        conn.hset::<_, _, _, ()>(
            self.bindings_key(),
            &self.dead_letter_routing_key,
            &self.failed.key,
        )
        .await?;

        for queue in self.queues() {
            if let Some(group) = &queue.group {
                ensure_group(&mut conn, &queue.key, group).await?;
            }
            conn.hset_multiple::<_, _, _, ()>(
                Self::properties_key(queue),
                &self.queue_properties(queue),
            )
            .await?;
        }

        info!(
            work_queue = %self.work.key,
            status_queue = %self.status.key,
            verbose_queue = %self.verbose.key,
            dead_letter_queue = %self.failed.key,
            "Broker topology declared"
        );
        Ok(())
    }

    /// Resolve the queue bound to the dead-letter routing key.
    pub async fn resolve_dead_letter_queue<C>(&self, conn: &mut C) -> Result<String, QueueError>
    where
        C: redis::aio::ConnectionLike + Send,
    {
        let queue: Option<String> = redis::cmd("HGET")
            .arg(self.bindings_key())
            .arg(&self.dead_letter_routing_key)
            .query_async(conn)
            .await?;
        queue.ok_or_else(|| {
            QueueError::TopologyMissing(format!(
                "no queue bound to {}/{}",
                self.dead_letter_exchange, self.dead_letter_routing_key
            ))
        })
    }
}

/// Create a consumer group (and its stream), tolerating an existing group.
async fn ensure_group(
    conn: &mut redis::aio::MultiplexedConnection,
    key: &str,
    group: &str,
) -> Result<(), QueueError> {
    let result: Result<(), redis::RedisError> = conn.xgroup_create_mkstream(key, group, "0").await;
    match result {
        Ok(()) => info!(stream = key, group, "Created consumer group"),
        Err(e) if e.code() == Some("BUSYGROUP") => {
            debug!(stream = key, group, "Consumer group already exists");
        }
        Err(e) => return Err(QueueError::Redis(e)),
    }
    Ok(())
}
