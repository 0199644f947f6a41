//! Redis Streams queue transport (durable, at-least-once delivery).
//!
//! - **Send**: `XADD` to the stream with the message body as a field. A
//!   message with a deliver-at time waits in a sorted set scored by that time
//! - **Receive**: move due deferred messages onto the stream, reclaim idle
//!   pending entries (`XPENDING` + `XCLAIM`), then read new ones with
//!   `XREADGROUP`
//! - **Complete**: `XACK`
//! - **Dead-letter**: entries delivered `max_deliveries` times are copied to
//!   the DLQ stream and acknowledged on the main one
//!
//! ## Keys
//!
//! - Stream: `chronicle:scheduled-commands`
//! - DLQ: `chronicle:scheduled-commands:dlq`
//! - Deferred: `chronicle:scheduled-commands:delayed`
//! - One consumer group shared by every delivery worker; each worker is a
//!   named consumer within it

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use chronicle_core::Clock;
use chronicle_events::{EventBus, InMemoryEventBus, Subscription};

use super::message::DeliveredMessage;
use super::transport::{QueueTransport, TransportError, TransportFault};

pub const DEFAULT_STREAM_KEY: &str = "chronicle:scheduled-commands";
pub const DEFAULT_GROUP: &str = "chronicle.delivery";

const BODY_FIELD: &str = "body";
/// Separates the unique prefix of a deferred member from its body.
const DEFERRED_SEPARATOR: char = '|';
const DEFAULT_MAX_DELIVERIES: u32 = 10;
const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RedisStreamsSettings {
    pub stream_key: String,
    pub dlq_key: String,
    /// Sorted set holding messages whose deliver-at time has not come yet.
    pub delayed_key: String,
    pub group: String,
    pub consumer: String,
    pub max_deliveries: u32,
    /// Pending entries idle this long are reclaimed for redelivery.
    pub claim_idle: Duration,
}

impl Default for RedisStreamsSettings {
    fn default() -> Self {
        Self {
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            dlq_key: format!("{DEFAULT_STREAM_KEY}:dlq"),
            delayed_key: format!("{DEFAULT_STREAM_KEY}:delayed"),
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7()),
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            claim_idle: DEFAULT_CLAIM_IDLE,
        }
    }
}

pub struct RedisStreamsTransport {
    client: redis::Client,
    connection: OnceCell<MultiplexedConnection>,
    settings: RedisStreamsSettings,
    clock: Arc<dyn Clock>,
    faults: InMemoryEventBus<TransportFault>,
}

impl core::fmt::Debug for RedisStreamsTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsTransport")
            .field("settings", &self.settings)
            .finish()
    }
}

impl RedisStreamsTransport {
    /// `redis_url` e.g. `redis://localhost:6379`. No connection is made until first use.
    pub fn new(
        redis_url: impl AsRef<str>,
        settings: RedisStreamsSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TransportError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            settings,
            clock,
            faults: InMemoryEventBus::new(),
        })
    }

    pub fn settings(&self) -> &RedisStreamsSettings {
        &self.settings
    }

    /// Shared connection; the consumer group is created on first connect.
    async fn connection(&self) -> Result<MultiplexedConnection, TransportError> {
        let conn = self
            .connection
            .get_or_try_init(|| async {
                let mut conn = self
                    .client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| TransportError::Connection(e.to_string()))?;
                self.ensure_group(&mut conn).await?;
                Ok::<_, TransportError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }

    async fn ensure_group(&self, conn: &mut MultiplexedConnection) -> Result<(), TransportError> {
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&self.settings.stream_key, &self.settings.group, "0")
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(TransportError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    fn fault(&self, message_id: Option<String>, reason: String) {
        let fault = TransportFault {
            message_id,
            reason,
            occurred_at: self.clock.now(),
        };
        if let Err(e) = self.faults.publish(fault) {
            warn!(error = ?e, "failed to publish transport fault");
        }
    }

    async fn append(&self, conn: &mut MultiplexedConnection, body: &str) -> Result<String, TransportError> {
        conn.xadd(&self.settings.stream_key, "*", &[(BODY_FIELD, body)])
            .await
            .map_err(|e| TransportError::Command(format!("XADD failed: {e}")))
    }

    /// Move deferred messages whose time has come onto the stream.
    ///
    /// `ZREM` decides which worker promotes a member, so each is appended once.
    async fn promote_due(&self, conn: &mut MultiplexedConnection, max: usize) -> Result<usize, TransportError> {
        let now = self.clock.now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore_limit(&self.settings.delayed_key, "-inf", now, 0, max as isize)
            .await
            .map_err(|e| TransportError::Command(format!("ZRANGEBYSCORE failed: {e}")))?;

        let mut promoted = 0;
        for member in due {
            let removed: usize = conn
                .zrem(&self.settings.delayed_key, &member)
                .await
                .map_err(|e| TransportError::Command(format!("ZREM failed: {e}")))?;
            if removed == 0 {
                continue;
            }
            let Some((deferred_id, body)) = split_deferred(&member) else {
                self.fault(None, "deferred member has no body; dropped".to_string());
                continue;
            };
            if let Err(e) = self.append(conn, body).await {
                // Put it back so a later receive retries the promotion.
                let _: redis::RedisResult<usize> = conn.zadd(&self.settings.delayed_key, &member, now).await;
                return Err(e);
            }
            debug!(deferred_id, "deferred message is due; appended to stream");
            promoted += 1;
        }
        Ok(promoted)
    }

    /// Pending entries idle past `claim_idle`, with their delivery counts.
    async fn reclaim(
        &self,
        conn: &mut MultiplexedConnection,
        max: usize,
    ) -> Result<Vec<DeliveredMessage>, TransportError> {
        let pending: StreamPendingCountReply = conn
            .xpending_count(&self.settings.stream_key, &self.settings.group, "-", "+", max)
            .await
            .map_err(|e| TransportError::Command(format!("XPENDING failed: {e}")))?;

        let idle_ms = self.settings.claim_idle.as_millis() as usize;
        let stale: HashMap<String, usize> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= idle_ms)
            .map(|p| (p.id, p.times_delivered))
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&String> = stale.keys().collect();
        let claimed: StreamClaimReply = conn
            .xclaim(
                &self.settings.stream_key,
                &self.settings.group,
                &self.settings.consumer,
                idle_ms,
                &ids,
            )
            .await
            .map_err(|e| TransportError::Command(format!("XCLAIM failed: {e}")))?;

        let mut delivered = Vec::new();
        for entry in claimed.ids {
            // XCLAIM counts as one more delivery.
            let delivery_count = stale.get(&entry.id).copied().unwrap_or(0) as u32 + 1;
            self.fault(
                Some(entry.id.clone()),
                format!("lock expired; reclaimed for delivery {delivery_count}"),
            );
            if let Some(message) = self.accept(conn, entry, delivery_count).await? {
                delivered.push(message);
            }
        }
        Ok(delivered)
    }

    async fn read_new(
        &self,
        conn: &mut MultiplexedConnection,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<DeliveredMessage>, TransportError> {
        let mut options = StreamReadOptions::default()
            .group(&self.settings.group, &self.settings.consumer)
            .count(max);
        if !wait.is_zero() {
            options = options.block(wait.as_millis() as usize);
        }

        // A blocking read that times out replies nil.
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.settings.stream_key], &[">"], &options)
            .await
            .map_err(|e| TransportError::Command(format!("XREADGROUP failed: {e}")))?;

        let mut delivered = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                if let Some(message) = self.accept(conn, entry, 1).await? {
                    delivered.push(message);
                }
            }
        }
        Ok(delivered)
    }

    /// Turn a stream entry into a delivery, or dead-letter it.
    async fn accept(
        &self,
        conn: &mut MultiplexedConnection,
        entry: StreamId,
        delivery_count: u32,
    ) -> Result<Option<DeliveredMessage>, TransportError> {
        let body: Option<String> = entry.get(BODY_FIELD);

        let Some(body) = body else {
            self.dead_letter(conn, &entry.id, "", delivery_count, "entry has no body field")
                .await?;
            return Ok(None);
        };
        if delivery_count > self.settings.max_deliveries {
            self.dead_letter(conn, &entry.id, &body, delivery_count, "max deliveries exceeded")
                .await?;
            return Ok(None);
        }

        Ok(Some(DeliveredMessage {
            message_id: entry.id,
            body,
            delivery_count,
        }))
    }

    async fn dead_letter(
        &self,
        conn: &mut MultiplexedConnection,
        message_id: &str,
        body: &str,
        delivery_count: u32,
        reason: &str,
    ) -> Result<(), TransportError> {
        let failed_at = self.clock.now().to_rfc3339();
        let delivery_count = delivery_count.to_string();
        let _: String = conn
            .xadd(
                &self.settings.dlq_key,
                "*",
                &[
                    ("original_message_id", message_id),
                    ("delivery_count", delivery_count.as_str()),
                    ("failed_at", failed_at.as_str()),
                    ("reason", reason),
                    (BODY_FIELD, body),
                ],
            )
            .await
            .map_err(|e| TransportError::Command(format!("DLQ XADD failed: {e}")))?;
        let _: u64 = conn
            .xack(&self.settings.stream_key, &self.settings.group, &[message_id])
            .await
            .map_err(|e| TransportError::Command(format!("XACK failed: {e}")))?;

        warn!(message_id, delivery_count = %delivery_count, reason, "message sent to dead-letter queue");
        self.fault(Some(message_id.to_string()), format!("dead-lettered: {reason}"));
        Ok(())
    }
}

fn deferred_member(deferred_id: &str, body: &str) -> String {
    format!("{deferred_id}{DEFERRED_SEPARATOR}{body}")
}

fn split_deferred(member: &str) -> Option<(&str, &str)> {
    member.split_once(DEFERRED_SEPARATOR)
}

#[async_trait]
impl QueueTransport for RedisStreamsTransport {
    #[instrument(skip(self, body), fields(stream_key = %self.settings.stream_key), err)]
    async fn send(&self, body: String, not_before: Option<DateTime<Utc>>) -> Result<String, TransportError> {
        let mut conn = self.connection().await?;
        let Some(not_before) = not_before.filter(|at| *at > self.clock.now()) else {
            return self.append(&mut conn, &body).await;
        };

        let deferred_id = uuid::Uuid::now_v7().to_string();
        let member = deferred_member(&deferred_id, &body);
        let _: usize = conn
            .zadd(&self.settings.delayed_key, &member, not_before.timestamp_millis())
            .await
            .map_err(|e| TransportError::Command(format!("ZADD failed: {e}")))?;
        Ok(deferred_id)
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<DeliveredMessage>, TransportError> {
        let mut conn = self.connection().await?;

        if let Err(e) = self.promote_due(&mut conn, max).await {
            self.fault(None, format!("promoting deferred messages failed: {e}"));
        }

        let reclaimed = match self.reclaim(&mut conn, max).await {
            Ok(reclaimed) => reclaimed,
            Err(e) => {
                self.fault(None, format!("reclaim failed: {e}"));
                Vec::new()
            }
        };
        if !reclaimed.is_empty() {
            return Ok(reclaimed);
        }

        self.read_new(&mut conn, max, wait).await
    }

    #[instrument(skip(self, message), fields(message_id = %message.message_id), err)]
    async fn complete(&self, message: &DeliveredMessage) -> Result<(), TransportError> {
        let mut conn = self.connection().await?;
        let _: u64 = conn
            .xack(
                &self.settings.stream_key,
                &self.settings.group,
                &[message.message_id.as_str()],
            )
            .await
            .map_err(|e| TransportError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }

    fn faults(&self) -> Subscription<TransportFault> {
        self.faults.subscribe()
    }
}
