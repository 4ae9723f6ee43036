//! Redis Streams-backed event bus (durable, at-least-once delivery).
//!
//! This implementation uses Redis Streams (XADD/XREADGROUP) to provide:
//! - **Durable delivery**: Messages persist until acknowledged
//! - **At-least-once**: Pending entries idle past the ack wait are re-claimed
//! - **Queue groups**: Each queue group is a Redis consumer group
//! - **Dead-letter handling**: Entries past `max_deliveries` go to the DLQ
//!
//! ## Architecture
//!
//! - **Stream Key**: `<prefix>:<subject>` (one stream per subject)
//! - **Consumer Groups**: One per queue group (e.g. `hasty-jobs`)
//! - **Consumers**: Named consumers within groups (`SubscriptionOptions::consumer_name`)
//! - **Dead-Letter Queue**: `<prefix>:dlq`
//!
//! Each subscription owns a dedicated multiplexed connection for its blocking
//! XREADGROUP; publishes and acks share a `ConnectionManager`.
//!
//! ## Flow control
//!
//! A consumer reads (or claims) only as many entries as its subscriber has
//! requested, so an entry's idle time starts when a handler is free for it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, RedisError};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use hasty_events::{
    Acknowledger, BusError, DeliverPolicy, Delivery, Demand, EventBus, Message, Subscription,
    SubscriptionOptions,
};

/// Default stream key prefix
pub const DEFAULT_STREAM_PREFIX: &str = "hasty";

/// Entries fetched per XREADGROUP / XPENDING round
const DEFAULT_BATCH_SIZE: usize = 16;

/// How long one XREADGROUP blocks waiting for new entries
const DEFAULT_BLOCK: Duration = Duration::from_millis(1_000);

/// Pause after a failed read before trying again
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct RedisStreamsEventBus {
    client: redis::Client,
    conn: ConnectionManager,
    prefix: String,
    dlq_key: String,
    batch_size: usize,
    block: Duration,
    shutdown: CancellationToken,
}

impl core::fmt::Debug for RedisStreamsEventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsEventBus")
            .field("prefix", &self.prefix)
            .field("dlq_key", &self.dlq_key)
            .field("batch_size", &self.batch_size)
            .field("block", &self.block)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsEventBus {
    /// Connect to Redis.
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - Stream key prefix (default: "hasty")
    pub async fn connect(
        redis_url: impl AsRef<str>,
        prefix: Option<String>,
    ) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BusError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        let prefix = prefix.unwrap_or_else(|| DEFAULT_STREAM_PREFIX.to_string());

        Ok(Self {
            client,
            conn,
            dlq_key: format!("{prefix}:dlq"),
            prefix,
            batch_size: DEFAULT_BATCH_SIZE,
            block: DEFAULT_BLOCK,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn stream_key(&self, subject: &str) -> String {
        format!("{}:{}", self.prefix, subject)
    }

    pub fn dlq_key(&self) -> &str {
        &self.dlq_key
    }

    /// Ensure a consumer group exists (idempotent).
    ///
    /// A new group starts at `0` (whole backlog) for `DeliverPolicy::All` and
    /// at `$` (new entries only) otherwise. An existing group keeps its cursor.
    pub async fn ensure_consumer_group(
        &self,
        stream_key: &str,
        group: &str,
        deliver: DeliverPolicy,
    ) -> Result<(), BusError> {
        let start = match deliver {
            DeliverPolicy::All => "0",
            DeliverPolicy::New => "$",
        };
        let mut conn = self.conn.clone();
        let created: Result<(), RedisError> =
            conn.xgroup_create_mkstream(stream_key, group, start).await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(BusError::ConsumerGroup(format!(
                "XGROUP CREATE {stream_key} {group} failed: {e}"
            ))),
        }
    }
}

#[async_trait]
impl EventBus for RedisStreamsEventBus {
    #[instrument(skip(self, payload), fields(stream_key = %self.stream_key(subject)), err)]
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(self.stream_key(subject))
            .arg("*")
            .arg("payload")
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Command(format!("XADD failed: {e}")))?;
        Ok(())
    }

    #[instrument(
        skip(self, options),
        fields(subject = %options.subject, group = %options.queue_group, consumer = %options.consumer_name),
        err
    )]
    async fn subscribe(&self, options: SubscriptionOptions) -> Result<Subscription, BusError> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }
        let stream_key = self.stream_key(&options.subject);
        self.ensure_consumer_group(&stream_key, &options.queue_group, options.deliver)
            .await?;

        let reader = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let acker = Arc::new(RedisAcker {
            conn: self.conn.clone(),
            stream_key: stream_key.clone(),
            group: options.queue_group.clone(),
            dlq_key: self.dlq_key.clone(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Semaphore::new(0));
        let consumer = StreamConsumer {
            stream_key,
            options,
            batch_size: self.batch_size,
            block: self.block,
            acker,
            tx,
            credit: Arc::clone(&credit),
        };
        tokio::spawn(consumer.run(reader, self.shutdown.child_token()));

        Ok(Subscription::new(rx, Arc::new(RedisDemand { credit })))
    }

    async fn close(&self) -> Result<(), BusError> {
        self.shutdown.cancel();
        Ok(())
    }
}

/// Background reader for one subscription.
struct StreamConsumer {
    stream_key: String,
    options: SubscriptionOptions,
    batch_size: usize,
    block: Duration,
    acker: Arc<RedisAcker>,
    tx: mpsc::UnboundedSender<Delivery>,
    /// One permit per delivery the subscriber has asked for.
    credit: Arc<Semaphore>,
}

struct RedisDemand {
    credit: Arc<Semaphore>,
}

impl Demand for RedisDemand {
    fn request(&self) {
        self.credit.add_permits(1);
    }
}

impl StreamConsumer {
    async fn run(self, mut reader: MultiplexedConnection, token: CancellationToken) {
        debug!(
            stream_key = %self.stream_key,
            group = %self.options.queue_group,
            consumer = %self.options.consumer_name,
            "stream consumer started"
        );

        while !self.tx.is_closed() && !token.is_cancelled() {
            let Some(budget) = self.take_credit(&token).await else {
                break;
            };

            let reclaimed = match self.reclaim_expired(&mut reader, budget).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(
                        stream_key = %self.stream_key,
                        error = %e,
                        "failed to reclaim pending entries"
                    );
                    0
                }
            };
            let remaining = budget - reclaimed;
            if remaining == 0 {
                continue;
            }

            let read_opts = StreamReadOptions::default()
                .group(&self.options.queue_group, &self.options.consumer_name)
                .count(remaining)
                .block(self.block.as_millis() as usize);

            let stream_keys = [&self.stream_key];
            let read: Result<StreamReadReply, RedisError> = tokio::select! {
                _ = token.cancelled() => break,
                r = reader.xread_options(&stream_keys, &[">"], &read_opts) => r,
            };

            match read {
                Ok(reply) => {
                    let mut sent = 0;
                    for entry in reply.keys.into_iter().flat_map(|k| k.ids) {
                        if !self.forward(&entry, 1) {
                            break;
                        }
                        sent += 1;
                    }
                    self.credit.add_permits(remaining.saturating_sub(sent));
                }
                Err(e) => {
                    self.credit.add_permits(remaining);
                    error!(stream_key = %self.stream_key, error = %e, "XREADGROUP failed");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        if self.options.durable_name.is_none() {
            let removed: Result<i64, RedisError> = reader
                .xgroup_delconsumer(
                    &self.stream_key,
                    &self.options.queue_group,
                    &self.options.consumer_name,
                )
                .await;
            if let Err(e) = removed {
                warn!(error = %e, "failed to remove consumer from group");
            }
        }
        debug!(stream_key = %self.stream_key, "stream consumer stopped");
    }

    /// Wait until the subscriber wants at least one delivery; takes up to a
    /// batch of outstanding requests. `None` on shutdown.
    async fn take_credit(&self, token: &CancellationToken) -> Option<usize> {
        let first = tokio::select! {
            _ = token.cancelled() => return None,
            _ = self.tx.closed() => return None,
            permit = self.credit.acquire() => permit.ok()?,
        };
        first.forget();
        let mut taken = 1;
        while taken < self.batch_size {
            match self.credit.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    taken += 1;
                }
                Err(_) => break,
            }
        }
        Some(taken)
    }

    /// Claim up to `budget` entries idle past the ack wait and dead-letter
    /// the exhausted ones. Returns how many were handed to the subscriber.
    async fn reclaim_expired(
        &self,
        reader: &mut MultiplexedConnection,
        budget: usize,
    ) -> Result<usize, RedisError> {
        let pending: StreamPendingCountReply = reader
            .xpending_count(
                &self.stream_key,
                &self.options.queue_group,
                "-",
                "+",
                self.batch_size,
            )
            .await?;

        let ack_wait_ms = self.options.ack_wait.as_millis() as usize;
        let max_deliveries = self.options.max_deliveries as usize;

        let mut claim = Vec::new();
        for p in pending.ids.iter().filter(|p| p.last_delivered_ms >= ack_wait_ms) {
            if p.times_delivered >= max_deliveries {
                self.dead_letter_exhausted(reader, &p.id, p.times_delivered)
                    .await?;
            } else if claim.len() < budget {
                claim.push((p.id.clone(), p.times_delivered));
            }
        }
        if claim.is_empty() {
            return Ok(0);
        }

        let ids: Vec<&str> = claim.iter().map(|(id, _)| id.as_str()).collect();
        let claimed: StreamClaimReply = reader
            .xclaim(
                &self.stream_key,
                &self.options.queue_group,
                &self.options.consumer_name,
                ack_wait_ms,
                &ids,
            )
            .await?;

        let mut sent = 0;
        for entry in &claimed.ids {
            let previous = claim
                .iter()
                .find(|(id, _)| id == &entry.id)
                .map(|(_, n)| *n)
                .unwrap_or(0);
            debug!(message_id = %entry.id, delivery_count = previous + 1, "redelivering");
            if !self.forward(entry, (previous + 1) as u32) {
                break;
            }
            sent += 1;
        }
        Ok(sent)
    }

    async fn dead_letter_exhausted(
        &self,
        reader: &mut MultiplexedConnection,
        id: &str,
        deliveries: usize,
    ) -> Result<(), RedisError> {
        let range: StreamRangeReply = reader.xrange(&self.stream_key, id, id).await?;
        let message = Message {
            id: id.to_string(),
            subject: self.options.subject.clone(),
            payload: range
                .ids
                .first()
                .and_then(|e| e.get::<Vec<u8>>("payload"))
                .unwrap_or_default(),
            delivery_count: deliveries as u32,
        };
        warn!(
            message_id = %id,
            deliveries,
            group = %self.options.queue_group,
            "message exceeded max deliveries; dead-lettering"
        );
        if let Err(e) = self
            .acker
            .dead_letter(&message, "max deliveries exceeded")
            .await
        {
            error!(message_id = %id, error = %e, "failed to dead-letter message");
        }
        Ok(())
    }

    /// Hand an entry to the subscriber; `false` once the subscriber is gone.
    fn forward(&self, entry: &StreamId, delivery_count: u32) -> bool {
        let Some(payload) = entry.get::<Vec<u8>>("payload") else {
            warn!(message_id = %entry.id, "stream entry without payload; skipping");
            return true;
        };
        let message = Message {
            id: entry.id.clone(),
            subject: self.options.subject.clone(),
            payload,
            delivery_count,
        };
        let acker: Arc<dyn Acknowledger> = self.acker.clone();
        self.tx.send(Delivery::new(message, acker)).is_ok()
    }
}

/// XACK / DLQ handle shared by every delivery of one subscription.
struct RedisAcker {
    conn: ConnectionManager,
    stream_key: String,
    group: String,
    dlq_key: String,
}

#[async_trait]
impl Acknowledger for RedisAcker {
    async fn ack(&self, message: &Message) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(&self.stream_key, &self.group, &[&message.id])
            .await
            .map_err(|e| BusError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }

    async fn dead_letter(&self, message: &Message, reason: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("original_message_id")
            .arg(&message.id)
            .arg("subject")
            .arg(&message.subject)
            .arg("queue_group")
            .arg(&self.group)
            .arg("delivery_count")
            .arg(message.delivery_count)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg("payload")
            .arg(message.payload.as_slice())
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Command(format!("DLQ XADD failed: {e}")))?;

        warn!(message_id = %message.id, %reason, "message sent to dead-letter queue");
        self.ack(message).await
    }
}
