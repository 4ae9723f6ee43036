//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus moves opaque payloads between the api and job services. It is
//! modelled on durable consumer-group transports (Redis Streams, NATS
//! Streaming):
//!
//! - **Queue groups**: consumers sharing a group split a subject's messages;
//!   every distinct group receives every message
//! - **Manual acknowledgment**: a delivery stays pending until acked and is
//!   redelivered once `ack_wait` elapses without an ack
//! - **Deliver all available**: a durable group created for the first time
//!   replays the subject's backlog; reconnecting resumes where it left off
//! - **Dead letters**: messages exceeding `max_deliveries` (or explicitly
//!   rejected) are parked on a dead-letter list and acknowledged
//!
//! Delivery is at-least-once. Consumers must tolerate duplicates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, mpsc};

/// Default ack wait: longer than the 46s processing ceiling.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(50);

/// Default number of deliveries before a message is dead-lettered.
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("bus connection error: {0}")]
    Connection(String),

    #[error("bus command error: {0}")]
    Command(String),

    #[error("consumer group error: {0}")]
    ConsumerGroup(String),

    #[error("bus closed")]
    Closed,
}

/// Where a brand-new group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliverPolicy {
    /// Replay everything still retained for the subject.
    #[default]
    All,
    /// Only messages published after the group was created.
    New,
}

/// Queue-group subscription parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub subject: String,
    pub queue_group: String,
    /// Durable groups keep their cursor when every consumer disconnects.
    pub durable_name: Option<String>,
    pub ack_wait: Duration,
    pub deliver: DeliverPolicy,
    pub max_deliveries: u32,
    /// Name of this consumer inside the group (diagnostics, Redis consumer name).
    pub consumer_name: String,
}

impl SubscriptionOptions {
    pub fn new(subject: impl Into<String>, queue_group: impl Into<String>) -> Self {
        let queue_group = queue_group.into();
        Self {
            subject: subject.into(),
            consumer_name: format!("{}-{}", queue_group, uuid::Uuid::now_v7()),
            queue_group,
            durable_name: None,
            ack_wait: DEFAULT_ACK_WAIT,
            deliver: DeliverPolicy::All,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
        }
    }

    pub fn durable(mut self, name: impl Into<String>) -> Self {
        self.durable_name = Some(name.into());
        self
    }

    pub fn ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn deliver(mut self, deliver: DeliverPolicy) -> Self {
        self.deliver = deliver;
        self
    }

    pub fn max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max.max(1);
        self
    }

    pub fn consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }
}

/// A message as seen by one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Transport-assigned id, stable across redeliveries.
    pub id: String,
    pub subject: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
}

/// Settles deliveries back to the transport.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, message: &Message) -> Result<(), BusError>;

    /// Park the message on the dead-letter list and acknowledge it.
    async fn dead_letter(&self, message: &Message, reason: &str) -> Result<(), BusError>;
}

/// A message plus the handle to settle it.
///
/// Dropping a delivery without acking leaves it pending; the transport
/// redelivers it after the ack wait.
pub struct Delivery {
    message: Message,
    acker: Arc<dyn Acknowledger>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl core::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    pub fn new(message: Message, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            message,
            acker,
            _permit: None,
        }
    }

    /// Hold a prefetch permit until this delivery is settled or dropped.
    pub fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self._permit = Some(permit);
        self
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub async fn ack(self) -> Result<(), BusError> {
        self.acker.ack(&self.message).await
    }

    pub async fn dead_letter(self, reason: &str) -> Result<(), BusError> {
        self.acker.dead_letter(&self.message, reason).await
    }
}

/// Consumer-side flow control.
///
/// A subscription asks for one delivery at a time; the transport hands a
/// message to a consumer only against an outstanding request. The ack wait
/// of a delivery therefore starts when its consumer is ready to handle it.
pub trait Demand: Send + Sync {
    /// Allow one more delivery to this consumer.
    fn request(&self);
}

/// A stream of deliveries for one consumer.
///
/// Dropping the subscription detaches the consumer from its group.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Delivery>,
    demand: Arc<dyn Demand>,
    requested: bool,
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("requested", &self.requested)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<Delivery>, demand: Arc<dyn Demand>) -> Self {
        Self {
            receiver,
            demand,
            requested: false,
        }
    }

    /// Wait for the next delivery; `None` once the bus side is gone.
    ///
    /// At most one request is outstanding, so a cancelled `recv` does not
    /// widen the consumer's window.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.ask();
        let next = self.receiver.recv().await;
        if next.is_some() {
            self.requested = false;
        }
        next
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.ask();
        let next = self.receiver.try_recv().ok();
        if next.is_some() {
            self.requested = false;
        }
        next
    }

    fn ask(&mut self) {
        if !self.requested {
            self.requested = true;
            self.demand.request();
        }
    }
}

/// Durable, at-least-once, consumer-group pub/sub transport.
///
/// Handles are shared (`Arc`) across every task of a process.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    async fn subscribe(&self, options: SubscriptionOptions) -> Result<Subscription, BusError>;

    /// Release transport resources. Further calls may fail.
    async fn close(&self) -> Result<(), BusError> {
        Ok(())
    }
}

#[async_trait]
impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        (**self).publish(subject, payload).await
    }

    async fn subscribe(&self, options: SubscriptionOptions) -> Result<Subscription, BusError> {
        (**self).subscribe(options).await
    }

    async fn close(&self) -> Result<(), BusError> {
        (**self).close().await
    }
}
