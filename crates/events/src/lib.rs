//! Event transport for job lifecycle messages.
//!
//! - [`EventBus`]: queue-group pub/sub with manual acknowledgment
//! - [`InMemoryEventBus`]: in-process implementation for tests/dev
//! - [`JobEventPublisher`]: typed publishing of [`hasty_jobs::JobEvent`]s
//! - [`spawn_listener`]: bounded-concurrency consumer loop

pub mod bus;
pub mod in_memory_bus;
pub mod listener;
pub mod publisher;
pub mod retry;

pub use bus::{
    Acknowledger, BusError, DEFAULT_ACK_WAIT, DEFAULT_MAX_DELIVERIES, DeliverPolicy, Delivery,
    Demand, EventBus, Message, Subscription, SubscriptionOptions,
};
pub use in_memory_bus::{DeadLetter, InMemoryEventBus};
pub use listener::{Disposition, ListenerHandle, MessageHandler, spawn_listener};
pub use publisher::{JobEventPublisher, PublishError};
pub use retry::{BackoffStrategy, RetryPolicy};
