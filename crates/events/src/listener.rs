//! Queue-group listener loop.
//!
//! Pulls deliveries from a [`Subscription`], runs a [`MessageHandler`] for
//! each one on its own task (bounded by `max_in_flight`), and settles the
//! delivery according to the handler's [`Disposition`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::bus::{Delivery, Message, Subscription};

/// What to do with a delivery once handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; remove it from the pending list.
    Ack,
    /// Leave it pending so the transport redelivers after the ack wait.
    Retry,
    /// Never processable; park it on the dead-letter list.
    DeadLetter(String),
}

/// Handler for one subject. Must be idempotent (at-least-once delivery).
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &Message) -> Disposition;
}

/// Handle to stop and join a running listener.
#[derive(Debug)]
pub struct ListenerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl ListenerHandle {
    /// Stop pulling new deliveries and wait for the loop to exit.
    ///
    /// In-flight handler tasks are left running; their deliveries settle
    /// normally or are redelivered after the ack wait.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "listener task panicked");
        }
    }
}

/// Spawn a listener that hands each delivery to `handler`.
pub fn spawn_listener<H>(
    name: &'static str,
    subscription: Subscription,
    handler: Arc<H>,
    max_in_flight: usize,
    token: CancellationToken,
) -> ListenerHandle
where
    H: MessageHandler,
{
    let limit = Arc::new(Semaphore::new(max_in_flight.max(1)));
    let loop_token = token.clone();
    let join = tokio::spawn(
        listener_loop(name, subscription, handler, limit, loop_token)
            .instrument(info_span!("listener", name)),
    );
    ListenerHandle { token, join }
}

async fn listener_loop<H>(
    name: &'static str,
    mut subscription: Subscription,
    handler: Arc<H>,
    limit: Arc<Semaphore>,
    token: CancellationToken,
) where
    H: MessageHandler,
{
    info!("listener started");
    loop {
        let permit = tokio::select! {
            _ = token.cancelled() => break,
            permit = Arc::clone(&limit).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let delivery = tokio::select! {
            _ = token.cancelled() => break,
            next = subscription.recv() => match next {
                Some(d) => d.with_permit(permit),
                None => {
                    warn!("subscription closed");
                    break;
                }
            },
        };

        let handler = Arc::clone(&handler);
        let span = info_span!(
            "delivery",
            listener = name,
            message_id = %delivery.message().id,
            delivery_count = delivery.message().delivery_count
        );
        tokio::spawn(handle_delivery(handler, delivery).instrument(span));
    }
    info!("listener stopped");
}

async fn handle_delivery<H>(handler: Arc<H>, delivery: Delivery)
where
    H: MessageHandler,
{
    let disposition = handler.handle(delivery.message()).await;
    let result = match disposition {
        Disposition::Ack => delivery.ack().await,
        Disposition::Retry => {
            debug!("leaving delivery pending for redelivery");
            return;
        }
        Disposition::DeadLetter(reason) => {
            warn!(%reason, "dead-lettering delivery");
            delivery.dead_letter(&reason).await
        }
    };
    if let Err(e) = result {
        error!(error = %e, "failed to settle delivery");
    }
}
