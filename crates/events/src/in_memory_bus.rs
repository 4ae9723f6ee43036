//! In-memory event bus for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bus::{
    Acknowledger, BusError, DeliverPolicy, Delivery, Demand, EventBus, Message, Subscription,
    SubscriptionOptions,
};

/// A message parked after exhausting its deliveries or being rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub queue_group: String,
    pub message: Message,
    pub reason: String,
}

/// In-memory queue-group bus.
///
/// - Per-subject retained log (replayed to new `DeliverPolicy::All` groups)
/// - Round-robin delivery inside a queue group, only to consumers that have
///   asked for a message
/// - Ack-wait redelivery driven by tokio timers
/// - At-least-once (subscribers must be idempotent)
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventBus {
    state: Arc<Mutex<BusState>>,
}

#[derive(Debug, Default)]
struct BusState {
    logs: HashMap<String, Vec<StoredMessage>>,
    groups: HashMap<GroupKey, GroupState>,
    dead_letters: Vec<DeadLetter>,
    next_seq: u64,
    next_consumer_id: u64,
    closed: bool,
}

type GroupKey = (String, String);

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    payload: Vec<u8>,
    delivery_count: u32,
}

#[derive(Debug)]
struct GroupState {
    options: SubscriptionOptions,
    durable: bool,
    backlog: VecDeque<Entry>,
    in_flight: HashMap<String, Entry>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

#[derive(Debug)]
struct Consumer {
    id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
    /// Deliveries requested and not yet handed out.
    credit: usize,
}

impl GroupState {
    /// Next consumer in round-robin order with outstanding credit.
    fn next_ready(&mut self) -> Option<usize> {
        let n = self.consumers.len();
        let start = self.next_consumer % n.max(1);
        let idx = (0..n)
            .map(|i| (start + i) % n)
            .find(|&i| self.consumers[i].credit > 0)?;
        self.next_consumer = idx.wrapping_add(1);
        Some(idx)
    }
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BusState>, BusError> {
        self.state
            .lock()
            .map_err(|_| BusError::Command("bus state lock poisoned".to_string()))
    }

    /// Every payload ever published on `subject`, in publish order.
    pub fn published(&self, subject: &str) -> Vec<Vec<u8>> {
        self.lock()
            .map(|state| {
                state
                    .logs
                    .get(subject)
                    .map(|log| log.iter().map(|m| m.payload.clone()).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock()
            .map(|state| state.dead_letters.clone())
            .unwrap_or_default()
    }

    /// Deliveries handed out and not yet settled for a queue group.
    pub fn in_flight(&self, subject: &str, queue_group: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|state| {
                state
                    .groups
                    .get(&(subject.to_string(), queue_group.to_string()))
                    .map(|g| g.in_flight.len())
            })
            .unwrap_or(0)
    }
}

/// Hand out backlog entries to consumers with outstanding credit.
fn dispatch(shared: &Arc<Mutex<BusState>>, state: &mut BusState, key: &GroupKey) {
    let Some(group) = state.groups.get_mut(key) else {
        return;
    };

    loop {
        group.consumers.retain(|c| !c.tx.is_closed());
        if group.backlog.is_empty() {
            break;
        }
        let Some(idx) = group.next_ready() else {
            break;
        };
        let Some(mut entry) = group.backlog.pop_front() else {
            break;
        };

        entry.delivery_count += 1;
        let acker: Arc<dyn Acknowledger> = Arc::new(InMemoryAcker {
            state: Arc::clone(shared),
            key: key.clone(),
        });
        let delivery = Delivery::new(message_of(&key.0, &entry), acker);

        let consumer = &mut group.consumers[idx];
        if consumer.tx.send(delivery).is_err() {
            entry.delivery_count -= 1;
            group.backlog.push_front(entry);
            continue;
        }
        consumer.credit -= 1;

        spawn_ack_timer(shared, key.clone(), &entry, group.options.ack_wait);
        group.in_flight.insert(entry.id.clone(), entry);
    }

    if group.consumers.is_empty() && !group.durable {
        debug!(subject = %key.0, queue_group = %key.1, "dropping non-durable group");
        state.groups.remove(key);
    }
}

fn message_of(subject: &str, entry: &Entry) -> Message {
    Message {
        id: entry.id.clone(),
        subject: subject.to_string(),
        payload: entry.payload.clone(),
        delivery_count: entry.delivery_count,
    }
}

/// Requeue the delivery if it is still unsettled once the ack wait elapses.
fn spawn_ack_timer(
    shared: &Arc<Mutex<BusState>>,
    key: GroupKey,
    entry: &Entry,
    ack_wait: std::time::Duration,
) {
    let shared = Arc::clone(shared);
    let id = entry.id.clone();
    let attempt = entry.delivery_count;

    tokio::spawn(async move {
        tokio::time::sleep(ack_wait).await;

        let Ok(mut state) = shared.lock() else {
            return;
        };
        let Some(group) = state.groups.get_mut(&key) else {
            return;
        };
        let expired = group
            .in_flight
            .get(&id)
            .is_some_and(|e| e.delivery_count == attempt);
        if !expired {
            return;
        }
        let Some(entry) = group.in_flight.remove(&id) else {
            return;
        };
        if entry.delivery_count >= group.options.max_deliveries {
            warn!(
                subject = %key.0,
                queue_group = %key.1,
                message_id = %id,
                deliveries = entry.delivery_count,
                "message exceeded max deliveries; dead-lettering"
            );
            let dead = DeadLetter {
                queue_group: key.1.clone(),
                message: message_of(&key.0, &entry),
                reason: "max deliveries exceeded".to_string(),
            };
            state.dead_letters.push(dead);
            return;
        }
        debug!(message_id = %id, attempt, "ack wait elapsed; redelivering");
        group.backlog.push_front(entry);
        dispatch(&shared, &mut state, &key);
    });
}

/// Credit handle held by one subscription.
#[derive(Debug)]
struct InMemoryDemand {
    state: Arc<Mutex<BusState>>,
    key: GroupKey,
    consumer: u64,
}

impl Demand for InMemoryDemand {
    fn request(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let Some(group) = state.groups.get_mut(&self.key) else {
            return;
        };
        let Some(consumer) = group.consumers.iter_mut().find(|c| c.id == self.consumer) else {
            return;
        };
        consumer.credit += 1;
        dispatch(&self.state, &mut state, &self.key);
    }
}

#[derive(Debug)]
struct InMemoryAcker {
    state: Arc<Mutex<BusState>>,
    key: GroupKey,
}

impl InMemoryAcker {
    fn settle(&self, message: &Message) -> Result<MutexGuard<'_, BusState>, BusError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BusError::Command("bus state lock poisoned".to_string()))?;
        if let Some(group) = state.groups.get_mut(&self.key) {
            group.in_flight.remove(&message.id);
            group.backlog.retain(|e| e.id != message.id);
        }
        Ok(state)
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self, message: &Message) -> Result<(), BusError> {
        self.settle(message).map(|_| ())
    }

    async fn dead_letter(&self, message: &Message, reason: &str) -> Result<(), BusError> {
        let mut state = self.settle(message)?;
        state.dead_letters.push(DeadLetter {
            queue_group: self.key.1.clone(),
            message: message.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(BusError::Closed);
        }

        state.next_seq += 1;
        let stored = StoredMessage {
            id: format!("{}-{}", subject, state.next_seq),
            payload,
        };
        state
            .logs
            .entry(subject.to_string())
            .or_default()
            .push(stored.clone());

        let keys: Vec<GroupKey> = state
            .groups
            .keys()
            .filter(|(s, _)| s == subject)
            .cloned()
            .collect();
        for key in keys {
            if let Some(group) = state.groups.get_mut(&key) {
                group.backlog.push_back(Entry {
                    id: stored.id.clone(),
                    payload: stored.payload.clone(),
                    delivery_count: 0,
                });
            }
            dispatch(&self.state, &mut state, &key);
        }
        Ok(())
    }

    async fn subscribe(&self, options: SubscriptionOptions) -> Result<Subscription, BusError> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(BusError::Closed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let key = (options.subject.clone(), options.queue_group.clone());

        if !state.groups.contains_key(&key) {
            let backlog = match options.deliver {
                DeliverPolicy::All => state
                    .logs
                    .get(&options.subject)
                    .map(|log| {
                        log.iter()
                            .map(|m| Entry {
                                id: m.id.clone(),
                                payload: m.payload.clone(),
                                delivery_count: 0,
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
                DeliverPolicy::New => VecDeque::new(),
            };
            state.groups.insert(
                key.clone(),
                GroupState {
                    durable: options.durable_name.is_some(),
                    options: options.clone(),
                    backlog,
                    in_flight: HashMap::new(),
                    consumers: Vec::new(),
                    next_consumer: 0,
                },
            );
        }

        state.next_consumer_id += 1;
        let id = state.next_consumer_id;
        if let Some(group) = state.groups.get_mut(&key) {
            group.consumers.push(Consumer { id, tx, credit: 0 });
        }

        let demand = Arc::new(InMemoryDemand {
            state: Arc::clone(&self.state),
            key,
            consumer: id,
        });
        Ok(Subscription::new(rx, demand))
    }

    async fn close(&self) -> Result<(), BusError> {
        let mut state = self.lock()?;
        state.closed = true;
        state.groups.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn opts(subject: &str, group: &str) -> SubscriptionOptions {
        SubscriptionOptions::new(subject, group).ack_wait(Duration::from_secs(50))
    }

    #[tokio::test]
    async fn queue_group_splits_messages() {
        let bus = InMemoryEventBus::new();
        let mut a = bus.subscribe(opts("job:created", "workers")).await.unwrap();
        let mut b = bus.subscribe(opts("job:created", "workers")).await.unwrap();

        bus.publish("job:created", b"1".to_vec()).await.unwrap();
        bus.publish("job:created", b"2".to_vec()).await.unwrap();

        let first = a.try_recv().expect("a gets one");
        let second = b.try_recv().expect("b gets one");
        assert_ne!(first.message().payload, second.message().payload);
        assert!(a.try_recv().is_none());
        assert!(b.try_recv().is_none());
    }

    #[tokio::test]
    async fn distinct_groups_each_receive() {
        let bus = InMemoryEventBus::new();
        let mut a = bus.subscribe(opts("job:finished", "api")).await.unwrap();
        let mut b = bus.subscribe(opts("job:finished", "audit")).await.unwrap();

        bus.publish("job:finished", b"x".to_vec()).await.unwrap();

        assert_eq!(a.try_recv().unwrap().message().payload, b"x");
        assert_eq!(b.try_recv().unwrap().message().payload, b"x");
    }

    #[tokio::test]
    async fn new_group_replays_backlog() {
        let bus = InMemoryEventBus::new();
        bus.publish("job:created", b"early".to_vec()).await.unwrap();

        let mut sub = bus
            .subscribe(opts("job:created", "late").durable("late"))
            .await
            .unwrap();
        assert_eq!(sub.try_recv().unwrap().message().payload, b"early");

        let mut fresh = bus
            .subscribe(opts("job:created", "fresh").deliver(DeliverPolicy::New))
            .await
            .unwrap();
        assert!(fresh.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_message_is_redelivered_after_ack_wait() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus
            .subscribe(opts("job:created", "workers").ack_wait(Duration::from_secs(5)))
            .await
            .unwrap();

        bus.publish("job:created", b"p".to_vec()).await.unwrap();
        let first = sub.recv().await.unwrap();
        assert_eq!(first.message().delivery_count, 1);
        drop(first);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let second = sub.recv().await.unwrap();
        assert_eq!(second.message().delivery_count, 2);
        second.ack().await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(sub.try_recv().is_none());
        assert_eq!(bus.in_flight("job:created", "workers"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_backlog_does_not_age_toward_redelivery() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus
            .subscribe(
                opts("job:created", "workers")
                    .ack_wait(Duration::from_secs(5))
                    .max_deliveries(1),
            )
            .await
            .unwrap();

        for i in 0..10u8 {
            bus.publish("job:created", vec![i]).await.unwrap();
        }
        assert_eq!(bus.in_flight("job:created", "workers"), 0);

        // each message is held close to the ack wait; the rest stay queued
        for i in 0..10u8 {
            let delivery = sub.recv().await.unwrap();
            assert_eq!(delivery.message().payload, vec![i]);
            assert_eq!(delivery.message().delivery_count, 1);
            assert_eq!(bus.in_flight("job:created", "workers"), 1);
            tokio::time::sleep(Duration::from_secs(4)).await;
            delivery.ack().await.unwrap();
        }

        assert!(bus.dead_letters().is_empty());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn consumer_without_demand_is_skipped() {
        let bus = InMemoryEventBus::new();
        let mut idle = bus.subscribe(opts("job:created", "workers")).await.unwrap();
        let mut busy = bus.subscribe(opts("job:created", "workers")).await.unwrap();

        assert!(busy.try_recv().is_none());
        bus.publish("job:created", b"1".to_vec()).await.unwrap();
        bus.publish("job:created", b"2".to_vec()).await.unwrap();

        assert_eq!(busy.try_recv().unwrap().message().payload, b"1");
        assert_eq!(busy.try_recv().unwrap().message().payload, b"2");
        assert!(idle.try_recv().is_none());
        assert_eq!(bus.in_flight("job:created", "workers"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn acked_message_is_not_redelivered() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus
            .subscribe(opts("job:created", "workers").ack_wait(Duration::from_secs(5)))
            .await
            .unwrap();

        bus.publish("job:created", b"p".to_vec()).await.unwrap();
        sub.recv().await.unwrap().ack().await.unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_message_is_dead_lettered() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus
            .subscribe(
                opts("job:created", "workers")
                    .ack_wait(Duration::from_secs(1))
                    .max_deliveries(2),
            )
            .await
            .unwrap();

        bus.publish("job:created", b"poison".to_vec()).await.unwrap();
        drop(sub.recv().await.unwrap());
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        drop(sub.recv().await.unwrap());
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert!(sub.try_recv().is_none());
        let dead = bus.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.payload, b"poison");
        assert_eq!(dead[0].queue_group, "workers");
    }

    #[tokio::test]
    async fn explicit_dead_letter_settles_message() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus.subscribe(opts("job:created", "workers")).await.unwrap();
        bus.publish("job:created", b"bad".to_vec()).await.unwrap();

        sub.try_recv()
            .unwrap()
            .dead_letter("malformed payload")
            .await
            .unwrap();

        assert_eq!(bus.in_flight("job:created", "workers"), 0);
        assert_eq!(bus.dead_letters()[0].reason, "malformed payload");
    }

    #[tokio::test]
    async fn closed_bus_rejects_publish() {
        let bus = InMemoryEventBus::new();
        bus.close().await.unwrap();
        assert!(matches!(
            bus.publish("job:created", vec![]).await,
            Err(BusError::Closed)
        ));
    }
}
