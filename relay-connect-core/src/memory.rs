//! In-process transport.
//!
//! A small broker with queue and topic destinations, explicit
//! acknowledgement, transactional sends and failure injection. It backs the
//! crate's tests and examples, and is handy for exercising connector sinks
//! without a real backend.

use crate::message::{Destination, DestinationKind, Message};
use crate::pool::ResourceKey;
use crate::traits::{AckMode, Adapter, AdapterFactory, Consumer, ExceptionSender};
use crate::{ConnectorError, ConnectorResult};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Counters kept by the broker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections_created: u64,
    pub connections_closed: u64,
    pub connect_failures: u64,
    pub subscriptions: u64,
    pub consumers_closed: u64,
    pub deliveries: u64,
    pub acks: u64,
    pub rejects: u64,
    pub sends: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

/// An error to hand out from the next `receive` call
#[derive(Debug, Clone)]
pub enum ReceiveFault {
    Transient(String),
    Fatal(String),
}

impl ReceiveFault {
    fn into_error(self) -> ConnectorError {
        match self {
            ReceiveFault::Transient(msg) => ConnectorError::retryable(msg),
            ReceiveFault::Fatal(msg) => ConnectorError::fatal(msg),
        }
    }
}

struct Delivery {
    destination: Destination,
    consumer: u64,
    message: Message,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, VecDeque<Message>>,
    topics: HashMap<String, HashMap<u64, VecDeque<Message>>>,
    unacked: HashMap<u64, Delivery>,
    acked: HashSet<u64>,
    published: Vec<(Destination, Message)>,
    next_tag: u64,
    next_id: u64,
    stats: BrokerStats,
    pending_connect_failures: u32,
    connect_delay: Duration,
    subscribe_limit: Option<u64>,
    failing_commits: HashSet<u64>,
    commit_count: u64,
    pending_send_failures: u32,
    pending_close_failures: u32,
    broken_adapters: HashSet<u64>,
    live_adapters: HashSet<u64>,
    receive_faults: VecDeque<ReceiveFault>,
    listeners: Vec<ExceptionSender>,
    single_topic_consumer: bool,
    subscriptions_ended: bool,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn deliver(&mut self, destination: &Destination, message: Message) {
        self.published.push((destination.clone(), message.clone()));
        match destination.kind {
            DestinationKind::Queue => self
                .queues
                .entry(destination.name.clone())
                .or_default()
                .push_back(message),
            DestinationKind::Topic => {
                if let Some(subscribers) = self.topics.get_mut(&destination.name) {
                    for queue in subscribers.values_mut() {
                        queue.push_back(message.clone());
                    }
                }
            }
        }
    }

    fn requeue(&mut self, delivery: Delivery) {
        let mut message = delivery.message;
        message.redelivery_count += 1;
        match delivery.destination.kind {
            DestinationKind::Queue => self
                .queues
                .entry(delivery.destination.name)
                .or_default()
                .push_front(message),
            DestinationKind::Topic => {
                if let Some(queue) = self
                    .topics
                    .get_mut(&delivery.destination.name)
                    .and_then(|subs| subs.get_mut(&delivery.consumer))
                {
                    queue.push_front(message);
                }
            }
        }
    }
}

struct BrokerState {
    inner: Mutex<Inner>,
    notify: Notify,
}

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                inner: Mutex::new(Inner::default()),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.state
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.state.notify.notify_waiters();
    }

    pub fn factory(&self) -> MemoryFactory {
        MemoryFactory {
            broker: self.clone(),
        }
    }

    /// Make a message available on `destination`
    pub fn publish(&self, destination: &Destination, message: Message) {
        self.lock().deliver(destination, message);
        self.wake();
    }

    /// Every message that became visible, in order
    pub fn published(&self) -> Vec<(Destination, Message)> {
        self.lock().published.clone()
    }

    pub fn published_payloads(&self, destination: &Destination) -> Vec<Vec<u8>> {
        self.lock()
            .published
            .iter()
            .filter(|(d, _)| d == destination)
            .map(|(_, m)| m.payload.clone())
            .collect()
    }

    /// Messages waiting on a queue, not yet handed to any consumer
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.len())
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn is_acked(&self, delivery_tag: u64) -> bool {
        self.lock().acked.contains(&delivery_tag)
    }

    pub fn stats(&self) -> BrokerStats {
        self.lock().stats.clone()
    }

    /// Number of adapters created and not yet closed
    pub fn open_connections(&self) -> usize {
        self.lock().live_adapters.len()
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.lock().pending_connect_failures = count;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    /// Allow `count` more successful subscriptions, then fail the rest
    pub fn fail_subscribes_after(&self, count: u64) {
        let mut inner = self.lock();
        inner.subscribe_limit = Some(inner.stats.subscriptions + count);
    }

    /// Fail the `nth` commit (1-indexed, counted across all adapters)
    pub fn fail_commit(&self, nth: u64) {
        self.lock().failing_commits.insert(nth);
    }

    pub fn fail_next_sends(&self, count: u32) {
        self.lock().pending_send_failures = count;
    }

    /// The next `count` consumer closes report an error. The subscription
    /// is still torn down.
    pub fn fail_consumer_closes(&self, count: u32) {
        self.lock().pending_close_failures = count;
    }

    /// Break every open adapter; later calls on them report an invalid resource
    pub fn break_connections(&self) {
        let mut inner = self.lock();
        let live: Vec<u64> = inner.live_adapters.iter().copied().collect();
        inner.broken_adapters.extend(live);
        drop(inner);
        self.wake();
    }

    pub fn inject_receive_fault(&self, fault: ReceiveFault) {
        self.lock().receive_faults.push_back(fault);
        self.wake();
    }

    /// Push an asynchronous provider error to every registered listener
    pub fn raise_exception(&self, message: &str) {
        self.lock()
            .listeners
            .retain(|sender| sender.send(ConnectorError::retryable(message)).is_ok());
    }

    /// Limit topics to a single consumer per adapter
    pub fn set_single_topic_consumer(&self, single: bool) {
        self.lock().single_topic_consumer = single;
    }

    /// End every subscription; pending and later receives return `None`
    pub fn end_subscriptions(&self) {
        self.lock().subscriptions_ended = true;
        self.wake();
    }
}

/// Creates [`MemoryAdapter`]s connected to one broker
#[derive(Clone)]
pub struct MemoryFactory {
    broker: MemoryBroker,
}

#[async_trait]
impl AdapterFactory for MemoryFactory {
    type Adapter = MemoryAdapter;

    async fn create(&self, key: &ResourceKey) -> ConnectorResult<MemoryAdapter> {
        let delay = self.broker.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.broker.lock();
        if inner.pending_connect_failures > 0 {
            inner.pending_connect_failures -= 1;
            inner.stats.connect_failures += 1;
            return Err(ConnectorError::retryable(format!(
                "connection to {} refused",
                key
            )));
        }

        let id = inner.next_id();
        inner.stats.connections_created += 1;
        inner.live_adapters.insert(id);
        debug!(key = %key, adapter = id, "memory adapter connected");

        Ok(MemoryAdapter {
            id,
            broker: self.broker.clone(),
            tx: Mutex::new(TxState::default()),
        })
    }
}

#[derive(Default)]
struct TxState {
    active: bool,
    staged: Vec<(Destination, Message)>,
}

/// Connection to a [`MemoryBroker`]
pub struct MemoryAdapter {
    id: u64,
    broker: MemoryBroker,
    tx: Mutex<TxState>,
}

impl MemoryAdapter {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn check_alive(&self, inner: &Inner) -> ConnectorResult<()> {
        if inner.broken_adapters.contains(&self.id) {
            return Err(ConnectorError::resource_invalid(format!(
                "memory connection {} is broken",
                self.id
            )));
        }
        Ok(())
    }

    fn tx(&self) -> MutexGuard<'_, TxState> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    type Consumer = MemoryConsumer;

    async fn subscribe(
        &self,
        destination: &Destination,
        ack_mode: AckMode,
    ) -> ConnectorResult<MemoryConsumer> {
        let mut inner = self.broker.lock();
        self.check_alive(&inner)?;

        if let Some(limit) = inner.subscribe_limit {
            if inner.stats.subscriptions >= limit {
                return Err(ConnectorError::fatal(format!(
                    "subscription to {} rejected",
                    destination
                )));
            }
        }

        let id = inner.next_id();
        inner.stats.subscriptions += 1;
        if destination.is_topic() {
            inner
                .topics
                .entry(destination.name.clone())
                .or_default()
                .insert(id, VecDeque::new());
        }
        debug!(destination = %destination, consumer = id, ?ack_mode, "memory consumer subscribed");

        Ok(MemoryConsumer {
            id,
            adapter: self.id,
            destination: destination.clone(),
            broker: self.broker.clone(),
            in_flight: HashSet::new(),
            closed: false,
        })
    }

    fn max_consumers(&self, destination: &Destination) -> Option<usize> {
        (destination.is_topic() && self.broker.lock().single_topic_consumer).then_some(1)
    }

    fn set_exception_listener(&self, sender: ExceptionSender) {
        self.broker.lock().listeners.push(sender);
    }

    async fn send(&self, destination: &Destination, message: &Message) -> ConnectorResult<()> {
        let mut inner = self.broker.lock();
        self.check_alive(&inner)?;

        if inner.pending_send_failures > 0 {
            inner.pending_send_failures -= 1;
            return Err(ConnectorError::retryable(format!(
                "send to {} failed",
                destination
            )));
        }
        inner.stats.sends += 1;

        let mut tx = self.tx();
        if tx.active {
            tx.staged.push((destination.clone(), message.clone()));
        } else {
            drop(tx);
            inner.deliver(destination, message.clone());
            drop(inner);
            self.broker.wake();
        }
        Ok(())
    }

    async fn commit(&self) -> ConnectorResult<()> {
        let mut inner = self.broker.lock();
        self.check_alive(&inner)?;

        inner.commit_count += 1;
        let staged = {
            let mut tx = self.tx();
            tx.active = false;
            std::mem::take(&mut tx.staged)
        };

        if inner.failing_commits.contains(&inner.commit_count) {
            return Err(ConnectorError::retryable(format!(
                "commit {} rejected by broker",
                inner.commit_count
            )));
        }

        inner.stats.commits += 1;
        for (destination, message) in staged {
            inner.deliver(&destination, message);
        }
        drop(inner);
        self.broker.wake();
        Ok(())
    }

    async fn rollback(&self) -> ConnectorResult<()> {
        let mut tx = self.tx();
        tx.active = false;
        tx.staged.clear();
        drop(tx);
        self.broker.lock().stats.rollbacks += 1;
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    async fn begin(&self) -> ConnectorResult<()> {
        self.tx().active = true;
        Ok(())
    }

    async fn close(&self) -> ConnectorResult<()> {
        let mut inner = self.broker.lock();
        inner.live_adapters.remove(&self.id);
        inner.stats.connections_closed += 1;
        debug!(adapter = self.id, "memory adapter closed");
        Ok(())
    }
}

/// Subscription on a [`MemoryBroker`] destination
pub struct MemoryConsumer {
    id: u64,
    adapter: u64,
    destination: Destination,
    broker: MemoryBroker,
    in_flight: HashSet<u64>,
    closed: bool,
}

impl MemoryConsumer {
    fn try_take(&mut self) -> ConnectorResult<Option<Option<Message>>> {
        let mut inner = self.broker.lock();

        if let Some(fault) = inner.receive_faults.pop_front() {
            return Err(fault.into_error());
        }
        if inner.broken_adapters.contains(&self.adapter) {
            return Err(ConnectorError::resource_invalid(format!(
                "memory connection {} is broken",
                self.adapter
            )));
        }
        if self.closed || inner.subscriptions_ended {
            return Ok(Some(None));
        }

        let next = match self.destination.kind {
            DestinationKind::Queue => inner
                .queues
                .get_mut(&self.destination.name)
                .and_then(|q| q.pop_front()),
            DestinationKind::Topic => inner
                .topics
                .get_mut(&self.destination.name)
                .and_then(|subs| subs.get_mut(&self.id))
                .and_then(|q| q.pop_front()),
        };

        let Some(mut message) = next else {
            return Ok(None);
        };

        inner.next_tag += 1;
        message.delivery_tag = inner.next_tag;
        message.destination = Some(self.destination.name.clone());
        inner.stats.deliveries += 1;
        inner.unacked.insert(
            message.delivery_tag,
            Delivery {
                destination: self.destination.clone(),
                consumer: self.id,
                message: message.clone(),
            },
        );
        self.in_flight.insert(message.delivery_tag);
        Ok(Some(Some(message)))
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn receive(&mut self) -> ConnectorResult<Option<Message>> {
        loop {
            let state = self.broker.state.clone();
            let notified = state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_take()? {
                return Ok(result);
            }
            notified.await;
        }
    }

    async fn ack(&mut self, message: &Message) -> ConnectorResult<()> {
        let mut inner = self.broker.lock();
        if inner.unacked.remove(&message.delivery_tag).is_none() {
            return Err(ConnectorError::invalid_state(format!(
                "delivery {} is not outstanding",
                message.delivery_tag
            )));
        }
        self.in_flight.remove(&message.delivery_tag);
        inner.acked.insert(message.delivery_tag);
        inner.stats.acks += 1;
        Ok(())
    }

    async fn reject(&mut self, message: &Message) -> ConnectorResult<()> {
        let mut inner = self.broker.lock();
        if let Some(delivery) = inner.unacked.remove(&message.delivery_tag) {
            self.in_flight.remove(&message.delivery_tag);
            inner.stats.rejects += 1;
            inner.requeue(delivery);
        }
        drop(inner);
        self.broker.wake();
        Ok(())
    }

    async fn close(&mut self) -> ConnectorResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut inner = self.broker.lock();
        // unacknowledged messages go back for redelivery
        for tag in self.in_flight.drain() {
            if let Some(delivery) = inner.unacked.remove(&tag) {
                inner.requeue(delivery);
            }
        }
        if let Some(subscribers) = inner.topics.get_mut(&self.destination.name) {
            subscribers.remove(&self.id);
        }
        inner.stats.consumers_closed += 1;
        let failed = inner.pending_close_failures > 0;
        if failed {
            inner.pending_close_failures -= 1;
        }
        drop(inner);
        self.broker.wake();

        if failed {
            return Err(ConnectorError::fatal(format!(
                "memory consumer {} failed to close",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn adapter(broker: &MemoryBroker) -> MemoryAdapter {
        broker
            .factory()
            .create(&ResourceKey::new("memory"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_queue_competing_consumers() {
        let broker = MemoryBroker::new();
        let adapter = adapter(&broker).await;
        let queue = Destination::queue("work");

        let mut a = adapter.subscribe(&queue, AckMode::Client).await.unwrap();
        let mut b = adapter.subscribe(&queue, AckMode::Client).await.unwrap();
        broker.publish(&queue, Message::from_string("one"));
        broker.publish(&queue, Message::from_string("two"));

        let first = a.receive().await.unwrap().unwrap();
        let second = b.receive().await.unwrap().unwrap();
        assert_eq!(first.payload, b"one");
        assert_eq!(second.payload, b"two");
        assert_eq!(broker.unacked_count(), 2);

        a.ack(&first).await.unwrap();
        assert!(broker.is_acked(first.delivery_tag));
        assert!(a.ack(&first).await.is_err());
    }

    #[tokio::test]
    async fn test_unacked_redelivered_after_close() {
        let broker = MemoryBroker::new();
        let adapter = adapter(&broker).await;
        let queue = Destination::queue("work");
        broker.publish(&queue, Message::from_string("payload"));

        let mut consumer = adapter.subscribe(&queue, AckMode::Client).await.unwrap();
        let message = consumer.receive().await.unwrap().unwrap();
        consumer.close().await.unwrap();
        assert_eq!(broker.queue_depth("work"), 1);

        let mut again = adapter.subscribe(&queue, AckMode::Client).await.unwrap();
        let redelivered = again.receive().await.unwrap().unwrap();
        assert_eq!(redelivered.payload, message.payload);
        assert!(redelivered.is_redelivery());
        assert_ne!(redelivered.delivery_tag, message.delivery_tag);
    }

    #[tokio::test]
    async fn test_topic_broadcast() {
        let broker = MemoryBroker::new();
        let adapter = adapter(&broker).await;
        let topic = Destination::topic("events");

        let mut a = adapter.subscribe(&topic, AckMode::Auto).await.unwrap();
        let mut b = adapter.subscribe(&topic, AckMode::Auto).await.unwrap();
        broker.publish(&topic, Message::from_string("hello"));

        assert_eq!(a.receive().await.unwrap().unwrap().payload, b"hello");
        assert_eq!(b.receive().await.unwrap().unwrap().payload, b"hello");
    }

    #[tokio::test]
    async fn test_transaction_staging() {
        let broker = MemoryBroker::new();
        let adapter = adapter(&broker).await;
        let queue = Destination::queue("out");

        adapter.begin().await.unwrap();
        adapter.send(&queue, &Message::from_string("a")).await.unwrap();
        assert!(broker.published().is_empty());
        adapter.commit().await.unwrap();
        assert_eq!(broker.published_payloads(&queue), vec![b"a".to_vec()]);

        adapter.begin().await.unwrap();
        adapter.send(&queue, &Message::from_string("b")).await.unwrap();
        adapter.rollback().await.unwrap();
        assert_eq!(broker.published().len(), 1);
        assert_eq!(broker.stats().rollbacks, 1);
    }

    #[tokio::test]
    async fn test_broken_connection() {
        let broker = MemoryBroker::new();
        let adapter = adapter(&broker).await;
        broker.break_connections();

        let err = adapter
            .send(&Destination::queue("out"), &Message::from_string("x"))
            .await
            .unwrap_err();
        assert!(err.is_resource_invalid());
    }

    #[tokio::test]
    async fn test_receive_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let adapter = adapter(&broker).await;
        let queue = Destination::queue("late");
        let mut consumer = adapter.subscribe(&queue, AckMode::Client).await.unwrap();

        let publisher = broker.clone();
        let destination = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(&destination, Message::from_string("late"));
        });

        let message = consumer.receive().await.unwrap().unwrap();
        assert_eq!(message.payload, b"late");
    }
}
