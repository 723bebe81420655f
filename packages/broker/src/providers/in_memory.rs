//! In-memory broker for tests and local development.
//!
//! Implements the subset of AMQP 0.9.1 behavior the relay depends on:
//! - direct exchanges plus the default exchange (routes by queue name)
//! - server-named exclusive queues owned by the declaring session
//! - round-robin consumers limited by the session prefetch
//! - manual acknowledgement with requeue, and dead-lettering on reject
//!
//! Closing or dropping a session cancels its consumers, requeues whatever it
//! left unacknowledged and deletes its exclusive queues, the same way a
//! broker reacts to a closed channel.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::error::BrokerError;
use crate::traits::{Broker, Session};
use crate::types::{
    Acknowledger, ConsumeOptions, Delivery, DeliveryStream, MessageProperties, OutboundMessage,
    QueueOptions,
};

type SessionId = u64;

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct ExchangeState {
    durable: bool,
    /// (binding key, queue name)
    bindings: Vec<(String, String)>,
}

struct ConsumerSlot {
    id: u64,
    session: SessionId,
    auto_ack: bool,
    /// 0 means unlimited.
    prefetch: u16,
    in_flight: usize,
    tx: mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.auto_ack || self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct Unacked {
    consumer: u64,
    session: SessionId,
    message: StoredMessage,
}

#[derive(Default)]
struct QueueState {
    options: QueueOptions,
    owner: Option<SessionId>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
    unacked: HashMap<u64, Unacked>,
    dead_letters: Vec<StoredMessage>,
    published: u64,
    delivered: u64,
    acked: u64,
    requeued: u64,
    dropped: u64,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    /// Open sessions and their prefetch setting.
    sessions: HashMap<SessionId, u16>,
    next_id: u64,
    unroutable: u64,
    fail_declarations: bool,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Snapshot of a queue's depth and counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub unacked: usize,
    pub consumers: usize,
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    /// Rejected without requeue.
    pub dropped: u64,
}

/// Shared in-memory broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("InMemoryBroker")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .field("sessions", &state.sessions.len())
            .finish()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_stats(&self, queue: &str) -> Option<QueueStats> {
        let state = lock(&self.state);
        state.queues.get(queue).map(|q| QueueStats {
            ready: q.ready.len(),
            unacked: q.unacked.len(),
            consumers: q.consumers.len(),
            published: q.published,
            delivered: q.delivered,
            acked: q.acked,
            requeued: q.requeued,
            dropped: q.dropped,
        })
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        lock(&self.state).queues.contains_key(queue)
    }

    /// Messages rejected without requeue from `queue`.
    pub fn dead_letters(&self, queue: &str) -> Vec<OutboundMessage> {
        let state = lock(&self.state);
        state
            .queues
            .get(queue)
            .map(|q| {
                q.dead_letters
                    .iter()
                    .map(|m| OutboundMessage::new(m.body.clone(), m.properties.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn open_sessions(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    /// Messages published that matched no queue.
    pub fn unroutable(&self) -> u64 {
        lock(&self.state).unroutable
    }

    /// Make every subsequent exchange or queue declaration fail.
    pub fn fail_declarations(&self, fail: bool) {
        lock(&self.state).fail_declarations = fail;
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn open_session(&self) -> Result<Arc<dyn Session>, BrokerError> {
        let id = {
            let mut state = lock(&self.state);
            let id = state.next_id();
            state.sessions.insert(id, 0);
            id
        };
        Ok(Arc::new(InMemorySession {
            id,
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}

/// A channel on an [`InMemoryBroker`].
pub struct InMemorySession {
    id: SessionId,
    state: Arc<Mutex<State>>,
    closed: AtomicBool,
}

impl InMemorySession {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let mut state = lock(&self.state);
            close_session(&self.state, &mut state, self.id);
        }
    }
}

#[async_trait]
impl Session for InMemorySession {
    async fn declare_exchange(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        if state.fail_declarations {
            return Err(BrokerError::declare("exchange", name, "declarations disabled"));
        }
        if name.is_empty() {
            return Err(BrokerError::declare(
                "exchange",
                name,
                "the default exchange is predeclared",
            ));
        }
        match state.exchanges.get(name) {
            Some(existing) if existing.durable != durable => Err(BrokerError::declare(
                "exchange",
                name,
                "inequivalent arg 'durable'",
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, BrokerError> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        if state.fail_declarations {
            return Err(BrokerError::declare("queue", name, "declarations disabled"));
        }
        let name = if name.is_empty() {
            format!("amq.gen-{}", state.next_id())
        } else {
            name.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.owner.is_some_and(|owner| owner != self.id) {
                return Err(BrokerError::ResourceLocked(name));
            }
            if existing.options.durable != options.durable {
                return Err(BrokerError::declare("queue", name, "inequivalent arg 'durable'"));
            }
            return Ok(name);
        }

        state.queues.insert(
            name.clone(),
            QueueState {
                options,
                owner: options.exclusive.then_some(self.id),
                ..Default::default()
            },
        );
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let exchange_state = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
        let binding = (routing_key.to_string(), queue.to_string());
        if !exchange_state.bindings.contains(&binding) {
            exchange_state.bindings.push(binding);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.ensure_open()?;
        lock(&self.state).sessions.insert(self.id, count);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        route(&self.state, &mut state, exchange, routing_key, message)
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        let prefetch = state.sessions.get(&self.id).copied().unwrap_or(0);
        let consumer_id = state.next_id();

        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        if queue_state.owner.is_some_and(|owner| owner != self.id) {
            return Err(BrokerError::ResourceLocked(queue.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        queue_state.consumers.push(ConsumerSlot {
            id: consumer_id,
            session: self.id,
            auto_ack: options.auto_ack,
            prefetch,
            in_flight: 0,
            tx,
        });
        pump(&self.state, &mut state, queue);

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let mut state = lock(&self.state);
            close_session(&self.state, &mut state, self.id);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}

struct MemoryAcker {
    state: Arc<Mutex<State>>,
    queue: String,
    tag: u64,
}

enum Outcome {
    Ack,
    Requeue,
    Reject,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        settle(&self.state, &self.queue, self.tag, Outcome::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        let outcome = if requeue { Outcome::Requeue } else { Outcome::Reject };
        settle(&self.state, &self.queue, self.tag, outcome)
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn route(
    shared: &Arc<Mutex<State>>,
    state: &mut State,
    exchange: &str,
    routing_key: &str,
    message: OutboundMessage,
) -> Result<(), BrokerError> {
    let targets: Vec<String> = if exchange.is_empty() {
        if state.queues.contains_key(routing_key) {
            vec![routing_key.to_string()]
        } else {
            Vec::new()
        }
    } else {
        let exchange_state = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
        exchange_state
            .bindings
            .iter()
            .filter(|(key, _)| key == routing_key)
            .map(|(_, queue)| queue.clone())
            .collect()
    };

    if targets.is_empty() {
        state.unroutable += 1;
        tracing::debug!(
            "Discarding unroutable message: exchange='{}' key='{}'",
            exchange,
            routing_key
        );
        return Ok(());
    }

    for name in &targets {
        if let Some(queue) = state.queues.get_mut(name) {
            queue.ready.push_back(StoredMessage {
                body: message.body.clone(),
                properties: message.properties.clone(),
                redelivered: false,
            });
            queue.published += 1;
        }
        pump(shared, state, name);
    }
    Ok(())
}

/// Hand ready messages to consumers with spare prefetch, round-robin.
fn pump(shared: &Arc<Mutex<State>>, state: &mut State, queue_name: &str) {
    let State { queues, next_id, .. } = state;
    let Some(queue) = queues.get_mut(queue_name) else {
        return;
    };

    while !queue.ready.is_empty() {
        let count = queue.consumers.len();
        let Some(index) = (0..count)
            .map(|offset| (queue.cursor + offset) % count)
            .find(|&i| queue.consumers[i].has_capacity())
        else {
            break;
        };
        let Some(message) = queue.ready.pop_front() else {
            break;
        };
        *next_id += 1;
        let tag = *next_id;

        let consumer = &mut queue.consumers[index];
        let delivery = if consumer.auto_ack {
            Delivery::auto_acked(message.body.clone(), message.properties.clone(), tag)
        } else {
            let acker = Arc::new(MemoryAcker {
                state: Arc::clone(shared),
                queue: queue_name.to_string(),
                tag,
            });
            Delivery::new(
                message.body.clone(),
                message.properties.clone(),
                tag,
                message.redelivered,
                acker,
            )
        };

        if consumer.tx.send(Ok(delivery)).is_err() {
            // Receiving stream was dropped; treat as a cancelled consumer.
            queue.ready.push_front(message);
            queue.consumers.remove(index);
            continue;
        }

        queue.cursor = (index + 1) % count;
        queue.delivered += 1;
        if !consumer.auto_ack {
            consumer.in_flight += 1;
            queue.unacked.insert(
                tag,
                Unacked {
                    consumer: consumer.id,
                    session: consumer.session,
                    message,
                },
            );
        }
    }
}

fn settle(
    shared: &Arc<Mutex<State>>,
    queue_name: &str,
    tag: u64,
    outcome: Outcome,
) -> Result<(), BrokerError> {
    let mut state = lock(shared);
    let queue = state
        .queues
        .get_mut(queue_name)
        .ok_or_else(|| BrokerError::QueueNotFound(queue_name.to_string()))?;
    let entry = queue
        .unacked
        .remove(&tag)
        .ok_or_else(|| BrokerError::Acknowledge(format!("unknown delivery tag {tag}")))?;
    if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.id == entry.consumer) {
        consumer.in_flight = consumer.in_flight.saturating_sub(1);
    }

    match outcome {
        Outcome::Ack => queue.acked += 1,
        Outcome::Requeue => {
            let mut message = entry.message;
            message.redelivered = true;
            queue.ready.push_front(message);
            queue.requeued += 1;
        }
        Outcome::Reject => {
            queue.dead_letters.push(entry.message);
            queue.dropped += 1;
        }
    }

    pump(shared, &mut state, queue_name);
    Ok(())
}

fn close_session(shared: &Arc<Mutex<State>>, state: &mut State, session: SessionId) {
    if state.sessions.remove(&session).is_none() {
        return;
    }

    let mut doomed = Vec::new();
    let mut touched = Vec::new();
    for (name, queue) in state.queues.iter_mut() {
        let before = queue.consumers.len();
        queue.consumers.retain(|c| c.session != session);
        let lost_consumers = queue.consumers.len() < before;

        let tags: Vec<u64> = queue
            .unacked
            .iter()
            .filter(|(_, entry)| entry.session == session)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(entry) = queue.unacked.remove(&tag) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.ready.push_front(message);
                queue.requeued += 1;
            }
        }

        let orphaned = queue.options.auto_delete && lost_consumers && queue.consumers.is_empty();
        if queue.owner == Some(session) || orphaned {
            doomed.push(name.clone());
        } else {
            touched.push(name.clone());
        }
    }

    for name in &doomed {
        state.queues.remove(name);
        for exchange in state.exchanges.values_mut() {
            exchange.bindings.retain(|(_, queue)| queue != name);
        }
    }
    for name in &touched {
        pump(shared, state, name);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use crate::types::DeliveryMode;

    fn message(body: &str) -> OutboundMessage {
        OutboundMessage::new(
            body.as_bytes().to_vec(),
            MessageProperties::default().with_delivery_mode(DeliveryMode::Persistent),
        )
    }

    async fn next(stream: &mut DeliveryStream) -> Delivery {
        stream.next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn default_exchange_routes_by_queue_name() {
        let broker = InMemoryBroker::new();
        let session = broker.open_session().await.unwrap();
        let queue = session.declare_queue("", QueueOptions::ephemeral()).await.unwrap();
        assert!(queue.starts_with("amq.gen-"));

        session.publish("", &queue, message("hello")).await.unwrap();
        session.publish("", "nobody-home", message("lost")).await.unwrap();

        let mut stream = session.consume(&queue, ConsumeOptions { auto_ack: true }).await.unwrap();
        let delivery = next(&mut stream).await;
        assert_eq!(delivery.body, b"hello");
        assert!(delivery.is_settled());
        assert_eq!(broker.unroutable(), 1);
    }

    #[tokio::test]
    async fn unknown_exchange_is_an_error() {
        let broker = InMemoryBroker::new();
        let session = broker.open_session().await.unwrap();
        let err = session.publish("missing", "", message("x")).await.unwrap_err();
        assert!(matches!(err, BrokerError::ExchangeNotFound(_)));
    }

    #[tokio::test]
    async fn prefetch_limits_unacked_deliveries_per_consumer() {
        let broker = InMemoryBroker::new();
        let setup = broker.open_session().await.unwrap();
        setup.declare_queue("work", QueueOptions::durable()).await.unwrap();

        let worker_a = broker.open_session().await.unwrap();
        let worker_b = broker.open_session().await.unwrap();
        worker_a.set_prefetch(1).await.unwrap();
        worker_b.set_prefetch(1).await.unwrap();
        let mut stream_a = worker_a.consume("work", ConsumeOptions::default()).await.unwrap();
        let mut stream_b = worker_b.consume("work", ConsumeOptions::default()).await.unwrap();

        for body in ["one", "two", "three"] {
            setup.publish("", "work", message(body)).await.unwrap();
        }

        let first_a = next(&mut stream_a).await;
        let first_b = next(&mut stream_b).await;
        assert_eq!(first_a.body, b"one");
        assert_eq!(first_b.body, b"two");

        let stats = broker.queue_stats("work").unwrap();
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.unacked, 2);

        first_b.ack().await.unwrap();
        let second_b = next(&mut stream_b).await;
        assert_eq!(second_b.body, b"three");
        assert_eq!(broker.queue_stats("work").unwrap().acked, 1);
    }

    #[tokio::test]
    async fn nack_requeues_or_dead_letters() {
        let broker = InMemoryBroker::new();
        let session = broker.open_session().await.unwrap();
        session.declare_queue("work", QueueOptions::durable()).await.unwrap();
        session.set_prefetch(1).await.unwrap();
        let mut stream = session.consume("work", ConsumeOptions::default()).await.unwrap();

        session.publish("", "work", message("again")).await.unwrap();
        let first = next(&mut stream).await;
        assert!(!first.redelivered);
        first.nack(true).await.unwrap();

        let second = next(&mut stream).await;
        assert!(second.redelivered);
        second.nack(false).await.unwrap();

        let stats = broker.queue_stats("work").unwrap();
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.ready, 0);
        assert_eq!(broker.dead_letters("work")[0].body, b"again");
    }

    #[tokio::test]
    async fn closing_a_session_cleans_up_after_it() {
        let broker = InMemoryBroker::new();
        let setup = broker.open_session().await.unwrap();
        setup.declare_queue("work", QueueOptions::durable()).await.unwrap();
        setup.publish("", "work", message("job")).await.unwrap();

        let worker = broker.open_session().await.unwrap();
        let reply_queue = worker.declare_queue("", QueueOptions::ephemeral()).await.unwrap();
        let mut stream = worker.consume("work", ConsumeOptions::default()).await.unwrap();
        let _held = next(&mut stream).await;
        assert_eq!(broker.queue_stats("work").unwrap().unacked, 1);

        drop(stream);
        drop(worker);

        assert!(!broker.queue_exists(&reply_queue));
        let stats = broker.queue_stats("work").unwrap();
        assert_eq!(stats.unacked, 0);
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.consumers, 0);
        assert_eq!(broker.open_sessions(), 1);
    }

    #[tokio::test]
    async fn exclusive_queues_are_private() {
        let broker = InMemoryBroker::new();
        let owner = broker.open_session().await.unwrap();
        let other = broker.open_session().await.unwrap();
        let queue = owner.declare_queue("", QueueOptions::ephemeral()).await.unwrap();

        let Err(err) = other.consume(&queue, ConsumeOptions { auto_ack: true }).await else {
            panic!("expected consume on exclusive queue to fail");
        };
        assert!(matches!(err, BrokerError::ResourceLocked(_)));
    }

    #[tokio::test]
    async fn closed_sessions_reject_operations() {
        let broker = InMemoryBroker::new();
        let session = broker.open_session().await.unwrap();
        session.close().await.unwrap();
        assert!(!session.is_open());
        assert!(matches!(
            session.declare_queue("q", QueueOptions::durable()).await,
            Err(BrokerError::Closed)
        ));
    }
}
