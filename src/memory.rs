// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A [`BrokerConnection`] living entirely in the process, useful for:
//! - Unit and integration testing without a running broker
//! - Single-process deployments and prototyping
//!
//! It follows the broker semantics the bus depends on: declarations are
//! idempotent and reject inequivalent redeclaration, the default exchange routes
//! by queue name, direct/fanout/topic exchanges route through bindings,
//! unroutable messages go to the alternate exchange, messages wait in their
//! queue until a consumer takes them and rejected messages can be requeued.
//! A connection failure can be simulated to exercise recovery.

use crate::{
    connection::{
        Acknowledger, BrokerConnection, BrokerConsumer, BrokerDelivery, ConsumeOptions,
        MessageProperties, OutgoingMessage, DEFAULT_EXCHANGE, DELIVERY_BUFFER,
    },
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};
use tokio::sync::{mpsc, Notify};
use tracing::debug;

/// Alternate exchanges are followed at most this many hops
const MAX_ALTERNATE_HOPS: usize = 4;

/// Handle on a shared in-memory broker.
///
/// Every clone shares the broker state but observes connection failures on
/// its own, like separate connections to the same server.
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
    failed: Arc<Notify>,
}

struct BrokerInner {
    bus_name: String,
    state: Mutex<BrokerState>,
    listeners: Mutex<Vec<Weak<Notify>>>,
}

impl BrokerInner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listen(self: &Arc<Self>) -> InMemoryBroker {
        let failed = Arc::new(Notify::new());
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&failed));

        InMemoryBroker {
            inner: self.clone(),
            failed,
        }
    }
}

impl Clone for InMemoryBroker {
    fn clone(&self) -> Self {
        self.inner.listen()
    }
}

struct BrokerState {
    connected: bool,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<QueueBinding>,
    consumers: Vec<MemoryConsumer>,
    published: Vec<OutgoingMessage>,
    publish_failure: Option<AmqpError>,
    acked: usize,
    rejected: usize,
    generated_names: usize,
}

struct MemoryQueue {
    definition: QueueDefinition,
    messages: VecDeque<StoredMessage>,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    body: Vec<u8>,
    properties: MessageProperties,
}

struct MemoryConsumer {
    tag: String,
    queue: String,
    exclusive: bool,
    sender: mpsc::Sender<BrokerDelivery>,
}

impl InMemoryBroker {
    pub fn new(bus_name: &str) -> InMemoryBroker {
        let inner = Arc::new(BrokerInner {
            bus_name: bus_name.to_owned(),
            state: Mutex::new(BrokerState {
                connected: true,
                exchanges: HashMap::default(),
                queues: HashMap::default(),
                bindings: vec![],
                consumers: vec![],
                published: vec![],
                publish_failure: None,
                acked: 0,
                rejected: 0,
                generated_names: 0,
            }),
            listeners: Mutex::new(vec![]),
        });
        inner.listen()
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        self.inner.state().exchanges.get(name).cloned()
    }

    pub fn exchange_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state().exchanges.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue(&self, name: &str) -> Option<QueueDefinition> {
        self.inner
            .state()
            .queues
            .get(name)
            .map(|q| q.definition.clone())
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.inner.state().bindings.iter().any(|b| {
            b.queue_name == queue && b.exchange_name == exchange && b.routing_key == routing_key
        })
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .state()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .state()
            .consumers
            .iter()
            .filter(|c| c.queue == queue && !c.sender.is_closed())
            .count()
    }

    /// Every message accepted by `publish`, routed or not.
    pub fn published(&self) -> Vec<OutgoingMessage> {
        self.inner.state().published.clone()
    }

    /// Messages published to the default exchange for `queue`.
    pub fn published_to_queue(&self, queue: &str) -> Vec<OutgoingMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.exchange == DEFAULT_EXCHANGE && m.routing_key == queue)
            .collect()
    }

    pub fn acked(&self) -> usize {
        self.inner.state().acked
    }

    pub fn rejected(&self) -> usize {
        self.inner.state().rejected
    }

    /// Makes every following publish fail with `err`; `None` restores normal publishing.
    pub fn fail_publishes(&self, err: Option<AmqpError>) {
        self.inner.state().publish_failure = err;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state().connected
    }

    /// Drops the connection: consumers are cancelled, exclusive and auto-delete
    /// queues are removed, and operations fail until `reconnect`.
    pub fn simulate_connection_failure(&self) {
        {
            let mut state = self.inner.state();
            state.connected = false;
            state.consumers.clear();

            let removed: Vec<String> = state
                .queues
                .iter()
                .filter(|(_, q)| q.definition.exclusive || q.definition.delete)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &removed {
                state.queues.remove(name);
            }
            state.bindings.retain(|b| !removed.contains(&b.queue_name));
        }

        debug!(bus = self.inner.bus_name.as_str(), "simulated connection failure");
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|listener| match listener.upgrade() {
                Some(failed) => {
                    failed.notify_one();
                    true
                }
                None => false,
            });
    }

    fn ensure_connected(&self, state: &BrokerState) -> Result<(), AmqpError> {
        if state.connected {
            Ok(())
        } else {
            Err(AmqpError::ConnectionClosed(self.inner.bus_name.clone()))
        }
    }
}

#[async_trait]
impl BrokerConnection for InMemoryBroker {
    fn bus_name(&self) -> &str {
        &self.inner.bus_name
    }

    async fn create_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.inner.state();
        self.ensure_connected(&state)?;

        match state.exchanges.get(&def.name) {
            Some(existing) if equivalent_exchange(existing, def) => Ok(()),
            Some(_) => Err(AmqpError::DeclareExchangeError(def.name.clone())),
            None if def.passive => Err(AmqpError::DeclareExchangeError(def.name.clone())),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn create_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let mut state = self.inner.state();
        self.ensure_connected(&state)?;

        let name = if def.broker_named {
            state.generated_names += 1;
            format!("amq.gen-{}", state.generated_names)
        } else {
            def.name.clone()
        };

        match state.queues.get(&name) {
            Some(existing) if equivalent_queue(&existing.definition, def) => Ok(name),
            Some(_) => Err(AmqpError::DeclareQueueError(name)),
            None if def.passive => Err(AmqpError::DeclareQueueError(name)),
            None => {
                state.queues.insert(
                    name.clone(),
                    MemoryQueue {
                        definition: def.renamed(&name),
                        messages: VecDeque::new(),
                    },
                );
                Ok(name)
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.inner.state();
        self.ensure_connected(&state)?;

        if !state.queues.contains_key(&binding.queue_name)
            || !state.exchanges.contains_key(&binding.exchange_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(&self, msg: OutgoingMessage) -> Result<(), AmqpError> {
        let mut state = self.inner.state();
        self.ensure_connected(&state)?;

        if let Some(err) = &state.publish_failure {
            return Err(err.clone());
        }

        let targets = if msg.exchange == DEFAULT_EXCHANGE {
            if state.queues.contains_key(&msg.routing_key) {
                vec![msg.routing_key.clone()]
            } else {
                vec![]
            }
        } else if state.exchanges.contains_key(&msg.exchange) {
            route(&state, &msg.exchange, &msg.routing_key, 0)
        } else {
            return Err(AmqpError::ExchangeNotFound(msg.exchange.clone()));
        };

        if targets.is_empty() {
            debug!(
                exchange = msg.exchange.as_str(),
                routing_key = msg.routing_key.as_str(),
                "message unroutable, dropped"
            );
        }

        let stored = StoredMessage {
            exchange: msg.exchange.clone(),
            routing_key: msg.routing_key.clone(),
            redelivered: false,
            body: msg.body.clone(),
            properties: msg.properties.clone(),
        };
        state.published.push(msg);

        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.messages.push_back(stored.clone());
            }
            pump(&self.inner, &mut state, &queue);
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, options: &ConsumeOptions) -> Result<BrokerConsumer, AmqpError> {
        let mut state = self.inner.state();
        self.ensure_connected(&state)?;

        if !state.queues.contains_key(queue) {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        }

        state.consumers.retain(|c| !c.sender.is_closed());
        let active: Vec<&MemoryConsumer> = state.consumers.iter().filter(|c| c.queue == queue).collect();
        if active.iter().any(|c| c.exclusive) || (options.exclusive && !active.is_empty()) {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        }

        let (sender, deliveries) = mpsc::channel(DELIVERY_BUFFER);
        state.consumers.push(MemoryConsumer {
            tag: options.consumer_tag.clone(),
            queue: queue.to_owned(),
            exclusive: options.exclusive,
            sender,
        });
        pump(&self.inner, &mut state, queue);

        Ok(BrokerConsumer {
            tag: options.consumer_tag.clone(),
            deliveries,
        })
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.inner.state().consumers.retain(|c| c.tag != consumer_tag);
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), AmqpError> {
        self.inner.state().connected = true;
        debug!(bus = self.inner.bus_name.as_str(), "reconnected");
        Ok(())
    }

    async fn connection_lost(&self) {
        self.failed.notified().await
    }
}

/// Hands waiting messages of `queue` to its consumers until they stop accepting.
fn pump(inner: &Arc<BrokerInner>, state: &mut BrokerState, queue: &str) {
    state.consumers.retain(|c| !c.sender.is_closed());

    let Some(q) = state.queues.get_mut(queue) else {
        return;
    };

    for consumer in state.consumers.iter().filter(|c| c.queue == queue) {
        while let Some(stored) = q.messages.pop_front() {
            let delivery = BrokerDelivery {
                queue: queue.to_owned(),
                exchange: stored.exchange.clone(),
                routing_key: stored.routing_key.clone(),
                redelivered: stored.redelivered,
                body: stored.body.clone(),
                properties: stored.properties.clone(),
                acker: Arc::new(MemoryAcker {
                    broker: inner.clone(),
                    queue: queue.to_owned(),
                    message: stored.clone(),
                    settled: AtomicBool::new(false),
                }),
            };

            if consumer.sender.try_send(delivery).is_err() {
                q.messages.push_front(stored);
                break;
            }
        }
    }
}

fn route(state: &BrokerState, exchange: &str, routing_key: &str, hops: usize) -> Vec<String> {
    let Some(def) = state.exchanges.get(exchange) else {
        return vec![];
    };

    let mut targets: Vec<String> = vec![];
    for binding in state.bindings.iter().filter(|b| b.exchange_name == exchange) {
        let matches = match def.routing_kind() {
            ExchangeKind::Fanout | ExchangeKind::Headers => true,
            ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            _ => binding.routing_key == routing_key,
        };
        if matches && !targets.contains(&binding.queue_name) {
            targets.push(binding.queue_name.clone());
        }
    }

    if targets.is_empty() && hops < MAX_ALTERNATE_HOPS {
        if let Some(alternate) = &def.alternate_exchange {
            return route(state, alternate, routing_key, hops + 1);
        }
    }

    targets
}

/// AMQP topic matching: `*` matches one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|i| matches(rest, &key[i..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

fn equivalent_exchange(a: &ExchangeDefinition, b: &ExchangeDefinition) -> bool {
    b.passive
        || (a.kind == b.kind
            && a.durable == b.durable
            && a.delete == b.delete
            && a.internal == b.internal
            && a.delayed_kind == b.delayed_kind
            && a.alternate_exchange == b.alternate_exchange)
}

fn equivalent_queue(a: &QueueDefinition, b: &QueueDefinition) -> bool {
    b.passive
        || (a.durable == b.durable
            && a.exclusive == b.exclusive
            && a.delete == b.delete
            && a.ttl == b.ttl
            && a.max_length == b.max_length
            && a.max_length_bytes == b.max_length_bytes
            && a.dead_letter_exchange == b.dead_letter_exchange)
}

struct MemoryAcker {
    broker: Arc<BrokerInner>,
    queue: String,
    message: StoredMessage,
    settled: AtomicBool,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::AckMessageError);
        }

        let mut state = self.broker.state();
        state.acked += 1;
        pump(&self.broker, &mut state, &self.queue);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::RejectMessageError);
        }

        let mut state = self.broker.state();
        state.rejected += 1;
        if requeue {
            if let Some(q) = state.queues.get_mut(&self.queue) {
                let mut message = self.message.clone();
                message.redelivered = true;
                q.messages.push_front(message);
            }
        }
        pump(&self.broker, &mut state, &self.queue);
        Ok(())
    }
}
