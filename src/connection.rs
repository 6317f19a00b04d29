// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection
//!
//! The primitive operations every broker backend provides: declare, bind,
//! publish, consume, cancel and reconnect. Deliveries are pushed into a bounded
//! channel owned by the consumer; the bus drains it from a dedicated task per
//! entity.
//!
//! [`ConnectionRegistry`] maps bus names to their connection.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};
use tokio::sync::mpsc;

/// Name of the default exchange, routing directly to the queue named by the routing key
pub const DEFAULT_EXCHANGE: &str = "";

/// Capacity of the delivery channel between a broker consumer and its processing loop
pub const DELIVERY_BUFFER: usize = 256;

/// Message properties carried on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_type: Option<String>,
    pub priority: Option<u8>,
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// A message handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl OutgoingMessage {
    pub fn to_exchange(exchange: &str, routing_key: &str, body: Vec<u8>) -> OutgoingMessage {
        OutgoingMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            mandatory: false,
            body,
            properties: MessageProperties::default(),
        }
    }

    /// Sends through the default exchange to the queue named `queue`.
    pub fn to_queue(queue: &str, body: Vec<u8>) -> OutgoingMessage {
        OutgoingMessage::to_exchange(DEFAULT_EXCHANGE, queue, body)
    }

    pub fn properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message received from a queue.
pub struct BrokerDelivery {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub(crate) acker: Arc<dyn Acknowledger>,
}

impl BrokerDelivery {
    pub fn new(
        queue: &str,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
        acker: Arc<dyn Acknowledger>,
    ) -> BrokerDelivery {
        BrokerDelivery {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            body,
            properties,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for BrokerDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerDelivery")
            .field("queue", &self.queue)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub consumer_tag: String,
    pub prefetch_count: u16,
    pub exclusive: bool,
    pub priority: Option<i32>,
}

impl ConsumeOptions {
    pub fn new(consumer_tag: &str) -> ConsumeOptions {
        ConsumeOptions {
            consumer_tag: consumer_tag.to_owned(),
            prefetch_count: 0,
            exclusive: false,
            priority: None,
        }
    }
}

/// A registered consumer; deliveries stop when the broker side is cancelled.
#[derive(Debug)]
pub struct BrokerConsumer {
    pub tag: String,
    pub deliveries: mpsc::Receiver<BrokerDelivery>,
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn bus_name(&self) -> &str;

    /// Declares an exchange; succeeds without change when it already exists with equal properties.
    async fn create_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue and returns its actual name.
    async fn create_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn publish(&self, msg: OutgoingMessage) -> Result<(), AmqpError>;

    async fn consume(&self, queue: &str, options: &ConsumeOptions) -> Result<BrokerConsumer, AmqpError>;

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Re-establishes the physical connection after a failure.
    async fn reconnect(&self) -> Result<(), AmqpError>;

    /// Resolves once a connection-level failure has been observed.
    async fn connection_lost(&self);
}

/// Connections by bus name.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    connections: HashMap<String, Arc<dyn BrokerConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry::default()
    }

    /// Registers a connection under its own bus name.
    pub fn add(mut self, connection: Arc<dyn BrokerConnection>) -> Self {
        self.connections
            .insert(connection.bus_name().to_owned(), connection);
        self
    }

    pub fn contains(&self, bus_name: &str) -> bool {
        self.connections.contains_key(bus_name)
    }

    pub fn get(&self, bus_name: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        self.connections
            .get(bus_name)
            .cloned()
            .ok_or_else(|| AmqpError::UnknownBus(bus_name.to_owned()))
    }

    pub fn bus_names(&self) -> Vec<String> {
        self.connections.keys().cloned().collect()
    }
}
