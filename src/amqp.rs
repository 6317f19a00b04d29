// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Broker Connection
//!
//! [`BrokerConnection`] over lapin (AMQP 0-9-1). Declarations and publishes go
//! through the bus channel; every consumer gets its own channel so its prefetch
//! applies to it alone, and its lapin stream is forwarded into the bounded
//! delivery channel of the bus consumer.
//!
//! Connection errors reported by lapin wake [`connection_lost`](BrokerConnection::connection_lost);
//! [`reconnect`](BrokerConnection::reconnect) opens a new connection and channel.

use crate::{
    channel::new_amqp_channel,
    connection::{
        Acknowledger, BrokerConnection, BrokerConsumer, BrokerDelivery, ConnectionRegistry,
        ConsumeOptions, MessageProperties, OutgoingMessage, DELIVERY_BUFFER,
    },
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind, AMQP_HEADERS_ALTERNATE_EXCHANGE, AMQP_HEADERS_DELAYED_EXCHANGE_TYPE},
    queue::{QueueBinding, QueueDefinition},
    settings::{BrokerSettings, BusSettings},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    BasicProperties, Channel, Connection,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, error, warn};

/// Constant for the argument used to specify the dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify the message time-to-live
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify the maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify the maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";
/// Constant for the consumer argument used to specify its priority
pub const AMQP_HEADERS_CONSUMER_PRIORITY: &str = "x-priority";

/// Delivery mode marking a message as persistent
const PERSISTENT_DELIVERY_MODE: u8 = 2;

pub struct AmqpBrokerConnection {
    settings: BrokerSettings,
    link: RwLock<Option<(Arc<Connection>, Arc<Channel>)>>,
    consumers: Mutex<HashMap<String, Arc<Channel>>>,
    failed: Arc<Notify>,
}

impl AmqpBrokerConnection {
    /// Connects to the broker, retrying as configured.
    pub async fn connect(settings: BrokerSettings) -> Result<AmqpBrokerConnection, AmqpError> {
        let connection = AmqpBrokerConnection {
            settings,
            link: RwLock::new(None),
            consumers: Mutex::new(HashMap::default()),
            failed: Arc::new(Notify::new()),
        };
        connection.open().await?;
        Ok(connection)
    }

    /// Connects every configured bus.
    pub async fn connect_all(settings: &BusSettings) -> Result<ConnectionRegistry, AmqpError> {
        let mut registry = ConnectionRegistry::new();
        for broker in &settings.connections {
            let connection = AmqpBrokerConnection::connect(broker.clone()).await?;
            registry = registry.add(Arc::new(connection));
        }
        Ok(registry)
    }

    async fn open(&self) -> Result<(), AmqpError> {
        let (conn, channel) = new_amqp_channel(&self.settings).await?;

        let failed = self.failed.clone();
        let bus_name = self.settings.bus_name.clone();
        conn.on_error(move |err| {
            error!(error = err.to_string(), bus = bus_name.as_str(), "amqp connection failure");
            failed.notify_one();
        });

        *self.link.write().await = Some((conn, channel));
        Ok(())
    }

    async fn channel(&self) -> Result<Arc<Channel>, AmqpError> {
        match &*self.link.read().await {
            Some((_, channel)) if channel.status().connected() => Ok(channel.clone()),
            _ => Err(AmqpError::ConnectionClosed(self.settings.bus_name.clone())),
        }
    }

    async fn connection(&self) -> Result<Arc<Connection>, AmqpError> {
        match &*self.link.read().await {
            Some((conn, _)) if conn.status().connected() => Ok(conn.clone()),
            _ => Err(AmqpError::ConnectionClosed(self.settings.bus_name.clone())),
        }
    }
}

#[async_trait]
impl BrokerConnection for AmqpBrokerConnection {
    fn bus_name(&self) -> &str {
        &self.settings.bus_name
    }

    async fn create_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        match channel
            .exchange_declare(
                &def.name,
                def.kind.clone().try_into()?,
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                exchange_arguments(def),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name.as_str(), "error to declare the exchange");
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn create_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let channel = self.channel().await?;
        let name = if def.broker_named { "" } else { def.name.as_str() };

        match channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                queue_arguments(def),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name.as_str(), "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => {
                debug!("queue: {} was created", queue.name());
                Ok(queue.name().as_str().to_owned())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        match channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(&self, msg: OutgoingMessage) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        match channel
            .basic_publish(
                &msg.exchange,
                &msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: msg.mandatory,
                },
                &msg.body,
                basic_properties(&msg.properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(msg.exchange.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, options: &ConsumeOptions) -> Result<BrokerConsumer, AmqpError> {
        let channel = match self.connection().await?.create_channel().await {
            Ok(c) => Ok(Arc::new(c)),
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer channel");
                Err(AmqpError::ChannelError)
            }
        }?;

        if let Err(err) = channel
            .basic_qos(options.prefetch_count, BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), queue, "error to configure qos");
            return Err(AmqpError::QoSDeclarationError(queue.to_owned()));
        }

        let mut args = BTreeMap::new();
        if let Some(priority) = options.priority {
            args.insert(
                ShortString::from(AMQP_HEADERS_CONSUMER_PRIORITY),
                AMQPValue::LongInt(LongInt::from(priority)),
            );
        }

        let mut consumer = match channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::from(args),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(options.consumer_tag.clone(), channel);

        let (sender, deliveries) = mpsc::channel(DELIVERY_BUFFER);
        let queue_name = queue.to_owned();

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        if sender.send(to_delivery(&queue_name, delivery)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        error!(error = err.to_string(), queue = queue_name.as_str(), "errors consume msg");
                        break;
                    }
                }
            }
            debug!(queue = queue_name.as_str(), "amqp consumer stream ended");
        });

        Ok(BrokerConsumer {
            tag: options.consumer_tag.clone(),
            deliveries,
        })
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let channel = self
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(consumer_tag);

        let Some(channel) = channel else {
            return Ok(());
        };

        if !channel.status().connected() {
            return Ok(());
        }

        if let Err(err) = channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
        {
            error!(error = err.to_string(), tag = consumer_tag, "error to cancel consumer");
            return Err(AmqpError::CancelConsumerError(consumer_tag.to_owned()));
        }

        if let Err(err) = channel.close(200, "consumer cancelled").await {
            warn!(error = err.to_string(), tag = consumer_tag, "error to close consumer channel");
        }

        Ok(())
    }

    async fn reconnect(&self) -> Result<(), AmqpError> {
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        if let Some((conn, _)) = self.link.write().await.take() {
            if conn.status().connected() {
                if let Err(err) = conn.close(200, "reconnecting").await {
                    warn!(error = err.to_string(), "error to close previous connection");
                }
            }
        }

        self.open().await
    }

    async fn connection_lost(&self) {
        self.failed.notified().await
    }
}

/// Exchange arguments: the delayed type and the alternate exchange.
fn exchange_arguments(def: &ExchangeDefinition) -> FieldTable {
    let mut args = BTreeMap::new();

    if let Some(kind) = &def.delayed_kind {
        args.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from(kind_name(kind))),
        );
    }

    if let Some(alternate) = &def.alternate_exchange {
        args.insert(
            ShortString::from(AMQP_HEADERS_ALTERNATE_EXCHANGE),
            AMQPValue::LongString(LongString::from(alternate.clone())),
        );
    }

    FieldTable::from(args)
}

fn kind_name(kind: &ExchangeKind) -> &'static str {
    match kind {
        ExchangeKind::Direct => "direct",
        ExchangeKind::Fanout => "fanout",
        ExchangeKind::Topic => "topic",
        ExchangeKind::Headers => "headers",
        ExchangeKind::XMessageDelayed => "x-delayed-message",
    }
}

/// Queue arguments: TTL, max length and the dead letter exchange.
fn queue_arguments(def: &QueueDefinition) -> FieldTable {
    let mut args = BTreeMap::new();

    if let Some(dlx) = &def.dead_letter_exchange {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(dlx.clone())),
        );
    }

    if let Some(ttl) = def.ttl {
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }

    if let Some(max) = def.max_length {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    if let Some(max) = def.max_length_bytes {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    FieldTable::from(args)
}

fn basic_properties(props: &MessageProperties) -> BasicProperties {
    let headers: BTreeMap<ShortString, AMQPValue> = props
        .headers
        .iter()
        .map(|(k, v)| {
            (
                ShortString::from(k.clone()),
                AMQPValue::LongString(LongString::from(v.clone())),
            )
        })
        .collect();

    let mut properties = BasicProperties::default().with_headers(FieldTable::from(headers));

    if let Some(content_type) = &props.content_type {
        properties = properties.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(id) = &props.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(id) = &props.message_id {
        properties = properties.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(reply_to) = &props.reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(kind) = &props.message_type {
        properties = properties.with_type(ShortString::from(kind.clone()));
    }
    if let Some(priority) = props.priority {
        properties = properties.with_priority(priority);
    }
    if props.persistent {
        properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }

    properties
}

fn header_value(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
        AMQPValue::Boolean(v) => Some(v.to_string()),
        AMQPValue::ShortInt(v) => Some(v.to_string()),
        AMQPValue::LongInt(v) => Some(v.to_string()),
        AMQPValue::LongLongInt(v) => Some(v.to_string()),
        AMQPValue::LongUInt(v) => Some(v.to_string()),
        _ => None,
    }
}

fn message_properties(props: &BasicProperties) -> MessageProperties {
    let text = |value: &Option<ShortString>| value.as_ref().map(|v| v.as_str().to_owned());

    let headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(k, v)| header_value(v).map(|v| (k.as_str().to_owned(), v)))
                .collect()
        })
        .unwrap_or_default();

    MessageProperties {
        content_type: text(props.content_type()),
        correlation_id: text(props.correlation_id()),
        message_id: text(props.message_id()),
        reply_to: text(props.reply_to()),
        message_type: text(props.kind()),
        priority: *props.priority(),
        persistent: *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        headers,
    }
}

fn to_delivery(queue: &str, delivery: Delivery) -> BrokerDelivery {
    let mut converted = BrokerDelivery::new(
        queue,
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        delivery.data,
        message_properties(&delivery.properties),
        Arc::new(LapinAcker {
            acker: delivery.acker,
        }),
    );
    converted.redelivered = delivery.redelivered;
    converted
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::RejectMessageError
            })
    }
}
