// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions and Metadata
//!
//! [`QueueDefinition`] describes what gets declared on the broker, including the
//! dead-letter exchange messages are rejected to. [`QueueMeta`] describes a work
//! queue (commands sent straight to a named queue) and [`SubscriptionMeta`] a
//! queue bound to an exchange to receive its events.

use crate::{dispatcher::DispatchInfo, message::Message, settings::QueueSettings};

/// Definition of a queue with its declaration parameters.
///
/// Supports message TTL, max length and a dead-letter exchange. A queue with
/// `broker_named` set is declared with an empty name and the broker picks one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) broker_named: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dead_letter_exchange: Option<String>,
}

impl QueueDefinition {
    /// Creates a non-durable, non-exclusive queue definition.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    pub fn get_dead_letter_exchange(&self) -> Option<&str> {
        self.dead_letter_exchange.as_deref()
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// The broker assigns the queue name on declaration.
    pub fn broker_named(mut self) -> Self {
        self.broker_named = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Rejected and expired messages are forwarded to this exchange.
    pub fn dead_letter_exchange(mut self, name: &str) -> Self {
        self.dead_letter_exchange = Some(name.to_owned());
        self
    }

    pub(crate) fn renamed(&self, name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..self.clone()
        }
    }
}

/// Binding of a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// The exchange name and routing key start empty.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::default(),
            routing_key: String::default(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

/// Consumer-side settings shared by every consuming entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub(crate) prefetch_count: u16,
    pub(crate) exclusive: bool,
    pub(crate) priority: Option<i32>,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        ConsumerSettings {
            prefetch_count: 10,
            exclusive: false,
            priority: None,
        }
    }
}

/// A work queue: commands are sent to it by name.
///
/// The consuming service builds it with [`QueueMeta::dispatch`]; a publishing
/// service builds it with [`QueueMeta::message_type`] and, for request/reply,
/// [`QueueMeta::reply_queue`].
#[derive(Debug, Clone)]
pub struct QueueMeta {
    pub(crate) bus_name: String,
    pub(crate) definition: QueueDefinition,
    pub(crate) consumer: ConsumerSettings,
    pub(crate) content_type: Option<String>,
    pub(crate) message_type: Option<String>,
    pub(crate) reply_queue: Option<String>,
    pub(crate) persistent: bool,
    pub(crate) dispatch: Option<DispatchInfo>,
}

impl QueueMeta {
    pub fn new(bus_name: &str, definition: QueueDefinition) -> QueueMeta {
        QueueMeta {
            bus_name: bus_name.to_owned(),
            definition,
            consumer: ConsumerSettings::default(),
            content_type: None,
            message_type: None,
            reply_queue: None,
            persistent: false,
            dispatch: None,
        }
    }

    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    pub fn queue_name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &QueueDefinition {
        &self.definition
    }

    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.consumer.prefetch_count = count;
        self
    }

    pub fn exclusive_consumer(mut self) -> Self {
        self.consumer.exclusive = true;
        self
    }

    pub fn consumer_priority(mut self, priority: i32) -> Self {
        self.consumer.priority = Some(priority);
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn message_type(mut self, message_type: &str) -> Self {
        self.message_type = Some(message_type.to_owned());
        self
    }

    pub fn message<M: Message>(self) -> Self {
        self.message_type(M::MESSAGE_TYPE)
    }

    /// Replies to commands sent to this queue go to `queue` on the same bus.
    pub fn reply_queue(mut self, queue: &str) -> Self {
        self.reply_queue = Some(queue.to_owned());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn dispatch(mut self, info: DispatchInfo) -> Self {
        self.message_type = Some(info.message_type.clone());
        self.dispatch = Some(info);
        self
    }

    pub(crate) fn apply_settings(&mut self, settings: &QueueSettings) {
        if let Some(prefetch) = settings.prefetch_count {
            self.consumer.prefetch_count = prefetch;
        }
    }
}

/// A queue bound to an exchange, consuming the events published to it.
#[derive(Debug, Clone)]
pub struct SubscriptionMeta {
    pub(crate) bus_name: String,
    pub(crate) exchange_name: String,
    pub(crate) definition: QueueDefinition,
    pub(crate) route_keys: Vec<String>,
    pub(crate) per_service_instance: bool,
    pub(crate) consumer: ConsumerSettings,
    pub(crate) content_type: Option<String>,
    pub(crate) dispatch: DispatchInfo,
}

impl SubscriptionMeta {
    pub fn new(
        bus_name: &str,
        exchange_name: &str,
        definition: QueueDefinition,
        dispatch: DispatchInfo,
    ) -> SubscriptionMeta {
        SubscriptionMeta {
            bus_name: bus_name.to_owned(),
            exchange_name: exchange_name.to_owned(),
            definition,
            route_keys: vec![],
            per_service_instance: false,
            consumer: ConsumerSettings::default(),
            content_type: None,
            dispatch,
        }
    }

    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn queue_name(&self) -> &str {
        &self.definition.name
    }

    pub fn route_key(mut self, key: &str) -> Self {
        self.route_keys.push(key.to_owned());
        self
    }

    pub fn route_keys(mut self, keys: &[&str]) -> Self {
        self.route_keys = keys.iter().map(|k| (*k).to_owned()).collect();
        self
    }

    /// Every running instance gets its own queue instead of competing on a shared one.
    pub fn per_service_instance(mut self) -> Self {
        self.per_service_instance = true;
        self
    }

    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.consumer.prefetch_count = count;
        self
    }

    pub fn exclusive_consumer(mut self) -> Self {
        self.consumer.exclusive = true;
        self
    }

    pub fn consumer_priority(mut self, priority: i32) -> Self {
        self.consumer.priority = Some(priority);
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    /// Queue name actually declared for the given service instance.
    pub fn instance_queue_name(&self, instance_id: &str) -> String {
        if self.per_service_instance {
            format!("{}_{}", self.definition.name, instance_id)
        } else {
            self.definition.name.clone()
        }
    }

    pub(crate) fn apply_settings(&mut self, settings: &QueueSettings) {
        if let Some(keys) = &settings.route_keys {
            self.route_keys = keys.clone();
        }
        if let Some(prefetch) = settings.prefetch_count {
            self.consumer.prefetch_count = prefetch;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::MockConsumerHandler;
    use std::sync::Arc;

    fn subscription(queue: &str) -> SubscriptionMeta {
        SubscriptionMeta::new(
            "bus",
            "orders",
            QueueDefinition::new(queue),
            DispatchInfo::shared("OrderPlaced", Arc::new(MockConsumerHandler::new())),
        )
    }

    #[test]
    fn per_instance_queue_name_appends_instance_token() {
        let meta = subscription("billing").per_service_instance();

        assert_eq!(meta.instance_queue_name("a1b2"), "billing_a1b2");
        assert_ne!(
            meta.instance_queue_name("a1b2"),
            meta.instance_queue_name("c3d4")
        );
    }

    #[test]
    fn shared_queue_name_is_unchanged() {
        assert_eq!(subscription("billing").instance_queue_name("a1b2"), "billing");
    }

    #[test]
    fn settings_override_route_keys_and_prefetch() {
        let mut meta = subscription("billing").route_key("orders.eu");
        meta.apply_settings(&QueueSettings {
            bus_name: "bus".to_owned(),
            queue_name: "billing".to_owned(),
            route_keys: Some(vec!["orders.us".to_owned()]),
            prefetch_count: Some(1),
        });

        assert_eq!(meta.route_keys, vec!["orders.us".to_owned()]);
        assert_eq!(meta.consumer.prefetch_count, 1);
    }
}
