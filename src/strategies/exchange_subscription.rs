// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::{CreationStrategy, DisposeStrategy, SubscriptionStrategy};
use crate::{
    connection::ConsumeOptions,
    consumer::{consumer_tag, dispatch_delivery, settle, start_consumer, ConsumerHandle},
    context::EntityContext,
    errors::AmqpError,
    queue::{QueueBinding, SubscriptionMeta},
};
use async_trait::async_trait;
use std::sync::{Mutex as SyncMutex, PoisonError};
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Consumes the events published to an exchange through a bound queue.
///
/// The queue is shared by every instance of the service unless the subscription
/// is per service instance, in which case the instance token is appended.
pub struct ExchangeSubscriptionStrategy {
    meta: SubscriptionMeta,
    context: EntityContext,
    queue_name: String,
    declared_name: SyncMutex<Option<String>>,
    consumer: Mutex<Option<ConsumerHandle>>,
}

impl ExchangeSubscriptionStrategy {
    pub fn new(meta: SubscriptionMeta, context: EntityContext) -> ExchangeSubscriptionStrategy {
        let queue_name = meta.instance_queue_name(context.get_instance_id());

        ExchangeSubscriptionStrategy {
            meta,
            context,
            queue_name,
            declared_name: SyncMutex::new(None),
            consumer: Mutex::new(None),
        }
    }

    pub fn meta(&self) -> &SubscriptionMeta {
        &self.meta
    }

    /// Name of the queue this instance consumes from.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn consuming_queue(&self) -> String {
        self.declared_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| self.queue_name.clone())
    }
}

#[async_trait]
impl CreationStrategy for ExchangeSubscriptionStrategy {
    async fn create_entity(&self) -> Result<(), AmqpError> {
        if !self.context.is_auto_create_enabled() {
            return Ok(());
        }

        let connection = self.context.connection(self.meta.bus_name())?;

        debug!("creating queue: {}", self.queue_name);
        let declared = match connection
            .create_queue(&self.meta.definition.renamed(&self.queue_name))
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = self.queue_name.as_str(), "error to declare the queue");
                Err(err)
            }
            Ok(name) => Ok(name),
        }?;

        let keys: Vec<&str> = if self.meta.route_keys.is_empty() {
            vec![""]
        } else {
            self.meta.route_keys.iter().map(String::as_str).collect()
        };

        for key in keys {
            debug!(
                "binding queue: {} - exchange: {} - key: {}",
                declared, self.meta.exchange_name, key
            );
            let binding = QueueBinding::new(&declared)
                .exchange(&self.meta.exchange_name)
                .routing_key(key);
            if let Err(err) = connection.bind_queue(&binding).await {
                error!(error = err.to_string(), queue = declared.as_str(), "error to bind queue to exchange");
                return Err(err);
            }
        }

        *self
            .declared_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(declared);

        Ok(())
    }
}

#[async_trait]
impl SubscriptionStrategy for ExchangeSubscriptionStrategy {
    async fn subscribe_entity(&self) -> Result<(), AmqpError> {
        let mut current = self.consumer.lock().await;
        if let Some(previous) = current.take() {
            previous.dispose().await;
        }

        let connection = self.context.connection(self.meta.bus_name())?;
        let queue = self.consuming_queue();
        let options = ConsumeOptions {
            consumer_tag: consumer_tag(&queue),
            prefetch_count: self.meta.consumer.prefetch_count,
            exclusive: self.meta.consumer.exclusive,
            priority: self.meta.consumer.priority,
        };

        let context = self.context.clone();
        let bus_name = self.meta.bus_name.clone();
        let entity_name = self.queue_name.clone();
        let info = self.meta.dispatch.clone();
        let content_type = self.meta.content_type.clone();

        let handle = start_consumer(connection, &queue, options, move |delivery, cancel| {
            let context = context.clone();
            let bus_name = bus_name.clone();
            let entity_name = entity_name.clone();
            let info = info.clone();
            let content_type = content_type.clone();

            async move {
                let outcome = dispatch_delivery(
                    &context,
                    &bus_name,
                    &entity_name,
                    &info,
                    &delivery,
                    content_type.as_deref(),
                    &cancel,
                )
                .await;
                settle(&delivery, &outcome).await;
            }
        })
        .await?;

        *current = Some(handle);
        Ok(())
    }
}

#[async_trait]
impl DisposeStrategy for ExchangeSubscriptionStrategy {
    async fn on_dispose(&self) {
        if let Some(handle) = self.consumer.lock().await.take() {
            handle.dispose().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::{BrokerConnection, MessageProperties, OutgoingMessage},
        dispatcher::DispatchInfo,
        errors::HandlerError,
        exchange::ExchangeDefinition,
        memory::InMemoryBroker,
        queue::QueueDefinition,
        strategies::testing::{self, no_reply},
    };
    use serde_json::json;

    fn event(routing_key: &str, body: &[u8]) -> OutgoingMessage {
        OutgoingMessage::to_exchange("orders", routing_key, body.to_vec()).properties(MessageProperties {
            content_type: Some("application/json".to_owned()),
            message_type: Some("OrderPlaced".to_owned()),
            ..MessageProperties::default()
        })
    }

    async fn orders_exchange(bus: &InMemoryBroker) {
        bus.create_exchange(&ExchangeDefinition::new("orders").topic())
            .await
            .unwrap();
    }

    fn subscription(info: DispatchInfo) -> SubscriptionMeta {
        SubscriptionMeta::new("bus", "orders", QueueDefinition::new("billing"), info)
    }

    #[tokio::test]
    async fn binds_each_route_key_or_the_empty_key() {
        let bus = InMemoryBroker::new("bus");
        orders_exchange(&bus).await;
        let (info, _) = testing::recording_handler("OrderPlaced", no_reply);

        let keyed = ExchangeSubscriptionStrategy::new(
            subscription(info.clone()).route_keys(&["orders.eu", "orders.us"]),
            testing::context(&bus),
        );
        keyed.create_entity().await.unwrap();
        keyed.create_entity().await.unwrap();

        assert!(bus.has_binding("billing", "orders", "orders.eu"));
        assert!(bus.has_binding("billing", "orders", "orders.us"));

        let unkeyed = ExchangeSubscriptionStrategy::new(
            SubscriptionMeta::new("bus", "orders", QueueDefinition::new("audit"), info),
            testing::context(&bus),
        );
        unkeyed.create_entity().await.unwrap();

        assert!(bus.has_binding("audit", "orders", ""));
    }

    #[tokio::test]
    async fn per_instance_subscriptions_get_distinct_queues() {
        let bus = InMemoryBroker::new("bus");
        orders_exchange(&bus).await;
        let (info, _) = testing::recording_handler("OrderPlaced", no_reply);

        let first = ExchangeSubscriptionStrategy::new(
            subscription(info.clone()).per_service_instance().route_key("orders.#"),
            testing::context(&bus).instance_id("a1"),
        );
        let second = ExchangeSubscriptionStrategy::new(
            subscription(info).per_service_instance().route_key("orders.#"),
            testing::context(&bus).instance_id("b2"),
        );
        first.create_entity().await.unwrap();
        second.create_entity().await.unwrap();

        assert_eq!(first.queue_name(), "billing_a1");
        assert_eq!(second.queue_name(), "billing_b2");
        assert_eq!(
            bus.queue_names(),
            vec!["billing_a1".to_owned(), "billing_b2".to_owned()]
        );

        bus.publish(event("orders.eu", b"{}")).await.unwrap();
        assert_eq!(bus.queue_depth("billing_a1"), 1);
        assert_eq!(bus.queue_depth("billing_b2"), 1);
    }

    #[tokio::test]
    async fn dispatches_and_acknowledges_deliveries() {
        let bus = InMemoryBroker::new("bus");
        orders_exchange(&bus).await;
        let (info, seen) = testing::recording_handler("OrderPlaced", no_reply);
        let strategy = ExchangeSubscriptionStrategy::new(
            subscription(info).route_key("orders.eu"),
            testing::context(&bus),
        );
        strategy.create_entity().await.unwrap();
        strategy.subscribe_entity().await.unwrap();

        bus.publish(event("orders.eu", br#"{"id": 7}"#)).await.unwrap();

        assert!(testing::eventually(|| bus.acked() == 1).await);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].body, json!({"id": 7}));
        assert_eq!(seen[0].route_key.as_deref(), Some("orders.eu"));
    }

    #[tokio::test]
    async fn handler_errors_are_still_acknowledged() {
        let bus = InMemoryBroker::new("bus");
        orders_exchange(&bus).await;
        let (info, seen) = testing::recording_handler("OrderPlaced", |_| Err(HandlerError::new("boom")));
        let strategy = ExchangeSubscriptionStrategy::new(subscription(info), testing::context(&bus));
        strategy.create_entity().await.unwrap();
        strategy.subscribe_entity().await.unwrap();

        bus.publish(event("", b"{}")).await.unwrap();
        bus.publish(event("", b"{}")).await.unwrap();

        assert!(testing::eventually(|| bus.acked() == 2).await);
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(bus.rejected(), 0);
    }

    #[tokio::test]
    async fn undeserializable_messages_are_dropped() {
        let bus = InMemoryBroker::new("bus");
        orders_exchange(&bus).await;
        let (info, seen) = testing::recording_handler("OrderPlaced", no_reply);
        let strategy = ExchangeSubscriptionStrategy::new(subscription(info), testing::context(&bus));
        strategy.create_entity().await.unwrap();
        strategy.subscribe_entity().await.unwrap();

        bus.publish(event("", b"not json")).await.unwrap();

        assert!(testing::eventually(|| bus.acked() == 1).await);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn resubscribing_replaces_the_consumer() {
        let bus = InMemoryBroker::new("bus");
        orders_exchange(&bus).await;
        let (info, _) = testing::recording_handler("OrderPlaced", no_reply);
        let strategy = ExchangeSubscriptionStrategy::new(subscription(info), testing::context(&bus));
        strategy.create_entity().await.unwrap();

        strategy.subscribe_entity().await.unwrap();
        strategy.subscribe_entity().await.unwrap();
        assert_eq!(bus.consumer_count("billing"), 1);

        strategy.on_dispose().await;
        strategy.on_dispose().await;
        assert_eq!(bus.consumer_count("billing"), 0);
    }

    #[tokio::test]
    async fn dispose_without_subscription_is_a_no_op() {
        let bus = InMemoryBroker::new("bus");
        let (info, _) = testing::recording_handler("OrderPlaced", no_reply);
        let strategy = ExchangeSubscriptionStrategy::new(subscription(info), testing::context(&bus));

        strategy.on_dispose().await;
    }
}
