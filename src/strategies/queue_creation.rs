// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::{CreationStrategy, DisposeStrategy, SubscriptionStrategy};
use crate::{
    connection::{BrokerDelivery, ConsumeOptions},
    consumer::{consumer_tag, dispatch_delivery, log_error, settle, start_consumer, ConsumerHandle, Outcome},
    context::EntityContext,
    errors::{AmqpError, DispatchError},
    exchange::ExchangeDefinition,
    message::{BusMessage, ReplyTo},
    publisher::publish_reply,
    queue::QueueMeta,
};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Consumes commands sent to a work queue.
///
/// A handler response is routed to the queue named by the request's reply-to,
/// written as `<busName>:<queueName>`.
pub struct QueueCreationStrategy {
    meta: QueueMeta,
    context: EntityContext,
    consumer: Mutex<Option<ConsumerHandle>>,
}

impl QueueCreationStrategy {
    pub fn new(meta: QueueMeta, context: EntityContext) -> QueueCreationStrategy {
        QueueCreationStrategy {
            meta,
            context,
            consumer: Mutex::new(None),
        }
    }

    pub fn meta(&self) -> &QueueMeta {
        &self.meta
    }
}

#[async_trait]
impl CreationStrategy for QueueCreationStrategy {
    async fn create_entity(&self) -> Result<(), AmqpError> {
        if !self.context.is_auto_create_enabled() {
            return Ok(());
        }

        let connection = self.context.connection(self.meta.bus_name())?;
        let def = self.meta.definition();

        if let Some(dlx) = def.get_dead_letter_exchange() {
            debug!("creating dead letter exchange: {}", dlx);

            let mut dlx_def = ExchangeDefinition::new(dlx).fanout();
            if def.is_durable() {
                dlx_def = dlx_def.durable();
            }
            if let Err(err) = connection.create_exchange(&dlx_def).await {
                error!(error = err.to_string(), exchange = dlx, "error to declare the dead letter exchange");
                return Err(err);
            }
        }

        debug!("creating queue: {}", def.name());
        match connection.create_queue(def).await {
            Err(err) => {
                error!(error = err.to_string(), queue = def.name(), "error to declare the queue");
                Err(err)
            }
            Ok(_) => Ok(()),
        }
    }
}

#[async_trait]
impl SubscriptionStrategy for QueueCreationStrategy {
    async fn subscribe_entity(&self) -> Result<(), AmqpError> {
        let mut current = self.consumer.lock().await;
        if let Some(previous) = current.take() {
            previous.dispose().await;
        }

        let Some(info) = self.meta.dispatch.clone() else {
            warn!(queue = self.meta.queue_name(), "work queue has no dispatcher, not consuming");
            return Ok(());
        };

        let connection = self.context.connection(self.meta.bus_name())?;
        let queue = self.meta.queue_name().to_owned();
        let options = ConsumeOptions {
            consumer_tag: consumer_tag(&queue),
            prefetch_count: self.meta.consumer.prefetch_count,
            exclusive: self.meta.consumer.exclusive,
            priority: self.meta.consumer.priority,
        };

        let context = self.context.clone();
        let bus_name = self.meta.bus_name.clone();
        let content_type = self.meta.content_type.clone();
        let entity_name = queue.clone();

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

                if let Outcome::Handled(request, Some(response)) = &outcome {
                    if let Err(err) = route_reply(&context, &delivery, response, &cancel).await {
                        log_error(&context, &bus_name, &entity_name, request, "failure to route reply", &err);
                    }
                }

                settle(&delivery, &outcome).await;
            }
        })
        .await?;

        *current = Some(handle);
        Ok(())
    }
}

#[async_trait]
impl DisposeStrategy for QueueCreationStrategy {
    async fn on_dispose(&self) {
        if let Some(handle) = self.consumer.lock().await.take() {
            handle.dispose().await;
        }
    }
}

/// Publishes `response` to the queue the request's reply-to names.
async fn route_reply(
    context: &EntityContext,
    delivery: &BrokerDelivery,
    response: &BusMessage,
    cancel: &CancellationToken,
) -> Result<(), DispatchError> {
    let Some(reply_to) = delivery.properties.reply_to.as_deref() else {
        warn!(
            queue = delivery.queue.as_str(),
            message_type = response.message_type.as_str(),
            "request has no reply-to, response discarded"
        );
        return Ok(());
    };

    let reply_to = ReplyTo::parse(reply_to)?;

    publish_reply(
        context,
        &reply_to.bus_name,
        &reply_to.queue_name,
        &delivery.properties,
        response,
        cancel,
    )
    .await
    .map_err(|err| DispatchError::ReplyRouting {
        reply_to: reply_to.to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::{BrokerConnection, MessageProperties, OutgoingMessage},
        errors::HandlerError,
        memory::InMemoryBroker,
        queue::QueueDefinition,
        strategies::testing::{self, no_reply},
    };
    use serde_json::json;

    fn invoice(_: &BusMessage) -> Result<Option<BusMessage>, HandlerError> {
        Ok(Some(BusMessage::new("InvoiceCreated", json!({"invoice": 1}))))
    }

    fn command(reply_to: Option<&str>) -> OutgoingMessage {
        OutgoingMessage::to_queue("billing", br#"{"order": 1}"#.to_vec()).properties(MessageProperties {
            content_type: Some("application/json".to_owned()),
            correlation_id: Some("c-9".to_owned()),
            message_id: Some("m-1".to_owned()),
            reply_to: reply_to.map(str::to_owned),
            message_type: Some("CreateInvoice".to_owned()),
            ..MessageProperties::default()
        })
    }

    async fn running(
        bus: &InMemoryBroker,
        context: EntityContext,
        reply: fn(&BusMessage) -> Result<Option<BusMessage>, HandlerError>,
    ) -> (QueueCreationStrategy, testing::Seen) {
        let (info, seen) = testing::recording_handler("CreateInvoice", reply);
        let strategy = QueueCreationStrategy::new(
            QueueMeta::new("busB", QueueDefinition::new("billing").durable()).dispatch(info),
            context,
        );
        strategy.create_entity().await.unwrap();
        strategy.subscribe_entity().await.unwrap();
        assert_eq!(bus.consumer_count("billing"), 1);
        (strategy, seen)
    }

    #[tokio::test]
    async fn declares_dead_letter_exchange_before_queue() {
        let bus = InMemoryBroker::new("bus");
        let strategy = QueueCreationStrategy::new(
            QueueMeta::new(
                "bus",
                QueueDefinition::new("billing")
                    .durable()
                    .ttl(60_000)
                    .dead_letter_exchange("billing.dlx"),
            ),
            testing::context(&bus),
        );

        strategy.create_entity().await.unwrap();
        strategy.create_entity().await.unwrap();

        let dlx = bus.exchange("billing.dlx").unwrap();
        assert!(dlx.is_durable());
        assert_eq!(dlx.get_kind(), &crate::exchange::ExchangeKind::Fanout);
        assert_eq!(
            bus.queue("billing").unwrap().get_dead_letter_exchange(),
            Some("billing.dlx")
        );
    }

    #[tokio::test]
    async fn routes_exactly_one_reply_to_the_reply_bus() {
        let bus_a = InMemoryBroker::new("busA");
        let bus_b = InMemoryBroker::new("busB");
        bus_a.create_queue(&QueueDefinition::new("replyQ")).await.unwrap();
        let (_strategy, seen) = running(&bus_b, testing::context_with(&[&bus_a, &bus_b]), invoice).await;

        bus_b.publish(command(Some("busA:replyQ"))).await.unwrap();

        assert!(testing::eventually(|| bus_b.acked() == 1).await);
        assert_eq!(seen.lock().unwrap().len(), 1);

        let replies = bus_a.published_to_queue("replyQ");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].properties.correlation_id.as_deref(), Some("c-9"));
        assert_eq!(replies[0].properties.message_id.as_deref(), Some("m-1"));
        assert_eq!(
            replies[0].properties.content_type.as_deref(),
            Some("application/json")
        );
        assert_eq!(
            replies[0].properties.message_type.as_deref(),
            Some("InvoiceCreated")
        );
        assert_eq!(bus_a.queue_depth("replyQ"), 1);
        assert!(bus_b.published_to_queue("replyQ").is_empty());
    }

    #[tokio::test]
    async fn null_response_sends_no_reply() {
        let bus = InMemoryBroker::new("busB");
        let (_strategy, _) = running(&bus, testing::context(&bus), no_reply).await;

        bus.publish(command(Some("busB:replyQ"))).await.unwrap();

        assert!(testing::eventually(|| bus.acked() == 1).await);
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn reply_failures_are_logged_and_the_request_acknowledged() {
        let bus = InMemoryBroker::new("busB");
        let (_strategy, _) = running(&bus, testing::context(&bus), invoice).await;

        bus.publish(command(Some("malformed"))).await.unwrap();
        bus.publish(command(Some("unknownBus:replyQ"))).await.unwrap();

        assert!(testing::eventually(|| bus.acked() == 2).await);
        assert_eq!(bus.published().len(), 2);
    }

    #[tokio::test]
    async fn auto_create_disabled_surfaces_missing_queue_on_subscribe() {
        let bus = InMemoryBroker::new("busB");
        let (info, _) = testing::recording_handler("CreateInvoice", no_reply);
        let strategy = QueueCreationStrategy::new(
            QueueMeta::new("busB", QueueDefinition::new("billing")).dispatch(info),
            testing::context(&bus).auto_create(false),
        );

        strategy.create_entity().await.unwrap();

        assert!(bus.queue_names().is_empty());
        assert_eq!(
            strategy.subscribe_entity().await,
            Err(AmqpError::BindingConsumerError("billing".to_owned()))
        );
    }
}
