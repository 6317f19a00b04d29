// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::{CreationStrategy, PublishStrategy};
use crate::{
    connection::DEFAULT_EXCHANGE,
    context::EntityContext,
    errors::{AmqpError, PublishError},
    message::{BusMessage, ReplyTo},
    publisher::{message_properties, publish_message, resolve_content_type, PublishTarget},
    queue::QueueMeta,
};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Sends commands straight to a work queue owned by another service.
pub struct QueuePublishStrategy {
    meta: QueueMeta,
    context: EntityContext,
}

impl QueuePublishStrategy {
    pub fn new(meta: QueueMeta, context: EntityContext) -> QueuePublishStrategy {
        QueuePublishStrategy { meta, context }
    }

    pub fn meta(&self) -> &QueueMeta {
        &self.meta
    }
}

#[async_trait]
impl CreationStrategy for QueuePublishStrategy {
    /// The queue belongs to its consumer, which declares it with its own arguments.
    async fn create_entity(&self) -> Result<(), AmqpError> {
        Ok(())
    }
}

#[async_trait]
impl PublishStrategy for QueuePublishStrategy {
    fn can_publish_message_type(&self, message_type: &str) -> bool {
        self.meta.message_type.as_deref() == Some(message_type)
    }

    async fn send_to_entity(&self, msg: &BusMessage, cancel: &CancellationToken) -> Result<(), PublishError> {
        let queue = self.meta.queue_name();
        let content_type = resolve_content_type(&self.context, msg, self.meta.content_type.as_deref());

        let mut properties = message_properties(msg, &content_type, self.meta.persistent);
        properties.reply_to = self
            .meta
            .reply_queue
            .as_deref()
            .map(|reply_queue| ReplyTo::new(self.meta.bus_name(), reply_queue).to_string());

        let target = PublishTarget::new(self.meta.bus_name(), queue, DEFAULT_EXCHANGE, queue);
        publish_message(&self.context, &target, msg, properties, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connection::BrokerConnection, memory::InMemoryBroker, queue::QueueDefinition, strategies::testing};
    use serde_json::json;

    #[tokio::test]
    async fn sends_through_default_exchange_with_reply_to() {
        let bus = InMemoryBroker::new("busA");
        bus.create_queue(&QueueDefinition::new("billing")).await.unwrap();
        let strategy = QueuePublishStrategy::new(
            QueueMeta::new("busA", QueueDefinition::new("billing"))
                .message_type("CreateInvoice")
                .reply_queue("replyQ")
                .persistent(),
            testing::context(&bus),
        );

        strategy.create_entity().await.unwrap();
        strategy
            .send_to_entity(
                &BusMessage::new("CreateInvoice", json!({"order": 1})).with_correlation_id("c-1"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let sent = bus.published_to_queue("billing");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].properties.reply_to.as_deref(), Some("busA:replyQ"));
        assert_eq!(sent[0].properties.correlation_id.as_deref(), Some("c-1"));
        assert!(sent[0].properties.persistent);
        assert_eq!(bus.queue_depth("billing"), 1);
    }

    #[tokio::test]
    async fn no_reply_queue_means_no_reply_to() {
        let bus = InMemoryBroker::new("busA");
        let strategy = QueuePublishStrategy::new(
            QueueMeta::new("busA", QueueDefinition::new("billing")).message_type("CreateInvoice"),
            testing::context(&bus),
        );

        strategy
            .send_to_entity(&BusMessage::new("CreateInvoice", json!({})), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(bus.published()[0].properties.reply_to, None);
        assert!(bus.queue_names().is_empty());
    }

    #[test]
    fn publishes_only_its_message_type() {
        let bus = InMemoryBroker::new("busA");
        let strategy = QueuePublishStrategy::new(
            QueueMeta::new("busA", QueueDefinition::new("billing")).message_type("CreateInvoice"),
            testing::context(&bus),
        );

        assert!(strategy.can_publish_message_type("CreateInvoice"));
        assert!(!strategy.can_publish_message_type("createinvoice"));
    }
}
