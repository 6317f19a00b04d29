// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::{CreationStrategy, PublishStrategy};
use crate::{
    context::EntityContext,
    errors::{AmqpError, PublishError},
    exchange::{ExchangeDefinition, ExchangeMeta},
    message::BusMessage,
    publisher::{message_properties, publish_message, resolve_content_type, PublishTarget},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Publishes one message type to an exchange.
pub struct ExchangePublishStrategy {
    meta: ExchangeMeta,
    context: EntityContext,
}

impl ExchangePublishStrategy {
    pub fn new(meta: ExchangeMeta, context: EntityContext) -> ExchangePublishStrategy {
        ExchangePublishStrategy { meta, context }
    }

    pub fn meta(&self) -> &ExchangeMeta {
        &self.meta
    }
}

#[async_trait]
impl CreationStrategy for ExchangePublishStrategy {
    async fn create_entity(&self) -> Result<(), AmqpError> {
        if !self.context.is_auto_create_enabled() {
            return Ok(());
        }

        let connection = self.context.connection(self.meta.bus_name())?;
        let def = self.meta.definition();

        debug!("creating exchange: {}", def.name());
        if let Err(err) = connection.create_exchange(def).await {
            error!(error = err.to_string(), exchange = def.name(), "error to declare the exchange");
            return Err(err);
        }

        // The alternate exchange keeps what no binding accepts in a queue of the same name.
        if let Some(alternate) = def.get_alternate_exchange() {
            debug!("creating alternate exchange: {}", alternate);

            let mut alternate_def = ExchangeDefinition::new(alternate).fanout();
            let mut alternate_queue = QueueDefinition::new(alternate);
            if def.is_durable() {
                alternate_def = alternate_def.durable();
                alternate_queue = alternate_queue.durable();
            }

            connection.create_exchange(&alternate_def).await?;
            connection.create_queue(&alternate_queue).await?;
            connection
                .bind_queue(&QueueBinding::new(alternate).exchange(alternate))
                .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl PublishStrategy for ExchangePublishStrategy {
    fn can_publish_message_type(&self, message_type: &str) -> bool {
        self.meta.message_type() == message_type
    }

    async fn send_to_entity(&self, msg: &BusMessage, cancel: &CancellationToken) -> Result<(), PublishError> {
        if !self.meta.applies_to(msg) {
            debug!(
                exchange = self.meta.exchange_name(),
                message_type = msg.message_type.as_str(),
                "message filtered out by the exchange predicate"
            );
            return Ok(());
        }

        let content_type = resolve_content_type(&self.context, msg, self.meta.content_type.as_deref());
        let properties = message_properties(msg, &content_type, self.meta.persistent);
        let target = PublishTarget::new(
            self.meta.bus_name(),
            self.meta.exchange_name(),
            self.meta.exchange_name(),
            &self.meta.resolve_route_key(msg),
        )
        .mandatory(self.meta.mandatory);

        publish_message(&self.context, &target, msg, properties, cancel).await
    }
}
