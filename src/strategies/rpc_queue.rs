// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::{CreationStrategy, DisposeStrategy, SubscriptionStrategy};
use crate::{
    connection::{BrokerDelivery, ConsumeOptions},
    consumer::{consumer_tag, dispatch_delivery, log_error, settle, start_consumer, ConsumerHandle, Outcome},
    context::EntityContext,
    errors::{AmqpError, DispatchError},
    logger::{MessageLog, MessageLogKind},
    message::{BusMessage, RPC_ACTION_HEADER, RPC_EXCEPTION_HEADER},
    publisher::publish_reply,
    rpc::{RemoteError, RpcQueueMeta},
    serialization::JSON_CONTENT_TYPE,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Serves RPC requests sent to a request queue.
///
/// The action namespace header selects the handler. Responses go to the bare
/// reply-to queue on the same bus; handler failures and unknown namespaces are
/// answered with an exception reply so the caller does not wait for its timeout.
pub struct RpcQueueStrategy {
    meta: Arc<RpcQueueMeta>,
    context: EntityContext,
    consumer: Mutex<Option<ConsumerHandle>>,
}

impl RpcQueueStrategy {
    pub fn new(meta: RpcQueueMeta, context: EntityContext) -> RpcQueueStrategy {
        RpcQueueStrategy {
            meta: Arc::new(meta),
            context,
            consumer: Mutex::new(None),
        }
    }

    pub fn meta(&self) -> &RpcQueueMeta {
        &self.meta
    }
}

#[async_trait]
impl CreationStrategy for RpcQueueStrategy {
    async fn create_entity(&self) -> Result<(), AmqpError> {
        if !self.context.is_auto_create_enabled() {
            return Ok(());
        }

        let connection = self.context.connection(self.meta.bus_name())?;

        debug!("creating rpc request queue: {}", self.meta.queue_name());
        match connection.create_queue(self.meta.definition()).await {
            Err(err) => {
                error!(error = err.to_string(), queue = self.meta.queue_name(), "error to declare the queue");
                Err(err)
            }
            Ok(_) => Ok(()),
        }
    }
}

#[async_trait]
impl SubscriptionStrategy for RpcQueueStrategy {
    async fn subscribe_entity(&self) -> Result<(), AmqpError> {
        let mut current = self.consumer.lock().await;
        if let Some(previous) = current.take() {
            previous.dispose().await;
        }

        let connection = self.context.connection(self.meta.bus_name())?;
        let queue = self.meta.queue_name().to_owned();
        let options = ConsumeOptions {
            consumer_tag: consumer_tag(&queue),
            prefetch_count: self.meta.consumer.prefetch_count,
            exclusive: self.meta.consumer.exclusive,
            priority: self.meta.consumer.priority,
        };

        let context = self.context.clone();
        let meta = self.meta.clone();

        let handle = start_consumer(connection, &queue, options, move |delivery, cancel| {
            let context = context.clone();
            let meta = meta.clone();

            async move { serve(&context, &meta, delivery, &cancel).await }
        })
        .await?;

        *current = Some(handle);
        Ok(())
    }
}

#[async_trait]
impl DisposeStrategy for RpcQueueStrategy {
    async fn on_dispose(&self) {
        if let Some(handle) = self.consumer.lock().await.take() {
            handle.dispose().await;
        }
    }
}

async fn serve(context: &EntityContext, meta: &RpcQueueMeta, delivery: BrokerDelivery, cancel: &CancellationToken) {
    let props = &delivery.properties;
    let namespace = props
        .header(RPC_ACTION_HEADER)
        .or(props.message_type.as_deref())
        .unwrap_or_default()
        .to_owned();

    let Some(info) = meta.handlers.get(&namespace) else {
        error!(
            bus = meta.bus_name(),
            queue = meta.queue_name(),
            action_namespace = namespace.as_str(),
            "no handler for rpc action"
        );
        context.logger.log(
            &MessageLog::new(
                MessageLogKind::Error,
                meta.bus_name(),
                meta.queue_name(),
                "no handler for rpc action",
            )
            .message_type(&namespace)
            .correlation_id(props.correlation_id.as_deref())
            .message_id(props.message_id.as_deref()),
        );
        let error = RemoteError::new(format!("no handler for action `{namespace}`"), &namespace);
        reply(context, meta, &delivery, exception_reply(&error), cancel).await;
        settle(&delivery, &Outcome::Dropped).await;
        return;
    };

    let outcome = dispatch_delivery(
        context,
        meta.bus_name(),
        meta.queue_name(),
        info,
        &delivery,
        meta.content_type.as_deref(),
        cancel,
    )
    .await;

    let response = match &outcome {
        Outcome::Handled(request, response) => Some(
            response
                .clone()
                .unwrap_or_else(|| BusMessage::new(request.message_type.clone(), Value::Null)),
        ),
        Outcome::Failed(_, err) => Some(exception_reply(&RemoteError::new(err.to_string(), &namespace))),
        Outcome::Dropped => Some(exception_reply(&RemoteError::new(
            "failure to deserialize request",
            &namespace,
        ))),
        Outcome::Cancelled => None,
    };

    if let Some(response) = response {
        reply(context, meta, &delivery, response, cancel).await;
    }

    settle(&delivery, &outcome).await;
}

fn exception_reply(error: &RemoteError) -> BusMessage {
    let body = serde_json::to_value(error).unwrap_or(Value::Null);

    BusMessage::new("RemoteError", body)
        .with_content_type(JSON_CONTENT_TYPE)
        .with_header(RPC_EXCEPTION_HEADER, "true")
}

async fn reply(
    context: &EntityContext,
    meta: &RpcQueueMeta,
    delivery: &BrokerDelivery,
    response: BusMessage,
    cancel: &CancellationToken,
) {
    let Some(reply_to) = delivery.properties.reply_to.as_deref().filter(|r| !r.is_empty()) else {
        warn!(
            queue = meta.queue_name(),
            correlation_id = delivery.properties.correlation_id.as_deref().unwrap_or_default(),
            "rpc request has no reply-to, response discarded"
        );
        return;
    };

    let sent = publish_reply(
        context,
        meta.bus_name(),
        reply_to,
        &delivery.properties,
        &response,
        cancel,
    )
    .await;

    if let Err(err) = sent {
        let err = DispatchError::ReplyRouting {
            reply_to: reply_to.to_owned(),
            reason: err.to_string(),
        };
        let response = BusMessage {
            correlation_id: delivery.properties.correlation_id.clone(),
            message_id: delivery.properties.message_id.clone(),
            ..response
        };
        log_error(
            context,
            meta.bus_name(),
            meta.queue_name(),
            &response,
            "failure to route reply",
            &err,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::{BrokerConnection, MessageProperties, OutgoingMessage},
        dispatcher::{DispatchInfo, MockConsumerHandler},
        errors::HandlerError,
        memory::InMemoryBroker,
        queue::QueueDefinition,
        strategies::testing::{self, no_reply},
    };
    use serde_json::json;
    use std::collections::BTreeMap;

    fn price(msg: &BusMessage) -> Result<Option<BusMessage>, HandlerError> {
        Ok(Some(BusMessage::new("Price", json!({"sku": msg.body["sku"], "price": 42}))))
    }

    fn request(namespace: &str, reply_to: Option<&str>, body: &[u8]) -> OutgoingMessage {
        let mut headers = BTreeMap::new();
        headers.insert(RPC_ACTION_HEADER.to_owned(), namespace.to_owned());

        OutgoingMessage::to_queue("pricing", body.to_vec()).properties(MessageProperties {
            content_type: Some(JSON_CONTENT_TYPE.to_owned()),
            correlation_id: Some("c-1".to_owned()),
            message_id: Some("m-1".to_owned()),
            reply_to: reply_to.map(str::to_owned),
            message_type: Some("GetPrice".to_owned()),
            headers,
            ..MessageProperties::default()
        })
    }

    async fn server(
        bus: &InMemoryBroker,
        reply: fn(&BusMessage) -> Result<Option<BusMessage>, HandlerError>,
    ) -> (RpcQueueStrategy, testing::Seen) {
        bus.create_queue(&QueueDefinition::new("replies")).await.unwrap();
        let (info, seen) = testing::recording_handler("GetPrice", reply);
        let strategy = RpcQueueStrategy::new(
            RpcQueueMeta::new("bus", QueueDefinition::new("pricing")).handler("GetPrice", info),
            testing::context(bus),
        );
        strategy.create_entity().await.unwrap();
        strategy.subscribe_entity().await.unwrap();
        (strategy, seen)
    }

    #[tokio::test]
    async fn replies_to_the_bare_reply_queue() {
        let bus = InMemoryBroker::new("bus");
        let (_server, seen) = server(&bus, price).await;

        bus.publish(request("GetPrice", Some("replies"), br#"{"sku": "A-1"}"#))
            .await
            .unwrap();

        assert!(testing::eventually(|| bus.queue_depth("replies") == 1).await);
        assert_eq!(seen.lock().unwrap().len(), 1);

        let replies = bus.published_to_queue("replies");
        assert_eq!(replies[0].properties.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(replies[0].properties.message_id.as_deref(), Some("m-1"));
        assert_eq!(replies[0].properties.header(RPC_EXCEPTION_HEADER), None);
        assert_eq!(
            serde_json::from_slice::<Value>(&replies[0].body).unwrap(),
            json!({"sku": "A-1", "price": 42})
        );
        assert!(testing::eventually(|| bus.acked() == 1).await);
    }

    #[tokio::test]
    async fn handler_errors_become_exception_replies() {
        let bus = InMemoryBroker::new("bus");
        let (_server, _) = server(&bus, |_| Err(HandlerError::new("out of stock"))).await;

        bus.publish(request("GetPrice", Some("replies"), b"{}")).await.unwrap();

        assert!(testing::eventually(|| bus.queue_depth("replies") == 1).await);
        let replies = bus.published_to_queue("replies");
        assert_eq!(replies[0].properties.header(RPC_EXCEPTION_HEADER), Some("true"));
        let error = RemoteError::from_payload(&replies[0].body).unwrap();
        assert_eq!(error.action_namespace, "GetPrice");
        assert!(error.message.contains("out of stock"));
    }

    #[tokio::test]
    async fn unknown_namespace_is_answered_with_an_exception() {
        let bus = InMemoryBroker::new("bus");
        let (_server, seen) = server(&bus, price).await;

        bus.publish(request("GetStock", Some("replies"), b"{}")).await.unwrap();

        assert!(testing::eventually(|| bus.queue_depth("replies") == 1).await);
        let replies = bus.published_to_queue("replies");
        assert_eq!(replies[0].properties.header(RPC_EXCEPTION_HEADER), Some("true"));
        assert_eq!(
            RemoteError::from_payload(&replies[0].body).unwrap().action_namespace,
            "GetStock"
        );
        assert!(seen.lock().unwrap().is_empty());
        assert!(testing::eventually(|| bus.acked() == 1).await);
    }

    #[tokio::test]
    async fn null_response_is_still_answered() {
        let bus = InMemoryBroker::new("bus");
        let (_server, _) = server(&bus, no_reply).await;

        bus.publish(request("GetPrice", Some("replies"), b"{}")).await.unwrap();

        assert!(testing::eventually(|| bus.queue_depth("replies") == 1).await);
        let replies = bus.published_to_queue("replies");
        assert_eq!(serde_json::from_slice::<Value>(&replies[0].body).unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn missing_reply_to_discards_the_response() {
        let bus = InMemoryBroker::new("bus");
        let (_server, seen) = server(&bus, price).await;

        bus.publish(request("GetPrice", None, b"{}")).await.unwrap();

        assert!(testing::eventually(|| bus.acked() == 1).await);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn reply_publish_failure_is_logged() {
        let bus = InMemoryBroker::new("bus");
        let (context, logged) = testing::logging_context(&bus);

        // the request goes through, the reply publish fails
        let broker = bus.clone();
        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().returning(move |_, _| {
            broker.fail_publishes(Some(AmqpError::PublishingError("replies".to_owned())));
            Ok(Some(BusMessage::new("Price", json!({"price": 42}))))
        });
        let server = RpcQueueStrategy::new(
            RpcQueueMeta::new("bus", QueueDefinition::new("pricing"))
                .handler("GetPrice", DispatchInfo::shared("GetPrice", Arc::new(handler))),
            context,
        );
        server.create_entity().await.unwrap();
        server.subscribe_entity().await.unwrap();

        bus.publish(request("GetPrice", Some("replies"), b"{}")).await.unwrap();

        assert!(testing::eventually(|| bus.acked() == 1).await);
        assert!(bus.published_to_queue("replies").is_empty());

        let logged = logged.lock().unwrap();
        let entry = logged
            .iter()
            .find(|log| log.details == "failure to route reply")
            .expect("reply failure logged");
        assert_eq!(entry.kind, MessageLogKind::Error);
        assert_eq!(entry.entity_name, "pricing");
        assert_eq!(entry.correlation_id.as_deref(), Some("c-1"));
        assert!(entry.errors[0].starts_with("failure to send reply to `replies`"));
    }
}
