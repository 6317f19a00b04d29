// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! The publish path shared by every strategy: serialize the body for its
//! content type, stamp the message properties, propagate the OpenTelemetry
//! context and hand the result to the bus connection. Failures are logged with
//! the entity they belong to and returned; nothing is retried here.

use crate::{
    connection::{MessageProperties, OutgoingMessage, DEFAULT_EXCHANGE},
    context::EntityContext,
    errors::{AmqpError, PublishError},
    logger::{MessageLog, MessageLogKind},
    message::BusMessage,
    otel,
};
use opentelemetry::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

/// Where a message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PublishTarget {
    pub(crate) bus_name: String,
    pub(crate) entity_name: String,
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) mandatory: bool,
}

impl PublishTarget {
    pub(crate) fn new(bus_name: &str, entity_name: &str, exchange: &str, routing_key: &str) -> Self {
        PublishTarget {
            bus_name: bus_name.to_owned(),
            entity_name: entity_name.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            mandatory: false,
        }
    }

    pub(crate) fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }
}

/// Content type precedence: the message, the entity, the serialization default.
pub(crate) fn resolve_content_type(
    context: &EntityContext,
    msg: &BusMessage,
    entity_default: Option<&str>,
) -> String {
    msg.content_type
        .as_deref()
        .or(entity_default)
        .unwrap_or(context.serialization.get_default_content_type())
        .to_owned()
}

/// Properties stamped from the message itself. A message id is generated when absent.
pub(crate) fn message_properties(msg: &BusMessage, content_type: &str, persistent: bool) -> MessageProperties {
    MessageProperties {
        content_type: Some(content_type.to_owned()),
        correlation_id: msg.correlation_id.clone(),
        message_id: Some(
            msg.message_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        ),
        reply_to: None,
        message_type: Some(msg.message_type.clone()),
        priority: None,
        persistent,
        headers: msg.headers.clone(),
    }
}

/// Serializes `msg` and publishes it to `target` with `properties`.
pub(crate) async fn publish_message(
    context: &EntityContext,
    target: &PublishTarget,
    msg: &BusMessage,
    mut properties: MessageProperties,
    cancel: &CancellationToken,
) -> Result<(), PublishError> {
    let content_type = properties
        .content_type
        .clone()
        .unwrap_or_else(|| context.serialization.get_default_content_type().to_owned());

    let body = match context.serialization.serialize(&content_type, &msg.body) {
        Ok(body) => body,
        Err(err) => {
            log_failure(context, target, msg, &err);
            return Err(PublishError::from(err));
        }
    };

    otel::inject_context(&Context::current(), &mut properties.headers);

    let outgoing = OutgoingMessage {
        exchange: target.exchange.clone(),
        routing_key: target.routing_key.clone(),
        mandatory: target.mandatory,
        body,
        properties,
    };
    let correlation_id = outgoing.properties.correlation_id.clone();
    let message_id = outgoing.properties.message_id.clone();

    let result = if cancel.is_cancelled() {
        Err(PublishError::Cancelled)
    } else {
        match context.connection(&target.bus_name) {
            Ok(connection) => {
                tokio::select! {
                    result = connection.publish(outgoing) => result.map_err(|err| broker_error(target, err)),
                    _ = cancel.cancelled() => Err(PublishError::Cancelled),
                }
            }
            Err(err) => Err(broker_error(target, err)),
        }
    };

    match result {
        Err(err) => {
            log_failure(context, target, msg, &err);
            Err(err)
        }
        Ok(()) => {
            debug!(
                bus = target.bus_name.as_str(),
                exchange = target.exchange.as_str(),
                routing_key = target.routing_key.as_str(),
                message_type = msg.message_type.as_str(),
                "message published"
            );
            context.logger.log(
                &MessageLog::new(
                    MessageLogKind::Published,
                    &target.bus_name,
                    &target.entity_name,
                    "message published",
                )
                .message_type(&msg.message_type)
                .correlation_id(correlation_id.as_deref())
                .message_id(message_id.as_deref()),
            );
            Ok(())
        }
    }
}

/// Sends `reply` through the default exchange to `queue` on `bus_name`.
///
/// The reply carries the correlation id and message id of the request it
/// answers, and the request's content type unless the reply sets its own.
pub(crate) async fn publish_reply(
    context: &EntityContext,
    bus_name: &str,
    queue: &str,
    request: &MessageProperties,
    reply: &BusMessage,
    cancel: &CancellationToken,
) -> Result<(), PublishError> {
    let content_type = resolve_content_type(context, reply, request.content_type.as_deref());
    let mut properties = message_properties(reply, &content_type, false);
    properties.correlation_id = request.correlation_id.clone();
    if request.message_id.is_some() {
        properties.message_id = request.message_id.clone();
    }

    let target = PublishTarget::new(bus_name, queue, DEFAULT_EXCHANGE, queue);
    publish_message(context, &target, reply, properties, cancel).await?;

    context.logger.log(
        &MessageLog::new(MessageLogKind::Replied, bus_name, queue, "reply sent")
            .message_type(&reply.message_type)
            .correlation_id(request.correlation_id.as_deref())
            .message_id(request.message_id.as_deref()),
    );
    Ok(())
}

fn broker_error(target: &PublishTarget, source: AmqpError) -> PublishError {
    PublishError::Broker {
        bus: target.bus_name.clone(),
        entity: target.entity_name.clone(),
        source,
    }
}

fn log_failure(
    context: &EntityContext,
    target: &PublishTarget,
    msg: &BusMessage,
    err: &dyn std::error::Error,
) {
    error!(
        error = err.to_string(),
        bus = target.bus_name.as_str(),
        entity = target.entity_name.as_str(),
        exchange = target.exchange.as_str(),
        routing_key = target.routing_key.as_str(),
        message_type = msg.message_type.as_str(),
        "error publishing message"
    );
    context.logger.log(
        &MessageLog::new(
            MessageLogKind::Error,
            &target.bus_name,
            &target.entity_name,
            "error publishing message",
        )
        .message_type(&msg.message_type)
        .correlation_id(msg.correlation_id.as_deref())
        .error(err),
    );
}
