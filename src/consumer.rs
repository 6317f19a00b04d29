// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! Deliveries are drained from the broker consumer by one task per entity.
//! For each delivery the pipeline:
//! 1. Opens a consumer span parented by the trace context in the headers
//! 2. Deserializes the body using the content type carried on the message
//! 3. Invokes the dispatcher in a new lifetime scope
//! 4. Logs the outcome; handler failures never stop the loop
//!
//! Settling the delivery (ack, or requeue when the consumer is shutting down
//! mid-dispatch) is left to the owning strategy so it can route replies first.

use crate::{
    connection::{BrokerConnection, BrokerDelivery, ConsumeOptions},
    context::{EntityContext, TRACER_NAME},
    dispatcher::DispatchInfo,
    errors::{AmqpError, DispatchError, SerializationError},
    logger::{MessageLog, MessageLogKind},
    message::BusMessage,
    otel,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, future::Future, sync::Arc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Owns a running consumer: the broker registration and its processing task.
pub(crate) struct ConsumerHandle {
    tag: String,
    queue: String,
    connection: Arc<dyn BrokerConnection>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Stops the processing loop and cancels the broker consumer.
    pub(crate) async fn dispose(self) {
        self.shutdown.cancel();

        if let Err(err) = self.connection.cancel_consumer(&self.tag).await {
            warn!(
                error = err.to_string(),
                tag = self.tag.as_str(),
                "failure to cancel consumer"
            );
        }

        if let Err(err) = self.task.await {
            if !err.is_cancelled() {
                error!(error = err.to_string(), tag = self.tag.as_str(), "consumer task failed");
            }
        }

        debug!(tag = self.tag.as_str(), queue = self.queue.as_str(), "consumer disposed");
    }
}

pub(crate) fn consumer_tag(queue: &str) -> String {
    format!("{}-{}", queue, Uuid::new_v4().simple())
}

/// Registers a consumer on `queue` and spawns the loop handing each delivery to `on_delivery`.
///
/// `on_delivery` receives the shutdown token; it is cancelled when the handle is disposed.
pub(crate) async fn start_consumer<F, Fut>(
    connection: Arc<dyn BrokerConnection>,
    queue: &str,
    options: ConsumeOptions,
    on_delivery: F,
) -> Result<ConsumerHandle, AmqpError>
where
    F: Fn(BrokerDelivery, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let consumer = match connection.consume(queue, &options).await {
        Err(err) => {
            error!(error = err.to_string(), queue, "error to create the consumer");
            Err(err)
        }
        Ok(c) => Ok(c),
    }?;

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let mut deliveries = consumer.deliveries;
    let queue_name = queue.to_owned();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => on_delivery(delivery, token.clone()).await,
                    None => {
                        debug!(queue = queue_name.as_str(), "delivery stream closed");
                        break;
                    }
                },
            }
        }
    });

    debug!(queue, tag = consumer.tag.as_str(), "consumer started");

    Ok(ConsumerHandle {
        tag: consumer.tag,
        queue: queue.to_owned(),
        connection,
        shutdown,
        task,
    })
}

/// Builds the bus message of a delivery.
///
/// The message type comes from the delivery, falling back to `fallback_type`;
/// the content type from the delivery, then `default_content_type`, then the
/// serialization default.
pub(crate) fn decode_delivery(
    context: &EntityContext,
    delivery: &BrokerDelivery,
    default_content_type: Option<&str>,
    fallback_type: &str,
) -> Result<BusMessage, SerializationError> {
    let props = &delivery.properties;
    let content_type = props
        .content_type
        .as_deref()
        .or(default_content_type)
        .unwrap_or(context.serialization.get_default_content_type())
        .to_owned();

    let body = context.serialization.deserialize(&content_type, &delivery.body)?;

    let message_type = match props.message_type.as_deref() {
        Some(kind) if !kind.is_empty() => kind.to_owned(),
        _ => fallback_type.to_owned(),
    };

    Ok(BusMessage {
        message_type,
        body,
        content_type: Some(content_type),
        correlation_id: props.correlation_id.clone(),
        message_id: props.message_id.clone(),
        route_key: Some(delivery.routing_key.clone()).filter(|k| !k.is_empty()),
        headers: props.headers.clone(),
    })
}

/// Result of running a delivery through its dispatcher.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// The body could not be deserialized; the message is dropped.
    Dropped,
    /// The handler ran; carries the request and the handler's optional response.
    Handled(BusMessage, Option<BusMessage>),
    /// The handler failed.
    Failed(BusMessage, DispatchError),
    /// The consumer shut down while the handler was running.
    Cancelled,
}

/// Deserializes and dispatches a delivery, logging every outcome.
pub(crate) async fn dispatch_delivery(
    context: &EntityContext,
    bus_name: &str,
    entity_name: &str,
    info: &DispatchInfo,
    delivery: &BrokerDelivery,
    default_content_type: Option<&str>,
    cancel: &CancellationToken,
) -> Outcome {
    let span_name = delivery
        .properties
        .message_type
        .clone()
        .unwrap_or_else(|| info.message_type.clone());
    let (ctx, mut span) = otel::new_span(
        &delivery.properties,
        &global::tracer(TRACER_NAME),
        &span_name,
    );

    debug!(
        "received: {} - exchange: {} - queue: {}",
        span_name, delivery.exchange, delivery.queue,
    );

    let msg = match decode_delivery(context, delivery, default_content_type, &info.message_type) {
        Ok(msg) => msg,
        Err(err) => {
            error!(
                error = err.to_string(),
                bus = bus_name,
                entity = entity_name,
                "failure to deserialize message, dropping it"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("failure to deserialize message"),
            });
            context.logger.log(
                &MessageLog::new(
                    MessageLogKind::Error,
                    bus_name,
                    entity_name,
                    "failure to deserialize message",
                )
                .message_type(&span_name)
                .correlation_id(delivery.properties.correlation_id.as_deref())
                .message_id(delivery.properties.message_id.as_deref())
                .error(&err),
            );
            return Outcome::Dropped;
        }
    };

    context.logger.log(
        &MessageLog::new(MessageLogKind::Received, bus_name, entity_name, "message received")
            .message_type(&msg.message_type)
            .correlation_id(msg.correlation_id.as_deref())
            .message_id(msg.message_id.as_deref()),
    );

    let result = context
        .dispatcher
        .invoke_dispatcher_in_new_lifetime_scope(&ctx, info, &msg, cancel)
        .await;

    match result {
        Ok(response) => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
            Outcome::Handled(msg, response)
        }
        Err(DispatchError::Cancelled) => {
            warn!(bus = bus_name, entity = entity_name, "dispatch cancelled by consumer shutdown");
            Outcome::Cancelled
        }
        Err(err) => {
            error!(
                error = err.to_string(),
                bus = bus_name,
                entity = entity_name,
                message_type = msg.message_type.as_str(),
                "error handling message"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error handling message"),
            });
            context.logger.log(
                &MessageLog::new(
                    MessageLogKind::Error,
                    bus_name,
                    entity_name,
                    "error handling message",
                )
                .message_type(&msg.message_type)
                .correlation_id(msg.correlation_id.as_deref())
                .message_id(msg.message_id.as_deref())
                .error(&err),
            );
            Outcome::Failed(msg, err)
        }
    }
}

/// Acknowledges a finished delivery; a cancelled one is requeued for another consumer.
pub(crate) async fn settle(delivery: &BrokerDelivery, outcome: &Outcome) {
    let result = match outcome {
        Outcome::Cancelled => delivery.reject(true).await,
        _ => delivery.ack().await,
    };

    if let Err(err) = result {
        error!(error = err.to_string(), queue = delivery.queue.as_str(), "error whiling settling msg");
    }
}

/// Logs a failure that happened after the handler ran.
pub(crate) fn log_error(
    context: &EntityContext,
    bus_name: &str,
    entity_name: &str,
    msg: &BusMessage,
    details: &str,
    err: &dyn std::error::Error,
) {
    error!(
        error = err.to_string(),
        bus = bus_name,
        entity = entity_name,
        message_type = msg.message_type.as_str(),
        "{}",
        details
    );
    context.logger.log(
        &MessageLog::new(MessageLogKind::Error, bus_name, entity_name, details)
            .message_type(&msg.message_type)
            .correlation_id(msg.correlation_id.as_deref())
            .message_id(msg.message_id.as_deref())
            .error(err),
    );
}

