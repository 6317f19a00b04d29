// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::{
    meta::RpcClientMeta,
    pending::{PendingRequests, ReplyResult, RpcPendingRequest},
    RPC_REPLY_QUEUE_PREFIX,
};
use crate::{
    connection::{BrokerDelivery, ConsumeOptions},
    consumer::{consumer_tag, start_consumer, ConsumerHandle},
    context::EntityContext,
    errors::{AmqpError, PublishError, RpcError, SerializationError},
    logger::{MessageLog, MessageLogKind},
    message::{BusMessage, RpcCommand, RPC_ACTION_HEADER, RPC_EXCEPTION_HEADER},
    publisher::{message_properties, publish_message, resolve_content_type, PublishTarget},
    queue::QueueDefinition,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{oneshot, Mutex},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Sends requests to a remote handler and awaits the correlated reply.
///
/// Replies arrive on a private queue named `rpc_reply_<uuid>`, declared
/// exclusive and auto-delete. The name is fixed for the lifetime of the client
/// so it survives reconnection; [`subscribe`](RpcClient::subscribe) declares it
/// again and replaces the consumer.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    meta: RpcClientMeta,
    context: EntityContext,
    reply_queue: String,
    pending: Arc<PendingRequests>,
    consumer: Mutex<Option<ConsumerHandle>>,
    disposed: AtomicBool,
}

impl RpcClient {
    pub fn new(meta: RpcClientMeta, context: EntityContext) -> RpcClient {
        let reply_queue = format!("{}{}", RPC_REPLY_QUEUE_PREFIX, Uuid::new_v4().simple());

        RpcClient {
            inner: Arc::new(ClientInner {
                meta,
                context,
                reply_queue,
                pending: Arc::default(),
                consumer: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn meta(&self) -> &RpcClientMeta {
        &self.inner.meta
    }

    pub fn reply_queue_name(&self) -> &str {
        &self.inner.reply_queue
    }

    /// Requests still waiting for their reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Declares the reply queue and starts consuming it, replacing any previous consumer.
    ///
    /// Requests pending across a reconnection are not replayed; they resolve
    /// with their reply if it still arrives, or with their timeout.
    pub async fn subscribe(&self) -> Result<(), AmqpError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            debug!(client = self.inner.meta.name.as_str(), "rpc client disposed, not subscribing");
            return Ok(());
        }

        let mut current = self.inner.consumer.lock().await;
        if let Some(previous) = current.take() {
            previous.dispose().await;
        }

        let bus_name = self.inner.meta.bus_name.clone();
        let connection = self.inner.context.connection(&bus_name)?;
        let queue = &self.inner.reply_queue;

        debug!("creating reply queue: {}", queue);
        if let Err(err) = connection
            .create_queue(&QueueDefinition::new(queue).exclusive().delete())
            .await
        {
            error!(error = err.to_string(), queue = queue.as_str(), "error to declare the reply queue");
            return Err(err);
        }

        let mut options = ConsumeOptions::new(&consumer_tag(queue));
        options.exclusive = true;

        let pending = self.inner.pending.clone();
        let context = self.inner.context.clone();

        let handle = start_consumer(connection, queue, options, move |delivery, _| {
            let pending = pending.clone();
            let context = context.clone();
            let bus_name = bus_name.clone();

            async move { on_reply(&context, &bus_name, &pending, delivery).await }
        })
        .await?;

        *current = Some(handle);
        Ok(())
    }

    /// Sends `msg` to the remote `action_namespace` and waits for its reply body.
    ///
    /// Resolves with exactly one of: the reply, [`RpcError::RemoteException`],
    /// [`RpcError::Timeout`] once the configured timeout elapses, or
    /// [`RpcError::Cancelled`] when `cancel` fires. The correlation id of `msg`
    /// is kept when set, otherwise a new one is generated.
    pub async fn send_request(
        &self,
        msg: BusMessage,
        action_namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, RpcError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(RpcError::ClientDisposed);
        }

        let meta = &self.inner.meta;
        let timeout_ms = meta.cancel_rpc_request_after_ms;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        let correlation_id = msg
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let msg = BusMessage {
            correlation_id: Some(correlation_id.clone()),
            ..msg
        }
        .with_header(RPC_ACTION_HEADER, action_namespace);

        let cancellation = cancel.child_token();
        let (reply, mut rx) = oneshot::channel();
        self.inner
            .pending
            .insert(RpcPendingRequest::new(&correlation_id, reply, cancellation.clone()))?;

        // dispose may have drained the table between the first check and the insert
        if self.inner.disposed.load(Ordering::SeqCst) {
            return match self.inner.pending.take(&correlation_id) {
                Some(_) => Err(RpcError::ClientDisposed),
                None => resolved(rx).await,
            };
        }

        let content_type = resolve_content_type(&self.inner.context, &msg, Some(&meta.content_type));
        let mut properties = message_properties(&msg, &content_type, false);
        properties.reply_to = Some(self.inner.reply_queue.clone());
        let target = PublishTarget::new(
            &meta.bus_name,
            &meta.name,
            &meta.request_exchange,
            &meta.request_routing_key,
        );

        let published = tokio::time::timeout_at(
            deadline,
            publish_message(&self.inner.context, &target, &msg, properties, &cancellation),
        )
        .await;

        let failure = match published {
            Ok(Ok(())) => None,
            Ok(Err(PublishError::Cancelled)) => Some(RpcError::Cancelled {
                correlation_id: correlation_id.clone(),
            }),
            Ok(Err(err)) => Some(RpcError::Publish(err)),
            Err(_) => {
                warn!(
                    client = meta.name.as_str(),
                    correlation_id = correlation_id.as_str(),
                    timeout_ms,
                    "rpc request timed out while publishing"
                );
                Some(RpcError::Timeout {
                    correlation_id: correlation_id.clone(),
                    timeout_ms,
                })
            }
        };

        if let Some(err) = failure {
            return match self.inner.pending.take(&correlation_id) {
                Some(request) => {
                    request.complete(Err(err.clone()));
                    Err(err)
                }
                None => resolved(rx).await,
            };
        }

        let timed_out = tokio::select! {
            result = &mut rx => return result.unwrap_or(Err(RpcError::ClientDisposed)),
            _ = tokio::time::sleep_until(deadline) => true,
            _ = cancellation.cancelled() => false,
        };

        // Whoever removes the entry decides the outcome; a reply that got there first wins.
        match self.inner.pending.take(&correlation_id) {
            Some(request) => {
                let err = if timed_out {
                    warn!(
                        client = meta.name.as_str(),
                        correlation_id = correlation_id.as_str(),
                        timeout_ms,
                        "rpc request timed out"
                    );
                    RpcError::Timeout {
                        correlation_id,
                        timeout_ms,
                    }
                } else {
                    debug!(correlation_id = correlation_id.as_str(), "rpc request cancelled");
                    RpcError::Cancelled { correlation_id }
                };
                request.complete(Err(err.clone()));
                Err(err)
            }
            None => resolved(rx).await,
        }
    }

    /// Sends a typed command and decodes its typed response.
    pub async fn send<C: RpcCommand>(
        &self,
        command: &C,
        cancel: &CancellationToken,
    ) -> Result<C::Response, RpcError> {
        let msg = BusMessage::from_message(command)?;
        let body = self.send_request(msg, C::ACTION_NAMESPACE, cancel).await?;

        let value = self
            .inner
            .context
            .serialization
            .deserialize(&self.inner.meta.content_type, &body)?;
        serde_json::from_value(value)
            .map_err(|err| RpcError::from(SerializationError::Deserialize(err.to_string())))
    }

    /// Fails every pending request with [`RpcError::ClientDisposed`] and stops the reply consumer.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        for request in self.inner.pending.drain() {
            request.complete(Err(RpcError::ClientDisposed));
        }

        if let Some(handle) = self.inner.consumer.lock().await.take() {
            handle.dispose().await;
        }
    }
}

async fn resolved(rx: oneshot::Receiver<ReplyResult>) -> ReplyResult {
    rx.await.unwrap_or(Err(RpcError::ClientDisposed))
}

/// Completes the request a reply is correlated with; anything else is discarded.
async fn on_reply(context: &EntityContext, bus_name: &str, pending: &PendingRequests, delivery: BrokerDelivery) {
    match delivery.properties.correlation_id.as_deref() {
        None => warn!(queue = delivery.queue.as_str(), "reply without correlation id discarded"),
        Some(correlation_id) => match pending.take(correlation_id) {
            None => debug!(
                correlation_id,
                queue = delivery.queue.as_str(),
                "reply for an unknown or expired request discarded"
            ),
            Some(request) => {
                let exception = delivery
                    .properties
                    .header(RPC_EXCEPTION_HEADER)
                    .is_some_and(|flag| flag.eq_ignore_ascii_case("true"));

                context.logger.log(
                    &MessageLog::new(MessageLogKind::Received, bus_name, &delivery.queue, "reply received")
                        .message_type(delivery.properties.message_type.as_deref().unwrap_or_default())
                        .correlation_id(Some(correlation_id))
                        .message_id(delivery.properties.message_id.as_deref()),
                );

                request.complete(if exception {
                    Err(RpcError::RemoteException {
                        correlation_id: correlation_id.to_owned(),
                        payload: delivery.body.clone(),
                    })
                } else {
                    Ok(delivery.body.clone())
                });
            }
        },
    }

    if let Err(err) = delivery.ack().await {
        error!(error = err.to_string(), queue = delivery.queue.as_str(), "error whiling ack reply");
    }
}
