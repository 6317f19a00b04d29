// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! The seam between "got bytes off the wire" and "ran application logic".
//!
//! A [`DispatchInfo`] names the message type a consumer accepts and how to
//! obtain a handler for it. The [`MessageDispatcher`] resolves a fresh handler
//! per message (its own lifetime scope, so no state leaks between messages),
//! checks the message type and runs it.

use crate::{
    errors::{DispatchError, HandlerError},
    message::{BusMessage, Message},
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{fmt, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Application message handler.
///
/// Returning `Ok(Some(response))` from a command handler sends the response
/// back to the caller's reply queue.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &BusMessage) -> Result<Option<BusMessage>, HandlerError>;
}

/// Produces the handler instance serving a single message.
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn ConsumerHandler> + Send + Sync>;

#[derive(Clone)]
pub struct DispatchInfo {
    pub(crate) message_type: String,
    pub(crate) factory: HandlerFactory,
}

impl DispatchInfo {
    /// A new handler instance is created by `factory` for every message.
    pub fn new<F>(message_type: &str, factory: F) -> DispatchInfo
    where
        F: Fn() -> Arc<dyn ConsumerHandler> + Send + Sync + 'static,
    {
        DispatchInfo {
            message_type: message_type.to_owned(),
            factory: Arc::new(factory),
        }
    }

    pub fn for_message<M: Message, F>(factory: F) -> DispatchInfo
    where
        F: Fn() -> Arc<dyn ConsumerHandler> + Send + Sync + 'static,
    {
        DispatchInfo::new(M::MESSAGE_TYPE, factory)
    }

    /// Every message is served by the same handler instance.
    pub fn shared(message_type: &str, handler: Arc<dyn ConsumerHandler>) -> DispatchInfo {
        DispatchInfo::new(message_type, move || handler.clone())
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }
}

impl fmt::Debug for DispatchInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchInfo")
            .field("message_type", &self.message_type)
            .finish()
    }
}

#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    async fn invoke_dispatcher_in_new_lifetime_scope(
        &self,
        ctx: &Context,
        info: &DispatchInfo,
        msg: &BusMessage,
        cancel: &CancellationToken,
    ) -> Result<Option<BusMessage>, DispatchError>;
}

/// Default dispatcher: one handler instance per message, cancellable.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScopedDispatcher;

#[async_trait]
impl MessageDispatcher for ScopedDispatcher {
    async fn invoke_dispatcher_in_new_lifetime_scope(
        &self,
        ctx: &Context,
        info: &DispatchInfo,
        msg: &BusMessage,
        cancel: &CancellationToken,
    ) -> Result<Option<BusMessage>, DispatchError> {
        if msg.message_type != info.message_type {
            return Err(DispatchError::MessageTypeMismatch {
                expected: info.message_type.clone(),
                actual: msg.message_type.clone(),
            });
        }

        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let handler = (info.factory)();
        debug!(message_type = msg.message_type.as_str(), "dispatching message");

        tokio::select! {
            result = handler.exec(ctx, msg) => result.map_err(DispatchError::from),
            _ = cancel.cancelled() => Err(DispatchError::Cancelled),
        }
    }
}
