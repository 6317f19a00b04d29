// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! Every failure the bus layer can report, grouped by when it happens:
//!
//! - [`BusConfigError`]: composition time, fatal, prevents startup
//! - [`AmqpError`]: a broker primitive (declare, bind, publish, consume) failed
//! - [`PublishError`]: the publish path of a strategy failed
//! - [`DispatchError`]: a received message could not be handed to, or answered by, its handler
//! - [`RpcError`]: an awaited request/reply call did not produce a successful reply
//! - [`SerializationError`]: a body could not be turned into bytes or back

use thiserror::Error;

/// Errors raised by the broker connection primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the broker
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// The connection was lost and has not been re-established yet
    #[error("connection to bus `{0}` is closed")]
    ConnectionClosed(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// No connection is registered under the given bus name
    #[error("no connection registered for bus `{0}`")]
    UnknownBus(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// The target exchange of a publish does not exist
    #[error("exchange `{0}` not found")]
    ExchangeNotFound(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,
}

/// Composition-time configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusConfigError {
    #[error("exchange `{name}` is declared more than once on bus `{bus}`")]
    DuplicateExchange { bus: String, name: String },

    #[error("queue `{name}` is declared more than once on bus `{bus}`")]
    DuplicateQueue { bus: String, name: String },

    #[error("entity `{entity}` references unknown bus `{bus}`")]
    UnknownBus { bus: String, entity: String },

    #[error("no serializer registered for content type `{content_type}` used by `{entity}`")]
    MissingSerializer {
        content_type: String,
        entity: String,
    },

    #[error("entity `{0}` consumes messages but has no dispatcher")]
    MissingDispatcher(String),

    #[error("entity `{0}` publishes but declares no message type")]
    MissingMessageType(String),

    #[error("rpc client `{0}` is declared more than once")]
    DuplicateRpcClient(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

/// Errors produced by a serializer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerializationError {
    #[error("no serializer registered for content type `{0}`")]
    UnsupportedContentType(String),

    #[error("failure to serialize: {0}")]
    Serialize(String),

    #[error("failure to deserialize: {0}")]
    Deserialize(String),
}

/// Errors of the publish path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("no entity can publish message type `{0}`")]
    NoPublisher(String),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("failure to publish to `{entity}` on bus `{bus}`: {source}")]
    Broker {
        bus: String,
        entity: String,
        #[source]
        source: AmqpError,
    },

    #[error("publish cancelled")]
    Cancelled,
}

/// Error returned by a message handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        HandlerError(msg.into())
    }
}

/// Errors raised between receiving a message and finishing with it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatcher expects message type `{expected}` but received `{actual}`")]
    MessageTypeMismatch { expected: String, actual: String },

    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("dispatch cancelled")]
    Cancelled,

    #[error("invalid reply-to `{0}`, expected `<busName>:<queueName>`")]
    InvalidReplyTo(String),

    #[error("failure to send reply to `{reply_to}`: {reason}")]
    ReplyRouting { reply_to: String, reason: String },
}

/// Errors observed by the caller of an RPC request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("rpc request `{correlation_id}` timed out after {timeout_ms}ms")]
    Timeout {
        correlation_id: String,
        timeout_ms: u64,
    },

    #[error("rpc request `{correlation_id}` was cancelled")]
    Cancelled { correlation_id: String },

    #[error("rpc request `{correlation_id}` failed on the remote side")]
    RemoteException {
        correlation_id: String,
        payload: Vec<u8>,
    },

    #[error("rpc request `{0}` uses a correlation id that is already pending")]
    DuplicateCorrelationId(String),

    #[error("rpc client was disposed")]
    ClientDisposed,

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    pub fn is_remote_exception(&self) -> bool {
        matches!(self, RpcError::RemoteException { .. })
    }
}
