// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bus Messages
//!
//! Application code works with typed messages implementing [`Message`]. Inside the
//! bus layer they travel as a [`BusMessage`]: the logical message type, a
//! serializer-neutral body and the metadata stamped on the wire.

use crate::errors::{DispatchError, SerializationError};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Header carrying the action namespace of an RPC request
pub const RPC_ACTION_HEADER: &str = "rpc-action";
/// Header flagging an RPC reply whose body is a serialized remote error
pub const RPC_EXCEPTION_HEADER: &str = "rpc-exception";

/// A message type known to the bus.
///
/// `MESSAGE_TYPE` is the logical name stamped on the wire and used to match
/// publishers and dispatchers. Matching is exact.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    const MESSAGE_TYPE: &'static str;
}

/// A command answered over RPC.
pub trait RpcCommand: Message {
    type Response: Serialize + DeserializeOwned + Send + 'static;

    /// Identifies the remote operation; defaults to the message type.
    const ACTION_NAMESPACE: &'static str = Self::MESSAGE_TYPE;
}

/// Type-erased message as seen by strategies and dispatchers.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub message_type: String,
    pub body: Value,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub route_key: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl BusMessage {
    pub fn new(message_type: impl Into<String>, body: Value) -> BusMessage {
        BusMessage {
            message_type: message_type.into(),
            body,
            content_type: None,
            correlation_id: None,
            message_id: None,
            route_key: None,
            headers: BTreeMap::default(),
        }
    }

    /// Wraps a typed message.
    pub fn from_message<M: Message>(msg: &M) -> Result<BusMessage, SerializationError> {
        let body =
            serde_json::to_value(msg).map_err(|e| SerializationError::Serialize(e.to_string()))?;
        Ok(BusMessage::new(M::MESSAGE_TYPE, body))
    }

    /// Reads the body back as a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, SerializationError> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| SerializationError::Deserialize(e.to_string()))
    }

    pub fn is<M: Message>(&self) -> bool {
        self.message_type == M::MESSAGE_TYPE
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_route_key(mut self, key: impl Into<String>) -> Self {
        self.route_key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Parsed work-queue reply address, written on the wire as `<busName>:<queueName>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTo {
    pub bus_name: String,
    pub queue_name: String,
}

impl ReplyTo {
    pub fn new(bus_name: impl Into<String>, queue_name: impl Into<String>) -> ReplyTo {
        ReplyTo {
            bus_name: bus_name.into(),
            queue_name: queue_name.into(),
        }
    }

    pub fn parse(value: &str) -> Result<ReplyTo, DispatchError> {
        match value.split_once(':') {
            Some((bus, queue)) if !bus.is_empty() && !queue.is_empty() && !queue.contains(':') => {
                Ok(ReplyTo::new(bus, queue))
            }
            _ => Err(DispatchError::InvalidReplyTo(value.to_owned())),
        }
    }
}

impl std::fmt::Display for ReplyTo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.bus_name, self.queue_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct OrderPlaced {
        id: u32,
    }

    impl Message for OrderPlaced {
        const MESSAGE_TYPE: &'static str = "OrderPlaced";
    }

    #[test]
    fn wraps_and_decodes_typed_message() {
        let msg = BusMessage::from_message(&OrderPlaced { id: 7 }).unwrap();

        assert_eq!(msg.message_type, "OrderPlaced");
        assert!(msg.is::<OrderPlaced>());
        assert_eq!(msg.decode::<OrderPlaced>().unwrap(), OrderPlaced { id: 7 });
    }

    #[test]
    fn parses_reply_to() {
        let reply = ReplyTo::parse("busA:replyQ").unwrap();

        assert_eq!(reply, ReplyTo::new("busA", "replyQ"));
        assert_eq!(reply.to_string(), "busA:replyQ");
    }

    #[test]
    fn rejects_malformed_reply_to() {
        for value in ["replyQ", ":replyQ", "busA:", "a:b:c", ""] {
            assert_eq!(
                ReplyTo::parse(value),
                Err(DispatchError::InvalidReplyTo(value.to_owned()))
            );
        }
    }
}
