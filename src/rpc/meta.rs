// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::{
    dispatcher::DispatchInfo,
    message::RpcCommand,
    queue::{ConsumerSettings, QueueDefinition},
    serialization::JSON_CONTENT_TYPE,
    settings::RpcTargetSettings,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Where an RPC client sends its requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcClientMeta {
    pub(crate) name: String,
    pub(crate) bus_name: String,
    pub(crate) request_exchange: String,
    pub(crate) request_routing_key: String,
    pub(crate) content_type: String,
    pub(crate) cancel_rpc_request_after_ms: u64,
}

impl RpcClientMeta {
    /// Requests go through the default exchange to `request_queue`, timing out after 10s.
    pub fn new(name: &str, bus_name: &str, request_queue: &str) -> RpcClientMeta {
        RpcClientMeta {
            name: name.to_owned(),
            bus_name: bus_name.to_owned(),
            request_exchange: String::default(),
            request_routing_key: request_queue.to_owned(),
            content_type: JSON_CONTENT_TYPE.to_owned(),
            cancel_rpc_request_after_ms: 10_000,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    pub fn request_exchange(mut self, exchange: &str, routing_key: &str) -> Self {
        self.request_exchange = exchange.to_owned();
        self.request_routing_key = routing_key.to_owned();
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.cancel_rpc_request_after_ms = ms;
        self
    }
}

impl From<&RpcTargetSettings> for RpcClientMeta {
    fn from(settings: &RpcTargetSettings) -> Self {
        RpcClientMeta::new(&settings.name, &settings.bus_name, &settings.request_queue_name)
            .request_exchange(&settings.request_exchange, &settings.request_queue_name)
            .content_type(&settings.content_type)
            .timeout_ms(settings.cancel_rpc_request_after_ms)
    }
}

/// Request queue served by handlers keyed by action namespace.
#[derive(Debug, Clone)]
pub struct RpcQueueMeta {
    pub(crate) bus_name: String,
    pub(crate) definition: QueueDefinition,
    pub(crate) consumer: ConsumerSettings,
    pub(crate) content_type: Option<String>,
    pub(crate) handlers: HashMap<String, DispatchInfo>,
}

impl RpcQueueMeta {
    pub fn new(bus_name: &str, definition: QueueDefinition) -> RpcQueueMeta {
        RpcQueueMeta {
            bus_name: bus_name.to_owned(),
            definition,
            consumer: ConsumerSettings::default(),
            content_type: None,
            handlers: HashMap::default(),
        }
    }

    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    pub fn queue_name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &QueueDefinition {
        &self.definition
    }

    /// Serves requests whose action namespace is `namespace`.
    pub fn handler(mut self, namespace: &str, info: DispatchInfo) -> Self {
        self.handlers.insert(namespace.to_owned(), info);
        self
    }

    pub fn command<C: RpcCommand>(self, info: DispatchInfo) -> Self {
        self.handler(C::ACTION_NAMESPACE, info)
    }

    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.consumer.prefetch_count = count;
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn namespaces(&self) -> Vec<&str> {
        let mut namespaces: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        namespaces.sort_unstable();
        namespaces
    }
}

/// Body of an exception reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    pub action_namespace: String,
}

impl RemoteError {
    pub fn new(message: impl Into<String>, action_namespace: &str) -> RemoteError {
        RemoteError {
            message: message.into(),
            action_namespace: action_namespace.to_owned(),
        }
    }

    /// Reads the payload of a remote exception; `None` when it is not a serialized remote error.
    pub fn from_payload(payload: &[u8]) -> Option<RemoteError> {
        serde_json::from_slice(payload).ok()
    }
}
