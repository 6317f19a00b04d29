// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions and Metadata
//!
//! [`ExchangeDefinition`] describes what gets declared on the broker.
//! [`ExchangeMeta`] wraps a definition with what the publishing side needs:
//! the bus it lives on, the message type it carries, the predicate deciding
//! whether a given message qualifies and the rule deriving its route key.

use crate::{
    errors::AmqpError,
    message::{BusMessage, Message},
};
use std::{fmt, sync::Arc};

/// Constant for the argument used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";
/// Constant for the argument used to specify an alternate exchange
pub const AMQP_HEADERS_ALTERNATE_EXCHANGE: &str = "alternate-exchange";

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
}

impl TryInto<lapin::ExchangeKind> for ExchangeKind {
    type Error = AmqpError;

    fn try_into(self) -> Result<lapin::ExchangeKind, AmqpError> {
        match self {
            ExchangeKind::Direct => Ok(lapin::ExchangeKind::Direct),
            ExchangeKind::Fanout => Ok(lapin::ExchangeKind::Fanout),
            ExchangeKind::Headers => Ok(lapin::ExchangeKind::Headers),
            ExchangeKind::Topic => Ok(lapin::ExchangeKind::Topic),
            ExchangeKind::XMessageDelayed => {
                Ok(lapin::ExchangeKind::Custom("x-delayed-message".to_owned()))
            }
        }
    }
}

/// Definition of an exchange with its declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) delayed_kind: Option<ExchangeKind>,
    pub(crate) alternate_exchange: Option<String>,
}

impl ExchangeDefinition {
    /// Creates a direct, non-durable exchange definition.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
            no_wait: false,
            delayed_kind: None,
            alternate_exchange: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn get_alternate_exchange(&self) -> Option<&str> {
        self.alternate_exchange.as_deref()
    }

    /// The routing behavior, resolving delayed exchanges to the kind they delay.
    pub fn routing_kind(&self) -> &ExchangeKind {
        match (&self.kind, &self.delayed_kind) {
            (ExchangeKind::XMessageDelayed, Some(kind)) => kind,
            (kind, _) => kind,
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Creates a delayed direct exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn direct_delayed(mut self) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.delayed_kind = Some(ExchangeKind::Direct);
        self
    }

    /// Creates a delayed fanout exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn fanout_delayed(mut self) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.delayed_kind = Some(ExchangeKind::Fanout);
        self
    }

    /// Messages no binding accepts are forwarded to this exchange.
    pub fn alternate_exchange(mut self, name: &str) -> Self {
        self.alternate_exchange = Some(name.to_owned());
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }
}

/// Decides whether a message instance qualifies for an entity.
pub type MessagePredicate = Arc<dyn Fn(&BusMessage) -> bool + Send + Sync>;
/// Derives the route key a message is published with.
pub type RouteKeyRule = Arc<dyn Fn(&BusMessage) -> Option<String> + Send + Sync>;

/// Publishing side of an exchange.
#[derive(Clone)]
pub struct ExchangeMeta {
    pub(crate) bus_name: String,
    pub(crate) definition: ExchangeDefinition,
    pub(crate) message_type: String,
    pub(crate) content_type: Option<String>,
    pub(crate) persistent: bool,
    pub(crate) mandatory: bool,
    pub(crate) predicate: Option<MessagePredicate>,
    pub(crate) route_key: Option<RouteKeyRule>,
}

impl ExchangeMeta {
    pub fn new(bus_name: &str, definition: ExchangeDefinition, message_type: &str) -> ExchangeMeta {
        ExchangeMeta {
            bus_name: bus_name.to_owned(),
            definition,
            message_type: message_type.to_owned(),
            content_type: None,
            persistent: false,
            mandatory: false,
            predicate: None,
            route_key: None,
        }
    }

    pub fn for_message<M: Message>(bus_name: &str, definition: ExchangeDefinition) -> ExchangeMeta {
        ExchangeMeta::new(bus_name, definition, M::MESSAGE_TYPE)
    }

    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &ExchangeDefinition {
        &self.definition
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    /// Messages are published with persistent delivery mode.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// Only messages accepted by `predicate` are published to this exchange.
    pub fn when_domain_event<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&BusMessage) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn route_key<F>(mut self, rule: F) -> Self
    where
        F: Fn(&BusMessage) -> Option<String> + Send + Sync + 'static,
    {
        self.route_key = Some(Arc::new(rule));
        self
    }

    /// Every message is published with the same route key.
    pub fn fixed_route_key(self, key: &str) -> Self {
        let key = key.to_owned();
        self.route_key(move |_| Some(key.clone()))
    }

    pub(crate) fn applies_to(&self, msg: &BusMessage) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(msg),
            None => true,
        }
    }

    /// Route key precedence: the derivation rule, then the key set on the message.
    pub(crate) fn resolve_route_key(&self, msg: &BusMessage) -> String {
        self.route_key
            .as_ref()
            .and_then(|rule| rule(msg))
            .or_else(|| msg.route_key.clone())
            .unwrap_or_default()
    }
}

impl fmt::Debug for ExchangeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeMeta")
            .field("bus_name", &self.bus_name)
            .field("definition", &self.definition)
            .field("message_type", &self.message_type)
            .field("content_type", &self.content_type)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delayed_exchange_routes_like_its_delayed_kind() {
        let def = ExchangeDefinition::new("delayed").fanout_delayed();

        assert_eq!(def.get_kind(), &ExchangeKind::XMessageDelayed);
        assert_eq!(def.routing_kind(), &ExchangeKind::Fanout);
    }

    #[test]
    fn route_key_rule_takes_precedence_over_message_key() {
        let meta = ExchangeMeta::new("bus", ExchangeDefinition::new("orders").topic(), "Placed")
            .route_key(|msg| msg.body["region"].as_str().map(|r| format!("orders.{r}")));

        let msg = BusMessage::new("Placed", json!({"region": "eu"})).with_route_key("ignored");
        assert_eq!(meta.resolve_route_key(&msg), "orders.eu");

        let msg = BusMessage::new("Placed", json!({})).with_route_key("fallback");
        assert_eq!(meta.resolve_route_key(&msg), "fallback");
    }

    #[test]
    fn predicate_filters_messages() {
        let meta = ExchangeMeta::new("bus", ExchangeDefinition::new("big"), "Placed")
            .when_domain_event(|msg| msg.body["total"].as_u64().unwrap_or_default() > 100);

        assert!(meta.applies_to(&BusMessage::new("Placed", json!({"total": 500}))));
        assert!(!meta.applies_to(&BusMessage::new("Placed", json!({"total": 5}))));
    }
}
