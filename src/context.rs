// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Entity Context
//!
//! Read-only collaborators shared by every strategy: connections, serializers,
//! the dispatcher, the message logger, the auto-create switch and the token
//! identifying this running service instance.

use crate::{
    connection::{BrokerConnection, ConnectionRegistry},
    dispatcher::{MessageDispatcher, ScopedDispatcher},
    errors::AmqpError,
    logger::{MessageLogger, TracingMessageLogger},
    serialization::SerializationManager,
};
use std::sync::Arc;
use uuid::Uuid;

/// Tracer name used for consumer spans
pub const TRACER_NAME: &str = "amqp consumer";

#[derive(Clone)]
pub struct EntityContext {
    pub(crate) connections: Arc<ConnectionRegistry>,
    pub(crate) serialization: Arc<SerializationManager>,
    pub(crate) dispatcher: Arc<dyn MessageDispatcher>,
    pub(crate) logger: Arc<dyn MessageLogger>,
    pub(crate) auto_create: bool,
    pub(crate) instance_id: String,
}

impl EntityContext {
    /// Context with JSON/text serializers, the scoped dispatcher, tracing logs,
    /// auto-create enabled and a fresh instance token.
    pub fn new(connections: ConnectionRegistry) -> EntityContext {
        EntityContext {
            connections: Arc::new(connections),
            serialization: Arc::new(SerializationManager::default()),
            dispatcher: Arc::new(ScopedDispatcher),
            logger: Arc::new(TracingMessageLogger),
            auto_create: true,
            instance_id: Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn serialization(mut self, serialization: SerializationManager) -> Self {
        self.serialization = Arc::new(serialization);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn MessageDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn logger(mut self, logger: Arc<dyn MessageLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// When disabled, topology is assumed to be provisioned outside the service.
    pub fn auto_create(mut self, enabled: bool) -> Self {
        self.auto_create = enabled;
        self
    }

    pub fn instance_id(mut self, id: &str) -> Self {
        self.instance_id = id.to_owned();
        self
    }

    pub fn is_auto_create_enabled(&self) -> bool {
        self.auto_create
    }

    pub fn get_instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn serialization_manager(&self) -> &SerializationManager {
        &self.serialization
    }

    pub fn connection(&self, bus_name: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        self.connections.get(bus_name)
    }
}
