// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bus Entity Strategies
//!
//! One strategy per logical entity, each implementing the capabilities it
//! supports:
//!
//! | variant                | create | publish | subscribe | dispose |
//! |------------------------|--------|---------|-----------|---------|
//! | exchange publish       | ✓      | ✓       |           |         |
//! | exchange subscription  | ✓      |         | ✓         | ✓       |
//! | work queue             | ✓      |         | ✓         | ✓       |
//! | queue publish          | ✓      | ✓       |           |         |
//! | rpc queue              | ✓      |         | ✓         | ✓       |
//!
//! [`BusEntity`] is the closed set of variants the bus module drives.

mod exchange_publish;
mod exchange_subscription;
mod queue_creation;
mod queue_publish;
mod rpc_queue;

pub use exchange_publish::ExchangePublishStrategy;
pub use exchange_subscription::ExchangeSubscriptionStrategy;
pub use queue_creation::QueueCreationStrategy;
pub use queue_publish::QueuePublishStrategy;
pub use rpc_queue::RpcQueueStrategy;

use crate::{
    errors::{AmqpError, PublishError},
    message::BusMessage,
};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Declares the entity and its auxiliaries on the broker.
#[async_trait]
pub trait CreationStrategy: Send + Sync {
    /// Idempotent; a no-op when auto-create is disabled.
    async fn create_entity(&self) -> Result<(), AmqpError>;
}

#[async_trait]
pub trait PublishStrategy: Send + Sync {
    /// Exact match on the logical message type.
    fn can_publish_message_type(&self, message_type: &str) -> bool;

    async fn send_to_entity(&self, msg: &BusMessage, cancel: &CancellationToken) -> Result<(), PublishError>;
}

#[async_trait]
pub trait SubscriptionStrategy: Send + Sync {
    /// Replaces any existing consumer of the entity with a new one.
    async fn subscribe_entity(&self) -> Result<(), AmqpError>;
}

#[async_trait]
pub trait DisposeStrategy: Send + Sync {
    /// Safe to call repeatedly and on a never-subscribed entity.
    async fn on_dispose(&self);
}

pub enum BusEntity {
    ExchangePublish(ExchangePublishStrategy),
    ExchangeSubscription(ExchangeSubscriptionStrategy),
    WorkQueue(QueueCreationStrategy),
    QueuePublish(QueuePublishStrategy),
    RpcQueue(RpcQueueStrategy),
}

impl BusEntity {
    pub fn bus_name(&self) -> &str {
        match self {
            BusEntity::ExchangePublish(s) => s.meta().bus_name(),
            BusEntity::ExchangeSubscription(s) => s.meta().bus_name(),
            BusEntity::WorkQueue(s) => s.meta().bus_name(),
            BusEntity::QueuePublish(s) => s.meta().bus_name(),
            BusEntity::RpcQueue(s) => s.meta().bus_name(),
        }
    }

    pub fn entity_name(&self) -> &str {
        match self {
            BusEntity::ExchangePublish(s) => s.meta().exchange_name(),
            BusEntity::ExchangeSubscription(s) => s.queue_name(),
            BusEntity::WorkQueue(s) => s.meta().queue_name(),
            BusEntity::QueuePublish(s) => s.meta().queue_name(),
            BusEntity::RpcQueue(s) => s.meta().queue_name(),
        }
    }

    pub fn creation(&self) -> &dyn CreationStrategy {
        match self {
            BusEntity::ExchangePublish(s) => s,
            BusEntity::ExchangeSubscription(s) => s,
            BusEntity::WorkQueue(s) => s,
            BusEntity::QueuePublish(s) => s,
            BusEntity::RpcQueue(s) => s,
        }
    }

    pub fn publisher(&self) -> Option<&dyn PublishStrategy> {
        match self {
            BusEntity::ExchangePublish(s) => Some(s),
            BusEntity::QueuePublish(s) => Some(s),
            _ => None,
        }
    }

    pub fn subscriber(&self) -> Option<&dyn SubscriptionStrategy> {
        match self {
            BusEntity::ExchangeSubscription(s) => Some(s),
            BusEntity::WorkQueue(s) => Some(s),
            BusEntity::RpcQueue(s) => Some(s),
            _ => None,
        }
    }

    pub fn disposer(&self) -> Option<&dyn DisposeStrategy> {
        match self {
            BusEntity::ExchangeSubscription(s) => Some(s),
            BusEntity::WorkQueue(s) => Some(s),
            BusEntity::RpcQueue(s) => Some(s),
            _ => None,
        }
    }
}
