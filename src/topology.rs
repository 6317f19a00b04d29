// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bus Topology
//!
//! Collects the metadata of every entity a service uses, per bus, and turns it
//! into a running [`BusModule`]. Building validates the whole topology up front
//! so configuration mistakes stop the service at startup:
//!
//! - an exchange or queue declared twice on the same bus
//! - an entity referencing a bus with no registered connection
//! - a content type with no registered serializer
//! - a consumer without a dispatcher, or a publisher without a message type
//! - two RPC clients with the same name
//!
//! Per-queue overrides and RPC targets from [`BusSettings`] are applied while
//! building.

use crate::{
    context::EntityContext,
    errors::BusConfigError,
    exchange::ExchangeMeta,
    module::BusModule,
    queue::{QueueMeta, SubscriptionMeta},
    rpc::{RpcClient, RpcClientMeta, RpcQueueMeta},
    settings::BusSettings,
    strategies::{
        BusEntity, ExchangePublishStrategy, ExchangeSubscriptionStrategy, QueueCreationStrategy,
        QueuePublishStrategy, RpcQueueStrategy,
    },
};
use std::collections::{HashMap, HashSet};
use tracing::{debug, error};

#[derive(Default)]
pub struct BusTopology {
    exchanges: Vec<ExchangeMeta>,
    subscriptions: Vec<SubscriptionMeta>,
    work_queues: Vec<QueueMeta>,
    queue_publishers: Vec<QueueMeta>,
    rpc_queues: Vec<RpcQueueMeta>,
    rpc_clients: Vec<RpcClientMeta>,
    settings: Option<BusSettings>,
}

impl BusTopology {
    pub fn new() -> BusTopology {
        BusTopology::default()
    }

    /// Publishes a message type to an exchange.
    pub fn exchange(mut self, meta: ExchangeMeta) -> Self {
        self.exchanges.push(meta);
        self
    }

    /// Consumes the events of an exchange through a bound queue.
    pub fn subscription(mut self, meta: SubscriptionMeta) -> Self {
        self.subscriptions.push(meta);
        self
    }

    /// Consumes commands sent to a work queue.
    pub fn work_queue(mut self, meta: QueueMeta) -> Self {
        self.work_queues.push(meta);
        self
    }

    /// Sends commands to a work queue of another service.
    pub fn queue_publisher(mut self, meta: QueueMeta) -> Self {
        self.queue_publishers.push(meta);
        self
    }

    pub fn rpc_queue(mut self, meta: RpcQueueMeta) -> Self {
        self.rpc_queues.push(meta);
        self
    }

    pub fn rpc_client(mut self, meta: RpcClientMeta) -> Self {
        self.rpc_clients.push(meta);
        self
    }

    /// Settings overriding route keys and prefetch per queue, and providing RPC targets.
    pub fn with_settings(mut self, settings: BusSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Validates the topology and creates the strategies of every entity.
    pub fn build(mut self, context: EntityContext) -> Result<BusModule, BusConfigError> {
        self.apply_settings();

        if let Err(err) = self.validate(&context) {
            error!(error = err.to_string(), "invalid bus topology");
            return Err(err);
        }

        let mut entities = vec![];
        for meta in self.exchanges {
            entities.push(BusEntity::ExchangePublish(ExchangePublishStrategy::new(meta, context.clone())));
        }
        for meta in self.subscriptions {
            entities.push(BusEntity::ExchangeSubscription(ExchangeSubscriptionStrategy::new(
                meta,
                context.clone(),
            )));
        }
        for meta in self.work_queues {
            entities.push(BusEntity::WorkQueue(QueueCreationStrategy::new(meta, context.clone())));
        }
        for meta in self.queue_publishers {
            entities.push(BusEntity::QueuePublish(QueuePublishStrategy::new(meta, context.clone())));
        }
        for meta in self.rpc_queues {
            entities.push(BusEntity::RpcQueue(RpcQueueStrategy::new(meta, context.clone())));
        }

        let rpc_clients: HashMap<String, RpcClient> = self
            .rpc_clients
            .into_iter()
            .map(|meta| (meta.name.clone(), RpcClient::new(meta, context.clone())))
            .collect();

        debug!(
            entities = entities.len(),
            rpc_clients = rpc_clients.len(),
            "bus topology built"
        );

        Ok(BusModule::new(context, entities, rpc_clients))
    }

    fn apply_settings(&mut self) {
        let Some(settings) = self.settings.take() else {
            return;
        };

        for meta in self.subscriptions.iter_mut() {
            if let Some(queue) = settings.queue(&meta.bus_name, meta.queue_name()) {
                meta.apply_settings(queue);
            }
        }

        for meta in self.work_queues.iter_mut() {
            if let Some(queue) = settings.queue(&meta.bus_name, meta.queue_name()) {
                meta.apply_settings(queue);
            }
        }

        // Configured targets replace clients of the same name declared in code.
        for target in &settings.rpc_targets {
            self.rpc_clients.retain(|client| client.name != target.name);
            self.rpc_clients.push(RpcClientMeta::from(target));
        }
    }

    fn validate(&self, context: &EntityContext) -> Result<(), BusConfigError> {
        let known_bus = |bus: &str, entity: &str| -> Result<(), BusConfigError> {
            if context.connections().contains(bus) {
                Ok(())
            } else {
                Err(BusConfigError::UnknownBus {
                    bus: bus.to_owned(),
                    entity: entity.to_owned(),
                })
            }
        };
        let serializer = |content_type: Option<&str>, entity: &str| -> Result<(), BusConfigError> {
            match content_type {
                Some(ct) if !context.serialization_manager().has(ct) => Err(BusConfigError::MissingSerializer {
                    content_type: ct.to_owned(),
                    entity: entity.to_owned(),
                }),
                _ => Ok(()),
            }
        };

        let mut exchanges = HashSet::new();
        for meta in &self.exchanges {
            known_bus(meta.bus_name(), meta.exchange_name())?;
            serializer(meta.content_type.as_deref(), meta.exchange_name())?;
            if !exchanges.insert((meta.bus_name(), meta.exchange_name())) {
                return Err(BusConfigError::DuplicateExchange {
                    bus: meta.bus_name().to_owned(),
                    name: meta.exchange_name().to_owned(),
                });
            }
        }

        let mut queues = HashSet::new();
        let mut declare_queue = |bus: &str, name: &str| -> Result<(), BusConfigError> {
            if queues.insert((bus.to_owned(), name.to_owned())) {
                Ok(())
            } else {
                Err(BusConfigError::DuplicateQueue {
                    bus: bus.to_owned(),
                    name: name.to_owned(),
                })
            }
        };

        for meta in &self.subscriptions {
            known_bus(meta.bus_name(), meta.queue_name())?;
            serializer(meta.content_type.as_deref(), meta.queue_name())?;
            declare_queue(meta.bus_name(), meta.queue_name())?;
        }

        for meta in &self.work_queues {
            known_bus(meta.bus_name(), meta.queue_name())?;
            serializer(meta.content_type.as_deref(), meta.queue_name())?;
            declare_queue(meta.bus_name(), meta.queue_name())?;
            if meta.dispatch.is_none() {
                return Err(BusConfigError::MissingDispatcher(meta.queue_name().to_owned()));
            }
        }

        for meta in &self.rpc_queues {
            known_bus(meta.bus_name(), meta.queue_name())?;
            serializer(meta.content_type.as_deref(), meta.queue_name())?;
            declare_queue(meta.bus_name(), meta.queue_name())?;
            if meta.handlers.is_empty() {
                return Err(BusConfigError::MissingDispatcher(meta.queue_name().to_owned()));
            }
        }

        for meta in &self.queue_publishers {
            known_bus(meta.bus_name(), meta.queue_name())?;
            serializer(meta.content_type.as_deref(), meta.queue_name())?;
            if meta.message_type.is_none() {
                return Err(BusConfigError::MissingMessageType(meta.queue_name().to_owned()));
            }
        }

        let mut clients = HashSet::new();
        for meta in &self.rpc_clients {
            known_bus(meta.bus_name(), meta.name())?;
            serializer(Some(meta.content_type.as_str()), meta.name())?;
            if !clients.insert(meta.name()) {
                return Err(BusConfigError::DuplicateRpcClient(meta.name().to_owned()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dispatcher::{DispatchInfo, MockConsumerHandler},
        exchange::ExchangeDefinition,
        memory::InMemoryBroker,
        queue::QueueDefinition,
        settings::{QueueSettings, RpcTargetSettings},
        strategies::testing,
    };
    use std::sync::Arc;

    fn info() -> DispatchInfo {
        DispatchInfo::shared("OrderPlaced", Arc::new(MockConsumerHandler::new()))
    }

    fn context() -> EntityContext {
        testing::context_with(&[&InMemoryBroker::new("busA"), &InMemoryBroker::new("busB")])
    }

    fn build(topology: BusTopology) -> Result<BusModule, BusConfigError> {
        topology.build(context())
    }

    #[test]
    fn exchange_names_are_unique_per_bus() {
        let orders = |bus: &str| ExchangeMeta::new(bus, ExchangeDefinition::new("orders"), "OrderPlaced");

        assert!(build(BusTopology::new().exchange(orders("busA")).exchange(orders("busB"))).is_ok());
        assert_eq!(
            build(BusTopology::new().exchange(orders("busA")).exchange(orders("busA"))).err(),
            Some(BusConfigError::DuplicateExchange {
                bus: "busA".to_owned(),
                name: "orders".to_owned()
            })
        );
    }

    #[test]
    fn queue_names_are_unique_per_bus_across_entity_kinds() {
        let topology = BusTopology::new()
            .subscription(SubscriptionMeta::new("busA", "orders", QueueDefinition::new("billing"), info()))
            .work_queue(QueueMeta::new("busA", QueueDefinition::new("billing")).dispatch(info()));

        assert_eq!(
            build(topology).err(),
            Some(BusConfigError::DuplicateQueue {
                bus: "busA".to_owned(),
                name: "billing".to_owned()
            })
        );
    }

    #[test]
    fn unknown_bus_is_rejected() {
        let topology = BusTopology::new().subscription(SubscriptionMeta::new(
            "busC",
            "orders",
            QueueDefinition::new("billing"),
            info(),
        ));

        assert_eq!(
            build(topology).err(),
            Some(BusConfigError::UnknownBus {
                bus: "busC".to_owned(),
                entity: "billing".to_owned()
            })
        );
    }

    #[test]
    fn content_type_without_serializer_is_rejected() {
        let topology = BusTopology::new().exchange(
            ExchangeMeta::new("busA", ExchangeDefinition::new("orders"), "OrderPlaced")
                .content_type("application/x-protobuf"),
        );

        assert_eq!(
            build(topology).err(),
            Some(BusConfigError::MissingSerializer {
                content_type: "application/x-protobuf".to_owned(),
                entity: "orders".to_owned()
            })
        );
    }

    #[test]
    fn consumers_need_dispatchers_and_publishers_message_types() {
        assert_eq!(
            build(BusTopology::new().work_queue(QueueMeta::new("busA", QueueDefinition::new("billing")))).err(),
            Some(BusConfigError::MissingDispatcher("billing".to_owned()))
        );
        assert_eq!(
            build(BusTopology::new().rpc_queue(RpcQueueMeta::new("busA", QueueDefinition::new("pricing")))).err(),
            Some(BusConfigError::MissingDispatcher("pricing".to_owned()))
        );
        assert_eq!(
            build(BusTopology::new().queue_publisher(QueueMeta::new("busA", QueueDefinition::new("billing")))).err(),
            Some(BusConfigError::MissingMessageType("billing".to_owned()))
        );
    }

    #[test]
    fn rpc_client_names_are_unique() {
        let topology = BusTopology::new()
            .rpc_client(RpcClientMeta::new("pricing", "busA", "pricing"))
            .rpc_client(RpcClientMeta::new("pricing", "busB", "pricing"));

        assert_eq!(
            build(topology).err(),
            Some(BusConfigError::DuplicateRpcClient("pricing".to_owned()))
        );
    }

    #[test]
    fn settings_override_queues_and_provide_rpc_targets() {
        let settings = BusSettings {
            connections: vec![],
            queues: vec![QueueSettings {
                bus_name: "busA".to_owned(),
                queue_name: "billing".to_owned(),
                route_keys: Some(vec!["orders.eu".to_owned()]),
                prefetch_count: Some(1),
            }],
            rpc_targets: vec![RpcTargetSettings {
                name: "pricing".to_owned(),
                bus_name: "busB".to_owned(),
                request_queue_name: "pricing.requests".to_owned(),
                request_exchange: String::default(),
                content_type: "application/json".to_owned(),
                cancel_rpc_request_after_ms: 500,
            }],
        };

        let module = build(
            BusTopology::new()
                .subscription(SubscriptionMeta::new("busA", "orders", QueueDefinition::new("billing"), info()))
                .rpc_client(RpcClientMeta::new("pricing", "busA", "pricing"))
                .with_settings(settings),
        )
        .unwrap();

        match &module.entities()[0] {
            BusEntity::ExchangeSubscription(s) => {
                assert_eq!(s.meta().route_keys, vec!["orders.eu".to_owned()]);
                assert_eq!(s.meta().consumer.prefetch_count, 1);
            }
            _ => panic!("expected a subscription"),
        }

        let client = module.rpc_client("pricing").unwrap();
        assert_eq!(client.meta().bus_name(), "busB");
        assert_eq!(client.meta().cancel_rpc_request_after_ms, 500);
    }
}
