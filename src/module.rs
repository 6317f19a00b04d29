// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bus Module
//!
//! Owns the strategies and RPC clients built by [`BusTopology`](crate::topology::BusTopology)
//! and drives their lifecycle: creation and subscription on start, publishing
//! by message type, recovery after a connection failure and disposal.

use crate::{
    context::EntityContext,
    errors::{AmqpError, PublishError},
    message::{BusMessage, Message},
    rpc::RpcClient,
    strategies::BusEntity,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay between two reconnection attempts of a bus.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub struct BusModule {
    context: EntityContext,
    entities: Vec<BusEntity>,
    rpc_clients: HashMap<String, RpcClient>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl BusModule {
    pub(crate) fn new(
        context: EntityContext,
        entities: Vec<BusEntity>,
        rpc_clients: HashMap<String, RpcClient>,
    ) -> BusModule {
        BusModule {
            context,
            entities,
            rpc_clients,
            watchers: Mutex::new(vec![]),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &EntityContext {
        &self.context
    }

    pub fn entities(&self) -> &[BusEntity] {
        &self.entities
    }

    pub fn rpc_client(&self, name: &str) -> Option<&RpcClient> {
        self.rpc_clients.get(name)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Creates every entity, then starts the consumers and the RPC reply queues.
    pub async fn start(&self) -> Result<(), AmqpError> {
        self.start_entities(|_| true).await?;

        info!(
            entities = self.entities.len(),
            rpc_clients = self.rpc_clients.len(),
            "bus module started"
        );
        Ok(())
    }

    async fn start_entities<F>(&self, selected: F) -> Result<(), AmqpError>
    where
        F: Fn(&str) -> bool,
    {
        for entity in self.entities.iter().filter(|e| selected(e.bus_name())) {
            entity.creation().create_entity().await?;
        }

        for entity in self.entities.iter().filter(|e| selected(e.bus_name())) {
            if let Some(subscriber) = entity.subscriber() {
                subscriber.subscribe_entity().await?;
            }
        }

        for client in self.rpc_clients.values().filter(|c| selected(c.meta().bus_name())) {
            client.subscribe().await?;
        }

        Ok(())
    }

    /// Sends the message to every entity publishing its type.
    pub async fn publish(&self, msg: &BusMessage, cancel: &CancellationToken) -> Result<(), PublishError> {
        let publishers: Vec<_> = self
            .entities
            .iter()
            .filter_map(BusEntity::publisher)
            .filter(|p| p.can_publish_message_type(&msg.message_type))
            .collect();

        if publishers.is_empty() {
            warn!(message_type = msg.message_type.as_str(), "no publisher for message type");
            return Err(PublishError::NoPublisher(msg.message_type.clone()));
        }

        for publisher in publishers {
            publisher.send_to_entity(msg, cancel).await?;
        }

        Ok(())
    }

    pub async fn publish_message<M: Message>(&self, msg: &M, cancel: &CancellationToken) -> Result<(), PublishError> {
        let msg = BusMessage::from_message(msg)?;
        self.publish(&msg, cancel).await
    }

    /// Re-establishes the connection of a bus, then recreates and resubscribes
    /// its entities and RPC reply queues.
    pub async fn reconnect(&self, bus_name: &str) -> Result<(), AmqpError> {
        let connection = self.context.connection(bus_name)?;

        connection.reconnect().await?;
        self.start_entities(|bus| bus == bus_name).await?;

        info!(bus = bus_name, "bus reconnected");
        Ok(())
    }

    /// Spawns one task per bus reconnecting it whenever its connection fails.
    pub fn watch_connections(self: &Arc<Self>) {
        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);

        for bus_name in self.context.connections().bus_names() {
            let Ok(connection) = self.context.connection(&bus_name) else {
                continue;
            };
            let module = Arc::downgrade(self);

            watchers.push(tokio::spawn(async move {
                loop {
                    connection.connection_lost().await;

                    let Some(module) = module.upgrade() else {
                        return;
                    };
                    warn!(bus = bus_name.as_str(), "connection lost, reconnecting");

                    loop {
                        if module.is_disposed() {
                            return;
                        }
                        match module.reconnect(&bus_name).await {
                            Ok(()) => break,
                            Err(err) => {
                                error!(error = err.to_string(), bus = bus_name.as_str(), "failure to reconnect");
                                tokio::time::sleep(RECONNECT_DELAY).await;
                            }
                        }
                    }
                }
            }));
        }

        debug!(buses = watchers.len(), "watching bus connections");
    }

    /// Stops the watchers, consumers and RPC clients. Only the first call has effect.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let watchers: Vec<_> = self
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for watcher in watchers {
            watcher.abort();
        }

        for disposer in self.entities.iter().filter_map(BusEntity::disposer) {
            disposer.on_dispose().await;
        }

        for client in self.rpc_clients.values() {
            client.dispose().await;
        }

        info!("bus module disposed");
    }
}
