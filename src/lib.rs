// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bus Entities
//!
//! Declarative broker entities (exchanges, work queues, subscriptions, RPC
//! queues) with their lifecycle, message dispatch and an RPC client correlating
//! replies with pending requests.

mod consumer;
mod otel;
mod publisher;

pub mod amqp;
pub mod channel;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod logger;
pub mod memory;
pub mod message;
pub mod module;
pub mod queue;
pub mod rpc;
pub mod serialization;
pub mod settings;
pub mod strategies;
pub mod topology;

pub use context::EntityContext;
pub use message::{BusMessage, Message, RpcCommand};
pub use module::BusModule;
pub use topology::BusTopology;
