// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request/Reply over the Bus
//!
//! The client side of RPC correlates replies with in-flight requests through a
//! private reply queue and the correlation id; the server side is the
//! [`RpcQueueStrategy`](crate::strategies::RpcQueueStrategy) consuming the
//! request queue.
//!
//! Every request resolves exactly once: with the reply body, a remote
//! exception, a timeout or a cancellation. Replies nobody waits for anymore
//! are logged and discarded.

mod client;
mod meta;
mod pending;

pub use client::RpcClient;
pub use meta::{RemoteError, RpcClientMeta, RpcQueueMeta};

/// Prefix of the private reply queue of every RPC client
pub const RPC_REPLY_QUEUE_PREFIX: &str = "rpc_reply_";
