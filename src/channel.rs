// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! Establishes the AMQP connection of a bus and opens its channel. Connecting
//! is retried `retry_count` times with a fixed delay before giving up.

use crate::{errors::AmqpError, settings::BrokerSettings};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, warn};

fn connection_properties(settings: &BrokerSettings) -> ConnectionProperties {
    let name = settings
        .connection_name
        .clone()
        .unwrap_or_else(|| settings.bus_name.clone());

    ConnectionProperties::default().with_connection_name(LongString::from(name))
}

/// Connects to the broker described by `settings` and creates a channel on that connection.
pub async fn new_amqp_channel(
    settings: &BrokerSettings,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!(bus = settings.bus_name.as_str(), "creating amqp connection...");

    let uri = settings.uri();
    let mut attempt = 0;

    let conn = loop {
        attempt += 1;

        match Connection::connect(&uri, connection_properties(settings)).await {
            Ok(c) => break c,
            Err(err) if attempt <= settings.retry_count => {
                warn!(
                    error = err.to_string(),
                    bus = settings.bus_name.as_str(),
                    attempt,
                    "failure to connect, retrying"
                );
                tokio::time::sleep(Duration::from_millis(settings.retry_delay_ms)).await;
            }
            Err(err) => {
                error!(error = err.to_string(), bus = settings.bus_name.as_str(), "failure to connect");
                return Err(AmqpError::ConnectionError(settings.bus_name.clone()));
            }
        }
    };
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}
