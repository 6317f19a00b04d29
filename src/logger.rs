// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Logger
//!
//! Audit trail of publish, receive and error events. The bus only produces
//! [`MessageLog`] entries; where they go is up to the [`MessageLogger`]
//! implementation. [`TracingMessageLogger`] forwards them to `tracing`.

use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLogKind {
    Published,
    Received,
    Replied,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLog {
    pub kind: MessageLogKind,
    pub level: LogLevel,
    pub bus_name: String,
    pub entity_name: String,
    pub message_type: String,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub details: String,
    pub errors: Vec<String>,
}

impl MessageLog {
    pub fn new(kind: MessageLogKind, bus_name: &str, entity_name: &str, details: &str) -> Self {
        let level = match kind {
            MessageLogKind::Error => LogLevel::Error,
            _ => LogLevel::Debug,
        };

        MessageLog {
            kind,
            level,
            bus_name: bus_name.to_owned(),
            entity_name: entity_name.to_owned(),
            message_type: String::default(),
            correlation_id: None,
            message_id: None,
            details: details.to_owned(),
            errors: vec![],
        }
    }

    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn message_type(mut self, message_type: &str) -> Self {
        self.message_type = message_type.to_owned();
        self
    }

    pub fn correlation_id(mut self, id: Option<&str>) -> Self {
        self.correlation_id = id.map(str::to_owned);
        self
    }

    pub fn message_id(mut self, id: Option<&str>) -> Self {
        self.message_id = id.map(str::to_owned);
        self
    }

    pub fn error(mut self, err: &dyn std::error::Error) -> Self {
        self.errors.push(err.to_string());
        self.level = LogLevel::Error;
        self
    }
}

#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
pub trait MessageLogger: Send + Sync {
    fn log(&self, log: &MessageLog);
}

/// Emits one structured `tracing` event per log entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMessageLogger;

impl MessageLogger for TracingMessageLogger {
    fn log(&self, log: &MessageLog) {
        let kind = format!("{:?}", log.kind);
        let correlation_id = log.correlation_id.as_deref().unwrap_or_default();
        let message_id = log.message_id.as_deref().unwrap_or_default();
        let errors = log.errors.join("; ");

        match log.level {
            LogLevel::Debug => debug!(
                kind = kind.as_str(),
                bus = log.bus_name.as_str(),
                entity = log.entity_name.as_str(),
                message_type = log.message_type.as_str(),
                correlation_id,
                message_id,
                "{}",
                log.details
            ),
            LogLevel::Info => info!(
                kind = kind.as_str(),
                bus = log.bus_name.as_str(),
                entity = log.entity_name.as_str(),
                message_type = log.message_type.as_str(),
                correlation_id,
                message_id,
                "{}",
                log.details
            ),
            LogLevel::Warn => warn!(
                kind = kind.as_str(),
                bus = log.bus_name.as_str(),
                entity = log.entity_name.as_str(),
                message_type = log.message_type.as_str(),
                correlation_id,
                message_id,
                errors = errors.as_str(),
                "{}",
                log.details
            ),
            LogLevel::Error => error!(
                kind = kind.as_str(),
                bus = log.bus_name.as_str(),
                entity = log.entity_name.as_str(),
                message_type = log.message_type.as_str(),
                correlation_id,
                message_id,
                errors = errors.as_str(),
                "{}",
                log.details
            ),
        }
    }
}
