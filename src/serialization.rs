// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Serialization Manager
//!
//! Maps a content type to the serializer that turns a message body into bytes
//! and back. Bodies are carried as `serde_json::Value` so every serializer works
//! on the same neutral representation.

use crate::errors::SerializationError;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type for plain UTF-8 text bodies
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

pub trait Serializer: Send + Sync {
    fn content_type(&self) -> &str;

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, SerializationError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, SerializationError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(value).map_err(|e| SerializationError::Serialize(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::Deserialize(e.to_string()))
    }
}

/// Text bodies map to `Value::String`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextSerializer;

impl Serializer for TextSerializer {
    fn content_type(&self) -> &str {
        TEXT_CONTENT_TYPE
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, SerializationError> {
        match value {
            Value::String(text) => Ok(text.as_bytes().to_vec()),
            other => Ok(other.to_string().into_bytes()),
        }
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, SerializationError> {
        std::str::from_utf8(bytes)
            .map(|text| Value::String(text.to_owned()))
            .map_err(|e| SerializationError::Deserialize(e.to_string()))
    }
}

pub struct SerializationManager {
    serializers: HashMap<String, Arc<dyn Serializer>>,
    default_content_type: String,
}

impl Default for SerializationManager {
    fn default() -> Self {
        SerializationManager::new()
            .add(Arc::new(JsonSerializer))
            .add(Arc::new(TextSerializer))
    }
}

impl SerializationManager {
    /// Creates an empty manager defaulting to JSON.
    pub fn new() -> SerializationManager {
        SerializationManager {
            serializers: HashMap::default(),
            default_content_type: JSON_CONTENT_TYPE.to_owned(),
        }
    }

    /// Registers a serializer, replacing any other for the same content type.
    pub fn add(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializers
            .insert(normalize(serializer.content_type()), serializer);
        self
    }

    pub fn default_content_type(mut self, content_type: &str) -> Self {
        self.default_content_type = normalize(content_type);
        self
    }

    pub fn get_default_content_type(&self) -> &str {
        &self.default_content_type
    }

    pub fn has(&self, content_type: &str) -> bool {
        self.serializers.contains_key(&normalize(content_type))
    }

    pub fn get(&self, content_type: &str) -> Result<Arc<dyn Serializer>, SerializationError> {
        self.serializers
            .get(&normalize(content_type))
            .cloned()
            .ok_or_else(|| SerializationError::UnsupportedContentType(content_type.to_owned()))
    }

    pub fn serialize(&self, content_type: &str, value: &Value) -> Result<Vec<u8>, SerializationError> {
        self.get(content_type)?.serialize(value)
    }

    pub fn deserialize(&self, content_type: &str, bytes: &[u8]) -> Result<Value, SerializationError> {
        self.get(content_type)?.deserialize(bytes)
    }
}

/// `Application/JSON; charset=utf-8` and `application/json` select the same serializer.
fn normalize(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
