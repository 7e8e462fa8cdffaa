//! Messages, destinations and execution context.
//!
//! This module provides the value types that flow between transports, the
//! runtimes and connector sinks.

use crate::pool::{PropertyValue, ResourceKey};
use crate::{ConnectorError, ConnectorResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// A message moving through a transport
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// Destination the message was received from or is addressed to
    pub destination: Option<String>,
    /// The message payload
    pub payload: Vec<u8>,
    /// Message attributes/headers
    pub attributes: HashMap<String, String>,
    /// Transport-assigned delivery tag, used for acknowledgement
    pub delivery_tag: u64,
    /// Number of times the transport has delivered this message before
    pub redelivery_count: u32,
}

impl Message {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    pub fn from_string(payload: impl Into<String>) -> Self {
        Self::new(payload.into().into_bytes())
    }

    pub fn from_json<T: Serialize>(data: &T) -> ConnectorResult<Self> {
        let payload =
            serde_json::to_vec(data).map_err(|e| ConnectorError::Serialization(e.to_string()))?;
        Ok(Self::new(payload))
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Get the payload size in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn is_redelivery(&self) -> bool {
        self.redelivery_count > 0
    }

    pub fn get_attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|s| s.as_str())
    }

    /// Get the payload as a UTF-8 string (if valid)
    pub fn payload_str(&self) -> ConnectorResult<&str> {
        std::str::from_utf8(&self.payload).map_err(|e| ConnectorError::InvalidData {
            message: format!("Payload is not valid UTF-8: {}", e),
            payload: self.payload.clone(),
        })
    }

    /// Deserialize the payload as JSON
    pub fn payload_json<T: DeserializeOwned>(&self) -> ConnectorResult<T> {
        serde_json::from_slice(&self.payload).map_err(|e| ConnectorError::InvalidData {
            message: format!("Failed to deserialize JSON: {}", e),
            payload: self.payload.clone(),
        })
    }
}

/// Point-to-point or broadcast delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    Queue,
    Topic,
}

/// A resolved destination name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub kind: DestinationKind,
    pub name: String,
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Queue,
            name: name.into(),
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Topic,
            name: name.into(),
        }
    }

    pub fn is_topic(&self) -> bool {
        self.kind == DestinationKind::Topic
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DestinationKind::Queue => write!(f, "queue://{}", self.name),
            DestinationKind::Topic => write!(f, "topic://{}", self.name),
        }
    }
}

/// How the destination of an operation is determined
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationSpec {
    /// A fixed destination
    Static(Destination),
    /// Named by a property of the execution context
    Dynamic {
        kind: DestinationKind,
        property: String,
    },
}

impl DestinationSpec {
    pub fn resolve(&self, context: &ExecutionContext) -> ConnectorResult<Destination> {
        let destination = match self {
            Self::Static(destination) => destination.clone(),
            Self::Dynamic { kind, property } => {
                let name = context.property(property).ok_or_else(|| {
                    ConnectorError::config(format!(
                        "destination property '{}' is missing from the execution context",
                        property
                    ))
                })?;
                Destination {
                    kind: *kind,
                    name: name.to_string(),
                }
            }
        };

        validate_destination_name(&destination.name)?;
        Ok(destination)
    }
}

fn validate_destination_name(name: &str) -> ConnectorResult<()> {
    if name.trim().is_empty() {
        return Err(ConnectorError::config("destination name cannot be empty"));
    }
    if name.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(ConnectorError::config(format!(
            "malformed destination name '{}'",
            name.escape_debug()
        )));
    }
    Ok(())
}

/// Identity and properties of one logical execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    execution_id: String,
    properties: BTreeMap<String, String>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// A context with a fresh random execution id
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_id(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|s| s.as_str())
    }

    /// Derive the key for pooled connections used by this context
    pub fn resource_key(&self, connection_id: &str) -> ResourceKey {
        ResourceKey::with_properties(
            connection_id,
            self.properties
                .iter()
                .map(|(k, v)| (k.clone(), PropertyValue::from(v.as_str()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_builder() {
        let message = Message::from_string("hello")
            .with_attribute("source", "test")
            .with_destination("orders");

        assert_eq!(message.size(), 5);
        assert_eq!(message.payload_str().unwrap(), "hello");
        assert_eq!(message.get_attribute("source"), Some("test"));
        assert_eq!(message.destination.as_deref(), Some("orders"));
        assert!(!message.is_redelivery());
    }

    #[test]
    fn test_message_json() {
        #[derive(Serialize, Deserialize, Debug, PartialEq)]
        struct Order {
            id: u32,
        }

        let message = Message::from_json(&Order { id: 7 }).unwrap();
        let decoded: Order = message.payload_json().unwrap();
        assert_eq!(decoded, Order { id: 7 });

        let bad = Message::new(vec![0xff, 0xfe]);
        assert!(bad.payload_str().unwrap_err().is_invalid_data());
    }

    #[test]
    fn test_dynamic_destination() {
        let context = ExecutionContext::with_id("exec-1").with_property("queue", "orders.in");
        let spec = DestinationSpec::Dynamic {
            kind: DestinationKind::Queue,
            property: "queue".into(),
        };

        let destination = spec.resolve(&context).unwrap();
        assert_eq!(destination, Destination::queue("orders.in"));
        assert_eq!(destination.to_string(), "queue://orders.in");
    }

    #[test]
    fn test_destination_errors_are_fatal_config() {
        let context = ExecutionContext::with_id("exec-1").with_property("queue", "bad name");
        let missing = DestinationSpec::Dynamic {
            kind: DestinationKind::Topic,
            property: "topic".into(),
        };
        let malformed = DestinationSpec::Dynamic {
            kind: DestinationKind::Queue,
            property: "queue".into(),
        };

        for spec in [missing, malformed, DestinationSpec::Static(Destination::topic(""))] {
            let err = spec.resolve(&context).unwrap_err();
            assert!(matches!(err, ConnectorError::Config(_)));
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_context_resource_key() {
        let a = ExecutionContext::with_id("a").with_property("host", "broker");
        let b = ExecutionContext::with_id("b").with_property("host", "broker");
        assert_eq!(a.resource_key("jms"), b.resource_key("jms"));
        assert_ne!(a.resource_key("jms"), a.resource_key("http"));
        assert_eq!(ExecutionContext::new().execution_id().len(), 36);
    }
}
