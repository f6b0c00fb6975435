//! Message types and core domain identifiers.

use crate::error::ValidationError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated topic name with length and character restrictions
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicName(String);

impl TopicName {
    /// Create new topic name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.is_empty() || name.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "topic".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        // Topic names end up inside Redis key patterns, so glob characters
        // and whitespace are rejected along with everything else.
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ValidationError::InvalidFormat {
                field: "topic".to_string(),
                message: "only ASCII alphanumeric, hyphens, underscores, and dots allowed"
                    .to_string(),
            });
        }

        if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
            return Err(ValidationError::InvalidFormat {
                field: "topic".to_string(),
                message: "no leading/trailing hyphens or consecutive hyphens".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get topic name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TopicName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TopicName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message exchanged with a broker: an opaque payload plus string attributes.
///
/// The attribute schema belongs to the caller; the runtime only ever reads the
/// attribute named as the deduplication key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    data: Bytes,
    attributes: HashMap<String, String>,
}

impl Message {
    /// Create new message from payload and attributes
    pub fn new(data: impl Into<Bytes>, attributes: HashMap<String, String>) -> Self {
        Self {
            data: data.into(),
            attributes,
        }
    }

    /// Add message attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Message payload
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// All message attributes
    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    /// Look up a single attribute
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Split the message into its payload and attributes
    pub fn into_parts(self) -> (Bytes, HashMap<String, String>) {
        (self.data, self.attributes)
    }
}

/// Record of a message accepted by a capturing publisher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedMessage {
    pub data: Bytes,
    pub attributes: HashMap<String, String>,
}

impl From<Message> for CapturedMessage {
    fn from(message: Message) -> Self {
        let (data, attributes) = message.into_parts();
        Self { data, attributes }
    }
}

/// Opaque backend token used to acknowledge or abandon a delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt(String);

impl Receipt {
    /// Create new receipt
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Get receipt handle string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message received from a backend together with its receipt
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub receipt: Receipt,
    /// How many times this message has been handed to a consumer, this
    /// delivery included. Backends that do not track it report 1.
    pub delivery_count: u32,
}

impl Delivery {
    /// Check if this is a redelivery of a previously unacknowledged message
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
