//! Error types for messaging operations.

use thiserror::Error;

/// Comprehensive error type for publish, consume and cache operations
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),

    #[error("Transport error ({backend}): {message}")]
    Transport { backend: String, message: String },

    #[error("Cache error ({backend}): {message}")]
    Cache { backend: String, message: String },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl MessagingError {
    /// Build a transport error for the named backend
    pub fn transport(backend: &str, message: impl Into<String>) -> Self {
        Self::Transport {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    /// Build a cache error for the named backend
    pub fn cache(backend: &str, message: impl Into<String>) -> Self {
        Self::Cache {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    /// Check if error is transient and the operation may succeed when retried.
    ///
    /// Retrying is always the caller's decision; nothing in this crate retries
    /// on its own.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Usage(_) => false,
            Self::Transport { .. } => true,
            Self::Cache { .. } => true,
            Self::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            Self::Serialization(_) => false,
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
        }
    }

    /// Check if error indicates a programming mistake by the caller
    pub fn is_usage_error(&self) -> bool {
        matches!(self, Self::Usage(_))
    }
}

/// Programmer errors: the API was used outside its contract
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("Publisher must be entered before publishing")]
    PublisherNotEntered,

    #[error("Publisher is already entered")]
    PublisherAlreadyEntered,

    #[error("Publisher has been exited; enter it again before publishing")]
    PublisherClosed,

    #[error("Message is missing deduplication attribute '{attribute}'")]
    MissingDeduplicationAttribute { attribute: String },
}

/// Errors raised out of [`Consumer::run`](crate::consumer::Consumer::run)
///
/// A stop request from the handler is not an error and never appears here.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The handler failed. The original error is preserved and can be
    /// recovered with `downcast_ref`.
    #[error("Message handler failed: {0}")]
    Handler(anyhow::Error),

    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

impl ConsumerError {
    /// Borrow the handler's error if this run ended because of a handler fault
    pub fn handler_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Handler(e) => Some(e),
            Self::Messaging(_) => None,
        }
    }
}

/// Errors during message encoding/decoding at the transport boundary
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Stream entry '{entry_id}' is missing field '{field}'")]
    MissingField { entry_id: String, field: String },
}

/// Configuration errors; raised at startup while resolving backends
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Unknown broker backend '{name}' (registered: {registered})")]
    UnknownBroker { name: String, registered: String },

    #[error("Unknown cache backend '{name}' (registered: {registered})")]
    UnknownCache { name: String, registered: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
