//! Runtime configuration.
//!
//! Settings are layered with the `config` crate. Sources, later overriding
//! earlier:
//!
//! 1. `config/messaging.{yaml,toml,json}` in the working directory (optional)
//! 2. An explicit file passed by the caller (required when given)
//! 3. Environment variables prefixed `MESSAGING__`, double-underscore
//!    separated, e.g. `MESSAGING__REDIS__HOST=redis.internal`
//!
//! Every field has a default, so an unconfigured environment yields the
//! in-memory backends.

use crate::cache::DEFAULT_DEDUPLICATION_WINDOW;
use crate::error::ConfigurationError;
use crate::registry::BackendName;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(test)]
#[path = "settings_tests.rs"]
mod tests;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "MESSAGING";

/// Top-level messaging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingSettings {
    /// Broker backend name
    pub broker: String,

    /// Dedup cache backend name
    pub cache: String,

    /// How long a fingerprint counts as recently seen
    pub deduplication_window_seconds: u64,

    /// In-memory backend settings
    pub memory: MemorySettings,

    /// Redis backend settings
    pub redis: RedisSettings,
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            broker: "memory".to_string(),
            cache: "memory".to_string(),
            deduplication_window_seconds: DEFAULT_DEDUPLICATION_WINDOW.as_secs(),
            memory: MemorySettings::default(),
            redis: RedisSettings::default(),
        }
    }
}

impl MessagingSettings {
    /// Load settings from the standard sources plus an optional explicit file
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/messaging").required(false));

        if let Some(path) = explicit_path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings: Self = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings that would produce an unbounded or useless runtime
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        BackendName::new(self.broker.as_str())
            .map_err(|e| invalid(&format!("broker: {}", e)))?;
        BackendName::new(self.cache.as_str()).map_err(|e| invalid(&format!("cache: {}", e)))?;
        if self.deduplication_window_seconds == 0 {
            return Err(invalid("deduplication_window_seconds must be greater than 0"));
        }
        if self.memory.max_topic_length == 0 {
            return Err(invalid("memory.max_topic_length must be greater than 0"));
        }
        if self.memory.redelivery_timeout_seconds == 0 {
            return Err(invalid("memory.redelivery_timeout_seconds must be greater than 0"));
        }
        if self.redis.url.is_none() && self.redis.host.trim().is_empty() {
            return Err(invalid("redis.host must not be empty"));
        }
        Ok(())
    }

    /// Retention window for dedup fingerprints
    pub fn deduplication_window(&self) -> Duration {
        Duration::from_secs(self.deduplication_window_seconds)
    }
}

fn invalid(message: &str) -> ConfigurationError {
    ConfigurationError::Invalid {
        message: message.to_string(),
    }
}

/// In-memory broker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    /// Messages retained per topic; the oldest are trimmed beyond this
    pub max_topic_length: usize,

    /// Lease on a delivered message; unacknowledged messages are redelivered
    /// once it lapses
    pub redelivery_timeout_seconds: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            max_topic_length: 10_000,
            redelivery_timeout_seconds: 30,
        }
    }
}

impl MemorySettings {
    /// Lease duration as a `Duration`
    pub fn redelivery_timeout(&self) -> Duration {
        Duration::from_secs(self.redelivery_timeout_seconds)
    }
}

/// Redis connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    /// Full connection URL; takes precedence over the individual fields
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub db: u32,
    pub username: String,
    pub password: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            username: "default".to_string(),
            password: String::new(),
        }
    }
}

impl RedisSettings {
    /// Connection URL for `redis::Client::open`
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        if self.password.is_empty() && (self.username.is_empty() || self.username == "default") {
            return format!("redis://{}:{}/{}", self.host, self.port, self.db);
        }

        format!(
            "redis://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            self.db
        )
    }
}
