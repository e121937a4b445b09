//! Configuration system for the RustPress event bus using config-rs.
//!
//! Layers, in increasing priority: compiled-in defaults, an optional
//! `bus.toml` (path overridable via `BUS_CONFIG_FILE`), then environment
//! variables prefixed `BUS_` with `__` as the nesting separator, e.g.
//! `BUS_DISPATCHER__CONCURRENCY_LIMIT=8`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Upper bound, in seconds, on any handler timeout: the configured
/// dispatcher default (`DispatcherConfig::validate`) and any per-handler
/// override (`rustpress_dispatch::router::EventRouter::route`).
pub const MAX_HANDLER_TIMEOUT_SECONDS: u64 = 30;

/// Root configuration for a bus process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub dispatcher: DispatcherConfig,
    pub state_store: StateStoreConfig,
    #[serde(default)]
    pub consumers: HashMap<String, ConsumerConfig>,
    #[serde(default)]
    pub producer: Option<ProducerConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            state_store: StateStoreConfig::default(),
            consumers: HashMap::new(),
            producer: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl BusConfig {
    /// Load configuration from compiled-in defaults, an optional file, and
    /// environment variables, in that order of increasing priority.
    pub fn load() -> Result<Self> {
        let defaults = BusConfig::default();
        let defaults_value = config::Config::try_from(&defaults)
            .map_err(|e| Error::Configuration { message: e.to_string() })?;

        let file_path =
            std::env::var("BUS_CONFIG_FILE").unwrap_or_else(|_| "bus.toml".to_string());

        let builder = config::Config::builder()
            .add_source(defaults_value)
            .add_source(config::File::with_name(&file_path).required(false))
            .add_source(
                config::Environment::with_prefix("BUS")
                    .separator("__")
                    .try_parsing(true),
            );

        let built = builder
            .build()
            .map_err(|e| Error::Configuration { message: e.to_string() })?;

        built
            .try_deserialize()
            .map_err(|e| Error::Configuration { message: e.to_string() })
    }
}

/// Dispatcher-wide defaults, overridable per [`crate`]'s `HandlerSpec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DispatcherConfig {
    /// Maximum handlers running concurrently for a single message.
    pub concurrency_limit: usize,
    pub default_timeout_seconds: u64,
    pub default_failure_policy: FailurePolicy,
    pub default_retry_policy: RetryPolicyKind,
    /// Whether a redelivered message skips handlers already `SUCCEEDED`
    /// in the state store (see open question on redelivery behavior).
    pub resume_from_state_store: bool,
    pub visibility_extension_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 8,
            default_timeout_seconds: 30,
            default_failure_policy: FailurePolicy::Abort,
            default_retry_policy: RetryPolicyKind::ExponentialBackoff,
            resume_from_state_store: false,
            visibility_extension_secs: 30,
        }
    }
}

impl DispatcherConfig {
    /// Rejects a `default_timeout_seconds` outside `[0, MAX_HANDLER_TIMEOUT_SECONDS]`.
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_seconds > MAX_HANDLER_TIMEOUT_SECONDS {
            return Err(Error::Configuration {
                message: format!(
                    "default_timeout_seconds ({}) exceeds the maximum of {}",
                    self.default_timeout_seconds, MAX_HANDLER_TIMEOUT_SECONDS
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    Abort,
    Continue,
    Compensate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicyKind {
    NoRetry,
    ExponentialBackoff,
}

/// State store backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StateStoreConfig {
    InMemory,
    Redis {
        url: String,
        #[serde(default = "default_state_ttl")]
        ttl_seconds: u64,
    },
}

fn default_state_ttl() -> u64 {
    86_400
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        StateStoreConfig::InMemory
    }
}

/// Tagged consumer configuration; `type` selects the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsumerConfig {
    /// A generic pull/long-poll queue transport (SQS-like semantics).
    Queue {
        queue_url: String,
        #[serde(default)]
        dlq_uri: Option<String>,
        #[serde(default = "default_visibility_timeout")]
        visibility_timeout: u64,
        #[serde(default = "default_wait_time")]
        wait_time: u64,
        #[serde(default = "default_max_messages")]
        max_messages: u32,
        #[serde(default = "default_poll_interval")]
        poll_interval: u64,
        #[serde(default = "default_concurrency")]
        concurrency: usize,
        #[serde(default = "default_max_retries")]
        max_retries: u32,
    },
    Redis {
        url: String,
        #[serde(default)]
        dlq_uri: Option<String>,
        #[serde(default = "default_visibility_timeout")]
        visibility_timeout: u64,
        #[serde(default = "default_wait_time")]
        wait_time: u64,
        #[serde(default = "default_max_messages")]
        max_messages: u32,
        #[serde(default = "default_poll_interval")]
        poll_interval: u64,
        #[serde(default = "default_concurrency")]
        concurrency: usize,
        #[serde(default = "default_max_retries")]
        max_retries: u32,
    },
    Webhook {
        endpoint: String,
    },
    #[serde(rename = "websocket")]
    WebSocket {
        endpoint: String,
        channel: String,
    },
}

fn default_visibility_timeout() -> u64 {
    30
}
fn default_wait_time() -> u64 {
    10
}
fn default_max_messages() -> u32 {
    10
}
fn default_poll_interval() -> u64 {
    1
}
fn default_concurrency() -> usize {
    8
}
fn default_max_retries() -> u32 {
    5
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<()> {
        if let ConsumerConfig::Queue {
            visibility_timeout,
            wait_time,
            ..
        }
        | ConsumerConfig::Redis {
            visibility_timeout,
            wait_time,
            ..
        } = self
        {
            if wait_time >= visibility_timeout {
                return Err(Error::Configuration {
                    message: format!(
                        "wait_time ({wait_time}) must be less than visibility_timeout ({visibility_timeout})"
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn visibility_timeout(&self) -> Option<Duration> {
        match self {
            ConsumerConfig::Queue {
                visibility_timeout, ..
            }
            | ConsumerConfig::Redis {
                visibility_timeout, ..
            } => Some(Duration::from_secs(*visibility_timeout)),
            _ => None,
        }
    }
}

/// Tagged producer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProducerConfig {
    Redis { url: String },
    Http { endpoint: String },
}

/// Logging configuration, mirrored on the other long-running services in
/// this codebase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BusConfig::default();
        assert_eq!(config.dispatcher.concurrency_limit, 8);
        assert!(matches!(config.state_store, StateStoreConfig::InMemory));
    }

    #[test]
    fn test_dispatcher_config_rejects_timeout_above_max() {
        let config = DispatcherConfig {
            default_timeout_seconds: 600,
            ..DispatcherConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dispatcher_config_accepts_default() {
        assert!(DispatcherConfig::default().validate().is_ok());
    }

    #[test]
    fn test_consumer_validation_rejects_wait_ge_visibility() {
        let consumer = ConsumerConfig::Queue {
            queue_url: "https://queue.example/q".into(),
            dlq_uri: None,
            visibility_timeout: 10,
            wait_time: 10,
            max_messages: 10,
            poll_interval: 1,
            concurrency: 8,
            max_retries: 5,
        };
        assert!(consumer.validate().is_err());
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = BusConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: BusConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(
            config.dispatcher.concurrency_limit,
            deserialized.dispatcher.concurrency_limit
        );
    }
}
