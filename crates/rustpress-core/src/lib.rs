//! # RustPress Core
//!
//! Shared configuration and error types for the RustPress event bus.
//! This crate has no dependency on any particular transport or state
//! store; it defines the vocabulary the rest of the workspace builds on.

pub mod config;
pub mod error;

pub use config::{BusConfig, ConsumerConfig, DispatcherConfig, FailurePolicy, ProducerConfig,
    RetryPolicyKind, StateStoreConfig};
pub use error::{Error, Result};

/// The current version of the event bus crate family.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
