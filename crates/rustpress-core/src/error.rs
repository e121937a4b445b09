//! Unified error types for the RustPress event bus using thiserror.
//!
//! Provides consistent error handling across consumers, the dispatcher,
//! the handler router, and the state store.

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// The unified error type for event bus operations.
#[derive(Error, Debug)]
pub enum Error {
    // Registration / graph errors
    #[error("duplicate handler name: {name} already registered for event type {event_type}")]
    DuplicateHandlerName { event_type: String, name: String },

    #[error("unknown dependency: {handler} depends on {dependency}, which is not registered for {event_type}")]
    UnknownDependency {
        event_type: String,
        handler: String,
        dependency: String,
    },

    #[error("cycle detected in handler graph for {event_type}: {cycle}")]
    CycleDetected { event_type: String, cycle: String },

    // Dispatch / processing errors
    #[error("handler {handler} failed: {message}")]
    HandlerFailed {
        handler: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("handler {handler} timed out after {timeout_secs}s")]
    HandlerTimeout { handler: String, timeout_secs: u64 },

    #[error("retries exhausted for handler {handler} after {attempts} attempts")]
    RetryExhausted { handler: String, attempts: u32 },

    #[error("dispatch error for message {message_id}: {message}")]
    DispatchFailed { message_id: String, message: String },

    #[error("critical subscriber error: {message}")]
    CriticalSubscriber { message: String },

    // State store errors
    #[error("state store error: {message}")]
    StateStore {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // Consumer / transport errors
    #[error("consumer is not running")]
    ConsumerNotRunning,

    #[error("consumer is already running")]
    ConsumerAlreadyRunning,

    #[error("consumer failed to start: {message}")]
    ConsumerStartFailed { message: String },

    #[error("consumer failed to stop: {message}")]
    ConsumerStopFailed { message: String },

    #[error("operation not implemented for this transport: {operation}")]
    NotImplemented { operation: String },

    #[error("not subscribed to event type {event_type}")]
    NotSubscribed { event_type: String },

    #[error("ack failed for message {message_id}: {message}")]
    AckFailed { message_id: String, message: String },

    #[error("nack failed for message {message_id}: {message}")]
    NackFailed { message_id: String, message: String },

    #[error("failed to deserialize message body: {message}")]
    Deserialization { message: String },

    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // Producer errors
    #[error("publish failed: {message}")]
    PublishFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // Validation
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("invalid input: {field} - {message}")]
    InvalidInput { field: String, message: String },

    // Configuration errors
    #[error("configuration error: {message}")]
    Configuration { message: String },

    // Serialization
    #[error("serialization error: {message}")]
    Serialization { message: String },

    // Internal errors
    #[error("internal error: {message}")]
    Internal {
        message: String,
        request_id: Option<Uuid>,
    },

    #[error("shutdown in progress")]
    ShutdownInProgress,

    // Generic wrapped error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Validation errors container.
#[derive(Debug, Clone)]
pub struct ValidationErrors {
    pub errors: Vec<ValidationError>,
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

impl ValidationErrors {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
            code: None,
        });
    }

    pub fn add_with_code(
        &mut self,
        field: impl Into<String>,
        message: impl Into<String>,
        code: impl Into<String>,
    ) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
            code: Some(code.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result<T>(self, value: T) -> Result<T> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl Default for ValidationErrors {
    fn default() -> Self {
        Self::new()
    }
}

/// A single validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub code: Option<String>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Error context for enhanced debugging, attachable via [`ErrorExt`].
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub request_id: Option<Uuid>,
    pub message_id: Option<String>,
    pub handler: Option<String>,
    pub operation: String,
    pub metadata: std::collections::HashMap<String, String>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            request_id: None,
            message_id: None,
            handler: None,
            operation: operation.into(),
            metadata: std::collections::HashMap::new(),
        }
    }

    pub fn with_request_id(mut self, id: Uuid) -> Self {
        self.request_id = Some(id);
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Extension trait for adding context to errors.
pub trait ErrorExt {
    fn with_context(self, ctx: ErrorContext) -> Error;
}

impl Error {
    pub fn duplicate_handler_name(event_type: impl Into<String>, name: impl Into<String>) -> Self {
        Error::DuplicateHandlerName {
            event_type: event_type.into(),
            name: name.into(),
        }
    }

    pub fn unknown_dependency(
        event_type: impl Into<String>,
        handler: impl Into<String>,
        dependency: impl Into<String>,
    ) -> Self {
        Error::UnknownDependency {
            event_type: event_type.into(),
            handler: handler.into(),
            dependency: dependency.into(),
        }
    }

    pub fn cycle_detected(event_type: impl Into<String>, cycle: impl Into<String>) -> Self {
        Error::CycleDetected {
            event_type: event_type.into(),
            cycle: cycle.into(),
        }
    }

    pub fn handler_failed(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Error::HandlerFailed {
            handler: handler.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn handler_failed_with_source(
        handler: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::HandlerFailed {
            handler: handler.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn state_store(message: impl Into<String>) -> Self {
        Error::StateStore {
            message: message.into(),
            source: None,
        }
    }

    pub fn state_store_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::StateStore {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
            request_id: None,
        }
    }

    pub fn internal_with_request_id(message: impl Into<String>, request_id: Uuid) -> Self {
        Error::Internal {
            message: message.into(),
            request_id: Some(request_id),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        let msg = message.into();
        let mut errors = ValidationErrors::new();
        errors.add("validation", &msg);
        Error::Validation(errors)
    }

    pub fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether an attempt that failed with this error should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StateStore { .. }
                | Error::Transport { .. }
                | Error::HandlerTimeout { .. }
                | Error::HandlerFailed { .. }
        )
    }

    /// HTTP status code for this error, used by the push transport.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotSubscribed { .. } => 404,
            Error::Validation(_) | Error::InvalidInput { .. } | Error::Deserialization { .. } => {
                400
            }
            Error::DuplicateHandlerName { .. } | Error::CycleDetected { .. } => 409,
            Error::ShutdownInProgress | Error::ConsumerNotRunning => 503,
            _ => 500,
        }
    }

    /// Stable error code for API responses and metrics labels.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::DuplicateHandlerName { .. } => "DUPLICATE_HANDLER_NAME",
            Error::UnknownDependency { .. } => "UNKNOWN_DEPENDENCY",
            Error::CycleDetected { .. } => "CYCLE_DETECTED",
            Error::HandlerFailed { .. } => "HANDLER_FAILED",
            Error::HandlerTimeout { .. } => "HANDLER_TIMEOUT",
            Error::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Error::DispatchFailed { .. } => "DISPATCH_FAILED",
            Error::CriticalSubscriber { .. } => "CRITICAL_SUBSCRIBER",
            Error::StateStore { .. } => "STATE_STORE_ERROR",
            Error::ConsumerNotRunning => "CONSUMER_NOT_RUNNING",
            Error::ConsumerAlreadyRunning => "CONSUMER_ALREADY_RUNNING",
            Error::ConsumerStartFailed { .. } => "CONSUMER_START_FAILED",
            Error::ConsumerStopFailed { .. } => "CONSUMER_STOP_FAILED",
            Error::NotImplemented { .. } => "NOT_IMPLEMENTED",
            Error::NotSubscribed { .. } => "NOT_SUBSCRIBED",
            Error::AckFailed { .. } => "ACK_FAILED",
            Error::NackFailed { .. } => "NACK_FAILED",
            Error::Deserialization { .. } => "DESERIALIZATION_ERROR",
            Error::Transport { .. } => "TRANSPORT_ERROR",
            Error::PublishFailed { .. } => "PUBLISH_FAILED",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::InvalidInput { .. } => "INVALID_INPUT",
            Error::Configuration { .. } => "CONFIG_ERROR",
            Error::Serialization { .. } => "SERIALIZATION_ERROR",
            Error::Internal { .. } => "INTERNAL_ERROR",
            Error::ShutdownInProgress => "SHUTDOWN",
            Error::Other(_) => "UNKNOWN_ERROR",
        }
    }
}

/// Result type alias for event bus operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            Error::cycle_detected("checkout", "a -> b -> a").status_code(),
            409
        );
        assert_eq!(Error::ShutdownInProgress.status_code(), 503);
        assert_eq!(Error::invalid_input("body", "missing type").status_code(), 400);
    }

    #[test]
    fn test_validation_errors() {
        let mut errors = ValidationErrors::new();
        assert!(errors.is_empty());

        errors.add("event_type", "must not be empty");
        errors.add_with_code("handler", "duplicate name", "DUPLICATE_HANDLER_NAME");

        assert!(!errors.is_empty());
        assert_eq!(errors.errors.len(), 2);
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::transport("connection reset").is_retryable());
        assert!(Error::HandlerTimeout {
            handler: "charge".into(),
            timeout_secs: 5
        }
        .is_retryable());
        assert!(!Error::cycle_detected("checkout", "a -> a").is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::unknown_dependency("checkout", "notify", "ship").error_code(),
            "UNKNOWN_DEPENDENCY"
        );
    }
}
