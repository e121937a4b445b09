//! Handler router: registry of `event_type -> {name -> HandlerSpec}`.
//!
//! Registration is atomic: the new handler is inserted, the whole
//! event type's dependency graph is re-validated, and the insert is
//! rolled back if validation fails.

use crate::backoff::{Backoff, ExponentialBackoff};
use crate::graph::validate_graph;
use crate::retry::{ExponentialRetry, RetryPolicy};
use dashmap::DashMap;
use rustpress_core::config::FailurePolicy;
use rustpress_core::error::{Error, Result};
use rustpress_events::event::{Event, EventType};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Context visible to a handler on one attempt.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub event: Event,
    /// Values returned by already-completed dependencies.
    pub deps_results: HashMap<String, serde_json::Value>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub message_id: String,
    pub metadata: HashMap<String, serde_json::Value>,
    /// Values resolved from the handler's [`DependencyContext`].
    pub injected: HashMap<String, serde_json::Value>,
}

pub type HandlerResult = std::result::Result<serde_json::Value, Error>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
pub type HandlerCallable = Arc<dyn Fn(HandlerContext) -> HandlerFuture + Send + Sync>;

/// A named async resolver supplying one injected dependency value,
/// replacing the source language's `Depends(f)` parameter-default
/// sentinel with an explicit registration-time map.
pub type Resolver = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = serde_json::Value> + Send>> + Send + Sync>;
pub type DependencyContext = HashMap<String, Resolver>;

/// A registered handler and its execution policy.
pub struct HandlerSpec {
    pub name: String,
    pub handler: HandlerCallable,
    pub depends_on: Vec<String>,
    pub timeout_seconds: u64,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub backoff: Arc<dyn Backoff>,
    pub failure_policy: FailurePolicy,
    pub metadata: HashMap<String, serde_json::Value>,
    pub visibility_extension_secs: u64,
    pub dependencies: DependencyContext,
}

/// Builder-style options accepted by [`EventRouter::route`].
pub struct HandlerOptions {
    pub name: Option<String>,
    pub depends_on: Vec<String>,
    pub timeout_seconds: u64,
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub backoff: Option<Arc<dyn Backoff>>,
    pub failure_policy: FailurePolicy,
    pub metadata: HashMap<String, serde_json::Value>,
    pub visibility_extension_secs: u64,
    pub dependencies: DependencyContext,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            name: None,
            depends_on: Vec::new(),
            timeout_seconds: 30,
            retry_policy: None,
            backoff: None,
            failure_policy: FailurePolicy::Abort,
            metadata: HashMap::new(),
            visibility_extension_secs: 30,
            dependencies: HashMap::new(),
        }
    }
}

/// Registry of handlers, keyed by event type then handler name.
pub struct EventRouter {
    handlers: DashMap<EventType, HashMap<String, Arc<HandlerSpec>>>,
    anon_counter: AtomicU64,
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            anon_counter: AtomicU64::new(0),
        }
    }

    /// Register a handler for `event_type`, validating the resulting
    /// dependency graph. On failure the router is left exactly as it was
    /// before the call.
    pub fn route<F, Fut>(
        &self,
        event_type: impl Into<EventType>,
        handler: F,
        options: HandlerOptions,
    ) -> Result<String>
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if options.timeout_seconds > rustpress_core::config::MAX_HANDLER_TIMEOUT_SECONDS {
            return Err(Error::Configuration {
                message: format!(
                    "timeout_seconds ({}) exceeds the maximum of {}",
                    options.timeout_seconds,
                    rustpress_core::config::MAX_HANDLER_TIMEOUT_SECONDS
                ),
            });
        }

        let event_type = event_type.into();
        let name = options
            .name
            .unwrap_or_else(|| format!("handler_{}", self.anon_counter.fetch_add(1, Ordering::SeqCst)));

        let spec = Arc::new(HandlerSpec {
            name: name.clone(),
            handler: Arc::new(move |ctx| Box::pin(handler(ctx))),
            depends_on: options.depends_on,
            timeout_seconds: options.timeout_seconds,
            retry_policy: options
                .retry_policy
                .unwrap_or_else(|| Arc::new(ExponentialRetry::default())),
            backoff: options.backoff.unwrap_or_else(|| Arc::new(ExponentialBackoff::default())),
            failure_policy: options.failure_policy,
            metadata: options.metadata,
            visibility_extension_secs: options.visibility_extension_secs,
            dependencies: options.dependencies,
        });

        let mut entry = self.handlers.entry(event_type.clone()).or_default();

        if entry.contains_key(&name) {
            return Err(Error::duplicate_handler_name(event_type.as_str(), &name));
        }

        entry.insert(name.clone(), spec);

        let edges: HashMap<String, Vec<String>> = entry
            .iter()
            .map(|(n, s)| (n.clone(), s.depends_on.clone()))
            .collect();

        if let Err(e) = validate_graph(event_type.as_str(), &edges) {
            entry.remove(&name);
            return Err(e);
        }

        Ok(name)
    }

    /// Snapshot of the handlers registered for `event_type`.
    pub fn handlers_for(&self, event_type: &EventType) -> HashMap<String, Arc<HandlerSpec>> {
        self.handlers
            .get(event_type)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn event_types(&self) -> Vec<EventType> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}
