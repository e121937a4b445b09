//! Subscribers and the composable middleware chain.
//!
//! Registration order is outer-to-inner: `[logging, grouping, retry]`
//! yields a call chain `logging(grouping(retry(handler)))`. A handler
//! raising [`rustpress_core::Error::CriticalSubscriber`] short-circuits
//! the chain; the bus treats that as an overall nack.

use crate::event::{EventType, Message};
use async_trait::async_trait;
use rustpress_core::error::{Error, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Subscriber handler function type.
pub type HandlerFn =
    Arc<dyn Fn(Arc<Message>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// Wraps one subscriber handler, producing another. Middlewares compose
/// outer-to-inner in the order they're registered.
pub trait SubscriberMiddleware: Send + Sync {
    fn wrap(&self, next: HandlerFn) -> HandlerFn;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Logs before and after a subscriber call, including failures.
pub struct LoggingMiddleware {
    pub subscriber_name: String,
}

impl LoggingMiddleware {
    pub fn new(subscriber_name: impl Into<String>) -> Self {
        Self {
            subscriber_name: subscriber_name.into(),
        }
    }
}

impl SubscriberMiddleware for LoggingMiddleware {
    fn wrap(&self, next: HandlerFn) -> HandlerFn {
        let name = self.subscriber_name.clone();
        Arc::new(move |message: Arc<Message>| {
            let next = next.clone();
            let name = name.clone();
            Box::pin(async move {
                tracing::debug!(subscriber = %name, message_id = %message.id, "dispatching to subscriber");
                match next(message.clone()).await {
                    Ok(()) => {
                        tracing::debug!(subscriber = %name, message_id = %message.id, "subscriber succeeded");
                        Ok(())
                    }
                    Err(e) => {
                        tracing::error!(subscriber = %name, message_id = %message.id, error = %e, "subscriber failed");
                        Err(e)
                    }
                }
            })
        })
    }
}

/// Retries the wrapped handler with exponential backoff, short-circuiting
/// immediately on a [`Error::CriticalSubscriber`].
pub struct RetryMiddleware {
    pub max_attempts: u32,
    pub base_secs: f64,
    pub cap_secs: f64,
}

impl Default for RetryMiddleware {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_secs: 1.0,
            cap_secs: 30.0,
        }
    }
}

impl RetryMiddleware {
    pub fn new(max_attempts: u32, base_secs: f64, cap_secs: f64) -> Self {
        Self {
            max_attempts,
            base_secs,
            cap_secs,
        }
    }

    fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let delay = self.cap_secs.min(self.base_secs * 2f64.powi(attempt as i32 - 1));
        std::time::Duration::from_secs_f64(delay.max(0.0))
    }
}

impl SubscriberMiddleware for RetryMiddleware {
    fn wrap(&self, next: HandlerFn) -> HandlerFn {
        let max_attempts = self.max_attempts;
        let delay_fn = {
            let base = self.base_secs;
            let cap = self.cap_secs;
            move |attempt: u32| {
                let delay = cap.min(base * 2f64.powi(attempt as i32 - 1));
                std::time::Duration::from_secs_f64(delay.max(0.0))
            }
        };

        Arc::new(move |message: Arc<Message>| {
            let next = next.clone();
            let delay_fn = delay_fn.clone();
            Box::pin(async move {
                let mut attempt = 1;
                loop {
                    match next(message.clone()).await {
                        Ok(()) => return Ok(()),
                        Err(e @ Error::CriticalSubscriber { .. }) => return Err(e),
                        Err(e) if attempt < max_attempts => {
                            tracing::warn!(
                                message_id = %message.id,
                                attempt,
                                error = %e,
                                "subscriber failed, retrying"
                            );
                            tokio::time::sleep(delay_fn(attempt)).await;
                            attempt += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
            })
        })
    }
}

/// Runs a list of child middlewares in order; any error — critical or
/// not — short-circuits the remaining chain.
pub struct GroupMiddleware {
    pub middlewares: Vec<Arc<dyn SubscriberMiddleware>>,
}

impl GroupMiddleware {
    pub fn new(middlewares: Vec<Arc<dyn SubscriberMiddleware>>) -> Self {
        Self { middlewares }
    }
}

impl SubscriberMiddleware for GroupMiddleware {
    fn wrap(&self, next: HandlerFn) -> HandlerFn {
        compose(&self.middlewares, next)
    }
}

/// Builds the outer-to-inner call chain `m[0](m[1](...m[n](handler)))`.
pub fn compose(middlewares: &[Arc<dyn SubscriberMiddleware>], handler: HandlerFn) -> HandlerFn {
    middlewares
        .iter()
        .rev()
        .fold(handler, |inner, mw| mw.wrap(inner))
}

/// Subscriber configuration.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub event_types: Vec<EventType>,
    pub priority: i32,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            event_types: Vec::new(),
            priority: 0,
        }
    }
}

impl SubscriberConfig {
    pub fn new(event_types: Vec<EventType>) -> Self {
        Self {
            event_types,
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A registered subscriber: a name, routing config, and the fully
/// composed middleware chain wrapping the user's handler.
pub struct Subscriber {
    pub config: SubscriberConfig,
    pub handler: HandlerFn,
    pub name: String,
}

impl Subscriber {
    pub fn new<F, Fut>(name: impl Into<String>, config: SubscriberConfig, handler: F) -> Self
    where
        F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            config,
            handler: Arc::new(move |message| Box::pin(handler(message))),
        }
    }

    pub async fn handle(&self, message: Arc<Message>) -> Result<()> {
        (self.handler)(message).await
    }

    pub fn handles(&self, event_type: &EventType) -> bool {
        self.config.event_types.iter().any(|et| et == event_type)
    }
}

/// Fluent builder composing middlewares outer-to-inner around the final
/// handler.
pub struct SubscriberBuilder {
    name: Option<String>,
    event_types: Vec<EventType>,
    priority: i32,
    middlewares: Vec<Arc<dyn SubscriberMiddleware>>,
}

impl SubscriberBuilder {
    pub fn new() -> Self {
        Self {
            name: None,
            event_types: Vec::new(),
            priority: 0,
            middlewares: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<EventType>) -> Self {
        self.event_types.push(event_type.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn middleware(mut self, middleware: Arc<dyn SubscriberMiddleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn logging(self) -> Self {
        let name = self.name.clone().unwrap_or_else(|| "subscriber".to_string());
        self.middleware(Arc::new(LoggingMiddleware::new(name)))
    }

    pub fn retry(self, max_attempts: u32, base_secs: f64, cap_secs: f64) -> Self {
        self.middleware(Arc::new(RetryMiddleware::new(max_attempts, base_secs, cap_secs)))
    }

    pub fn build<F, Fut>(self, handler: F) -> Subscriber
    where
        F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = self
            .name
            .unwrap_or_else(|| format!("subscriber_{}", self.event_types.len()));

        let base: HandlerFn = Arc::new(move |message| Box::pin(handler(message)));
        let chained = compose(&self.middlewares, base);

        Subscriber {
            name,
            config: SubscriberConfig {
                event_types: self.event_types,
                priority: self.priority,
            },
            handler: chained,
        }
    }
}

impl Default for SubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Async variant of the subscriber interface, for callers that prefer a
/// trait object over a closure.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, message: Arc<Message>) -> Result<()>;

    fn event_types(&self) -> Vec<EventType>;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}
