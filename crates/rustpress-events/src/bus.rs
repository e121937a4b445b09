//! The event bus facade: owns at most one producer and one consumer and
//! fans matching messages out to in-process subscribers.

use crate::event::{EventType, Message};
use crate::subscriber::Subscriber;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use rustpress_core::error::Result;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Publishes outbound events to whatever transport backs this bus.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn publish(&self, event: crate::event::Event) -> Result<()>;
}

/// Drives a transport's receive loop; `start`/`stop` bracket its
/// lifetime. Implementations live in the transport crate and invoke the
/// dispatcher for each received message.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

/// Event bus configuration.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    pub max_history: usize,
    pub enable_history: bool,
    pub broadcast_capacity: usize,
    pub continue_on_error: bool,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_history: 1000,
            enable_history: false,
            broadcast_capacity: 1024,
            continue_on_error: true,
        }
    }
}

/// Facade coupling an optional producer/consumer pair to an in-process
/// subscriber registry.
pub struct EventBus {
    subscribers: DashMap<EventType, Vec<Arc<Subscriber>>>,
    broadcast_tx: broadcast::Sender<Arc<Message>>,
    history: Option<RwLock<Vec<Arc<Message>>>>,
    config: EventBusConfig,
    producer: Option<Arc<dyn Producer>>,
    consumer: Option<Arc<dyn Consumer>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    pub fn with_config(config: EventBusConfig) -> Self {
        let (broadcast_tx, _) = broadcast::channel(config.broadcast_capacity);
        let history = if config.enable_history {
            Some(RwLock::new(Vec::new()))
        } else {
            None
        };

        Self {
            subscribers: DashMap::new(),
            broadcast_tx,
            history,
            config,
            producer: None,
            consumer: None,
        }
    }

    pub fn with_producer(mut self, producer: Arc<dyn Producer>) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn with_consumer(mut self, consumer: Arc<dyn Consumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    /// Register a subscriber; subscribers are invoked in descending
    /// priority order.
    pub fn subscribe(&self, subscriber: Subscriber) -> &Self {
        let subscriber = Arc::new(subscriber);

        for event_type in &subscriber.config.event_types {
            self.subscribers
                .entry(event_type.clone())
                .or_insert_with(Vec::new)
                .push(subscriber.clone());
        }

        for mut entry in self.subscribers.iter_mut() {
            entry
                .value_mut()
                .sort_by(|a, b| b.config.priority.cmp(&a.config.priority));
        }

        self
    }

    pub fn unsubscribe(&self, name: &str) {
        for mut entry in self.subscribers.iter_mut() {
            entry.value_mut().retain(|s| s.name != name);
        }
    }

    /// Publish an outbound event through the configured producer. Errors
    /// if no producer is configured.
    pub async fn publish(&self, event: crate::event::Event) -> Result<()> {
        match &self.producer {
            Some(producer) => producer.publish(event).await,
            None => Err(rustpress_core::error::Error::NotImplemented {
                operation: "publish: no producer configured".to_string(),
            }),
        }
    }

    /// Fan a received message out to in-process subscribers for its
    /// event type. Used by push transports and tests that want to drive
    /// subscriber-level middleware chains directly, bypassing the
    /// handler-graph dispatcher.
    pub async fn dispatch_to_subscribers(&self, message: Message) -> Result<()> {
        let message = Arc::new(message);

        if let Some(history) = &self.history {
            let mut h = history.write();
            h.push(message.clone());
            if h.len() > self.config.max_history {
                h.remove(0);
            }
        }

        let event_type = message
            .body
            .get("type")
            .and_then(|v| v.as_str())
            .map(EventType::new);

        let subscribers = event_type
            .as_ref()
            .and_then(|et| self.subscribers.get(et).map(|s| s.clone()))
            .unwrap_or_default();

        let mut last_err = None;
        for subscriber in subscribers.iter() {
            if let Err(e) = subscriber.handle(message.clone()).await {
                tracing::error!(
                    subscriber = %subscriber.name,
                    message_id = %message.id,
                    error = %e,
                    "subscriber failed"
                );
                if !self.config.continue_on_error {
                    return Err(e);
                }
                last_err = Some(e);
            }
        }

        let _ = self.broadcast_tx.send(message);

        if let Some(e) = last_err {
            tracing::warn!(error = %e, "some subscribers failed");
        }
        Ok(())
    }

    pub fn subscribe_broadcast(&self) -> broadcast::Receiver<Arc<Message>> {
        self.broadcast_tx.subscribe()
    }

    pub fn history(&self) -> Vec<Arc<Message>> {
        self.history
            .as_ref()
            .map(|h| h.read().clone())
            .unwrap_or_default()
    }

    pub fn clear_history(&self) {
        if let Some(history) = &self.history {
            history.write().clear();
        }
    }

    pub fn subscriber_count(&self, event_type: &EventType) -> usize {
        self.subscribers
            .get(event_type)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn event_types(&self) -> Vec<EventType> {
        self.subscribers.iter().map(|e| e.key().clone()).collect()
    }

    /// Start the configured consumer, if any.
    pub async fn start(&self) -> Result<()> {
        match &self.consumer {
            Some(consumer) => consumer.start().await,
            None => Ok(()),
        }
    }

    /// Stop the configured consumer, if any.
    pub async fn stop(&self) -> Result<()> {
        match &self.consumer {
            Some(consumer) => consumer.stop().await,
            None => Ok(()),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`EventBus`].
pub struct EventBusBuilder {
    config: EventBusConfig,
    subscribers: Vec<Subscriber>,
    producer: Option<Arc<dyn Producer>>,
    consumer: Option<Arc<dyn Consumer>>,
}

impl EventBusBuilder {
    pub fn new() -> Self {
        Self {
            config: EventBusConfig::default(),
            subscribers: Vec::new(),
            producer: None,
            consumer: None,
        }
    }

    pub fn with_history(mut self, max_size: usize) -> Self {
        self.config.enable_history = true;
        self.config.max_history = max_size;
        self
    }

    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.config.broadcast_capacity = capacity;
        self
    }

    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.config.continue_on_error = continue_on_error;
        self
    }

    pub fn subscriber(mut self, subscriber: Subscriber) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    pub fn producer(mut self, producer: Arc<dyn Producer>) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn consumer(mut self, consumer: Arc<dyn Consumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn build(self) -> EventBus {
        let mut bus = EventBus::with_config(self.config);
        bus.producer = self.producer;
        bus.consumer = self.consumer;
        for subscriber in self.subscribers {
            bus.subscribe(subscriber);
        }
        bus
    }
}

impl Default for EventBusBuilder {
    fn default() -> Self {
        Self::new()
    }
}
